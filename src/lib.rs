//! Master-key derivation for encrypted password databases.
//!
//! A password (plus optional keyfile contents) and the KDF fields of a
//! database header go in; a 32-byte master key for the cipher layer comes
//! out.
//!
//! ```text
//! RawKdfParams --validate--> KdfParameters --derive--> DerivedKey --compose--> MasterKey
//!                                              |
//!                                   Argon2 (d / id, v0x10 / v0x13)
//!                                   AES-KDF (legacy)
//! ```
//!
//! ```no_run
//! use masterkdf::{DerivationEngine, KdfAlgorithm, RawKdfParams};
//!
//! let engine = DerivationEngine::default();
//! engine.init()?;
//!
//! let raw = RawKdfParams::generate(KdfAlgorithm::MemoryHard)?;
//! let key = engine.unlock(b"correct horse", &raw, None)?;
//! assert_eq!(key.as_bytes().len(), 32);
//! # Ok::<(), masterkdf::KdfError>(())
//! ```

mod config;
pub mod crypto;
mod engine;
mod error;

pub use crate::config::{EngineConfig, Limits};
pub use crate::crypto::{
    DerivedKey, KEY_LEN, KdfAlgorithm, KdfParameters, MasterKey, RawKdfParams,
    build_master_key, keyfile_component,
};
pub use crate::engine::DerivationEngine;
pub use crate::error::{DerivationError, ErrorKind, Field, KdfError, ValidationError};
