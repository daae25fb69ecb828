//! Key derivation primitives.
//!
//! Parameter validation, the two KDF providers and composite key assembly.
//!
//! The providers are reached through [`DerivationEngine`](crate::DerivationEngine)
//! only, which owns initialization and the concurrency bound:
//!
//! ```compile_fail
//! use masterkdf::crypto::{Argon2Kdf, KdfProvider};
//! ```

pub(crate) mod aes_kdf;
pub(crate) mod argon2_kdf;
mod composite;
pub(crate) mod kdf;
mod keys;

pub(crate) use aes_kdf::AesKdf;
pub use aes_kdf::AesKdfParams;
pub(crate) use argon2_kdf::Argon2Kdf;
pub use argon2_kdf::{Argon2Params, Argon2Variant, Argon2Version};
pub use composite::{build_master_key, keyfile_component};
pub(crate) use kdf::KdfProvider;
pub use kdf::{
    AES_KDF_KDBX3_UUID, AES_KDF_KDBX4_UUID, ARGON2D_UUID, ARGON2ID_UUID, KdfAlgorithm,
    KdfParameters, RawKdfParams,
};
pub use keys::{DerivedKey, MasterKey};

/// Length of every derived and master key (32 bytes / 256 bits).
pub const KEY_LEN: usize = 32;

/// Shortest salt Argon2 accepts.
pub const ARGON2_MIN_SALT_LEN: usize = 8;
/// Hard lane limit of Argon2 (2^24 - 1).
pub const ARGON2_MAX_LANES: u32 = 0x00FF_FFFF;
/// Memory per lane required by Argon2, in KiB.
pub const ARGON2_MIN_KIB_PER_LANE: u64 = 8;

/// AES-KDF keys AES-256 with the salt, so it is exactly one key long.
pub const AES_KDF_SALT_LEN: usize = 32;

pub const DEFAULT_MAX_PARALLELISM: u32 = 16;
/// 4 GiB.
pub const DEFAULT_MAX_MEMORY_KIB: u32 = 4 * 1024 * 1024;

/// Salt length used for freshly generated Argon2 parameters.
pub const ARGON2_DEFAULT_SALT_LEN: usize = 32;
/// 64 MiB.
pub const ARGON2_DEFAULT_MEMORY_KIB: u64 = 64 * 1024;
pub const ARGON2_DEFAULT_ITERATIONS: u64 = 3;
pub const ARGON2_DEFAULT_PARALLELISM: u32 = 2;
pub const AES_KDF_DEFAULT_ROUNDS: u64 = 60_000;
