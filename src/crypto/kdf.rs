use std::fmt;

use getrandom::fill;
use serde::Deserialize;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::aes_kdf::{self, AesKdfParams};
use super::argon2_kdf::{self, Argon2Params, Argon2Variant, Argon2Version};
use super::{
    AES_KDF_DEFAULT_ROUNDS, AES_KDF_SALT_LEN, ARGON2_DEFAULT_ITERATIONS,
    ARGON2_DEFAULT_MEMORY_KIB, ARGON2_DEFAULT_PARALLELISM, ARGON2_DEFAULT_SALT_LEN, DerivedKey,
};
use crate::config::Limits;
use crate::error::{DerivationError, Field, KdfError, ValidationError};

/// KDBX identifier of Argon2d.
pub const ARGON2D_UUID: Uuid = Uuid::from_u128(0xef636ddf_8c29_444b_91f7_a9a403e30a0c);
/// KDBX identifier of Argon2id.
pub const ARGON2ID_UUID: Uuid = Uuid::from_u128(0x9e298b19_56db_4773_b23d_fc3ec6f0a1e6);
/// KDBX 3.x identifier of AES-KDF.
pub const AES_KDF_KDBX3_UUID: Uuid = Uuid::from_u128(0xc9d9f39a_628a_4460_bf74_0d08c18a4fea);
/// KDBX 4 identifier of AES-KDF.
pub const AES_KDF_KDBX4_UUID: Uuid = Uuid::from_u128(0x7c02bb82_79a7_4ac0_927d_114a00648238);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KdfAlgorithm {
    /// Argon2.
    #[default]
    MemoryHard,
    /// AES-KDF, kept for databases created before Argon2 was adopted.
    LegacyIterative,
}

impl fmt::Display for KdfAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KdfAlgorithm::MemoryHard => f.write_str("argon2"),
            KdfAlgorithm::LegacyIterative => f.write_str("aes-kdf"),
        }
    }
}

/// KDF fields as extracted from a database header, not yet checked.
///
/// Absent and empty are both representable; which ones are acceptable is
/// decided by the algorithm's validator. Byte fields are wiped on drop.
#[derive(Clone, Default, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(deny_unknown_fields)]
pub struct RawKdfParams {
    #[serde(default)]
    #[zeroize(skip)]
    pub algorithm: KdfAlgorithm,
    pub salt: Option<Vec<u8>>,
    pub parallelism: Option<u32>,
    pub memory_kib: Option<u64>,
    pub iterations: Option<u64>,
    pub secret_key: Option<Vec<u8>>,
    pub associated_data: Option<Vec<u8>>,
    pub version: Option<u32>,
    pub variant: Option<u32>,
}

impl RawKdfParams {
    pub fn new(algorithm: KdfAlgorithm) -> Self {
        Self {
            algorithm,
            salt: None,
            parallelism: None,
            memory_kib: None,
            iterations: None,
            secret_key: None,
            associated_data: None,
            version: None,
            variant: None,
        }
    }

    /// Starts a parameter set for the algorithm a KDBX header names by UUID.
    ///
    /// The Argon2 UUIDs also fix the variant.
    pub fn for_kdbx_uuid(uuid: &Uuid) -> Result<Self, ValidationError> {
        if *uuid == ARGON2D_UUID {
            Ok(Self::new(KdfAlgorithm::MemoryHard).with_variant(Argon2Variant::Argon2d as u32))
        } else if *uuid == ARGON2ID_UUID {
            Ok(Self::new(KdfAlgorithm::MemoryHard).with_variant(Argon2Variant::Argon2id as u32))
        } else if *uuid == AES_KDF_KDBX3_UUID || *uuid == AES_KDF_KDBX4_UUID {
            Ok(Self::new(KdfAlgorithm::LegacyIterative))
        } else {
            Err(ValidationError::unsupported(Field::Algorithm, uuid))
        }
    }

    /// Default cost parameters with a fresh random salt, for re-keying.
    pub fn generate(algorithm: KdfAlgorithm) -> Result<Self, KdfError> {
        let raw = match algorithm {
            KdfAlgorithm::MemoryHard => Self::new(algorithm)
                .with_salt(random_salt(ARGON2_DEFAULT_SALT_LEN)?)
                .with_parallelism(ARGON2_DEFAULT_PARALLELISM)
                .with_memory_kib(ARGON2_DEFAULT_MEMORY_KIB)
                .with_iterations(ARGON2_DEFAULT_ITERATIONS)
                .with_version(Argon2Version::V0x13 as u32)
                .with_variant(Argon2Variant::Argon2id as u32),
            KdfAlgorithm::LegacyIterative => Self::new(algorithm)
                .with_salt(random_salt(AES_KDF_SALT_LEN)?)
                .with_iterations(AES_KDF_DEFAULT_ROUNDS),
        };
        Ok(raw)
    }

    pub fn with_salt(mut self, salt: impl Into<Vec<u8>>) -> Self {
        self.salt = Some(salt.into());
        self
    }

    pub fn with_parallelism(mut self, parallelism: u32) -> Self {
        self.parallelism = Some(parallelism);
        self
    }

    pub fn with_memory_kib(mut self, memory_kib: u64) -> Self {
        self.memory_kib = Some(memory_kib);
        self
    }

    pub fn with_iterations(mut self, iterations: u64) -> Self {
        self.iterations = Some(iterations);
        self
    }

    pub fn with_secret_key(mut self, secret_key: impl Into<Vec<u8>>) -> Self {
        self.secret_key = Some(secret_key.into());
        self
    }

    pub fn with_associated_data(mut self, associated_data: impl Into<Vec<u8>>) -> Self {
        self.associated_data = Some(associated_data.into());
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_variant(mut self, variant: u32) -> Self {
        self.variant = Some(variant);
        self
    }

    /// Salt if present and non-empty.
    pub(crate) fn required_salt(&self) -> Result<&[u8], ValidationError> {
        match self.salt.as_deref() {
            Some(salt) if !salt.is_empty() => Ok(salt),
            _ => Err(ValidationError::MissingField(Field::Salt)),
        }
    }

    /// Iteration count if present and at least one.
    pub(crate) fn required_iterations(&self) -> Result<u64, ValidationError> {
        match self.iterations {
            None => Err(ValidationError::MissingField(Field::Iterations)),
            Some(0) => Err(ValidationError::out_of_range(
                Field::Iterations,
                "must be at least 1",
            )),
            Some(n) => Ok(n),
        }
    }
}

impl fmt::Debug for RawKdfParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawKdfParams")
            .field("algorithm", &self.algorithm)
            .field("salt_len", &self.salt.as_ref().map(Vec::len))
            .field("parallelism", &self.parallelism)
            .field("memory_kib", &self.memory_kib)
            .field("iterations", &self.iterations)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "[REDACTED]"))
            .field("associated_data_len", &self.associated_data.as_ref().map(Vec::len))
            .field("version", &self.version)
            .field("variant", &self.variant)
            .finish()
    }
}

fn random_salt(len: usize) -> Result<Vec<u8>, KdfError> {
    let mut salt = vec![0u8; len];
    fill(&mut salt).map_err(|_| KdfError::Internal("OS random generator unavailable".into()))?;
    Ok(salt)
}

/// A validated, immutable parameter set.
///
/// Only [`KdfParameters::validate`] builds one, so every value reaching a
/// provider is already known to be well-formed.
#[derive(Debug, Clone)]
pub enum KdfParameters {
    MemoryHard(Argon2Params),
    LegacyIterative(AesKdfParams),
}

impl KdfParameters {
    pub fn validate(raw: &RawKdfParams, limits: &Limits) -> Result<Self, ValidationError> {
        match raw.algorithm {
            KdfAlgorithm::MemoryHard => argon2_kdf::validate(raw, limits).map(Self::MemoryHard),
            KdfAlgorithm::LegacyIterative => aes_kdf::validate(raw).map(Self::LegacyIterative),
        }
    }

    pub fn algorithm(&self) -> KdfAlgorithm {
        match self {
            KdfParameters::MemoryHard(_) => KdfAlgorithm::MemoryHard,
            KdfParameters::LegacyIterative(_) => KdfAlgorithm::LegacyIterative,
        }
    }

    /// Working memory the derivation will reserve, in KiB.
    pub fn memory_kib(&self) -> u64 {
        match self {
            KdfParameters::MemoryHard(p) => u64::from(p.memory_kib()),
            KdfParameters::LegacyIterative(_) => 0,
        }
    }

    pub fn iterations(&self) -> u64 {
        match self {
            KdfParameters::MemoryHard(p) => u64::from(p.iterations()),
            KdfParameters::LegacyIterative(p) => p.rounds(),
        }
    }
}

/// One KDF algorithm.
///
/// `derive` only ever sees parameters that passed the algorithm's validator.
/// Reached through the engine only, which owns initialization and the
/// concurrency bound.
pub(crate) trait KdfProvider {
    type Params;

    fn derive(&self, password: &[u8], params: &Self::Params) -> Result<DerivedKey, DerivationError>;
}
