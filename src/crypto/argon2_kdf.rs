//! Argon2 (RFC 9106) provider.
//!
//! Working memory is reserved up front so that running out of memory is a
//! reportable error, and it is wiped before release on every path.
//!
//! `argon2` holds at most [`AssociatedData::MAX_LEN`] bytes of associated
//! data inline. Longer associated data is hashed through `rust-argon2`
//! instead; both produce the reference output.

use std::fmt;

use argon2::{Algorithm, Argon2, AssociatedData, Block, ParamsBuilder, Version};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::kdf::{KdfProvider, RawKdfParams};
use super::{
    ARGON2_MIN_KIB_PER_LANE, ARGON2_MIN_SALT_LEN, DerivedKey, KEY_LEN,
};
use crate::config::Limits;
use crate::error::{DerivationError, Field, ValidationError};

/// Argon2 revision, as stored in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Argon2Version {
    V0x10 = 0x10,
    /// Latest revision.
    V0x13 = 0x13,
}

impl TryFrom<u32> for Argon2Version {
    type Error = ValidationError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0x10 => Ok(Argon2Version::V0x10),
            0x13 => Ok(Argon2Version::V0x13),
            other => Err(ValidationError::unsupported(
                Field::Version,
                format!("{other:#x}"),
            )),
        }
    }
}

impl From<Argon2Version> for Version {
    fn from(version: Argon2Version) -> Self {
        match version {
            Argon2Version::V0x10 => Version::V0x10,
            Argon2Version::V0x13 => Version::V0x13,
        }
    }
}

impl From<Argon2Version> for argon2_ref::Version {
    fn from(version: Argon2Version) -> Self {
        match version {
            Argon2Version::V0x10 => argon2_ref::Version::Version10,
            Argon2Version::V0x13 => argon2_ref::Version::Version13,
        }
    }
}

/// Argon2 addressing mode, using the reference type numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Argon2Variant {
    /// Data-dependent addressing.
    Argon2d = 0,
    /// Hybrid addressing.
    Argon2id = 2,
}

impl TryFrom<u32> for Argon2Variant {
    type Error = ValidationError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Argon2Variant::Argon2d),
            2 => Ok(Argon2Variant::Argon2id),
            other => Err(ValidationError::unsupported(Field::Variant, other)),
        }
    }
}

impl From<Argon2Variant> for Algorithm {
    fn from(variant: Argon2Variant) -> Self {
        match variant {
            Argon2Variant::Argon2d => Algorithm::Argon2d,
            Argon2Variant::Argon2id => Algorithm::Argon2id,
        }
    }
}

impl From<Argon2Variant> for argon2_ref::Variant {
    fn from(variant: Argon2Variant) -> Self {
        match variant {
            Argon2Variant::Argon2d => argon2_ref::Variant::Argon2d,
            Argon2Variant::Argon2id => argon2_ref::Variant::Argon2id,
        }
    }
}

/// Validated Argon2 parameters. Byte fields are wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Argon2Params {
    salt: Vec<u8>,
    parallelism: u32,
    memory_kib: u32,
    iterations: u32,
    secret_key: Vec<u8>,
    associated_data: Vec<u8>,
    #[zeroize(skip)]
    version: Argon2Version,
    #[zeroize(skip)]
    variant: Argon2Variant,
}

impl Argon2Params {
    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    pub fn parallelism(&self) -> u32 {
        self.parallelism
    }

    pub fn memory_kib(&self) -> u32 {
        self.memory_kib
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn secret_key(&self) -> &[u8] {
        &self.secret_key
    }

    pub fn associated_data(&self) -> &[u8] {
        &self.associated_data
    }

    pub fn version(&self) -> Argon2Version {
        self.version
    }

    pub fn variant(&self) -> Argon2Variant {
        self.variant
    }
}

impl fmt::Debug for Argon2Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Argon2Params")
            .field("salt_len", &self.salt.len())
            .field("parallelism", &self.parallelism)
            .field("memory_kib", &self.memory_kib)
            .field("iterations", &self.iterations)
            .field("secret_key", &"[REDACTED]")
            .field("associated_data_len", &self.associated_data.len())
            .field("version", &self.version)
            .field("variant", &self.variant)
            .finish()
    }
}

pub(crate) fn validate(raw: &RawKdfParams, limits: &Limits) -> Result<Argon2Params, ValidationError> {
    // Revision first: an unknown revision is UnsupportedVersion whatever its costs.
    let variant = Argon2Variant::try_from(
        raw.variant
            .ok_or(ValidationError::MissingField(Field::Variant))?,
    )?;
    let version = Argon2Version::try_from(
        raw.version
            .ok_or(ValidationError::MissingField(Field::Version))?,
    )?;

    let salt = raw.required_salt()?;
    if salt.len() < ARGON2_MIN_SALT_LEN {
        return Err(ValidationError::out_of_range(
            Field::Salt,
            format!("must be at least {ARGON2_MIN_SALT_LEN} bytes, got {}", salt.len()),
        ));
    }
    if u32::try_from(salt.len()).is_err() {
        return Err(ValidationError::out_of_range(Field::Salt, "longer than 2^32 - 1 bytes"));
    }

    let iterations = u32::try_from(raw.required_iterations()?).map_err(|_| {
        ValidationError::out_of_range(Field::Iterations, "must not exceed 2^32 - 1")
    })?;

    let parallelism = raw
        .parallelism
        .ok_or(ValidationError::MissingField(Field::Parallelism))?;
    let ceiling = limits.parallelism_ceiling();
    if parallelism == 0 || parallelism > ceiling {
        return Err(ValidationError::out_of_range(
            Field::Parallelism,
            format!("must be between 1 and {ceiling}, got {parallelism}"),
        ));
    }

    let memory = raw
        .memory_kib
        .ok_or(ValidationError::MissingField(Field::MemoryCost))?;
    let floor = ARGON2_MIN_KIB_PER_LANE * u64::from(parallelism);
    if memory < floor {
        return Err(ValidationError::out_of_range(
            Field::MemoryCost,
            format!("{memory} KiB is below 8 x parallelism ({floor} KiB)"),
        ));
    }
    if memory > u64::from(limits.max_memory_kib) {
        return Err(ValidationError::out_of_range(
            Field::MemoryCost,
            format!("{memory} KiB exceeds the {} KiB limit", limits.max_memory_kib),
        ));
    }
    let memory_kib = u32::try_from(memory)
        .map_err(|_| ValidationError::out_of_range(Field::MemoryCost, "must fit in 32 bits"))?;

    let secret_key = raw.secret_key.as_deref().unwrap_or_default();
    if u32::try_from(secret_key.len()).is_err() {
        return Err(ValidationError::out_of_range(
            Field::SecretKey,
            "longer than 2^32 - 1 bytes",
        ));
    }

    let associated_data = raw.associated_data.as_deref().unwrap_or_default();
    if u32::try_from(associated_data.len()).is_err() {
        return Err(ValidationError::out_of_range(
            Field::AssociatedData,
            "longer than 2^32 - 1 bytes",
        ));
    }

    Ok(Argon2Params {
        salt: salt.to_vec(),
        parallelism,
        memory_kib,
        iterations,
        secret_key: secret_key.to_vec(),
        associated_data: associated_data.to_vec(),
        version,
        variant,
    })
}

/// Memory-hard provider backed by the `argon2` crate.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Argon2Kdf;

impl KdfProvider for Argon2Kdf {
    type Params = Argon2Params;

    fn derive(&self, password: &[u8], params: &Argon2Params) -> Result<DerivedKey, DerivationError> {
        if params.associated_data.len() > AssociatedData::MAX_LEN {
            return derive_with_long_ad(password, params);
        }

        let mut builder = ParamsBuilder::new();
        builder
            .m_cost(params.memory_kib)
            .t_cost(params.iterations)
            .p_cost(params.parallelism)
            .output_len(KEY_LEN);
        if !params.associated_data.is_empty() {
            builder.data(AssociatedData::new(&params.associated_data).map_err(backend_error)?);
        }
        let backend_params = builder.build().map_err(backend_error)?;
        let blocks = block_count(params.memory_kib, params.parallelism);

        let context = if params.secret_key.is_empty() {
            Argon2::new(params.variant.into(), params.version.into(), backend_params)
        } else {
            Argon2::new_with_secret(
                &params.secret_key,
                params.variant.into(),
                params.version.into(),
                backend_params,
            )
            .map_err(backend_error)?
        };

        let mut memory = WorkingMemory::reserve(blocks)?;
        let mut out = Zeroizing::new([0u8; KEY_LEN]);
        context
            .hash_password_into_with_memory(password, &params.salt, &mut out[..], memory.blocks_mut())
            .map_err(backend_error)?;

        Ok(DerivedKey::from_bytes(*out))
    }
}

/// Same derivation through `rust-argon2`, which takes associated data of any
/// length by reference.
fn derive_with_long_ad(
    password: &[u8],
    params: &Argon2Params,
) -> Result<DerivedKey, DerivationError> {
    // rust-argon2 allocates infallibly; fail here instead of aborting there.
    let blocks = block_count(params.memory_kib, params.parallelism);
    Vec::<Block>::new()
        .try_reserve_exact(blocks)
        .map_err(|_| DerivationError::AllocationFailure {
            requested_kib: blocks as u64,
        })?;

    let config = argon2_ref::Config {
        ad: &params.associated_data,
        secret: &params.secret_key,
        mem_cost: params.memory_kib,
        time_cost: params.iterations,
        lanes: params.parallelism,
        hash_length: KEY_LEN as u32,
        variant: params.variant.into(),
        version: params.version.into(),
        ..argon2_ref::Config::default()
    };
    let hash = Zeroizing::new(
        argon2_ref::hash_raw(password, &params.salt, &config)
            .map_err(|e| DerivationError::InternalError(format!("argon2 backend: {e}")))?,
    );
    let bytes: [u8; KEY_LEN] = hash.as_slice().try_into().map_err(|_| {
        DerivationError::InternalError(format!("argon2 backend returned {} bytes", hash.len()))
    })?;
    Ok(DerivedKey::from_bytes(bytes))
}

/// Blocks Argon2 fills: memory rounded down to a multiple of 4 x lanes.
fn block_count(memory_kib: u32, parallelism: u32) -> usize {
    let sync_span = 4 * parallelism as usize;
    (memory_kib as usize / sync_span) * sync_span
}

fn backend_error(err: argon2::Error) -> DerivationError {
    DerivationError::InternalError(format!("argon2 backend: {err}"))
}

/// Argon2 block matrix, wiped on drop.
struct WorkingMemory {
    blocks: Vec<Block>,
}

impl WorkingMemory {
    fn reserve(block_count: usize) -> Result<Self, DerivationError> {
        // One block is one KiB.
        let failure = || DerivationError::AllocationFailure {
            requested_kib: block_count as u64,
        };
        let mut blocks = Vec::new();
        blocks.try_reserve_exact(block_count).map_err(|_| failure())?;
        blocks.resize(block_count, Block::default());
        Ok(Self { blocks })
    }

    fn blocks_mut(&mut self) -> &mut [Block] {
        &mut self.blocks
    }
}

impl Drop for WorkingMemory {
    fn drop(&mut self) {
        self.blocks.zeroize();
    }
}

/// Tag of the RFC 9106 section 5.3 Argon2id test vector.
const RFC9106_ARGON2ID_TAG: [u8; KEY_LEN] = [
    0x0d, 0x64, 0x0d, 0xf5, 0x8d, 0x78, 0x76, 0x6c, 0x08, 0xc0, 0x37, 0xa3, 0x4a, 0x8b, 0x53, 0xc9,
    0xd0, 0x1e, 0xf0, 0x45, 0x2d, 0x75, 0xb6, 0x5e, 0xb5, 0x25, 0x20, 0xe9, 0x6b, 0x01, 0xe6, 0x59,
];

/// Known-answer check against RFC 9106, on both backends.
pub(crate) fn self_test() -> Result<(), DerivationError> {
    let params = Argon2Params {
        salt: vec![0x02; 16],
        parallelism: 4,
        memory_kib: 32,
        iterations: 3,
        secret_key: vec![0x03; 8],
        associated_data: vec![0x04; 12],
        version: Argon2Version::V0x13,
        variant: Argon2Variant::Argon2id,
    };
    let inline = Argon2Kdf.derive(&[0x01; 32], &params)?;
    let by_reference = derive_with_long_ad(&[0x01; 32], &params)?;
    for key in [&inline, &by_reference] {
        if key.as_bytes() != &RFC9106_ARGON2ID_TAG {
            return Err(DerivationError::InternalError(
                "argon2 self-test produced an unexpected tag".into(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KdfAlgorithm;

    fn small_raw() -> RawKdfParams {
        RawKdfParams::new(KdfAlgorithm::MemoryHard)
            .with_salt(vec![7u8; 16])
            .with_parallelism(1)
            .with_memory_kib(64)
            .with_iterations(1)
            .with_version(0x13)
            .with_variant(2)
    }

    fn derive(raw: &RawKdfParams, password: &[u8]) -> DerivedKey {
        let params = validate(raw, &Limits::default()).unwrap();
        Argon2Kdf.derive(password, &params).unwrap()
    }

    #[test]
    fn self_test_matches_rfc_vector() {
        self_test().unwrap();
    }

    #[test]
    fn argon2d_matches_rfc_vector() {
        let raw = RawKdfParams::new(KdfAlgorithm::MemoryHard)
            .with_salt(vec![0x02; 16])
            .with_parallelism(4)
            .with_memory_kib(32)
            .with_iterations(3)
            .with_secret_key(vec![0x03; 8])
            .with_associated_data(vec![0x04; 12])
            .with_version(0x13)
            .with_variant(0);
        let key = derive(&raw, &[0x01; 32]);
        assert_eq!(
            hex::encode(key.as_bytes()),
            "512b391b6f1162975371d30919734294f868e3be3984f3c1a13a4db9fabe4acb"
        );
    }

    #[test]
    fn derivation_is_deterministic() {
        let raw = small_raw();
        assert_eq!(derive(&raw, b"password"), derive(&raw, b"password"));
    }

    #[test]
    fn empty_password_is_accepted() {
        let key = derive(&small_raw(), b"");
        assert_eq!(key.as_bytes().len(), KEY_LEN);
    }

    #[test]
    fn every_field_changes_the_output() {
        let base = derive(&small_raw(), b"pw");
        let variations = [
            small_raw().with_salt(vec![8u8; 16]),
            small_raw().with_iterations(2),
            small_raw().with_memory_kib(72),
            small_raw().with_parallelism(2),
            small_raw().with_secret_key(vec![1u8]),
            small_raw().with_associated_data(vec![1u8]),
            small_raw().with_version(0x10),
            small_raw().with_variant(0),
        ];
        for raw in &variations {
            assert_ne!(derive(raw, b"pw"), base, "{raw:?} did not change the key");
        }
        assert_ne!(derive(&small_raw(), b"pw2"), base);
    }

    #[test]
    fn memory_below_lane_floor_names_memory_cost() {
        let raw = small_raw().with_parallelism(2).with_memory_kib(4);
        match validate(&raw, &Limits::default()) {
            Err(ValidationError::OutOfRange { field, .. }) => assert_eq!(field, Field::MemoryCost),
            other => panic!("expected OutOfRange, got: {other:?}"),
        }
    }

    #[test]
    fn future_version_is_unsupported() {
        let raw = small_raw().with_version(0x14);
        assert!(matches!(
            validate(&raw, &Limits::default()),
            Err(ValidationError::UnsupportedVersion {
                field: Field::Version,
                ..
            })
        ));
    }

    #[test]
    fn version_is_checked_before_costs() {
        let raw = small_raw().with_version(0x20).with_memory_kib(1);
        assert!(matches!(
            validate(&raw, &Limits::default()),
            Err(ValidationError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn argon2i_is_unsupported() {
        let raw = small_raw().with_variant(1);
        assert!(matches!(
            validate(&raw, &Limits::default()),
            Err(ValidationError::UnsupportedVersion {
                field: Field::Variant,
                ..
            })
        ));
    }

    #[test]
    fn short_salt_is_out_of_range() {
        let raw = small_raw().with_salt(vec![1u8; 4]);
        assert_eq!(
            validate(&raw, &Limits::default()).unwrap_err().field(),
            Field::Salt
        );
    }

    #[test]
    fn parallelism_above_limit_is_rejected() {
        let limits = Limits {
            max_parallelism: 4,
            ..Limits::default()
        };
        let raw = small_raw().with_parallelism(5).with_memory_kib(1024);
        assert_eq!(validate(&raw, &limits).unwrap_err().field(), Field::Parallelism);
    }

    #[test]
    fn zero_parallelism_is_rejected() {
        let raw = small_raw().with_parallelism(0);
        assert_eq!(
            validate(&raw, &Limits::default()).unwrap_err().field(),
            Field::Parallelism
        );
    }

    #[test]
    fn memory_above_limit_is_rejected() {
        let limits = Limits {
            max_memory_kib: 1024,
            ..Limits::default()
        };
        let raw = small_raw().with_memory_kib(2048);
        assert_eq!(validate(&raw, &limits).unwrap_err().field(), Field::MemoryCost);
    }

    #[test]
    fn iterations_must_fit_in_u32() {
        let raw = small_raw().with_iterations(u64::from(u32::MAX) + 1);
        assert_eq!(
            validate(&raw, &Limits::default()).unwrap_err().field(),
            Field::Iterations
        );
    }

    #[test]
    fn long_associated_data_derives() {
        let long = small_raw().with_associated_data(vec![4u8; 64]);
        let key = derive(&long, b"pw");
        assert_eq!(key, derive(&long, b"pw"));
        assert_ne!(key, derive(&small_raw().with_associated_data(vec![4u8; 63]), b"pw"));
        assert_ne!(
            key,
            derive(&small_raw().with_associated_data(vec![4u8; AssociatedData::MAX_LEN]), b"pw")
        );
    }

    #[test]
    fn associated_data_just_past_inline_limit_is_accepted() {
        let raw = small_raw().with_associated_data(vec![4u8; AssociatedData::MAX_LEN + 1]);
        assert!(validate(&raw, &Limits::default()).is_ok());
    }

    #[test]
    fn both_backends_agree() {
        for variant in [0, 2] {
            for ad_len in [0, 12, AssociatedData::MAX_LEN] {
                let raw = small_raw()
                    .with_parallelism(2)
                    .with_memory_kib(70)
                    .with_iterations(2)
                    .with_secret_key(vec![3u8; 8])
                    .with_associated_data(vec![4u8; ad_len])
                    .with_variant(variant);
                let params = validate(&raw, &Limits::default()).unwrap();
                assert_eq!(
                    Argon2Kdf.derive(b"pw", &params).unwrap(),
                    derive_with_long_ad(b"pw", &params).unwrap(),
                    "variant {variant}, {ad_len} bytes of associated data"
                );
            }
        }
    }

    #[test]
    fn long_ad_backend_matches_rfc_vector() {
        let raw = RawKdfParams::new(KdfAlgorithm::MemoryHard)
            .with_salt(vec![0x02; 16])
            .with_parallelism(4)
            .with_memory_kib(32)
            .with_iterations(3)
            .with_secret_key(vec![0x03; 8])
            .with_associated_data(vec![0x04; 12])
            .with_version(0x13)
            .with_variant(2);
        let params = validate(&raw, &Limits::default()).unwrap();
        let key = derive_with_long_ad(&[0x01; 32], &params).unwrap();
        assert_eq!(key.as_bytes(), &RFC9106_ARGON2ID_TAG);
    }

    #[test]
    fn missing_fields_are_reported() {
        let raw = RawKdfParams::new(KdfAlgorithm::MemoryHard)
            .with_version(0x13)
            .with_variant(2);
        assert_eq!(
            validate(&raw, &Limits::default()).unwrap_err(),
            ValidationError::MissingField(Field::Salt)
        );

        let raw = RawKdfParams::new(KdfAlgorithm::MemoryHard).with_variant(2);
        assert_eq!(
            validate(&raw, &Limits::default()).unwrap_err(),
            ValidationError::MissingField(Field::Version)
        );
    }

    #[test]
    fn block_count_rounds_to_sync_points() {
        assert_eq!(block_count(72, 1), 72);
        assert_eq!(block_count(65, 1), 64);
        assert_eq!(block_count(70, 2), 64);
        assert_eq!(block_count(65536, 2), 65536);
    }

    #[test]
    fn unreservable_memory_is_an_allocation_failure() {
        assert!(matches!(
            WorkingMemory::reserve(usize::MAX),
            Err(DerivationError::AllocationFailure { .. })
        ));
    }
}
