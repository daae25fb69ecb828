//! AES-KDF, the iterative transform used by databases predating Argon2.
//!
//! seed = SHA-256(password); each 16-byte half of the seed is encrypted
//! `rounds` times with AES-256-ECB keyed by the salt; the key is
//! SHA-256(transformed seed).

use std::fmt;

use aes::Aes256;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use sha2::{Digest, Sha256};
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::kdf::{KdfProvider, RawKdfParams};
use super::{AES_KDF_SALT_LEN, DerivedKey, KEY_LEN};
use crate::error::{DerivationError, Field, ValidationError};

/// Validated AES-KDF parameters. The salt is wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AesKdfParams {
    salt: [u8; AES_KDF_SALT_LEN],
    rounds: u64,
}

impl AesKdfParams {
    pub fn salt(&self) -> &[u8; AES_KDF_SALT_LEN] {
        &self.salt
    }

    pub fn rounds(&self) -> u64 {
        self.rounds
    }
}

impl fmt::Debug for AesKdfParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AesKdfParams")
            .field("salt", &"[REDACTED]")
            .field("rounds", &self.rounds)
            .finish()
    }
}

pub(crate) fn validate(raw: &RawKdfParams) -> Result<AesKdfParams, ValidationError> {
    let salt = raw.required_salt()?;
    let salt: [u8; AES_KDF_SALT_LEN] = salt.try_into().map_err(|_| {
        ValidationError::out_of_range(
            Field::Salt,
            format!("must be exactly {AES_KDF_SALT_LEN} bytes, got {}", salt.len()),
        )
    })?;
    let rounds = raw.required_iterations()?;

    if raw.parallelism.is_some()
        || raw.memory_kib.is_some()
        || raw.variant.is_some()
        || raw.secret_key.as_ref().is_some_and(|k| !k.is_empty())
        || raw.associated_data.as_ref().is_some_and(|d| !d.is_empty())
    {
        debug!("ignoring memory-hard fields supplied with AES-KDF parameters");
    }

    Ok(AesKdfParams { salt, rounds })
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct AesKdf;

impl KdfProvider for AesKdf {
    type Params = AesKdfParams;

    fn derive(&self, password: &[u8], params: &AesKdfParams) -> Result<DerivedKey, DerivationError> {
        let mut seed: Zeroizing<[u8; KEY_LEN]> = Zeroizing::new(Sha256::digest(password).into());
        transform(&mut seed, &params.salt, params.rounds);
        let key: Zeroizing<[u8; KEY_LEN]> = Zeroizing::new(Sha256::digest(&seed[..]).into());
        Ok(DerivedKey::from_bytes(*key))
    }
}

/// Encrypts both halves of `data` in place, `rounds` times each.
fn transform(data: &mut [u8; KEY_LEN], key: &[u8; AES_KDF_SALT_LEN], rounds: u64) {
    let cipher = Aes256::new(GenericArray::from_slice(key));
    for half in data.chunks_exact_mut(16) {
        let block = GenericArray::from_mut_slice(half);
        for _ in 0..rounds {
            cipher.encrypt_block(block);
        }
    }
}

/// FIPS-197 appendix C.3 (AES-256).
const FIPS197_KEY: [u8; 32] = [
    0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f,
    0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1a, 0x1b, 0x1c, 0x1d, 0x1e, 0x1f,
];
const FIPS197_PLAINTEXT: [u8; 16] = [
    0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff,
];
const FIPS197_CIPHERTEXT: [u8; 16] = [
    0x8e, 0xa2, 0xb7, 0xca, 0x51, 0x67, 0x45, 0xbf, 0xea, 0xfc, 0x49, 0x90, 0x4b, 0x49, 0x60, 0x89,
];

/// Known-answer check of the block transform.
pub(crate) fn self_test() -> Result<(), DerivationError> {
    let mut data = [0u8; KEY_LEN];
    data[..16].copy_from_slice(&FIPS197_PLAINTEXT);
    data[16..].copy_from_slice(&FIPS197_PLAINTEXT);
    transform(&mut data, &FIPS197_KEY, 1);
    if data[..16] != FIPS197_CIPHERTEXT || data[16..] != FIPS197_CIPHERTEXT {
        return Err(DerivationError::InternalError(
            "aes-kdf self-test produced an unexpected block".into(),
        ));
    }
    Ok(())
}
