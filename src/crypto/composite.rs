//! Composite key assembly.

use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::{DerivedKey, KEY_LEN, MasterKey};

const AUX_ABSENT: u8 = 0x00;
const AUX_PRESENT: u8 = 0x01;

/// Combines a derived key with an optional auxiliary component.
///
/// `SHA-256(derived || 0x00)` without auxiliary data and
/// `SHA-256(derived || 0x01 || len_le64(aux) || aux)` with it, so an absent
/// component and an empty one give different keys. Consumes `derived`,
/// which is wiped when it goes out of scope here.
pub fn build_master_key(derived: DerivedKey, auxiliary: Option<&[u8]>) -> MasterKey {
    let mut hasher = Sha256::new();
    hasher.update(derived.as_bytes());
    match auxiliary {
        Some(aux) => {
            hasher.update([AUX_PRESENT]);
            hasher.update((aux.len() as u64).to_le_bytes());
            hasher.update(aux);
        }
        None => hasher.update([AUX_ABSENT]),
    }
    let bytes: Zeroizing<[u8; KEY_LEN]> = Zeroizing::new(hasher.finalize().into());
    MasterKey::from_bytes(*bytes)
}

/// Reduces keyfile contents to a 32-byte component.
///
/// 32 bytes are used as-is, 64 hex characters are decoded, anything else is
/// hashed with SHA-256.
pub fn keyfile_component(contents: &[u8]) -> Zeroizing<[u8; KEY_LEN]> {
    let mut component = Zeroizing::new([0u8; KEY_LEN]);
    if contents.len() == KEY_LEN {
        component.copy_from_slice(contents);
        return component;
    }
    let decoded = contents.len() == 2 * KEY_LEN
        && hex::decode_to_slice(contents, &mut component[..]).is_ok();
    if !decoded {
        component.copy_from_slice(&Sha256::digest(contents));
    }
    component
}
