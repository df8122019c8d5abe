//! Key derivation: password and origin to fixed-length key material for the keychain.

use std::fmt;

/// Length of both the key and the salt, in bytes.
pub const KEY_LEN: usize = 16;

/// Pattern repeated after the input until `KEY_LEN` bytes are available.
const FILLER: &[u8] = b"0123456789abcdef";

/// Key + salt pair handed to the keychain. Recomputed on every call; never cached.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub key: [u8; KEY_LEN],
    pub salt: [u8; KEY_LEN],
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key", &"<redacted>")
            .field("salt", &hex::encode(self.salt))
            .finish()
    }
}

/// Derive key material from a password, scoped to `origin`.
///
/// The same password under a different origin yields a different salt. This scopes
/// transfers to the host that created them; it is not a security boundary.
pub fn derive(password: &str, origin: &str) -> KeyMaterial {
    KeyMaterial {
        key: pad_to_key(password),
        salt: pad_to_key(origin),
    }
}

/// Input bytes followed by the repeating filler, sliced to `KEY_LEN`.
fn pad_to_key(input: &str) -> [u8; KEY_LEN] {
    let mut out = [0u8; KEY_LEN];
    let padded = input.as_bytes().iter().chain(FILLER.iter().cycle());
    for (slot, byte) in out.iter_mut().zip(padded) {
        *slot = *byte;
    }
    out
}
