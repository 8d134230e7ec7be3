//! Per-connection session key schedule.
//!
//! Each connection is keyed with four independent 32-byte strings: one
//! cipher key and one MAC key per direction. The handshake that negotiates
//! them is external to this crate; [`SessionKeys::derive`] captures the
//! schedule both sides of a handshake must agree on when expanding a shared
//! secret.
//!
//! Keys are fresh per connection, which is what makes the frame codec's
//! all-zero CTR counter sound. Reusing a key set across connections is a
//! caller error and voids every confidentiality guarantee.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length in bytes of every session key.
pub const KEY_LEN: usize = 32;

const LABEL_WRITE_CIPHER: &[u8] = b"wireline write cipher v1";
const LABEL_WRITE_MAC: &[u8] = b"wireline write mac v1";
const LABEL_READ_CIPHER: &[u8] = b"wireline read cipher v1";
const LABEL_READ_MAC: &[u8] = b"wireline read mac v1";

/// The four keys securing one connection, from the server's perspective.
///
/// A client endpoint of the same stream holds the [`mirrored`](Self::mirrored)
/// set: its write keys are the server's read keys and vice versa.
///
/// Key material is zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    /// Cipher key for frames written to the peer.
    pub write_cipher: [u8; KEY_LEN],
    /// MAC key for frames written to the peer.
    pub write_mac: [u8; KEY_LEN],
    /// Cipher key for frames read from the peer.
    pub read_cipher: [u8; KEY_LEN],
    /// MAC key for frames read from the peer.
    pub read_mac: [u8; KEY_LEN],
}

impl SessionKeys {
    /// Assemble a key set from four externally negotiated keys.
    pub fn new(
        write_cipher: [u8; KEY_LEN],
        write_mac: [u8; KEY_LEN],
        read_cipher: [u8; KEY_LEN],
        read_mac: [u8; KEY_LEN],
    ) -> Self {
        Self { write_cipher, write_mac, read_cipher, read_mac }
    }

    /// Expand a handshake secret into the full key schedule.
    ///
    /// Uses HKDF-SHA-256 with a distinct info label per key, so the four
    /// keys are mutually independent even though they share one secret.
    /// Deterministic: both handshake endpoints derive identical schedules
    /// from the same `(secret, salt)` pair.
    pub fn derive(secret: &[u8], salt: Option<&[u8]>) -> Self {
        let hkdf = Hkdf::<Sha256>::new(salt, secret);
        Self {
            write_cipher: expand(&hkdf, LABEL_WRITE_CIPHER),
            write_mac: expand(&hkdf, LABEL_WRITE_MAC),
            read_cipher: expand(&hkdf, LABEL_READ_CIPHER),
            read_mac: expand(&hkdf, LABEL_READ_MAC),
        }
    }

    /// The same key set seen from the other end of the stream.
    pub fn mirrored(&self) -> Self {
        Self {
            write_cipher: self.read_cipher,
            write_mac: self.read_mac,
            read_cipher: self.write_cipher,
            read_mac: self.write_mac,
        }
    }
}

impl std::fmt::Debug for SessionKeys {
    // Key material stays out of logs.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKeys(..)")
    }
}

fn expand(hkdf: &Hkdf<Sha256>, label: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    let Ok(()) = hkdf.expand(label, &mut key) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_is_deterministic() {
        let a = SessionKeys::derive(b"shared secret", None);
        let b = SessionKeys::derive(b"shared secret", None);
        assert_eq!(a.write_cipher, b.write_cipher);
        assert_eq!(a.read_mac, b.read_mac);
    }

    #[test]
    fn derived_keys_are_pairwise_distinct() {
        let keys = SessionKeys::derive(b"shared secret", None);
        let all = [keys.write_cipher, keys.write_mac, keys.read_cipher, keys.read_mac];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a, b, "independent keys must not collide");
            }
        }
    }

    #[test]
    fn different_secrets_produce_different_schedules() {
        let a = SessionKeys::derive(b"secret a", None);
        let b = SessionKeys::derive(b"secret b", None);
        assert_ne!(a.write_cipher, b.write_cipher);
    }

    #[test]
    fn salt_changes_the_schedule() {
        let plain = SessionKeys::derive(b"secret", None);
        let salted = SessionKeys::derive(b"secret", Some(b"conn-nonce"));
        assert_ne!(plain.write_cipher, salted.write_cipher);
    }

    #[test]
    fn mirrored_swaps_directions() {
        let server = SessionKeys::derive(b"secret", None);
        let client = server.mirrored();
        assert_eq!(server.write_cipher, client.read_cipher);
        assert_eq!(server.write_mac, client.read_mac);
        assert_eq!(server.read_cipher, client.write_cipher);
        assert_eq!(client.mirrored().write_cipher, server.write_cipher);
    }

    #[test]
    fn debug_redacts_key_material() {
        let keys = SessionKeys::derive(b"secret", None);
        assert_eq!(format!("{keys:?}"), "SessionKeys(..)");
    }
}
