//! Integrity: per-piece SHA-256, the session manifest and the handle derived from it.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Prefix of every handle issued by the loopback transport.
pub const HANDLE_PREFIX: &str = "magnet:?xt=urn:btih:";

/// Hash a piece payload. Returns 32-byte digest.
pub fn hash_piece(payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.finalize().into()
}

/// Verify piece payload against expected hash.
pub fn verify_piece(payload: &[u8], expected_hash: &[u8; 32]) -> bool {
    hash_piece(payload) == *expected_hash
}

/// Everything a downloader needs to fetch and verify a file set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub piece_length: u64,
    pub files: Vec<ManifestFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub name: String,
    pub length: u64,
    pub content_type: String,
    /// Seconds since the Unix epoch.
    pub last_modified: u64,
    pub pieces: Vec<[u8; 32]>,
}

impl Manifest {
    /// SHA-256 over the bincode encoding; truncated to 20 bytes like a BitTorrent info hash.
    pub fn info_hash(&self) -> Result<[u8; 20], bincode::Error> {
        let encoded = bincode::serialize(self)?;
        let digest = hash_piece(&encoded);
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest[..20]);
        Ok(out)
    }

    /// Magnet-style handle naming this file set.
    pub fn handle(&self) -> Result<String, bincode::Error> {
        Ok(format!("{}{}", HANDLE_PREFIX, hex::encode(self.info_hash()?)))
    }

    pub fn total_length(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(name: &str) -> Manifest {
        Manifest {
            piece_length: 16,
            files: vec![ManifestFile {
                name: name.to_string(),
                length: 5,
                content_type: "text/plain".to_string(),
                last_modified: 0,
                pieces: vec![hash_piece(b"hello")],
            }],
        }
    }

    #[test]
    fn hash_verify_roundtrip() {
        let payload = b"hello piece";
        let hash = hash_piece(payload);
        assert!(verify_piece(payload, &hash));
    }

    #[test]
    fn verify_rejects_tampered() {
        let payload = b"hello piece";
        let hash = hash_piece(payload);
        assert!(!verify_piece(b"tampered", &hash));
    }

    #[test]
    fn handle_is_stable_and_content_addressed() {
        let a = manifest("a.txt").handle().unwrap();
        assert_eq!(a, manifest("a.txt").handle().unwrap());
        assert_ne!(a, manifest("b.txt").handle().unwrap());
        assert!(a.starts_with(HANDLE_PREFIX));
        assert_eq!(a.len(), HANDLE_PREFIX.len() + 40);
    }

    #[test]
    fn total_length_sums_files() {
        let mut m = manifest("a");
        m.files.push(ManifestFile {
            length: 7,
            ..m.files[0].clone()
        });
        assert_eq!(m.total_length(), 12);
    }
}
