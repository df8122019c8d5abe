//! Streaming keychain: record-based ChaCha20-Poly1305 over byte streams.
//!
//! Stream layout: a 16-byte random header followed by sealed records. The content key is
//! derived from the key material and the header, so every stream gets a fresh key even
//! when the password is reused. Each record is `record_size` bytes of ciphertext
//! (plaintext + 16-byte tag) except the final one, which is always shorter. The nonce
//! carries the record counter and a final-record flag, so truncation, reordering and
//! a missing tail are all detected.

use std::io;

use bytes::{Bytes, BytesMut};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use futures::StreamExt;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::derive::{KeyMaterial, KEY_LEN};
use crate::pool::ByteStream;

/// Random per-stream header length.
pub const HEADER_SIZE: u64 = 16;
/// Poly1305 tag appended to every record.
pub const TAG_SIZE: u64 = 16;
/// Ciphertext bytes per full record.
pub const DEFAULT_RECORD_SIZE: u64 = 64 * 1024;

const CONTENT_KEY_LABEL: &[u8] = b"sealshare-content-v1";

#[derive(Debug, thiserror::Error)]
pub enum KeychainError {
    #[error("record size {0} leaves no room for plaintext")]
    RecordSize(u64),
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed: wrong password or corrupted data")]
    Decrypt,
    #[error("ciphertext stream is truncated")]
    Truncated,
    #[error("{0} bytes is not a valid ciphertext size")]
    InvalidSize(u64),
}

impl From<KeychainError> for io::Error {
    fn from(e: KeychainError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, e)
    }
}

/// Symmetric streaming cipher built from derived key material.
#[derive(Clone)]
pub struct Keychain {
    key: [u8; KEY_LEN],
    salt: [u8; KEY_LEN],
    record_size: u64,
}

impl Keychain {
    pub fn new(material: &KeyMaterial) -> Self {
        Self {
            key: material.key,
            salt: material.salt,
            record_size: DEFAULT_RECORD_SIZE,
        }
    }

    /// Keychain with a custom ciphertext record size (must exceed `TAG_SIZE`).
    pub fn with_record_size(material: &KeyMaterial, record_size: u64) -> Result<Self, KeychainError> {
        if record_size <= TAG_SIZE {
            return Err(KeychainError::RecordSize(record_size));
        }
        Ok(Self {
            record_size,
            ..Self::new(material)
        })
    }

    pub fn record_size(&self) -> u64 {
        self.record_size
    }

    fn plaintext_record(&self) -> u64 {
        self.record_size - TAG_SIZE
    }

    /// Ciphertext length for `plaintext` bytes. Always greater than `plaintext`.
    pub fn encrypted_size(&self, plaintext: u64) -> u64 {
        let records = plaintext / self.plaintext_record() + 1;
        HEADER_SIZE + plaintext + records * TAG_SIZE
    }

    /// Plaintext length for `ciphertext` bytes; exact inverse of [`Self::encrypted_size`].
    pub fn plaintext_size(&self, ciphertext: u64) -> Result<u64, KeychainError> {
        let body = ciphertext
            .checked_sub(HEADER_SIZE)
            .ok_or(KeychainError::InvalidSize(ciphertext))?;
        let full_records = body / self.record_size;
        let tail = body % self.record_size;
        if tail < TAG_SIZE {
            return Err(KeychainError::InvalidSize(ciphertext));
        }
        Ok(full_records * self.plaintext_record() + tail - TAG_SIZE)
    }

    /// Encrypt `source` lazily: nothing is read or generated until the result is polled.
    pub fn encrypt_stream(&self, source: ByteStream) -> ByteStream {
        let sealer = Sealer {
            input: RecordInput::new(source),
            key: self.key,
            salt: self.salt,
            record: self.plaintext_record() as usize,
            cipher: None,
            counter: 0,
            finished: false,
        };
        futures::stream::unfold(sealer, |mut s| async move {
            s.next_chunk().await.map(|item| (item, s))
        })
        .boxed()
    }

    /// Decrypt `source` lazily. A wrong key surfaces as an `InvalidData` error on the
    /// first read, not here.
    pub fn decrypt_stream(&self, source: ByteStream) -> ByteStream {
        let opener = Opener {
            input: RecordInput::new(source),
            key: self.key,
            salt: self.salt,
            record: self.record_size as usize,
            cipher: None,
            counter: 0,
            finished: false,
        };
        futures::stream::unfold(opener, |mut o| async move {
            o.next_chunk().await.map(|item| (item, o))
        })
        .boxed()
    }
}

fn content_cipher(key: &[u8; KEY_LEN], salt: &[u8; KEY_LEN], header: &[u8]) -> ChaCha20Poly1305 {
    let mut hasher = Sha256::new();
    hasher.update(CONTENT_KEY_LABEL);
    hasher.update(key);
    hasher.update(salt);
    hasher.update(header);
    let digest: [u8; 32] = hasher.finalize().into();
    ChaCha20Poly1305::new(Key::from_slice(&digest))
}

/// 96-bit nonce: final-record flag in byte 0, counter little-endian in bytes 4..12.
fn record_nonce(counter: u64, last: bool) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[0] = u8::from(last);
    nonce[4..12].copy_from_slice(&counter.to_le_bytes());
    nonce
}

fn seal(cipher: &ChaCha20Poly1305, counter: u64, last: bool, plain: &[u8]) -> Result<Vec<u8>, KeychainError> {
    cipher
        .encrypt(Nonce::from_slice(&record_nonce(counter, last)), plain)
        .map_err(|_| KeychainError::Encrypt)
}

fn open(cipher: &ChaCha20Poly1305, counter: u64, last: bool, sealed: &[u8]) -> Result<Vec<u8>, KeychainError> {
    cipher
        .decrypt(Nonce::from_slice(&record_nonce(counter, last)), sealed)
        .map_err(|_| KeychainError::Decrypt)
}

/// Regroups an arbitrary chunking of the source into record-sized slices.
struct RecordInput {
    source: ByteStream,
    buffer: BytesMut,
    exhausted: bool,
}

impl RecordInput {
    fn new(source: ByteStream) -> Self {
        Self {
            source,
            buffer: BytesMut::new(),
            exhausted: false,
        }
    }

    /// Buffer at least `want` bytes, or everything that is left.
    async fn fill(&mut self, want: usize) -> io::Result<()> {
        while !self.exhausted && self.buffer.len() < want {
            match self.source.next().await {
                Some(chunk) => self.buffer.extend_from_slice(&chunk?),
                None => self.exhausted = true,
            }
        }
        Ok(())
    }
}

struct Sealer {
    input: RecordInput,
    key: [u8; KEY_LEN],
    salt: [u8; KEY_LEN],
    /// Plaintext bytes per full record.
    record: usize,
    cipher: Option<ChaCha20Poly1305>,
    counter: u64,
    finished: bool,
}

impl Sealer {
    async fn next_chunk(&mut self) -> Option<io::Result<Bytes>> {
        if self.finished {
            return None;
        }
        let step = if self.cipher.is_none() {
            Ok(self.write_header())
        } else {
            self.seal_next().await
        };
        if step.is_err() {
            self.finished = true;
        }
        Some(step)
    }

    fn write_header(&mut self) -> Bytes {
        let mut header = [0u8; HEADER_SIZE as usize];
        OsRng.fill_bytes(&mut header);
        self.cipher = Some(content_cipher(&self.key, &self.salt, &header));
        Bytes::copy_from_slice(&header)
    }

    async fn seal_next(&mut self) -> io::Result<Bytes> {
        self.input.fill(self.record).await?;
        let cipher = self.cipher.as_ref().ok_or(KeychainError::Encrypt)?;
        // A full record is never final; the final record may be empty.
        let last = self.input.buffer.len() < self.record;
        let take = self.input.buffer.len().min(self.record);
        let plain = self.input.buffer.split_to(take);
        let sealed = seal(cipher, self.counter, last, &plain)?;
        self.counter += 1;
        if last {
            self.finished = true;
        }
        Ok(Bytes::from(sealed))
    }
}

struct Opener {
    input: RecordInput,
    key: [u8; KEY_LEN],
    salt: [u8; KEY_LEN],
    /// Ciphertext bytes per full record.
    record: usize,
    cipher: Option<ChaCha20Poly1305>,
    counter: u64,
    finished: bool,
}

impl Opener {
    async fn next_chunk(&mut self) -> Option<io::Result<Bytes>> {
        loop {
            if self.finished {
                return None;
            }
            let step = if self.cipher.is_none() {
                self.read_header().await.map(|()| None)
            } else {
                self.open_next().await.map(Some)
            };
            match step {
                Ok(Some(chunk)) if !chunk.is_empty() => return Some(Ok(chunk)),
                Ok(_) => continue,
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            }
        }
    }

    async fn read_header(&mut self) -> io::Result<()> {
        let len = HEADER_SIZE as usize;
        self.input.fill(len).await?;
        if self.input.buffer.len() < len {
            return Err(KeychainError::Truncated.into());
        }
        let header = self.input.buffer.split_to(len);
        self.cipher = Some(content_cipher(&self.key, &self.salt, &header));
        Ok(())
    }

    async fn open_next(&mut self) -> io::Result<Bytes> {
        self.input.fill(self.record).await?;
        let cipher = self.cipher.as_ref().ok_or(KeychainError::Decrypt)?;
        let len = self.input.buffer.len();
        let last = len < self.record;
        if last && len < TAG_SIZE as usize {
            return Err(KeychainError::Truncated.into());
        }
        let sealed = self.input.buffer.split_to(len.min(self.record));
        let plain = open(cipher, self.counter, last, &sealed)?;
        self.counter += 1;
        if last {
            self.finished = true;
        }
        Ok(Bytes::from(plain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derive::derive;
    use crate::pool::read_to_end;

    fn keychain(password: &str) -> Keychain {
        Keychain::new(&derive(password, "https://test.local"))
    }

    fn small_keychain(password: &str) -> Keychain {
        Keychain::with_record_size(&derive(password, "https://test.local"), 32).unwrap()
    }

    /// Feed `data` in uneven 7-byte chunks to exercise regrouping.
    fn source(data: &[u8]) -> ByteStream {
        let parts: Vec<io::Result<Bytes>> = data
            .chunks(7)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        futures::stream::iter(parts).boxed()
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[tokio::test]
    async fn roundtrip_default_record_size() {
        let kc = keychain("secret");
        for len in [0usize, 1, 10, 4096, 70_000] {
            let data = sample(len);
            let sealed = read_to_end(kc.encrypt_stream(source(&data))).await.unwrap();
            assert_eq!(sealed.len() as u64, kc.encrypted_size(len as u64));
            let plain = read_to_end(kc.decrypt_stream(source(&sealed))).await.unwrap();
            assert_eq!(plain, data);
        }
    }

    #[tokio::test]
    async fn roundtrip_across_record_boundaries() {
        let kc = small_keychain("secret");
        // 16 plaintext bytes per record.
        for len in [0usize, 1, 15, 16, 17, 32, 33, 100] {
            let data = sample(len);
            let sealed = read_to_end(kc.encrypt_stream(source(&data))).await.unwrap();
            assert_eq!(sealed.len() as u64, kc.encrypted_size(len as u64), "len {len}");
            let plain = read_to_end(kc.decrypt_stream(source(&sealed))).await.unwrap();
            assert_eq!(plain, data, "len {len}");
        }
    }

    #[test]
    fn size_functions_are_inverse() {
        for kc in [keychain("a"), small_keychain("a")] {
            for n in (0..300u64).chain([65_519, 65_520, 65_521, 10_000_000]) {
                let c = kc.encrypted_size(n);
                assert!(c > n);
                assert_eq!(kc.plaintext_size(c).unwrap(), n);
            }
        }
    }

    #[test]
    fn impossible_sizes_are_rejected() {
        let kc = small_keychain("a");
        assert!(matches!(kc.plaintext_size(0), Err(KeychainError::InvalidSize(0))));
        assert!(kc.plaintext_size(HEADER_SIZE + TAG_SIZE - 1).is_err());
        // One full record plus a tail shorter than a tag.
        assert!(kc.plaintext_size(HEADER_SIZE + 32 + 5).is_err());
    }

    #[test]
    fn record_size_must_leave_room_for_plaintext() {
        let km = derive("a", "o");
        assert!(matches!(
            Keychain::with_record_size(&km, TAG_SIZE),
            Err(KeychainError::RecordSize(16))
        ));
    }

    #[tokio::test]
    async fn wrong_password_fails_on_first_read() {
        let data = sample(10);
        let sealed = read_to_end(keychain("secret").encrypt_stream(source(&data)))
            .await
            .unwrap();
        let mut opened = keychain("wrong").decrypt_stream(source(&sealed));
        let first = opened.next().await.unwrap();
        assert_eq!(first.unwrap_err().kind(), io::ErrorKind::InvalidData);
        assert!(opened.next().await.is_none());
    }

    #[tokio::test]
    async fn truncated_stream_is_detected() {
        let kc = small_keychain("secret");
        let data = sample(48);
        let sealed = read_to_end(kc.encrypt_stream(source(&data))).await.unwrap();
        // Drop the final (empty) record: the remaining full records authenticate but
        // the stream never closes.
        let cut = &sealed[..sealed.len() - TAG_SIZE as usize];
        assert!(read_to_end(kc.decrypt_stream(source(cut))).await.is_err());
        assert!(read_to_end(kc.decrypt_stream(source(&sealed[..8]))).await.is_err());
    }

    #[tokio::test]
    async fn tampered_record_is_detected() {
        let kc = keychain("secret");
        let mut sealed = read_to_end(kc.encrypt_stream(source(b"attack at dawn")))
            .await
            .unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(read_to_end(kc.decrypt_stream(source(&sealed))).await.is_err());
    }

    #[tokio::test]
    async fn each_stream_gets_a_fresh_header() {
        let kc = keychain("secret");
        let a = read_to_end(kc.encrypt_stream(source(b"same"))).await.unwrap();
        let b = read_to_end(kc.encrypt_stream(source(b"same"))).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn source_errors_pass_through() {
        let failing = futures::stream::iter(vec![Err(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "disk went away",
        ))])
        .boxed();
        let err = read_to_end(keychain("s").encrypt_stream(failing))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
