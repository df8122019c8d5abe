//! Projected files: plaintext files seen through the encryptor, received files seen
//! through the decryptor. Both keep the `FileLike` surface so neither the transport nor
//! the save path can tell them apart from native files.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::SystemTime;

use crate::derive;
use crate::file::FileLike;
use crate::keychain::Keychain;
use crate::pool::{ByteStream, StreamPool};

/// How many times a transport opens each seeded file: once to hash it, once to load it.
pub const TRANSPORT_REOPENS: usize = 2;

/// Builds projected files for one origin.
#[derive(Debug, Clone)]
pub struct Projector {
    origin: String,
    record_size: Option<u64>,
}

impl Projector {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            record_size: None,
        }
    }

    /// Use a custom cipher record size instead of the keychain default.
    pub fn with_record_size(mut self, record_size: u64) -> Self {
        self.record_size = Some(record_size);
        self
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    fn keychain(&self, password: &str) -> io::Result<Keychain> {
        let material = derive::derive(password, &self.origin);
        match self.record_size {
            Some(size) => Ok(Keychain::with_record_size(&material, size)?),
            None => Ok(Keychain::new(&material)),
        }
    }

    /// Project a local plaintext file as its ciphertext. Encryption starts when a pooled
    /// stream is first read.
    pub fn encrypt(&self, file: &dyn FileLike, password: &str) -> io::Result<EncryptedFile> {
        let keychain = self.keychain(password)?;
        let ciphertext = keychain.encrypt_stream(file.open_stream()?);
        Ok(EncryptedFile {
            name: file.name().to_string(),
            size: keychain.encrypted_size(file.size()),
            content_type: file.content_type().to_string(),
            last_modified: file.last_modified(),
            pool: StreamPool::split(ciphertext, TRANSPORT_REOPENS),
        })
    }

    /// Project a received ciphertext file as its plaintext.
    pub fn decrypt(&self, file: Arc<dyn FileLike>, password: &str) -> io::Result<DecryptedFile> {
        let keychain = self.keychain(password)?;
        let size = keychain.plaintext_size(file.size())?;
        Ok(DecryptedFile {
            inner: file,
            keychain,
            size,
        })
    }
}

/// Ciphertext view of a plaintext file, backed by a pre-split stream pool.
pub struct EncryptedFile {
    name: String,
    size: u64,
    content_type: String,
    last_modified: SystemTime,
    pool: StreamPool,
}

impl EncryptedFile {
    /// Opens left before `open_stream` starts failing.
    pub fn remaining_opens(&self) -> usize {
        self.pool.remaining()
    }
}

impl fmt::Debug for EncryptedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedFile")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("remaining_opens", &self.pool.remaining())
            .finish()
    }
}

impl FileLike for EncryptedFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn content_type(&self) -> &str {
        &self.content_type
    }

    fn last_modified(&self) -> SystemTime {
        self.last_modified
    }

    fn open_stream(&self) -> io::Result<ByteStream> {
        self.pool.take().map_err(io::Error::other)
    }
}

/// Plaintext view of a received file. Each open decrypts a fresh transport stream.
pub struct DecryptedFile {
    inner: Arc<dyn FileLike>,
    keychain: Keychain,
    size: u64,
}

impl DecryptedFile {
    /// Size of the underlying ciphertext.
    pub fn encrypted_size(&self) -> u64 {
        self.inner.size()
    }
}

impl fmt::Debug for DecryptedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptedFile")
            .field("name", &self.inner.name())
            .field("size", &self.size)
            .finish()
    }
}

impl FileLike for DecryptedFile {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn content_type(&self) -> &str {
        self.inner.content_type()
    }

    fn last_modified(&self) -> SystemTime {
        self.inner.last_modified()
    }

    fn open_stream(&self) -> io::Result<ByteStream> {
        Ok(self.keychain.decrypt_stream(self.inner.open_stream()?))
    }
}

/// Either projection, behind the common file surface.
#[derive(Debug)]
pub enum ProjectedFile {
    Encrypted(EncryptedFile),
    Decrypted(DecryptedFile),
}

impl ProjectedFile {
    fn as_file(&self) -> &dyn FileLike {
        match self {
            ProjectedFile::Encrypted(f) => f,
            ProjectedFile::Decrypted(f) => f,
        }
    }
}

impl FileLike for ProjectedFile {
    fn name(&self) -> &str {
        self.as_file().name()
    }

    fn size(&self) -> u64 {
        self.as_file().size()
    }

    fn content_type(&self) -> &str {
        self.as_file().content_type()
    }

    fn last_modified(&self) -> SystemTime {
        self.as_file().last_modified()
    }

    fn open_stream(&self) -> io::Result<ByteStream> {
        self.as_file().open_stream()
    }
}

impl From<EncryptedFile> for ProjectedFile {
    fn from(f: EncryptedFile) -> Self {
        ProjectedFile::Encrypted(f)
    }
}

impl From<DecryptedFile> for ProjectedFile {
    fn from(f: DecryptedFile) -> Self {
        ProjectedFile::Decrypted(f)
    }
}
