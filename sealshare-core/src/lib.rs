//! Encrypted file transfer over a peer-to-peer transport.
//! Files are encrypted before seeding and decrypted lazily on read; the transport only
//! ever sees ciphertext.

pub mod config;
pub mod derive;
pub mod file;
pub mod keychain;
pub mod logging;
pub mod pool;
pub mod privacy;
pub mod projector;
pub mod registry;
pub mod save;
pub mod transfer;
pub mod transport;

// Loopback transport and its piece storage.
pub mod integrity;
pub mod loopback;
pub mod store;

pub use config::{Config, ConfigError, PrivateModePolicy};
pub use derive::KeyMaterial;
pub use file::{FileLike, LocalFile, MemoryFile};
pub use keychain::{Keychain, KeychainError};
pub use loopback::{LoopbackClient, LoopbackSession, LoopbackSwarm};
pub use pool::{ByteStream, PoolError, StreamPool};
pub use privacy::{BrowsingMode, FixedMode, PrivateModeDetector, WritableDirCheck};
pub use projector::{DecryptedFile, EncryptedFile, ProjectedFile, Projector};
pub use registry::SessionState;
pub use save::{DirectorySaver, DiskSaver};
pub use transfer::{DownloadOptions, FileTransfer, TransferError};
pub use transport::{
    Progress, ProgressCallback, Session, SessionOptions, StoreBackend, Transport,
    TransportError, TransportTuning,
};
