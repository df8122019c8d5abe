//! Transport seam: the peer-to-peer engine that seeds and fetches file sets.

use std::io;
use std::sync::Arc;

use crate::file::FileLike;

/// Piece store a session should use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    /// Transport's default in-process store.
    Memory,
    /// Disk-backed piece store, optionally deleted when the session is destroyed.
    Disk { destroy_on_close: bool },
}

impl Default for StoreBackend {
    fn default() -> Self {
        StoreBackend::Disk {
            destroy_on_close: true,
        }
    }
}

/// Transport tuning passed through opaquely from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportTuning {
    /// Tracker / signalling endpoints.
    pub announce: Vec<String>,
    /// Piece length in bytes.
    pub piece_length: u64,
}

impl Default for TransportTuning {
    fn default() -> Self {
        Self {
            announce: Vec::new(),
            piece_length: crate::store::DEFAULT_PIECE_LENGTH,
        }
    }
}

/// Options for a single seed or add call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOptions {
    pub store: StoreBackend,
    pub tuning: TransportTuning,
}

/// Download progress for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub downloaded: u64,
    pub total: u64,
}

impl Progress {
    /// Completed fraction in `0.0..=1.0`; an empty payload counts as complete.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.downloaded as f64 / self.total as f64
        }
    }
}

/// Callback invoked on every progress event.
pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

/// Handle returned by [`Session::on_progress`], used to detach the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no swarm for handle {0}")]
    NotFound(String),
    #[error("corrupted session: {0}")]
    Corrupted(String),
    #[error("session destroyed")]
    Destroyed,
    #[error("manifest encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Peer-to-peer engine. Implementations own their connections and stores.
#[allow(async_fn_in_trait)]
pub trait Transport: Send + Sync {
    type Session: Session;

    /// Start seeding `files`. Resolves once the session is registered and has a handle.
    async fn seed(
        &self,
        files: Vec<Arc<dyn FileLike>>,
        options: SessionOptions,
    ) -> Result<Arc<Self::Session>, TransportError>;

    /// Join the swarm for `handle`. Resolves once the session exists; the payload may
    /// still be arriving (see [`Session::done`]).
    async fn add(
        &self,
        handle: &str,
        options: SessionOptions,
    ) -> Result<Arc<Self::Session>, TransportError>;
}

/// One seed or download, identified by its handle.
#[allow(async_fn_in_trait)]
pub trait Session: Send + Sync {
    fn handle(&self) -> &str;

    /// Files in the session. Each can be opened any number of times once complete.
    fn files(&self) -> Vec<Arc<dyn FileLike>>;

    fn progress(&self) -> Progress;

    fn on_progress(&self, callback: ProgressCallback) -> SubscriptionId;

    fn off_progress(&self, id: SubscriptionId);

    /// Wait until the whole payload is locally available.
    async fn done(&self) -> Result<(), TransportError>;

    /// Tear down connections and the piece store. Idempotent.
    async fn destroy(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_payload_counts_as_complete() {
        let p = Progress {
            downloaded: 0,
            total: 0,
        };
        assert_eq!(p.fraction(), 1.0);
    }

    #[test]
    fn fraction_is_ratio() {
        let p = Progress {
            downloaded: 25,
            total: 100,
        };
        assert!((p.fraction() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn default_options_use_disk_store() {
        let opts = SessionOptions::default();
        assert_eq!(
            opts.store,
            StoreBackend::Disk {
                destroy_on_close: true
            }
        );
        assert_eq!(opts.tuning.piece_length, crate::store::DEFAULT_PIECE_LENGTH);
    }
}
