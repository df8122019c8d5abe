//! FileTransfer: offer, download and rescind encrypted file sets over a transport.
//!
//! Every operation consults the private-mode detector, projects files through the keychain,
//! and keeps the handle → session registry current. Hosts call [`FileTransfer::rescind_all`]
//! at teardown.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{Config, PrivateModePolicy};
use crate::file::FileLike;
use crate::loopback::{LoopbackClient, LoopbackSwarm};
use crate::privacy::{PrivateModeDetector, WritableDirCheck};
use crate::projector::{ProjectedFile, Projector};
use crate::registry::{SessionRegistry, SessionState};
use crate::save::{pipe, DirectorySaver, DiskSaver};
use crate::transport::{
    ProgressCallback, Session, SessionOptions, StoreBackend, Transport, TransportError,
    TransportTuning,
};

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("no files to offer")]
    NoFiles,
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("cannot project {name}: {source}")]
    Projection {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("payload of {size} bytes exceeds the private-mode limit of {limit} bytes")]
    PrivateModeLimit { size: u64, limit: u64 },
    #[error("handle {0} was rescinded")]
    Rescinded(String),
    #[error("download aborted while saving {name}: {source}")]
    DownloadAborted {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// Per-call download options.
#[derive(Clone, Default)]
pub struct DownloadOptions {
    /// Pipe every received file into the disk saver.
    pub save: bool,
    /// Attached for the duration of the call.
    pub on_progress: Option<ProgressCallback>,
}

/// Encrypted file transfer over a peer-to-peer transport.
pub struct FileTransfer<T: Transport, D, S> {
    transport: T,
    detector: D,
    saver: S,
    projector: Projector,
    registry: SessionRegistry<T::Session>,
    tuning: TransportTuning,
    policy: PrivateModePolicy,
    private_mode_max_bytes: u64,
}

impl<T, D, S> FileTransfer<T, D, S>
where
    T: Transport,
    D: PrivateModeDetector,
    S: DiskSaver,
{
    /// Only the origin, transport tuning and private-mode policy are read from `config`.
    /// `store_dir` and `stream_relay` belong to the transport, detector and saver, which the
    /// host builds; [`FileTransfer::loopback`] does that wiring for the loopback transport.
    pub fn new(transport: T, detector: D, saver: S, config: &Config) -> Self {
        Self {
            transport,
            detector,
            saver,
            projector: Projector::new(config.origin.clone()),
            registry: SessionRegistry::new(),
            tuning: config.tuning(),
            policy: config.private_mode,
            private_mode_max_bytes: config.private_mode_max_bytes,
        }
    }

    /// Replace the default projector (origin from config, default record size).
    pub fn with_projector(mut self, projector: Projector) -> Self {
        self.projector = projector;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn saver(&self) -> &S {
        &self.saver
    }

    /// Encrypt `files` under `password`, seed them and return the handle.
    pub async fn offer(
        &self,
        files: &[Arc<dyn FileLike>],
        password: &str,
    ) -> Result<String, TransferError> {
        if files.is_empty() {
            return Err(TransferError::NoFiles);
        }
        let total: u64 = files.iter().map(|f| f.size()).sum();
        let (options, private) = self.session_options().await;
        if private {
            self.check_private_limit(total)?;
        }

        let mut projected: Vec<Arc<dyn FileLike>> = Vec::with_capacity(files.len());
        for file in files {
            let encrypted = self
                .projector
                .encrypt(file.as_ref(), password)
                .map_err(|source| TransferError::Projection {
                    name: file.name().to_string(),
                    source,
                })?;
            projected.push(Arc::new(encrypted));
        }

        let session = self.transport.seed(projected, options).await?;
        let handle = session.handle().to_string();
        if let Some(previous) = self.registry.insert(&handle, session.clone()) {
            if !Arc::ptr_eq(&previous, &session) {
                tracing::debug!(handle = %handle, "replacing session for re-offered handle");
                previous.destroy().await;
            }
        }
        tracing::info!(handle = %handle, files = files.len(), bytes = total, private, "offering");
        Ok(handle)
    }

    /// Fetch the file set behind `handle` and return its decrypted projections.
    ///
    /// An active session for `handle` is reused; concurrent calls for a handle that is
    /// still resolving share one `add`.
    pub async fn download(
        &self,
        handle: &str,
        password: &str,
        options: DownloadOptions,
    ) -> Result<Vec<ProjectedFile>, TransferError> {
        let slot = self.registry.slot(handle);
        let session = match slot.session() {
            Some(session) => {
                tracing::debug!(handle, "reusing session");
                session
            }
            None => {
                let resolved = slot
                    .cell()
                    .get_or_try_init(|| self.resolve(handle))
                    .await
                    .cloned();
                match resolved {
                    Ok(session) => session,
                    Err(e) => {
                        self.registry.discard_failed(handle, &slot);
                        return Err(e);
                    }
                }
            }
        };
        if slot.is_rescinded() {
            session.destroy().await;
            return Err(TransferError::Rescinded(handle.to_string()));
        }

        let subscription = options
            .on_progress
            .clone()
            .map(|callback| session.on_progress(callback));
        let result = self.receive(session.as_ref(), password, options.save).await;
        if let Some(id) = subscription {
            session.off_progress(id);
        }
        match result {
            Err(TransferError::Transport(TransportError::Destroyed)) if slot.is_rescinded() => {
                Err(TransferError::Rescinded(handle.to_string()))
            }
            Err(TransferError::Transport(e)) => {
                // The payload never arrived; a retry must start a fresh session.
                session.destroy().await;
                if self.registry.discard(handle, &slot) {
                    tracing::warn!(handle, error = %e, "download failed, session dropped");
                }
                Err(TransferError::Transport(e))
            }
            other => other,
        }
    }

    /// Stop offering or downloading `handle`. Unknown handles are ignored.
    pub async fn rescind(&self, handle: &str) {
        match self.registry.remove(handle) {
            Some(slot) => match slot.session() {
                Some(session) => {
                    session.destroy().await;
                    tracing::info!(handle, "rescinded");
                }
                None => tracing::info!(handle, "rescinded pending download"),
            },
            None => tracing::warn!(handle, "rescind: no session for handle"),
        }
    }

    /// Rescind every registered handle.
    pub async fn rescind_all(&self) {
        let drained = self.registry.drain();
        let count = drained.len();
        for (_, slot) in drained {
            if let Some(session) = slot.session() {
                session.destroy().await;
            }
        }
        if count > 0 {
            tracing::info!(count, "rescinded all sessions");
        }
    }

    /// True while an offer or completed resolution for `handle` is registered.
    pub fn is_offering(&self, handle: &str) -> bool {
        self.registry.state(handle) == SessionState::Active
    }

    pub fn state(&self, handle: &str) -> SessionState {
        self.registry.state(handle)
    }

    pub fn handles(&self) -> Vec<String> {
        self.registry.handles()
    }

    async fn session_options(&self) -> (SessionOptions, bool) {
        let private = self.detector.detect().await.is_private;
        let store = if private {
            StoreBackend::Memory
        } else {
            StoreBackend::Disk {
                destroy_on_close: true,
            }
        };
        let options = SessionOptions {
            store,
            tuning: self.tuning.clone(),
        };
        (options, private)
    }

    fn check_private_limit(&self, size: u64) -> Result<(), TransferError> {
        if self.policy == PrivateModePolicy::RejectLarge && size > self.private_mode_max_bytes {
            return Err(TransferError::PrivateModeLimit {
                size,
                limit: self.private_mode_max_bytes,
            });
        }
        Ok(())
    }

    async fn resolve(&self, handle: &str) -> Result<Arc<T::Session>, TransferError> {
        let (options, private) = self.session_options().await;
        let session = self.transport.add(handle, options).await?;
        if private {
            let size: u64 = session.files().iter().map(|f| f.size()).sum();
            if let Err(e) = self.check_private_limit(size) {
                session.destroy().await;
                return Err(e);
            }
        }
        tracing::info!(handle, private, "downloading");
        Ok(session)
    }

    async fn receive(
        &self,
        session: &T::Session,
        password: &str,
        save: bool,
    ) -> Result<Vec<ProjectedFile>, TransferError> {
        session.done().await?;
        let mut files = Vec::new();
        for received in session.files() {
            let name = received.name().to_string();
            let decrypted = self
                .projector
                .decrypt(received, password)
                .map_err(|source| TransferError::Projection { name, source })?;
            files.push(ProjectedFile::from(decrypted));
        }
        if save {
            for file in &files {
                if let Err(source) = self.save(file).await {
                    tracing::warn!(
                        handle = session.handle(),
                        file = file.name(),
                        error = %source,
                        "save failed, download aborted"
                    );
                    return Err(TransferError::DownloadAborted {
                        name: file.name().to_string(),
                        source,
                    });
                }
            }
        }
        tracing::debug!(handle = session.handle(), files = files.len(), "download complete");
        Ok(files)
    }

    async fn save(&self, file: &ProjectedFile) -> io::Result<u64> {
        let mut sink = self.saver.create(file.name(), file.size()).await?;
        pipe(file.open_stream()?, &mut sink).await
    }
}

impl FileTransfer<LoopbackClient, WritableDirCheck, DirectorySaver> {
    /// Loopback peer wired from `config`: piece stores and the private-mode check live
    /// under `store_dir`; saved files go to `save_dir` with the configured stream relay.
    pub fn loopback(swarm: LoopbackSwarm, save_dir: impl Into<PathBuf>, config: &Config) -> Self {
        Self::new(
            LoopbackClient::new(swarm, config.store_dir.clone()),
            WritableDirCheck::new(config.store_dir.clone()),
            DirectorySaver::new(save_dir).with_stream_relay(config.stream_relay.clone()),
            config,
        )
    }
}
