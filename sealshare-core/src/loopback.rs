//! Loopback transport: an in-process swarm shared by every client built from it.
//!
//! Seeding hashes each file into pieces and loads them into the session's piece store;
//! adding a handle fetches and verifies every piece from the seeder in a background task.
//! Useful for hosts that exchange files inside one process and for exercising the
//! transfer lifecycle without a network.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::{StreamExt, TryStreamExt};
use tokio::sync::watch;

use crate::file::FileLike;
use crate::integrity::{hash_piece, verify_piece, Manifest, ManifestFile};
use crate::pool::ByteStream;
use crate::store::{pieces, PieceId, PieceStore, DEFAULT_PIECE_LENGTH};
use crate::transport::{
    Progress, ProgressCallback, Session, SessionOptions, SubscriptionId, Transport,
    TransportError,
};

type Seeders = Mutex<HashMap<String, Arc<LoopbackSession>>>;

/// Registry of seeding sessions, shared by cloning.
#[derive(Clone, Default)]
pub struct LoopbackSwarm {
    seeders: Arc<Seeders>,
}

impl LoopbackSwarm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of handles currently seeded.
    pub fn len(&self) -> usize {
        lock(&self.seeders).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn publish(&self, session: Arc<LoopbackSession>) {
        lock(&self.seeders).insert(session.handle.clone(), session);
    }

    fn lookup(&self, handle: &str) -> Option<Arc<LoopbackSession>> {
        lock(&self.seeders).get(handle).cloned()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// A client of a [`LoopbackSwarm`]. Disk stores are created under `store_root`.
pub struct LoopbackClient {
    swarm: LoopbackSwarm,
    store_root: PathBuf,
}

impl LoopbackClient {
    pub fn new(swarm: LoopbackSwarm, store_root: impl Into<PathBuf>) -> Self {
        Self {
            swarm,
            store_root: store_root.into(),
        }
    }

    pub fn swarm(&self) -> &LoopbackSwarm {
        &self.swarm
    }

    pub fn store_root(&self) -> &Path {
        &self.store_root
    }
}

impl Transport for LoopbackClient {
    type Session = LoopbackSession;

    async fn seed(
        &self,
        files: Vec<Arc<dyn FileLike>>,
        options: SessionOptions,
    ) -> Result<Arc<LoopbackSession>, TransportError> {
        let piece_length = match options.tuning.piece_length {
            0 => DEFAULT_PIECE_LENGTH,
            n => n,
        };
        let store = PieceStore::open(&options.store, &self.store_root).await?;
        let mut entries = Vec::with_capacity(files.len());
        for (index, file) in files.iter().enumerate() {
            match load_file(index, file.as_ref(), piece_length, &store).await {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    if let Err(cleanup) = store.destroy().await {
                        tracing::warn!(error = %cleanup, "failed to remove piece store");
                    }
                    return Err(e);
                }
            }
        }
        let manifest = Manifest {
            piece_length,
            files: entries,
        };
        let handle = manifest.handle()?;
        let total = manifest.total_length();
        let session = Arc::new(LoopbackSession::new(
            handle,
            manifest,
            store,
            DoneState::Complete,
            Some(Arc::downgrade(&self.swarm.seeders)),
        ));
        session.downloaded.store(total, Ordering::SeqCst);
        self.swarm.publish(session.clone());
        tracing::debug!(
            handle = %session.handle,
            files = files.len(),
            bytes = total,
            store = ?options.store,
            "seeding"
        );
        Ok(session)
    }

    async fn add(
        &self,
        handle: &str,
        options: SessionOptions,
    ) -> Result<Arc<LoopbackSession>, TransportError> {
        let source = self
            .swarm
            .lookup(handle)
            .ok_or_else(|| TransportError::NotFound(handle.to_string()))?;
        let store = PieceStore::open(&options.store, &self.store_root).await?;
        let session = Arc::new(LoopbackSession::new(
            handle.to_string(),
            source.manifest.clone(),
            store,
            DoneState::Pending,
            None,
        ));
        tracing::debug!(handle, store = ?options.store, "fetching");
        tokio::spawn(fetch(source, session.clone()));
        Ok(session)
    }
}

/// Open the file twice and drive both copies together: one is hashed, the other is
/// loaded into the store. Reading them in lockstep keeps the tee buffer small.
async fn load_file(
    index: usize,
    file: &dyn FileLike,
    piece_length: u64,
    store: &PieceStore,
) -> Result<ManifestFile, TransportError> {
    let hashing = pieces(file.open_stream()?, piece_length);
    let loading = pieces(file.open_stream()?, piece_length);

    let hash_all = hashing
        .map_ok(|piece| hash_piece(&piece))
        .try_collect::<Vec<_>>();
    let load_all = store_pieces(index, loading, store);
    let (hashes, length) = futures::try_join!(hash_all, load_all)?;

    if length != file.size() {
        return Err(TransportError::Corrupted(format!(
            "{}: declared {} bytes, read {}",
            file.name(),
            file.size(),
            length
        )));
    }
    Ok(ManifestFile {
        name: file.name().to_string(),
        length,
        content_type: file.content_type().to_string(),
        last_modified: file
            .last_modified()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0),
        pieces: hashes,
    })
}

async fn store_pieces(file: usize, mut stream: ByteStream, store: &PieceStore) -> io::Result<u64> {
    let mut index = 0u64;
    let mut length = 0u64;
    while let Some(piece) = stream.next().await {
        let piece = piece?;
        length += piece.len() as u64;
        store.put(PieceId { file, index }, piece).await?;
        index += 1;
    }
    Ok(length)
}

async fn fetch(source: Arc<LoopbackSession>, session: Arc<LoopbackSession>) {
    match fetch_pieces(&source, &session).await {
        Ok(()) => {
            tracing::debug!(handle = %session.handle, "payload complete");
            session.finish(DoneState::Complete);
        }
        Err(TransportError::Destroyed) => {}
        Err(e) => {
            tracing::warn!(handle = %session.handle, error = %e, "fetch failed");
            let reason = match e {
                TransportError::Corrupted(reason) => reason,
                other => other.to_string(),
            };
            session.finish(DoneState::Failed(reason));
        }
    }
}

async fn fetch_pieces(
    source: &LoopbackSession,
    session: &LoopbackSession,
) -> Result<(), TransportError> {
    for (file_index, file) in session.manifest.files.iter().enumerate() {
        for (piece_index, expected) in file.pieces.iter().enumerate() {
            if session.is_destroyed() {
                return Err(TransportError::Destroyed);
            }
            if source.is_destroyed() {
                return Err(TransportError::Corrupted("seeder left the swarm".into()));
            }
            let id = PieceId {
                file: file_index,
                index: piece_index as u64,
            };
            let data = source.store.get(id).await?;
            if !verify_piece(&data, expected) {
                return Err(TransportError::Corrupted(format!(
                    "piece {} of {} failed verification",
                    piece_index, file.name
                )));
            }
            let len = data.len() as u64;
            session.store.put(id, data).await?;
            session.record_progress(len);
            tokio::task::yield_now().await;
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DoneState {
    Pending,
    Complete,
    Failed(String),
    Destroyed,
}

/// A seeding or downloading session in a [`LoopbackSwarm`].
pub struct LoopbackSession {
    handle: String,
    manifest: Manifest,
    store: PieceStore,
    downloaded: AtomicU64,
    subscribers: Mutex<Vec<(SubscriptionId, ProgressCallback)>>,
    next_subscription: AtomicU64,
    done: watch::Sender<DoneState>,
    destroyed: AtomicBool,
    /// Set for seeders, so destroy can unpublish them.
    seeding: Option<Weak<Seeders>>,
}

impl LoopbackSession {
    fn new(
        handle: String,
        manifest: Manifest,
        store: PieceStore,
        state: DoneState,
        seeding: Option<Weak<Seeders>>,
    ) -> Self {
        let (done, _) = watch::channel(state);
        Self {
            handle,
            manifest,
            store,
            downloaded: AtomicU64::new(0),
            subscribers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(0),
            done,
            destroyed: AtomicBool::new(false),
            seeding,
        }
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn store(&self) -> &PieceStore {
        &self.store
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    fn record_progress(&self, bytes: u64) {
        let downloaded = self.downloaded.fetch_add(bytes, Ordering::SeqCst) + bytes;
        let progress = Progress {
            downloaded,
            total: self.manifest.total_length(),
        };
        let callbacks: Vec<ProgressCallback> = lock(&self.subscribers)
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for cb in callbacks {
            cb(progress);
        }
    }

    /// Publish the terminal state; the first one wins.
    fn finish(&self, state: DoneState) {
        self.done.send_if_modified(|current| {
            if *current == DoneState::Pending {
                *current = state;
                true
            } else {
                false
            }
        });
    }
}

impl Session for LoopbackSession {
    fn handle(&self) -> &str {
        &self.handle
    }

    fn files(&self) -> Vec<Arc<dyn FileLike>> {
        self.manifest
            .files
            .iter()
            .enumerate()
            .map(|(index, f)| {
                Arc::new(TorrentFile {
                    index,
                    name: f.name.clone(),
                    length: f.length,
                    content_type: f.content_type.clone(),
                    last_modified: UNIX_EPOCH + Duration::from_secs(f.last_modified),
                    pieces: f.pieces.len() as u64,
                    store: self.store.clone(),
                }) as Arc<dyn FileLike>
            })
            .collect()
    }

    fn progress(&self) -> Progress {
        Progress {
            downloaded: self.downloaded.load(Ordering::SeqCst),
            total: self.manifest.total_length(),
        }
    }

    fn on_progress(&self, callback: ProgressCallback) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::SeqCst));
        lock(&self.subscribers).push((id, callback));
        id
    }

    fn off_progress(&self, id: SubscriptionId) {
        lock(&self.subscribers).retain(|(sub, _)| *sub != id);
    }

    async fn done(&self) -> Result<(), TransportError> {
        let mut rx = self.done.subscribe();
        let state = {
            let current = rx
                .wait_for(|s| *s != DoneState::Pending)
                .await
                .map_err(|_| TransportError::Destroyed)?;
            current.clone()
        };
        match state {
            DoneState::Complete => Ok(()),
            DoneState::Failed(reason) => Err(TransportError::Corrupted(reason)),
            DoneState::Pending | DoneState::Destroyed => Err(TransportError::Destroyed),
        }
    }

    async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.finish(DoneState::Destroyed);
        if let Some(seeders) = self.seeding.as_ref().and_then(Weak::upgrade) {
            let mut published = lock(&seeders);
            if published
                .get(&self.handle)
                .is_some_and(|s| std::ptr::eq(Arc::as_ptr(s), self))
            {
                published.remove(&self.handle);
            }
        }
        lock(&self.subscribers).clear();
        if let Err(e) = self.store.destroy().await {
            tracing::warn!(handle = %self.handle, error = %e, "failed to remove piece store");
        }
        tracing::debug!(handle = %self.handle, "session destroyed");
    }
}

/// A file inside a session, read piece by piece from the session's store.
struct TorrentFile {
    index: usize,
    name: String,
    length: u64,
    content_type: String,
    last_modified: SystemTime,
    pieces: u64,
    store: PieceStore,
}

impl FileLike for TorrentFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.length
    }

    fn content_type(&self) -> &str {
        &self.content_type
    }

    fn last_modified(&self) -> SystemTime {
        self.last_modified
    }

    fn open_stream(&self) -> io::Result<ByteStream> {
        let store = self.store.clone();
        let file = self.index;
        let stream = futures::stream::iter(0..self.pieces).then(move |index| {
            let store = store.clone();
            async move { store.get(PieceId { file, index }).await }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::MemoryFile;
    use crate::pool::read_to_end;
    use crate::transport::{StoreBackend, TransportTuning};
    use std::sync::atomic::AtomicUsize;

    fn options(store: StoreBackend, piece_length: u64) -> SessionOptions {
        SessionOptions {
            store,
            tuning: TransportTuning {
                announce: Vec::new(),
                piece_length,
            },
        }
    }

    fn files(entries: &[(&str, Vec<u8>)]) -> Vec<Arc<dyn FileLike>> {
        entries
            .iter()
            .map(|(name, data)| Arc::new(MemoryFile::new(*name, data.clone())) as Arc<dyn FileLike>)
            .collect()
    }

    /// Claims a size it does not have.
    struct LyingFile(MemoryFile);

    impl FileLike for LyingFile {
        fn name(&self) -> &str {
            self.0.name()
        }
        fn size(&self) -> u64 {
            self.0.size() + 1
        }
        fn content_type(&self) -> &str {
            self.0.content_type()
        }
        fn last_modified(&self) -> SystemTime {
            self.0.last_modified()
        }
        fn open_stream(&self) -> io::Result<ByteStream> {
            self.0.open_stream()
        }
    }

    #[tokio::test]
    async fn seed_then_add_delivers_every_file() {
        let swarm = LoopbackSwarm::new();
        let root = tempfile::tempdir().unwrap();
        let seeder = LoopbackClient::new(swarm.clone(), root.path());
        let leecher = LoopbackClient::new(swarm.clone(), root.path());

        let data: Vec<u8> = (0..100u8).collect();
        let seeded = seeder
            .seed(
                files(&[("a.bin", data.clone()), ("empty", Vec::new())]),
                options(StoreBackend::Memory, 16),
            )
            .await
            .unwrap();
        assert!(seeded.handle().starts_with(crate::integrity::HANDLE_PREFIX));
        assert_eq!(swarm.len(), 1);
        seeded.done().await.unwrap();

        let session = leecher
            .add(seeded.handle(), options(StoreBackend::default(), 16))
            .await
            .unwrap();
        session.done().await.unwrap();
        assert_eq!(session.progress().downloaded, 100);

        let received = session.files();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].name(), "a.bin");
        assert_eq!(received[0].size(), 100);
        assert_eq!(read_to_end(received[0].open_stream().unwrap()).await.unwrap(), data);
        assert_eq!(received[1].size(), 0);
        assert!(read_to_end(received[1].open_stream().unwrap()).await.unwrap().is_empty());

        session.destroy().await;
        seeded.destroy().await;
    }

    #[tokio::test]
    async fn unknown_handle_is_not_found() {
        let client = LoopbackClient::new(LoopbackSwarm::new(), std::env::temp_dir());
        let err = client
            .add("magnet:?xt=urn:btih:00", options(StoreBackend::Memory, 16))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::NotFound(_)));
    }

    #[tokio::test]
    async fn declared_size_mismatch_is_corruption() {
        let client = LoopbackClient::new(LoopbackSwarm::new(), std::env::temp_dir());
        let liar: Arc<dyn FileLike> = Arc::new(LyingFile(MemoryFile::new("x", b"abc".to_vec())));
        let err = client
            .seed(vec![liar], options(StoreBackend::Memory, 16))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Corrupted(_)));
        assert!(client.swarm().is_empty());
    }

    #[tokio::test]
    async fn destroying_seeder_unpublishes_handle() {
        let swarm = LoopbackSwarm::new();
        let client = LoopbackClient::new(swarm.clone(), std::env::temp_dir());
        let seeded = client
            .seed(files(&[("a", b"abc".to_vec())]), options(StoreBackend::Memory, 16))
            .await
            .unwrap();
        let handle = seeded.handle().to_string();
        seeded.destroy().await;
        seeded.destroy().await;
        assert!(swarm.is_empty());
        let err = client
            .add(&handle, options(StoreBackend::Memory, 16))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::NotFound(_)));
    }

    #[tokio::test]
    async fn progress_subscribers_are_notified_until_detached() {
        let swarm = LoopbackSwarm::new();
        let client = LoopbackClient::new(swarm, std::env::temp_dir());
        let data = vec![9u8; 64];
        let seeded = client
            .seed(files(&[("a", data.clone())]), options(StoreBackend::Memory, 16))
            .await
            .unwrap();

        let session = client
            .add(seeded.handle(), options(StoreBackend::Memory, 16))
            .await
            .unwrap();
        let events = Arc::new(AtomicUsize::new(0));
        let counter = events.clone();
        let id = session.on_progress(Arc::new(move |p: Progress| {
            assert!(p.downloaded <= p.total);
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        session.done().await.unwrap();
        assert_eq!(events.load(Ordering::SeqCst), 4);
        session.off_progress(id);
        assert_eq!(session.progress().fraction(), 1.0);
    }

    #[tokio::test]
    async fn destroy_interrupts_pending_download() {
        let swarm = LoopbackSwarm::new();
        let client = LoopbackClient::new(swarm, std::env::temp_dir());
        let seeded = client
            .seed(files(&[("a", vec![1u8; 256])]), options(StoreBackend::Memory, 16))
            .await
            .unwrap();
        let session = client
            .add(seeded.handle(), options(StoreBackend::Memory, 16))
            .await
            .unwrap();
        session.destroy().await;
        assert!(matches!(session.done().await, Err(TransportError::Destroyed)));
    }

    #[tokio::test]
    async fn seeder_leaving_fails_the_download_once() {
        let swarm = LoopbackSwarm::new();
        let client = LoopbackClient::new(swarm, std::env::temp_dir());
        let seeded = client
            .seed(files(&[("a", vec![3u8; 256])]), options(StoreBackend::Memory, 16))
            .await
            .unwrap();
        let session = client
            .add(seeded.handle(), options(StoreBackend::Memory, 16))
            .await
            .unwrap();
        seeded.destroy().await;

        let err = session.done().await.unwrap_err();
        match &err {
            TransportError::Corrupted(reason) => assert_eq!(reason, "seeder left the swarm"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.to_string(), "corrupted session: seeder left the swarm");
    }

    #[tokio::test]
    async fn disk_store_is_removed_on_destroy() {
        let root = tempfile::tempdir().unwrap();
        let client = LoopbackClient::new(LoopbackSwarm::new(), root.path());
        let seeded = client
            .seed(files(&[("a", b"on disk".to_vec())]), options(StoreBackend::default(), 4))
            .await
            .unwrap();
        let dir = seeded.store().dir().unwrap().to_path_buf();
        assert!(dir.exists());
        seeded.destroy().await;
        assert!(!dir.exists());
    }
}
