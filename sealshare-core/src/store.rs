//! Piece stores: split file streams into fixed-size pieces and keep them in memory or
//! on disk for the lifetime of a transport session.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;

use crate::pool::ByteStream;
use crate::transport::StoreBackend;

/// Default piece length in bytes.
pub const DEFAULT_PIECE_LENGTH: u64 = 256 * 1024; // 256 KiB

/// Piece identifier: file index within the session + piece index within the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PieceId {
    pub file: usize,
    pub index: u64,
}

/// Regroup `source` into pieces of exactly `piece_length` bytes (the last may be shorter).
/// An empty source yields no pieces.
pub fn pieces(source: ByteStream, piece_length: u64) -> ByteStream {
    let size = if piece_length == 0 {
        DEFAULT_PIECE_LENGTH
    } else {
        piece_length
    } as usize;
    let state = (source, BytesMut::new(), false);
    futures::stream::unfold(state, move |(mut source, mut buffer, mut done)| async move {
        while !done && buffer.len() < size {
            match source.next().await {
                Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                Some(Err(e)) => return Some((Err(e), (source, buffer, true))),
                None => done = true,
            }
        }
        if buffer.is_empty() {
            return None;
        }
        let piece = buffer.split_to(buffer.len().min(size)).freeze();
        Some((Ok(piece), (source, buffer, done)))
    })
    .boxed()
}

/// Per-session piece storage. Cheap to clone; clones share the same pieces.
#[derive(Clone)]
pub enum PieceStore {
    Memory(Arc<MemoryPieces>),
    Disk(Arc<DiskStore>),
}

/// One file per piece under a session-private directory.
#[derive(Debug)]
pub struct DiskStore {
    dir: PathBuf,
    destroy_on_close: bool,
}

impl PieceStore {
    /// Open a store for `backend`. Disk stores get a fresh directory under `root`.
    pub async fn open(backend: &StoreBackend, root: &Path) -> io::Result<Self> {
        match backend {
            StoreBackend::Memory => Ok(PieceStore::Memory(Arc::default())),
            StoreBackend::Disk { destroy_on_close } => {
                let dir = root.join(uuid::Uuid::new_v4().to_string());
                tokio::fs::create_dir_all(&dir).await?;
                Ok(PieceStore::Disk(Arc::new(DiskStore {
                    dir,
                    destroy_on_close: *destroy_on_close,
                })))
            }
        }
    }

    pub fn backend(&self) -> StoreBackend {
        match self {
            PieceStore::Memory(_) => StoreBackend::Memory,
            PieceStore::Disk(disk) => StoreBackend::Disk {
                destroy_on_close: disk.destroy_on_close,
            },
        }
    }

    /// Directory of a disk store.
    pub fn dir(&self) -> Option<&Path> {
        match self {
            PieceStore::Memory(_) => None,
            PieceStore::Disk(disk) => Some(&disk.dir),
        }
    }

    pub async fn put(&self, id: PieceId, data: Bytes) -> io::Result<()> {
        match self {
            PieceStore::Memory(pieces) => {
                memory_pieces(pieces).insert(id, data);
                Ok(())
            }
            PieceStore::Disk(disk) => tokio::fs::write(disk.piece_path(id), &data).await,
        }
    }

    pub async fn get(&self, id: PieceId) -> io::Result<Bytes> {
        match self {
            PieceStore::Memory(pieces) => memory_get(pieces, id),
            PieceStore::Disk(disk) => match tokio::fs::read(disk.piece_path(id)).await {
                Ok(data) => Ok(Bytes::from(data)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Err(missing(id)),
                Err(e) => Err(e),
            },
        }
    }

    /// Release the store. Memory pieces are dropped; a disk directory is removed only
    /// when the store was opened with `destroy_on_close`.
    pub async fn destroy(&self) -> io::Result<()> {
        match self {
            PieceStore::Memory(pieces) => {
                memory_pieces(pieces).clear();
                Ok(())
            }
            PieceStore::Disk(disk) if disk.destroy_on_close => {
                match tokio::fs::remove_dir_all(&disk.dir).await {
                    Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
                    _ => Ok(()),
                }
            }
            PieceStore::Disk(_) => Ok(()),
        }
    }
}

impl DiskStore {
    fn piece_path(&self, id: PieceId) -> PathBuf {
        self.dir.join(format!("{}-{}.piece", id.file, id.index))
    }
}

pub type MemoryPieces = Mutex<HashMap<PieceId, Bytes>>;

// Guards stay inside these sync helpers so store futures remain `Send`.
fn memory_pieces(pieces: &MemoryPieces) -> MutexGuard<'_, HashMap<PieceId, Bytes>> {
    pieces.lock().unwrap_or_else(|e| e.into_inner())
}

fn memory_get(pieces: &MemoryPieces, id: PieceId) -> io::Result<Bytes> {
    memory_pieces(pieces)
        .get(&id)
        .cloned()
        .ok_or_else(|| missing(id))
}

fn missing(id: PieceId) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("piece {} of file {} is not in the store", id.index, id.file),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::read_to_end;

    fn source(data: &[u8], chunk: usize) -> ByteStream {
        let parts: Vec<io::Result<Bytes>> = data
            .chunks(chunk)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        futures::stream::iter(parts).boxed()
    }

    #[tokio::test]
    async fn regroup_into_fixed_pieces() {
        let data: Vec<u8> = (0..100u8).collect();
        let mut stream = pieces(source(&data, 7), 30);
        let mut lens = Vec::new();
        let mut joined = Vec::new();
        while let Some(piece) = stream.next().await {
            let piece = piece.unwrap();
            lens.push(piece.len());
            joined.extend_from_slice(&piece);
        }
        assert_eq!(lens, vec![30, 30, 30, 10]);
        assert_eq!(joined, data);
    }

    #[tokio::test]
    async fn empty_source_has_no_pieces() {
        let stream = pieces(source(&[], 7), 30);
        assert!(read_to_end(stream).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_store_put_get() {
        let store = PieceStore::open(&StoreBackend::Memory, Path::new("/nonexistent"))
            .await
            .unwrap();
        let id = PieceId { file: 0, index: 3 };
        assert_eq!(store.get(id).await.unwrap_err().kind(), io::ErrorKind::NotFound);
        store.put(id, Bytes::from_static(b"piece")).await.unwrap();
        assert_eq!(store.get(id).await.unwrap(), Bytes::from_static(b"piece"));
        store.destroy().await.unwrap();
        assert!(store.get(id).await.is_err());
    }

    #[tokio::test]
    async fn disk_store_destroy_removes_directory() {
        let root = tempfile::tempdir().unwrap();
        let backend = StoreBackend::Disk {
            destroy_on_close: true,
        };
        let store = PieceStore::open(&backend, root.path()).await.unwrap();
        let dir = store.dir().unwrap().to_path_buf();
        let id = PieceId { file: 1, index: 0 };
        store.put(id, Bytes::from_static(b"on disk")).await.unwrap();
        assert_eq!(store.get(id).await.unwrap(), Bytes::from_static(b"on disk"));
        assert!(dir.exists());
        store.destroy().await.unwrap();
        assert!(!dir.exists());
        // Idempotent.
        store.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn disk_store_kept_without_destroy_on_close() {
        let root = tempfile::tempdir().unwrap();
        let backend = StoreBackend::Disk {
            destroy_on_close: false,
        };
        let store = PieceStore::open(&backend, root.path()).await.unwrap();
        assert_eq!(store.backend(), backend);
        store.destroy().await.unwrap();
        assert!(store.dir().unwrap().exists());
    }
}
