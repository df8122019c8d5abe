//! The file capability set shared by local files, transport files and projections.

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use tokio_util::io::ReaderStream;

use crate::pool::ByteStream;

/// Content type used when nothing better is known.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Minimal file surface: anything coded against this works unchanged with real,
/// received or projected files.
pub trait FileLike: Send + Sync {
    fn name(&self) -> &str;
    /// Length in bytes of what `open_stream` yields.
    fn size(&self) -> u64;
    fn content_type(&self) -> &str;
    fn last_modified(&self) -> SystemTime;
    /// Open the file's contents as a byte stream.
    fn open_stream(&self) -> io::Result<ByteStream>;
}

/// A file on local disk. Opened lazily: `open_stream` only touches the disk when polled.
#[derive(Debug, Clone)]
pub struct LocalFile {
    path: PathBuf,
    name: String,
    size: u64,
    content_type: String,
    last_modified: SystemTime,
}

impl LocalFile {
    /// Stat `path` and capture its metadata.
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let meta = tokio::fs::metadata(&path).await?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            content_type: guess_content_type(&name).to_string(),
            name,
            size: meta.len(),
            last_modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            path,
        })
    }

    /// Override the guessed content type.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FileLike for LocalFile {
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
        let path = self.path.clone();
        let stream = futures::stream::once(async move { tokio::fs::File::open(path).await })
            .map_ok(ReaderStream::new)
            .try_flatten();
        Ok(stream.boxed())
    }
}

/// A file held in memory. Re-openable any number of times.
#[derive(Debug, Clone)]
pub struct MemoryFile {
    name: String,
    data: Bytes,
    content_type: String,
    last_modified: SystemTime,
}

impl MemoryFile {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let name = name.into();
        Self {
            content_type: guess_content_type(&name).to_string(),
            name,
            data: data.into(),
            last_modified: SystemTime::now(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }
}

impl FileLike for MemoryFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn content_type(&self) -> &str {
        &self.content_type
    }

    fn last_modified(&self) -> SystemTime {
        self.last_modified
    }

    fn open_stream(&self) -> io::Result<ByteStream> {
        let data = self.data.clone();
        let chunks = if data.is_empty() { vec![] } else { vec![Ok(data)] };
        Ok(futures::stream::iter(chunks).boxed())
    }
}

/// Content type from the file extension; octet-stream when unknown.
pub fn guess_content_type(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" => "text/plain",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "zip" => "application/zip",
        "mp4" => "video/mp4",
        _ => OCTET_STREAM,
    }
}
