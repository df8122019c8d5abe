//! Saving received files: a sink factory and the stream-to-sink pump.

use std::io;
use std::path::{Path, PathBuf};

use futures::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::pool::ByteStream;

/// Creates a writable sink for a received file.
#[allow(async_fn_in_trait)]
pub trait DiskSaver: Send + Sync {
    type Sink: AsyncWrite + Unpin + Send;

    async fn create(&self, name: &str, size: u64) -> io::Result<Self::Sink>;
}

/// Writes received files into one directory.
#[derive(Debug, Clone)]
pub struct DirectorySaver {
    dir: PathBuf,
    stream_relay: Option<String>,
}

impl DirectorySaver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            stream_relay: None,
        }
    }

    /// Relay endpoint for hosts that stream saves through a helper instead of writing directly.
    pub fn with_stream_relay(mut self, relay: Option<String>) -> Self {
        self.stream_relay = relay;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn stream_relay(&self) -> Option<&str> {
        self.stream_relay.as_deref()
    }

    /// Target path for `name`; directory components are dropped.
    pub fn target(&self, name: &str) -> io::Result<PathBuf> {
        let base = Path::new(name)
            .file_name()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("no file name in {:?}", name),
                )
            })?;
        Ok(self.dir.join(base))
    }
}

impl DiskSaver for DirectorySaver {
    type Sink = tokio::fs::File;

    async fn create(&self, name: &str, size: u64) -> io::Result<tokio::fs::File> {
        let path = self.target(name)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        tracing::debug!(
            path = %path.display(),
            size,
            relay = self.stream_relay.as_deref().unwrap_or("none"),
            "saving"
        );
        tokio::fs::File::create(&path).await
    }
}

/// Copy every chunk of `stream` into `sink`, then shut the sink down. Returns bytes written.
pub async fn pipe<W>(mut stream: ByteStream, sink: &mut W) -> io::Result<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        sink.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    sink.shutdown().await?;
    Ok(written)
}
