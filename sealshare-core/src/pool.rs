//! Byte streams, fan-out tee and the FIFO stream pool.
//!
//! A source stream is single-read. When a consumer needs to open the same logical stream
//! more than once, the source is split ahead of time into N equivalent branches; each
//! branch is handed out once, in order. Chunks are shared (`Bytes`), so a branch that
//! falls behind only holds references to chunks the others already pulled.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt};

/// Single-read stream of byte chunks. Errors travel in-band.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Error returned when a pooled stream is requested more times than provisioned.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("stream pool exhausted: all {0} streams already opened")]
    Exhausted(usize),
}

/// Split `source` into `n` equivalent streams. Nothing is read until a branch is polled.
pub fn tee(source: ByteStream, n: usize) -> Vec<ByteStream> {
    let shared = Arc::new(Mutex::new(TeeState {
        source: Some(source),
        branches: (0..n).map(|_| BranchState::default()).collect(),
    }));
    (0..n)
        .map(|index| {
            TeeBranch {
                shared: shared.clone(),
                index,
            }
            .boxed()
        })
        .collect()
}

/// Drain a stream into memory. For tests and small payloads only.
pub async fn read_to_end(mut stream: ByteStream) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}

struct TeeState {
    /// `None` once the source has ended.
    source: Option<ByteStream>,
    branches: Vec<BranchState>,
}

#[derive(Default)]
struct BranchState {
    queue: VecDeque<io::Result<Bytes>>,
    waker: Option<Waker>,
    closed: bool,
}

struct TeeBranch {
    shared: Arc<Mutex<TeeState>>,
    index: usize,
}

impl TeeBranch {
    fn state(&self) -> MutexGuard<'_, TeeState> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn duplicate(item: &io::Result<Bytes>) -> io::Result<Bytes> {
    match item {
        Ok(chunk) => Ok(chunk.clone()),
        Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
    }
}

impl Stream for TeeBranch {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let index = self.index;
        let mut state = self.state();
        if let Some(item) = state.branches[index].queue.pop_front() {
            return Poll::Ready(Some(item));
        }
        let Some(source) = state.source.as_mut() else {
            return Poll::Ready(None);
        };
        match source.poll_next_unpin(cx) {
            Poll::Ready(Some(item)) => {
                for (other, branch) in state.branches.iter_mut().enumerate() {
                    if other == index || branch.closed {
                        continue;
                    }
                    branch.queue.push_back(duplicate(&item));
                    if let Some(waker) = branch.waker.take() {
                        waker.wake();
                    }
                }
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => {
                state.source = None;
                for branch in state.branches.iter_mut() {
                    if let Some(waker) = branch.waker.take() {
                        waker.wake();
                    }
                }
                Poll::Ready(None)
            }
            Poll::Pending => {
                // The source only remembers the last waker; whichever branch is woken
                // re-polls it and wakes the rest when data arrives.
                state.branches[index].waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl Drop for TeeBranch {
    fn drop(&mut self) {
        let index = self.index;
        let waiting: Vec<Waker> = {
            let mut state = self.state();
            let branch = &mut state.branches[index];
            branch.closed = true;
            branch.queue.clear();
            branch.waker = None;
            // The source may hold this branch's waker; hand the wakeup to the survivors.
            state
                .branches
                .iter_mut()
                .filter(|b| !b.closed)
                .filter_map(|b| b.waker.take())
                .collect()
        };
        for waker in waiting {
            waker.wake();
        }
    }
}

/// Pre-split set of equivalent streams, handed out FIFO, each at most once.
pub struct StreamPool {
    streams: Mutex<VecDeque<ByteStream>>,
    capacity: usize,
}

impl StreamPool {
    /// Tee `source` into `capacity` streams.
    pub fn split(source: ByteStream, capacity: usize) -> Self {
        Self {
            streams: Mutex::new(tee(source, capacity).into()),
            capacity,
        }
    }

    /// Take the next stream. Fails once every stream has been handed out.
    pub fn take(&self) -> Result<ByteStream, PoolError> {
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .ok_or(PoolError::Exhausted(self.capacity))
    }

    /// Streams not yet handed out.
    pub fn remaining(&self) -> usize {
        self.streams.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
