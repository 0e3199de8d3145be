//! Bounded stdout/stderr capture.
//!
//! A collector drains one pipe into a buffer capped at a fixed size. Bytes
//! past the cap are read and discarded, so a chatty program never stalls on
//! a full pipe and still finishes (or hits its wall budget) on its own terms.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tracing::debug;

const READ_CHUNK: usize = 8 * 1024;

/// Bytes captured from one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captured {
    pub bytes: Vec<u8>,
    /// The stream produced more than the cap.
    pub overflowed: bool,
}

#[derive(Debug)]
struct CaptureBuffer {
    bytes: Vec<u8>,
    cap: usize,
    total: u64,
}

impl CaptureBuffer {
    const fn new(cap: usize) -> Self {
        Self {
            bytes: Vec::new(),
            cap,
            total: 0,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let room = self.cap.saturating_sub(self.bytes.len());
        let keep = room.min(chunk.len());
        self.bytes.extend_from_slice(&chunk[..keep]);
        self.total += chunk.len() as u64;
    }

    fn take(&mut self) -> Captured {
        let overflowed = self.total > self.bytes.len() as u64;
        Captured {
            bytes: std::mem::take(&mut self.bytes),
            overflowed,
        }
    }
}

fn lock(buffer: &Mutex<CaptureBuffer>) -> MutexGuard<'_, CaptureBuffer> {
    buffer.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Background task draining a pipe into a capped buffer.
#[derive(Debug)]
pub struct OutputCollector {
    buffer: Arc<Mutex<CaptureBuffer>>,
    task: JoinHandle<()>,
}

impl OutputCollector {
    /// Start draining `reader`, keeping at most `cap` bytes.
    pub fn spawn<R>(mut reader: R, cap: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(CaptureBuffer::new(cap)));
        let sink = Arc::clone(&buffer);

        let task = tokio::spawn(async move {
            let mut chunk = vec![0u8; READ_CHUNK];
            loop {
                match reader.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => lock(&sink).push(&chunk[..n]),
                    Err(e) => {
                        debug!(error = %e, "Output stream read failed");
                        break;
                    }
                }
            }
        });

        Self { buffer, task }
    }

    /// Wait up to `grace` for the stream to reach EOF, then return whatever
    /// was captured. A stream still open after `grace` (a stray grandchild
    /// holding the pipe) is abandoned.
    pub async fn finish(self, grace: Duration) -> Captured {
        let Self { buffer, mut task } = self;
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            debug!("Output stream still open after grace period, abandoning");
            task.abort();
        }
        let captured = lock(&buffer).take();
        captured
    }
}
