use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

/// An item on the streaming poll queue. `EndOfStream` is distinct from an
/// empty text delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseChunk {
    Text(String),
    EndOfStream,
}

/// Queue that streaming turns feed and external consumers poll, in arrival order.
pub struct ChunkQueue {
    tx: Sender<ResponseChunk>,
    rx: Receiver<ResponseChunk>,
}

impl ChunkQueue {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    pub fn push_text(&self, text: impl Into<String>) {
        // Both ends live in `self`, so the channel cannot be disconnected.
        let _ = self.tx.send(ResponseChunk::Text(text.into()));
    }

    pub fn finish(&self) {
        let _ = self.tx.send(ResponseChunk::EndOfStream);
    }

    /// Drops everything not yet read and returns how many chunks were removed.
    pub fn discard_pending(&self) -> usize {
        self.rx.try_iter().count()
    }

    /// Waits up to `timeout` for the next chunk; `None` when nothing arrived.
    pub fn next(&self, timeout: Duration) -> Option<ResponseChunk> {
        match self.rx.recv_timeout(timeout) {
            Ok(chunk) => Some(chunk),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Default for ChunkQueue {
    fn default() -> Self {
        Self::new()
    }
}
