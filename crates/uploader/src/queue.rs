use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use chunkferry_transfer::ChunkSpan;

/// Chunks still waiting for a transfer connection, shared by the pool.
#[derive(Debug, Clone, Default)]
pub struct ChunkQueue {
    inner: Arc<Mutex<VecDeque<ChunkSpan>>>,
}

impl ChunkQueue {
    pub fn new(spans: impl IntoIterator<Item = ChunkSpan>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(spans.into_iter().collect())),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Takes the next chunk. Unless [`Claim::complete`] is called the chunk
    /// returns to the front of the queue when the claim is dropped.
    pub fn claim(&self) -> Option<Claim> {
        let span = self.lock().pop_front()?;
        Some(Claim {
            span,
            queue: self.clone(),
            done: false,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<ChunkSpan>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A chunk checked out of a [`ChunkQueue`].
#[derive(Debug)]
pub struct Claim {
    span: ChunkSpan,
    queue: ChunkQueue,
    done: bool,
}

impl Claim {
    pub fn span(&self) -> ChunkSpan {
        self.span
    }

    /// Marks the chunk as stored on the server.
    pub fn complete(mut self) {
        self.done = true;
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if !self.done {
            self.queue.lock().push_front(self.span);
        }
    }
}
