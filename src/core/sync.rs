// src/core/sync.rs

//! Async critical-section primitives: a FIFO counting semaphore with split
//! acquire/release, and the striped per-channel lock array.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::core::protocol::ChannelName;

/// Number of stripes in the per-channel lock array. Operations on one channel
/// always hash onto the same stripe; unrelated channels sharing a stripe is
/// acceptable because per-channel critical sections are short.
pub const CHANNEL_LOCK_STRIPES: usize = 50;

/// A FIFO counting semaphore whose permits may be released from a different
/// task or call chain than the one that acquired them.
///
/// `acquire` suspends until a permit is free; waiters are woken in arrival
/// order. With a single permit this forms an async mutex whose critical
/// section may span suspension points, which no blocking mutex allows.
#[derive(Debug)]
pub struct AsyncSemaphore {
    inner: Semaphore,
}

impl AsyncSemaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            inner: Semaphore::new(permits),
        }
    }

    /// Waits for a permit. The permit is detached from the returned future:
    /// it stays taken until a matching [`release`](Self::release).
    pub async fn acquire(&self) {
        match self.inner.acquire().await {
            Ok(permit) => permit.forget(),
            // Acquisition only fails on a closed semaphore, and this wrapper
            // never closes it.
            Err(_) => unreachable!("AsyncSemaphore is never closed"),
        }
    }

    /// Returns a permit, waking the longest-waiting acquirer if any.
    pub fn release(&self) {
        self.inner.add_permits(1);
    }

    /// Acquires a permit that is returned automatically when the guard is
    /// dropped at the end of the critical section.
    pub async fn acquire_guard(self: &Arc<Self>) -> SemaphoreGuard {
        self.acquire().await;
        SemaphoreGuard {
            sem: Arc::clone(self),
        }
    }

    pub fn available_permits(&self) -> usize {
        self.inner.available_permits()
    }
}

/// RAII handle for a permit taken via [`AsyncSemaphore::acquire_guard`].
#[derive(Debug)]
pub struct SemaphoreGuard {
    sem: Arc<AsyncSemaphore>,
}

impl Drop for SemaphoreGuard {
    fn drop(&mut self) {
        self.sem.release();
    }
}

/// A fixed array of single-permit semaphores indexed by channel hash. All
/// work affecting a single channel serializes on its stripe, which avoids
/// allocating a lock per channel when channels are legion.
#[derive(Debug)]
pub struct StripedLocks {
    stripes: Vec<Arc<AsyncSemaphore>>,
}

impl StripedLocks {
    pub fn new(count: usize) -> Self {
        Self {
            stripes: (0..count).map(|_| Arc::new(AsyncSemaphore::new(1))).collect(),
        }
    }

    /// The stripe serializing all work on `channel`.
    pub fn stripe_for(&self, channel: &ChannelName) -> Arc<AsyncSemaphore> {
        let mut hasher = DefaultHasher::new();
        channel.hash(&mut hasher);
        let idx = (hasher.finish() % self.stripes.len() as u64) as usize;
        Arc::clone(&self.stripes[idx])
    }

    pub fn len(&self) -> usize {
        self.stripes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stripes.is_empty()
    }
}

impl Default for StripedLocks {
    fn default() -> Self {
        Self::new(CHANNEL_LOCK_STRIPES)
    }
}
