// src/core/pubsub/shard_pool.rs

//! Per-shard bookkeeping: the FIFO of connection entries that still have
//! free subscription slots, and the set of channels hosted on the shard.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::protocol::ChannelName;
use crate::core::pubsub::entry::ConnectionEntry;

/// Mutated only under the service's free-pool lock; the inner mutexes exist
/// for memory safety, not for coordination.
#[derive(Default)]
pub struct ShardPool {
    keys: Mutex<HashSet<ChannelName>>,
    free_entries: Mutex<VecDeque<Arc<ConnectionEntry>>>,
}

impl ShardPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Head of the free queue, without removing it.
    pub(crate) fn peek_free(&self) -> Option<Arc<ConnectionEntry>> {
        self.free_entries.lock().front().cloned()
    }

    /// Appends an entry to the free queue unless it is already queued.
    pub(crate) fn push_free(&self, entry: Arc<ConnectionEntry>) {
        let mut queue = self.free_entries.lock();
        if !queue.iter().any(|e| Arc::ptr_eq(e, &entry)) {
            queue.push_back(entry);
        }
    }

    /// Removes an entry from the free queue, wherever it sits.
    pub(crate) fn remove_free(&self, entry: &Arc<ConnectionEntry>) {
        self.free_entries.lock().retain(|e| !Arc::ptr_eq(e, entry));
    }

    pub(crate) fn add_key(&self, channel: ChannelName) {
        self.keys.lock().insert(channel);
    }

    pub(crate) fn remove_key(&self, channel: &ChannelName) {
        self.keys.lock().remove(channel);
    }

    /// Channels currently hosted on this shard.
    pub fn hosted_channels(&self) -> Vec<ChannelName> {
        self.keys.lock().iter().cloned().collect()
    }

    pub fn hosted_channel_count(&self) -> usize {
        self.keys.lock().len()
    }

    pub fn free_entry_count(&self) -> usize {
        self.free_entries.lock().len()
    }
}
