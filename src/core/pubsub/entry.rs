// src/core/pubsub/entry.rs

//! A pooled pub/sub connection and the per-channel subscription state
//! multiplexed onto it.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::core::SubMuxError;
use crate::core::cluster::ShardId;
use crate::core::connection::{ConnectionEvent, PubSubConnection};
use crate::core::protocol::{ChannelName, Codec, SubscriptionKind};
use crate::core::pubsub::listener::Listener;

/// Progress of one protocol exchange on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckState {
    Pending,
    Acked,
    Aborted,
}

/// A shared, one-shot view of a pending acknowledgement. Any number of
/// subscribers may wait on the same exchange; all of them resolve when the
/// matching status frame arrives.
#[derive(Debug, Clone)]
pub struct SubscribeAck {
    rx: watch::Receiver<AckState>,
}

impl SubscribeAck {
    /// Resolves when the matching status acknowledgement arrives. Fails if
    /// the exchange was rolled back before being acknowledged, or if the
    /// owning entry was dropped.
    pub async fn wait(&mut self) -> Result<(), SubMuxError> {
        loop {
            let state = *self.rx.borrow();
            match state {
                AckState::Acked => return Ok(()),
                AckState::Aborted => {
                    return Err(SubMuxError::WireFailure(
                        "subscription attempt aborted before acknowledgement".to_string(),
                    ));
                }
                AckState::Pending => {}
            }
            if self.rx.changed().await.is_err() {
                return Err(SubMuxError::WireFailure(
                    "connection entry dropped before acknowledgement".to_string(),
                ));
            }
        }
    }
}

/// Wraps one physical pub/sub connection, accounting its subscription slots
/// and owning the listener lists of every channel it hosts.
///
/// Slot invariant: `free_slots == capacity - hosted channels`, counting both
/// literal and pattern subscriptions. Slots are claimed under the service's
/// free-pool lock, before the entry is handed out, so the capacity cap can
/// never be exceeded.
pub struct ConnectionEntry {
    conn: Arc<dyn PubSubConnection>,
    shard: ShardId,
    capacity: u32,
    free_slots: AtomicI32,
    /// Literal subscriptions the backend currently holds on this connection.
    channels: Mutex<HashMap<ChannelName, Codec>>,
    /// Pattern subscriptions, keyed by the pattern name.
    pattern_channels: Mutex<HashMap<ChannelName, Codec>>,
    listeners: Mutex<HashMap<ChannelName, Vec<Listener>>>,
    acks: Mutex<HashMap<(ChannelName, SubscriptionKind), watch::Sender<AckState>>>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionEntry {
    pub(crate) fn new(conn: Arc<dyn PubSubConnection>, shard: ShardId, capacity: u32) -> Arc<Self> {
        Arc::new(Self {
            conn,
            shard,
            capacity,
            free_slots: AtomicI32::new(capacity as i32),
            channels: Mutex::new(HashMap::new()),
            pattern_channels: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            acks: Mutex::new(HashMap::new()),
            dispatch: Mutex::new(None),
        })
    }

    /// Starts the dispatch task that drains the connection's inbound events.
    ///
    /// Called only once the entry has won its registry slot; an entry that
    /// lost the installation race never consumes the connection's event
    /// stream, so the stream survives the connection's return to the pool.
    pub(crate) fn spawn_dispatch(self: &Arc<Self>) {
        if let Some(events) = self.conn.take_events() {
            let handle = tokio::spawn(dispatch(Arc::downgrade(self), events));
            *self.dispatch.lock() = Some(handle);
        }
    }

    pub fn connection(&self) -> Arc<dyn PubSubConnection> {
        Arc::clone(&self.conn)
    }

    pub fn connection_id(&self) -> u64 {
        self.conn.id()
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn free_slots(&self) -> i32 {
        self.free_slots.load(Ordering::Acquire)
    }

    /// Total channels (literal and pattern) currently hosted.
    pub fn channel_count(&self) -> usize {
        self.channels.lock().len() + self.pattern_channels.lock().len()
    }

    /// Claims one subscription slot. Returns the number of free slots left
    /// after the claim, or -1 when the entry is exhausted.
    pub(crate) fn try_acquire(&self) -> i32 {
        let mut current = self.free_slots.load(Ordering::Acquire);
        loop {
            if current <= 0 {
                return -1;
            }
            match self.free_slots.compare_exchange(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return current - 1,
                Err(actual) => current = actual,
            }
        }
    }

    /// Returns one subscription slot. Reports how many subscriptions remain;
    /// zero means the connection can go back to the backend pool.
    pub(crate) fn release_slot(&self) -> u32 {
        let free_now = self.free_slots.fetch_add(1, Ordering::AcqRel) + 1;
        (self.capacity as i32 - free_now).max(0) as u32
    }

    // --- Listener management ---

    pub(crate) fn add_listeners(&self, channel: &ChannelName, new: &[Listener]) {
        if new.is_empty() {
            return;
        }
        self.listeners
            .lock()
            .entry(channel.clone())
            .or_default()
            .extend(new.iter().cloned());
    }

    pub(crate) fn remove_listeners_by_id(&self, channel: &ChannelName, ids: &[u64]) {
        let mut listeners = self.listeners.lock();
        if let Some(list) = listeners.get_mut(channel) {
            list.retain(|l| !ids.contains(&l.id()));
            if list.is_empty() {
                listeners.remove(channel);
            }
        }
    }

    pub fn has_listeners(&self, channel: &ChannelName) -> bool {
        self.listeners
            .lock()
            .get(channel)
            .is_some_and(|l| !l.is_empty())
    }

    pub fn listeners_of(&self, channel: &ChannelName) -> Vec<Listener> {
        self.listeners.lock().get(channel).cloned().unwrap_or_default()
    }

    // --- Codec bookkeeping ---

    pub(crate) fn set_codec(&self, channel: &ChannelName, pattern: bool, codec: Codec) {
        let map = if pattern {
            &self.pattern_channels
        } else {
            &self.channels
        };
        map.lock().insert(channel.clone(), codec);
    }

    pub(crate) fn remove_codec(&self, channel: &ChannelName, pattern: bool) -> Option<Codec> {
        let map = if pattern {
            &self.pattern_channels
        } else {
            &self.channels
        };
        map.lock().remove(channel)
    }

    pub fn codec_of(&self, channel: &ChannelName, pattern: bool) -> Option<Codec> {
        let map = if pattern {
            &self.pattern_channels
        } else {
            &self.channels
        };
        map.lock().get(channel).cloned()
    }

    pub fn subscribed_channels(&self) -> Vec<(ChannelName, Codec)> {
        self.channels
            .lock()
            .iter()
            .map(|(c, codec)| (c.clone(), codec.clone()))
            .collect()
    }

    pub fn pattern_subscriptions(&self) -> Vec<(ChannelName, Codec)> {
        self.pattern_channels
            .lock()
            .iter()
            .map(|(c, codec)| (c.clone(), codec.clone()))
            .collect()
    }

    // --- Acknowledgement futures ---

    /// The shared acknowledgement future for the `(channel, kind)` exchange,
    /// created on first use. An already-acknowledged exchange resolves
    /// immediately.
    pub(crate) fn subscribe_ack(&self, channel: &ChannelName, kind: SubscriptionKind) -> SubscribeAck {
        let mut acks = self.acks.lock();
        let tx = acks
            .entry((channel.clone(), kind))
            .or_insert_with(|| watch::channel(AckState::Pending).0);
        SubscribeAck { rx: tx.subscribe() }
    }

    /// Whether the `(channel, kind)` exchange is still waiting for its
    /// acknowledgement.
    pub(crate) fn ack_pending(&self, channel: &ChannelName, kind: SubscriptionKind) -> bool {
        self.acks
            .lock()
            .get(&(channel.clone(), kind))
            .is_some_and(|tx| *tx.borrow() == AckState::Pending)
    }

    /// Fails the pending exchange so every waiter sees the rollback, and
    /// clears the slot for a fresh attempt.
    pub(crate) fn abort_ack(&self, channel: &ChannelName, kind: SubscriptionKind) {
        if let Some(tx) = self.acks.lock().remove(&(channel.clone(), kind)) {
            let _ = tx.send(AckState::Aborted);
        }
    }

    /// Drops every acknowledgement slot and listener of `channel`, returning
    /// the entry to a clean state for that name.
    pub(crate) fn clear_channel(&self, channel: &ChannelName) {
        self.acks.lock().retain(|(c, _), _| c != channel);
        self.listeners.lock().remove(channel);
    }

    // --- Wire sends ---

    /// Flushes the subscribe command for `kind` to the transport. The
    /// acknowledgement arrives later through [`Self::subscribe_ack`].
    pub(crate) async fn send_subscribe(
        &self,
        kind: SubscriptionKind,
        codec: Codec,
        channel: ChannelName,
    ) -> Result<(), SubMuxError> {
        if kind.is_pattern() {
            self.conn.psubscribe(codec, channel).await
        } else {
            self.conn.subscribe(codec, channel).await
        }
    }

    /// Flushes the unsubscribe command for `kind` to the transport.
    pub(crate) async fn send_teardown(
        &self,
        kind: SubscriptionKind,
        channel: ChannelName,
    ) -> Result<(), SubMuxError> {
        if kind.is_pattern() {
            self.conn.punsubscribe(channel).await
        } else {
            self.conn.unsubscribe(channel).await
        }
    }

    // --- Event dispatch (called from the dispatch task only) ---

    fn complete_ack(&self, kind: SubscriptionKind, channel: &ChannelName) {
        let was_pending = {
            let acks = self.acks.lock();
            acks.get(&(channel.clone(), kind))
                .map(|tx| tx.send_replace(AckState::Acked) == AckState::Pending)
        };
        if was_pending == Some(true) {
            debug!(%channel, %kind, "exchange acknowledged");
        }
        // Status callbacks run outside the listener lock; a callback may
        // re-enter the service.
        for listener in self.listeners_of(channel) {
            listener.on_status(kind, channel);
        }
    }

    fn deliver(&self, channel: &ChannelName, payload: Bytes) {
        for listener in self.listeners_of(channel) {
            listener.on_message(channel, payload.clone());
        }
    }

    fn deliver_pattern(&self, pattern: &ChannelName, channel: &ChannelName, payload: Bytes) {
        for listener in self.listeners_of(pattern) {
            listener.on_pattern_message(pattern, channel, payload.clone());
        }
    }
}

impl Drop for ConnectionEntry {
    fn drop(&mut self) {
        // The dispatch task only holds a weak backref, but it can stay
        // parked on an idle event stream; reap it with the entry.
        if let Some(handle) = self.dispatch.lock().take() {
            handle.abort();
        }
    }
}

impl fmt::Debug for ConnectionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionEntry")
            .field("connection", &self.conn.id())
            .field("shard", &self.shard)
            .field("free_slots", &self.free_slots())
            .finish()
    }
}

/// Routes inbound connection events to acknowledgement slots and listeners.
///
/// Holds only a weak reference to the entry: the dispatch task must never
/// keep the entry (and through it the engine) alive once the service has let
/// go of it.
async fn dispatch(
    entry: Weak<ConnectionEntry>,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(entry) = entry.upgrade() else {
            return;
        };
        match event {
            ConnectionEvent::Status { kind, channel } => entry.complete_ack(kind, &channel),
            ConnectionEvent::Message { channel, payload } => entry.deliver(&channel, payload),
            ConnectionEvent::PatternMessage {
                pattern,
                channel,
                payload,
            } => entry.deliver_pattern(&pattern, &channel, payload),
        }
    }
}
