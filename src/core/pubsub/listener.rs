// src/core/pubsub/listener.rs

//! Caller-provided subscription callbacks and their id-carrying handles.

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::core::protocol::{ChannelName, SubscriptionKind};

/// Source of monotonically-increasing listener ids, shared by every service
/// instance in the process.
static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Callback bundle attached to a channel subscription.
///
/// All methods default to no-ops so implementors only override what they
/// consume. Callbacks are invoked from the owning connection's dispatch task
/// in backend delivery order; they must not block.
pub trait PubSubListener: Send + Sync {
    /// A payload delivered on a literally-subscribed channel.
    fn on_message(&self, _channel: &ChannelName, _payload: Bytes) {}

    /// A payload matched by a pattern subscription.
    fn on_pattern_message(&self, _pattern: &ChannelName, _channel: &ChannelName, _payload: Bytes) {}

    /// The backend acknowledged a protocol exchange on the channel. Also
    /// fires for acknowledgements synthesized by the teardown watchdog.
    fn on_status(&self, _kind: SubscriptionKind, _channel: &ChannelName) {}
}

/// A [`PubSubListener`] paired with a numeric id, so callers can detach it
/// later without retaining the value itself.
#[derive(Clone)]
pub struct Listener {
    id: u64,
    inner: Arc<dyn PubSubListener>,
}

impl Listener {
    pub fn new(inner: Arc<dyn PubSubListener>) -> Self {
        Self {
            id: NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed),
            inner,
        }
    }

    /// Wraps `inner` while keeping an existing id, so a wrapped listener
    /// stays detachable by the id the caller knows.
    pub(crate) fn with_same_id(id: u64, inner: Arc<dyn PubSubListener>) -> Self {
        Self { id, inner }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn on_message(&self, channel: &ChannelName, payload: Bytes) {
        self.inner.on_message(channel, payload);
    }

    pub(crate) fn on_pattern_message(
        &self,
        pattern: &ChannelName,
        channel: &ChannelName,
        payload: Bytes,
    ) {
        self.inner.on_pattern_message(pattern, channel, payload);
    }

    pub(crate) fn on_status(&self, kind: SubscriptionKind, channel: &ChannelName) {
        self.inner.on_status(kind, channel);
    }
}

impl PartialEq for Listener {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Listener {}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener").field("id", &self.id).finish()
    }
}

/// Forwards messages unchanged but holds back status callbacks until every
/// shard of a multi-shard pattern subscription has acknowledged, so the
/// caller observes a single status event for the whole fan-out.
pub(crate) struct FanInStatusListener {
    inner: Arc<dyn PubSubListener>,
    remaining: AtomicUsize,
}

impl FanInStatusListener {
    pub(crate) fn wrap(listener: &Listener, shard_count: usize) -> Listener {
        Listener::with_same_id(
            listener.id,
            Arc::new(Self {
                inner: Arc::clone(&listener.inner),
                remaining: AtomicUsize::new(shard_count),
            }),
        )
    }
}

impl PubSubListener for FanInStatusListener {
    fn on_message(&self, channel: &ChannelName, payload: Bytes) {
        self.inner.on_message(channel, payload);
    }

    fn on_pattern_message(&self, pattern: &ChannelName, channel: &ChannelName, payload: Bytes) {
        self.inner.on_pattern_message(pattern, channel, payload);
    }

    fn on_status(&self, kind: SubscriptionKind, channel: &ChannelName) {
        // Swallow all but the last of the initial fan-out acknowledgements;
        // once the counter is drained, later statuses pass through.
        let drained = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
        match drained {
            Ok(1) | Err(_) => self.inner.on_status(kind, channel),
            Ok(_) => {}
        }
    }
}
