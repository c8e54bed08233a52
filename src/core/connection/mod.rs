// src/core/connection/mod.rs

//! Transport seams: the pub/sub connection contract and the backend pool
//! that lends connections out.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::core::SubMuxError;
use crate::core::cluster::ShardId;
use crate::core::protocol::{ChannelName, Codec, SubscriptionKind};

/// An inbound frame from a pub/sub connection, already classified by the
/// transport.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Acknowledgement of a subscribe/unsubscribe exchange (or their pattern
    /// forms) on a channel.
    Status {
        kind: SubscriptionKind,
        channel: ChannelName,
    },
    /// A payload published to a literally-subscribed channel.
    Message {
        channel: ChannelName,
        payload: Bytes,
    },
    /// A payload matched by a pattern subscription.
    PatternMessage {
        pattern: ChannelName,
        channel: ChannelName,
        payload: Bytes,
    },
}

/// One physical pub/sub connection to a backend shard.
///
/// The wire methods resolve when the command has been flushed to the
/// transport; acknowledgements arrive later as [`ConnectionEvent::Status`]
/// frames on the event stream. `on_status_message` must deliver locally even
/// when the transport is gone: the teardown watchdog relies on it to
/// synthesize an acknowledgement for a backend that went silent.
#[async_trait]
pub trait PubSubConnection: Send + Sync {
    /// Stable identity of the physical connection, used to find its
    /// subscription state again after a liveness event.
    fn id(&self) -> u64;

    async fn subscribe(&self, codec: Codec, channel: ChannelName) -> Result<(), SubMuxError>;

    async fn psubscribe(&self, codec: Codec, channel: ChannelName) -> Result<(), SubMuxError>;

    async fn unsubscribe(&self, channel: ChannelName) -> Result<(), SubMuxError>;

    async fn punsubscribe(&self, channel: ChannelName) -> Result<(), SubMuxError>;

    /// Injects a status frame into the inbound event stream, as if the
    /// backend had sent it.
    fn on_status_message(&self, kind: SubscriptionKind, channel: ChannelName);

    /// Hands over the inbound event stream. Returns `None` if it was already
    /// taken by an earlier consumer.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>>;
}

/// The backend connection pool lending out dedicated pub/sub connections.
#[async_trait]
pub trait BackendPool: Send + Sync {
    /// Obtains a pub/sub connection to `shard`. Ownership transfers to the
    /// caller until the connection is handed back via `release_pubsub`.
    /// Every connection handed out must have its event stream available for
    /// [`PubSubConnection::take_events`]; a recycled connection needs its
    /// stream re-armed before it is lent out again.
    async fn acquire_pubsub(&self, shard: ShardId) -> Result<Arc<dyn PubSubConnection>, SubMuxError>;

    /// Returns a connection previously obtained from `acquire_pubsub`. The
    /// pool may recycle or dispose of it.
    fn release_pubsub(&self, shard: ShardId, conn: Arc<dyn PubSubConnection>);
}
