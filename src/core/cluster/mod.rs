// src/core/cluster/mod.rs

//! Topology resolution: shard identity, the router seam, and the hash-slot
//! algorithm.

pub mod slot;

pub use slot::{NUM_SLOTS, channel_slot};

use crate::core::protocol::ChannelName;
use std::fmt;

/// Identifier of one backend partition, addressable independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardId(pub u16);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard-{}", self.0)
    }
}

/// Resolves channels to shards.
///
/// Implemented by the embedding client's topology layer. The service treats
/// the router as authoritative and re-resolves on every operation, so a
/// reattach after slot migration naturally lands on the current owner.
pub trait Router: Send + Sync {
    /// The shard currently hosting `channel`, or `None` when its slot is not
    /// covered by any discovered node.
    fn shard_of(&self, channel: &ChannelName) -> Option<ShardId>;

    /// All shards of the current topology.
    fn shards(&self) -> Vec<ShardId>;

    /// Whether the backend is a multi-shard cluster. Notification channels
    /// fan out across all shards only in cluster mode.
    fn is_cluster(&self) -> bool;

    /// Whether the connection manager is shutting down. Subscribes fail and
    /// unsubscribes short-circuit to success while this is set.
    fn is_shutting_down(&self) -> bool;

    /// The hash slot of a channel name.
    fn slot_of(&self, channel: &ChannelName) -> u16 {
        channel_slot(channel.as_bytes())
    }
}
