// src/core/pubsub/reattach.rs

//! Recovery after topology changes and connection loss: replays the local
//! subscription state against whatever shard the router currently indicates.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{info, warn};

use crate::core::cluster::ShardId;
use crate::core::protocol::{ChannelName, Codec, SubscriptionKind};
use crate::core::pubsub::entry::ConnectionEntry;
use crate::core::pubsub::listener::Listener;
use crate::core::pubsub::service::{SubscriptionKey, SubscriptionService};

/// Backoff between resubscription attempts. Reattach is the only path that
/// retries without bound; callers are not waiting on it, the listeners are.
const REATTACH_RETRY_DELAY: Duration = Duration::from_secs(1);

impl SubscriptionService {
    /// Replays every subscription whose channel hashes into `slot`.
    ///
    /// Called by the topology watcher when a slot migrates. Each affected
    /// channel is torn down against its old shard binding and resubscribed
    /// through the current router state, which may land on a different
    /// shard. Teardown and resubscribe both serialize on the channel stripe,
    /// so a stale exchange from the old binding cannot interleave.
    pub async fn reattach_slot(self: &Arc<Self>, slot: u16) {
        let affected: Vec<(SubscriptionKey, Arc<ConnectionEntry>)> = self
            .registry
            .iter()
            .filter(|e| self.router.slot_of(&e.key().channel) == slot)
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        for (key, entry) in affected {
            self.reattach_channel(&key.channel, key.shard, &entry, true)
                .await;
        }
    }

    /// Replays every subscription hosted on a broken connection.
    ///
    /// The entry owning the connection is pulled out of its shard's free
    /// queue first, so no new subscription can land on the dead connection
    /// while its channels are being moved.
    pub async fn reattach_connection(self: &Arc<Self>, connection_id: u64) {
        let Some((shard, entry)) = self
            .registry
            .iter()
            .find(|e| e.value().connection_id() == connection_id)
            .map(|e| (e.key().shard, Arc::clone(e.value())))
        else {
            return;
        };

        {
            let _free_guard = self.free_lock.acquire_guard().await;
            self.shard_pool(shard).remove_free(&entry);
        }

        let channels: HashSet<ChannelName> = entry
            .subscribed_channels()
            .into_iter()
            .chain(entry.pattern_subscriptions())
            .map(|(channel, _)| channel)
            .collect();

        // Channels tear down independently; each waits out its own
        // synthesized acknowledgement, so they run concurrently.
        join_all(channels.into_iter().map(|channel| {
            let entry = Arc::clone(&entry);
            async move {
                self.reattach_channel(&channel, shard, &entry, false).await;
            }
        }))
        .await;
    }

    /// Moves one channel off its current binding: captures listeners and
    /// codec, forces the unsubscribe, then resubscribes in the background.
    async fn reattach_channel(
        self: &Arc<Self>,
        channel: &ChannelName,
        shard: ShardId,
        entry: &Arc<ConnectionEntry>,
        keep_in_pool: bool,
    ) {
        // Literal binding.
        if entry.codec_of(channel, false).is_some() {
            let listeners = entry.listeners_of(channel);
            let codec = self
                .forced_teardown(SubscriptionKind::Unsubscribe, channel, shard, keep_in_pool)
                .await;
            if let Some(codec) = codec {
                self.resubscribe_detached(
                    SubscriptionKind::Subscribe,
                    channel.clone(),
                    codec,
                    listeners,
                );
            }
        }

        // Pattern binding.
        if entry.codec_of(channel, true).is_some() {
            let listeners = entry.listeners_of(channel);
            let codec = self
                .forced_teardown(SubscriptionKind::PUnsubscribe, channel, shard, keep_in_pool)
                .await;
            if let Some(codec) = codec {
                self.resubscribe_detached(
                    SubscriptionKind::PSubscribe,
                    channel.clone(),
                    codec,
                    listeners,
                );
            }
        }
    }

    async fn forced_teardown(
        &self,
        kind: SubscriptionKind,
        channel: &ChannelName,
        shard: ShardId,
        keep_in_pool: bool,
    ) -> Option<Codec> {
        let stripe = self.channel_locks.stripe_for(channel);
        let _channel_guard = stripe.acquire_guard().await;
        match self.unsubscribe_locked(kind, channel, shard, keep_in_pool).await {
            Ok(codec) => codec,
            Err(e) => {
                warn!(%channel, error = %e, "forced teardown during reattach failed");
                None
            }
        }
    }

    /// Resubscribes `listeners` on a background task, retrying forever with
    /// a fixed backoff. The task holds only a weak reference to the service:
    /// recovery work must never keep the engine alive.
    fn resubscribe_detached(
        self: &Arc<Self>,
        kind: SubscriptionKind,
        channel: ChannelName,
        codec: Codec,
        listeners: Vec<Listener>,
    ) {
        if listeners.is_empty() {
            return;
        }
        let service = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let Some(service) = service.upgrade() else {
                    return;
                };
                let result = match kind {
                    SubscriptionKind::PSubscribe => service
                        .psubscribe(codec.clone(), channel.clone(), listeners.clone())
                        .await
                        .map(|entries| entries.into_iter().next()),
                    _ => service
                        .subscribe(codec.clone(), channel.clone(), listeners.clone())
                        .await
                        .map(Some),
                };
                match result {
                    Ok(entry) => {
                        let connection = entry.map(|e| e.connection_id());
                        info!(%channel, ?connection, "listeners resubscribed after reattach");
                        return;
                    }
                    Err(e) => {
                        warn!(%channel, error = %e, "resubscribe failed, retrying");
                    }
                }
                let scheduler = service.scheduler.clone();
                // Drop the strong reference while sleeping so shutdown can
                // reclaim the service between attempts.
                drop(service);
                scheduler.sleep(REATTACH_RETRY_DELAY).await;
            }
        });
    }
}
