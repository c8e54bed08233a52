// src/core/pubsub/teardown.rs

//! The unsubscribe engine: forced and ref-counted teardown of a
//! `(channel, shard)` binding, and listener-driven removal.

use std::sync::Arc;

use tracing::debug;

use crate::core::SubMuxError;
use crate::core::cluster::ShardId;
use crate::core::protocol::{ChannelName, Codec, SubscriptionKind};
use crate::core::pubsub::listener::Listener;
use crate::core::pubsub::service::{SubscriptionKey, SubscriptionService};

impl SubscriptionService {
    /// Tears down the subscription of `channel` on its current shard and
    /// returns the codec it was subscribed with, so a caller can resubscribe
    /// identically. `kind` may be either side of the exchange pair; it is
    /// normalized to the teardown form.
    ///
    /// Idempotent: a second call for an already-removed binding resolves
    /// immediately without touching the wire. While the connection manager
    /// is shutting down, teardown short-circuits to success.
    pub async fn unsubscribe(
        &self,
        kind: SubscriptionKind,
        channel: impl Into<ChannelName>,
    ) -> Result<Option<Codec>, SubMuxError> {
        let channel = channel.into();
        if self.router.is_shutting_down() {
            return Ok(None);
        }
        let Some(shard) = self.router.shard_of(&channel) else {
            return Ok(None);
        };
        let stripe = self.channel_locks.stripe_for(&channel);
        let _channel_guard = stripe.acquire_guard().await;
        self.unsubscribe_locked(kind.teardown(), &channel, shard, true)
            .await
    }

    /// Detaches listeners from `channel` by value; see
    /// [`remove_listener_ids`](Self::remove_listener_ids).
    pub async fn remove_listener(
        &self,
        kind: SubscriptionKind,
        channel: impl Into<ChannelName>,
        listeners: &[Listener],
    ) -> Result<(), SubMuxError> {
        let ids: Vec<u64> = listeners.iter().map(|l| l.id()).collect();
        self.remove_listener_ids(kind, channel, &ids).await
    }

    /// Detaches listeners from `channel` by id on every shard hosting it,
    /// and tears the subscription down wherever no listener remains.
    pub async fn remove_listener_ids(
        &self,
        kind: SubscriptionKind,
        channel: impl Into<ChannelName>,
        ids: &[u64],
    ) -> Result<(), SubMuxError> {
        let channel = channel.into();
        let stripe = self.channel_locks.stripe_for(&channel);
        let _channel_guard = stripe.acquire_guard().await;

        let shards: Vec<ShardId> = if self.is_multi_shard(&channel) {
            self.router.shards()
        } else {
            match self.router.shard_of(&channel) {
                Some(shard) => vec![shard],
                None => return Ok(()),
            }
        };

        for shard in shards {
            let key = SubscriptionKey {
                channel: channel.clone(),
                shard,
            };
            let Some(entry) = self.registry.get(&key).map(|e| Arc::clone(e.value())) else {
                continue;
            };
            entry.remove_listeners_by_id(&channel, ids);
            if !entry.has_listeners(&channel) {
                self.unsubscribe_locked(kind.teardown(), &channel, shard, true)
                    .await?;
            }
        }
        Ok(())
    }

    /// Forced teardown of `(channel, shard)`. The caller holds the channel
    /// stripe. `keep_in_pool` controls whether an entry that still has free
    /// slots goes back on the shard's free queue; reattach after connection
    /// loss passes `false` so a dead connection is never handed out again.
    ///
    /// Wire failures here are swallowed: the watchdog below synthesizes a
    /// local acknowledgement, so teardown completes even against a backend
    /// that silently dropped the command. A late duplicate of the real
    /// acknowledgement is harmless because the acknowledgement slot is
    /// one-shot.
    pub(crate) async fn unsubscribe_locked(
        &self,
        kind: SubscriptionKind,
        channel: &ChannelName,
        shard: ShardId,
        keep_in_pool: bool,
    ) -> Result<Option<Codec>, SubMuxError> {
        if self.router.is_shutting_down() {
            return Ok(None);
        }
        let key = SubscriptionKey {
            channel: channel.clone(),
            shard,
        };
        let Some((_, entry)) = self.registry.remove(&key) else {
            return Ok(None);
        };

        {
            let _free_guard = self.free_lock.acquire_guard().await;
            let pool = self.shard_pool(shard);
            pool.remove_key(channel);
            // Re-inserted below if the entry keeps capacity and bindings.
            pool.remove_free(&entry);
        }

        let codec = entry.remove_codec(channel, kind.is_pattern());
        let mut ack = entry.subscribe_ack(channel, kind);

        if let Err(e) = entry.send_teardown(kind, channel.clone()).await {
            debug!(%channel, %kind, error = %e,
                "unsubscribe send failed; relying on synthesized acknowledgement");
        }

        // Watchdog: inject a local status frame if the backend stays silent,
        // so the exchange always completes.
        let conn = entry.connection();
        let watchdog_channel = channel.clone();
        let watchdog = self.scheduler.after(self.config.timeout(), async move {
            debug!(channel = %watchdog_channel, %kind, "synthesizing unsubscribe acknowledgement");
            conn.on_status_message(kind, watchdog_channel);
        });
        // Bounded wait: the watchdog injects at the deadline, the margin
        // covers dispatch scheduling. An aborted acknowledgement still counts
        // as teardown progress.
        let _ = self
            .scheduler
            .deadline(self.config.timeout().saturating_mul(2), ack.wait())
            .await;
        watchdog.cancel();
        entry.clear_channel(channel);

        let remaining = entry.release_slot();
        {
            let _free_guard = self.free_lock.acquire_guard().await;
            let pool = self.shard_pool(shard);
            if remaining == 0 {
                pool.remove_free(&entry);
                self.backend.release_pubsub(shard, entry.connection());
                debug!(%shard, connection = entry.connection_id(),
                    "returned idle pub/sub connection to backend pool");
            } else if keep_in_pool && entry.free_slots() > 0 && self.hosts_any(&entry) {
                pool.push_free(Arc::clone(&entry));
            }
        }

        if codec.is_none() {
            debug!(%channel, %kind, "no codec recorded for removed subscription");
        }
        Ok(codec)
    }
}
