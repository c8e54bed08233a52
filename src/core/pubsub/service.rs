// src/core/pubsub/service.rs

//! The subscription service and its subscribe engine.
//!
//! The engine shares a bounded pool of pub/sub connections across an
//! unbounded set of logical channel subscriptions. Per-channel work is
//! serialized on a striped lock; all pool and slot accounting happens under
//! a single free-pool lock, taken strictly after the channel stripe.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use futures::future::join_all;
use tracing::{debug, warn};

use crate::config::Config;
use crate::core::SubMuxError;
use crate::core::cluster::{Router, ShardId};
use crate::core::connection::{BackendPool, PubSubConnection};
use crate::core::protocol::{ChannelName, Codec, SubscriptionKind};
use crate::core::pubsub::entry::ConnectionEntry;
use crate::core::pubsub::listener::{FanInStatusListener, Listener};
use crate::core::pubsub::shard_pool::ShardPool;
use crate::core::scheduler::{Scheduler, TimerHandle};
use crate::core::sync::{AsyncSemaphore, StripedLocks};

/// Registry key: one logical subscription lives on exactly one shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub channel: ChannelName,
    pub shard: ShardId,
}

/// Outcome of trying to claim a pooled entry for a new subscription.
enum Claim {
    /// Another subscriber committed the key while we waited for the pool
    /// lock; retry the fast path.
    Raced,
    /// A slot was claimed and the registry commit succeeded.
    Claimed(Arc<ConnectionEntry>),
    /// No pooled entry has free slots; a new connection is needed.
    Empty,
}

/// Outcome of installing a freshly-acquired connection.
enum Install {
    Installed(Arc<ConnectionEntry>),
    /// Another subscriber won the registry slot while we were connecting;
    /// the fresh connection went back to the backend pool.
    Raced(Arc<ConnectionEntry>),
}

/// Multiplexes logical channel subscriptions onto a bounded pool of pub/sub
/// connections, and keeps them attached across connection loss and topology
/// changes.
pub struct SubscriptionService {
    pub(crate) config: Config,
    pub(crate) router: Arc<dyn Router>,
    pub(crate) backend: Arc<dyn BackendPool>,
    pub(crate) channel_locks: StripedLocks,
    pub(crate) free_lock: Arc<AsyncSemaphore>,
    pub(crate) registry: DashMap<SubscriptionKey, Arc<ConnectionEntry>>,
    pub(crate) shard_pools: DashMap<ShardId, Arc<ShardPool>>,
    pub(crate) scheduler: Scheduler,
}

impl SubscriptionService {
    pub fn new(config: Config, router: Arc<dyn Router>, backend: Arc<dyn BackendPool>) -> Arc<Self> {
        Arc::new(Self {
            config,
            router,
            backend,
            channel_locks: StripedLocks::default(),
            free_lock: Arc::new(AsyncSemaphore::new(1)),
            registry: DashMap::new(),
            shard_pools: DashMap::new(),
            scheduler: Scheduler::new(),
        })
    }

    /// Subscribes to a literal channel, attaching `listeners` to whichever
    /// connection entry ends up hosting it. Resolves once the backend has
    /// acknowledged the subscription.
    pub async fn subscribe(
        self: &Arc<Self>,
        codec: Codec,
        channel: impl Into<ChannelName>,
        listeners: Vec<Listener>,
    ) -> Result<Arc<ConnectionEntry>, SubMuxError> {
        let channel = channel.into();
        let shard = self.shard_of(&channel)?;
        self.subscribe_on(SubscriptionKind::Subscribe, codec, channel, shard, listeners)
            .await
    }

    /// Subscribes to a glob pattern. Notification channels in cluster mode
    /// fan out across every shard; the returned list then holds one entry
    /// per shard, and caller status callbacks fire only once the whole
    /// fan-out is acknowledged.
    pub async fn psubscribe(
        self: &Arc<Self>,
        codec: Codec,
        channel: impl Into<ChannelName>,
        listeners: Vec<Listener>,
    ) -> Result<Vec<Arc<ConnectionEntry>>, SubMuxError> {
        let channel = channel.into();
        if !self.is_multi_shard(&channel) {
            let shard = self.shard_of(&channel)?;
            let entry = self
                .subscribe_on(SubscriptionKind::PSubscribe, codec, channel, shard, listeners)
                .await?;
            return Ok(vec![entry]);
        }

        let shards = self.router.shards();
        let wrapped: Vec<Listener> = listeners
            .iter()
            .map(|l| FanInStatusListener::wrap(l, shards.len()))
            .collect();
        let results = join_all(shards.into_iter().map(|shard| {
            self.subscribe_on(
                SubscriptionKind::PSubscribe,
                codec.clone(),
                channel.clone(),
                shard,
                wrapped.clone(),
            )
        }))
        .await;
        results.into_iter().collect()
    }

    /// The entry currently hosting `channel`, if any.
    pub fn get_pubsub_entry(&self, channel: &ChannelName) -> Option<Arc<ConnectionEntry>> {
        let shard = self.router.shard_of(channel)?;
        self.registry
            .get(&SubscriptionKey {
                channel: channel.clone(),
                shard,
            })
            .map(|e| Arc::clone(e.value()))
    }

    /// Drops the pool bookkeeping of a shard that topology management has
    /// retired. Live subscriptions on the shard are expected to have been
    /// reattached already.
    pub fn remove_shard(&self, shard: ShardId) {
        self.shard_pools.remove(&shard);
    }

    /// Number of committed `(channel, shard)` subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.registry.len()
    }

    /// The per-shard pool, created on first use.
    pub fn shard_pool(&self, shard: ShardId) -> Arc<ShardPool> {
        Arc::clone(
            self.shard_pools
                .entry(shard)
                .or_insert_with(|| Arc::new(ShardPool::new()))
                .value(),
        )
    }

    // --- Subscribe engine ---

    pub(crate) async fn subscribe_on(
        self: &Arc<Self>,
        kind: SubscriptionKind,
        codec: Codec,
        channel: ChannelName,
        shard: ShardId,
        listeners: Vec<Listener>,
    ) -> Result<Arc<ConnectionEntry>, SubMuxError> {
        let stripe = self.channel_locks.stripe_for(&channel);
        let _channel_guard = stripe.acquire_guard().await;
        self.subscribe_locked(kind, codec, channel, shard, listeners)
            .await
    }

    /// The state machine proper. Caller holds the channel stripe.
    async fn subscribe_locked(
        self: &Arc<Self>,
        kind: SubscriptionKind,
        codec: Codec,
        channel: ChannelName,
        shard: ShardId,
        listeners: Vec<Listener>,
    ) -> Result<Arc<ConnectionEntry>, SubMuxError> {
        let key = SubscriptionKey {
            channel: channel.clone(),
            shard,
        };
        let mut attempts: u32 = 0;
        loop {
            // Fast path: the channel is already hosted on this shard.
            if let Some(entry) = self.registry.get(&key).map(|e| Arc::clone(e.value())) {
                return self.attach_to(entry, kind, &channel, &listeners).await;
            }

            match self.try_claim_pooled(&key).await? {
                Claim::Raced => continue,
                Claim::Claimed(entry) => {
                    return self
                        .commit_subscribe(entry, kind, codec, channel, listeners)
                        .await;
                }
                Claim::Empty => {}
            }

            // No pooled capacity: request a fresh pub/sub connection. An
            // attempt slower than the retry interval is abandoned and
            // re-entered, so a stuck dial cannot wedge the engine.
            let connect = self
                .scheduler
                .deadline(
                    self.config.retry_interval(),
                    self.backend.acquire_pubsub(shard),
                )
                .await;
            match connect {
                Some(Ok(conn)) => match self.install_connection(conn, &key).await? {
                    Install::Installed(entry) => {
                        return self
                            .commit_subscribe(entry, kind, codec, channel, listeners)
                            .await;
                    }
                    Install::Raced(winner) => {
                        return self.attach_to(winner, kind, &channel, &listeners).await;
                    }
                },
                Some(Err(e)) => {
                    attempts += 1;
                    if attempts > self.config.retry_attempts {
                        return Err(SubMuxError::ConnectAttemptFailed(e.to_string()));
                    }
                    warn!(%channel, %shard, attempt = attempts, error = %e,
                        "pub/sub connection attempt failed, retrying");
                    self.scheduler.sleep(self.config.retry_interval()).await;
                }
                None => {
                    attempts += 1;
                    if attempts > self.config.retry_attempts {
                        return Err(SubMuxError::ConnectAttemptFailed(format!(
                            "connection attempt to {shard} timed out"
                        )));
                    }
                    debug!(%channel, %shard, attempt = attempts,
                        "pub/sub connection attempt abandoned after retry interval");
                }
            }
        }
    }

    /// Claims a slot on the head of the shard's free queue and commits the
    /// registry binding, all under the free-pool lock.
    async fn try_claim_pooled(&self, key: &SubscriptionKey) -> Result<Claim, SubMuxError> {
        let _free_guard = self.free_lock.acquire_guard().await;
        let pool = self.shard_pool(key.shard);
        let Some(entry) = pool.peek_free() else {
            return Ok(Claim::Empty);
        };

        let remaining = entry.try_acquire();
        if remaining < 0 {
            // The free queue only holds entries with free slots; an
            // exhausted head means the accounting is corrupt.
            return Err(SubMuxError::Internal(format!(
                "free entry for {} has no free slots",
                key.shard
            )));
        }

        match self.registry.entry(key.clone()) {
            MapEntry::Occupied(_) => {
                entry.release_slot();
                Ok(Claim::Raced)
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&entry));
                if remaining == 0 {
                    pool.remove_free(&entry);
                }
                pool.add_key(key.channel.clone());
                Ok(Claim::Claimed(entry))
            }
        }
    }

    /// Wraps a freshly-acquired connection in an entry and commits it, or
    /// yields to a subscriber that won the race while we were connecting.
    async fn install_connection(
        &self,
        conn: Arc<dyn PubSubConnection>,
        key: &SubscriptionKey,
    ) -> Result<Install, SubMuxError> {
        let _free_guard = self.free_lock.acquire_guard().await;
        let pool = self.shard_pool(key.shard);
        let entry = ConnectionEntry::new(conn, key.shard, self.config.subscriptions_per_connection);
        let remaining = entry.try_acquire();
        if remaining < 0 {
            return Err(SubMuxError::Internal(
                "fresh connection entry has no free slots".to_string(),
            ));
        }

        match self.registry.entry(key.clone()) {
            MapEntry::Occupied(occupied) => {
                let winner = Arc::clone(occupied.get());
                drop(occupied);
                self.backend.release_pubsub(key.shard, entry.connection());
                Ok(Install::Raced(winner))
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&entry));
                if remaining > 0 {
                    pool.push_free(Arc::clone(&entry));
                }
                pool.add_key(key.channel.clone());
                entry.spawn_dispatch();
                debug!(shard = %key.shard, connection = entry.connection_id(),
                    "created pub/sub connection entry");
                Ok(Install::Installed(entry))
            }
        }
    }

    /// Sends the wire command for a freshly-committed binding and waits for
    /// the acknowledgement under the configured watchdog.
    ///
    /// A detached rollback timer backs the inline wait: if the caller's
    /// future is dropped between the wire send and the acknowledgement, the
    /// timer still reaps the half-open binding.
    async fn commit_subscribe(
        self: &Arc<Self>,
        entry: Arc<ConnectionEntry>,
        kind: SubscriptionKind,
        codec: Codec,
        channel: ChannelName,
        listeners: Vec<Listener>,
    ) -> Result<Arc<ConnectionEntry>, SubMuxError> {
        entry.add_listeners(&channel, &listeners);
        entry.set_codec(&channel, kind.is_pattern(), codec.clone());
        let mut ack = entry.subscribe_ack(&channel, kind);

        if let Err(e) = entry.send_subscribe(kind, codec, channel.clone()).await {
            warn!(%channel, error = %e, "wire send failed for subscribe");
            self.rollback_subscribe(&entry, kind, &channel, &listeners).await;
            return Err(e);
        }

        let watchdog = self.arm_subscribe_watchdog(&entry, kind, &channel);
        let result = match self.scheduler.deadline(self.config.timeout(), ack.wait()).await {
            Some(Ok(())) => Ok(entry),
            Some(Err(e)) => {
                self.rollback_subscribe(&entry, kind, &channel, &listeners).await;
                Err(e)
            }
            None => {
                self.rollback_subscribe(&entry, kind, &channel, &listeners).await;
                Err(SubMuxError::SubscribeTimeout(channel.to_string()))
            }
        };
        watchdog.cancel();
        result
    }

    /// Arms the detached rollback timer for an in-flight subscribe. Fires
    /// only if the exchange is still unacknowledged at the deadline; the
    /// teardown it issues is idempotent against the inline rollback.
    fn arm_subscribe_watchdog(
        self: &Arc<Self>,
        entry: &Arc<ConnectionEntry>,
        kind: SubscriptionKind,
        channel: &ChannelName,
    ) -> TimerHandle {
        let service = Arc::downgrade(self);
        let entry = Arc::clone(entry);
        let channel = channel.clone();
        self.scheduler.after(self.config.timeout(), async move {
            let Some(service) = service.upgrade() else {
                return;
            };
            if !entry.ack_pending(&channel, kind) {
                return;
            }
            let stripe = service.channel_locks.stripe_for(&channel);
            let _channel_guard = stripe.acquire_guard().await;
            if !entry.ack_pending(&channel, kind) {
                return;
            }
            debug!(%channel, %kind, "reaping abandoned subscribe exchange");
            entry.abort_ack(&channel, kind);
            if let Err(e) = service
                .unsubscribe_locked(kind.teardown(), &channel, entry.shard(), true)
                .await
            {
                warn!(%channel, error = %e, "watchdog teardown failed");
            }
        })
    }

    /// Fast path: the binding exists. Attach and wait out the initial
    /// subscriber's acknowledgement, which has usually already arrived.
    async fn attach_to(
        &self,
        entry: Arc<ConnectionEntry>,
        kind: SubscriptionKind,
        channel: &ChannelName,
        listeners: &[Listener],
    ) -> Result<Arc<ConnectionEntry>, SubMuxError> {
        entry.add_listeners(channel, listeners);
        let mut ack = entry.subscribe_ack(channel, kind);
        match self.scheduler.deadline(self.config.timeout(), ack.wait()).await {
            Some(Ok(())) => Ok(entry),
            Some(Err(e)) => {
                self.detach_listeners(&entry, kind, channel, listeners).await;
                Err(e)
            }
            None => {
                self.detach_listeners(&entry, kind, channel, listeners).await;
                Err(SubMuxError::SubscribeTimeout(channel.to_string()))
            }
        }
    }

    /// Rolls a failed subscribe attempt back: the shared acknowledgement is
    /// aborted so racing attachers fail fast, then the listeners come off
    /// and the binding is torn down if nobody else holds it.
    async fn rollback_subscribe(
        &self,
        entry: &Arc<ConnectionEntry>,
        kind: SubscriptionKind,
        channel: &ChannelName,
        listeners: &[Listener],
    ) {
        entry.abort_ack(channel, kind);
        self.detach_listeners(entry, kind, channel, listeners).await;
    }

    /// Strips `listeners` from the entry; when the channel has none left,
    /// tears the subscription down. The backend may have partially accepted
    /// the exchange, so the teardown always goes out on the wire.
    async fn detach_listeners(
        &self,
        entry: &Arc<ConnectionEntry>,
        kind: SubscriptionKind,
        channel: &ChannelName,
        listeners: &[Listener],
    ) {
        let ids: Vec<u64> = listeners.iter().map(|l| l.id()).collect();
        entry.remove_listeners_by_id(channel, &ids);
        if !entry.has_listeners(channel) {
            if let Err(e) = self
                .unsubscribe_locked(kind.teardown(), channel, entry.shard(), true)
                .await
            {
                warn!(%channel, error = %e, "cleanup unsubscribe failed");
            }
        }
    }

    // --- Shared helpers ---

    pub(crate) fn shard_of(&self, channel: &ChannelName) -> Result<ShardId, SubMuxError> {
        if self.router.is_shutting_down() {
            return Err(SubMuxError::Shutdown);
        }
        self.router
            .shard_of(channel)
            .ok_or_else(|| SubMuxError::NodeNotFound(channel.to_string()))
    }

    pub(crate) fn is_multi_shard(&self, channel: &ChannelName) -> bool {
        self.router.is_cluster() && channel.is_notification()
    }

    /// Whether any registry binding still points at `entry`.
    pub(crate) fn hosts_any(&self, entry: &Arc<ConnectionEntry>) -> bool {
        self.registry.iter().any(|e| Arc::ptr_eq(e.value(), entry))
    }
}

impl fmt::Debug for SubscriptionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionService")
            .field("subscriptions", &self.registry.len())
            .field("shard_pools", &self.shard_pools.len())
            .finish()
    }
}
