// tests/integration/reattach_test.rs

//! Recovery tests: slot migration and connection loss replay the local
//! subscription state onto whatever the router currently indicates.

use std::sync::Arc;
use std::time::Duration;

use submux::core::cluster::{Router, ShardId};
use submux::core::connection::PubSubConnection;
use submux::core::protocol::{ChannelName, Codec, SubscriptionKind};

use super::fixtures::{
    MockBackendPool, MockRouter, RecordingListener, build_service, test_config, wait_until,
};

#[tokio::test]
async fn test_reattach_after_slot_migration_moves_subscription() {
    let router = MockRouter::cluster(2);
    let pool = MockBackendPool::new(true);
    let service = build_service(test_config(), Arc::clone(&router), Arc::clone(&pool));
    let channel = ChannelName::from("k");

    router.assign_channel(&channel, ShardId(0));
    let recorder = RecordingListener::new();
    let entry = service
        .subscribe(Codec::new("json"), channel.clone(), vec![recorder.listener()])
        .await
        .unwrap();
    let old_conn = pool.created()[0].clone();
    assert_eq!(entry.shard(), ShardId(0));

    // The slot migrates; the router now maps the channel to the other shard.
    router.assign_channel(&channel, ShardId(1));
    let slot = router.slot_of(&channel);
    service.reattach_slot(slot).await;

    let service_ref = Arc::clone(&service);
    let channel_ref = channel.clone();
    assert!(
        wait_until(
            || {
                service_ref
                    .get_pubsub_entry(&channel_ref)
                    .is_some_and(|e| e.shard() == ShardId(1))
            },
            Duration::from_secs(2)
        )
        .await
    );

    assert_eq!(old_conn.sent_count(SubscriptionKind::Unsubscribe), 1);
    let new_entry = service.get_pubsub_entry(&channel).unwrap();
    assert_ne!(new_entry.connection_id(), old_conn.id());
    assert_eq!(new_entry.codec_of(&channel, false), Some(Codec::new("json")));
    assert_eq!(new_entry.listeners_of(&channel).len(), 1);
}

#[tokio::test]
async fn test_reattach_after_connection_loss_resubscribes_listeners() {
    let router = MockRouter::single_shard();
    let pool = MockBackendPool::new(true);
    let mut config = test_config();
    config.timeout_ms = 100;
    let service = build_service(config, router, Arc::clone(&pool));
    let channel = ChannelName::from("durable");

    let recorder = RecordingListener::new();
    service
        .subscribe(Codec::default(), channel.clone(), vec![recorder.listener()])
        .await
        .unwrap();
    let dead_conn = pool.created()[0].clone();
    // The broken connection cannot reach the backend any more; teardown
    // completes through the synthesized acknowledgement.
    dead_conn.set_auto_ack(false);
    dead_conn.set_fail_sends(true);

    service.reattach_connection(dead_conn.id()).await;

    let service_ref = Arc::clone(&service);
    let channel_ref = channel.clone();
    assert!(
        wait_until(
            || {
                service_ref
                    .get_pubsub_entry(&channel_ref)
                    .is_some_and(|e| e.connection_id() != dead_conn.id())
            },
            Duration::from_secs(2)
        )
        .await
    );

    let new_entry = service.get_pubsub_entry(&channel).unwrap();
    assert_eq!(new_entry.listeners_of(&channel).len(), 1);
    assert!(pool.released().contains(&dead_conn.id()));
}

#[tokio::test]
async fn test_reattach_retries_until_connect_succeeds() {
    let router = MockRouter::cluster(2);
    let pool = MockBackendPool::new(true);
    let mut config = test_config();
    config.retry_attempts = 0;
    config.retry_interval_ms = 10;
    let service = build_service(config, Arc::clone(&router), Arc::clone(&pool));
    let channel = ChannelName::from("stubborn");

    router.assign_channel(&channel, ShardId(0));
    let recorder = RecordingListener::new();
    service
        .subscribe(Codec::default(), channel.clone(), vec![recorder.listener()])
        .await
        .unwrap();

    // Move the channel and make the first resubscribe attempt fail; the
    // background retry must land the second one.
    router.assign_channel(&channel, ShardId(1));
    pool.fail_next(1);
    let slot = router.slot_of(&channel);
    service.reattach_slot(slot).await;

    let service_ref = Arc::clone(&service);
    let channel_ref = channel.clone();
    assert!(
        wait_until(
            || {
                service_ref
                    .get_pubsub_entry(&channel_ref)
                    .is_some_and(|e| e.shard() == ShardId(1))
            },
            Duration::from_secs(3)
        )
        .await
    );
    assert_eq!(
        service
            .get_pubsub_entry(&channel)
            .unwrap()
            .listeners_of(&channel)
            .len(),
        1
    );
}

#[tokio::test]
async fn test_reattach_slot_without_subscriptions_is_a_no_op() {
    let router = MockRouter::single_shard();
    let pool = MockBackendPool::new(true);
    let service = build_service(test_config(), router, Arc::clone(&pool));

    service.reattach_slot(7).await;
    assert_eq!(service.subscription_count(), 0);
    assert_eq!(pool.created_count(), 0);
}

#[tokio::test]
async fn test_remove_shard_drops_pool_bookkeeping() {
    let router = MockRouter::single_shard();
    let pool = MockBackendPool::new(true);
    let service = build_service(test_config(), router, pool);

    service
        .subscribe(Codec::default(), "tracked", Vec::new())
        .await
        .unwrap();
    assert_eq!(service.shard_pool(ShardId(0)).hosted_channel_count(), 1);

    service.remove_shard(ShardId(0));
    // A fresh pool materializes on next access, empty.
    assert_eq!(service.shard_pool(ShardId(0)).hosted_channel_count(), 0);
}
