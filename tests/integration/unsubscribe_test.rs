// tests/integration/unsubscribe_test.rs

//! Teardown engine tests: idempotence, codec round-tripping, synthesized
//! acknowledgements, and full state restoration.

use std::sync::Arc;
use std::time::{Duration, Instant};

use submux::core::cluster::ShardId;
use submux::core::connection::PubSubConnection;
use submux::core::protocol::{ChannelName, Codec, SubscriptionKind};

use super::fixtures::{MockBackendPool, MockRouter, build_service, test_config};

#[tokio::test]
async fn test_unsubscribe_returns_subscription_codec() {
    let router = MockRouter::single_shard();
    let pool = MockBackendPool::new(true);
    let service = build_service(test_config(), router, pool);

    service
        .subscribe(Codec::new("json"), "orders", Vec::new())
        .await
        .unwrap();

    let codec = service
        .unsubscribe(SubscriptionKind::Unsubscribe, "orders")
        .await
        .unwrap();
    assert_eq!(codec, Some(Codec::new("json")));
}

#[tokio::test]
async fn test_unsubscribe_is_idempotent() {
    let router = MockRouter::single_shard();
    let pool = MockBackendPool::new(true);
    let service = build_service(test_config(), router, Arc::clone(&pool));
    let channel = ChannelName::from("once");

    service
        .subscribe(Codec::default(), channel.clone(), Vec::new())
        .await
        .unwrap();

    let first = service
        .unsubscribe(SubscriptionKind::Unsubscribe, channel.clone())
        .await
        .unwrap();
    let second = service
        .unsubscribe(SubscriptionKind::Unsubscribe, channel.clone())
        .await
        .unwrap();

    assert!(first.is_some());
    assert!(second.is_none());
    // Only one teardown ever reached the wire.
    let conn = pool.created()[0].clone();
    assert_eq!(conn.sent_count(SubscriptionKind::Unsubscribe), 1);
}

#[tokio::test]
async fn test_round_trip_restores_pre_subscribe_state() {
    let router = MockRouter::single_shard();
    let pool = MockBackendPool::new(true);
    let service = build_service(test_config(), router, Arc::clone(&pool));
    let channel = ChannelName::from("transient");

    let entry = service
        .subscribe(Codec::default(), channel.clone(), Vec::new())
        .await
        .unwrap();
    let cap = entry.capacity() as i32;
    assert_eq!(entry.free_slots(), cap - 1);

    service
        .unsubscribe(SubscriptionKind::Unsubscribe, channel.clone())
        .await
        .unwrap();

    assert_eq!(service.subscription_count(), 0);
    assert!(service.get_pubsub_entry(&channel).is_none());
    let shard_pool = service.shard_pool(ShardId(0));
    assert_eq!(shard_pool.hosted_channel_count(), 0);
    assert_eq!(shard_pool.free_entry_count(), 0);
    assert_eq!(entry.free_slots(), cap);
    assert_eq!(pool.released(), vec![entry.connection_id()]);

    let conn = pool.created()[0].clone();
    assert_eq!(
        conn.sent(),
        vec![
            (SubscriptionKind::Subscribe, channel.clone()),
            (SubscriptionKind::Unsubscribe, channel.clone()),
        ]
    );
}

#[tokio::test]
async fn test_unsubscribe_timeout_synthesizes_acknowledgement() {
    let router = MockRouter::single_shard();
    let pool = MockBackendPool::new(true);
    let mut config = test_config();
    config.timeout_ms = 100;
    let service = build_service(config, router, Arc::clone(&pool));
    let channel = ChannelName::from("quiet");

    service
        .subscribe(Codec::default(), channel.clone(), Vec::new())
        .await
        .unwrap();

    // The backend goes silent: teardown must still complete, via the
    // locally-injected acknowledgement.
    let conn = pool.created()[0].clone();
    conn.set_auto_ack(false);

    let started = Instant::now();
    let codec = service
        .unsubscribe(SubscriptionKind::Unsubscribe, channel.clone())
        .await
        .unwrap();

    assert!(codec.is_some());
    assert!(started.elapsed() >= Duration::from_millis(90));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(conn.sent_count(SubscriptionKind::Unsubscribe), 1);
    assert_eq!(service.subscription_count(), 0);
}

#[tokio::test]
async fn test_unsubscribe_wire_failure_is_swallowed() {
    let router = MockRouter::single_shard();
    let pool = MockBackendPool::new(true);
    let mut config = test_config();
    config.timeout_ms = 100;
    let service = build_service(config, router, Arc::clone(&pool));
    let channel = ChannelName::from("broken-pipe");

    service
        .subscribe(Codec::default(), channel.clone(), Vec::new())
        .await
        .unwrap();

    let conn = pool.created()[0].clone();
    conn.set_auto_ack(false);
    conn.set_fail_sends(true);

    let codec = service
        .unsubscribe(SubscriptionKind::Unsubscribe, channel.clone())
        .await
        .unwrap();

    // The send never reached the backend, but the synthesized
    // acknowledgement still completed the teardown.
    assert!(codec.is_some());
    assert_eq!(service.subscription_count(), 0);
    assert_eq!(pool.released(), vec![conn.id()]);
}

#[tokio::test]
async fn test_unsubscribe_short_circuits_during_shutdown() {
    let router = MockRouter::single_shard();
    let pool = MockBackendPool::new(true);
    let service = build_service(test_config(), Arc::clone(&router), Arc::clone(&pool));
    let channel = ChannelName::from("leaving");

    service
        .subscribe(Codec::default(), channel.clone(), Vec::new())
        .await
        .unwrap();

    router.set_shutting_down(true);
    let codec = service
        .unsubscribe(SubscriptionKind::Unsubscribe, channel.clone())
        .await
        .unwrap();

    assert!(codec.is_none());
    // No teardown hit the wire.
    assert_eq!(
        pool.created()[0].sent_count(SubscriptionKind::Unsubscribe),
        0
    );
}

#[tokio::test]
async fn test_punsubscribe_tears_down_pattern_binding() {
    let router = MockRouter::single_shard();
    let pool = MockBackendPool::new(true);
    let service = build_service(test_config(), router, Arc::clone(&pool));
    let pattern = ChannelName::from("logs.*");

    service
        .psubscribe(Codec::new("text"), pattern.clone(), Vec::new())
        .await
        .unwrap();

    let codec = service
        .unsubscribe(SubscriptionKind::PUnsubscribe, pattern.clone())
        .await
        .unwrap();

    assert_eq!(codec, Some(Codec::new("text")));
    let conn = pool.created()[0].clone();
    assert_eq!(conn.sent_count(SubscriptionKind::PUnsubscribe), 1);
    assert_eq!(service.subscription_count(), 0);
}
