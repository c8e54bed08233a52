// tests/integration/listener_test.rs

//! Listener management tests: detach by value and by id, and the
//! last-listener-out teardown.

use std::sync::Arc;

use submux::core::connection::PubSubConnection;
use submux::core::protocol::{ChannelName, Codec, SubscriptionKind};

use super::fixtures::{MockBackendPool, MockRouter, RecordingListener, build_service, test_config};

#[tokio::test]
async fn test_last_listener_removal_triggers_unsubscribe() {
    let router = MockRouter::single_shard();
    let pool = MockBackendPool::new(true);
    let service = build_service(test_config(), router, Arc::clone(&pool));
    let channel = ChannelName::from("x");

    let recorder = RecordingListener::new();
    let listener = recorder.listener();
    service
        .subscribe(Codec::default(), channel.clone(), vec![listener.clone()])
        .await
        .unwrap();

    service
        .remove_listener(SubscriptionKind::Subscribe, channel.clone(), &[listener])
        .await
        .unwrap();

    let conn = pool.created()[0].clone();
    assert_eq!(conn.sent_count(SubscriptionKind::Unsubscribe), 1);
    assert!(service.get_pubsub_entry(&channel).is_none());
    // The connection's ref-count hit zero, so it went back to the pool.
    assert_eq!(pool.released(), vec![conn.id()]);
}

#[tokio::test]
async fn test_removing_one_of_two_listeners_keeps_subscription() {
    let router = MockRouter::single_shard();
    let pool = MockBackendPool::new(true);
    let service = build_service(test_config(), router, Arc::clone(&pool));
    let channel = ChannelName::from("shared");

    let first = RecordingListener::new();
    let second = RecordingListener::new();
    let first_listener = first.listener();
    let entry = service
        .subscribe(
            Codec::default(),
            channel.clone(),
            vec![first_listener.clone(), second.listener()],
        )
        .await
        .unwrap();

    service
        .remove_listener_ids(
            SubscriptionKind::Subscribe,
            channel.clone(),
            &[first_listener.id()],
        )
        .await
        .unwrap();

    assert!(entry.has_listeners(&channel));
    assert_eq!(entry.listeners_of(&channel).len(), 1);
    let conn = pool.created()[0].clone();
    assert_eq!(conn.sent_count(SubscriptionKind::Unsubscribe), 0);
    assert!(service.get_pubsub_entry(&channel).is_some());
}

#[tokio::test]
async fn test_remove_listener_for_absent_channel_is_a_no_op() {
    let router = MockRouter::single_shard();
    let pool = MockBackendPool::new(true);
    let service = build_service(test_config(), router, pool);

    service
        .remove_listener_ids(SubscriptionKind::Subscribe, "ghost", &[42])
        .await
        .unwrap();
    assert_eq!(service.subscription_count(), 0);
}

#[tokio::test]
async fn test_remove_pattern_listener_issues_punsubscribe() {
    let router = MockRouter::single_shard();
    let pool = MockBackendPool::new(true);
    let service = build_service(test_config(), router, Arc::clone(&pool));
    let pattern = ChannelName::from("alerts.*");

    let recorder = RecordingListener::new();
    let listener = recorder.listener();
    service
        .psubscribe(Codec::default(), pattern.clone(), vec![listener.clone()])
        .await
        .unwrap();

    service
        .remove_listener(SubscriptionKind::PSubscribe, pattern.clone(), &[listener])
        .await
        .unwrap();

    let conn = pool.created()[0].clone();
    assert_eq!(conn.sent_count(SubscriptionKind::PUnsubscribe), 1);
    assert_eq!(service.subscription_count(), 0);
}
