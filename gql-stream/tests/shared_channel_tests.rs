//! Integration tests for several subscriptions multiplexed over one socket.


use std::sync::Arc;
use std::time::Duration;

use gql_stream::{
    ChannelError, EventKind, Request, SharedChannelProvider, Subscription, SubscriptionState,
};
use serde_json::{json, Value};
use socket_channel::memory::{MemoryPeer, MemoryProvider};
use test_helpers::{expect_outbound, expect_silence, Recorder, WAIT};
use tokio::sync::Notify;

const ENDPOINT: &str = "ws://localhost:4000/graphql";

async fn finished(subscription: &Subscription) -> SubscriptionState {
    tokio::time::timeout(WAIT, subscription.wait_finished())
        .await
        .expect("Timeout waiting for the subscription to finish")
}

/// Collect the next `count` outbound `start` frames, keyed by id.
async fn collect_starts(peer: &mut MemoryPeer, count: usize) -> Vec<Value> {
    let mut starts = Vec::new();
    for _ in 0..count {
        starts.push(expect_outbound(peer, "start").await);
    }
    starts
}

#[tokio::test]
async fn test_two_subscriptions_share_one_socket() {
    let inner = Arc::new(MemoryProvider::new());
    let mut peer = inner.push_pair();
    let shared = Arc::new(SharedChannelProvider::new(inner.clone()));

    let ticks = Subscription::new(Request::new("subscription { ticks }"));
    let news = Subscription::new(Request::new("subscription { news }"));
    let ticks_seen = Recorder::install(&ticks);
    let news_seen = Recorder::install(&news);

    ticks.subscribe(ENDPOINT, shared.clone(), false);
    // One handshake on the wire
    expect_outbound(&mut peer, "connection_init").await;

    news.subscribe(ENDPOINT, shared.clone(), false);
    expect_silence(&mut peer).await;

    peer.push_json(json!({ "type": "connection_ack" }));
    let starts = collect_starts(&mut peer, 2).await;
    let mut ids: Vec<&str> = starts.iter().filter_map(|start| start["id"].as_str()).collect();
    ids.sort_unstable();
    let mut expected = vec![ticks.id(), news.id()];
    expected.sort_unstable();
    assert_eq!(ids, expected);
    assert_eq!(inner.opened_endpoints().len(), 1);

    peer.push_json(json!({ "type": "data", "id": ticks.id(), "payload": { "data": { "tick": 1 } } }));
    peer.push_json(json!({ "type": "data", "id": news.id(), "payload": { "data": { "headline": "x" } } }));
    peer.push_json(json!({ "type": "ka" }));
    peer.push_json(json!({ "type": "complete", "id": ticks.id() }));

    assert_eq!(finished(&ticks).await, SubscriptionState::Terminated);
    assert_eq!(
        ticks_seen.payloads(EventKind::Data),
        vec![json!({ "data": { "tick": 1 } })]
    );

    // The other lane keeps streaming after its neighbour completed
    assert!(news.is_running());
    peer.push_json(json!({ "type": "data", "id": news.id(), "payload": { "data": { "headline": "y" } } }));
    peer.push_json(json!({ "type": "complete", "id": news.id() }));
    assert_eq!(finished(&news).await, SubscriptionState::Terminated);

    assert_eq!(news_seen.count(EventKind::Data), 2);
    assert_eq!(news_seen.count(EventKind::KeepAlive), 1);
    assert_eq!(ticks_seen.count(EventKind::KeepAlive), 1);
    assert_eq!(shared.connection_count().await, 0);
}

#[tokio::test]
async fn test_unsubscribe_stops_only_its_lane() {
    let inner = Arc::new(MemoryProvider::new());
    let mut peer = inner.push_pair();
    let shared = Arc::new(SharedChannelProvider::new(inner.clone()));

    let first = Subscription::new(Request::new("subscription { a }"));
    let second = Subscription::new(Request::new("subscription { b }"));

    first.subscribe(ENDPOINT, shared.clone(), false);
    second.subscribe(ENDPOINT, shared.clone(), false);
    expect_outbound(&mut peer, "connection_init").await;
    peer.push_json(json!({ "type": "connection_ack" }));
    collect_starts(&mut peer, 2).await;

    first.unsubscribe();
    let stop = expect_outbound(&mut peer, "stop").await;
    assert_eq!(stop["id"], first.id());

    tokio::time::timeout(WAIT, async {
        while shared.lane_count(ENDPOINT).await != 1 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("Timeout waiting for the lane to detach");
    assert!(!peer.client_closed());
    assert!(second.is_running());

    second.unsubscribe_and_wait().await;
    assert_eq!(shared.connection_count().await, 0);
}

#[tokio::test]
async fn test_resubscribe_on_shared_socket_keeps_its_route() {
    let inner = Arc::new(MemoryProvider::new());
    let mut peer = inner.push_pair();
    let shared = Arc::new(SharedChannelProvider::new(inner.clone()));

    let keeper = Subscription::new(Request::new("subscription { b }"));
    let subscription = Subscription::new(Request::new("subscription { a }"));
    let seen = Recorder::install(&subscription);

    let entered = Arc::new(Notify::new());
    let entered_clone = Arc::clone(&entered);
    subscription.on(EventKind::Data, move |_event| {
        let entered = Arc::clone(&entered_clone);
        async move {
            entered.notify_one();
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(())
        }
    });

    keeper.subscribe(ENDPOINT, shared.clone(), false);
    subscription.subscribe(ENDPOINT, shared.clone(), false);
    expect_outbound(&mut peer, "connection_init").await;
    peer.push_json(json!({ "type": "connection_ack" }));
    collect_starts(&mut peer, 2).await;

    peer.push_json(json!({ "type": "data", "id": subscription.id(), "payload": { "data": { "n": 1 } } }));
    tokio::time::timeout(WAIT, entered.notified()).await.unwrap();

    subscription.unsubscribe();
    assert!(subscription.subscribe(ENDPOINT, shared.clone(), false));

    // stop for the old run, then start for the new one; no second handshake
    let stop = expect_outbound(&mut peer, "stop").await;
    assert_eq!(stop["id"], subscription.id());
    let start = expect_outbound(&mut peer, "start").await;
    assert_eq!(start["id"], subscription.id());

    peer.push_json(json!({ "type": "data", "id": subscription.id(), "payload": { "data": { "n": 2 } } }));
    peer.push_json(json!({ "type": "complete", "id": subscription.id() }));
    assert_eq!(finished(&subscription).await, SubscriptionState::Terminated);
    assert_eq!(
        seen.payloads(EventKind::Data),
        vec![json!({ "data": { "n": 1 } }), json!({ "data": { "n": 2 } })]
    );
    assert_eq!(inner.opened_endpoints().len(), 1);

    keeper.unsubscribe_and_wait().await;
}

#[tokio::test]
async fn test_socket_failure_reaches_every_subscription() {
    let inner = Arc::new(MemoryProvider::new());
    let mut peer = inner.push_pair();
    let shared = Arc::new(SharedChannelProvider::new(inner.clone()));

    let first = Subscription::new(Request::new("subscription { a }"));
    let second = Subscription::new(Request::new("subscription { b }"));

    first.subscribe(ENDPOINT, shared.clone(), false);
    second.subscribe(ENDPOINT, shared.clone(), false);
    expect_outbound(&mut peer, "connection_init").await;
    peer.push_json(json!({ "type": "connection_ack" }));
    collect_starts(&mut peer, 2).await;

    peer.fail(ChannelError::Transport("connection reset".to_string()));
    assert_eq!(finished(&first).await, SubscriptionState::Errored);
    assert_eq!(finished(&second).await, SubscriptionState::Errored);

    // A fresh subscribe dials a new socket
    let mut replacement = inner.push_pair();
    assert!(first.subscribe(ENDPOINT, shared.clone(), false));
    expect_outbound(&mut replacement, "connection_init").await;
    assert_eq!(inner.opened_endpoints().len(), 2);
}

#[tokio::test]
async fn test_late_subscriber_is_acked_locally() {
    let inner = Arc::new(MemoryProvider::new());
    let mut peer = inner.push_pair();
    let shared = Arc::new(SharedChannelProvider::new(inner.clone()));

    let early = Subscription::new(Request::new("subscription { a }"));
    early.subscribe(ENDPOINT, shared.clone(), false);
    expect_outbound(&mut peer, "connection_init").await;
    peer.push_json(json!({ "type": "connection_ack" }));
    expect_outbound(&mut peer, "start").await;

    let late = Subscription::new(Request::new("subscription { b }"));
    late.subscribe(ENDPOINT, shared.clone(), false);

    // Straight to start: the handshake is not repeated
    let start = expect_outbound(&mut peer, "start").await;
    assert_eq!(start["id"], late.id());

    early.unsubscribe_and_wait().await;
    late.unsubscribe_and_wait().await;
}
