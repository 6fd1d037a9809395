//! Stream bridge driven by an in-memory source.

use std::sync::Arc;
use std::time::Duration;

use lib_realtime::{BridgeConfig, Hub, Record, StreamBridge};
use project_tests::{ChannelSource, RecordingSink};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(2);

fn unit_ids(payloads: &[String]) -> Vec<i64> {
    payloads
        .iter()
        .map(|p| serde_json::from_str::<Record>(p).unwrap().unit_id)
        .collect()
}

#[tokio::test]
async fn malformed_message_is_skipped_and_next_one_delivered() {
    let hub = Arc::new(Hub::new());
    let sink = RecordingSink::new();
    hub.subscribe(sink.clone(), &[586]).await;

    let (feed, source, tracker) = ChannelSource::new();
    let cancel = CancellationToken::new();
    let bridge = StreamBridge::start(
        std::future::ready(Ok(source)),
        Arc::clone(&hub),
        BridgeConfig::default(),
        cancel.clone(),
    )
    .await
    .unwrap();

    feed.send("{this is not json");
    feed.send(r#"{"id":586,"t":1,"pos":{"x":77,"y":43,"s":2}}"#);

    let received = sink.wait_for(1, WAIT).await;
    assert_eq!(unit_ids(&received), vec![586]);
    assert_eq!(tracker.wait_for_acks(2, WAIT).await, vec![0, 1]);

    cancel.cancel();
    bridge.await.unwrap();
    assert!(tracker.is_closed());
}

#[tokio::test]
async fn array_payload_routes_each_record_in_order() {
    let hub = Arc::new(Hub::new());
    let watcher = RecordingSink::new();
    let other = RecordingSink::new();
    hub.subscribe(watcher.clone(), &[1, 2]).await;
    hub.subscribe(other.clone(), &[3]).await;

    let (feed, source, tracker) = ChannelSource::new();
    let cancel = CancellationToken::new();
    let bridge = StreamBridge::start(std::future::ready(Ok(source)), Arc::clone(&hub), BridgeConfig::default(), cancel.clone())
        .await
        .unwrap();

    feed.send(r#"[{"id":2},{"id":1},{"id":3},{"id":2,"address":"Almaty"}]"#);
    feed.send_tombstone();
    feed.send(r#"{"id":9}"#);

    assert_eq!(tracker.wait_for_acks(3, WAIT).await, vec![0, 1, 2]);
    assert_eq!(unit_ids(&watcher.received()), vec![2, 1, 2]);
    assert_eq!(unit_ids(&other.received()), vec![3]);

    cancel.cancel();
    bridge.await.unwrap();
}

#[tokio::test]
async fn messages_without_subscribers_are_still_acknowledged() {
    let hub = Arc::new(Hub::new());
    let (feed, source, tracker) = ChannelSource::new();
    let cancel = CancellationToken::new();
    let bridge = StreamBridge::start(std::future::ready(Ok(source)), hub, BridgeConfig::default(), cancel.clone())
        .await
        .unwrap();

    for id in 0..20 {
        feed.send(format!(r#"{{"id":{id}}}"#));
    }

    let acked = tracker.wait_for_acks(20, WAIT).await;
    assert_eq!(acked, (0..20).collect::<Vec<i64>>());

    cancel.cancel();
    bridge.await.unwrap();
}

#[tokio::test]
async fn cancellation_stops_an_idle_bridge() {
    let (_feed, source, tracker) = ChannelSource::new();
    let cancel = CancellationToken::new();
    let bridge = StreamBridge::start(
        std::future::ready(Ok(source)),
        Arc::new(Hub::new()),
        BridgeConfig::default(),
        cancel.clone(),
    )
    .await
    .unwrap();

    cancel.cancel();
    tokio::time::timeout(WAIT, bridge).await.unwrap().unwrap();
    assert!(tracker.is_closed());
    assert!(tracker.acked().is_empty());
}

#[tokio::test]
async fn slow_session_on_one_partition_does_not_stall_another() {
    let hub = Arc::new(Hub::new());
    let slow = RecordingSink::slow(Duration::from_millis(800));
    let fast = RecordingSink::new();
    hub.subscribe(slow.clone(), &[1]).await;
    hub.subscribe(fast.clone(), &[2]).await;

    let (feed, source, tracker) = ChannelSource::new();
    let cancel = CancellationToken::new();
    let bridge = StreamBridge::start(std::future::ready(Ok(source)), Arc::clone(&hub), BridgeConfig::default(), cancel.clone())
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let slow_offset = feed.send_to(0, r#"{"id":1}"#);
    let fast_offset = feed.send_to(1, r#"{"id":2}"#);

    let received = fast.wait_for(1, WAIT).await;
    assert_eq!(unit_ids(&received), vec![2]);
    assert!(started.elapsed() < Duration::from_millis(400));

    assert_eq!(tracker.wait_for_acks(2, WAIT).await, vec![fast_offset, slow_offset]);
    assert_eq!(unit_ids(&slow.received()), vec![1]);

    cancel.cancel();
    bridge.await.unwrap();
}

#[tokio::test]
async fn order_is_kept_within_each_partition() {
    let hub = Arc::new(Hub::new());
    let watcher = RecordingSink::new();
    hub.subscribe(watcher.clone(), &[1, 2]).await;

    let (feed, source, tracker) = ChannelSource::new();
    let cancel = CancellationToken::new();
    let bridge = StreamBridge::start(std::future::ready(Ok(source)), Arc::clone(&hub), BridgeConfig::default(), cancel.clone())
        .await
        .unwrap();

    for t in 0..10 {
        feed.send_to(t % 2, format!(r#"{{"id":{},"t":{t}}}"#, 1 + t % 2));
    }
    tracker.wait_for_acks(10, WAIT).await;

    let records: Vec<Record> = watcher
        .received()
        .iter()
        .map(|p| serde_json::from_str(p).unwrap())
        .collect();
    for unit in [1, 2] {
        let types: Vec<i32> = records.iter().filter(|r| r.unit_id == unit).map(|r| r.record_type).collect();
        let mut sorted = types.clone();
        sorted.sort();
        assert_eq!(types.len(), 5);
        assert_eq!(types, sorted);
    }

    cancel.cancel();
    bridge.await.unwrap();
}
