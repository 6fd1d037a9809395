//! Fan-out behavior of the subscription hub with many sessions.

use std::sync::Arc;
use std::time::{Duration, Instant};

use lib_realtime::{Hub, Record, SessionSink};
use project_tests::RecordingSink;

fn record(unit_id: i64) -> Record {
    serde_json::from_str(&format!(r#"{{"id":{unit_id},"t":1,"pos":{{"x":77,"y":43}}}}"#)).unwrap()
}

fn ids(sink: &RecordingSink) -> Vec<i64> {
    sink.received()
        .iter()
        .map(|p| serde_json::from_str::<Record>(p).unwrap().unit_id)
        .collect()
}

#[tokio::test]
async fn each_session_gets_only_its_units() {
    let hub = Hub::new();
    let a = RecordingSink::new();
    let b = RecordingSink::new();
    let c = RecordingSink::new();
    hub.subscribe(a.clone(), &[1, 2]).await;
    hub.subscribe(b.clone(), &[2, 3]).await;
    hub.subscribe(c.clone(), &[4]).await;

    assert_eq!(hub.broadcast(1, &record(1)).await, 1);
    assert_eq!(hub.broadcast(2, &record(2)).await, 2);
    assert_eq!(hub.broadcast(3, &record(3)).await, 1);
    assert_eq!(hub.broadcast(5, &record(5)).await, 0);

    assert_eq!(ids(&a), vec![1, 2]);
    assert_eq!(ids(&b), vec![2, 3]);
    assert!(c.received().is_empty());
}

#[tokio::test]
async fn broken_session_does_not_starve_the_rest() {
    let hub = Hub::new();
    let healthy: Vec<Arc<RecordingSink>> = (0..5).map(|_| RecordingSink::new()).collect();
    let broken = RecordingSink::broken();

    for sink in &healthy {
        hub.subscribe(sink.clone(), &[586]).await;
    }
    hub.subscribe(broken.clone(), &[586, 102]).await;

    assert_eq!(hub.broadcast(586, &record(586)).await, 5);
    assert!(broken.is_closed());
    assert!(!hub.is_subscribed(broken.id(), 102).await);
    assert_eq!(hub.session_count(586).await, 5);

    assert_eq!(hub.broadcast(586, &record(586)).await, 5);
    for sink in &healthy {
        assert_eq!(sink.received().len(), 2);
    }
}

#[tokio::test]
async fn slow_sessions_are_served_concurrently() {
    let hub = Hub::new();
    let delay = Duration::from_millis(100);
    let slow: Vec<Arc<RecordingSink>> = (0..8).map(|_| RecordingSink::slow(delay)).collect();
    for sink in &slow {
        hub.subscribe(sink.clone(), &[7]).await;
    }

    let started = Instant::now();
    assert_eq!(hub.broadcast(7, &record(7)).await, 8);
    assert!(started.elapsed() < delay * 4, "pushes ran one after another");
}

#[tokio::test]
async fn concurrent_subscribe_broadcast_unsubscribe() {
    let hub = Arc::new(Hub::new());
    let sinks: Vec<Arc<RecordingSink>> = (0..32).map(|_| RecordingSink::new()).collect();

    let mut tasks = Vec::new();
    for (i, sink) in sinks.iter().enumerate() {
        let hub = Arc::clone(&hub);
        let sink = sink.clone();
        tasks.push(tokio::spawn(async move {
            hub.subscribe(sink.clone(), &[(i % 4) as i64]).await;
            for _ in 0..10 {
                hub.broadcast((i % 4) as i64, &record((i % 4) as i64)).await;
                tokio::task::yield_now().await;
            }
            hub.unsubscribe(sink.id()).await;
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(hub.unit_count().await, 0);
    for sink in &sinks {
        // Each session saw at least its own ten broadcasts.
        assert!(sink.received().len() >= 10);
    }
}

#[tokio::test]
async fn shutdown_closes_each_session_once_and_empties_registry() {
    let hub = Hub::new();
    let a = RecordingSink::new();
    let b = RecordingSink::new();
    hub.subscribe(a.clone(), &[1, 2, 3]).await;
    hub.subscribe(b.clone(), &[3]).await;

    assert_eq!(hub.shutdown().await, 2);
    assert!(a.is_closed());
    assert!(b.is_closed());
    assert_eq!(hub.unit_count().await, 0);
    assert_eq!(hub.broadcast(3, &record(3)).await, 0);
}
