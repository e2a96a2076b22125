//! Publish/subscribe integration tests: notification delivery, removal,
//! reserved-graph isolation and subscriptions surviving zone splits.

use std::sync::Arc;

use tessella::config::OverlayConfig;
use tessella::core::{Quadruple, QuadruplePattern};
use tessella::overlay::{OverlayClient, PeerHandle};
use tessella::reasoning::ConjunctiveReasoner;
use tessella::storage::MemoryDataset;

fn config() -> Arc<OverlayConfig> {
    Arc::new(OverlayConfig::default())
}

fn client(entry: &PeerHandle, config: Arc<OverlayConfig>) -> OverlayClient {
    OverlayClient::new(entry.stub().clone(), config, Arc::new(ConjunctiveReasoner::new()))
}

fn quad(line: &str) -> Quadruple {
    Quadruple::parse(line).unwrap()
}

fn pattern(line: &str) -> QuadruplePattern {
    QuadruplePattern::parse(line).unwrap()
}

#[tokio::test]
async fn test_matching_publish_notifies_the_subscriber() {
    let config = config();
    let first = PeerHandle::bootstrap(config.clone(), Arc::new(MemoryDataset::new())).unwrap();
    let _second = PeerHandle::join(config.clone(), Arc::new(MemoryDataset::new()), first.stub())
        .await
        .unwrap();
    let client = client(&first, config);

    let mut notifications = client
        .subscribe("watch-knows".to_string(), vec![pattern("?g ?s <knows> ?o")])
        .await
        .unwrap();

    let published = quad("<g1> <alice> <knows> <bob>");
    client.publish(published.clone()).await.unwrap();

    // Delivery happens on the storing peer before the publish is
    // acknowledged, so the notification is already queued.
    let notification = notifications.try_recv().unwrap();
    assert_eq!(notification.subscription_id, "watch-knows");
    assert_eq!(notification.quad, published);
}

#[tokio::test]
async fn test_non_matching_publish_stays_silent() {
    let config = config();
    let first = PeerHandle::bootstrap(config.clone(), Arc::new(MemoryDataset::new())).unwrap();
    let client = client(&first, config);

    let mut notifications = client
        .subscribe("watch-knows".to_string(), vec![pattern("?g ?s <knows> ?o")])
        .await
        .unwrap();

    client.publish(quad("<g1> <alice> <likes> <bob>")).await.unwrap();
    assert!(notifications.try_recv().is_err());
}

#[tokio::test]
async fn test_unsubscribe_stops_notifications() {
    let config = config();
    let first = PeerHandle::bootstrap(config.clone(), Arc::new(MemoryDataset::new())).unwrap();
    let client = client(&first, config);

    let mut notifications = client
        .subscribe("watch-knows".to_string(), vec![pattern("?g ?s <knows> ?o")])
        .await
        .unwrap();

    client.publish(quad("<g1> <alice> <knows> <bob>")).await.unwrap();
    assert!(notifications.try_recv().is_ok());

    client.unsubscribe("watch-knows".to_string()).await.unwrap();
    client.publish(quad("<g1> <bob> <knows> <carol>")).await.unwrap();
    assert!(notifications.try_recv().is_err());
}

#[tokio::test]
async fn test_unsubscribe_unknown_id_is_a_noop() {
    let config = config();
    let first = PeerHandle::bootstrap(config.clone(), Arc::new(MemoryDataset::new())).unwrap();
    let client = client(&first, config);

    client.unsubscribe("never-registered".to_string()).await.unwrap();
}

#[tokio::test]
async fn test_subscription_records_stay_out_of_query_results() {
    let config = config();
    let first = PeerHandle::bootstrap(config.clone(), Arc::new(MemoryDataset::new())).unwrap();
    let client = client(&first, config);

    let _notifications = client
        .subscribe("watch-knows".to_string(), vec![pattern("?g ?s <knows> ?o")])
        .await
        .unwrap();

    // The registry persists subscriptions as quadruples in a reserved
    // graph; a wildcard query must never surface them.
    let outcome = client.query(pattern("?g ?s ?p ?o")).await.unwrap();
    assert!(outcome.quads.is_empty());
}

#[tokio::test]
async fn test_subscription_follows_the_zone_across_a_split() {
    let config = config();
    let first = PeerHandle::bootstrap(config.clone(), Arc::new(MemoryDataset::new())).unwrap();
    let client = client(&first, config.clone());

    // Register while the first peer owns everything, then let a join carve
    // the space up. The subscription slice and its sink move with the
    // granted half.
    let mut notifications = client
        .subscribe("watch-knows".to_string(), vec![pattern("?g ?s <knows> ?o")])
        .await
        .unwrap();

    let _second = PeerHandle::join(config.clone(), Arc::new(MemoryDataset::new()), first.stub())
        .await
        .unwrap();

    let mut delivered = 0;
    for i in 0..10 {
        let published = quad(&format!("<g{}> <person{}> <knows> <person{}>", i, i, i + 1));
        client.publish(published).await.unwrap();
        delivered += 1;
    }

    for _ in 0..delivered {
        assert!(notifications.try_recv().is_ok(), "a notification went missing");
    }
    assert!(notifications.try_recv().is_err());
}
