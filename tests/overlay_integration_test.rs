//! Overlay lifecycle integration tests: bootstrap, join splits, graceful
//! leave and the neighbor bookkeeping around them.

use std::sync::Arc;

use tessella::config::OverlayConfig;
use tessella::core::{Quadruple, QuadruplePattern};
use tessella::geometry::{Coordinate, Element};
use tessella::overlay::{OverlayClient, PeerHandle, PeerStatus};
use tessella::reasoning::ConjunctiveReasoner;
use tessella::storage::MemoryDataset;

fn config() -> Arc<OverlayConfig> {
    Arc::new(OverlayConfig::default())
}

fn store() -> Arc<MemoryDataset> {
    Arc::new(MemoryDataset::new())
}

fn client(entry: &PeerHandle, config: Arc<OverlayConfig>) -> OverlayClient {
    OverlayClient::new(entry.stub().clone(), config, Arc::new(ConjunctiveReasoner::new()))
}

#[tokio::test]
async fn test_bootstrap_then_join_splits_first_dimension() {
    let config = config();
    let first = PeerHandle::bootstrap(config.clone(), store()).unwrap();
    let second = PeerHandle::join(config.clone(), store(), first.stub()).await.unwrap();

    assert_eq!(first.status(), PeerStatus::Activated);
    assert_eq!(second.status(), PeerStatus::Activated);

    let a = first.state().await.unwrap();
    let b = second.state().await.unwrap();

    // The full space is cut at the midpoint of dimension 0; the splitter
    // keeps the lower half and the joiner takes the upper half.
    let mid = Element::MAX / 2;
    let a_zone = a.zone.unwrap();
    let b_zone = b.zone.unwrap();
    assert_eq!(a_zone.interval(0).lower, 0);
    assert_eq!(a_zone.interval(0).upper, mid);
    assert_eq!(b_zone.interval(0).lower, mid);
    assert_eq!(b_zone.interval(0).upper, Element::MAX);
    for dim in 1..config.dimensions {
        assert_eq!(a_zone.interval(dim).lower, 0);
        assert_eq!(a_zone.interval(dim).upper, Element::MAX);
        assert_eq!(b_zone.interval(dim), a_zone.interval(dim));
    }

    assert_eq!(a.history_len, 1);
    assert_eq!(b.history_len, 1);
    assert!(a.neighbors.iter().any(|(_, _, peer)| *peer == b.id));
    assert!(b.neighbors.iter().any(|(_, _, peer)| *peer == a.id));
}

#[tokio::test]
async fn test_eight_joins_partition_the_space() {
    let config = config();
    let first = PeerHandle::bootstrap(config.clone(), store()).unwrap();
    let mut peers = vec![first];
    for _ in 0..7 {
        let landmark = peers[0].stub().clone();
        peers.push(PeerHandle::join(config.clone(), store(), &landmark).await.unwrap());
    }

    let mut zones = Vec::new();
    for peer in &peers {
        let snapshot = peer.state().await.unwrap();
        assert_eq!(snapshot.status, PeerStatus::Activated);
        assert!(!snapshot.neighbors.is_empty());
        zones.push(snapshot.zone.unwrap());
    }

    // Any coordinate belongs to exactly one zone.
    let step = Element::MAX / 7;
    for i in 0..8u64 {
        for j in 0..8u64 {
            let probe = Coordinate::new(vec![
                step.saturating_mul(i),
                step.saturating_mul(j),
                step.saturating_mul((i + j) % 8),
                step.saturating_mul(7 - i.min(7)),
            ]);
            let owners = zones.iter().filter(|zone| zone.contains(&probe)).count();
            assert_eq!(owners, 1, "coordinate {:?} owned by {} zones", probe, owners);
        }
    }
}

#[tokio::test]
async fn test_leave_returns_zone_to_absorber() {
    let config = config();
    let first = PeerHandle::bootstrap(config.clone(), store()).unwrap();
    let second = PeerHandle::join(config.clone(), store(), first.stub()).await.unwrap();

    second.leave().await.unwrap();
    assert_eq!(second.status(), PeerStatus::Terminated);

    let a = first.state().await.unwrap();
    let zone = a.zone.unwrap();
    // The absorber owns the full space again and the replayed history entry
    // is gone with it.
    for dim in 0..config.dimensions {
        assert_eq!(zone.interval(dim).lower, 0);
        assert_eq!(zone.interval(dim).upper, Element::MAX);
    }
    assert_eq!(a.history_len, 0);
    assert!(a.neighbors.is_empty());
}

#[tokio::test]
async fn test_leaver_hands_its_quadruples_to_the_absorber() {
    let config = config();
    let first = PeerHandle::bootstrap(config.clone(), store()).unwrap();
    let second = PeerHandle::join(config.clone(), store(), first.stub()).await.unwrap();
    let client = client(&first, config.clone());

    for i in 0..20 {
        let quad = Quadruple::parse(&format!("<g> <person{}> <knows> <person{}>", i, i + 1))
            .unwrap();
        client.publish(quad).await.unwrap();
    }

    second.leave().await.unwrap();

    let outcome = client
        .query(QuadruplePattern::parse("?g ?s <knows> ?o").unwrap())
        .await
        .unwrap();
    assert_eq!(outcome.quads.len(), 20);
    assert_eq!(outcome.peers_visited, 1);
}

#[tokio::test]
async fn test_remaining_peers_forget_the_leaver() {
    let config = config();
    let first = PeerHandle::bootstrap(config.clone(), store()).unwrap();
    let second = PeerHandle::join(config.clone(), store(), first.stub()).await.unwrap();
    let third = PeerHandle::join(config.clone(), store(), first.stub()).await.unwrap();

    let leaver = third.id();
    third.leave().await.unwrap();

    for peer in [&first, &second] {
        let snapshot = peer.state().await.unwrap();
        assert!(
            snapshot.neighbors.iter().all(|(_, _, id)| *id != leaver),
            "peer {} still lists the leaver as neighbor",
            snapshot.id
        );
    }
}

#[tokio::test]
async fn test_sole_peer_leave_empties_the_overlay() {
    let only = PeerHandle::bootstrap(config(), store()).unwrap();
    only.leave().await.unwrap();
    assert_eq!(only.status(), PeerStatus::Terminated);

    // The inbox may still drain a last introspection request while it winds
    // down; any answer it gives must already show the terminal state.
    if let Ok(snapshot) = only.state().await {
        assert_eq!(snapshot.status, PeerStatus::Terminated);
        assert!(snapshot.zone.is_none());
    }
}
