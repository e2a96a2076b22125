//! Load-balancing integration tests: the takeover primitive and the full
//! probe/gossip/reassign loop running across live peers.
//!
//! Quadruple placement is steered through the graph term: the coordinate
//! mapping packs the first bytes of the lexical form, so an ASCII graph
//! IRI lands in the lower half of dimension 0 and a graph IRI starting
//! with a multi-byte UTF-8 character (first byte >= 0x80) lands in the
//! upper half. In a two-peer overlay the bootstrap peer keeps the lower
//! half, so upper-half quads all sit on the joiner.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use tessella::config::OverlayConfig;
use tessella::core::Quadruple;
use tessella::overlay::{OverlayClient, PeerHandle, PeerId, PeerStatus, PeerStub};
use tessella::reasoning::ConjunctiveReasoner;
use tessella::routing::{Request, Response};
use tessella::storage::MemoryDataset;

fn upper_half_quad(i: usize) -> Quadruple {
    Quadruple::parse(&format!("<πg{}> <person{}> <knows> <person{}>", i % 3, i, i + 1)).unwrap()
}

async fn two_peer_overlay(
    config: Arc<OverlayConfig>,
) -> (PeerHandle, PeerHandle, OverlayClient) {
    let first = PeerHandle::bootstrap(config.clone(), Arc::new(MemoryDataset::new())).unwrap();
    let second = PeerHandle::join(config.clone(), Arc::new(MemoryDataset::new()), first.stub())
        .await
        .unwrap();
    let client = OverlayClient::new(
        first.stub().clone(),
        config,
        Arc::new(ConjunctiveReasoner::new()),
    );
    (first, second, client)
}

#[tokio::test]
async fn test_takeover_moves_the_candidate_under_the_loaded_zone() {
    let config = Arc::new(OverlayConfig::default());
    let (first, second, client) = two_peer_overlay(config).await;

    for i in 0..12 {
        client.publish(upper_half_quad(i)).await.unwrap();
    }
    assert_eq!(second.state().await.unwrap().stored_quadruples, 12);
    assert_eq!(first.state().await.unwrap().stored_quadruples, 0);

    // The loaded peer would aim the candidate at its own center; issue the
    // same instruction directly.
    let target = second.state().await.unwrap().zone.unwrap().center();
    let response = first
        .stub()
        .call(
            Request::TakeOver { target, landmark: second.stub().clone() },
            Duration::from_secs(10),
        )
        .await
        .unwrap();
    assert!(matches!(response, Response::Ack));

    // The candidate vacated its old zone and rejoined inside the loaded
    // one, taking the quadruple-heavy half with it.
    let a = first.state().await.unwrap();
    let b = second.state().await.unwrap();
    assert_eq!(a.status, PeerStatus::Activated);
    assert_eq!(b.status, PeerStatus::Activated);
    assert_eq!(a.stored_quadruples, 12);
    assert_eq!(b.stored_quadruples, 0);
    assert!(a.neighbors.iter().any(|(_, _, peer)| *peer == b.id));
    assert!(b.neighbors.iter().any(|(_, _, peer)| *peer == a.id));

    let zone = a.zone.unwrap();
    for quad in (0..12).map(upper_half_quad) {
        assert!(zone.contains(&quad.to_coordinate()));
    }
}

#[tokio::test]
async fn test_takeover_with_unreachable_landmark_is_refused() {
    let only = PeerHandle::bootstrap(
        Arc::new(OverlayConfig::default()),
        Arc::new(MemoryDataset::new()),
    )
    .unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    drop(rx);
    let dead = PeerStub::new(PeerId::random(), tx);
    let target = only.state().await.unwrap().zone.unwrap().center();

    let response = only
        .stub()
        .call(Request::TakeOver { target, landmark: dead }, Duration::from_secs(10))
        .await
        .unwrap();

    // The old zone is gone and the rejoin cannot happen; the peer refuses
    // and terminates rather than lingering zoneless.
    assert!(matches!(response, Response::Refused(_)));
    assert_eq!(only.status(), PeerStatus::Terminated);
}

#[tokio::test]
async fn test_balancer_reassigns_load_through_gossip() {
    let mut config = OverlayConfig::default();
    config.load_balancing.probing_interval_ms = 50;
    // Warmup equal to emergency keeps the relative path quiet until the
    // last publish lands, so no reassignment can race the publish loop.
    config.load_balancing.criteria[0].warmup_threshold = 12.0;
    config.load_balancing.criteria[0].emergency_threshold = 12.0;
    // Gossip every tick instead of only on notable change.
    config.load_balancing.gossip_damping_ratio = 0.0;
    let (first, second, client) = two_peer_overlay(Arc::new(config)).await;

    // Past the emergency threshold on the joiner, while the bootstrap peer
    // stays empty and advertises itself as a candidate through gossip.
    for i in 0..12 {
        client.publish(upper_half_quad(i)).await.unwrap();
    }

    // The overloaded peer needs one gossiped report to pick its candidate,
    // then one probing tick to fire the takeover. The bootstrap peer
    // holding every quadruple proves the reassignment ran: only a takeover
    // moves the loaded half of the space onto it.
    let mut reassigned = false;
    for _ in 0..400 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let a = first.state().await.unwrap();
        let b = second.state().await.unwrap();
        if a.status == PeerStatus::Activated
            && b.status == PeerStatus::Activated
            && a.stored_quadruples == 12
            && b.stored_quadruples == 0
        {
            reassigned = true;
            break;
        }
    }
    assert!(reassigned, "the balancer never moved the load to the candidate");
}
