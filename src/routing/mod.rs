//! Request/response message model and the three routing modes.
//!
//! Requests are a tagged enum: each variant names its delivery shape
//! explicitly (point unicast, region multicast, direct control call) and
//! carries a plain payload with no transient state; everything a handler
//! needs is reconstructible from the message alone. The actual forwarding
//! decisions are pure functions over a zone and a neighbor-table snapshot,
//! so the peer can take them without holding any lock.

use std::fmt;
use std::time::Duration;

use rand::Rng;

use crate::core::{Quadruple, QuadruplePattern};
use crate::geometry::{Coordinate, Direction, Element, Region, SplitHistory, Zone};
use crate::overlay::neighbor_table::NeighborEntry;
use crate::overlay::stub::{PeerId, PeerStub};
use crate::overlay::PeerStatus;
use crate::pubsub::{NotificationSink, Subscription, SubscriptionId};

/// Identifier of one routed request, used for background-result harvesting
/// and duplicate suppression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    /// Draw a fresh random identifier.
    pub fn random() -> Self {
        RequestId(rand::thread_rng().gen())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Errors raised by the routing layer.
#[derive(Debug)]
pub enum RoutingError {
    /// No neighbor is closer to the target than the current peer, even
    /// after a refresh; topology inconsistency.
    DeadEnd(Coordinate),
    /// The hop budget ran out before delivery.
    HopLimit(Coordinate),
    /// The peer behind a stub is gone.
    Unreachable(PeerId),
    /// A peer did not answer within the request timeout.
    Timeout(PeerId),
    /// A handler replied with a response of the wrong shape.
    UnexpectedResponse(&'static str),
}

impl fmt::Display for RoutingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingError::DeadEnd(target) => {
                write!(f, "routing dead end: no neighbor closer to {}", target)
            }
            RoutingError::HopLimit(target) => {
                write!(f, "hop budget exhausted before reaching {}", target)
            }
            RoutingError::Unreachable(peer) => write!(f, "peer {} unreachable", peer),
            RoutingError::Timeout(peer) => write!(f, "request to peer {} timed out", peer),
            RoutingError::UnexpectedResponse(expected) => {
                write!(f, "unexpected response shape, wanted {}", expected)
            }
        }
    }
}

impl std::error::Error for RoutingError {}

/// The local action a routed request performs at its destination(s).
#[derive(Debug, Clone)]
pub enum Action {
    /// Store a quadruple and notify matching subscribers.
    Publish(Quadruple),
    /// Collect stored quadruples matching the pattern.
    Query(QuadruplePattern),
    /// Index a subscription on every peer its patterns concern.
    Subscribe(Subscription, Option<NotificationSink>),
    /// Remove a subscription everywhere (idempotent).
    Unsubscribe(SubscriptionId),
    /// Delete stored quadruples matching the pattern.
    Delete(QuadruplePattern),
    /// Introduce a joining peer to the owner of the target coordinate.
    Introduce(JoinerInfo),
    /// Network-wide orderly shutdown.
    Shutdown,
}

impl Action {
    /// Short action name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Action::Publish(_) => "publish",
            Action::Query(_) => "query",
            Action::Subscribe(..) => "subscribe",
            Action::Unsubscribe(_) => "unsubscribe",
            Action::Delete(_) => "delete",
            Action::Introduce(_) => "introduce",
            Action::Shutdown => "shutdown",
        }
    }
}

/// Identity and stub of a peer asking to join.
#[derive(Debug, Clone)]
pub struct JoinerInfo {
    /// The joiner's identifier.
    pub id: PeerId,
    /// The joiner's stub, seeded into neighbor tables on grant.
    pub stub: PeerStub,
}

/// Where a routed request is going.
#[derive(Debug, Clone)]
pub enum RouteTarget {
    /// Unicast to the peer owning the coordinate.
    Point(Coordinate),
    /// Multicast to every peer whose zone intersects the region; the full
    /// space makes this a broadcast.
    Region(Region),
}

/// A request travelling across the overlay.
#[derive(Debug, Clone)]
pub struct RoutedRequest {
    /// Request identifier, stable across hops.
    pub id: RequestId,
    /// Delivery shape and destination.
    pub target: RouteTarget,
    /// What to do on arrival.
    pub action: Action,
    /// Hops travelled so far.
    pub hops: u32,
    /// Remaining hop budget (unicast only).
    pub hops_left: u32,
    /// Peers already visited (multicast only).
    pub visited: Vec<PeerId>,
}

impl RoutedRequest {
    /// A fresh unicast request.
    pub fn unicast(target: Coordinate, action: Action, max_hops: u32) -> Self {
        RoutedRequest {
            id: RequestId::random(),
            target: RouteTarget::Point(target),
            action,
            hops: 0,
            hops_left: max_hops,
            visited: Vec::new(),
        }
    }

    /// Hop budget for the transit leg of a multicast entering the overlay
    /// outside its target region.
    const TRANSIT_BUDGET: u32 = 64;

    /// A fresh multicast request.
    pub fn multicast(region: Region, action: Action) -> Self {
        RoutedRequest {
            id: RequestId::random(),
            target: RouteTarget::Region(region),
            action,
            hops: 0,
            hops_left: Self::TRANSIT_BUDGET,
            visited: Vec::new(),
        }
    }

    /// A fresh broadcast request (multicast over the full space).
    pub fn broadcast(dimensions: usize, action: Action) -> Self {
        Self::multicast(Region::full(dimensions), action)
    }
}

/// Everything a leaving peer hands to the neighbor absorbing its zone.
#[derive(Debug)]
pub struct AbsorbPayload {
    /// The departing peer.
    pub leaver: PeerId,
    /// The zone to reabsorb.
    pub zone: Zone,
    /// Dimension of the split being undone.
    pub dimension: usize,
    /// The cut element of the split being undone.
    pub boundary: Element,
    /// The leaver's remaining split history.
    pub history: SplitHistory,
    /// Stored quadruples moving with the zone.
    pub quads: Vec<Quadruple>,
    /// Subscriptions concerning the zone, with sinks when known.
    pub subscriptions: Vec<(Subscription, Option<NotificationSink>)>,
    /// The leaver's neighbor entries, for table stitching.
    pub neighbors: Vec<NeighborEntry>,
}

/// Half a zone plus everything that travels with it, granted to a joiner.
#[derive(Debug)]
pub struct JoinGrant {
    /// The joiner's new zone.
    pub zone: Zone,
    /// Split history inherited with the zone half.
    pub history: SplitHistory,
    /// Stored quadruples now owned by the joiner.
    pub quads: Vec<Quadruple>,
    /// Subscriptions concerning the joiner's zone.
    pub subscriptions: Vec<(Subscription, Option<NotificationSink>)>,
    /// Neighbor candidates (the splitter's neighbors plus the splitter).
    pub neighbors: Vec<NeighborEntry>,
    /// Hops the introduce travelled before reaching the splitter.
    pub hops: u32,
}

/// Introspection snapshot returned by `Request::GetState`.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    /// The peer's identifier.
    pub id: PeerId,
    /// Lifecycle status.
    pub status: PeerStatus,
    /// Current zone, absent before activation.
    pub zone: Option<Zone>,
    /// (dimension, direction, peer) of every neighbor entry.
    pub neighbors: Vec<(usize, Direction, PeerId)>,
    /// Quadruples currently stored (reserved graphs excluded).
    pub stored_quadruples: u64,
    /// Length of the split history.
    pub history_len: usize,
}

/// A message deliverable to a peer's inbox.
#[derive(Debug)]
pub enum Request {
    /// A request routed over the coordinate space.
    Routed(RoutedRequest),
    /// Direct: ask for the peer's current zone (neighbor refresh).
    GetZone,
    /// Direct: introspection snapshot (tests, demos, monitoring).
    GetState,
    /// Direct: a neighbor's zone changed; re-place it in the table.
    UpdateNeighbor {
        /// The neighbor's identity.
        peer: PeerId,
        /// Its stub.
        stub: PeerStub,
        /// Its current zone.
        zone: Zone,
    },
    /// Direct: a peer left; drop it from the table (idempotent).
    RemoveNeighbor {
        /// The departed peer.
        peer: PeerId,
    },
    /// Direct: absorb a leaving neighbor's zone slice.
    Absorb(Box<AbsorbPayload>),
    /// Direct: instruct the peer to leave the overlay gracefully.
    Leave,
    /// Direct: leave the current zone and rejoin at `target` (load
    /// balancing reassignment, composed of the leave and join primitives).
    TakeOver {
        /// Where to rejoin.
        target: Coordinate,
        /// Stub of the instructing peer, used as the rejoin landmark.
        landmark: PeerStub,
    },
    /// Fire-and-forget gossip push carrying a bincode-encoded load report.
    Gossip {
        /// Stub of the sender, cached for later reassignment calls.
        from: PeerStub,
        /// Encoded [`crate::load::LoadReport`].
        report: Vec<u8>,
    },
}

/// Replies travelling the reverse path.
#[derive(Debug)]
pub enum Response {
    /// Plain acknowledgement.
    Ack,
    /// A takeover instruction was declined.
    Refused(String),
    /// Unicast delivery succeeded after `hops` hops.
    Delivered {
        /// Hops travelled to the destination.
        hops: u32,
    },
    /// Aggregated multicast outcome.
    Outcome(MulticastOutcome),
    /// A join was granted.
    JoinGrant(Box<JoinGrant>),
    /// The peer's current zone.
    Zone(Zone),
    /// Introspection snapshot.
    State(Box<PeerSnapshot>),
}

impl Response {
    /// Unwrap an outcome response.
    pub fn into_outcome(self) -> Result<MulticastOutcome, RoutingError> {
        match self {
            Response::Outcome(outcome) => Ok(outcome),
            _ => Err(RoutingError::UnexpectedResponse("outcome")),
        }
    }

    /// Unwrap a zone response.
    pub fn into_zone(self) -> Result<Zone, RoutingError> {
        match self {
            Response::Zone(zone) => Ok(zone),
            _ => Err(RoutingError::UnexpectedResponse("zone")),
        }
    }
}

/// Merged result of a multicast/broadcast, aggregated on the reverse path.
#[derive(Debug, Default, Clone)]
pub struct MulticastOutcome {
    /// Concatenated (deduplicated) matching quadruples.
    pub quads: Vec<Quadruple>,
    /// Maximum forwarding depth reached.
    pub hops: u32,
    /// Number of peers that executed the action.
    pub peers_visited: u32,
    /// Maximum single-peer handler latency observed.
    pub elapsed_max: Duration,
}

impl MulticastOutcome {
    /// Fold a child branch's outcome into this one: lists concatenate,
    /// depth and latency merge by max, visit counts sum.
    pub fn merge(&mut self, other: MulticastOutcome) {
        for quad in other.quads {
            if !self.quads.contains(&quad) {
                self.quads.push(quad);
            }
        }
        self.hops = self.hops.max(other.hops);
        self.peers_visited += other.peers_visited;
        self.elapsed_max = self.elapsed_max.max(other.elapsed_max);
    }
}

/// Greedy unicast next hop: among neighbors strictly closer to the target
/// than the current zone, the one minimizing remaining distance.
pub fn unicast_next_hop<'a>(
    own_zone: &Zone,
    neighbors: &'a [NeighborEntry],
    target: &Coordinate,
) -> Option<&'a NeighborEntry> {
    let own_distance = own_zone.distance(target);
    neighbors
        .iter()
        .map(|entry| (entry.zone.distance(target), entry))
        .filter(|(distance, _)| *distance < own_distance)
        .min_by_key(|(distance, _)| *distance)
        .map(|(_, entry)| entry)
}

/// Multicast forwarding set: neighbors whose zone intersects the region
/// and which the message has not yet visited.
pub fn multicast_targets<'a>(
    neighbors: &'a [NeighborEntry],
    region: &Region,
    visited: &[PeerId],
) -> Vec<&'a NeighborEntry> {
    neighbors
        .iter()
        .filter(|entry| entry.zone.overlaps(region) && !visited.contains(&entry.peer))
        .collect()
}
