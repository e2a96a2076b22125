//! The peer actor.
//!
//! Each peer is one tokio task owning an inbox; every accepted envelope is
//! handled on its own task after passing the operation gate, so read-only
//! traffic flows concurrently while conflicting lifecycle mutations are
//! serialized. All mutable state lives behind a `RwLock` held only across
//! synchronous sections, never across an await point.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use futures_util::future::join_all;
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::config::OverlayConfig;
use crate::core::{Quadruple, QuadruplePattern, RdfTerm};
use crate::dispatch::RequestDispatcher;
use crate::error::Error;
use crate::geometry::{Coordinate, Direction, SplitEntry, SplitHistory, Zone};
use crate::load::{
    build_criteria, classify, select_candidate, should_gossip, weights, LoadClass,
    LoadCriterion, LoadProbe, LoadReport, ReportCache,
};
use crate::overlay::cache::BoundedCache;
use crate::overlay::gate::{OperationGate, OperationKind};
use crate::overlay::neighbor_table::{NeighborEntry, NeighborTable};
use crate::overlay::stub::{Envelope, PeerId, PeerStub};
use crate::overlay::{LifecycleError, PeerStatus};
use crate::pubsub::{self, Notification, SubscriptionRegistry};
use crate::routing::{
    multicast_targets, unicast_next_hop, AbsorbPayload, Action, JoinGrant, JoinerInfo,
    MulticastOutcome, PeerSnapshot, Request, RequestId, Response, RouteTarget, RoutedRequest,
    RoutingError,
};
use crate::storage::{AccessMode, DatasetGraph};

/// Mutable per-peer overlay state, owned by the peer's operation
/// serialization.
struct PeerState {
    status: PeerStatus,
    zone: Option<Zone>,
    table: NeighborTable,
    history: SplitHistory,
}

struct PeerShared {
    id: PeerId,
    config: Arc<OverlayConfig>,
    state: RwLock<PeerState>,
    gate: OperationGate,
    store: Arc<dyn DatasetGraph>,
    subscriptions: SubscriptionRegistry,
    dispatcher: RequestDispatcher,
    seen: Mutex<BoundedCache<RequestId, ()>>,
    stub_cache: Mutex<BoundedCache<PeerId, PeerStub>>,
    reports: Mutex<ReportCache>,
    criteria: Vec<Box<dyn LoadCriterion>>,
    handling_imbalance: AtomicBool,
    requests_in_window: AtomicU64,
    last_gossiped: Mutex<Option<LoadReport>>,
    self_stub: PeerStub,
    closing: Notify,
}

impl PeerShared {
    fn read(&self) -> RwLockReadGuard<'_, PeerState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, PeerState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn status(&self) -> PeerStatus {
        self.read().status
    }
}

/// Handle owned by whoever started the peer: its stub plus convenience
/// accessors. Dropping the handle does not stop the peer; use
/// [`PeerHandle::leave`].
#[derive(Clone)]
pub struct PeerHandle {
    stub: PeerStub,
    shared: Arc<PeerShared>,
}

/// A pattern with every position variable: matches all stored quadruples.
fn wildcard() -> QuadruplePattern {
    QuadruplePattern::new(
        RdfTerm::Variable("g".to_string()),
        RdfTerm::Variable("s".to_string()),
        RdfTerm::Variable("p".to_string()),
        RdfTerm::Variable("o".to_string()),
    )
}

fn random_coordinate(dimensions: usize) -> Coordinate {
    let mut rng = rand::thread_rng();
    Coordinate::new((0..dimensions).map(|_| rng.gen()).collect())
}

impl PeerHandle {
    /// Start the first peer of a new overlay: it owns the full space and
    /// activates immediately.
    pub fn bootstrap(config: Arc<OverlayConfig>, store: Arc<dyn DatasetGraph>) -> Result<Self, Error> {
        config.validate()?;
        let handle = Self::spawn(config.clone(), store);
        {
            let mut state = handle.shared.write();
            state.zone = Some(Zone::full(config.dimensions));
            state.status = PeerStatus::Activated;
        }
        info!(peer = %handle.id(), "bootstrapped overlay with full space");
        Ok(handle)
    }

    /// Start a peer and join it into an existing overlay through the given
    /// landmark.
    pub async fn join(
        config: Arc<OverlayConfig>,
        store: Arc<dyn DatasetGraph>,
        landmark: &PeerStub,
    ) -> Result<Self, Error> {
        config.validate()?;
        let handle = Self::spawn(config, store);
        match do_join(&handle.shared, landmark, None).await {
            Ok(()) => Ok(handle),
            Err(e) => {
                terminate(&handle.shared);
                Err(e)
            }
        }
    }

    fn spawn(config: Arc<OverlayConfig>, store: Arc<dyn DatasetGraph>) -> Self {
        let id = PeerId::random();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let stub = PeerStub::new(id, inbox_tx);
        let load = &config.load_balancing;
        let shared = Arc::new(PeerShared {
            id,
            subscriptions: SubscriptionRegistry::new(
                Arc::clone(&store),
                config.subscription_cache_capacity,
                config.cache_ttl(),
            ),
            state: RwLock::new(PeerState {
                status: PeerStatus::Uninitialized,
                zone: None,
                table: NeighborTable::new(config.dimensions),
                history: SplitHistory::new(),
            }),
            gate: OperationGate::new(),
            store,
            dispatcher: RequestDispatcher::new(),
            seen: Mutex::new(BoundedCache::new(4096, config.cache_ttl())),
            stub_cache: Mutex::new(BoundedCache::new(
                config.peer_stub_cache_capacity,
                config.cache_ttl(),
            )),
            reports: Mutex::new(ReportCache::new(load.max_reports, load.history_window_ms)),
            criteria: build_criteria(load),
            handling_imbalance: AtomicBool::new(false),
            requests_in_window: AtomicU64::new(0),
            last_gossiped: Mutex::new(None),
            self_stub: stub.clone(),
            closing: Notify::new(),
            config,
        });
        tokio::spawn(run_inbox(Arc::clone(&shared), inbox_rx));
        tokio::spawn(run_balancer(Arc::clone(&shared)));
        PeerHandle { stub, shared }
    }

    /// The peer's identifier.
    pub fn id(&self) -> PeerId {
        self.shared.id
    }

    /// The peer's stub, usable as a landmark or client entry point.
    pub fn stub(&self) -> &PeerStub {
        &self.stub
    }

    /// Current lifecycle status.
    pub fn status(&self) -> PeerStatus {
        self.shared.status()
    }

    /// Ask the peer to leave the overlay gracefully.
    pub async fn leave(&self) -> Result<(), Error> {
        match self.stub.call(Request::Leave, self.shared.config.dispatch_timeout()).await? {
            Response::Ack => Ok(()),
            _ => Err(Error::Routing(RoutingError::UnexpectedResponse("ack"))),
        }
    }

    /// Introspection snapshot, fetched over the message channel like any
    /// other caller would.
    pub async fn state(&self) -> Result<PeerSnapshot, Error> {
        match self.stub.call(Request::GetState, self.shared.config.request_timeout()).await? {
            Response::State(snapshot) => Ok(*snapshot),
            _ => Err(Error::Routing(RoutingError::UnexpectedResponse("state"))),
        }
    }
}

fn terminate(shared: &PeerShared) {
    shared.write().status = PeerStatus::Terminated;
    // notify_one stores a permit, so the inbox loop sees the signal even
    // when it is between polls.
    shared.closing.notify_one();
}

async fn run_inbox(shared: Arc<PeerShared>, mut inbox: mpsc::UnboundedReceiver<Envelope>) {
    loop {
        tokio::select! {
            maybe = inbox.recv() => match maybe {
                Some(envelope) => {
                    let shared = Arc::clone(&shared);
                    tokio::spawn(handle_envelope(shared, envelope));
                }
                None => break,
            },
            () = shared.closing.notified() => break,
        }
    }
    debug!(peer = %shared.id, "peer inbox closed");
}

fn operation_kind(request: &Request) -> OperationKind {
    match request {
        Request::Routed(_)
        | Request::GetZone
        | Request::GetState
        | Request::UpdateNeighbor { .. }
        | Request::RemoveNeighbor { .. }
        | Request::Gossip { .. } => OperationKind::Routing,
        Request::Absorb(_) | Request::Leave | Request::TakeOver { .. } => {
            OperationKind::LeaveMaintenance
        }
    }
}

async fn handle_envelope(shared: Arc<PeerShared>, envelope: Envelope) {
    shared.requests_in_window.fetch_add(1, Ordering::Relaxed);
    let Envelope { request, reply } = envelope;
    let kind = operation_kind(&request);
    let permit = shared.gate.acquire(kind).await;
    let result = dispatch_request(&shared, request).await;
    drop(permit);
    if let Some(reply) = reply {
        let _ = reply.send(result);
    }
}

async fn dispatch_request(shared: &Arc<PeerShared>, request: Request) -> Result<Response, Error> {
    match request {
        Request::Routed(routed) => handle_routed(shared, routed).await,
        Request::GetZone => {
            let zone = shared.read().zone.clone();
            zone.map(Response::Zone)
                .ok_or_else(|| Error::Lifecycle(LifecycleError::NotActivated(shared.status())))
        }
        Request::GetState => Ok(Response::State(Box::new(snapshot(shared)?))),
        Request::UpdateNeighbor { peer, stub, zone } => {
            handle_update_neighbor(shared, peer, stub, zone);
            Ok(Response::Ack)
        }
        Request::RemoveNeighbor { peer } => {
            handle_remove_neighbor(shared, peer);
            Ok(Response::Ack)
        }
        Request::Absorb(payload) => handle_absorb(shared, *payload).await,
        Request::Leave => {
            do_leave(shared, PeerStatus::Terminated).await?;
            Ok(Response::Ack)
        }
        Request::TakeOver { target, landmark } => handle_takeover(shared, target, landmark).await,
        Request::Gossip { from, report } => {
            handle_gossip(shared, from, &report);
            Ok(Response::Ack)
        }
    }
}

fn snapshot(shared: &Arc<PeerShared>) -> Result<PeerSnapshot, Error> {
    let stored = count_stored(shared)?;
    let state = shared.read();
    let neighbors = state
        .table
        .iter()
        .map(|e| {
            let (dim, dir) = state
                .zone
                .as_ref()
                .and_then(|z| z.neighbors(&e.zone))
                .unwrap_or((0, Direction::Lower));
            (dim, dir, e.peer)
        })
        .collect();
    Ok(PeerSnapshot {
        id: shared.id,
        status: state.status,
        zone: state.zone.clone(),
        neighbors,
        stored_quadruples: stored,
        history_len: state.history.len(),
    })
}

fn count_stored(shared: &Arc<PeerShared>) -> Result<u64, Error> {
    let txn = shared.store.begin(AccessMode::ReadOnly)?;
    let all = txn.find(&wildcard())?;
    Ok(all.iter().filter(|q| !pubsub::is_reserved(q)).count() as u64)
}

fn handle_update_neighbor(shared: &Arc<PeerShared>, peer: PeerId, stub: PeerStub, zone: Zone) {
    if let Ok(mut cache) = shared.stub_cache.lock() {
        cache.insert(peer, stub.clone());
    }
    let mut state = shared.write();
    if let Some(own) = state.zone.clone() {
        state.table.update(&own, NeighborEntry::new(peer, stub, zone));
    }
}

fn handle_remove_neighbor(shared: &Arc<PeerShared>, peer: PeerId) {
    let mut state = shared.write();
    state.table.remove(peer);
    drop(state);
    if let Ok(mut reports) = shared.reports.lock() {
        reports.remove(peer);
    }
    if let Ok(mut cache) = shared.stub_cache.lock() {
        cache.remove(&peer);
    }
}

fn handle_gossip(shared: &Arc<PeerShared>, from: PeerStub, report: &[u8]) {
    match LoadReport::from_bytes(report) {
        Ok(report) => {
            if let Ok(mut cache) = shared.stub_cache.lock() {
                cache.insert(from.id(), from);
            }
            if let Ok(mut reports) = shared.reports.lock() {
                reports.store(report);
            }
        }
        Err(e) => debug!(peer = %shared.id, error = %e, "dropping undecodable gossip report"),
    }
}

// ---------------------------------------------------------------------------
// Routed traffic
// ---------------------------------------------------------------------------

async fn handle_routed(shared: &Arc<PeerShared>, request: RoutedRequest) -> Result<Response, Error> {
    match &request.target {
        RouteTarget::Point(target) => {
            let target = target.clone();
            handle_unicast(shared, request, target).await
        }
        RouteTarget::Region(region) => {
            let region = region.clone();
            handle_multicast(shared, request, region).await
        }
    }
}

async fn handle_unicast(
    shared: &Arc<PeerShared>,
    request: RoutedRequest,
    target: Coordinate,
) -> Result<Response, Error> {
    let mut refreshed = false;
    loop {
        let (status, zone, neighbors) = {
            let state = shared.read();
            (state.status, state.zone.clone(), state.table.snapshot())
        };
        if status != PeerStatus::Activated {
            return Err(Error::Lifecycle(LifecycleError::NotActivated(status)));
        }
        let zone = zone.ok_or(Error::Lifecycle(LifecycleError::NotActivated(status)))?;

        if zone.contains(&target) {
            if let Action::Introduce(joiner) = &request.action {
                let joiner = joiner.clone();
                // Splits are mutually exclusive per peer; by the time ours
                // is admitted the zone may have moved under us, in which
                // case we go back to routing.
                let permit = shared.gate.acquire(OperationKind::JoinIntroduce).await;
                let still_ours = shared
                    .read()
                    .zone
                    .as_ref()
                    .map(|z| z.contains(&target))
                    .unwrap_or(false);
                if still_ours {
                    let grant = handle_introduce(shared, &joiner, request.hops)?;
                    drop(permit);
                    return Ok(Response::JoinGrant(Box::new(grant)));
                }
                drop(permit);
                continue;
            }
            return execute_point_action(shared, &request).await;
        }

        if request.hops_left == 0 {
            return Err(Error::Routing(RoutingError::HopLimit(target)));
        }
        match unicast_next_hop(&zone, &neighbors, &target) {
            Some(next) => {
                let mut forwarded = request.clone();
                forwarded.hops += 1;
                forwarded.hops_left -= 1;
                return next
                    .stub
                    .call(Request::Routed(forwarded), shared.config.dispatch_timeout())
                    .await;
            }
            None if !refreshed => {
                // Stale neighbor zones can hide the closer hop; refresh
                // once and retry before declaring a dead end.
                refresh_neighbors(shared).await;
                refreshed = true;
            }
            None => return Err(Error::Routing(RoutingError::DeadEnd(target))),
        }
    }
}

/// Re-query every neighbor for its current zone. Failures keep the stale
/// entry: stale-but-present routes better than an empty slot.
async fn refresh_neighbors(shared: &Arc<PeerShared>) {
    let neighbors = shared.read().table.snapshot();
    for entry in neighbors {
        let refreshed = entry
            .stub
            .call(Request::GetZone, shared.config.request_timeout())
            .await
            .and_then(|response| response.into_zone().map_err(Error::Routing));
        match refreshed {
            Ok(zone) => {
                let mut state = shared.write();
                if let Some(own) = state.zone.clone() {
                    state.table.set_zone(&own, entry.peer, zone);
                }
            }
            Err(_) => {
                warn!(peer = %shared.id, neighbor = %entry.peer,
                      "neighbor refresh failed, keeping stale entry");
            }
        }
    }
}

async fn execute_point_action(
    shared: &Arc<PeerShared>,
    request: &RoutedRequest,
) -> Result<Response, Error> {
    match &request.action {
        Action::Publish(quad) => {
            let mut txn = shared.store.begin(AccessMode::Write)?;
            txn.add(quad.clone())?;
            txn.commit()?;
            drop(txn);
            for (subscription, sink) in shared.subscriptions.matching(quad)? {
                match sink {
                    Some(sink) => sink.notify(Notification {
                        subscription_id: subscription.id.clone(),
                        quad: quad.clone(),
                    }),
                    None => debug!(peer = %shared.id, subscription = %subscription.id,
                                   "matching subscription has no reachable sink"),
                }
            }
            Ok(Response::Delivered { hops: request.hops })
        }
        Action::Query(pattern) => {
            let start = Instant::now();
            let quads = find_local(shared, pattern)?;
            Ok(Response::Outcome(MulticastOutcome {
                quads,
                hops: request.hops,
                peers_visited: 1,
                elapsed_max: start.elapsed(),
            }))
        }
        other => Err(Error::Other(format!(
            "action {} cannot be delivered to a point",
            other.name()
        ))),
    }
}

fn find_local(shared: &Arc<PeerShared>, pattern: &QuadruplePattern) -> Result<Vec<Quadruple>, Error> {
    let txn = shared.store.begin(AccessMode::ReadOnly)?;
    let found = txn.find(pattern)?;
    Ok(found.into_iter().filter(|q| !pubsub::is_reserved(q)).collect())
}

async fn handle_multicast(
    shared: &Arc<PeerShared>,
    request: RoutedRequest,
    region: Zone,
) -> Result<Response, Error> {
    let (status, zone, neighbors) = {
        let state = shared.read();
        (state.status, state.zone.clone(), state.table.snapshot())
    };
    if status != PeerStatus::Activated {
        return Err(Error::Lifecycle(LifecycleError::NotActivated(status)));
    }
    let zone = zone.ok_or(Error::Lifecycle(LifecycleError::NotActivated(status)))?;

    // Entered the overlay outside the region: pure transit, route towards
    // the region's anchor corner without executing or marking visited.
    if !zone.overlaps(&region) {
        let anchor = Coordinate::new(region.intervals().iter().map(|i| i.lower).collect());
        if request.hops_left == 0 {
            return Err(Error::Routing(RoutingError::HopLimit(anchor)));
        }
        let next = unicast_next_hop(&zone, &neighbors, &anchor)
            .ok_or_else(|| Error::Routing(RoutingError::DeadEnd(anchor.clone())))?;
        let mut forwarded = request.clone();
        forwarded.hops += 1;
        forwarded.hops_left -= 1;
        return next
            .stub
            .call(Request::Routed(forwarded), shared.config.dispatch_timeout())
            .await;
    }

    // Duplicate arrivals across diamond-shaped neighborhoods execute
    // nothing and merge neutrally; handlers stay idempotent regardless.
    {
        let mut seen = shared.seen.lock().unwrap_or_else(|e| e.into_inner());
        if seen.contains(&request.id) {
            return Ok(Response::Outcome(MulticastOutcome {
                hops: request.hops,
                ..MulticastOutcome::default()
            }));
        }
        seen.insert(request.id, ());
    }

    let start = Instant::now();
    let mut shutting_down = false;

    // Stateful actions go to the background dispatcher and are harvested
    // after the fan-out; stateless ones run inline.
    match &request.action {
        Action::Query(pattern) => {
            let store = Arc::clone(&shared.store);
            let pattern = pattern.clone();
            shared.dispatcher.spawn_stateful(request.id, move || {
                let txn = store.begin(AccessMode::ReadOnly)?;
                let found = txn.find(&pattern)?;
                Ok(found.into_iter().filter(|q| !pubsub::is_reserved(q)).collect())
            });
        }
        Action::Subscribe(subscription, sink) => {
            if subscription.concerns(&zone) {
                shared.subscriptions.register(subscription.clone(), sink.clone())?;
            }
        }
        Action::Unsubscribe(id) => {
            let removed = shared.subscriptions.remove(id)?;
            if removed {
                debug!(peer = %shared.id, subscription = %id, "subscription removed");
            }
        }
        Action::Delete(pattern) => {
            delete_local(shared, pattern)?;
        }
        Action::Shutdown => {
            shutting_down = true;
        }
        Action::Publish(_) | Action::Introduce(_) => {
            return Err(Error::Other(format!(
                "action {} cannot be delivered to a region",
                request.action.name()
            )));
        }
    }

    let targets = multicast_targets(&neighbors, &region, &request.visited);
    let mut visited = request.visited.clone();
    visited.push(shared.id);
    visited.extend(targets.iter().map(|t| t.peer));

    let calls: Vec<_> = targets
        .iter()
        .map(|t| {
            let forwarded = RoutedRequest {
                id: request.id,
                target: RouteTarget::Region(region.clone()),
                action: request.action.clone(),
                hops: request.hops + 1,
                hops_left: request.hops_left,
                visited: visited.clone(),
            };
            t.stub.call(Request::Routed(forwarded), shared.config.dispatch_timeout())
        })
        .collect();
    let children = join_all(calls).await;

    let mut outcome = MulticastOutcome {
        quads: Vec::new(),
        hops: request.hops,
        peers_visited: 1,
        elapsed_max: start.elapsed(),
    };
    if matches!(request.action, Action::Query(_)) {
        let (elapsed, quads) = shared.dispatcher.harvest(request.id).await?;
        outcome.quads = quads;
        outcome.elapsed_max = outcome.elapsed_max.max(elapsed);
    }
    for child in children {
        match child {
            Ok(response) => outcome.merge(response.into_outcome().map_err(Error::Routing)?),
            // A branch dying mid-multicast (peer left) degrades to
            // at-least-once over the survivors; log and carry on.
            Err(e) => warn!(peer = %shared.id, error = %e, "multicast branch failed"),
        }
    }

    if shutting_down {
        info!(peer = %shared.id, "shutting down on broadcast");
        terminate(shared);
    }
    Ok(Response::Outcome(outcome))
}

/// Delete matching, non-reserved quadruples, by exact quad to keep the
/// reserved subscription graph out of wildcard deletes.
fn delete_local(shared: &Arc<PeerShared>, pattern: &QuadruplePattern) -> Result<usize, Error> {
    let mut txn = shared.store.begin(AccessMode::Write)?;
    let doomed: Vec<Quadruple> = txn
        .find(pattern)?
        .into_iter()
        .filter(|q| !pubsub::is_reserved(q))
        .collect();
    for quad in &doomed {
        txn.delete_matching(&QuadruplePattern::from(quad.clone()))?;
    }
    txn.commit()?;
    Ok(doomed.len())
}

// ---------------------------------------------------------------------------
// Lifecycle: join / split
// ---------------------------------------------------------------------------

fn handle_introduce(
    shared: &Arc<PeerShared>,
    joiner: &JoinerInfo,
    hops: u32,
) -> Result<JoinGrant, Error> {
    let (kept, granted, old_entries, joiner_history) = {
        let mut state = shared.write();
        if state.status != PeerStatus::Activated {
            return Err(Error::Lifecycle(LifecycleError::NotActivated(state.status)));
        }
        let zone = state
            .zone
            .clone()
            .ok_or(Error::Lifecycle(LifecycleError::NotActivated(state.status)))?;

        // Round-robin dimension choice, stable under history replay.
        let dim = state.history.len() % shared.config.dimensions;
        let (kept, granted, boundary) = zone.split(dim, shared.config.min_zone_side)?;

        let mut joiner_history = state.history.clone();
        joiner_history.push(SplitEntry::now(dim, Direction::Lower, boundary));
        state.history.push(SplitEntry::now(dim, Direction::Upper, boundary));

        let old_entries = state.table.snapshot();
        let mut candidates = old_entries.clone();
        candidates.push(NeighborEntry::new(joiner.id, joiner.stub.clone(), granted.clone()));
        state.table.rebuild(&kept, candidates);
        state.zone = Some(kept.clone());
        (kept, granted, old_entries, joiner_history)
    };

    let quads = extract_quads(shared, &granted)?;
    let subscriptions = shared.subscriptions.concerning(&granted)?;

    let mut neighbors = old_entries.clone();
    neighbors.push(NeighborEntry::new(shared.id, shared.self_stub.clone(), kept.clone()));

    // Neighbors bordering the split boundary refresh from this.
    for entry in &old_entries {
        entry.stub.cast(Request::UpdateNeighbor {
            peer: shared.id,
            stub: shared.self_stub.clone(),
            zone: kept.clone(),
        });
    }

    info!(peer = %shared.id, joiner = %joiner.id, zone = %granted,
          "granted zone half to joiner");
    Ok(JoinGrant { zone: granted, history: joiner_history, quads, subscriptions, neighbors, hops })
}

/// Move the stored quadruples falling inside `zone` out of the local store.
fn extract_quads(shared: &Arc<PeerShared>, zone: &Zone) -> Result<Vec<Quadruple>, Error> {
    let mut txn = shared.store.begin(AccessMode::Write)?;
    let moving: Vec<Quadruple> = txn
        .find(&wildcard())?
        .into_iter()
        .filter(|q| !pubsub::is_reserved(q) && zone.contains(&q.to_coordinate()))
        .collect();
    for quad in &moving {
        txn.delete_matching(&QuadruplePattern::from(quad.clone()))?;
    }
    txn.commit()?;
    Ok(moving)
}

async fn do_join(
    shared: &Arc<PeerShared>,
    landmark: &PeerStub,
    target: Option<Coordinate>,
) -> Result<(), Error> {
    shared.write().status = PeerStatus::Joining;
    let dimensions = shared.config.dimensions;
    let mut last_error: Option<Error> = None;

    for attempt in 0..=shared.config.join_retries {
        // A caller-provided target is only honored on the first attempt;
        // a refused split means that spot is full.
        let coordinate = match (&target, attempt) {
            (Some(t), 0) => t.clone(),
            _ => random_coordinate(dimensions),
        };
        let introduce = RoutedRequest::unicast(
            coordinate,
            Action::Introduce(JoinerInfo { id: shared.id, stub: shared.self_stub.clone() }),
            shared.config.max_hops,
        );
        match landmark
            .call(Request::Routed(introduce), shared.config.dispatch_timeout())
            .await
        {
            Ok(Response::JoinGrant(grant)) => {
                apply_grant(shared, *grant)?;
                return Ok(());
            }
            Ok(_) => {
                last_error = Some(Error::Routing(RoutingError::UnexpectedResponse("join grant")));
                break;
            }
            Err(Error::Zone(e)) => {
                debug!(peer = %shared.id, attempt, error = %e, "join target refused, retrying");
                last_error = Some(Error::Zone(e));
            }
            Err(e) => {
                last_error = Some(e);
                break;
            }
        }
    }

    shared.write().status = PeerStatus::Uninitialized;
    let reason = last_error.map_or_else(|| "no attempts made".to_string(), |e| e.to_string());
    Err(Error::Lifecycle(LifecycleError::JoinFailed(reason)))
}

fn apply_grant(shared: &Arc<PeerShared>, grant: JoinGrant) -> Result<(), Error> {
    let entries = {
        let mut state = shared.write();
        state.table.rebuild(&grant.zone, grant.neighbors);
        state.history = grant.history;
        state.zone = Some(grant.zone.clone());
        state.status = PeerStatus::Activated;
        state.table.snapshot()
    };

    let mut txn = shared.store.begin(AccessMode::Write)?;
    for quad in grant.quads {
        txn.add(quad)?;
    }
    txn.commit()?;
    drop(txn);
    for (subscription, sink) in grant.subscriptions {
        shared.subscriptions.register(subscription, sink)?;
    }

    for entry in &entries {
        entry.stub.cast(Request::UpdateNeighbor {
            peer: shared.id,
            stub: shared.self_stub.clone(),
            zone: grant.zone.clone(),
        });
    }
    info!(peer = %shared.id, zone = %grant.zone, neighbors = entries.len(), "joined overlay");
    Ok(())
}

// ---------------------------------------------------------------------------
// Lifecycle: leave / merge
// ---------------------------------------------------------------------------

/// Find, from the split history, the most recent entry whose counterpart
/// neighbor can exactly reabsorb this zone.
fn find_absorber(state: &PeerState) -> Option<(SplitEntry, NeighborEntry)> {
    let zone = state.zone.as_ref()?;
    for entry in state.history.iter_recent_first() {
        for candidate in state.table.get(entry.dimension, entry.direction) {
            if mergeable(zone, &candidate.zone, entry.dimension, entry.boundary) {
                return Some((entry.clone(), candidate.clone()));
            }
        }
    }
    None
}

/// Whether enlarging `other` across the shared face at `boundary` yields an
/// axis-aligned box covering both zones exactly.
fn mergeable(own: &Zone, other: &Zone, dim: usize, boundary: u64) -> bool {
    if own.dimensions() != other.dimensions() {
        return false;
    }
    for d in 0..own.dimensions() {
        if d == dim {
            continue;
        }
        if own.interval(d) != other.interval(d) {
            return false;
        }
    }
    let a = own.interval(dim);
    let b = other.interval(dim);
    (a.upper == b.lower && a.upper == boundary) || (b.upper == a.lower && b.upper == boundary)
}

async fn do_leave(shared: &Arc<PeerShared>, final_status: PeerStatus) -> Result<(), Error> {
    {
        let mut state = shared.write();
        if state.status != PeerStatus::Activated {
            return Err(Error::Lifecycle(LifecycleError::NotActivated(state.status)));
        }
        state.status = PeerStatus::Leaving;
    }

    // Sole peer: nothing to hand over, the overlay simply becomes empty.
    let sole = {
        let state = shared.read();
        state.table.is_empty()
    };
    if sole {
        info!(peer = %shared.id, "sole peer leaving, overlay empty");
        finish_leave(shared, final_status);
        return Ok(());
    }

    let found = {
        let state = shared.read();
        find_absorber(&state)
    };
    let Some((entry, absorber)) = found else {
        shared.write().status = PeerStatus::Activated;
        warn!(peer = %shared.id, "leave aborted: no usable split-history entry");
        return Err(Error::Lifecycle(LifecycleError::NoAbsorber));
    };

    // Consume the history entry and package everything the absorber needs.
    let (zone, history, neighbors) = {
        let mut state = shared.write();
        state.history.pop_matching(entry.dimension, entry.boundary);
        let zone = state
            .zone
            .clone()
            .ok_or(Error::Lifecycle(LifecycleError::NotActivated(PeerStatus::Leaving)))?;
        (zone, state.history.clone(), state.table.snapshot())
    };
    let quads = extract_quads(shared, &zone)?;
    let subscriptions = shared.subscriptions.all()?.into_iter()
        .map(|s| {
            let sink = shared.subscriptions.sink_of(&s.id);
            (s, sink)
        })
        .collect::<Vec<_>>();
    for (subscription, _) in &subscriptions {
        shared.subscriptions.remove(&subscription.id)?;
    }

    let payload = AbsorbPayload {
        leaver: shared.id,
        zone: zone.clone(),
        dimension: entry.dimension,
        boundary: entry.boundary,
        history,
        quads: quads.clone(),
        subscriptions: subscriptions.clone(),
        neighbors: neighbors.clone(),
    };
    match absorber
        .stub
        .call(Request::Absorb(Box::new(payload)), shared.config.dispatch_timeout())
        .await
    {
        Ok(Response::Ack) => {}
        Ok(_) | Err(_) => {
            // Compensate: restore the popped entry, the data and the
            // subscriptions, then return to the prior stable state.
            restore_after_failed_leave(shared, entry, quads, subscriptions)?;
            warn!(peer = %shared.id, absorber = %absorber.peer, "leave aborted: absorb failed");
            return Err(Error::Lifecycle(LifecycleError::LeaveFailed(format!(
                "absorber {} did not acknowledge",
                absorber.peer
            ))));
        }
    }

    // The absorber acknowledged; finish cleanup. Every remaining neighbor
    // must drop us before the leave completes, retrying once per neighbor.
    for neighbor in neighbors.iter().filter(|n| n.peer != absorber.peer) {
        let mut delivered = false;
        for _ in 0..2 {
            match neighbor
                .stub
                .call(
                    Request::RemoveNeighbor { peer: shared.id },
                    shared.config.request_timeout(),
                )
                .await
            {
                Ok(_) => {
                    delivered = true;
                    break;
                }
                Err(e) => {
                    debug!(peer = %shared.id, neighbor = %neighbor.peer, error = %e,
                           "neighbor cleanup attempt failed");
                }
            }
        }
        if !delivered {
            warn!(peer = %shared.id, neighbor = %neighbor.peer,
                  "neighbor cleanup retries exhausted");
        }
    }

    info!(peer = %shared.id, absorber = %absorber.peer, "left overlay");
    finish_leave(shared, final_status);
    Ok(())
}

fn finish_leave(shared: &Arc<PeerShared>, final_status: PeerStatus) {
    {
        let mut state = shared.write();
        state.status = final_status;
        state.zone = None;
        let dims = state.table.dimensions();
        state.table = NeighborTable::new(dims);
        state.history = SplitHistory::new();
    }
    if final_status == PeerStatus::Terminated {
        shared.closing.notify_one();
    }
}

fn restore_after_failed_leave(
    shared: &Arc<PeerShared>,
    entry: SplitEntry,
    quads: Vec<Quadruple>,
    subscriptions: Vec<(crate::pubsub::Subscription, Option<crate::pubsub::NotificationSink>)>,
) -> Result<(), Error> {
    let mut txn = shared.store.begin(AccessMode::Write)?;
    for quad in quads {
        txn.add(quad)?;
    }
    txn.commit()?;
    drop(txn);
    for (subscription, sink) in subscriptions {
        shared.subscriptions.register(subscription, sink)?;
    }
    let mut state = shared.write();
    state.history.push(entry);
    state.status = PeerStatus::Activated;
    Ok(())
}

async fn handle_absorb(shared: &Arc<PeerShared>, payload: AbsorbPayload) -> Result<Response, Error> {
    let (new_zone, entries) = {
        let mut state = shared.write();
        let own = state
            .zone
            .clone()
            .ok_or(Error::Lifecycle(LifecycleError::NotActivated(state.status)))?;
        let Some((dim, direction)) = own.neighbors(&payload.zone) else {
            return Err(Error::Lifecycle(LifecycleError::ZoneMismatch(format!(
                "absorbed zone {} is not adjacent to {}",
                payload.zone, own
            ))));
        };
        if dim != payload.dimension || !mergeable(&own, &payload.zone, dim, payload.boundary) {
            return Err(Error::Lifecycle(LifecycleError::ZoneMismatch(format!(
                "absorbed zone {} does not line up with {} at {}",
                payload.zone, own, payload.boundary
            ))));
        }
        let bound = match direction {
            Direction::Upper => payload.zone.interval(dim).upper,
            Direction::Lower => payload.zone.interval(dim).lower,
        };
        let new_zone = own.enlarge(dim, direction, bound);

        state.history.pop_matching(dim, payload.boundary);
        state.history.inherit(payload.history);

        let mut candidates = state.table.snapshot();
        candidates.extend(
            payload
                .neighbors
                .iter()
                .filter(|n| n.peer != shared.id && n.peer != payload.leaver)
                .cloned(),
        );
        state.table.rebuild(&new_zone, candidates);
        state.zone = Some(new_zone.clone());
        (new_zone, state.table.snapshot())
    };

    let mut txn = shared.store.begin(AccessMode::Write)?;
    for quad in payload.quads {
        txn.add(quad)?;
    }
    txn.commit()?;
    drop(txn);
    for (subscription, sink) in payload.subscriptions {
        shared.subscriptions.register(subscription, sink)?;
    }

    if let Ok(mut reports) = shared.reports.lock() {
        reports.remove(payload.leaver);
    }
    if let Ok(mut cache) = shared.stub_cache.lock() {
        cache.remove(&payload.leaver);
    }

    for entry in &entries {
        entry.stub.cast(Request::UpdateNeighbor {
            peer: shared.id,
            stub: shared.self_stub.clone(),
            zone: new_zone.clone(),
        });
    }
    info!(peer = %shared.id, leaver = %payload.leaver, zone = %new_zone,
          "absorbed departing neighbor's zone");
    Ok(Response::Ack)
}

async fn handle_takeover(
    shared: &Arc<PeerShared>,
    target: Coordinate,
    landmark: PeerStub,
) -> Result<Response, Error> {
    if shared.status() != PeerStatus::Activated {
        return Ok(Response::Refused("peer is not activated".to_string()));
    }
    // Reassignment composes the leave and join primitives rather than
    // inventing a third zone-transfer operation.
    if let Err(e) = do_leave(shared, PeerStatus::Uninitialized).await {
        return Ok(Response::Refused(format!("could not vacate current zone: {}", e)));
    }
    match do_join(shared, &landmark, Some(target)).await {
        Ok(()) => Ok(Response::Ack),
        Err(e) => {
            // The old zone is already handed off; this peer is out of the
            // overlay for good.
            warn!(peer = %shared.id, error = %e, "takeover rejoin failed, terminating");
            terminate(shared);
            Ok(Response::Refused(format!("rejoin failed: {}", e)))
        }
    }
}

// ---------------------------------------------------------------------------
// Load balancing loop
// ---------------------------------------------------------------------------

async fn run_balancer(shared: Arc<PeerShared>) {
    let mut ticker = tokio::time::interval(shared.config.probing_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match shared.status() {
            PeerStatus::Terminated => break,
            // Never measure or act on a zone mid-transition.
            PeerStatus::Activated => {}
            _ => continue,
        }
        let Some(permit) = shared.gate.try_acquire(OperationKind::LoadBalance) else {
            continue;
        };
        let iteration = balance_once(&shared);
        let decision = match iteration {
            Ok(decision) => decision,
            Err(e) => {
                warn!(peer = %shared.id, error = %e, "load probe failed, skipping iteration");
                drop(permit);
                continue;
            }
        };
        // The permit only covers measurement and decision; the takeover
        // itself is ordinary lifecycle traffic on the candidate.
        drop(permit);

        if let Some((candidate, stub, target)) = decision {
            match stub
                .call(
                    Request::TakeOver { target, landmark: shared.self_stub.clone() },
                    shared.config.dispatch_timeout(),
                )
                .await
            {
                Ok(Response::Ack) => {
                    info!(peer = %shared.id, candidate = %candidate, "load reassignment complete");
                }
                Ok(Response::Refused(reason)) => {
                    warn!(peer = %shared.id, candidate = %candidate, reason,
                          "reassignment candidate refused, deferring");
                }
                Ok(_) | Err(_) => {
                    warn!(peer = %shared.id, candidate = %candidate,
                          "reassignment failed, re-evaluating next cycle");
                }
            }
            shared.handling_imbalance.store(false, Ordering::SeqCst);
        }
    }
    debug!(peer = %shared.id, "load balancer stopped");
}

type Decision = Option<(PeerId, PeerStub, Coordinate)>;

/// One measurement/classification/decision iteration. Returns the takeover
/// to perform, if any.
fn balance_once(shared: &Arc<PeerShared>) -> Result<Decision, Error> {
    let probe = LoadProbe {
        stored_quadruples: count_stored(shared)?,
        requests_in_window: shared.requests_in_window.swap(0, Ordering::Relaxed),
    };
    let values: Vec<f64> = shared.criteria.iter().map(|c| c.load(&probe)).collect();
    let report = LoadReport::now(shared.id, values.clone());
    let weights = weights(&shared.criteria);

    let (average, candidate) = {
        let reports = shared.reports.lock().unwrap_or_else(|e| e.into_inner());
        let average = reports.average_with(&report, &weights);
        let fresh = reports.fresh();
        let candidate = select_candidate(&fresh, &values, &shared.criteria);
        (average, candidate)
    };
    let class = classify(&values, &shared.criteria, average, shared.config.load_balancing.imbalance_ratio);
    debug!(peer = %shared.id, class = %class, ?average, "load probe");

    gossip_report(shared, &report, &weights);

    if class != LoadClass::Overloaded {
        return Ok(None);
    }
    // At most one reassignment in flight; reports arriving meanwhile only
    // feed the average.
    if shared.handling_imbalance.swap(true, Ordering::SeqCst) {
        return Ok(None);
    }
    let Some(candidate) = candidate else {
        shared.handling_imbalance.store(false, Ordering::SeqCst);
        debug!(peer = %shared.id, "overloaded but no qualified candidate, deferring");
        return Ok(None);
    };
    let stub = {
        let mut cache = shared.stub_cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.get(&candidate).cloned()
    }
    .or_else(|| shared.read().table.entry_of(candidate).map(|e| e.stub.clone()));
    let Some(stub) = stub else {
        shared.handling_imbalance.store(false, Ordering::SeqCst);
        debug!(peer = %shared.id, candidate = %candidate, "candidate stub unknown, deferring");
        return Ok(None);
    };
    let Some(target) = shared.read().zone.as_ref().map(Zone::center) else {
        shared.handling_imbalance.store(false, Ordering::SeqCst);
        return Ok(None);
    };
    Ok(Some((candidate, stub, target)))
}

/// Push the report to a random fan-out subset of neighbors, damped by the
/// configured change ratio.
fn gossip_report(shared: &Arc<PeerShared>, report: &LoadReport, weights: &[f64]) {
    let load = &shared.config.load_balancing;
    {
        let last = shared.last_gossiped.lock().unwrap_or_else(|e| e.into_inner());
        if !should_gossip(last.as_ref(), report, weights, load.gossip_damping_ratio) {
            return;
        }
    }
    let bytes = match report.to_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(peer = %shared.id, error = %e, "could not encode load report");
            return;
        }
    };
    let neighbors = shared.read().table.snapshot();
    let mut rng = rand::thread_rng();
    for target in neighbors.choose_multiple(&mut rng, load.gossip_fanout) {
        target.stub.cast(Request::Gossip {
            from: shared.self_stub.clone(),
            report: bytes.clone(),
        });
    }
    let mut last = shared.last_gossiped.lock().unwrap_or_else(|e| e.into_inner());
    *last = Some(report.clone());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryDataset;

    fn config() -> Arc<OverlayConfig> {
        Arc::new(OverlayConfig::default())
    }

    #[tokio::test]
    async fn test_bootstrap_owns_full_space() {
        let handle = PeerHandle::bootstrap(config(), Arc::new(MemoryDataset::new())).unwrap();
        let state = handle.state().await.unwrap();
        assert_eq!(state.status, PeerStatus::Activated);
        assert_eq!(state.zone, Some(Zone::full(4)));
        assert!(state.neighbors.is_empty());
    }

    #[tokio::test]
    async fn test_sole_peer_leave_is_noop_end_state() {
        let handle = PeerHandle::bootstrap(config(), Arc::new(MemoryDataset::new())).unwrap();
        handle.leave().await.unwrap();
        assert_eq!(handle.status(), PeerStatus::Terminated);
        assert!(!handle.stub().is_open());
    }

    #[tokio::test]
    async fn test_terminated_peer_rejects_traffic() {
        let handle = PeerHandle::bootstrap(config(), Arc::new(MemoryDataset::new())).unwrap();
        handle.leave().await.unwrap();
        // Envelope channel is closed after termination.
        let quad = Quadruple::parse("<g> <a> <p> <b>").unwrap();
        let request = Request::Routed(RoutedRequest::unicast(
            quad.to_coordinate(),
            Action::Publish(quad),
            8,
        ));
        assert!(handle.stub().call(request, std::time::Duration::from_millis(200)).await.is_err());
    }

    #[tokio::test]
    async fn test_balance_once_defers_while_a_reassignment_is_in_flight() {
        let mut config = OverlayConfig::default();
        config.load_balancing.criteria[0].warmup_threshold = 1.0;
        config.load_balancing.criteria[0].emergency_threshold = 10.0;
        // Keep the background loop out of the way; probes run by hand here.
        config.load_balancing.probing_interval_ms = 3_600_000;
        let store = Arc::new(MemoryDataset::new());
        let handle = PeerHandle::bootstrap(Arc::new(config), store.clone()).unwrap();

        // Push the stored-quadruples criterion past emergency.
        let mut txn = store.begin(AccessMode::Write).unwrap();
        for i in 0..12 {
            txn.add(Quadruple::parse(&format!("<g> <s{}> <p> <o>", i)).unwrap()).unwrap();
        }
        txn.commit().unwrap();
        drop(txn);

        // A lightly loaded peer known only through gossip.
        let candidate = PeerId::from_raw(42);
        let (tx, _rx) = mpsc::unbounded_channel();
        handle
            .shared
            .stub_cache
            .lock()
            .unwrap()
            .insert(candidate, PeerStub::new(candidate, tx));
        handle
            .shared
            .reports
            .lock()
            .unwrap()
            .store(LoadReport::now(candidate, vec![0.0, 0.0]));

        let decision = balance_once(&handle.shared).unwrap();
        let (chosen, _, target) = decision.expect("overloaded peer must pick the candidate");
        assert_eq!(chosen, candidate);
        assert_eq!(target, Zone::full(4).center());

        // While the first decision is outstanding, further probes defer.
        assert!(balance_once(&handle.shared).unwrap().is_none());

        // A refused or failed takeover clears the flag and the next probe
        // decides again.
        handle.shared.handling_imbalance.store(false, Ordering::SeqCst);
        assert!(balance_once(&handle.shared).unwrap().is_some());
    }

    #[test]
    fn test_mergeable_requires_exact_side_match() {
        let a = Zone::new(vec![
            crate::geometry::Interval::new(0, 50).unwrap(),
            crate::geometry::Interval::new(0, 100).unwrap(),
        ]);
        let b = Zone::new(vec![
            crate::geometry::Interval::new(50, 100).unwrap(),
            crate::geometry::Interval::new(0, 100).unwrap(),
        ]);
        assert!(mergeable(&a, &b, 0, 50));
        assert!(!mergeable(&a, &b, 0, 40));
        let c = Zone::new(vec![
            crate::geometry::Interval::new(50, 100).unwrap(),
            crate::geometry::Interval::new(0, 50).unwrap(),
        ]);
        assert!(!mergeable(&a, &c, 0, 50));
    }
}
