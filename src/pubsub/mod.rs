//! Publish/subscribe indexing on top of the routing layer.
//!
//! Subscriptions are decomposed into atomic quadruple patterns and indexed
//! on every peer whose zone intersects a pattern's region. A published
//! quadruple is matched against the subscriptions stored on its rendezvous
//! peer and matching subscribers are notified through their sinks.
//!
//! Subscriptions are persisted through the storage collaborator, encoded
//! as quadruples in a reserved graph, and cached in a bounded in-memory
//! cache with miss-triggers-reload semantics.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use crate::core::{Quadruple, QuadruplePattern, RdfTerm};
use crate::geometry::Zone;
use crate::overlay::cache::BoundedCache;
use crate::storage::{AccessMode, DatasetGraph, StorageError};

/// Identifier of a subscription, unique overlay-wide.
pub type SubscriptionId = String;

/// Reserved graph IRI under which subscriptions are persisted.
const SUBSCRIPTION_GRAPH: &str = "urn:tessella:subscriptions";
const SUBSCRIPTION_PREDICATE: &str = "urn:tessella:definition";

/// A registered subscription: original query text plus its decomposed
/// atomic patterns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Overlay-wide identifier.
    pub id: SubscriptionId,
    /// The subscriber's original query, kept verbatim for re-filtration.
    pub query: String,
    /// Decomposed atomic patterns, each independently indexed.
    pub patterns: Vec<QuadruplePattern>,
    /// Milliseconds since the epoch at registration time.
    pub created_at: u64,
}

impl Subscription {
    /// Build a subscription from its decomposed patterns.
    pub fn new(id: SubscriptionId, query: String, patterns: Vec<QuadruplePattern>) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Subscription { id, query, patterns, created_at }
    }

    /// Whether any atomic pattern of this subscription matches the quad.
    pub fn matches(&self, quad: &Quadruple) -> bool {
        self.patterns.iter().any(|p| p.matches(quad))
    }

    /// Whether any atomic pattern's region intersects the zone; such
    /// subscriptions travel with the zone slice on split/merge.
    pub fn concerns(&self, zone: &Zone) -> bool {
        self.patterns.iter().any(|p| zone.overlaps(&p.to_region()))
    }
}

/// Notification delivered to a subscriber when a published quadruple
/// matches one of its patterns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Which subscription matched.
    pub subscription_id: SubscriptionId,
    /// The published quadruple.
    pub quad: Quadruple,
}

/// In-process stand-in for the subscriber's remote proxy: a channel the
/// matching peer pushes notifications into, fire-and-forget.
#[derive(Debug, Clone)]
pub struct NotificationSink {
    sender: mpsc::UnboundedSender<Notification>,
}

impl NotificationSink {
    /// Create a sink plus the receiving end the subscriber keeps.
    pub fn channel() -> (NotificationSink, mpsc::UnboundedReceiver<Notification>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (NotificationSink { sender }, receiver)
    }

    /// Push a notification; a gone subscriber is not an error.
    pub fn notify(&self, notification: Notification) {
        let _ = self.sender.send(notification);
    }
}

fn subscription_subject(id: &str) -> RdfTerm {
    RdfTerm::Iri(format!("urn:tessella:sub:{}", id))
}

fn subscription_quad(subscription: &Subscription) -> Result<Quadruple, StorageError> {
    let body = serde_json::to_string(subscription)
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    Quadruple::new(
        RdfTerm::Iri(SUBSCRIPTION_GRAPH.to_string()),
        subscription_subject(&subscription.id),
        RdfTerm::Iri(SUBSCRIPTION_PREDICATE.to_string()),
        RdfTerm::Literal(body),
    )
    .ok_or_else(|| StorageError::Backend("subscription encoding produced a variable".to_string()))
}

/// Whether a stored quadruple belongs to the reserved subscription graph
/// (and must stay invisible to user queries).
pub fn is_reserved(quad: &Quadruple) -> bool {
    quad.graph == RdfTerm::Iri(SUBSCRIPTION_GRAPH.to_string())
}

/// Per-peer subscription index: persistent via the storage collaborator,
/// cached in memory, with notification sinks kept aside (sinks are
/// transient handles and never persisted).
pub struct SubscriptionRegistry {
    store: Arc<dyn DatasetGraph>,
    cache: Mutex<BoundedCache<SubscriptionId, Subscription>>,
    sinks: RwLock<HashMap<SubscriptionId, NotificationSink>>,
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry").finish_non_exhaustive()
    }
}

impl SubscriptionRegistry {
    /// Create a registry over the peer's dataset graph.
    pub fn new(store: Arc<dyn DatasetGraph>, cache_capacity: usize, cache_ttl: Duration) -> Self {
        SubscriptionRegistry {
            store,
            cache: Mutex::new(BoundedCache::new(cache_capacity, cache_ttl)),
            sinks: RwLock::new(HashMap::new()),
        }
    }

    /// Persist and index a subscription. Idempotent on the identifier.
    pub fn register(
        &self,
        subscription: Subscription,
        sink: Option<NotificationSink>,
    ) -> Result<(), StorageError> {
        let quad = subscription_quad(&subscription)?;
        let mut txn = self.store.begin(AccessMode::Write)?;
        // Re-registration replaces the stored definition.
        txn.delete_matching(&self.id_pattern(&subscription.id))?;
        txn.add(quad)?;
        txn.commit()?;
        drop(txn);

        if let Some(sink) = sink {
            if let Ok(mut sinks) = self.sinks.write() {
                sinks.insert(subscription.id.clone(), sink);
            }
        }
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(subscription.id.clone(), subscription);
        }
        Ok(())
    }

    fn id_pattern(&self, id: &str) -> QuadruplePattern {
        QuadruplePattern::new(
            RdfTerm::Iri(SUBSCRIPTION_GRAPH.to_string()),
            subscription_subject(id),
            RdfTerm::Iri(SUBSCRIPTION_PREDICATE.to_string()),
            RdfTerm::Variable("definition".to_string()),
        )
    }

    fn all_pattern(&self) -> QuadruplePattern {
        QuadruplePattern::new(
            RdfTerm::Iri(SUBSCRIPTION_GRAPH.to_string()),
            RdfTerm::Variable("subscription".to_string()),
            RdfTerm::Iri(SUBSCRIPTION_PREDICATE.to_string()),
            RdfTerm::Variable("definition".to_string()),
        )
    }

    fn decode(quad: &Quadruple) -> Option<Subscription> {
        match &quad.object {
            RdfTerm::Literal(body) => match serde_json::from_str(body) {
                Ok(subscription) => Some(subscription),
                Err(e) => {
                    warn!(error = %e, "dropping undecodable stored subscription");
                    None
                }
            },
            _ => None,
        }
    }

    /// Look up a subscription, reloading from the store on a cache miss.
    pub fn lookup(&self, id: &SubscriptionId) -> Result<Option<Subscription>, StorageError> {
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(hit) = cache.get(id) {
                return Ok(Some(hit.clone()));
            }
        }
        let txn = self.store.begin(AccessMode::ReadOnly)?;
        let found = txn.find(&self.id_pattern(id))?;
        drop(txn);
        let Some(subscription) = found.first().and_then(Self::decode) else {
            return Ok(None);
        };
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(id.clone(), subscription.clone());
        }
        Ok(Some(subscription))
    }

    /// Remove a subscription everywhere it is indexed locally. Returns
    /// whether anything was actually removed, and is safe to repeat.
    pub fn remove(&self, id: &SubscriptionId) -> Result<bool, StorageError> {
        let mut txn = self.store.begin(AccessMode::Write)?;
        let removed = txn.delete_matching(&self.id_pattern(id))?;
        txn.commit()?;
        drop(txn);
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(id);
        }
        if let Ok(mut sinks) = self.sinks.write() {
            sinks.remove(id);
        }
        Ok(removed > 0)
    }

    /// All locally indexed subscriptions.
    pub fn all(&self) -> Result<Vec<Subscription>, StorageError> {
        let txn = self.store.begin(AccessMode::ReadOnly)?;
        let found = txn.find(&self.all_pattern())?;
        drop(txn);
        Ok(found.iter().filter_map(Self::decode).collect())
    }

    /// Subscriptions (with their sinks, when known) matching a published
    /// quadruple.
    pub fn matching(
        &self,
        quad: &Quadruple,
    ) -> Result<Vec<(Subscription, Option<NotificationSink>)>, StorageError> {
        let all = self.all()?;
        let sinks = self.sinks.read().map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(all
            .into_iter()
            .filter(|s| s.matches(quad))
            .map(|s| {
                let sink = sinks.get(&s.id).cloned();
                (s, sink)
            })
            .collect())
    }

    /// Subscriptions concerning a zone slice, paired with their sinks, for
    /// transfer during split/merge.
    pub fn concerning(
        &self,
        zone: &Zone,
    ) -> Result<Vec<(Subscription, Option<NotificationSink>)>, StorageError> {
        let all = self.all()?;
        let sinks = self.sinks.read().map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(all
            .into_iter()
            .filter(|s| s.concerns(zone))
            .map(|s| {
                let sink = sinks.get(&s.id).cloned();
                (s, sink)
            })
            .collect())
    }

    /// The sink registered for a subscription, if any.
    pub fn sink_of(&self, id: &SubscriptionId) -> Option<NotificationSink> {
        self.sinks.read().ok().and_then(|sinks| sinks.get(id).cloned())
    }
}
