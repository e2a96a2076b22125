//! Caller-facing overlay client.
//!
//! Wraps an entry peer's stub behind the publish/query/subscribe surface,
//! translating each call into the right routed request and unwrapping the
//! response. The client carries no overlay state of its own; any activated
//! peer works as the entry point.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::OverlayConfig;
use crate::core::{CompositeQuery, Quadruple, QuadruplePattern};
use crate::dispatch;
use crate::error::Error;
use crate::overlay::stub::PeerStub;
use crate::pubsub::{Notification, NotificationSink, Subscription, SubscriptionId};
use crate::reasoning::QueryReasoner;
use crate::routing::{Action, MulticastOutcome, Request, Response, RoutedRequest, RoutingError};

/// Client handle for one overlay, bound to an entry peer.
pub struct OverlayClient {
    entry: PeerStub,
    config: Arc<OverlayConfig>,
    reasoner: Arc<dyn QueryReasoner>,
}

impl OverlayClient {
    /// Build a client entering the overlay through `entry`.
    pub fn new(
        entry: PeerStub,
        config: Arc<OverlayConfig>,
        reasoner: Arc<dyn QueryReasoner>,
    ) -> Self {
        OverlayClient { entry, config, reasoner }
    }

    async fn routed(&self, request: RoutedRequest) -> Result<Response, Error> {
        self.entry.call(Request::Routed(request), self.config.dispatch_timeout()).await
    }

    /// Store a quadruple on its rendezvous peer, returning the hop count.
    pub async fn publish(&self, quad: Quadruple) -> Result<u32, Error> {
        let request = RoutedRequest::unicast(
            quad.to_coordinate(),
            Action::Publish(quad),
            self.config.max_hops,
        );
        match self.routed(request).await? {
            Response::Delivered { hops } => Ok(hops),
            _ => Err(Error::Routing(RoutingError::UnexpectedResponse("delivered"))),
        }
    }

    /// Collect every stored quadruple matching one atomic pattern.
    pub async fn query(&self, pattern: QuadruplePattern) -> Result<MulticastOutcome, Error> {
        let region = pattern.to_region();
        let outcome = self
            .routed(RoutedRequest::multicast(region, Action::Query(pattern)))
            .await?
            .into_outcome()?;
        Ok(outcome)
    }

    /// Answer a conjunctive multi-pattern query: decompose, fan out the
    /// sub-queries in parallel and join the results.
    pub async fn composite_query(&self, query: &CompositeQuery) -> Result<MulticastOutcome, Error> {
        dispatch::composite_query(
            &self.entry,
            self.reasoner.as_ref(),
            query,
            self.config.dispatch_timeout(),
        )
        .await
    }

    /// Register a subscription made of one or more atomic patterns,
    /// returning the channel its notifications arrive on.
    pub async fn subscribe(
        &self,
        id: SubscriptionId,
        patterns: Vec<QuadruplePattern>,
    ) -> Result<mpsc::UnboundedReceiver<Notification>, Error> {
        let query = patterns
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" . ");
        let subscription = Subscription::new(id, query, patterns.clone());
        let (sink, receiver) = NotificationSink::channel();
        // Each atomic pattern is indexed independently on the peers its
        // region touches.
        for pattern in patterns {
            self.routed(RoutedRequest::multicast(
                pattern.to_region(),
                Action::Subscribe(subscription.clone(), Some(sink.clone())),
            ))
            .await?
            .into_outcome()?;
        }
        Ok(receiver)
    }

    /// Remove a subscription overlay-wide. Safe to repeat.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), Error> {
        self.routed(RoutedRequest::broadcast(
            self.config.dimensions,
            Action::Unsubscribe(id),
        ))
        .await?
        .into_outcome()?;
        Ok(())
    }

    /// Delete every stored quadruple matching the pattern.
    pub async fn delete(&self, pattern: QuadruplePattern) -> Result<MulticastOutcome, Error> {
        let region = pattern.to_region();
        let outcome = self
            .routed(RoutedRequest::multicast(region, Action::Delete(pattern)))
            .await?
            .into_outcome()?;
        Ok(outcome)
    }

    /// Orderly network-wide shutdown: every peer finishes in-flight work,
    /// stops accepting traffic and terminates.
    pub async fn shutdown(&self) -> Result<MulticastOutcome, Error> {
        let outcome = self
            .routed(RoutedRequest::broadcast(self.config.dimensions, Action::Shutdown))
            .await?
            .into_outcome()?;
        Ok(outcome)
    }
}
