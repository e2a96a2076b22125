//! Request dispatch.
//!
//! Two halves live here. [`RequestDispatcher`] is the peer-side manager:
//! stateful request types (queries) run on the blocking worker pool in the
//! background, and their `(duration, result)` pair is harvested by request
//! id when the response path needs it. [`composite_query`] is the
//! caller-side layer: it decomposes one composite query into atomic
//! sub-queries, fans them out in parallel, waits for all of them under a
//! budget and merges the sub-responses, applying the reasoner's final
//! filtration pass when required.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio::task::JoinHandle;

use crate::core::{CompositeQuery, Quadruple};
use crate::error::Error;
use crate::overlay::stub::PeerStub;
use crate::reasoning::QueryReasoner;
use crate::routing::{Action, MulticastOutcome, Request, RequestId, RoutedRequest};

/// Errors raised by the dispatch layer.
#[derive(Debug)]
pub enum DispatchError {
    /// The sub-query fan-out did not complete within its budget. Distinct
    /// from an empty result: the composite query fails instead of
    /// silently returning partial data.
    Timeout,
    /// No background execution is pending under this request id.
    Missing(RequestId),
    /// A background execution panicked or was cancelled.
    TaskFailed(String),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::Timeout => write!(f, "sub-query fan-out timed out"),
            DispatchError::Missing(id) => write!(f, "no pending execution for request {}", id),
            DispatchError::TaskFailed(msg) => write!(f, "background execution failed: {}", msg),
        }
    }
}

impl std::error::Error for DispatchError {}

type PendingResult = (Duration, Result<Vec<Quadruple>, Error>);

/// Per-peer manager for background stateful request execution.
pub struct RequestDispatcher {
    pending: Mutex<HashMap<RequestId, JoinHandle<PendingResult>>>,
}

impl fmt::Debug for RequestDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestDispatcher").finish_non_exhaustive()
    }
}

impl RequestDispatcher {
    /// A dispatcher with nothing pending.
    pub fn new() -> Self {
        RequestDispatcher { pending: Mutex::new(HashMap::new()) }
    }

    /// Execute a stateful handler in the background, recording how long it
    /// ran. The result stays keyed under `id` until harvested.
    pub fn spawn_stateful<F>(&self, id: RequestId, handler: F)
    where
        F: FnOnce() -> Result<Vec<Quadruple>, Error> + Send + 'static,
    {
        let handle = tokio::task::spawn_blocking(move || {
            let start = Instant::now();
            let result = handler();
            (start.elapsed(), result)
        });
        if let Ok(mut pending) = self.pending.lock() {
            if let Some(stale) = pending.insert(id, handle) {
                stale.abort();
            }
        }
    }

    /// Retrieve a background execution's `(duration, result)` pair.
    pub async fn harvest(&self, id: RequestId) -> Result<(Duration, Vec<Quadruple>), Error> {
        let handle = {
            let mut pending = self
                .pending
                .lock()
                .map_err(|_| Error::Dispatch(DispatchError::TaskFailed("lock poisoned".into())))?;
            pending
                .remove(&id)
                .ok_or(Error::Dispatch(DispatchError::Missing(id)))?
        };
        let (elapsed, result) = handle
            .await
            .map_err(|e| Error::Dispatch(DispatchError::TaskFailed(e.to_string())))?;
        Ok((elapsed, result?))
    }

    /// Number of executions not yet harvested.
    pub fn pending(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}

/// Decompose, fan out, await-all and merge a composite query submitted at
/// `entry`.
///
/// All sub-queries run in parallel; the whole fan-out shares one `budget`.
/// Exceeding it raises [`DispatchError::Timeout`] rather than returning the
/// sub-results that did arrive.
pub async fn composite_query(
    entry: &PeerStub,
    reasoner: &dyn QueryReasoner,
    query: &CompositeQuery,
    budget: Duration,
) -> Result<MulticastOutcome, Error> {
    let patterns = reasoner.decompose(query);
    let calls = patterns.iter().map(|pattern| {
        let request = Request::Routed(RoutedRequest::multicast(
            pattern.to_region(),
            Action::Query(pattern.clone()),
        ));
        entry.call(request, budget)
    });

    let responses = tokio::time::timeout(budget, join_all(calls))
        .await
        .map_err(|_| Error::Dispatch(DispatchError::Timeout))?;

    let mut merged = MulticastOutcome::default();
    for response in responses {
        let outcome = response?.into_outcome().map_err(Error::Routing)?;
        merged.merge(outcome);
    }

    if reasoner.requires_filtration(query) {
        merged.quads = reasoner.filter(query, merged.quads);
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_error_display() {
        assert_eq!(format!("{}", DispatchError::Timeout), "sub-query fan-out timed out");
    }

    #[tokio::test]
    async fn test_spawn_and_harvest() {
        let dispatcher = RequestDispatcher::new();
        let id = RequestId::random();
        let quad = Quadruple::parse("<g> <a> <p> <b>").unwrap();
        let expected = vec![quad.clone()];
        dispatcher.spawn_stateful(id, move || Ok(expected));
        let (elapsed, quads) = dispatcher.harvest(id).await.unwrap();
        assert_eq!(quads, vec![quad]);
        assert!(elapsed < Duration::from_secs(5));
        assert_eq!(dispatcher.pending(), 0);
    }

    #[tokio::test]
    async fn test_harvest_unknown_id_is_missing() {
        let dispatcher = RequestDispatcher::new();
        let err = dispatcher.harvest(RequestId::random()).await.unwrap_err();
        assert!(matches!(err, Error::Dispatch(DispatchError::Missing(_))));
    }
}
