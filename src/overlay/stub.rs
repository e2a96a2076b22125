//! Peer identities and in-process peer stubs.
//!
//! Cross-peer interaction is exclusively asynchronous message passing: a
//! [`PeerStub`] is the local handle standing in for a remote peer, backed
//! by the peer task's inbox channel. Request/response calls return futures
//! resolved by a oneshot reply; gossip pushes are fire-and-forget.

use std::fmt;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::error::Error;
use crate::routing::{Request, Response, RoutingError};

/// Globally unique peer identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(u64);

impl PeerId {
    /// Draw a fresh random identifier.
    pub fn random() -> Self {
        PeerId(rand::thread_rng().gen())
    }

    /// Build an identifier from a raw value (tests).
    pub fn from_raw(raw: u64) -> Self {
        PeerId(raw)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({:016x})", self.0)
    }
}

/// One message in a peer's inbox: the request plus an optional reply
/// channel (absent for fire-and-forget pushes).
#[derive(Debug)]
pub struct Envelope {
    pub request: Request,
    pub reply: Option<oneshot::Sender<Result<Response, Error>>>,
}

/// Handle to a peer, local or (conceptually) remote.
#[derive(Debug, Clone)]
pub struct PeerStub {
    id: PeerId,
    inbox: mpsc::UnboundedSender<Envelope>,
}

impl PeerStub {
    /// Build a stub from a peer's identifier and inbox sender.
    pub fn new(id: PeerId, inbox: mpsc::UnboundedSender<Envelope>) -> Self {
        PeerStub { id, inbox }
    }

    /// Identifier of the peer behind this stub.
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Send a request and await its response, bounded by `timeout`.
    pub async fn call(&self, request: Request, timeout: Duration) -> Result<Response, Error> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(Envelope { request, reply: Some(tx) })
            .map_err(|_| Error::Routing(RoutingError::Unreachable(self.id)))?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // Peer dropped the reply channel (terminated mid-request).
            Ok(Err(_)) => Err(Error::Routing(RoutingError::Unreachable(self.id))),
            Err(_) => Err(Error::Routing(RoutingError::Timeout(self.id))),
        }
    }

    /// Fire-and-forget push; delivery is not guaranteed.
    pub fn cast(&self, request: Request) {
        let _ = self.inbox.send(Envelope { request, reply: None });
    }

    /// Whether the peer task behind the stub is still accepting messages.
    pub fn is_open(&self) -> bool {
        !self.inbox.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_display_is_stable_hex() {
        let id = PeerId::from_raw(0xdead_beef);
        assert_eq!(format!("{}", id), "00000000deadbeef");
    }

    #[tokio::test]
    async fn test_call_on_closed_inbox_is_unreachable() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let stub = PeerStub::new(PeerId::from_raw(1), tx);
        let err = stub.call(Request::GetZone, Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, Error::Routing(RoutingError::Unreachable(_))));
    }
}
