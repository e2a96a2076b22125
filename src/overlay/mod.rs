//! Per-peer overlay state and lifecycle.
//!
//! Every peer is an independent actor owning its zone, neighbor table and
//! split history; peers coordinate exclusively through messages. This
//! module holds the peer actor itself plus its supporting pieces: the
//! neighbor table, the operation admission gate, peer stubs and the
//! bounded caches.

pub mod cache;
pub mod client;
pub mod gate;
pub mod neighbor_table;
pub mod peer;
pub mod stub;

use std::fmt;

pub use client::OverlayClient;
pub use gate::{OperationGate, OperationKind, OperationPermit};
pub use neighbor_table::{NeighborEntry, NeighborTable};
pub use peer::PeerHandle;
pub use stub::{Envelope, PeerId, PeerStub};

/// Lifecycle status of a peer.
///
/// `UNINITIALIZED → JOINING → ACTIVATED → LEAVING → TERMINATED`; a peer
/// refuses non-lifecycle operations while not activated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// Created, not yet part of any overlay.
    Uninitialized,
    /// Acquiring a zone slice from the overlay.
    Joining,
    /// Full member, serving traffic.
    Activated,
    /// Handing its zone off before departure.
    Leaving,
    /// Gone; the inbox is closed.
    Terminated,
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerStatus::Uninitialized => write!(f, "uninitialized"),
            PeerStatus::Joining => write!(f, "joining"),
            PeerStatus::Activated => write!(f, "activated"),
            PeerStatus::Leaving => write!(f, "leaving"),
            PeerStatus::Terminated => write!(f, "terminated"),
        }
    }
}

/// Errors raised by overlay lifecycle transitions.
#[derive(Debug)]
pub enum LifecycleError {
    /// A non-lifecycle operation hit a peer that is not activated.
    NotActivated(PeerStatus),
    /// The join could not be completed; the joiner may retry from scratch.
    JoinFailed(String),
    /// The leave could not be completed; the peer stays activated.
    LeaveFailed(String),
    /// No split-history entry matches a reachable neighbor to reabsorb the
    /// zone.
    NoAbsorber,
    /// A zone handed across a lifecycle step does not line up with the
    /// local geometry.
    ZoneMismatch(String),
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleError::NotActivated(status) => {
                write!(f, "peer is not activated (status: {})", status)
            }
            LifecycleError::JoinFailed(msg) => write!(f, "join failed: {}", msg),
            LifecycleError::LeaveFailed(msg) => write!(f, "leave failed: {}", msg),
            LifecycleError::NoAbsorber => {
                write!(f, "no split-history entry matches a reachable absorber")
            }
            LifecycleError::ZoneMismatch(msg) => write!(f, "zone mismatch: {}", msg),
        }
    }
}

impl std::error::Error for LifecycleError {}
