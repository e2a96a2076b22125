//! # Tessella
//!
//! Tessella is a structured peer-to-peer overlay, a Content-Addressable
//! Network (CAN), specialized to index and route RDF quadruples, with a
//! publish/subscribe matching engine riding on top.
//!
//! The name "Tessella" is the Latin word for the small tile of a mosaic:
//! every peer owns one exclusive tile (zone) of a D-dimensional coordinate
//! space, and the tiles together cover the whole space with no overlap.
//! Quadruples are mapped deterministically onto coordinates in that space,
//! so publishing, querying and subscribing all reduce to routing over the
//! tiling.
//!
//! ## Features
//!
//! - Zone splitting and merging as peers join and leave
//! - Greedy unicast, region multicast and overlay broadcast routing
//! - Gossip-driven load balancing with peer reassignment
//! - Quadruple-pattern publish/subscribe indexing
//!
//! ## Example
//!
//! ```rust
//! use tessella::Result;
//!
//! fn example() -> Result<()> {
//!     println!("Tessella CAN overlay for RDF quadruples");
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_docs_in_private_items)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::if_not_else)]
#![allow(clippy::new_without_default)]
#![allow(missing_docs)]

/// Core RDF data model: terms, quadruples, patterns and their mapping onto
/// the coordinate space
pub mod core;

/// Coordinate-space geometry: coordinates, intervals, zones, split history
pub mod geometry;

/// Per-peer overlay state: neighbor tables, the operation gate, the peer
/// actor and its join/leave lifecycle
pub mod overlay;

/// Request/response message model and the three routing modes
pub mod routing;

/// Request dispatch: background stateful execution and composite query
/// fan-out
pub mod dispatch;

/// Load measurement, gossip and the balancing engine
pub mod load;

/// Publish/subscribe indexing on top of the routing layer
pub mod pubsub;

/// The transactional dataset-graph collaborator interface
pub mod storage;

/// The query decomposition / filtration collaborator interface
pub mod reasoning;

/// Overlay configuration surface
pub mod config;

pub mod error {
    //! Error types and result definitions

    use std::fmt;

    use crate::dispatch::DispatchError;
    use crate::geometry::ZoneError;
    use crate::overlay::LifecycleError;
    use crate::routing::RoutingError;
    use crate::storage::StorageError;

    /// Result type alias for Tessella operations
    pub type Result<T> = std::result::Result<T, Error>;

    /// Main error type for Tessella
    #[derive(Debug)]
    pub enum Error {
        /// Configuration error
        Config(String),
        /// Zone geometry error
        Zone(ZoneError),
        /// Routing failure
        Routing(RoutingError),
        /// Overlay lifecycle failure
        Lifecycle(LifecycleError),
        /// Dispatch failure
        Dispatch(DispatchError),
        /// Storage collaborator failure
        Storage(StorageError),
        /// IO error
        Io(std::io::Error),
        /// Other error
        Other(String),
    }

    impl fmt::Display for Error {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Error::Config(msg) => write!(f, "Configuration error: {}", msg),
                Error::Zone(err) => write!(f, "Zone error: {}", err),
                Error::Routing(err) => write!(f, "Routing error: {}", err),
                Error::Lifecycle(err) => write!(f, "Lifecycle error: {}", err),
                Error::Dispatch(err) => write!(f, "Dispatch error: {}", err),
                Error::Storage(err) => write!(f, "Storage error: {}", err),
                Error::Io(err) => write!(f, "IO error: {}", err),
                Error::Other(msg) => write!(f, "Error: {}", msg),
            }
        }
    }

    impl std::error::Error for Error {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            match self {
                Error::Io(err) => Some(err),
                Error::Zone(err) => Some(err),
                Error::Routing(err) => Some(err),
                Error::Lifecycle(err) => Some(err),
                Error::Dispatch(err) => Some(err),
                Error::Storage(err) => Some(err),
                _ => None,
            }
        }
    }

    impl From<std::io::Error> for Error {
        fn from(err: std::io::Error) -> Self {
            Error::Io(err)
        }
    }

    impl From<ZoneError> for Error {
        fn from(err: ZoneError) -> Self {
            Error::Zone(err)
        }
    }

    impl From<RoutingError> for Error {
        fn from(err: RoutingError) -> Self {
            Error::Routing(err)
        }
    }

    impl From<LifecycleError> for Error {
        fn from(err: LifecycleError) -> Self {
            Error::Lifecycle(err)
        }
    }

    impl From<DispatchError> for Error {
        fn from(err: DispatchError) -> Self {
            Error::Dispatch(err)
        }
    }

    impl From<StorageError> for Error {
        fn from(err: StorageError) -> Self {
            Error::Storage(err)
        }
    }
}

// Re-export commonly used types
pub use error::{Error, Result};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Config("test error".to_string());
        assert_eq!(format!("{}", err), "Configuration error: test error");
    }
}
