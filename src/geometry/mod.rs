//! Coordinate-space geometry.
//!
//! The overlay partitions a D-dimensional space of `u64` scalars among
//! peers. Everything routing and lifecycle do reduces to the primitive
//! operations defined here: interval containment, zone adjacency, midpoint
//! splits and their exact inverses.

pub mod coordinate;
pub mod history;
pub mod zone;

pub use coordinate::{Coordinate, Element};
pub use history::{SplitEntry, SplitHistory};
pub use zone::{Direction, Interval, Region, Zone, ZoneError};
