//! Load measurement, gossip and the balancing engine.
//!
//! Each peer periodically measures its own load across an ordered list of
//! criteria, gossips the resulting report to a few neighbors, estimates the
//! overlay average from the reports it received, classifies itself and,
//! when overloaded, instructs an underloaded peer to take over half of its
//! responsibility. At most one such decision is in flight at a time.

pub mod balancer;
pub mod criteria;
pub mod report;

pub use balancer::{classify, select_candidate, should_gossip, LoadClass};
pub use criteria::{build_criteria, weights, LoadCriterion, LoadProbe};
pub use report::{LoadReport, ReportCache};
