//! Load classification and reassignment decisions.
//!
//! Pure decision logic, kept free of peer internals so it can be unit
//! tested exhaustively; the peer's balancing loop feeds it measurements
//! and acts on the outcome.

use std::fmt;

use rand::seq::SliceRandom;

use crate::load::criteria::{weights, LoadCriterion};
use crate::load::report::LoadReport;
use crate::overlay::PeerId;

/// Local load classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadClass {
    /// Within normal bounds; no action.
    Normal,
    /// Carrying too much; sheds half its load to a candidate.
    Overloaded,
    /// Carrying notably less than the overlay average.
    Underloaded,
}

impl fmt::Display for LoadClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadClass::Normal => write!(f, "normal"),
            LoadClass::Overloaded => write!(f, "overloaded"),
            LoadClass::Underloaded => write!(f, "underloaded"),
        }
    }
}

/// Classify a peer's measured load.
///
/// Emergency strictly overrides everything: any criterion at or past its
/// emergency threshold classifies `Overloaded` no matter the overlay
/// average. Otherwise a peer entirely below its warmup thresholds is
/// `Normal`, and only past warmup do the relative comparisons against the
/// average overlay load apply.
pub fn classify(
    measured: &[f64],
    criteria: &[Box<dyn LoadCriterion>],
    average: Option<f64>,
    imbalance_ratio: f64,
) -> LoadClass {
    for (value, criterion) in measured.iter().zip(criteria.iter()) {
        if *value >= criterion.emergency_threshold() {
            return LoadClass::Overloaded;
        }
    }
    let warmed_up = measured
        .iter()
        .zip(criteria.iter())
        .any(|(value, criterion)| *value >= criterion.warmup_threshold());
    if !warmed_up {
        return LoadClass::Normal;
    }
    let Some(average) = average else {
        return LoadClass::Normal;
    };
    let weighted: f64 = measured
        .iter()
        .zip(criteria.iter())
        .map(|(value, criterion)| value * criterion.weight())
        .sum();
    if weighted > imbalance_ratio * average {
        LoadClass::Overloaded
    } else if weighted < average / imbalance_ratio {
        LoadClass::Underloaded
    } else {
        LoadClass::Normal
    }
}

/// Relative tolerance grouping reports into the "lowest bucket".
const LOWEST_BUCKET_SLACK: f64 = 0.1;

/// Pick the peer that should absorb half of an overloaded peer's load.
///
/// Candidates are the fresh reports with the lowest weighted load (within
/// a small slack of the minimum), ties broken uniformly at random. A
/// candidate is rejected when absorbing half the overloaded peer's
/// per-criterion values would push any of its criteria past emergency.
pub fn select_candidate(
    reports: &[&LoadReport],
    own_values: &[f64],
    criteria: &[Box<dyn LoadCriterion>],
) -> Option<PeerId> {
    let weights = weights(criteria);
    let qualified: Vec<&&LoadReport> = reports
        .iter()
        .filter(|report| {
            report.values.iter().zip(own_values.iter()).zip(criteria.iter()).all(
                |((candidate, own), criterion)| {
                    candidate + own / 2.0 < criterion.emergency_threshold()
                },
            )
        })
        .collect();
    if qualified.is_empty() {
        return None;
    }
    let minimum = qualified
        .iter()
        .map(|r| r.weighted_sum(&weights))
        .fold(f64::INFINITY, f64::min);
    let ceiling = minimum + minimum.abs() * LOWEST_BUCKET_SLACK;
    let bucket: Vec<PeerId> = qualified
        .iter()
        .filter(|r| r.weighted_sum(&weights) <= ceiling)
        .map(|r| r.peer)
        .collect();
    bucket.choose(&mut rand::thread_rng()).copied()
}

/// Whether a freshly measured report differs enough from the last gossiped
/// one to be worth pushing (ratio-based damping).
pub fn should_gossip(
    last: Option<&LoadReport>,
    current: &LoadReport,
    weights: &[f64],
    damping_ratio: f64,
) -> bool {
    let Some(last) = last else {
        return true;
    };
    let previous = last.weighted_sum(weights);
    let now = current.weighted_sum(weights);
    if previous == 0.0 {
        return now != 0.0;
    }
    ((now - previous) / previous).abs() >= damping_ratio
}
