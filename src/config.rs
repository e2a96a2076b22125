//! Configuration surface for the overlay core.
//!
//! One peer process consumes a single [`OverlayConfig`]. The defaults are
//! tuned for small in-process overlays (tests, demos); deployments load a
//! JSON file via [`OverlayConfig::from_file`].

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Number of coordinate dimensions used when indexing quadruples.
///
/// One axis per quadruple position (graph, subject, predicate, object).
pub const QUAD_DIMENSIONS: usize = 4;

/// Per-criterion load thresholds and weight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriterionConfig {
    /// Criterion name, matched against the built-in criteria by the engine.
    pub name: String,
    /// Below this raw value the criterion never contributes to an
    /// overload/underload classification.
    pub warmup_threshold: f64,
    /// At or above this raw value the peer is overloaded no matter what the
    /// rest of the overlay looks like.
    pub emergency_threshold: f64,
    /// Weight of this criterion in the weighted load sum.
    pub weight: f64,
}

/// Configuration for the load-balancing engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancingConfig {
    /// Fixed delay between two probe iterations, in milliseconds.
    pub probing_interval_ms: u64,
    /// A peer is overloaded when its weighted load exceeds
    /// `imbalance_ratio * average overlay load`, underloaded below
    /// `average / imbalance_ratio`.
    pub imbalance_ratio: f64,
    /// Gossiped reports older than this window are ignored when estimating
    /// the average overlay load, in milliseconds.
    pub history_window_ms: u64,
    /// Number of peers a changed report is pushed to each iteration.
    pub gossip_fanout: usize,
    /// A new report is gossiped only when it differs from the last gossiped
    /// one by at least this ratio.
    pub gossip_damping_ratio: f64,
    /// Maximum number of remote reports retained.
    pub max_reports: usize,
    /// Ordered list of measured criteria.
    pub criteria: Vec<CriterionConfig>,
}

impl Default for LoadBalancingConfig {
    fn default() -> Self {
        LoadBalancingConfig {
            probing_interval_ms: 500,
            imbalance_ratio: 2.0,
            history_window_ms: 10_000,
            gossip_fanout: 3,
            gossip_damping_ratio: 0.1,
            max_reports: 128,
            criteria: vec![
                CriterionConfig {
                    name: "stored_quadruples".to_string(),
                    warmup_threshold: 100.0,
                    emergency_threshold: 10_000.0,
                    weight: 1.0,
                },
                CriterionConfig {
                    name: "request_throughput".to_string(),
                    warmup_threshold: 50.0,
                    emergency_threshold: 5_000.0,
                    weight: 1.0,
                },
            ],
        }
    }
}

/// Top-level configuration consumed by every peer of an overlay.
///
/// All peers of one overlay must agree on `dimensions` and `min_zone_side`;
/// the remaining knobs are per-peer tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayConfig {
    /// Number of dimensions D of the coordinate space.
    pub dimensions: usize,
    /// A zone interval narrower than twice this value refuses to split.
    pub min_zone_side: u64,
    /// Maximum number of hops a unicast message may travel.
    pub max_hops: u32,
    /// How many times a joining peer retries with a fresh target coordinate
    /// after a `ZoneTooSmall` refusal.
    pub join_retries: u32,
    /// Budget for composite query fan-out, in milliseconds.
    pub dispatch_timeout_ms: u64,
    /// Budget for a single peer-to-peer request round trip, in milliseconds.
    pub request_timeout_ms: u64,
    /// Capacity of the peer-stub cache.
    pub peer_stub_cache_capacity: usize,
    /// Capacity of the subscription cache.
    pub subscription_cache_capacity: usize,
    /// Time-to-live of cached entries, in milliseconds.
    pub cache_ttl_ms: u64,
    /// Load-balancing engine configuration.
    pub load_balancing: LoadBalancingConfig,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        OverlayConfig {
            dimensions: QUAD_DIMENSIONS,
            min_zone_side: 2,
            max_hops: 64,
            join_retries: 3,
            dispatch_timeout_ms: 5_000,
            request_timeout_ms: 2_000,
            peer_stub_cache_capacity: 256,
            subscription_cache_capacity: 256,
            cache_ttl_ms: 60_000,
            load_balancing: LoadBalancingConfig::default(),
        }
    }
}

impl OverlayConfig {
    /// Load a configuration from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: OverlayConfig =
            serde_json::from_str(&text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency of the configured values.
    pub fn validate(&self) -> Result<()> {
        if self.dimensions == 0 {
            return Err(Error::Config("dimensions must be at least 1".to_string()));
        }
        if self.min_zone_side == 0 {
            return Err(Error::Config("min_zone_side must be at least 1".to_string()));
        }
        if self.load_balancing.imbalance_ratio <= 1.0 {
            return Err(Error::Config(
                "imbalance_ratio must be greater than 1.0".to_string(),
            ));
        }
        for criterion in &self.load_balancing.criteria {
            if criterion.emergency_threshold < criterion.warmup_threshold {
                return Err(Error::Config(format!(
                    "criterion {}: emergency threshold below warmup threshold",
                    criterion.name
                )));
            }
        }
        Ok(())
    }

    /// The dispatch timeout as a [`Duration`].
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    /// The per-request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// The load-balancing probing interval as a [`Duration`].
    pub fn probing_interval(&self) -> Duration {
        Duration::from_millis(self.load_balancing.probing_interval_ms)
    }

    /// The cache time-to-live as a [`Duration`].
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(OverlayConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_dimensions() {
        let mut config = OverlayConfig::default();
        config.dimensions = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let mut config = OverlayConfig::default();
        config.load_balancing.criteria[0].warmup_threshold = 100.0;
        config.load_balancing.criteria[0].emergency_threshold = 50.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_round_trips_through_json() {
        let config = OverlayConfig::default();
        let text = serde_json::to_string(&config).unwrap();
        let back: OverlayConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.dimensions, config.dimensions);
        assert_eq!(back.load_balancing.criteria.len(), config.load_balancing.criteria.len());
    }
}
