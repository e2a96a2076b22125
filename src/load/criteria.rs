//! Measurable load criteria.

use tracing::warn;

use crate::config::{CriterionConfig, LoadBalancingConfig};

/// One probe's worth of raw local measurements, taken by the peer at the
/// start of a balancing iteration.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadProbe {
    /// Quadruples currently stored by the peer (reserved graphs included;
    /// they cost memory like everything else).
    pub stored_quadruples: u64,
    /// Requests handled since the previous probe.
    pub requests_in_window: u64,
}

/// A measurable load criterion with its thresholds.
pub trait LoadCriterion: Send + Sync {
    /// Configured criterion name.
    fn name(&self) -> &str;

    /// Raw measured value for this probe.
    fn load(&self, probe: &LoadProbe) -> f64;

    /// Below this the criterion never drives a classification.
    fn warmup_threshold(&self) -> f64;

    /// At or above this the peer is overloaded unconditionally.
    fn emergency_threshold(&self) -> f64;

    /// Weight in the weighted load sum.
    fn weight(&self) -> f64;

    /// Measured value scaled against the emergency threshold.
    fn normalized(&self, raw: f64) -> f64 {
        let emergency = self.emergency_threshold();
        if emergency > 0.0 {
            raw / emergency
        } else {
            raw
        }
    }
}

struct StoredQuadruples {
    config: CriterionConfig,
}

impl LoadCriterion for StoredQuadruples {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn load(&self, probe: &LoadProbe) -> f64 {
        probe.stored_quadruples as f64
    }

    fn warmup_threshold(&self) -> f64 {
        self.config.warmup_threshold
    }

    fn emergency_threshold(&self) -> f64 {
        self.config.emergency_threshold
    }

    fn weight(&self) -> f64 {
        self.config.weight
    }
}

struct RequestThroughput {
    config: CriterionConfig,
}

impl LoadCriterion for RequestThroughput {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn load(&self, probe: &LoadProbe) -> f64 {
        probe.requests_in_window as f64
    }

    fn warmup_threshold(&self) -> f64 {
        self.config.warmup_threshold
    }

    fn emergency_threshold(&self) -> f64 {
        self.config.emergency_threshold
    }

    fn weight(&self) -> f64 {
        self.config.weight
    }
}

/// Instantiate the criteria named by the configuration, in order. Unknown
/// names are skipped with a warning rather than failing the peer.
pub fn build_criteria(config: &LoadBalancingConfig) -> Vec<Box<dyn LoadCriterion>> {
    let mut criteria: Vec<Box<dyn LoadCriterion>> = Vec::new();
    for criterion in &config.criteria {
        match criterion.name.as_str() {
            "stored_quadruples" => {
                criteria.push(Box::new(StoredQuadruples { config: criterion.clone() }));
            }
            "request_throughput" => {
                criteria.push(Box::new(RequestThroughput { config: criterion.clone() }));
            }
            other => {
                warn!(criterion = other, "unknown load criterion in configuration, skipping");
            }
        }
    }
    criteria
}

/// The weights of the given criteria, in order.
pub fn weights(criteria: &[Box<dyn LoadCriterion>]) -> Vec<f64> {
    criteria.iter().map(|c| c.weight()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_criteria_skips_unknown() {
        let mut config = LoadBalancingConfig::default();
        config.criteria.push(CriterionConfig {
            name: "cpu_teleportation".to_string(),
            warmup_threshold: 0.0,
            emergency_threshold: 1.0,
            weight: 1.0,
        });
        let criteria = build_criteria(&config);
        assert_eq!(criteria.len(), 2);
    }

    #[test]
    fn test_measurement_reads_probe() {
        let criteria = build_criteria(&LoadBalancingConfig::default());
        let probe = LoadProbe { stored_quadruples: 42, requests_in_window: 7 };
        assert!((criteria[0].load(&probe) - 42.0).abs() < f64::EPSILON);
        assert!((criteria[1].load(&probe) - 7.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_normalized_scales_by_emergency() {
        let criteria = build_criteria(&LoadBalancingConfig::default());
        let normalized = criteria[0].normalized(5_000.0);
        assert!((normalized - 0.5).abs() < f64::EPSILON);
    }
}
