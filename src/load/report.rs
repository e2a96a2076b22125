//! Load reports and the per-peer report cache.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::overlay::PeerId;

/// Immutable snapshot of one peer's measured load, gossiped around the
/// overlay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadReport {
    /// The measured peer.
    pub peer: PeerId,
    /// Raw measured value per criterion, in configured criterion order.
    pub values: Vec<f64>,
    /// Milliseconds since the epoch at measurement time.
    pub created_at: u64,
}

impl LoadReport {
    /// Snapshot the given per-criterion values now.
    pub fn now(peer: PeerId, values: Vec<f64>) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        LoadReport { peer, values, created_at }
    }

    /// Weighted sum of the report's values.
    pub fn weighted_sum(&self, weights: &[f64]) -> f64 {
        self.values
            .iter()
            .zip(weights.iter().chain(std::iter::repeat(&1.0)))
            .map(|(v, w)| v * w)
            .sum()
    }

    /// Wire encoding used by the gossip push.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Decode a gossiped report.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Bounded sliding-window cache of the latest report per sender.
#[derive(Debug, Default)]
pub struct ReportCache {
    reports: HashMap<PeerId, LoadReport>,
    max_reports: usize,
    window_ms: u64,
}

impl ReportCache {
    /// Create a cache keeping at most `max_reports` senders, ignoring
    /// reports older than `window_ms` when aggregating.
    pub fn new(max_reports: usize, window_ms: u64) -> Self {
        ReportCache { reports: HashMap::new(), max_reports: max_reports.max(1), window_ms }
    }

    /// Store a received report, keeping only the newest per sender.
    pub fn store(&mut self, report: LoadReport) {
        if let Some(existing) = self.reports.get(&report.peer) {
            if existing.created_at > report.created_at {
                return;
            }
        }
        if self.reports.len() >= self.max_reports && !self.reports.contains_key(&report.peer) {
            // Evict the stalest sender.
            if let Some(oldest) = self
                .reports
                .values()
                .min_by_key(|r| r.created_at)
                .map(|r| r.peer)
            {
                self.reports.remove(&oldest);
            }
        }
        self.reports.insert(report.peer, report);
    }

    /// Forget a departed peer.
    pub fn remove(&mut self, peer: PeerId) {
        self.reports.remove(&peer);
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Reports still inside the time window.
    pub fn fresh(&self) -> Vec<&LoadReport> {
        let now = Self::now_ms();
        self.reports
            .values()
            .filter(|r| now.saturating_sub(r.created_at) <= self.window_ms)
            .collect()
    }

    /// Average weighted load across fresh remote reports plus the local
    /// one; `None` without any fresh remote report (no basis for relative
    /// classification).
    pub fn average_with(&self, local: &LoadReport, weights: &[f64]) -> Option<f64> {
        let fresh = self.fresh();
        if fresh.is_empty() {
            return None;
        }
        let sum: f64 = fresh
            .iter()
            .map(|r| r.weighted_sum(weights))
            .chain(std::iter::once(local.weighted_sum(weights)))
            .sum();
        Some(sum / (fresh.len() + 1) as f64)
    }

    /// Number of cached senders.
    pub fn len(&self) -> usize {
        self.reports.len()
    }

    /// Whether no reports are cached.
    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_keeps_newest_per_sender() {
        let peer = PeerId::from_raw(1);
        let mut cache = ReportCache::new(8, 60_000);
        cache.store(LoadReport { peer, values: vec![5.0], created_at: 10 });
        cache.store(LoadReport { peer, values: vec![1.0], created_at: 5 });
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.fresh().len(), 0); // both far outside the window
    }

    #[test]
    fn test_bounded_by_max_reports() {
        let mut cache = ReportCache::new(2, u64::MAX);
        for raw in 0..4u64 {
            cache.store(LoadReport::now(PeerId::from_raw(raw), vec![raw as f64]));
        }
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_average_includes_local_report() {
        let mut cache = ReportCache::new(8, u64::MAX);
        cache.store(LoadReport::now(PeerId::from_raw(1), vec![10.0]));
        let local = LoadReport::now(PeerId::from_raw(2), vec![30.0]);
        let average = cache.average_with(&local, &[1.0]).unwrap();
        assert!((average - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_bincode_roundtrip() {
        let report = LoadReport::now(PeerId::from_raw(7), vec![1.0, 2.0]);
        let bytes = report.to_bytes().unwrap();
        assert_eq!(LoadReport::from_bytes(&bytes).unwrap(), report);
    }
}
