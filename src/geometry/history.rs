//! Split history: the per-peer log that makes leave/merge reversible.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::coordinate::Element;
use super::zone::Direction;

/// One split a peer's zone has undergone.
///
/// `direction` is the side of the recording peer's zone on which the other
/// half ended up; `boundary` is the cut element. A later merge across the
/// same face consumes the entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitEntry {
    /// Milliseconds since the epoch at which the split was applied.
    pub at: u64,
    /// Dimension along which the zone was cut.
    pub dimension: usize,
    /// Side of the recording peer's zone given to (or kept by) the other
    /// peer.
    pub direction: Direction,
    /// The cut element.
    pub boundary: Element,
}

impl SplitEntry {
    /// Record a split happening now.
    pub fn now(dimension: usize, direction: Direction, boundary: Element) -> Self {
        let at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        SplitEntry { at, dimension, direction, boundary }
    }
}

/// Ordered log of the splits a peer's zone has undergone.
///
/// Append-only during splits; entries are consumed from the most recent end
/// when a matching enlarge/merge completes. Owned exclusively by the peer
/// whose zone it documents; a joiner inherits the splitter's prior entries
/// because they describe the lineage of the zone half it received.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SplitHistory {
    entries: Vec<SplitEntry>,
}

impl SplitHistory {
    /// An empty history (a peer that was never split).
    pub fn new() -> Self {
        SplitHistory { entries: Vec::new() }
    }

    /// Number of recorded splits. Also drives the round-robin dimension
    /// choice for the next split.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the zone was never split.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a new split record.
    pub fn push(&mut self, entry: SplitEntry) {
        self.entries.push(entry);
    }

    /// Entries from most recent to oldest.
    pub fn iter_recent_first(&self) -> impl Iterator<Item = &SplitEntry> {
        self.entries.iter().rev()
    }

    /// Consume the most recent entry matching `dimension` and `boundary`.
    pub fn pop_matching(&mut self, dimension: usize, boundary: Element) -> Option<SplitEntry> {
        let idx = self
            .entries
            .iter()
            .rposition(|e| e.dimension == dimension && e.boundary == boundary)?;
        Some(self.entries.remove(idx))
    }

    /// The most recent entry, if any.
    pub fn last(&self) -> Option<&SplitEntry> {
        self.entries.last()
    }

    /// Absorb the remaining history of a merged-away peer.
    ///
    /// The absorbed entries describe splits of the lineage the enlarged zone
    /// now covers; they are spliced in below the absorber's own entries so
    /// consumption order stays most-recent-first.
    pub fn inherit(&mut self, mut other: SplitHistory) {
        other.entries.retain(|e| !self.entries.contains(e));
        let mut merged = other.entries;
        merged.append(&mut self.entries);
        merged.sort_by_key(|e| e.at);
        self.entries = merged;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pop_matching_takes_most_recent() {
        let mut history = SplitHistory::new();
        history.push(SplitEntry { at: 1, dimension: 0, direction: Direction::Upper, boundary: 50 });
        history.push(SplitEntry { at: 2, dimension: 1, direction: Direction::Upper, boundary: 50 });
        history.push(SplitEntry { at: 3, dimension: 0, direction: Direction::Lower, boundary: 50 });

        let popped = history.pop_matching(0, 50).unwrap();
        assert_eq!(popped.at, 3);
        assert_eq!(history.len(), 2);
        assert!(history.pop_matching(0, 99).is_none());
    }

    #[test]
    fn test_inherit_orders_by_time() {
        let mut a = SplitHistory::new();
        a.push(SplitEntry { at: 5, dimension: 0, direction: Direction::Upper, boundary: 50 });
        let mut b = SplitHistory::new();
        b.push(SplitEntry { at: 2, dimension: 1, direction: Direction::Lower, boundary: 25 });

        a.inherit(b);
        assert_eq!(a.len(), 2);
        assert_eq!(a.last().unwrap().at, 5);
    }
}
