//! The per-peer neighbor table.
//!
//! A 2×D grid of slots, one per (dimension, direction) face of the peer's
//! zone, each holding the cached identity/stub/zone of every peer abutting
//! that face. The table is a cache: tolerant of temporary staleness,
//! refreshed explicitly on topology events, and never shared between peers.

use std::fmt;

use crate::geometry::{Direction, Zone};
use crate::overlay::stub::{PeerId, PeerStub};

/// Cached view of one neighboring peer.
#[derive(Debug, Clone)]
pub struct NeighborEntry {
    /// The neighbor's identifier.
    pub peer: PeerId,
    /// Handle for talking to the neighbor.
    pub stub: PeerStub,
    /// Zone snapshot as of the last refresh.
    pub zone: Zone,
}

impl NeighborEntry {
    /// Build an entry.
    pub fn new(peer: PeerId, stub: PeerStub, zone: Zone) -> Self {
        NeighborEntry { peer, stub, zone }
    }
}

/// The full 2×D neighbor grid of one peer.
pub struct NeighborTable {
    // slots[dim][direction.index()]
    slots: Vec<[Vec<NeighborEntry>; 2]>,
}

impl NeighborTable {
    /// An empty table for a D-dimensional zone.
    pub fn new(dimensions: usize) -> Self {
        NeighborTable {
            slots: (0..dimensions).map(|_| [Vec::new(), Vec::new()]).collect(),
        }
    }

    /// Number of dimensions.
    pub fn dimensions(&self) -> usize {
        self.slots.len()
    }

    /// Entries cached for one face.
    pub fn get(&self, dim: usize, direction: Direction) -> &[NeighborEntry] {
        &self.slots[dim][direction.index()]
    }

    /// Insert or replace an entry at a face; idempotent on the peer
    /// identifier within the slot and across slots: a peer borders a zone
    /// on exactly one face, so it is removed everywhere first.
    pub fn add(&mut self, dim: usize, direction: Direction, entry: NeighborEntry) {
        self.remove(entry.peer);
        self.slots[dim][direction.index()].push(entry);
    }

    /// Drop every entry for the given peer. Returns whether any slot held
    /// one; repeating the call is harmless.
    pub fn remove(&mut self, peer: PeerId) -> bool {
        let mut removed = false;
        for slot in &mut self.slots {
            for entries in slot.iter_mut() {
                let before = entries.len();
                entries.retain(|e| e.peer != peer);
                removed |= entries.len() != before;
            }
        }
        removed
    }

    /// Re-place a peer according to its (possibly changed) zone relative to
    /// `own_zone`. Returns the face it now occupies, or `None` when it is
    /// no longer adjacent (and was dropped).
    pub fn update(
        &mut self,
        own_zone: &Zone,
        entry: NeighborEntry,
    ) -> Option<(usize, Direction)> {
        match own_zone.neighbors(&entry.zone) {
            Some((dim, direction)) => {
                self.add(dim, direction, entry);
                Some((dim, direction))
            }
            None => {
                self.remove(entry.peer);
                None
            }
        }
    }

    /// Replace a cached zone snapshot in place, keeping the entry's slot
    /// assignment up to date. Used by refresh.
    pub fn set_zone(&mut self, own_zone: &Zone, peer: PeerId, zone: Zone) {
        let Some(stub) = self.entry_of(peer).map(|e| e.stub.clone()) else {
            return;
        };
        self.update(own_zone, NeighborEntry::new(peer, stub, zone));
    }

    /// Whether the table references the peer.
    pub fn contains(&self, peer: PeerId) -> bool {
        self.entry_of(peer).is_some()
    }

    /// The entry for a peer, wherever it sits.
    pub fn entry_of(&self, peer: PeerId) -> Option<&NeighborEntry> {
        self.iter().find(|e| e.peer == peer)
    }

    /// All entries across all faces.
    pub fn iter(&self) -> impl Iterator<Item = &NeighborEntry> {
        self.slots.iter().flat_map(|slot| slot.iter().flatten())
    }

    /// Clone of all entries, for lock-free routing reads.
    pub fn snapshot(&self) -> Vec<NeighborEntry> {
        self.iter().cloned().collect()
    }

    /// Total number of cached entries.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Whether the table is empty (sole peer in the overlay).
    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// Rebuild the table from candidate entries, keeping exactly those
    /// geometrically adjacent to `own_zone`. Used when a zone changes shape
    /// (join grant, split, merge).
    pub fn rebuild(&mut self, own_zone: &Zone, candidates: Vec<NeighborEntry>) {
        for slot in &mut self.slots {
            slot[0].clear();
            slot[1].clear();
        }
        for entry in candidates {
            if let Some((dim, direction)) = own_zone.neighbors(&entry.zone) {
                self.add(dim, direction, entry);
            }
        }
    }
}

impl fmt::Debug for NeighborTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (dim, slot) in self.slots.iter().enumerate() {
            for direction in [Direction::Lower, Direction::Upper] {
                let ids: Vec<PeerId> =
                    slot[direction.index()].iter().map(|e| e.peer).collect();
                map.entry(&format!("{}/{}", dim, direction), &ids);
            }
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Interval;
    use tokio::sync::mpsc;

    fn stub(raw: u64) -> PeerStub {
        let (tx, _rx) = mpsc::unbounded_channel();
        PeerStub::new(PeerId::from_raw(raw), tx)
    }

    fn zone(x: (u64, u64), y: (u64, u64)) -> Zone {
        Zone::new(vec![
            Interval::new(x.0, x.1).unwrap(),
            Interval::new(y.0, y.1).unwrap(),
        ])
    }

    #[test]
    fn test_add_is_idempotent_per_peer() {
        let mut table = NeighborTable::new(2);
        let entry = NeighborEntry::new(PeerId::from_raw(1), stub(1), zone((50, 100), (0, 100)));
        table.add(0, Direction::Upper, entry.clone());
        table.add(0, Direction::Upper, entry);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_remove_clears_all_slots() {
        let mut table = NeighborTable::new(2);
        table.add(
            0,
            Direction::Upper,
            NeighborEntry::new(PeerId::from_raw(1), stub(1), zone((50, 100), (0, 100))),
        );
        assert!(table.remove(PeerId::from_raw(1)));
        assert!(!table.remove(PeerId::from_raw(1)));
        assert!(table.is_empty());
    }

    #[test]
    fn test_update_moves_entry_between_faces() {
        let own = zone((0, 50), (0, 100));
        let mut table = NeighborTable::new(2);
        let peer = PeerId::from_raw(1);
        table.update(&own, NeighborEntry::new(peer, stub(1), zone((50, 100), (0, 100))));
        assert_eq!(table.get(0, Direction::Upper).len(), 1);

        // The neighbor's zone moved; it is no longer adjacent.
        table.update(&own, NeighborEntry::new(peer, stub(1), zone((60, 100), (0, 100))));
        assert!(table.is_empty());
    }

    #[test]
    fn test_rebuild_filters_non_adjacent_candidates() {
        let own = zone((0, 50), (0, 100));
        let mut table = NeighborTable::new(2);
        table.rebuild(
            &own,
            vec![
                NeighborEntry::new(PeerId::from_raw(1), stub(1), zone((50, 100), (0, 100))),
                NeighborEntry::new(PeerId::from_raw(2), stub(2), zone((60, 100), (0, 100))),
            ],
        );
        assert_eq!(table.len(), 1);
        assert!(table.contains(PeerId::from_raw(1)));
    }
}
