//! Zones: per-peer exclusive regions of the coordinate space.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::coordinate::{Coordinate, Element};

/// Side of a zone along one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Towards smaller elements.
    Lower,
    /// Towards larger elements.
    Upper,
}

impl Direction {
    /// The opposite side.
    pub fn opposite(self) -> Direction {
        match self {
            Direction::Lower => Direction::Upper,
            Direction::Upper => Direction::Lower,
        }
    }

    /// Index into a 2-slot per-dimension array.
    pub fn index(self) -> usize {
        match self {
            Direction::Lower => 0,
            Direction::Upper => 1,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Lower => write!(f, "lower"),
            Direction::Upper => write!(f, "upper"),
        }
    }
}

/// Errors raised by zone geometry operations.
#[derive(Debug)]
pub enum ZoneError {
    /// The interval on `dimension` is too narrow to split again.
    ZoneTooSmall {
        /// Dimension whose interval refused the split.
        dimension: usize,
        /// Current interval width on that dimension.
        width: u64,
    },
    /// Two zones/coordinates of different arity were combined.
    DimensionMismatch {
        /// Expected number of dimensions.
        expected: usize,
        /// Number of dimensions actually supplied.
        actual: usize,
    },
    /// An interval with `lower > upper` was supplied.
    InvalidInterval {
        /// Offending lower bound.
        lower: Element,
        /// Offending upper bound.
        upper: Element,
    },
}

impl fmt::Display for ZoneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZoneError::ZoneTooSmall { dimension, width } => {
                write!(f, "zone too small to split on dimension {} (width {})", dimension, width)
            }
            ZoneError::DimensionMismatch { expected, actual } => {
                write!(f, "dimension mismatch: expected {}, got {}", expected, actual)
            }
            ZoneError::InvalidInterval { lower, upper } => {
                write!(f, "invalid interval [{}, {})", lower, upper)
            }
        }
    }
}

impl std::error::Error for ZoneError {}

/// A half-open interval `[lower, upper)` on one axis.
///
/// The full axis is `[0, Element::MAX)` plus the maximum element itself,
/// which is treated as belonging to the topmost interval so that the space
/// has no uncovered point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interval {
    /// Inclusive lower bound.
    pub lower: Element,
    /// Exclusive upper bound.
    pub upper: Element,
}

impl Interval {
    /// Create an interval, validating bound order.
    pub fn new(lower: Element, upper: Element) -> Result<Self, ZoneError> {
        if lower > upper {
            return Err(ZoneError::InvalidInterval { lower, upper });
        }
        Ok(Interval { lower, upper })
    }

    /// The full axis.
    pub fn full() -> Self {
        Interval { lower: 0, upper: Element::MAX }
    }

    /// A degenerate interval covering exactly one element.
    pub fn point(value: Element) -> Self {
        Interval { lower: value, upper: value.saturating_add(1) }
    }

    /// Interval width.
    pub fn width(&self) -> u64 {
        self.upper - self.lower
    }

    /// Whether `value` falls inside the interval.
    pub fn contains(&self, value: Element) -> bool {
        value >= self.lower
            && (value < self.upper || (value == Element::MAX && self.upper == Element::MAX))
    }

    /// Whether the two intervals share at least one element.
    pub fn overlaps(&self, other: &Interval) -> bool {
        self.contains(other.lower) || other.contains(self.lower)
    }

    /// Whether `other` starts exactly where `self` ends (or vice versa),
    /// returning the side of `self` on which they touch.
    pub fn abuts(&self, other: &Interval) -> Option<Direction> {
        if self.upper == other.lower && self.upper != Element::MAX {
            Some(Direction::Upper)
        } else if other.upper == self.lower && other.upper != Element::MAX {
            Some(Direction::Lower)
        } else {
            None
        }
    }

    /// Midpoint used by zone splits.
    pub fn midpoint(&self) -> Element {
        self.lower + self.width() / 2
    }

    /// Distance from `value` to the nearest element of the interval, zero
    /// when contained.
    pub fn distance(&self, value: Element) -> u64 {
        if self.contains(value) {
            0
        } else if value < self.lower {
            self.lower - value
        } else {
            value - (self.upper.saturating_sub(1))
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.lower, self.upper)
    }
}

/// An axis-aligned box used as a multicast target; same shape as a zone.
pub type Region = Zone;

/// A peer's exclusive responsibility region: one interval per dimension.
///
/// Bounds only change through [`Zone::split`] and [`Zone::enlarge`], both of
/// which are applied atomically under the owning peer's own operation
/// serialization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Zone {
    intervals: Vec<Interval>,
}

impl Zone {
    /// Create a zone from explicit per-dimension intervals.
    pub fn new(intervals: Vec<Interval>) -> Self {
        Zone { intervals }
    }

    /// The full D-dimensional space.
    pub fn full(dimensions: usize) -> Self {
        Zone { intervals: vec![Interval::full(); dimensions] }
    }

    /// Number of dimensions.
    pub fn dimensions(&self) -> usize {
        self.intervals.len()
    }

    /// The interval on dimension `dim`.
    pub fn interval(&self, dim: usize) -> &Interval {
        &self.intervals[dim]
    }

    /// All intervals in dimension order.
    pub fn intervals(&self) -> &[Interval] {
        &self.intervals
    }

    /// Whether the coordinate falls inside this zone on every dimension.
    pub fn contains(&self, coordinate: &Coordinate) -> bool {
        self.intervals.len() == coordinate.dimensions()
            && self
                .intervals
                .iter()
                .enumerate()
                .all(|(dim, interval)| interval.contains(coordinate.element(dim)))
    }

    /// Whether this zone and the region share interior on every dimension.
    pub fn overlaps(&self, region: &Region) -> bool {
        self.intervals.len() == region.intervals.len()
            && self
                .intervals
                .iter()
                .zip(region.intervals.iter())
                .all(|(a, b)| a.overlaps(b))
    }

    /// Geometric adjacency test.
    ///
    /// Two zones are neighbors when they abut on exactly one dimension and
    /// share interval overlap on all other dimensions. Returns the abutting
    /// dimension and the side of `self` on which `other` sits.
    pub fn neighbors(&self, other: &Zone) -> Option<(usize, Direction)> {
        if self.intervals.len() != other.intervals.len() {
            return None;
        }
        let mut abutting: Option<(usize, Direction)> = None;
        for (dim, (a, b)) in self.intervals.iter().zip(other.intervals.iter()).enumerate() {
            if let Some(direction) = a.abuts(b) {
                if abutting.is_some() {
                    // Corner contact only.
                    return None;
                }
                abutting = Some((dim, direction));
            } else if !a.overlaps(b) {
                return None;
            }
        }
        abutting
    }

    /// Bisect the zone along `dim` at the interval midpoint.
    ///
    /// Returns the lower half, the upper half and the cut element. Fails
    /// with [`ZoneError::ZoneTooSmall`] when the interval cannot host two
    /// halves of at least `min_side` each.
    pub fn split(&self, dim: usize, min_side: u64) -> Result<(Zone, Zone, Element), ZoneError> {
        let interval = &self.intervals[dim];
        if interval.width() < min_side.saturating_mul(2) {
            return Err(ZoneError::ZoneTooSmall { dimension: dim, width: interval.width() });
        }
        let boundary = interval.midpoint();
        let mut lower_half = self.intervals.clone();
        let mut upper_half = self.intervals.clone();
        lower_half[dim] = Interval { lower: interval.lower, upper: boundary };
        upper_half[dim] = Interval { lower: boundary, upper: interval.upper };
        Ok((Zone::new(lower_half), Zone::new(upper_half), boundary))
    }

    /// Extend the interval on `dim` so that its `direction` bound becomes
    /// `bound`. Exact inverse of [`Zone::split`]: enlarging one half towards
    /// the far bound of the other half reproduces the original zone.
    pub fn enlarge(&self, dim: usize, direction: Direction, bound: Element) -> Zone {
        let mut intervals = self.intervals.clone();
        match direction {
            Direction::Lower => intervals[dim].lower = bound,
            Direction::Upper => intervals[dim].upper = bound,
        }
        Zone::new(intervals)
    }

    /// L1 distance from the zone's nearest face to the coordinate, zero when
    /// contained. Greedy unicast forwards to the neighbor minimizing this.
    pub fn distance(&self, coordinate: &Coordinate) -> u128 {
        self.intervals
            .iter()
            .enumerate()
            .map(|(dim, interval)| u128::from(interval.distance(coordinate.element(dim))))
            .sum()
    }

    /// The geometric center of the zone, used as a re-join target.
    pub fn center(&self) -> Coordinate {
        Coordinate::new(self.intervals.iter().map(Interval::midpoint).collect())
    }

    /// The intersection of this zone with a query region, when non-empty.
    pub fn intersection(&self, region: &Region) -> Option<Region> {
        if !self.overlaps(region) {
            return None;
        }
        let intervals = self
            .intervals
            .iter()
            .zip(region.intervals.iter())
            .map(|(a, b)| Interval {
                lower: a.lower.max(b.lower),
                upper: a.upper.min(b.upper),
            })
            .collect();
        Some(Zone::new(intervals))
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, interval) in self.intervals.iter().enumerate() {
            if i > 0 {
                write!(f, "x")?;
            }
            write!(f, "{}", interval)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone_2d(x: (u64, u64), y: (u64, u64)) -> Zone {
        Zone::new(vec![
            Interval::new(x.0, x.1).unwrap(),
            Interval::new(y.0, y.1).unwrap(),
        ])
    }

    #[test]
    fn test_contains_is_per_dimension() {
        let zone = zone_2d((0, 50), (0, 100));
        assert!(zone.contains(&Coordinate::new(vec![10, 99])));
        assert!(!zone.contains(&Coordinate::new(vec![50, 10])));
        assert!(!zone.contains(&Coordinate::new(vec![10, 100])));
    }

    #[test]
    fn test_split_at_midpoint() {
        let zone = zone_2d((0, 100), (0, 100));
        let (lower, upper, boundary) = zone.split(0, 1).unwrap();
        assert_eq!(boundary, 50);
        assert_eq!(lower, zone_2d((0, 50), (0, 100)));
        assert_eq!(upper, zone_2d((50, 100), (0, 100)));
    }

    #[test]
    fn test_split_too_small() {
        let zone = zone_2d((10, 13), (0, 100));
        assert!(matches!(
            zone.split(0, 2),
            Err(ZoneError::ZoneTooSmall { dimension: 0, width: 3 })
        ));
    }

    #[test]
    fn test_enlarge_undoes_split() {
        let zone = zone_2d((0, 100), (20, 60));
        for dim in 0..2 {
            let (lower, upper, _boundary) = zone.split(dim, 1).unwrap();
            // Lower half grows its upper side out to the original bound,
            // upper half grows its lower side back down.
            assert_eq!(lower.enlarge(dim, Direction::Upper, zone.interval(dim).upper), zone);
            assert_eq!(upper.enlarge(dim, Direction::Lower, zone.interval(dim).lower), zone);
        }
    }

    #[test]
    fn test_neighbors_on_shared_face() {
        let a = zone_2d((0, 50), (0, 100));
        let b = zone_2d((50, 100), (0, 100));
        assert_eq!(a.neighbors(&b), Some((0, Direction::Upper)));
        assert_eq!(b.neighbors(&a), Some((0, Direction::Lower)));
    }

    #[test]
    fn test_corner_contact_is_not_adjacency() {
        let a = zone_2d((0, 50), (0, 50));
        let b = zone_2d((50, 100), (50, 100));
        assert_eq!(a.neighbors(&b), None);
    }

    #[test]
    fn test_disjoint_zones_are_not_neighbors() {
        let a = zone_2d((0, 40), (0, 100));
        let b = zone_2d((60, 100), (0, 100));
        assert_eq!(a.neighbors(&b), None);
    }

    #[test]
    fn test_distance_is_zero_inside() {
        let zone = zone_2d((0, 50), (0, 50));
        assert_eq!(zone.distance(&Coordinate::new(vec![10, 10])), 0);
        // (70, 30): 70 is 21 past the last contained element 49.
        assert_eq!(zone.distance(&Coordinate::new(vec![70, 30])), 21);
    }

    #[test]
    fn test_intersection_clips_to_region() {
        let zone = zone_2d((0, 50), (0, 50));
        let region = zone_2d((30, 80), (10, 20));
        let clipped = zone.intersection(&region).unwrap();
        assert_eq!(clipped, zone_2d((30, 50), (10, 20)));
        assert!(zone.intersection(&zone_2d((60, 80), (0, 50))).is_none());
    }

    #[test]
    fn test_full_space_contains_extremes() {
        let zone = Zone::full(2);
        assert!(zone.contains(&Coordinate::new(vec![0, Element::MAX])));
    }
}
