//! Points of the indexing space.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One scalar of the coordinate space.
///
/// Opaque comparable values; RDF terms are packed into them by
/// [`crate::core::term_to_element`] so that the byte-prefix order of terms
/// is preserved.
pub type Element = u64;

/// An immutable point in the D-dimensional indexing space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coordinate {
    elements: Vec<Element>,
}

impl Coordinate {
    /// Create a coordinate from its per-dimension elements.
    pub fn new(elements: Vec<Element>) -> Self {
        Coordinate { elements }
    }

    /// Number of dimensions.
    pub fn dimensions(&self) -> usize {
        self.elements.len()
    }

    /// The element on dimension `dim`.
    ///
    /// Panics if `dim` is out of range; dimension indices always come from
    /// iterating a zone of the same arity.
    pub fn element(&self, dim: usize) -> Element {
        self.elements[dim]
    }

    /// All elements in dimension order.
    pub fn elements(&self) -> &[Element] {
        &self.elements
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, element) in self.elements.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", element)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let coordinate = Coordinate::new(vec![70, 30]);
        assert_eq!(format!("{}", coordinate), "(70, 30)");
    }
}
