//! Core RDF data model for the overlay.
//!
//! A [`Quadruple`] is the atomic unit of published data; a
//! [`QuadruplePattern`] is the same four positions with variables acting as
//! wildcards. Both map deterministically onto the coordinate space: fixed
//! terms become single points on their axis, variables become the full
//! axis. The mapping is stateless (no shared dictionary exists between
//! peers) and preserves the byte-prefix order of terms so range locality
//! survives the encoding.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::geometry::{Coordinate, Element, Interval, Region};

/// An RDF term as used by the indexing layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RdfTerm {
    /// An IRI, e.g. `<http://example.org/alice>`.
    Iri(String),
    /// A literal, e.g. `"42"`.
    Literal(String),
    /// A pattern variable, e.g. `?s`. Never present in a stored quadruple.
    Variable(String),
}

fn term_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"^(?:<(?P<iri>[^>]+)>|"(?P<lit>[^"]*)"|\?(?P<var>\w+))$"#)
        .expect("term regex is valid"))
}

impl RdfTerm {
    /// Parse a single term token: `<iri>`, `"literal"` or `?variable`.
    /// A bare token is accepted as an IRI, matching how relaxed N-Quads
    /// readers treat prefixed names.
    pub fn parse(token: &str) -> Option<RdfTerm> {
        let token = token.trim();
        if token.is_empty() {
            return None;
        }
        if let Some(caps) = term_regex().captures(token) {
            if let Some(iri) = caps.name("iri") {
                return Some(RdfTerm::Iri(iri.as_str().to_string()));
            }
            if let Some(lit) = caps.name("lit") {
                return Some(RdfTerm::Literal(lit.as_str().to_string()));
            }
            if let Some(var) = caps.name("var") {
                return Some(RdfTerm::Variable(var.as_str().to_string()));
            }
        }
        Some(RdfTerm::Iri(token.to_string()))
    }

    /// Whether this term is a pattern variable.
    pub fn is_variable(&self) -> bool {
        matches!(self, RdfTerm::Variable(_))
    }

    /// The canonical string the coordinate mapping operates on.
    pub fn lexical_value(&self) -> &str {
        match self {
            RdfTerm::Iri(v) | RdfTerm::Literal(v) | RdfTerm::Variable(v) => v,
        }
    }

    /// Whether a concrete term satisfies this (possibly variable) term.
    pub fn matches(&self, concrete: &RdfTerm) -> bool {
        self.is_variable() || self == concrete
    }
}

impl fmt::Display for RdfTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RdfTerm::Iri(v) => write!(f, "<{}>", v),
            RdfTerm::Literal(v) => write!(f, "\"{}\"", v),
            RdfTerm::Variable(v) => write!(f, "?{}", v),
        }
    }
}

/// Map a term to its scalar on the coordinate axis.
///
/// Big-endian packing of the first 8 bytes of the canonical form: shorter
/// strings are zero-padded, so `element(a) <= element(b)` whenever `a` is a
/// byte-prefix-wise predecessor of `b`.
pub fn term_to_element(term: &RdfTerm) -> Element {
    let bytes = term.lexical_value().as_bytes();
    let mut packed = [0u8; 8];
    let n = bytes.len().min(8);
    packed[..n].copy_from_slice(&bytes[..n]);
    u64::from_be_bytes(packed)
}

/// An RDF quadruple: (graph, subject, predicate, object), all concrete.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Quadruple {
    pub graph: RdfTerm,
    pub subject: RdfTerm,
    pub predicate: RdfTerm,
    pub object: RdfTerm,
}

impl Quadruple {
    /// Build a quadruple; returns `None` when any position is a variable.
    pub fn new(graph: RdfTerm, subject: RdfTerm, predicate: RdfTerm, object: RdfTerm) -> Option<Self> {
        if graph.is_variable()
            || subject.is_variable()
            || predicate.is_variable()
            || object.is_variable()
        {
            return None;
        }
        Some(Quadruple { graph, subject, predicate, object })
    }

    /// Parse a whitespace-separated 4-token line: graph subject predicate
    /// object.
    pub fn parse(line: &str) -> Option<Self> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() != 4 {
            return None;
        }
        Quadruple::new(
            RdfTerm::parse(tokens[0])?,
            RdfTerm::parse(tokens[1])?,
            RdfTerm::parse(tokens[2])?,
            RdfTerm::parse(tokens[3])?,
        )
    }

    /// The four terms in axis order.
    pub fn terms(&self) -> [&RdfTerm; 4] {
        [&self.graph, &self.subject, &self.predicate, &self.object]
    }

    /// The point this quadruple is indexed at.
    pub fn to_coordinate(&self) -> Coordinate {
        Coordinate::new(self.terms().iter().map(|t| term_to_element(t)).collect())
    }
}

impl fmt::Display for Quadruple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} {}", self.graph, self.subject, self.predicate, self.object)
    }
}

/// A quadruple pattern: any position may be a variable wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuadruplePattern {
    pub graph: RdfTerm,
    pub subject: RdfTerm,
    pub predicate: RdfTerm,
    pub object: RdfTerm,
}

impl QuadruplePattern {
    /// Build a pattern from its four positions.
    pub fn new(graph: RdfTerm, subject: RdfTerm, predicate: RdfTerm, object: RdfTerm) -> Self {
        QuadruplePattern { graph, subject, predicate, object }
    }

    /// Parse a whitespace-separated 4-token pattern line.
    pub fn parse(line: &str) -> Option<Self> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() != 4 {
            return None;
        }
        Some(QuadruplePattern::new(
            RdfTerm::parse(tokens[0])?,
            RdfTerm::parse(tokens[1])?,
            RdfTerm::parse(tokens[2])?,
            RdfTerm::parse(tokens[3])?,
        ))
    }

    /// The four positions in axis order.
    pub fn terms(&self) -> [&RdfTerm; 4] {
        [&self.graph, &self.subject, &self.predicate, &self.object]
    }

    /// Whether the quadruple satisfies this pattern.
    pub fn matches(&self, quad: &Quadruple) -> bool {
        self.graph.matches(&quad.graph)
            && self.subject.matches(&quad.subject)
            && self.predicate.matches(&quad.predicate)
            && self.object.matches(&quad.object)
    }

    /// The set of variable names used by the pattern.
    pub fn variables(&self) -> Vec<&str> {
        self.terms()
            .into_iter()
            .filter(|t| t.is_variable())
            .map(RdfTerm::lexical_value)
            .collect()
    }

    /// The axis-aligned region this pattern routes to: fixed positions give
    /// single-point intervals, variables give the full axis.
    pub fn to_region(&self) -> Region {
        let intervals = self
            .terms()
            .into_iter()
            .map(|t| {
                if t.is_variable() {
                    Interval::full()
                } else {
                    Interval::point(term_to_element(t))
                }
            })
            .collect();
        Region::new(intervals)
    }
}

impl fmt::Display for QuadruplePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} {}", self.graph, self.subject, self.predicate, self.object)
    }
}

impl From<Quadruple> for QuadruplePattern {
    fn from(quad: Quadruple) -> Self {
        QuadruplePattern::new(quad.graph, quad.subject, quad.predicate, quad.object)
    }
}

/// A composite query: the conjunction of several atomic patterns, as handed
/// to the overlay by the reasoning collaborator's caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeQuery {
    /// The atomic conjuncts, each independently routable.
    pub patterns: Vec<QuadruplePattern>,
}

impl CompositeQuery {
    /// Build a composite query from its conjuncts.
    pub fn new(patterns: Vec<QuadruplePattern>) -> Self {
        CompositeQuery { patterns }
    }

    /// Variables shared between at least two conjuncts; results must agree
    /// on these, which is what the filtration pass enforces.
    pub fn shared_variables(&self) -> Vec<String> {
        let mut seen: Vec<&str> = Vec::new();
        let mut shared: Vec<String> = Vec::new();
        for pattern in &self.patterns {
            for var in pattern.variables() {
                if seen.contains(&var) {
                    if !shared.iter().any(|s| s == var) {
                        shared.push(var.to_string());
                    }
                } else {
                    seen.push(var);
                }
            }
        }
        shared
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_term_kinds() {
        assert_eq!(
            RdfTerm::parse("<http://example.org/a>"),
            Some(RdfTerm::Iri("http://example.org/a".to_string()))
        );
        assert_eq!(RdfTerm::parse("\"42\""), Some(RdfTerm::Literal("42".to_string())));
        assert_eq!(RdfTerm::parse("?s"), Some(RdfTerm::Variable("s".to_string())));
        assert_eq!(RdfTerm::parse("ex:a"), Some(RdfTerm::Iri("ex:a".to_string())));
        assert_eq!(RdfTerm::parse("  "), None);
    }

    #[test]
    fn test_term_to_element_preserves_prefix_order() {
        let a = RdfTerm::Iri("aaa".to_string());
        let b = RdfTerm::Iri("aab".to_string());
        assert!(term_to_element(&a) < term_to_element(&b));
    }

    #[test]
    fn test_quadruple_refuses_variables() {
        assert!(Quadruple::new(
            RdfTerm::Iri("g".into()),
            RdfTerm::Variable("s".into()),
            RdfTerm::Iri("p".into()),
            RdfTerm::Iri("o".into()),
        )
        .is_none());
    }

    #[test]
    fn test_pattern_matching() {
        let quad = Quadruple::parse("<g> <s> <p> \"o\"").unwrap();
        let pattern = QuadruplePattern::parse("<g> ?x <p> ?y").unwrap();
        assert!(pattern.matches(&quad));

        let other = QuadruplePattern::parse("<g> ?x <q> ?y").unwrap();
        assert!(!other.matches(&quad));
    }

    #[test]
    fn test_pattern_region_covers_quad_coordinate() {
        let quad = Quadruple::parse("<g> <s> <p> \"o\"").unwrap();
        let pattern = QuadruplePattern::parse("<g> ?x <p> ?y").unwrap();
        let region = pattern.to_region();
        assert!(region.contains(&quad.to_coordinate()));
    }

    #[test]
    fn test_shared_variables() {
        let query = CompositeQuery::new(vec![
            QuadruplePattern::parse("<g> ?s <p> ?o").unwrap(),
            QuadruplePattern::parse("<g> ?o <q> ?z").unwrap(),
        ]);
        assert_eq!(query.shared_variables(), vec!["o".to_string()]);
    }
}
