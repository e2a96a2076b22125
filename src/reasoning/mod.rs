//! The query decomposition / filtration collaborator.
//!
//! SPARQL parsing and reasoning live outside the core; the overlay only
//! needs two services from them: break a composite query into atomic,
//! independently routable sub-queries, and optionally filter the merged raw
//! results afterwards. [`ConjunctiveReasoner`] provides those services for
//! plain conjunctions of quadruple patterns.

use std::collections::{HashMap, HashSet};

use crate::core::{CompositeQuery, Quadruple, QuadruplePattern, RdfTerm};

/// The reasoning collaborator interface.
pub trait QueryReasoner: Send + Sync {
    /// Decompose a composite query into atomic sub-queries.
    fn decompose(&self, query: &CompositeQuery) -> Vec<QuadruplePattern>;

    /// Whether the merged raw results need a final filtration pass.
    fn requires_filtration(&self, query: &CompositeQuery) -> bool;

    /// Filter the merged raw results against the original query.
    fn filter(&self, query: &CompositeQuery, raw: Vec<Quadruple>) -> Vec<Quadruple>;
}

/// Reasoner for conjunctive pattern queries.
///
/// Filtration enforces join consistency: for every variable shared between
/// two conjuncts, a quadruple only survives when the value it binds for
/// that variable is also bound by some result of every other conjunct using
/// the variable.
#[derive(Debug, Default, Clone)]
pub struct ConjunctiveReasoner;

impl ConjunctiveReasoner {
    /// Create the reasoner.
    pub fn new() -> Self {
        ConjunctiveReasoner
    }
}

/// The value a quadruple binds for `variable` under `pattern`, if the
/// pattern both matches the quadruple and uses the variable.
fn binding<'a>(
    pattern: &QuadruplePattern,
    quad: &'a Quadruple,
    variable: &str,
) -> Option<&'a RdfTerm> {
    if !pattern.matches(quad) {
        return None;
    }
    pattern
        .terms()
        .into_iter()
        .zip(quad.terms())
        .find(|(p, _)| matches!(p, RdfTerm::Variable(v) if v == variable))
        .map(|(_, q)| q)
}

impl QueryReasoner for ConjunctiveReasoner {
    fn decompose(&self, query: &CompositeQuery) -> Vec<QuadruplePattern> {
        query.patterns.clone()
    }

    fn requires_filtration(&self, query: &CompositeQuery) -> bool {
        !query.shared_variables().is_empty()
    }

    fn filter(&self, query: &CompositeQuery, raw: Vec<Quadruple>) -> Vec<Quadruple> {
        let shared = query.shared_variables();
        if shared.is_empty() {
            return raw;
        }

        // Per shared variable, the values every conjunct using it agrees on.
        let mut allowed: HashMap<&str, HashSet<&RdfTerm>> = HashMap::new();
        for variable in &shared {
            let mut agreement: Option<HashSet<&RdfTerm>> = None;
            for pattern in &query.patterns {
                if !pattern.variables().contains(&variable.as_str()) {
                    continue;
                }
                let bound: HashSet<&RdfTerm> = raw
                    .iter()
                    .filter_map(|q| binding(pattern, q, variable))
                    .collect();
                agreement = Some(match agreement {
                    None => bound,
                    Some(prev) => prev.intersection(&bound).copied().collect(),
                });
            }
            allowed.insert(variable.as_str(), agreement.unwrap_or_default());
        }

        raw.iter()
            .filter(|quad| {
                query.patterns.iter().any(|pattern| {
                    if !pattern.matches(quad) {
                        return false;
                    }
                    shared.iter().all(|variable| {
                        match binding(pattern, quad, variable) {
                            Some(value) => allowed[variable.as_str()].contains(value),
                            // Conjunct does not use this variable.
                            None => true,
                        }
                    })
                })
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad(s: &str) -> Quadruple {
        Quadruple::parse(s).unwrap()
    }

    fn pattern(s: &str) -> QuadruplePattern {
        QuadruplePattern::parse(s).unwrap()
    }

    #[test]
    fn test_decompose_returns_conjuncts() {
        let query = CompositeQuery::new(vec![
            pattern("<g> ?s <knows> ?o"),
            pattern("<g> ?o <age> ?a"),
        ]);
        assert_eq!(ConjunctiveReasoner::new().decompose(&query).len(), 2);
    }

    #[test]
    fn test_no_shared_variables_no_filtration() {
        let query = CompositeQuery::new(vec![pattern("<g> ?s <knows> ?o")]);
        assert!(!ConjunctiveReasoner::new().requires_filtration(&query));
    }

    #[test]
    fn test_filter_enforces_join_consistency() {
        let query = CompositeQuery::new(vec![
            pattern("<g> ?s <knows> ?o"),
            pattern("<g> ?o <age> ?a"),
        ]);
        let reasoner = ConjunctiveReasoner::new();
        assert!(reasoner.requires_filtration(&query));

        let raw = vec![
            quad("<g> <alice> <knows> <bob>"),
            quad("<g> <alice> <knows> <carol>"),
            quad("<g> <bob> <age> \"42\""),
        ];
        let filtered = reasoner.filter(&query, raw);

        // <carol> never appears as a subject of <age>, so the second
        // <knows> result drops out; <bob> joins on both sides.
        assert!(filtered.contains(&quad("<g> <alice> <knows> <bob>")));
        assert!(filtered.contains(&quad("<g> <bob> <age> \"42\"")));
        assert!(!filtered.contains(&quad("<g> <alice> <knows> <carol>")));
    }
}
