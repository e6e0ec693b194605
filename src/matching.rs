// 🔍 Match Classifier - relate one unresolved record to the resolved population
// Two strategies, applied in priority order: Exact Match, then Fuzzy Match

use serde::{Deserialize, Serialize};

use crate::config::ReconcileConfig;
use crate::entities::Record;
use crate::similarity::combined_score;

// ============================================================================
// MATCH STRATEGY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchStrategy {
    /// Exact match: identical projection of the configured attributes
    ExactMatch,

    /// Fuzzy match: combined similarity score at or above the threshold
    FuzzyMatch,
}

// ============================================================================
// MATCH RESULTS
// ============================================================================

/// A resolved record that may be a duplicate of the subject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub record: Record,

    /// Combined score (0 - 100)
    pub score: f64,
}

/// Outcome for one subject, in priority order
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// Exactly one candidate shares the subject's projection
    Identical(Record),

    /// One or more candidates reached the threshold; a human decides
    Similar(Vec<MatchCandidate>),

    /// Nothing close enough
    NoMatch,
}

impl Classification {
    pub fn strategy(&self) -> Option<MatchStrategy> {
        match self {
            Classification::Identical(_) => Some(MatchStrategy::ExactMatch),
            Classification::Similar(_) => Some(MatchStrategy::FuzzyMatch),
            Classification::NoMatch => None,
        }
    }
}

// ============================================================================
// MATCHING FUNCTIONS
// ============================================================================

/// The single candidate whose projection equals the subject's
///
/// Returns None when zero or several candidates share the projection.
/// Several identical candidates are ambiguous and are never guessed at.
/// A subject carrying none of the attributes has nothing to compare and
/// never matches exactly.
pub fn find_exact_match<'a>(
    subject: &Record,
    candidates: &'a [Record],
    attribute_names: &[String],
) -> Option<&'a Record> {
    let wanted = subject.projection(attribute_names);
    if wanted.is_empty() {
        return None;
    }

    let mut identical = candidates
        .iter()
        .filter(|candidate| candidate.projection(attribute_names) == wanted);

    match (identical.next(), identical.next()) {
        (Some(only), None) => Some(only),
        _ => None,
    }
}

/// Every candidate scoring at least `threshold`, in input order
pub fn find_similar_matches(
    subject: &Record,
    candidates: &[Record],
    attribute_names: &[String],
    threshold: f64,
) -> Vec<MatchCandidate> {
    candidates
        .iter()
        .filter_map(|candidate| {
            let score = combined_score(subject, candidate, attribute_names);
            (score >= threshold).then(|| MatchCandidate {
                record: candidate.clone(),
                score,
            })
        })
        .collect()
}

// ============================================================================
// MATCH CLASSIFIER
// ============================================================================

#[derive(Debug, Clone)]
pub struct MatchClassifier {
    /// Attributes compared for both strategies
    pub attributes: Vec<String>,

    /// Minimum combined score for the fuzzy strategy (default: 70)
    pub threshold: f64,
}

impl MatchClassifier {
    pub fn new(attributes: Vec<String>, threshold: f64) -> Self {
        MatchClassifier { attributes, threshold }
    }

    pub fn from_config(config: &ReconcileConfig) -> Self {
        Self::new(config.attributes.clone(), config.threshold)
    }

    pub fn find_exact_match<'a>(&self, subject: &Record, candidates: &'a [Record]) -> Option<&'a Record> {
        find_exact_match(subject, candidates, &self.attributes)
    }

    pub fn find_similar_matches(&self, subject: &Record, candidates: &[Record]) -> Vec<MatchCandidate> {
        find_similar_matches(subject, candidates, &self.attributes, self.threshold)
    }

    /// Identical → Similar → NoMatch
    ///
    /// Tied identical candidates fall through to Similar on purpose: each
    /// scores 100, so the review case offers all of them.
    pub fn classify(&self, subject: &Record, candidates: &[Record]) -> Classification {
        if let Some(exact) = self.find_exact_match(subject, candidates) {
            return Classification::Identical(exact.clone());
        }

        let similar = self.find_similar_matches(subject, candidates);
        if similar.is_empty() {
            Classification::NoMatch
        } else {
            Classification::Similar(similar)
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_record(key: &str, uid: &str) -> Record {
        Record::new(key).with_attribute("uid", uid).resolved(true)
    }

    fn uid_only() -> Vec<String> {
        vec!["uid".to_string()]
    }

    #[test]
    fn test_exact_match_unique() {
        let subject = Record::new("new").with_attribute("uid", "jdoe");
        let candidates = vec![create_test_record("c1", "jdoe"), create_test_record("c2", "jdoe2")];

        let found = find_exact_match(&subject, &candidates, &uid_only());
        assert_eq!(found.map(|r| r.key.as_str()), Some("c1"));
    }

    #[test]
    fn test_exact_match_first_candidate_is_eligible() {
        let subject = Record::new("new").with_attribute("uid", "jdoe");
        let candidates = vec![create_test_record("c1", "jdoe")];

        assert!(find_exact_match(&subject, &candidates, &uid_only()).is_some());
    }

    #[test]
    fn test_exact_match_tie_returns_none() {
        // Intentional: two identical projections are ambiguous, even if only
        // one of them is the "real" duplicate. A human decides instead.
        let subject = Record::new("new").with_attribute("uid", "jdoe");
        let candidates = vec![
            create_test_record("c1", "jdoe"),
            create_test_record("c2", "jdoe"),
            create_test_record("c3", "other"),
        ];

        assert!(find_exact_match(&subject, &candidates, &uid_only()).is_none());
    }

    #[test]
    fn test_exact_match_none_when_no_candidate_equal() {
        let subject = Record::new("new").with_attribute("uid", "jdoe");
        let candidates = vec![create_test_record("c1", "jdoe2")];

        assert!(find_exact_match(&subject, &candidates, &uid_only()).is_none());
    }

    #[test]
    fn test_exact_match_ignores_attributes_outside_projection() {
        let subject = Record::new("new")
            .with_attribute("uid", "jdoe")
            .with_attribute("department", "Sales");
        let candidates = vec![create_test_record("c1", "jdoe").with_attribute("department", "IT")];

        assert!(find_exact_match(&subject, &candidates, &uid_only()).is_some());
    }

    #[test]
    fn test_exact_match_requires_subject_attributes() {
        let subject = Record::new("new");
        let candidates = vec![Record::new("c1").resolved(true)];

        assert!(find_exact_match(&subject, &candidates, &uid_only()).is_none());
    }

    #[test]
    fn test_similar_matches_respect_threshold() {
        let subject = Record::new("new").with_attribute("uid", "jdoe");
        let candidates = vec![
            create_test_record("c1", "jdoe2"), // 80
            create_test_record("c2", "xxxxx"), // 0
            create_test_record("c3", "jdoe"),  // 100
        ];

        let matches = find_similar_matches(&subject, &candidates, &uid_only(), 75.0);
        let keys: Vec<&str> = matches.iter().map(|m| m.record.key.as_str()).collect();
        assert_eq!(keys, vec!["c1", "c3"]); // input order, not score order
        assert!(matches.iter().all(|m| m.score >= 75.0));
    }

    #[test]
    fn test_similar_threshold_bounds() {
        let subject = Record::new("new").with_attribute("uid", "jdoe");
        let candidates = vec![
            create_test_record("c1", "jdoe"),
            create_test_record("c2", "zzzz"),
            Record::new("c3").resolved(true),
        ];

        assert_eq!(find_similar_matches(&subject, &candidates, &uid_only(), 0.0).len(), 3);
        assert!(find_similar_matches(&subject, &candidates, &uid_only(), 101.0).is_empty());
    }

    #[test]
    fn test_classify_priority() {
        let classifier = MatchClassifier::new(uid_only(), 70.0);
        let subject = Record::new("new").with_attribute("uid", "jdoe");

        let identical = vec![create_test_record("c1", "jdoe"), create_test_record("c2", "jdoe2")];
        let outcome = classifier.classify(&subject, &identical);
        assert_eq!(outcome.strategy(), Some(MatchStrategy::ExactMatch));

        let similar = vec![create_test_record("c2", "jdoe2")];
        match classifier.classify(&subject, &similar) {
            Classification::Similar(found) => assert_eq!(found.len(), 1),
            other => panic!("expected similar, got {other:?}"),
        }

        let unrelated = vec![create_test_record("c3", "mwilson")];
        assert_eq!(classifier.classify(&subject, &unrelated), Classification::NoMatch);
    }

    #[test]
    fn test_classify_tie_falls_to_review() {
        // A tie never auto-correlates; both tied candidates go to review.
        let classifier = MatchClassifier::new(uid_only(), 70.0);
        let subject = Record::new("new").with_attribute("uid", "jdoe");
        let candidates = vec![create_test_record("c1", "jdoe"), create_test_record("c2", "jdoe")];

        match classifier.classify(&subject, &candidates) {
            Classification::Similar(found) => assert_eq!(found.len(), 2),
            other => panic!("expected similar, got {other:?}"),
        }
    }
}
