// 📏 Similarity Scorer - normalized edit-distance similarity
//
// score(a, b)            -> [0, 1]   per attribute value
// combined_score(a, b)   -> [0, 100] mean over the configured attributes
//
// A missing attribute on either side contributes 0, so sparse records
// cannot raise their average by omitting values.

use crate::entities::Record;

/// Normalized Levenshtein similarity
///
/// `1 - distance / max(len_a, len_b)`, measured in chars.
///
/// Example:
/// - score("jdoe", "jdoe") = 1.0
/// - score("jdoe", "jdoe2") = 0.8
/// - score("abc", "xyz") = 0.0
pub fn score(a: &str, b: &str) -> f64 {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let longest = a_chars.len().max(b_chars.len());

    if longest == 0 {
        return 1.0;
    }

    let distance = levenshtein_distance(&a_chars, &b_chars);
    1.0 - distance as f64 / longest as f64
}

/// Mean of `score() * 100` over `attribute_names`
///
/// Returns 0 for an empty attribute list.
pub fn combined_score(a: &Record, b: &Record, attribute_names: &[String]) -> f64 {
    if attribute_names.is_empty() {
        return 0.0;
    }

    let total: f64 = attribute_names
        .iter()
        .map(|name| match (a.attribute_text(name), b.attribute_text(name)) {
            (Some(left), Some(right)) => score(&left, &right) * 100.0,
            _ => 0.0,
        })
        .sum();

    total / attribute_names.len() as f64
}

/// Minimum number of single-char insertions, deletions and substitutions
fn levenshtein_distance(a: &[char], b: &[char]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    // Two rolling rows instead of the full matrix
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            current[j + 1] = (previous[j + 1] + 1) // deletion
                .min(current[j] + 1) // insertion
                .min(previous[j] + cost); // substitution
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[b.len()]
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_identical_strings() {
        assert_eq!(score("jdoe", "jdoe"), 1.0);
        assert_eq!(score("", ""), 1.0);
    }

    #[test]
    fn test_maximally_dissimilar() {
        assert_eq!(score("abc", "xyz"), 0.0);
        assert_eq!(score("", "abc"), 0.0);
    }

    #[test]
    fn test_partial_similarity() {
        assert!(approx(score("jdoe", "jdoe2"), 0.8));
        assert!(approx(score("kitten", "sitting"), 1.0 - 3.0 / 7.0));
    }

    #[test]
    fn test_counts_chars_not_bytes() {
        // one substitution over four chars, even though 'é' is two bytes
        assert!(approx(score("josé", "jose"), 0.75));
    }

    #[test]
    fn test_score_is_commutative() {
        let pairs = [("jdoe", "john.doe"), ("smith", "smyth"), ("", "x"), ("ab", "ba")];
        for (a, b) in pairs {
            assert_eq!(score(a, b), score(b, a), "{a} vs {b}");
        }
    }

    #[test]
    fn test_identical_records_score_100() {
        let a = Record::new("a")
            .with_attribute("uid", "jdoe")
            .with_attribute("email", "jdoe@example.com");
        let b = Record::new("b")
            .with_attribute("uid", "jdoe")
            .with_attribute("email", "jdoe@example.com");

        assert_eq!(combined_score(&a, &b, &attrs(&["uid", "email"])), 100.0);
    }

    #[test]
    fn test_missing_attribute_contributes_zero() {
        let full = Record::new("a")
            .with_attribute("uid", "jdoe")
            .with_attribute("email", "jdoe@example.com");
        let sparse = Record::new("b").with_attribute("uid", "jdoe");

        // uid = 100, email missing = 0 -> mean 50 (not 100)
        assert_eq!(combined_score(&full, &sparse, &attrs(&["uid", "email"])), 50.0);
        // missing on both sides is still 0
        assert_eq!(combined_score(&sparse, &sparse, &attrs(&["email"])), 0.0);
    }

    #[test]
    fn test_combined_score_commutative_and_bounded() {
        let names = attrs(&["uid", "email", "phone"]);
        let a = Record::new("a")
            .with_attribute("uid", "jdoe")
            .with_attribute("email", "john@example.com");
        let b = Record::new("b")
            .with_attribute("uid", "john.doe")
            .with_attribute("email", "jdoe@example.org")
            .with_attribute("phone", "555-0100");

        let ab = combined_score(&a, &b, &names);
        let ba = combined_score(&b, &a, &names);
        assert_eq!(ab, ba);
        assert!((0.0..=100.0).contains(&ab));
    }

    #[test]
    fn test_empty_attribute_list_scores_zero() {
        let a = Record::new("a").with_attribute("uid", "jdoe");
        assert_eq!(combined_score(&a, &a, &[]), 0.0);
    }
}
