use std::collections::HashSet;

use crate::storage::types::Triple;

/// Canonical phrase form: lowercase, any character outside `[A-Za-z0-9 ]`
/// replaced by a space, leading/trailing whitespace trimmed. Two raw
/// spellings collapse to the same phrase node iff their processed forms are
/// byte-equal, so this must stay byte-stable.
pub fn text_processing(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == ' ' { c } else { ' ' })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Keeps only extractor rows of length exactly 3 and drops exact duplicates,
/// preserving first-seen order.
pub fn filter_invalid_triples(raw: &[Vec<String>]) -> Vec<Triple> {
    let mut seen: HashSet<[String; 3]> = HashSet::new();
    let mut kept = Vec::new();
    for row in raw {
        let [s, r, o] = match row.as_slice() {
            [s, r, o] => [s.clone(), r.clone(), o.clone()],
            _ => continue,
        };
        if seen.insert([s.clone(), r.clone(), o.clone()]) {
            kept.push(Triple::new(s, r, o));
        }
    }
    kept
}

/// Token set used for fuzzy triple matching: join with spaces, lowercase,
/// strip non-alphanumeric characters, split on whitespace.
pub fn token_set(parts: &[String]) -> HashSet<String> {
    parts
        .join(" ")
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .map(ToOwned::to_owned)
        .collect()
}

pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Count of alphanumeric characters once everything else is stripped. Used to
/// skip near-empty phrases when linking synonyms.
pub fn alnum_len(input: &str) -> usize {
    input.chars().filter(|c| c.is_ascii_alphanumeric()).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_processing_lowercases_and_strips_punctuation() {
        assert_eq!(text_processing("Baratâria"), "barat ria");
        assert_eq!(text_processing("  U.S.A. "), "u s a");
        assert_eq!(text_processing("France"), "france");
    }

    #[test]
    fn filter_keeps_only_well_formed_triples() {
        let raw = vec![
            vec!["a".into(), "rel".into(), "b".into()],
            vec!["too".into(), "short".into()],
            vec!["a".into(), "rel".into(), "b".into()],
            vec!["x".into(), "y".into(), "z".into(), "w".into()],
            vec!["c".into(), "rel".into(), "d".into()],
        ];
        let kept = filter_invalid_triples(&raw);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].subject(), "a");
        assert_eq!(kept[1].object(), "d");
    }

    #[test]
    fn jaccard_on_normalized_tokens() {
        let a = token_set(&["A".into(), "relates".into(), "B".into()]);
        let b = token_set(&["a".into(), "relates".into(), "b".into()]);
        assert!((jaccard(&a, &b) - 1.0).abs() < 1e-9);

        let c = token_set(&["entirely".into(), "different".into(), "thing".into()]);
        assert!(jaccard(&a, &c) < 0.2);
    }

    #[test]
    fn alnum_len_ignores_spaces_and_punctuation() {
        assert_eq!(alnum_len("a b"), 2);
        assert_eq!(alnum_len("..."), 0);
        assert_eq!(alnum_len("us"), 2);
        assert_eq!(alnum_len("usa"), 3);
    }
}
