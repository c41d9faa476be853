use std::cmp::Ordering;

use tracing::error;

/// Min–max normalization into [0, 1]. Constant input maps to all ones; empty
/// input stays empty; non-finite entries normalize to zero.
pub fn min_max_normalize(scores: &[f64]) -> Vec<f64> {
    if scores.is_empty() {
        return Vec::new();
    }

    let mut min = f64::MAX;
    let mut max = f64::MIN;
    for score in scores {
        if !score.is_finite() {
            continue;
        }
        if *score < min {
            min = *score;
        }
        if *score > max {
            max = *score;
        }
    }

    if min > max {
        // Nothing finite to normalize against.
        return vec![0.0; scores.len()];
    }

    if (max - min).abs() < f64::EPSILON {
        return vec![1.0; scores.len()];
    }

    scores
        .iter()
        .map(|score| {
            if score.is_finite() {
                ((score - min) / (max - min)).clamp(0.0, 1.0)
            } else {
                0.0
            }
        })
        .collect()
}

/// Dot products of every matrix row against the query. A dimension mismatch
/// indicates mixed embedding configurations and yields an empty result.
pub fn dot_scores(matrix: &[Vec<f64>], query: &[f64]) -> Vec<f64> {
    if matrix.is_empty() {
        return Vec::new();
    }
    if matrix.iter().any(|row| row.len() != query.len()) {
        error!(
            rows = matrix.len(),
            query_dim = query.len(),
            "embedding dimension mismatch while scoring"
        );
        return Vec::new();
    }
    matrix
        .iter()
        .map(|row| row.iter().zip(query).map(|(a, b)| a * b).sum())
        .collect()
}

/// Indices of `scores` in descending score order, ties broken by index so
/// the ordering is total and reproducible.
pub fn argsort_desc(scores: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|a, b| {
        scores[*b]
            .partial_cmp(&scores[*a])
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.cmp(b))
    });
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_max_spans_zero_to_one_for_nonconstant_input() {
        let normalized = min_max_normalize(&[2.0, 4.0, 3.0]);
        assert!((normalized[0] - 0.0).abs() < 1e-12);
        assert!((normalized[1] - 1.0).abs() < 1e-12);
        assert!((normalized[2] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn min_max_of_constant_input_is_all_ones() {
        assert_eq!(min_max_normalize(&[0.7, 0.7, 0.7]), vec![1.0, 1.0, 1.0]);
        assert_eq!(min_max_normalize(&[0.0]), vec![1.0]);
    }

    #[test]
    fn min_max_of_empty_input_is_empty() {
        assert!(min_max_normalize(&[]).is_empty());
    }

    #[test]
    fn non_finite_entries_normalize_to_zero() {
        let normalized = min_max_normalize(&[1.0, f64::NAN, 3.0]);
        assert!((normalized[1] - 0.0).abs() < 1e-12);
        assert!((normalized[2] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn dot_scores_rejects_dimension_mismatch() {
        let matrix = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        assert!(dot_scores(&matrix, &[1.0, 0.0, 0.0]).is_empty());

        let scores = dot_scores(&matrix, &[0.5, 0.5]);
        assert_eq!(scores.len(), 2);
        assert!((scores[0] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn argsort_is_descending_with_stable_ties() {
        assert_eq!(argsort_desc(&[0.1, 0.9, 0.5]), vec![1, 2, 0]);
        assert_eq!(argsort_desc(&[0.5, 0.5, 0.1]), vec![0, 1, 2]);
    }
}
