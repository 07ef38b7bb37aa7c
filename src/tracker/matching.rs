//! Appearance distances and assignment for cross-camera association.

use ndarray::Array2;

use crate::tracker::local_track::Feature;

/// Distance reported for pairs that must never be associated.
pub const FORBIDDEN: f64 = f64::MAX;

/// Cosine similarity of two embeddings, `None` when either has zero norm
/// or their dimensions differ.
pub fn cosine_similarity(a: &Feature, b: &Feature) -> Option<f64> {
    if a.len() != b.len() {
        return None;
    }
    let norms = a.norm() as f64 * b.norm() as f64;
    if norms <= f64::EPSILON {
        return None;
    }
    Some(a.dot(b) as f64 / norms)
}

/// `1 - cosine_similarity`; a missing or degenerate embedding counts as unrelated (1.0).
pub fn cosine_distance(a: Option<&Feature>, b: Option<&Feature>) -> f64 {
    match (a, b) {
        (Some(a), Some(b)) => cosine_similarity(a, b).map_or(1.0, |s| 1.0 - s),
        _ => 1.0,
    }
}

/// Pairwise cosine distances between two sets of embeddings.
pub fn cosine_distance_matrix(rows: &[Option<&Feature>], cols: &[Option<&Feature>]) -> Array2<f64> {
    let mut dists = Array2::zeros((rows.len(), cols.len()));
    for (i, a) in rows.iter().enumerate() {
        for (j, b) in cols.iter().enumerate() {
            dists[[i, j]] = cosine_distance(*a, *b);
        }
    }
    dists
}

/// Arithmetic mean of the given embeddings, skipping ones whose dimension
/// differs from the first.
pub fn mean_feature<'a>(features: impl IntoIterator<Item = &'a Feature>) -> Option<Feature> {
    let mut iter = features.into_iter();
    let mut sum = iter.next()?.clone();
    let mut count = 1usize;
    for f in iter {
        if f.len() == sum.len() {
            sum += f;
            count += 1;
        }
    }
    Some(sum / count as f32)
}

/// Outcome of [`linear_assignment`]: accepted `(row, col)` pairs plus the
/// rows and columns left without a partner.
#[derive(Debug, Clone, Default)]
pub struct AssignmentResult {
    pub matches: Vec<(usize, usize)>,
    pub unmatched_rows: Vec<usize>,
    pub unmatched_cols: Vec<usize>,
}

/// Finite stand-in for impossible pairs; the solver rejects infinities.
const PAD_COST: f64 = 1e6;

/// Minimum-cost one-to-one assignment (Jonker-Volgenant over a square padded
/// matrix), keeping only pairs whose cost is at most `max_cost`.
pub fn linear_assignment(costs: &Array2<f64>, max_cost: f64) -> AssignmentResult {
    let (rows, cols) = costs.dim();
    if rows == 0 || cols == 0 {
        return AssignmentResult {
            matches: Vec::new(),
            unmatched_rows: (0..rows).collect(),
            unmatched_cols: (0..cols).collect(),
        };
    }

    let n = rows.max(cols);
    let square = Array2::from_shape_fn((n, n), |(r, c)| {
        if r < rows && c < cols { costs[[r, c]].min(PAD_COST) } else { PAD_COST }
    });

    let row_to_col = match lapjv::lapjv(&square) {
        Ok((row_to_col, _)) => row_to_col,
        Err(e) => {
            tracing::warn!(error = ?e, rows, cols, "assignment solver failed");
            return AssignmentResult {
                matches: Vec::new(),
                unmatched_rows: (0..rows).collect(),
                unmatched_cols: (0..cols).collect(),
            };
        }
    };

    let mut result = AssignmentResult::default();
    let mut col_taken = vec![false; cols];
    for (r, &c) in row_to_col.iter().enumerate().take(rows) {
        if c < cols && costs[[r, c]] <= max_cost {
            result.matches.push((r, c));
            col_taken[c] = true;
        } else {
            result.unmatched_rows.push(r);
        }
    }
    result.unmatched_cols = (0..cols).filter(|&c| !col_taken[c]).collect();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f(v: &[f32]) -> Feature {
        Feature::from_row_slice(v)
    }

    #[test]
    fn test_cosine_distance() {
        let a = f(&[1.0, 0.0]);
        let b = f(&[0.0, 1.0]);
        let c = f(&[2.0, 0.0]);

        assert!(cosine_distance(Some(&a), Some(&c)).abs() < 1e-9);
        assert!((cosine_distance(Some(&a), Some(&b)) - 1.0).abs() < 1e-9);
        assert_eq!(cosine_distance(Some(&a), None), 1.0);
        assert_eq!(cosine_distance(Some(&f(&[0.0, 0.0])), Some(&a)), 1.0);
    }

    #[test]
    fn test_mean_feature() {
        let feats = [f(&[1.0, 0.0]), f(&[0.0, 1.0]), f(&[1.0, 2.0, 3.0])];
        let mean = mean_feature(feats.iter()).unwrap();
        assert_eq!(mean, f(&[0.5, 0.5]));
        assert!(mean_feature(std::iter::empty()).is_none());
    }

    #[test]
    fn test_linear_assignment_respects_threshold() {
        let costs = ndarray::arr2(&[[0.1, 0.9], [0.8, 0.7]]);
        let res = linear_assignment(&costs, 0.5);
        assert_eq!(res.matches, vec![(0, 0)]);
        assert_eq!(res.unmatched_rows, vec![1]);
        assert_eq!(res.unmatched_cols, vec![1]);
    }

    #[test]
    fn test_forbidden_pairs_never_match() {
        let costs = ndarray::arr2(&[[FORBIDDEN, 0.2], [0.1, FORBIDDEN]]);
        let res = linear_assignment(&costs, 0.5);
        assert_eq!(res.matches, vec![(0, 1), (1, 0)]);

        let blocked = linear_assignment(&ndarray::arr2(&[[FORBIDDEN]]), 0.5);
        assert!(blocked.matches.is_empty());
        assert_eq!(blocked.unmatched_rows, vec![0]);
    }

    #[test]
    fn test_linear_assignment_rectangular() {
        let costs = ndarray::arr2(&[[0.4, 0.1, 0.3]]);
        let res = linear_assignment(&costs, 0.5);
        assert_eq!(res.matches, vec![(0, 1)]);
        assert_eq!(res.unmatched_cols, vec![0, 2]);
    }
}
