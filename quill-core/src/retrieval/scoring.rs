//! Per-component scoring functions for hybrid ranking.
//!
//!   combined = α · embedding_norm + (1 − α) · keyword_norm
//!   recency  = exp(−λ · (anchor − position))   for position ≤ anchor, else 0
//!   final    = combined · (1 + w · recency)
//!
//! All functions are pure; the same inputs always give the same score.

/// Min-max normalize `scores` into `[0, 1]`.
///
/// `None` entries (no score available) normalize to 0 and do not take part
/// in the range. When every present score is equal, positive scores map to
/// 1 and the rest to 0.
#[must_use]
pub fn min_max_normalize(scores: &[Option<f64>]) -> Vec<f64> {
    let present = scores.iter().flatten().copied();
    let (min, max) = present.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), s| {
        (lo.min(s), hi.max(s))
    });

    if min > max {
        return vec![0.0; scores.len()];
    }

    let range = max - min;
    scores
        .iter()
        .map(|s| match *s {
            None => 0.0,
            Some(s) if range <= f64::EPSILON => {
                if s > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Some(s) => ((s - min) / range).clamp(0.0, 1.0),
        })
        .collect()
}

/// Recency of a chunk at `position` relative to the writer's `anchor`.
///
/// Chunks after the anchor, and every chunk when there is no anchor, get 0.
#[must_use]
pub fn recency_score(anchor: Option<u64>, position: u64, decay_rate: f64) -> f64 {
    match anchor {
        Some(anchor) if position <= anchor => {
            #[allow(clippy::cast_precision_loss)]
            let distance = (anchor - position) as f64;
            (-decay_rate.max(0.0) * distance).exp()
        }
        _ => 0.0,
    }
}

/// Blend normalized component scores.
#[must_use]
pub fn blend(alpha: f64, embedding_norm: f64, keyword_norm: f64) -> f64 {
    let alpha = alpha.clamp(0.0, 1.0);
    alpha * embedding_norm + (1.0 - alpha) * keyword_norm
}

/// Apply the recency boost. `recency_weight` must already be clamped.
#[must_use]
pub fn final_score(combined: f64, recency_weight: f64, recency: f64) -> f64 {
    combined * (1.0 + recency_weight * recency)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_spans_unit_interval() {
        let norm = min_max_normalize(&[Some(2.0), Some(4.0), Some(3.0)]);
        assert_eq!(norm, vec![0.0, 1.0, 0.5]);
    }

    #[test]
    fn absent_scores_normalize_to_zero() {
        let norm = min_max_normalize(&[Some(-0.5), None, Some(0.5)]);
        assert_eq!(norm, vec![0.0, 0.0, 1.0]);
    }

    #[test]
    fn degenerate_range_keeps_positive_scores() {
        assert_eq!(min_max_normalize(&[Some(0.7)]), vec![1.0]);
        assert_eq!(min_max_normalize(&[Some(0.3), Some(0.3)]), vec![1.0, 1.0]);
        assert_eq!(min_max_normalize(&[Some(0.0), None]), vec![0.0, 0.0]);
        assert_eq!(min_max_normalize(&[None, None]), vec![0.0, 0.0]);
        assert!(min_max_normalize(&[]).is_empty());
    }

    #[test]
    fn recency_decays_with_distance() {
        let near = recency_score(Some(100), 95, 0.1);
        let far = recency_score(Some(100), 10, 0.1);
        assert!(near > far);
        assert!((recency_score(Some(100), 100, 0.1) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn no_recency_after_anchor_or_without_anchor() {
        assert_eq!(recency_score(Some(10), 11, 0.1), 0.0);
        assert_eq!(recency_score(None, 5, 0.1), 0.0);
    }

    #[test]
    fn zero_decay_means_flat_recency() {
        assert!((recency_score(Some(1000), 0, 0.0) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn blend_boundaries() {
        assert!((blend(0.0, 0.9, 0.2) - 0.2).abs() < f64::EPSILON);
        assert!((blend(1.0, 0.9, 0.2) - 0.9).abs() < f64::EPSILON);
        assert!((blend(0.5, 1.0, 0.0) - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn boost_is_bounded_by_weight() {
        assert!((final_score(0.5, 1.0, 1.0) - 1.0).abs() < f64::EPSILON);
        assert!((final_score(0.5, 0.0, 1.0) - 0.5).abs() < f64::EPSILON);
        assert_eq!(final_score(0.0, 1.0, 1.0), 0.0);
    }
}
