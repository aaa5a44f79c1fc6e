//! Normalized Levenshtein similarity with threshold pruning.
//!
//! Similarity is `1 - distance / max_len` over chars. For a threshold `t`
//! the largest admissible distance is `floor((1 - t) * max_len)`, which gives
//! both the length pre-filter and the early-exit bound.

/// Small slack so float rounding never prunes an admissible distance.
const EPSILON: f64 = 1e-9;

/// Edit distance between two strings.
pub fn distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    bounded_distance(&a, &b, usize::MAX).unwrap_or(usize::MAX)
}

/// Edit distance, or `None` as soon as it must exceed `max`.
///
/// Each DP row's minimum is a lower bound on the final distance, so the
/// computation stops once a whole row exceeds `max`.
pub fn bounded_distance(a: &[char], b: &[char], max: usize) -> Option<usize> {
    if a.len().abs_diff(b.len()) > max {
        return None;
    }
    if a.is_empty() || b.is_empty() {
        return Some(a.len().max(b.len()));
    }

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        let mut row_min = current[0];
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            current[j + 1] = (previous[j + 1] + 1)
                .min(current[j] + 1)
                .min(previous[j] + cost);
            row_min = row_min.min(current[j + 1]);
        }
        if row_min > max {
            return None;
        }
        std::mem::swap(&mut previous, &mut current);
    }

    let d = previous[b.len()];
    (d <= max).then_some(d)
}

/// Normalized similarity in `[0, 1]`. Two empty strings are identical.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let max_len = a.len().max(b.len());
    if max_len == 0 {
        return 1.0;
    }
    let d = bounded_distance(&a, &b, usize::MAX).unwrap_or(max_len);
    1.0 - d as f64 / max_len as f64
}

/// The similarity of `a` and `b` if it is at least `threshold`.
///
/// Returns `Some` exactly when [`similarity`] would be `>= threshold`, but
/// skips the DP entirely when the length difference already rules it out.
pub fn similarity_at_least(a: &str, b: &str, threshold: f64) -> Option<f64> {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let max_len = a.len().max(b.len());
    if max_len == 0 {
        return (1.0 >= threshold).then_some(1.0);
    }

    let allowed = ((1.0 - threshold).max(0.0) * max_len as f64 + EPSILON).floor() as usize;
    let d = bounded_distance(&a, &b, allowed)?;
    let sim = 1.0 - d as f64 / max_len as f64;
    (sim >= threshold).then_some(sim)
}
