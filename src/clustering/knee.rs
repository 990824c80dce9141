//! Knee (elbow) detection on a sorted distance curve
//!
//! The knee of a convex, increasing curve is the point lying furthest below
//! the chord joining its first and last points. On a sorted k-distance curve
//! it marks where neighbourhoods stop being dense, which makes the curve
//! value at the knee a parameter-free choice of clustering radius.

/// Location of the detected knee.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Knee {
    /// Index into the input curve.
    pub index: usize,
    /// Curve value at `index`.
    pub value: f64,
}

/// Find the point of maximum perpendicular deviation below the chord.
///
/// `curve` is assumed non-decreasing. Returns `None` when the curve is too
/// short (fewer than three points), constant, or has no interior point
/// strictly below the chord. Ties resolve to the lowest index.
pub fn find_knee(curve: &[f64]) -> Option<Knee> {
    let n = curve.len();
    if n < 3 {
        return None;
    }

    let (x1, y1) = (0.0_f64, curve[0]);
    let (x2, y2) = ((n - 1) as f64, curve[n - 1]);
    let dy = y2 - y1;
    let dx = x2 - x1;

    if !dy.is_finite() || dy <= 0.0 {
        return None;
    }

    let chord_len = (dx * dx + dy * dy).sqrt();

    let mut best: Option<(usize, f64)> = None;
    for (i, &y) in curve.iter().enumerate().take(n - 1).skip(1) {
        let x = i as f64;
        // Positive when (x, y) lies below the chord of an increasing curve.
        let deviation = (dy * x - dx * y + x2 * y1 - y2 * x1) / chord_len;
        if deviation <= 0.0 {
            continue;
        }
        match best {
            Some((_, d)) if deviation <= d => {}
            _ => best = Some((i, deviation)),
        }
    }

    best.map(|(index, _)| Knee {
        index,
        value: curve[index],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_curve_has_no_knee() {
        assert_eq!(find_knee(&[]), None);
        assert_eq!(find_knee(&[1.0]), None);
        assert_eq!(find_knee(&[1.0, 5.0]), None);
    }

    #[test]
    fn test_constant_curve_has_no_knee() {
        assert_eq!(find_knee(&[2.0, 2.0, 2.0, 2.0]), None);
    }

    #[test]
    fn test_linear_curve_has_no_knee() {
        assert_eq!(find_knee(&[0.0, 1.0, 2.0, 3.0, 4.0]), None);
    }

    #[test]
    fn test_concave_curve_has_no_knee() {
        // Every interior point lies above the chord.
        assert_eq!(find_knee(&[0.0, 3.0, 4.0, 4.5, 5.0]), None);
    }

    #[test]
    fn test_sharp_elbow() {
        let curve = [1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 5.0, 5.0, 7.07];
        let knee = find_knee(&curve).unwrap();
        assert_eq!(knee.index, 5);
        assert!((knee.value - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_exponential_curve() {
        let curve: Vec<f64> = (0..10).map(|i| 2f64.powi(i)).collect();
        let knee = find_knee(&curve).unwrap();
        // The elbow of 2^i over 0..9 sits in the upper part of the range.
        assert!(knee.index >= 5 && knee.index <= 8, "knee at {}", knee.index);
        assert_eq!(knee.value, curve[knee.index]);
    }

    #[test]
    fn test_scale_invariant_index() {
        let curve = [0.1, 0.1, 0.12, 0.15, 0.9, 1.0];
        let scaled: Vec<f64> = curve.iter().map(|v| v * 1000.0).collect();
        assert_eq!(
            find_knee(&curve).map(|k| k.index),
            find_knee(&scaled).map(|k| k.index)
        );
    }
}
