//! Numerical helpers shared by the pipeline stages: the Tukey window, nearest-bin lookup,
//! a least-squares line fit and guarded element-wise division.

use crate::config::NumericPolicy;
use ndarray::{Array1, ArrayView1, Zip};
use num_complex::Complex64;
use std::f64::consts::PI;

/// Computes a symmetric Tukey (tapered cosine) window of length `n`.
///
/// The implementation follows the definition used by scipy's `signal.windows.tukey`:
/// a cosine taper over the first and last `alpha / 2` fraction of the window and a flat
/// top of ones in between.
///
/// # Arguments
/// - `n`: Number of window samples.
/// - `alpha`: Fraction of the window inside the cosine tapers. `0` gives a rectangular
///   window, `1` a Hann window.
///
/// # Returns
/// The window values, all in the range [0.0, 1.0].
pub fn tukey_window(n: usize, alpha: f64) -> Array1<f64> {
    if n == 0 {
        return Array1::zeros(0);
    }
    if n == 1 || alpha <= 0.0 {
        return Array1::ones(n);
    }
    let alpha = alpha.min(1.0);
    let m = (n - 1) as f64;
    let width = (alpha * m / 2.0).floor() as usize;

    Array1::from_shape_fn(n, |i| {
        let x = i as f64;
        if i <= width {
            0.5 * (1.0 + (PI * (-1.0 + 2.0 * x / (alpha * m))).cos())
        } else if i < n - width - 1 {
            1.0
        } else {
            0.5 * (1.0 + (PI * (-2.0 / alpha + 1.0 + 2.0 * x / (alpha * m))).cos())
        }
    })
}

/// Applies a Tukey window in place to a signal.
///
/// # Arguments
/// - `signal`: The samples to taper, modified in place.
/// - `alpha`: Shape parameter passed on to [`tukey_window`].
pub fn apply_tukey(signal: &mut Array1<f64>, alpha: f64) {
    let window = tukey_window(signal.len(), alpha);
    Zip::from(signal).and(&window).for_each(|s, w| {
        *s *= w;
    });
}

/// Finds the element of `values` closest to `target`.
///
/// Closeness is the absolute difference; on ties the first index wins.
///
/// # Returns
/// `Some((index, value))` of the nearest element, `None` if `values` is empty.
pub fn find_nearest(values: ArrayView1<f64>, target: f64) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64, f64)> = None;
    for (i, v) in values.iter().enumerate() {
        let distance = (v - target).abs();
        match best {
            Some((_, _, d)) if d <= distance => {}
            _ => best = Some((i, *v, distance)),
        }
    }
    best.map(|(i, v, _)| (i, v))
}

/// Fits `y = slope * x + intercept` by ordinary least squares.
///
/// A single point yields a flat line through it, as do points that all share the
/// same `x`.
///
/// # Returns
/// `Some((slope, intercept))`, or `None` for empty or mismatched inputs.
pub fn linear_fit(x: ArrayView1<f64>, y: ArrayView1<f64>) -> Option<(f64, f64)> {
    if x.is_empty() || x.len() != y.len() {
        return None;
    }
    let n = x.len() as f64;
    let x_mean = x.sum() / n;
    let y_mean = y.sum() / n;

    let mut sxy = 0.0;
    let mut sxx = 0.0;
    Zip::from(&x).and(&y).for_each(|xi, yi| {
        sxy += (xi - x_mean) * (yi - y_mean);
        sxx += (xi - x_mean) * (xi - x_mean);
    });

    if sxx == 0.0 {
        return Some((0.0, y_mean));
    }
    let slope = sxy / sxx;
    Some((slope, y_mean - slope * x_mean))
}

/// Returns `linspace(start, stop, n)` including both end points.
pub fn linspace(start: f64, stop: f64, n: usize) -> Array1<f64> {
    match n {
        0 => Array1::zeros(0),
        1 => Array1::from_elem(1, start),
        _ => Array1::linspace(start, stop, n),
    }
}

/// Element-wise `numerator / denominator` for magnitudes under a numeric policy.
///
/// Both arrays must have the same length.
///
/// # Returns
/// The quotients and the indices of flagged bins (only filled for
/// [`NumericPolicy::Flag`]).
pub fn divide_magnitudes(
    numerator: ArrayView1<f64>,
    denominator: ArrayView1<f64>,
    policy: NumericPolicy,
) -> (Array1<f64>, Vec<usize>) {
    let mut flagged = vec![];
    let quotient = Array1::from_shape_fn(numerator.len(), |i| {
        let (n, d) = (numerator[i], denominator[i]);
        match policy {
            NumericPolicy::Propagate => n / d,
            NumericPolicy::Clamp { epsilon } => {
                if d.abs() < epsilon {
                    n / epsilon.copysign(d)
                } else {
                    n / d
                }
            }
            NumericPolicy::Flag { epsilon } => {
                let q = n / d;
                if d.abs() < epsilon || !q.is_finite() {
                    flagged.push(i);
                }
                q
            }
        }
    });
    (quotient, flagged)
}

/// Element-wise complex `numerator / denominator` under a numeric policy.
///
/// With [`NumericPolicy::Clamp`] a small denominator keeps its phase but its magnitude is
/// raised to `epsilon`; an exact zero becomes the real value `epsilon`.
pub fn divide_complex(
    numerator: ArrayView1<Complex64>,
    denominator: ArrayView1<Complex64>,
    policy: NumericPolicy,
) -> (Array1<Complex64>, Vec<usize>) {
    let mut flagged = vec![];
    let quotient = Array1::from_shape_fn(numerator.len(), |i| {
        let (n, d) = (numerator[i], denominator[i]);
        match policy {
            NumericPolicy::Propagate => n / d,
            NumericPolicy::Clamp { epsilon } => {
                let norm = d.norm();
                if norm == 0.0 {
                    n / Complex64::new(epsilon, 0.0)
                } else if norm < epsilon {
                    n / (d * (epsilon / norm))
                } else {
                    n / d
                }
            }
            NumericPolicy::Flag { epsilon } => {
                let q = n / d;
                if d.norm() < epsilon || !q.re.is_finite() || !q.im.is_finite() {
                    flagged.push(i);
                }
                q
            }
        }
    });
    (quotient, flagged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn tukey_window_matches_scipy_reference() {
        // scipy.signal.windows.tukey(11, alpha=0.5)
        let expected = array![
            0.0, 0.3454915, 0.9045085, 1.0, 1.0, 1.0, 1.0, 1.0, 0.9045085, 0.3454915, 0.0
        ];
        let w = tukey_window(11, 0.5);
        for (a, b) in w.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
        }
    }

    #[test]
    fn tukey_window_edge_cases() {
        assert_eq!(tukey_window(0, 0.1).len(), 0);
        assert_eq!(tukey_window(1, 0.1), array![1.0]);
        assert!(tukey_window(8, 0.0).iter().all(|w| *w == 1.0));
        let w = tukey_window(1000, 0.1);
        assert_abs_diff_eq!(w[0], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(w[999], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(w[500], 1.0, epsilon = 1e-12);
        // symmetric
        for i in 0..1000 {
            assert_abs_diff_eq!(w[i], w[999 - i], epsilon = 1e-12);
        }
    }

    #[test]
    fn find_nearest_returns_index_and_value() {
        let values = array![0.0, 0.1, 0.2, 0.3];
        assert_eq!(find_nearest(values.view(), 0.19), Some((2, 0.2)));
        assert_eq!(find_nearest(values.view(), -4.0), Some((0, 0.0)));
        assert_eq!(find_nearest(values.view(), 9.0), Some((3, 0.3)));
        // ties resolve to the first index
        assert_eq!(find_nearest(array![1.0, 3.0].view(), 2.0), Some((0, 1.0)));
        assert_eq!(find_nearest(Array1::<f64>::zeros(0).view(), 1.0), None);
    }

    #[test]
    fn linear_fit_recovers_line() {
        let x = array![0.1, 0.2, 0.3, 0.4];
        let y = x.mapv(|v| 2.5 * v - 1.0);
        let (slope, intercept) = linear_fit(x.view(), y.view()).unwrap();
        assert_abs_diff_eq!(slope, 2.5, epsilon = 1e-12);
        assert_abs_diff_eq!(intercept, -1.0, epsilon = 1e-12);

        assert_eq!(linear_fit(array![1.0].view(), array![4.0].view()), Some((0.0, 4.0)));
        assert_eq!(linear_fit(Array1::zeros(0).view(), Array1::zeros(0).view()), None);
    }

    #[test]
    fn division_policies() {
        let n = array![1.0, 2.0];
        let d = array![0.0, 4.0];

        let (q, flagged) = divide_magnitudes(n.view(), d.view(), NumericPolicy::Propagate);
        assert!(q[0].is_infinite());
        assert!(flagged.is_empty());

        let (q, _) = divide_magnitudes(n.view(), d.view(), NumericPolicy::Clamp { epsilon: 1e-3 });
        assert_abs_diff_eq!(q[0], 1e3, epsilon = 1e-9);
        assert_abs_diff_eq!(q[1], 0.5, epsilon = 1e-12);

        let (q, flagged) =
            divide_magnitudes(n.view(), d.view(), NumericPolicy::Flag { epsilon: 1e-3 });
        assert!(q[0].is_infinite());
        assert_eq!(flagged, vec![0]);

        let n = array![Complex64::new(1.0, 0.0), Complex64::new(0.0, 2.0)];
        let d = array![Complex64::new(0.0, 1e-9), Complex64::new(0.0, 1.0)];
        let (q, _) = divide_complex(n.view(), d.view(), NumericPolicy::Clamp { epsilon: 1e-3 });
        assert_abs_diff_eq!(q[0].norm(), 1e3, epsilon = 1e-6);
        assert_abs_diff_eq!(q[1].re, 2.0, epsilon = 1e-12);
        let (_, flagged) =
            divide_complex(n.view(), d.view(), NumericPolicy::Flag { epsilon: 1e-3 });
        assert_eq!(flagged, vec![0]);
    }
}
