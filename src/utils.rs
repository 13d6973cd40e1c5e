//! Numerical helpers shared by the samplers.
//!
//! Conversions between `ndarray` and `nalgebra` matrices, Cholesky-based
//! checks and inverses, the standard normal CDF and quantile, and categorical
//! sampling from (log) probability weights.

use crate::error::{ImputerError, Result};
use nalgebra::{Cholesky, DMatrix, Dyn};
use ndarray::{Array2, ArrayView2};
use statrs::function::erf::{erfc, erfc_inv};
use std::f64::consts::SQRT_2;

/// Relative tolerance used when checking a matrix for symmetry.
pub const SYMMETRY_TOLERANCE: f64 = 1e-8;

/// Standard normal cumulative distribution function.
pub fn normal_cdf(x: f64) -> f64 {
    0.5 * erfc(-x / SQRT_2)
}

/// Standard normal quantile function. `p` must lie strictly inside (0, 1).
pub fn normal_quantile(p: f64) -> f64 {
    -SQRT_2 * erfc_inv(2.0 * p)
}

pub fn to_dmatrix(a: &ArrayView2<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(a.nrows(), a.ncols(), |i, j| a[[i, j]])
}

pub fn from_dmatrix(m: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn((m.nrows(), m.ncols()), |(i, j)| m[(i, j)])
}

/// Cholesky factorisation `A = L Lᵀ` of a square matrix.
///
/// Returns `None` when `a` is not square, has a non-finite entry or is not
/// positive definite. Only the lower triangle of `a` is read.
pub fn cholesky(a: &ArrayView2<f64>) -> Option<Cholesky<f64, Dyn>> {
    if a.nrows() != a.ncols() || a.iter().any(|v| !v.is_finite()) {
        return None;
    }
    Cholesky::new(to_dmatrix(a))
}

/// `ln |A|` from the Cholesky factor of `A`.
pub fn log_det(chol: &Cholesky<f64, Dyn>) -> f64 {
    2.0 * chol.l_dirty().diagonal().iter().map(|d| d.ln()).sum::<f64>()
}

/// Inverse of a symmetric positive definite matrix, via its Cholesky factor.
pub fn spd_inverse(a: &ArrayView2<f64>) -> Result<Array2<f64>> {
    let chol = cholesky(a).ok_or_else(|| {
        ImputerError::NotPositiveDefinite(format!("{}x{} matrix", a.nrows(), a.ncols()))
    })?;
    let mut inv = from_dmatrix(&chol.inverse());
    symmetrize(&mut inv);
    Ok(inv)
}

/// Replace `a` with `(a + aᵀ) / 2`.
pub fn symmetrize(a: &mut Array2<f64>) {
    let transposed = a.t().to_owned();
    *a += &transposed;
    *a *= 0.5;
}

/// Check that a square matrix is symmetric up to a relative tolerance.
pub fn is_symmetric(a: &ArrayView2<f64>, tol: f64) -> bool {
    if a.nrows() != a.ncols() {
        return false;
    }
    let m = to_dmatrix(a);
    let scale = m.amax().max(1.0);
    (&m - m.transpose()).amax() <= tol * scale
}

/// Validate that `a` is a symmetric positive definite `dim x dim` matrix.
pub fn check_spd(a: &ArrayView2<f64>, dim: usize) -> Result<()> {
    if a.dim() != (dim, dim) {
        return Err(ImputerError::shape(
            format!("({}, {})", dim, dim),
            format!("{:?}", a.dim()),
        ));
    }
    if !is_symmetric(a, SYMMETRY_TOLERANCE) {
        return Err(ImputerError::NotPositiveDefinite(
            "matrix is not symmetric".to_string(),
        ));
    }
    cholesky(a).map(|_| ()).ok_or_else(|| {
        ImputerError::NotPositiveDefinite("Cholesky factorisation failed".to_string())
    })
}

/// Normalise log weights in place into probabilities and draw an index.
///
/// `u` is a single `Uniform(0, 1)` draw compared against the normalised
/// cumulative sum. Returns `None` when every weight is `-inf` or NaN.
pub fn sample_log_categorical(log_weights: &mut [f64], u: f64) -> Option<usize> {
    let max = log_weights
        .iter()
        .copied()
        .filter(|v| !v.is_nan())
        .fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return None;
    }
    let mut total = 0.0;
    for w in log_weights.iter_mut() {
        *w = if w.is_nan() { 0.0 } else { (*w - max).exp() };
        total += *w;
    }
    for w in log_weights.iter_mut() {
        *w /= total;
    }
    sample_categorical(log_weights.iter(), u)
}

/// Draw an index from non-negative probabilities.
///
/// The probabilities are normalised by their sum, so they need not add up to
/// exactly one. Returns `None` when all probabilities are zero.
pub fn sample_categorical<'a, I>(probs: I, u: f64) -> Option<usize>
where
    I: IntoIterator<Item = &'a f64>,
    I::IntoIter: Clone,
{
    let iter = probs.into_iter();
    let total: f64 = iter.clone().sum();
    if !(total > 0.0) {
        return None;
    }
    let target = u * total;
    let mut cumulative = 0.0;
    let mut last_positive = None;
    for (i, &p) in iter.enumerate() {
        if p > 0.0 {
            last_positive = Some(i);
        }
        cumulative += p;
        if target < cumulative && p > 0.0 {
            return Some(i);
        }
    }
    // Rounding can leave `target` a hair above the final cumulative sum.
    last_positive
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_normal_cdf_and_quantile_invert() {
        assert_abs_diff_eq!(normal_cdf(0.0), 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(normal_cdf(1.959963984540054), 0.975, epsilon = 1e-9);
        for &p in &[1e-8, 0.01, 0.3, 0.5, 0.77, 0.999] {
            assert_abs_diff_eq!(normal_cdf(normal_quantile(p)), p, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_cholesky_reconstructs_matrix() {
        let a = array![[4.0, 2.0, 0.4], [2.0, 3.0, 0.5], [0.4, 0.5, 1.0]];
        let l = from_dmatrix(&cholesky(&a.view()).unwrap().l());
        let rebuilt = l.dot(&l.t());
        for (x, y) in rebuilt.iter().zip(a.iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-12);
        }
        assert_eq!(l[[0, 1]], 0.0);
    }

    #[test]
    fn test_cholesky_rejects_indefinite() {
        let a = array![[1.0, 2.0], [2.0, 1.0]];
        assert!(cholesky(&a.view()).is_none());
        assert!(cholesky(&array![[1.0, f64::NAN], [f64::NAN, 1.0]].view()).is_none());
        assert!(check_spd(&a.view(), 2).is_err());
    }

    #[test]
    fn test_check_spd_rejects_asymmetric_and_wrong_shape() {
        let asym = array![[2.0, 0.5], [0.0, 2.0]];
        assert!(matches!(
            check_spd(&asym.view(), 2),
            Err(ImputerError::NotPositiveDefinite(_))
        ));
        let eye = Array2::<f64>::eye(3);
        assert!(matches!(
            check_spd(&eye.view(), 2),
            Err(ImputerError::ShapeMismatch { .. })
        ));
        check_spd(&eye.view(), 3).unwrap();
    }

    #[test]
    fn test_spd_inverse() {
        let a = array![[2.0, 0.5], [0.5, 1.0]];
        let inv = spd_inverse(&a.view()).unwrap();
        let prod = a.dot(&inv);
        assert_abs_diff_eq!(prod[[0, 0]], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(prod[[0, 1]], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(prod[[1, 1]], 1.0, epsilon = 1e-12);
        assert_eq!(inv[[0, 1]], inv[[1, 0]]);
    }

    #[test]
    fn test_log_det() {
        let a = array![[2.0, 0.5], [0.5, 1.0]];
        let chol = cholesky(&a.view()).unwrap();
        assert_abs_diff_eq!(log_det(&chol), 1.75_f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn test_symmetrize() {
        let mut a = array![[1.0, 2.0], [0.0, 3.0]];
        symmetrize(&mut a);
        assert_eq!(a, array![[1.0, 1.0], [1.0, 3.0]]);
        assert!(is_symmetric(&a.view(), SYMMETRY_TOLERANCE));
    }

    #[test]
    fn test_sample_log_categorical() {
        let mut w = [0.0_f64.ln(), 1.0_f64.ln(), 3.0_f64.ln()];
        assert_eq!(sample_log_categorical(&mut w, 0.1), Some(1));
        assert_abs_diff_eq!(w[2], 0.75, epsilon = 1e-12);

        let mut w = [0.0_f64.ln(), 1.0_f64.ln(), 3.0_f64.ln()];
        assert_eq!(sample_log_categorical(&mut w, 0.9), Some(2));

        let mut dead = [f64::NEG_INFINITY, f64::NEG_INFINITY];
        assert_eq!(sample_log_categorical(&mut dead, 0.5), None);
    }

    #[test]
    fn test_sample_categorical_skips_zero_mass() {
        assert_eq!(sample_categorical(&[0.0, 1.0, 0.0], 0.0), Some(1));
        assert_eq!(sample_categorical(&[0.5, 0.5, 0.0], 0.999_999_999), Some(1));
        assert_eq!(sample_categorical(&[0.0, 0.0], 0.3), None);
    }
}
