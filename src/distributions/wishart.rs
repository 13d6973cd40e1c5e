//! Inverse-Wishart draws via the Bartlett decomposition.

use crate::error::{ImputerError, Result};
use crate::utils::{from_dmatrix, spd_inverse, to_dmatrix};
use nalgebra::{Cholesky, DMatrix};
use ndarray::{Array2, ArrayView2};
use rand::Rng;
use rand_distr::{ChiSquared, Distribution as RandDistribution, StandardNormal};

/// Draw `Σ ~ IW(df, scale)`, the distribution with mean `scale / (df - p - 1)`.
///
/// Draws `W ~ Wishart(df, scale⁻¹)` as `W = (L A)(L A)ᵀ` with `L` the
/// Cholesky factor of `scale⁻¹` and `A` the Bartlett factor, then inverts
/// through the triangular factor. Fails if the result is not positive
/// definite.
pub fn sample_inverse_wishart<R: Rng + ?Sized>(
    df: f64,
    scale: &ArrayView2<f64>,
    rng: &mut R,
) -> Result<Array2<f64>> {
    let p = scale.nrows();
    if !(df > p as f64 - 1.0) {
        return Err(ImputerError::InvalidParameter(format!(
            "inverse Wishart needs df > {} (got {})",
            p as f64 - 1.0,
            df
        )));
    }
    let precision_scale = spd_inverse(scale)
        .map_err(|e| ImputerError::Numerical(format!("inverse Wishart scale: {}", e)))?;
    let l = Cholesky::new(to_dmatrix(&precision_scale.view()))
        .ok_or_else(|| {
            ImputerError::Numerical("inverse Wishart scale is not positive definite".to_string())
        })?
        .unpack();

    let mut bartlett = DMatrix::<f64>::zeros(p, p);
    for i in 0..p {
        let chi = ChiSquared::new(df - i as f64)
            .map_err(|e| ImputerError::Numerical(format!("chi-square draw: {}", e)))?;
        bartlett[(i, i)] = chi.sample(rng).sqrt();
        for j in 0..i {
            bartlett[(i, j)] = StandardNormal.sample(rng);
        }
    }

    let factor = l * bartlett;
    let factor_inv = factor
        .solve_lower_triangular(&DMatrix::identity(p, p))
        .filter(|inv| inv.iter().all(|v| v.is_finite()))
        .ok_or_else(|| ImputerError::Numerical("singular Wishart factor".to_string()))?;
    let sigma = factor_inv.transpose() * &factor_inv;
    let sigma = (&sigma + sigma.transpose()) * 0.5;
    if Cholesky::new(sigma.clone()).is_none() {
        return Err(ImputerError::Numerical(
            "inverse Wishart draw is not positive definite".to_string(),
        ));
    }
    Ok(from_dmatrix(&sigma))
}
