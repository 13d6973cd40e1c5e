//! Conditional draws from a multivariate normal distribution.
//!
//! The imputer needs two flavours: an exact block draw of the unobserved
//! coordinates given the observed ones (used at imputation time), and an
//! allocation-free single-site Gibbs update driven by the precision matrix
//! (used inside the worker pool, where every row keeps its latent state
//! between sweeps).

use crate::error::{ImputerError, Result};
use nalgebra::{Cholesky, DMatrix, DVector};
use ndarray::{Array1, ArrayView1, ArrayView2};
use rand::Rng;
use rand_distr::{Distribution as RandDistribution, StandardNormal};

/// Redraw each free coordinate of `values` from its full conditional.
///
/// `precision` is `Σ⁻¹`. For coordinate `j` the conditional is
/// `N(μ_j - Σ_{k≠j} P_jk (z_k - μ_k) / P_jj, 1 / P_jj)`. Coordinates are
/// visited in index order and each update sees the ones before it.
pub fn gibbs_update_free<R: Rng + ?Sized>(
    mean: &[f64],
    precision: &ArrayView2<f64>,
    values: &mut [f64],
    free: &[bool],
    rng: &mut R,
) {
    let dim = values.len();
    for j in 0..dim {
        if !free[j] {
            continue;
        }
        let p_jj = precision[[j, j]];
        let mut shift = 0.0;
        for k in 0..dim {
            if k != j {
                shift += precision[[j, k]] * (values[k] - mean[k]);
            }
        }
        let cond_mean = mean[j] - shift / p_jj;
        let z: f64 = StandardNormal.sample(rng);
        values[j] = cond_mean + z / p_jj.sqrt();
    }
}

/// Draw the free coordinates of `values` jointly, conditional on the rest.
///
/// `sigma` is the covariance of the full vector. Observed coordinates are
/// left untouched.
pub fn conditional_draw<R: Rng + ?Sized>(
    mean: &ArrayView1<f64>,
    sigma: &ArrayView2<f64>,
    values: &mut Array1<f64>,
    free: &[bool],
    rng: &mut R,
) -> Result<()> {
    let free_idx: Vec<usize> = (0..free.len()).filter(|&i| free[i]).collect();
    if free_idx.is_empty() {
        return Ok(());
    }
    let obs_idx: Vec<usize> = (0..free.len()).filter(|&i| !free[i]).collect();

    let nf = free_idx.len();
    let no = obs_idx.len();
    let mut cond_mean = DVector::from_iterator(nf, free_idx.iter().map(|&i| mean[i]));
    let mut cond_cov = DMatrix::from_fn(nf, nf, |a, b| sigma[[free_idx[a], free_idx[b]]]);

    if no > 0 {
        let sigma_oo = DMatrix::from_fn(no, no, |a, b| sigma[[obs_idx[a], obs_idx[b]]]);
        let sigma_fo = DMatrix::from_fn(nf, no, |a, b| sigma[[free_idx[a], obs_idx[b]]]);
        let resid = DVector::from_iterator(no, obs_idx.iter().map(|&i| values[i] - mean[i]));

        let chol_oo = Cholesky::new(sigma_oo).ok_or_else(|| {
            ImputerError::NotPositiveDefinite("observed block of the covariance".to_string())
        })?;
        cond_mean += &sigma_fo * chol_oo.solve(&resid);
        cond_cov -= &sigma_fo * chol_oo.solve(&sigma_fo.transpose());
        cond_cov = (&cond_cov + cond_cov.transpose()) * 0.5;
    }

    let l = Cholesky::new(cond_cov)
        .ok_or_else(|| {
            ImputerError::Numerical("conditional covariance is not positive definite".to_string())
        })?
        .unpack();
    let z = DVector::<f64>::from_fn(nf, |_, _| StandardNormal.sample(rng));
    let draw = cond_mean + l * z;
    for (a, &i) in free_idx.iter().enumerate() {
        values[i] = draw[a];
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::spd_inverse;
    use approx::assert_relative_eq;
    use ndarray::array;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_conditional_draw_moments() {
        // Bivariate normal with correlation 0.8: x1 | x0 = 1 ~ N(0.8, 0.36).
        let mean = array![0.0, 0.0];
        let sigma = array![[1.0, 0.8], [0.8, 1.0]];
        let mut rng = ChaCha8Rng::seed_from_u64(123);
        let n = 20000;
        let mut draws = Vec::with_capacity(n);
        for _ in 0..n {
            let mut values = array![1.0, 0.0];
            conditional_draw(&mean.view(), &sigma.view(), &mut values, &[false, true], &mut rng)
                .unwrap();
            assert_eq!(values[0], 1.0);
            draws.push(values[1]);
        }
        let m = draws.iter().sum::<f64>() / n as f64;
        let v = draws.iter().map(|d| (d - m).powi(2)).sum::<f64>() / n as f64;
        assert_relative_eq!(m, 0.8, epsilon = 0.02);
        assert_relative_eq!(v, 0.36, epsilon = 0.02);
    }

    #[test]
    fn test_conditional_draw_all_free_uses_marginal() {
        let mean = array![2.0, -1.0];
        let sigma = array![[0.5, 0.0], [0.0, 2.0]];
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let n = 20000;
        let mut sum = array![0.0, 0.0];
        for _ in 0..n {
            let mut values = Array1::zeros(2);
            conditional_draw(&mean.view(), &sigma.view(), &mut values, &[true, true], &mut rng)
                .unwrap();
            sum = sum + &values;
        }
        assert_relative_eq!(sum[0] / n as f64, 2.0, epsilon = 0.03);
        assert_relative_eq!(sum[1] / n as f64, -1.0, epsilon = 0.05);
    }

    #[test]
    fn test_conditional_draw_nothing_free_is_noop() {
        let mean = array![0.0];
        let sigma = array![[1.0]];
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let mut values = array![3.0];
        conditional_draw(&mean.view(), &sigma.view(), &mut values, &[false], &mut rng).unwrap();
        assert_eq!(values[0], 3.0);
    }

    #[test]
    fn test_gibbs_update_matches_conditional() {
        let mean = [0.0, 0.0];
        let sigma = array![[1.0, 0.8], [0.8, 1.0]];
        let precision = spd_inverse(&sigma.view()).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(77);
        let n = 20000;
        let mut total = 0.0;
        for _ in 0..n {
            let mut values = [1.0, 0.0];
            gibbs_update_free(&mean, &precision.view(), &mut values, &[false, true], &mut rng);
            total += values[1];
        }
        assert_relative_eq!(total / n as f64, 0.8, epsilon = 0.02);
    }
}
