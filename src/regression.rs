//! Multivariate linear regression on the copula scale.
//!
//! `z = Beta x + e` with `e ~ N(0, Sigma)`. The prior is matrix-normal on
//! `β = Betaᵀ` given `Sigma`, and inverse-Wishart on `Sigma`, so the full
//! conditional given the completed latent data is available in closed form.

use crate::distributions::wishart::sample_inverse_wishart;
use crate::error::{ImputerError, Result};
use crate::sampler::PosteriorSampler;
use crate::utils::{check_spd, cholesky, from_dmatrix, log_det, spd_inverse, symmetrize, to_dmatrix};
use nalgebra::{Cholesky, DMatrix};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::Rng;
use rand_distr::{Distribution as RandDistribution, StandardNormal};
use serde::{Deserialize, Serialize};
use statrs::function::gamma::ln_gamma;
use std::f64::consts::PI;

/// Prior precision scale used by the default prior on the coefficients.
pub const DEFAULT_PRIOR_PRECISION: f64 = 1e-4;

/// Conjugate prior on `(Beta, Sigma)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionPrior {
    /// Prior mean of `β = Betaᵀ` (`xdim × ydim`).
    pub beta_mean: Array2<f64>,
    /// Prior row precision `Λ₀` (`xdim × xdim`).
    pub beta_precision: Array2<f64>,
    /// Inverse-Wishart degrees of freedom `ν₀`.
    pub df: f64,
    /// Inverse-Wishart scale `S₀` (`ydim × ydim`).
    pub sigma_scale: Array2<f64>,
}

impl RegressionPrior {
    /// A nearly flat prior centred on zero coefficients and unit covariance.
    pub fn default_for(xdim: usize, ydim: usize) -> Self {
        let df = ydim as f64 + 1.0;
        Self {
            beta_mean: Array2::zeros((xdim, ydim)),
            beta_precision: Array2::eye(xdim) * DEFAULT_PRIOR_PRECISION,
            df,
            sigma_scale: Array2::eye(ydim) * df,
        }
    }

    /// Check dimensions and definiteness against a model of the given size.
    pub fn validate(&self, xdim: usize, ydim: usize) -> Result<()> {
        if self.beta_mean.dim() != (xdim, ydim) {
            return Err(ImputerError::shape(
                format!("beta_mean ({}, {})", xdim, ydim),
                format!("{:?}", self.beta_mean.dim()),
            ));
        }
        check_spd(&self.beta_precision.view(), xdim)?;
        check_spd(&self.sigma_scale.view(), ydim)?;
        if !(self.df > ydim as f64 - 1.0) || !self.df.is_finite() {
            return Err(ImputerError::InvalidParameter(format!(
                "prior degrees of freedom must exceed {} (got {})",
                ydim as f64 - 1.0,
                self.df
            )));
        }
        Ok(())
    }
}

/// Sufficient statistics `Σ x xᵀ`, `Σ x zᵀ`, `Σ z zᵀ` and the row count.
#[derive(Debug, Clone, PartialEq)]
pub struct RegressionSuf {
    pub xtx: Array2<f64>,
    pub xty: Array2<f64>,
    pub yty: Array2<f64>,
    pub n: f64,
}

impl RegressionSuf {
    pub fn new(xdim: usize, ydim: usize) -> Self {
        Self {
            xtx: Array2::zeros((xdim, xdim)),
            xty: Array2::zeros((xdim, ydim)),
            yty: Array2::zeros((ydim, ydim)),
            n: 0.0,
        }
    }

    pub fn clear(&mut self) {
        self.xtx.fill(0.0);
        self.xty.fill(0.0);
        self.yty.fill(0.0);
        self.n = 0.0;
    }

    /// Add one row. Does not allocate.
    pub fn add(&mut self, x: &ArrayView1<f64>, z: &ArrayView1<f64>) {
        for (i, &xi) in x.iter().enumerate() {
            for (j, &xj) in x.iter().enumerate() {
                self.xtx[[i, j]] += xi * xj;
            }
            for (j, &zj) in z.iter().enumerate() {
                self.xty[[i, j]] += xi * zj;
            }
        }
        for (i, &zi) in z.iter().enumerate() {
            for (j, &zj) in z.iter().enumerate() {
                self.yty[[i, j]] += zi * zj;
            }
        }
        self.n += 1.0;
    }

    pub fn combine(&mut self, other: &RegressionSuf) {
        self.xtx += &other.xtx;
        self.xty += &other.xty;
        self.yty += &other.yty;
        self.n += other.n;
    }
}

/// Regression coefficients and residual covariance shared by every cluster.
///
/// `Sigma⁻¹` is cached whenever `Sigma` changes; the workers read it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MvRegModel {
    beta: Array2<f64>,
    sigma: Array2<f64>,
    sigma_precision: Array2<f64>,
    prior: RegressionPrior,
}

impl MvRegModel {
    /// Zero coefficients, identity covariance and the default prior.
    pub fn new(xdim: usize, ydim: usize) -> Self {
        Self {
            beta: Array2::zeros((ydim, xdim)),
            sigma: Array2::eye(ydim),
            sigma_precision: Array2::eye(ydim),
            prior: RegressionPrior::default_for(xdim, ydim),
        }
    }

    pub fn xdim(&self) -> usize {
        self.beta.ncols()
    }

    pub fn ydim(&self) -> usize {
        self.beta.nrows()
    }

    /// Coefficient matrix `Beta` (`ydim × xdim`).
    pub fn beta(&self) -> &Array2<f64> {
        &self.beta
    }

    /// Residual covariance `Sigma` (`ydim × ydim`).
    pub fn sigma(&self) -> &Array2<f64> {
        &self.sigma
    }

    /// `Sigma⁻¹`.
    pub fn sigma_precision(&self) -> &Array2<f64> {
        &self.sigma_precision
    }

    pub fn prior(&self) -> &RegressionPrior {
        &self.prior
    }

    pub fn set_prior(&mut self, prior: RegressionPrior) -> Result<()> {
        prior.validate(self.xdim(), self.ydim())?;
        self.prior = prior;
        Ok(())
    }

    pub fn set_default_prior(&mut self) {
        self.prior = RegressionPrior::default_for(self.xdim(), self.ydim());
    }

    pub fn set_beta(&mut self, beta: &ArrayView2<f64>) -> Result<()> {
        if beta.dim() != self.beta.dim() {
            return Err(ImputerError::shape(
                format!("{:?}", self.beta.dim()),
                format!("{:?}", beta.dim()),
            ));
        }
        if beta.iter().any(|v| !v.is_finite()) {
            return Err(ImputerError::InvalidParameter(
                "coefficients must be finite".to_string(),
            ));
        }
        self.beta.assign(beta);
        Ok(())
    }

    /// Replace `Sigma`. It must be symmetric positive definite.
    pub fn set_sigma(&mut self, sigma: &ArrayView2<f64>) -> Result<()> {
        check_spd(sigma, self.ydim())?;
        let mut sigma = sigma.to_owned();
        symmetrize(&mut sigma);
        self.sigma_precision = spd_inverse(&sigma.view())?;
        self.sigma = sigma;
        Ok(())
    }

    /// Write `Beta x` into `out` without allocating.
    pub fn predict_into(&self, x: &ArrayView1<f64>, out: &mut [f64]) {
        for (o, row) in out.iter_mut().zip(self.beta.axis_iter(Axis(0))) {
            *o = row.dot(x);
        }
    }

    pub fn predict(&self, x: &ArrayView1<f64>) -> Array1<f64> {
        self.beta.dot(x)
    }

    /// Draw `(Beta, Sigma)` from the full conditional given `suf`.
    pub fn draw<R: Rng + ?Sized>(&mut self, suf: &RegressionSuf, rng: &mut R) -> Result<()> {
        let xdim = self.xdim();
        let ydim = self.ydim();
        let prior = &self.prior;

        let lambda_0 = to_dmatrix(&prior.beta_precision.view());
        let beta_0 = to_dmatrix(&prior.beta_mean.view());
        let lambda_n = &lambda_0 + to_dmatrix(&suf.xtx.view());
        let chol_n = Cholesky::new(lambda_n.clone()).ok_or_else(|| {
            ImputerError::Numerical("posterior coefficient precision is singular".to_string())
        })?;
        let rhs = to_dmatrix(&suf.xty.view()) + &lambda_0 * &beta_0;
        let beta_n = chol_n.solve(&rhs);

        let scale_n = to_dmatrix(&prior.sigma_scale.view())
            + to_dmatrix(&suf.yty.view())
            + beta_0.transpose() * &lambda_0 * &beta_0
            - beta_n.transpose() * &lambda_n * &beta_n;
        let mut scale_n = from_dmatrix(&scale_n);
        symmetrize(&mut scale_n);
        let df_n = prior.df + suf.n;

        let sigma = sample_inverse_wishart(df_n, &scale_n.view(), rng)?;
        let sigma_l = cholesky(&sigma.view())
            .ok_or_else(|| {
                ImputerError::Numerical(
                    "residual covariance draw is not positive definite".to_string(),
                )
            })?
            .unpack();

        // β = β_n + L_n⁻ᵀ Z L_Σᵀ has row covariance Λ_n⁻¹ and column covariance Σ.
        let noise = DMatrix::<f64>::from_fn(xdim, ydim, |_, _| StandardNormal.sample(rng));
        let coloured = noise * sigma_l.transpose();
        let shift = chol_n
            .l()
            .transpose()
            .solve_upper_triangular(&coloured)
            .ok_or_else(|| {
                ImputerError::Numerical("posterior coefficient factor is singular".to_string())
            })?;
        let beta = beta_n + shift;

        self.beta = from_dmatrix(&beta.transpose());
        self.sigma_precision = spd_inverse(&sigma.view())?;
        self.sigma = sigma;
        Ok(())
    }
}

/// `ln Γ_p(a)`, the log multivariate gamma function.
fn ln_multivariate_gamma(p: usize, a: f64) -> f64 {
    let pf = p as f64;
    pf * (pf - 1.0) / 4.0 * PI.ln() + (1..=p).map(|j| ln_gamma(a + (1.0 - j as f64) / 2.0)).sum::<f64>()
}

impl PosteriorSampler for MvRegModel {
    /// Matrix-normal inverse-Wishart log density of `(Beta, Sigma)`.
    ///
    /// `Sigma ~ IW(ν₀, S₀)` and `β = Betaᵀ | Sigma ~ MN(β₀, Λ₀⁻¹, Sigma)`.
    fn log_prior(&self) -> Result<f64> {
        let prior = &self.prior;
        let p = self.ydim() as f64;
        let q = self.xdim() as f64;
        let nu = prior.df;

        let sigma_chol = cholesky(&self.sigma.view()).ok_or_else(|| {
            ImputerError::NotPositiveDefinite("residual covariance".to_string())
        })?;
        let scale_chol = cholesky(&prior.sigma_scale.view()).ok_or_else(|| {
            ImputerError::NotPositiveDefinite("prior inverse Wishart scale".to_string())
        })?;
        let precision_chol = cholesky(&prior.beta_precision.view()).ok_or_else(|| {
            ImputerError::NotPositiveDefinite("prior coefficient precision".to_string())
        })?;
        let log_det_sigma = log_det(&sigma_chol);

        let log_iw = 0.5 * nu * log_det(&scale_chol)
            - 0.5 * nu * p * 2.0_f64.ln()
            - ln_multivariate_gamma(self.ydim(), 0.5 * nu)
            - 0.5 * (nu + p + 1.0) * log_det_sigma
            - 0.5 * (&prior.sigma_scale * &self.sigma_precision).sum();

        let resid = &self.beta.t() - &prior.beta_mean;
        let quad = resid.t().dot(&prior.beta_precision.dot(&resid));
        let log_mn = -0.5 * q * p * (2.0 * PI).ln() + 0.5 * p * log_det(&precision_chol)
            - 0.5 * q * log_det_sigma
            - 0.5 * (&self.sigma_precision * &quad).sum();

        Ok(log_iw + log_mn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_default_prior() {
        let prior = RegressionPrior::default_for(2, 3);
        assert_eq!(prior.df, 4.0);
        assert_eq!(prior.sigma_scale[[1, 1]], 4.0);
        assert_eq!(prior.beta_precision[[0, 0]], 1e-4);
        prior.validate(2, 3).unwrap();
        assert!(prior.validate(3, 3).is_err());
    }

    #[test]
    fn test_set_sigma_validates() {
        let mut model = MvRegModel::new(1, 2);
        assert!(matches!(
            model.set_sigma(&array![[1.0, 2.0], [2.0, 1.0]].view()),
            Err(ImputerError::NotPositiveDefinite(_))
        ));
        assert!(matches!(
            model.set_sigma(&array![[1.0, 0.2], [0.0, 1.0]].view()),
            Err(ImputerError::NotPositiveDefinite(_))
        ));
        assert!(model.set_sigma(&Array2::eye(3).view()).is_err());

        model.set_sigma(&array![[4.0, 0.0], [0.0, 0.25]].view()).unwrap();
        assert_relative_eq!(model.sigma_precision()[[0, 0]], 0.25, epsilon = 1e-12);
        assert_relative_eq!(model.sigma_precision()[[1, 1]], 4.0, epsilon = 1e-12);
    }

    #[test]
    fn test_set_beta_checks_shape() {
        let mut model = MvRegModel::new(2, 1);
        assert!(model.set_beta(&array![[1.0], [2.0]].view()).is_err());
        model.set_beta(&array![[1.0, 2.0]].view()).unwrap();
        let mut out = [0.0];
        model.predict_into(&array![0.5, 1.0].view(), &mut out);
        assert_relative_eq!(out[0], 2.5, epsilon = 1e-12);
    }

    #[test]
    fn test_suf_add_and_combine() {
        let mut a = RegressionSuf::new(2, 1);
        a.add(&array![1.0, 2.0].view(), &array![3.0].view());
        let mut b = RegressionSuf::new(2, 1);
        b.add(&array![1.0, -1.0].view(), &array![1.0].view());
        a.combine(&b);
        assert_eq!(a.n, 2.0);
        assert_eq!(a.xtx, array![[2.0, 1.0], [1.0, 5.0]]);
        assert_eq!(a.xty, array![[4.0], [5.0]]);
        assert_eq!(a.yty, array![[10.0]]);
        a.clear();
        assert_eq!(a.n, 0.0);
    }

    #[test]
    fn test_draw_recovers_coefficients() {
        let mut rng = ChaCha8Rng::seed_from_u64(17);
        let true_beta = array![[1.0, -0.5], [0.3, 2.0]];
        let mut suf = RegressionSuf::new(2, 2);
        for i in 0..2000 {
            let x = array![1.0, (i as f64 / 200.0).sin()];
            let noise: Array1<f64> = Array1::from_iter((0..2).map(|_| {
                let e: f64 = StandardNormal.sample(&mut rng);
                0.3 * e
            }));
            let z = true_beta.dot(&x) + noise;
            suf.add(&x.view(), &z.view());
        }
        let mut model = MvRegModel::new(2, 2);
        model.draw(&suf, &mut rng).unwrap();
        for (est, truth) in model.beta().iter().zip(true_beta.iter()) {
            assert_relative_eq!(est, truth, epsilon = 0.05);
        }
        assert_relative_eq!(model.sigma()[[0, 0]], 0.09, epsilon = 0.02);
        assert!(cholesky(&model.sigma().view()).is_some());
    }

    #[test]
    fn test_log_prior_univariate_closed_form() {
        // With one predictor and one response the prior is
        // σ² ~ InvGamma(ν₀/2, s₀/2) and β | σ² ~ N(β₀, σ²/λ₀).
        let mut model = MvRegModel::new(1, 1);
        model.set_sigma(&array![[2.0]].view()).unwrap();
        model.set_beta(&array![[0.5]].view()).unwrap();
        let (nu, s0, lambda0) = (2.0_f64, 2.0_f64, DEFAULT_PRIOR_PRECISION);
        let sigma2 = 2.0_f64;
        let log_inv_gamma = 0.5 * nu * (0.5 * s0).ln() - ln_gamma(0.5 * nu)
            - (0.5 * nu + 1.0) * sigma2.ln()
            - 0.5 * s0 / sigma2;
        let log_normal = -0.5 * (2.0 * PI * sigma2 / lambda0).ln() - 0.5 * lambda0 * 0.25 / sigma2;
        assert_relative_eq!(
            model.log_prior().unwrap(),
            log_inv_gamma + log_normal,
            epsilon = 1e-10
        );
    }

    #[test]
    fn test_log_prior_prefers_prior_mode() {
        let mut model = MvRegModel::new(2, 2);
        let near = model.log_prior().unwrap();
        assert!(near.is_finite());
        model
            .set_sigma(&array![[50.0, 0.0], [0.0, 50.0]].view())
            .unwrap();
        assert!(model.log_prior().unwrap() < near);
    }
}
