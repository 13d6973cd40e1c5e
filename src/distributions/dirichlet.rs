//! Dirichlet distribution with support for structural zeros.
//!
//! Concentration parameters are prior counts. A non-positive count marks its
//! level as impossible: the level gets probability exactly zero and is left
//! out of the Gamma draws, so adding observed counts to a negative prior can
//! never produce a negative Dirichlet parameter.

use crate::error::{ImputerError, Result};
use ndarray::{Array1, ArrayView1};
use rand::Rng;
use rand_distr::{Distribution as RandDistribution, Gamma as RandGamma};
use serde::{Deserialize, Serialize};
use statrs::function::gamma::ln_gamma;

/// Dirichlet distribution over `alpha.len()` categories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dirichlet {
    alpha: Array1<f64>,
}

impl Dirichlet {
    /// Create a Dirichlet distribution from (possibly non-positive) counts.
    ///
    /// At least one count must be positive.
    pub fn new(alpha: Array1<f64>) -> Result<Self> {
        if alpha.iter().any(|a| !a.is_finite()) {
            return Err(ImputerError::InvalidParameter(
                "Dirichlet parameters must be finite".to_string(),
            ));
        }
        if !alpha.iter().any(|&a| a > 0.0) {
            return Err(ImputerError::InvalidParameter(
                "Dirichlet parameters need at least one positive entry".to_string(),
            ));
        }
        Ok(Self { alpha })
    }

    /// Unit counts on every level; the uniform distribution on the simplex.
    pub fn uniform(dim: usize) -> Self {
        Self {
            alpha: Array1::ones(dim),
        }
    }

    pub fn alpha(&self) -> &Array1<f64> {
        &self.alpha
    }

    pub fn dim(&self) -> usize {
        self.alpha.len()
    }

    /// Conjugate posterior after observing `counts`.
    ///
    /// Parameters that stay non-positive are clamped to zero, which keeps the
    /// level impossible.
    pub fn posterior(&self, counts: &ArrayView1<f64>) -> Result<Self> {
        if counts.len() != self.alpha.len() {
            return Err(ImputerError::shape(
                format!("{} counts", self.alpha.len()),
                format!("{} counts", counts.len()),
            ));
        }
        let alpha = self
            .alpha
            .iter()
            .zip(counts.iter())
            .map(|(&a, &n)| (a + n).max(0.0))
            .collect::<Array1<f64>>();
        Self::new(alpha)
    }

    /// Draw a probability vector. Impossible levels receive exactly zero.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Array1<f64>> {
        let mut draw = Array1::<f64>::zeros(self.alpha.len());
        for (d, &a) in draw.iter_mut().zip(self.alpha.iter()) {
            if a > 0.0 {
                let gamma = RandGamma::new(a, 1.0)
                    .map_err(|e| ImputerError::Numerical(format!("Gamma({}, 1): {}", a, e)))?;
                *d = gamma.sample(rng);
            }
        }
        let total = draw.sum();
        if !(total > 0.0) || !total.is_finite() {
            return Err(ImputerError::Numerical(format!(
                "Dirichlet draw degenerated (sum = {}) for alpha {:?}",
                total, self.alpha
            )));
        }
        draw.mapv_inplace(|v| v / total);
        Ok(draw)
    }

    /// Log density at `probs`, restricted to the possible levels.
    ///
    /// Returns `-inf` if an impossible level has positive probability or
    /// `probs` is not on the simplex.
    pub fn log_density(&self, probs: &ArrayView1<f64>) -> f64 {
        if probs.len() != self.alpha.len() {
            return f64::NEG_INFINITY;
        }
        let total: f64 = probs.sum();
        if (total - 1.0).abs() > 1e-8 || probs.iter().any(|&p| p < 0.0) {
            return f64::NEG_INFINITY;
        }
        let mut log_prod = 0.0;
        for (&a, &p) in self.alpha.iter().zip(probs.iter()) {
            if a > 0.0 {
                log_prod += (a - 1.0) * p.ln();
            } else if p > 0.0 {
                return f64::NEG_INFINITY;
            }
        }
        log_prod - Self::log_beta(&self.alpha)
    }

    /// Log of the multivariate beta function over the positive entries.
    fn log_beta(concentration: &Array1<f64>) -> f64 {
        let positive = concentration.iter().copied().filter(|&a| a > 0.0);
        let sum_alpha: f64 = positive.clone().sum();
        let sum_log_gamma_alpha: f64 = positive.map(ln_gamma).sum();
        sum_log_gamma_alpha - ln_gamma(sum_alpha)
    }
}
