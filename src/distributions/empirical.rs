//! Streaming approximation to an empirical distribution function.
//!
//! Observations are collected in a small buffer. When the buffer fills, it is
//! merged into a piecewise-linear CDF estimate stored as quantiles on a fixed
//! probability grid. Memory use is bounded by the grid and buffer sizes no
//! matter how many observations are absorbed.

use crate::error::{ImputerError, Result};
use serde::{Deserialize, Serialize};

/// Default number of observations held before the CDF is refreshed.
pub const DEFAULT_BUFFER_SIZE: usize = 20;

/// Default number of points on the probability grid.
pub const DEFAULT_GRID_SIZE: usize = 101;

/// Serializable snapshot of an [`EmpiricalDistribution`].
///
/// Restoring from a snapshot reproduces every `cdf` and `quantile` answer of
/// the original exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmpiricalDistributionState {
    /// Buffer size that triggers a CDF refresh.
    pub max_buffer_size: usize,
    /// Number of observations merged into the CDF estimate.
    pub nobs: usize,
    /// Observations not yet merged.
    pub data_buffer: Vec<f64>,
    /// Probability grid, strictly increasing within [0, 1].
    pub probs: Vec<f64>,
    /// Quantile estimates at each grid probability.
    pub quantiles: Vec<f64>,
}

/// Approximate empirical CDF with quantile and CDF queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmpiricalDistribution {
    max_buffer_size: usize,
    nobs: usize,
    data_buffer: Vec<f64>,
    probs: Vec<f64>,
    quantiles: Vec<f64>,
}

impl EmpiricalDistribution {
    /// Create an estimator with an evenly spaced grid of `DEFAULT_GRID_SIZE` points.
    pub fn new(bufsize: usize) -> Self {
        Self::with_grid_size(DEFAULT_GRID_SIZE, bufsize)
    }

    /// Create an estimator with `grid_size` evenly spaced probabilities on [0, 1].
    pub fn with_grid_size(grid_size: usize, bufsize: usize) -> Self {
        let grid_size = grid_size.max(2);
        let probs = (0..grid_size)
            .map(|i| i as f64 / (grid_size - 1) as f64)
            .collect();
        Self {
            max_buffer_size: bufsize.max(1),
            nobs: 0,
            data_buffer: Vec::new(),
            probs,
            quantiles: Vec::new(),
        }
    }

    /// Create an estimator that tracks the quantiles at the given probabilities.
    pub fn with_probs(probs: Vec<f64>, bufsize: usize) -> Result<Self> {
        validate_probs(&probs)?;
        Ok(Self {
            max_buffer_size: bufsize.max(1),
            nobs: 0,
            data_buffer: Vec::new(),
            probs,
            quantiles: Vec::new(),
        })
    }

    /// Restore an estimator from a previously saved state.
    pub fn from_state(state: EmpiricalDistributionState) -> Result<Self> {
        validate_probs(&state.probs)?;
        if !state.quantiles.is_empty() && state.quantiles.len() != state.probs.len() {
            return Err(ImputerError::shape(
                format!("{} quantiles", state.probs.len()),
                format!("{} quantiles", state.quantiles.len()),
            ));
        }
        if state.quantiles.is_empty() && state.nobs > 0 {
            return Err(ImputerError::InvalidParameter(
                "state reports merged observations but holds no quantiles".to_string(),
            ));
        }
        if state.max_buffer_size == 0 {
            return Err(ImputerError::InvalidParameter(
                "max_buffer_size must be positive".to_string(),
            ));
        }
        Ok(Self {
            max_buffer_size: state.max_buffer_size,
            nobs: state.nobs,
            data_buffer: state.data_buffer,
            probs: state.probs,
            quantiles: state.quantiles,
        })
    }

    /// Snapshot of the full internal state.
    pub fn save_state(&self) -> EmpiricalDistributionState {
        EmpiricalDistributionState {
            max_buffer_size: self.max_buffer_size,
            nobs: self.nobs,
            data_buffer: self.data_buffer.clone(),
            probs: self.probs.clone(),
            quantiles: self.quantiles.clone(),
        }
    }

    /// Add an observation. Non-finite values are ignored.
    pub fn add(&mut self, x: f64) {
        if !x.is_finite() {
            return;
        }
        self.data_buffer.push(x);
        if self.data_buffer.len() >= self.max_buffer_size {
            self.update_cdf();
        }
    }

    /// Number of observations merged into the CDF estimate.
    pub fn nobs(&self) -> usize {
        self.nobs
    }

    /// Number of observations waiting in the buffer.
    pub fn buffered(&self) -> usize {
        self.data_buffer.len()
    }

    /// True if no observation has been merged yet.
    pub fn is_empty(&self) -> bool {
        self.quantiles.is_empty()
    }

    pub fn probs(&self) -> &[f64] {
        &self.probs
    }

    pub fn quantiles(&self) -> &[f64] {
        &self.quantiles
    }

    /// Merge the data buffer into the CDF estimate and clear the buffer.
    ///
    /// The refreshed CDF is the count-weighted mixture of the current
    /// piecewise-linear estimate and the buffer's empirical CDF.
    pub fn update_cdf(&mut self) {
        if self.data_buffer.is_empty() {
            return;
        }
        let mut buffer = std::mem::take(&mut self.data_buffer);
        buffer.sort_by(f64::total_cmp);

        if self.quantiles.is_empty() {
            self.quantiles = self
                .probs
                .iter()
                .map(|&p| sorted_quantile(&buffer, p))
                .collect();
            self.nobs = buffer.len();
            return;
        }

        let n_old = self.nobs as f64;
        let n_new = buffer.len() as f64;
        let total = n_old + n_new;

        let mut points: Vec<f64> = self.quantiles.iter().chain(buffer.iter()).copied().collect();
        points.sort_by(f64::total_cmp);
        points.dedup();

        let merged_cdf: Vec<f64> = points
            .iter()
            .map(|&t| {
                let below = buffer.partition_point(|&v| v <= t) as f64;
                (n_old * self.cdf(t) + below) / total
            })
            .collect();

        self.quantiles = self
            .probs
            .iter()
            .map(|&p| invert_piecewise_linear(&points, &merged_cdf, p))
            .collect();
        self.nobs += buffer.len();
    }

    /// Fraction of merged data less than or equal to `x`.
    ///
    /// Returns NaN when nothing has been merged.
    pub fn cdf(&self, x: f64) -> f64 {
        let q = &self.quantiles;
        if q.is_empty() || x.is_nan() {
            return f64::NAN;
        }
        let last = q.len() - 1;
        if x < q[0] {
            return 0.0;
        }
        if x >= q[last] {
            return 1.0;
        }
        let upper = q.partition_point(|&v| v <= x);
        let lower = upper - 1;
        let frac = (x - q[lower]) / (q[upper] - q[lower]);
        self.probs[lower] + frac * (self.probs[upper] - self.probs[lower])
    }

    /// Approximate quantile for probability `prob`, clamped to [0, 1].
    ///
    /// Returns NaN when nothing has been merged.
    pub fn quantile(&self, prob: f64) -> f64 {
        let q = &self.quantiles;
        if q.is_empty() || prob.is_nan() {
            return f64::NAN;
        }
        let p = prob.clamp(0.0, 1.0);
        let probs = &self.probs;
        let last = probs.len() - 1;
        if p <= probs[0] {
            return q[0];
        }
        if p >= probs[last] {
            return q[last];
        }
        let upper = probs.partition_point(|&v| v <= p);
        let lower = upper - 1;
        let frac = (p - probs[lower]) / (probs[upper] - probs[lower]);
        q[lower] + frac * (q[upper] - q[lower])
    }
}

impl Default for EmpiricalDistribution {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

fn validate_probs(probs: &[f64]) -> Result<()> {
    if probs.len() < 2 {
        return Err(ImputerError::InvalidParameter(
            "probability grid needs at least two points".to_string(),
        ));
    }
    if probs.iter().any(|p| !(0.0..=1.0).contains(p)) {
        return Err(ImputerError::InvalidParameter(
            "grid probabilities must lie in [0, 1]".to_string(),
        ));
    }
    if probs.windows(2).any(|w| w[1] <= w[0]) {
        return Err(ImputerError::InvalidParameter(
            "grid probabilities must be strictly increasing".to_string(),
        ));
    }
    Ok(())
}

/// Linear-interpolation quantile of sorted data.
fn sorted_quantile(sorted: &[f64], p: f64) -> f64 {
    let h = p * (sorted.len() - 1) as f64;
    let lo = h.floor() as usize;
    let hi = (lo + 1).min(sorted.len() - 1);
    sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
}

/// Smallest `t` with `F(t) >= p` on a piecewise-linear, non-decreasing curve.
fn invert_piecewise_linear(points: &[f64], cdf: &[f64], p: f64) -> f64 {
    let idx = cdf.partition_point(|&f| f < p);
    if idx == 0 {
        return points[0];
    }
    if idx >= points.len() {
        return points[points.len() - 1];
    }
    let (f0, f1) = (cdf[idx - 1], cdf[idx]);
    let (t0, t1) = (points[idx - 1], points[idx]);
    if f1 <= f0 {
        return t1;
    }
    t0 + (p - f0) / (f1 - f0) * (t1 - t0)
}
