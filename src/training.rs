//! Multi-sweep MCMC runs with callbacks.

use crate::error::Result;
use crate::model::MvRegCopulaDataImputer;
use ndarray::{Array1, Array2};
use std::time::Instant;
use tracing::info;

/// Settings for a run of Gibbs sweeps.
#[derive(Debug, Clone)]
pub struct McmcConfig {
    /// Number of sweeps.
    pub niter: usize,
    /// Leading sweeps treated as burn-in. Callbacks still see them.
    pub burn: usize,
    /// Log start and end of the run at info level.
    pub verbose: bool,
}

impl Default for McmcConfig {
    fn default() -> Self {
        Self {
            niter: 1000,
            burn: 100,
            verbose: true,
        }
    }
}

impl McmcConfig {
    pub fn new(niter: usize, burn: usize) -> Self {
        Self {
            niter,
            burn,
            ..Default::default()
        }
    }
}

/// Parameter snapshot handed to callbacks after every sweep.
#[derive(Debug, Clone)]
pub struct SweepSummary {
    /// Zero-based sweep index within the run.
    pub iteration: usize,
    /// True while the sweep is part of the burn-in.
    pub burn_in: bool,
    pub coefficients: Array2<f64>,
    pub residual_variance: Array2<f64>,
    pub mixing_weights: Array1<f64>,
    /// Rows per cluster after the sweep.
    pub occupancy: Array1<f64>,
}

impl SweepSummary {
    fn capture(imputer: &MvRegCopulaDataImputer, iteration: usize, burn: usize) -> Self {
        Self {
            iteration,
            burn_in: iteration < burn,
            coefficients: imputer.coefficients().clone(),
            residual_variance: imputer.residual_variance().clone(),
            mixing_weights: imputer.mixing_weights().clone(),
            occupancy: imputer.cluster_occupancy(),
        }
    }
}

/// Outcome of a run.
#[derive(Debug, Clone)]
pub struct McmcResult {
    /// Sweeps completed.
    pub n_iterations: usize,
    /// Whether a callback stopped the run.
    pub stopped_early: bool,
}

/// Action requested by a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Continue,
    Stop,
}

/// Hook into a multi-sweep run.
///
/// # Example
///
/// ```rust,ignore
/// use mvimpute::training::{CallbackAction, SweepCallback, SweepSummary};
///
/// struct StopWhenSettled;
///
/// impl SweepCallback for StopWhenSettled {
///     fn on_sweep_end(&mut self, _iteration: usize, summary: &SweepSummary) -> CallbackAction {
///         if summary.mixing_weights.iter().all(|&w| w > 0.05) {
///             CallbackAction::Stop
///         } else {
///             CallbackAction::Continue
///         }
///     }
/// }
/// ```
pub trait SweepCallback: Send {
    fn on_training_start(&mut self, _niter: usize) {}

    fn on_sweep_end(&mut self, iteration: usize, summary: &SweepSummary) -> CallbackAction;

    fn on_training_end(&mut self, _n_iterations: usize) {}

    fn name(&self) -> &str {
        "SweepCallback"
    }
}

/// Records post-burn-in draws of the coefficients and mixing weights.
#[derive(Debug, Clone, Default)]
pub struct HistoryCallback {
    pub coefficients: Vec<Array2<f64>>,
    pub residual_variances: Vec<Array2<f64>>,
    pub mixing_weights: Vec<Array1<f64>>,
}

impl HistoryCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.coefficients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coefficients.is_empty()
    }

    /// Average of the recorded coefficient draws, or `None` if nothing was recorded.
    pub fn posterior_mean_coefficients(&self) -> Option<Array2<f64>> {
        let first = self.coefficients.first()?;
        let mut sum = Array2::<f64>::zeros(first.dim());
        for draw in &self.coefficients {
            sum += draw;
        }
        Some(sum / self.coefficients.len() as f64)
    }
}

impl SweepCallback for HistoryCallback {
    fn on_training_start(&mut self, _niter: usize) {
        self.coefficients.clear();
        self.residual_variances.clear();
        self.mixing_weights.clear();
    }

    fn on_sweep_end(&mut self, _iteration: usize, summary: &SweepSummary) -> CallbackAction {
        if !summary.burn_in {
            self.coefficients.push(summary.coefficients.clone());
            self.residual_variances
                .push(summary.residual_variance.clone());
            self.mixing_weights.push(summary.mixing_weights.clone());
        }
        CallbackAction::Continue
    }

    fn name(&self) -> &str {
        "HistoryCallback"
    }
}

/// Logs progress through `tracing` every `log_every` sweeps.
#[derive(Debug, Clone)]
pub struct LogCallback {
    pub log_every: usize,
}

impl Default for LogCallback {
    fn default() -> Self {
        Self { log_every: 100 }
    }
}

impl SweepCallback for LogCallback {
    fn on_sweep_end(&mut self, iteration: usize, summary: &SweepSummary) -> CallbackAction {
        if iteration % self.log_every.max(1) == 0 {
            info!(
                iteration,
                burn_in = summary.burn_in,
                weights = ?summary.mixing_weights,
                occupancy = ?summary.occupancy,
                "mcmc progress"
            );
        }
        CallbackAction::Continue
    }

    fn name(&self) -> &str {
        "LogCallback"
    }
}

/// Runs several callbacks in order. Stops if any of them asks to.
#[derive(Default)]
pub struct CallbackList {
    callbacks: Vec<Box<dyn SweepCallback>>,
}

impl CallbackList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<C: SweepCallback + 'static>(mut self, callback: C) -> Self {
        self.callbacks.push(Box::new(callback));
        self
    }
}

impl SweepCallback for CallbackList {
    fn on_training_start(&mut self, niter: usize) {
        for cb in &mut self.callbacks {
            cb.on_training_start(niter);
        }
    }

    fn on_sweep_end(&mut self, iteration: usize, summary: &SweepSummary) -> CallbackAction {
        let mut action = CallbackAction::Continue;
        for cb in &mut self.callbacks {
            if cb.on_sweep_end(iteration, summary) == CallbackAction::Stop {
                action = CallbackAction::Stop;
            }
        }
        action
    }

    fn on_training_end(&mut self, n_iterations: usize) {
        for cb in &mut self.callbacks {
            cb.on_training_end(n_iterations);
        }
    }

    fn name(&self) -> &str {
        "CallbackList"
    }
}

impl MvRegCopulaDataImputer {
    /// Run `config.niter` sweeps of `sample_posterior`.
    pub fn train(&mut self, config: &McmcConfig) -> Result<McmcResult> {
        self.train_with_callbacks(config, None::<&mut HistoryCallback>)
    }

    /// Run `config.niter` sweeps, calling `callback` after each one.
    pub fn train_with_callbacks<C: SweepCallback>(
        &mut self,
        config: &McmcConfig,
        mut callback: Option<&mut C>,
    ) -> Result<McmcResult> {
        let start = Instant::now();
        if config.verbose {
            info!(
                niter = config.niter,
                burn = config.burn,
                rows = self.num_observations(),
                "starting mcmc"
            );
        }
        if let Some(cb) = callback.as_deref_mut() {
            cb.on_training_start(config.niter);
        }

        let mut completed = 0;
        let mut stopped_early = false;
        for iteration in 0..config.niter {
            self.sample_posterior()?;
            completed += 1;
            if let Some(cb) = callback.as_deref_mut() {
                let summary = SweepSummary::capture(self, iteration, config.burn);
                if cb.on_sweep_end(iteration, &summary) == CallbackAction::Stop {
                    stopped_early = true;
                    break;
                }
            }
        }

        if let Some(cb) = callback.as_deref_mut() {
            cb.on_training_end(completed);
        }
        if config.verbose {
            info!(
                sweeps = completed,
                stopped_early,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "mcmc finished"
            );
        }
        Ok(McmcResult {
            n_iterations: completed,
            stopped_early,
        })
    }
}
