use crate::atoms::{AtomModel, AtomPrior};
use crate::clusters::ClusterModel;
use crate::copula::{CellValue, CopulaTransform};
use crate::distributions::empirical::{DEFAULT_BUFFER_SIZE, DEFAULT_GRID_SIZE};
use crate::distributions::mvn::conditional_draw;
use crate::distributions::{EmpiricalDistribution, EmpiricalDistributionState};
use crate::error::{ImputerError, Result};
use crate::regression::{MvRegModel, RegressionPrior};
use crate::sampler::PosteriorSampler;
use crate::types::{Observation, RowState};
use crate::utils::sample_log_categorical;
use crate::workers::{SweepContext, WorkerPool, fill_cluster_log_probs};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use tracing::{debug, info};

/// Construction-time settings of an imputer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImputerConfig {
    /// Number of latent error-pattern clusters.
    pub num_clusters: usize,
    /// Atoms of each response variable, in order. Its length is `ydim`.
    pub atoms: Vec<Vec<f64>>,
    /// Number of predictors.
    pub xdim: usize,
    /// Seed of the driver's random stream.
    pub seed: u64,
    /// Number of worker threads used by `sample_posterior`.
    pub nworkers: usize,
    /// Buffer size of each empirical distribution.
    pub ecdf_buffer_size: usize,
    /// Grid size of each empirical distribution.
    pub ecdf_grid_size: usize,
}

impl Default for ImputerConfig {
    fn default() -> Self {
        Self {
            num_clusters: 1,
            atoms: vec![Vec::new()],
            xdim: 1,
            seed: 0,
            nworkers: 1,
            ecdf_buffer_size: DEFAULT_BUFFER_SIZE,
            ecdf_grid_size: DEFAULT_GRID_SIZE,
        }
    }
}

impl ImputerConfig {
    pub fn new(num_clusters: usize, atoms: Vec<Vec<f64>>, xdim: usize) -> Self {
        Self {
            num_clusters,
            atoms,
            xdim,
            ..Default::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_nworkers(mut self, nworkers: usize) -> Self {
        self.nworkers = nworkers;
        self
    }

    pub fn with_ecdf_buffer_size(mut self, size: usize) -> Self {
        self.ecdf_buffer_size = size;
        self
    }

    pub fn with_ecdf_grid_size(mut self, size: usize) -> Self {
        self.ecdf_grid_size = size;
        self
    }

    pub fn ydim(&self) -> usize {
        self.atoms.len()
    }

    fn validate(&self) -> Result<()> {
        if self.num_clusters == 0 {
            return Err(ImputerError::InvalidParameter(
                "num_clusters must be at least 1".to_string(),
            ));
        }
        if self.atoms.is_empty() {
            return Err(ImputerError::InvalidParameter(
                "atoms must list at least one response variable".to_string(),
            ));
        }
        if self.xdim == 0 {
            return Err(ImputerError::InvalidParameter(
                "xdim must be at least 1".to_string(),
            ));
        }
        if self.nworkers == 0 {
            return Err(ImputerError::InvalidParameter(
                "nworkers must be at least 1".to_string(),
            ));
        }
        for (j, atoms) in self.atoms.iter().enumerate() {
            if let Some(a) = atoms.iter().find(|a| !a.is_finite()) {
                return Err(ImputerError::InvalidParameter(format!(
                    "atom {} of variable {} is not finite",
                    a, j
                )));
            }
        }
        Ok(())
    }
}

/// Everything `save` writes. Training rows are not persisted.
#[derive(Serialize, Deserialize)]
struct ImputerState {
    config: ImputerConfig,
    copulas: Vec<CopulaTransform>,
    atom_priors: Vec<AtomPrior>,
    atom_models: Vec<Vec<AtomModel>>,
    clusters: ClusterModel,
    regression: MvRegModel,
    iteration: usize,
}

/// Bayesian imputer for multivariate data with missing values and atoms.
///
/// Response variables are linked through a multivariate regression on the
/// copula scale. Each row belongs to one of `num_clusters` latent clusters,
/// and each cluster has its own probabilities that each atom is the true
/// value and that a value is recorded as an atom by mistake.
///
/// `add_data` and `sample_posterior` take `&mut self`, `impute_data_set`
/// takes `&self`. Share an imputer between threads behind a `RwLock`.
///
/// # Example
///
/// ```ignore
/// use mvimpute::prelude::*;
///
/// let mut imputer = MvRegCopulaDataImputer::new(2, vec![vec![0.0]], 1, 42)?;
/// imputer.add_data(Observation::from_slices(&[1.0], &[3.2])?)?;
/// imputer.add_data(Observation::from_slices(&[1.0], &[0.0])?)?;
/// for _ in 0..100 {
///     imputer.sample_posterior()?;
/// }
/// let completed = imputer.impute_data_set(&rows, 7)?;
/// ```
#[derive(Debug)]
pub struct MvRegCopulaDataImputer {
    config: ImputerConfig,
    observations: Vec<Observation>,
    rows: Vec<RowState>,
    copulas: Vec<CopulaTransform>,
    atom_priors: Vec<AtomPrior>,
    /// Indexed `[cluster][variable]`.
    atom_models: Vec<Vec<AtomModel>>,
    clusters: ClusterModel,
    regression: MvRegModel,
    pool: WorkerPool,
    rng: ChaCha8Rng,
    iteration: usize,
}

impl MvRegCopulaDataImputer {
    /// Imputer with `num_clusters` clusters, the given atoms per response
    /// variable, `xdim` predictors and a single worker.
    pub fn new(num_clusters: usize, atoms: Vec<Vec<f64>>, xdim: usize, seed: u64) -> Result<Self> {
        Self::with_config(ImputerConfig::new(num_clusters, atoms, xdim).with_seed(seed))
    }

    pub fn with_config(config: ImputerConfig) -> Result<Self> {
        config.validate()?;
        let ydim = config.ydim();
        let copulas = config
            .atoms
            .iter()
            .map(|atoms| {
                CopulaTransform::new(
                    atoms.clone(),
                    EmpiricalDistribution::with_grid_size(
                        config.ecdf_grid_size,
                        config.ecdf_buffer_size,
                    ),
                )
            })
            .collect();
        let atom_priors: Vec<AtomPrior> = config
            .atoms
            .iter()
            .map(|atoms| AtomPrior::default_for(atoms.len()))
            .collect();
        let atom_models = vec![
            atom_priors.iter().map(AtomModel::new).collect::<Vec<_>>();
            config.num_clusters
        ];
        let pool = Self::build_pool(&config, config.nworkers)?;
        info!(
            nclusters = config.num_clusters,
            xdim = config.xdim,
            ydim,
            nworkers = config.nworkers,
            "imputer created"
        );
        Ok(Self {
            clusters: ClusterModel::new(config.num_clusters)?,
            regression: MvRegModel::new(config.xdim, ydim),
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            observations: Vec::new(),
            rows: Vec::new(),
            copulas,
            atom_priors,
            atom_models,
            pool,
            iteration: 0,
            config,
        })
    }

    fn build_pool(config: &ImputerConfig, nworkers: usize) -> Result<WorkerPool> {
        let atoms_per_variable: Vec<usize> = config.atoms.iter().map(Vec::len).collect();
        WorkerPool::new(nworkers, config.num_clusters, config.xdim, &atoms_per_variable)
    }

    pub fn config(&self) -> &ImputerConfig {
        &self.config
    }

    pub fn xdim(&self) -> usize {
        self.config.xdim
    }

    pub fn ydim(&self) -> usize {
        self.config.ydim()
    }

    pub fn nclusters(&self) -> usize {
        self.config.num_clusters
    }

    pub fn atoms(&self) -> &[Vec<f64>] {
        &self.config.atoms
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    /// Number of completed `sample_posterior` sweeps.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn nworkers(&self) -> usize {
        self.pool.nworkers()
    }

    fn check_row_shape(&self, obs: &Observation) -> Result<()> {
        if obs.xdim() != self.xdim() || obs.ydim() != self.ydim() {
            return Err(ImputerError::shape(
                format!("x of length {}, y of length {}", self.xdim(), self.ydim()),
                format!("x of length {}, y of length {}", obs.xdim(), obs.ydim()),
            ));
        }
        Ok(())
    }

    fn check_cluster(&self, cluster: usize) -> Result<()> {
        if cluster >= self.nclusters() {
            return Err(ImputerError::IndexOutOfRange {
                what: "cluster",
                index: cluster,
                limit: self.nclusters(),
            });
        }
        Ok(())
    }

    fn check_variable(&self, variable: usize) -> Result<()> {
        if variable >= self.ydim() {
            return Err(ImputerError::IndexOutOfRange {
                what: "variable",
                index: variable,
                limit: self.ydim(),
            });
        }
        Ok(())
    }

    /// Add a training row. Continuous responses feed the empirical marginals.
    pub fn add_data(&mut self, obs: Observation) -> Result<()> {
        self.check_row_shape(&obs)?;
        for (copula, &v) in self.copulas.iter_mut().zip(obs.y().iter()) {
            if !v.is_nan() && copula.atom_index(v).is_none() {
                copula.marginal_mut().add(v);
            }
        }
        self.rows.push(RowState::new(&obs));
        self.observations.push(obs);
        Ok(())
    }

    // ---- priors ----

    pub fn set_default_priors(&mut self) {
        self.set_default_regression_prior();
        self.set_default_prior_for_mixing_weights();
        for (prior, atoms) in self.atom_priors.iter_mut().zip(&self.config.atoms) {
            *prior = AtomPrior::default_for(atoms.len());
        }
    }

    pub fn set_default_regression_prior(&mut self) {
        self.regression.set_default_prior();
    }

    pub fn set_default_prior_for_mixing_weights(&mut self) {
        self.clusters.set_default_prior();
    }

    pub fn set_regression_prior(&mut self, prior: RegressionPrior) -> Result<()> {
        self.regression.set_prior(prior)
    }

    pub fn regression_prior(&self) -> &RegressionPrior {
        self.regression.prior()
    }

    pub fn set_mixing_weight_prior(&mut self, counts: &ArrayView1<f64>) -> Result<()> {
        self.clusters.set_prior(counts)
    }

    /// Prior counts on the true level of `variable`, shared by every cluster.
    ///
    /// `counts` has one entry per atom plus one for the continuous level.
    /// A negative count asserts that the level is never the true value, so a
    /// recorded atom with a negative count is always imputed as an error.
    /// Every cluster's `atom_probs` for the variable restart at the prior mean.
    pub fn set_atom_prior(&mut self, counts: &ArrayView1<f64>, variable: usize) -> Result<()> {
        self.check_variable(variable)?;
        self.atom_priors[variable].set_atom_counts(counts)?;
        let start = AtomModel::new(&self.atom_priors[variable]);
        for models in &mut self.atom_models {
            models[variable].set_atom_probs(&start.atom_probs().view())?;
        }
        Ok(())
    }

    /// Prior counts on the atom-error matrix of `variable`.
    ///
    /// The matrix is `(k + 1) × (k + 1)` for `k` atoms, indexed
    /// `[true level, recorded level]`. Every cluster's `atom_error_probs` for
    /// the variable restart at the prior mean.
    pub fn set_atom_error_prior(&mut self, counts: &ArrayView2<f64>, variable: usize) -> Result<()> {
        self.check_variable(variable)?;
        self.atom_priors[variable].set_error_counts(counts)?;
        let start = AtomModel::new(&self.atom_priors[variable]);
        for models in &mut self.atom_models {
            models[variable].set_atom_error_probs(&start.atom_error_probs().view())?;
        }
        Ok(())
    }

    pub fn atom_prior(&self, variable: usize) -> Result<&AtomPrior> {
        self.check_variable(variable)?;
        Ok(&self.atom_priors[variable])
    }

    // ---- training ----

    /// Run one Gibbs sweep.
    ///
    /// Flushes the empirical marginals, redraws every row's cluster, atom
    /// levels and latent copula values in the worker pool, then draws the
    /// regression, the atom probabilities and the mixing weights from their
    /// full conditionals. An error leaves the parameters of the failed step
    /// and those after it unchanged.
    pub fn sample_posterior(&mut self) -> Result<()> {
        for copula in &mut self.copulas {
            copula.marginal_mut().update_cdf();
        }

        let seeds: Vec<u64> = (0..self.pool.nworkers())
            .map(|_| self.rng.random())
            .collect();
        let ctx = SweepContext {
            observations: &self.observations,
            copulas: &self.copulas,
            atom_models: &self.atom_models,
            clusters: &self.clusters,
            regression: &self.regression,
        };
        let totals = self.pool.run_sweep(&ctx, &mut self.rows, &seeds)?;

        self.regression.draw(&totals.suf, &mut self.rng)?;
        for (models, counts) in self.atom_models.iter_mut().zip(&totals.atom_counts) {
            for ((model, prior), count) in models.iter_mut().zip(&self.atom_priors).zip(counts) {
                model.draw(prior, count, &mut self.rng)?;
            }
        }
        self.clusters.draw(&totals.occupancy.view(), &mut self.rng)?;

        self.iteration += 1;
        debug!(
            iteration = self.iteration,
            weights = ?self.clusters.weights(),
            "sweep complete"
        );
        Ok(())
    }

    /// Rebuild the worker pool with `nworkers` threads.
    pub fn setup_worker_pool(&mut self, nworkers: usize) -> Result<()> {
        self.pool = Self::build_pool(&self.config, nworkers)?;
        self.config.nworkers = nworkers;
        Ok(())
    }

    // ---- imputation ----

    /// Draw a completed version of each row from the posterior predictive
    /// distribution under the current parameters.
    ///
    /// Observed continuous values are returned unchanged. Recorded atoms are
    /// kept or replaced according to the atom and atom-error probabilities,
    /// and missing values are filled in. Before any call to
    /// `sample_posterior` the draws use the initial parameters and the data
    /// added so far.
    ///
    /// Fails with `InvalidInput` when a continuous value must be transformed
    /// for a variable that has no continuous data at all.
    pub fn impute_data_set(&self, rows: &[Observation], seed: u64) -> Result<Array2<f64>> {
        let ydim = self.ydim();
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut out = Array2::<f64>::zeros((rows.len(), ydim));

        // Marginals holding only buffered values are merged into a private copy.
        let copulas: Vec<Cow<'_, CopulaTransform>> = self
            .copulas
            .iter()
            .map(|copula| {
                if copula.marginal().is_empty() && copula.marginal().buffered() > 0 {
                    let mut merged = copula.clone();
                    merged.marginal_mut().update_cdf();
                    Cow::Owned(merged)
                } else {
                    Cow::Borrowed(copula)
                }
            })
            .collect();

        let mut log_probs = vec![0.0; self.nclusters()];
        let mut recorded = vec![None; ydim];
        let mut true_level = vec![0usize; ydim];
        let mut free = vec![false; ydim];
        let max_levels = self.atoms().iter().map(|a| a.len() + 1).max().unwrap_or(1);
        let mut level_weights = vec![0.0; max_levels];

        for (i, obs) in rows.iter().enumerate() {
            self.check_row_shape(obs)?;
            let y = obs.y();
            for (j, copula) in copulas.iter().enumerate() {
                recorded[j] = copula.observed_level(y[j]);
            }
            fill_cluster_log_probs(&self.clusters, &self.atom_models, &recorded, &mut log_probs);
            let cluster = sample_log_categorical(&mut log_probs, rng.random()).ok_or_else(|| {
                ImputerError::Numerical(format!("row {}: every cluster has zero probability", i))
            })?;

            let models = &self.atom_models[cluster];
            let mut latent = Array1::<f64>::zeros(ydim);
            for (j, copula) in copulas.iter().enumerate() {
                let model = &models[j];
                match copula.classify(y[j]) {
                    CellValue::Continuous(score) => {
                        if score.is_nan() {
                            return Err(empty_marginal(j));
                        }
                        latent[j] = score;
                        free[j] = false;
                    }
                    CellValue::Atom(m) => {
                        let weights = &mut level_weights[..=copula.continuous_level()];
                        true_level[j] =
                            model.draw_true_level(m, rng.random(), weights).ok_or_else(|| {
                                ImputerError::Numerical(format!(
                                    "row {}: no level of variable {} can be recorded as atom {}",
                                    i, j, m
                                ))
                            })?;
                        free[j] = true;
                    }
                    CellValue::Missing => {
                        true_level[j] = model.draw_level(rng.random()).ok_or_else(|| {
                            ImputerError::Numerical(format!(
                                "atom probabilities of variable {} are all zero",
                                j
                            ))
                        })?;
                        free[j] = true;
                    }
                }
            }

            let mean = self.regression.predict(&obs.x().view());
            conditional_draw(
                &mean.view(),
                &self.regression.sigma().view(),
                &mut latent,
                &free,
                &mut rng,
            )?;

            let mut row = out.row_mut(i);
            for (j, copula) in copulas.iter().enumerate() {
                row[j] = if !free[j] {
                    y[j]
                } else if let Some(atom) = copula.atom_value(true_level[j]) {
                    atom
                } else {
                    if copula.marginal().is_empty() {
                        return Err(empty_marginal(j));
                    }
                    copula.decode(latent[j])
                };
            }
        }
        Ok(out)
    }

    /// The training rows as completed by the most recent sweep.
    ///
    /// Before the first sweep this is the raw data, with NaN for missing values.
    pub fn imputed_data(&self) -> Array2<f64> {
        let mut out = Array2::<f64>::zeros((self.rows.len(), self.ydim()));
        for (mut row, state) in out.axis_iter_mut(Axis(0)).zip(&self.rows) {
            row.assign(&state.completed);
        }
        out
    }

    // ---- parameters ----

    /// Regression coefficients `Beta` (`ydim × xdim`).
    pub fn coefficients(&self) -> &Array2<f64> {
        self.regression.beta()
    }

    pub fn set_coefficients(&mut self, beta: &ArrayView2<f64>) -> Result<()> {
        self.regression.set_beta(beta)
    }

    /// Residual covariance `Sigma` on the copula scale.
    pub fn residual_variance(&self) -> &Array2<f64> {
        self.regression.sigma()
    }

    pub fn set_residual_variance(&mut self, sigma: &ArrayView2<f64>) -> Result<()> {
        self.regression.set_sigma(sigma)
    }

    pub fn mixing_weights(&self) -> &Array1<f64> {
        self.clusters.weights()
    }

    pub fn atom_probs(&self, cluster: usize, variable: usize) -> Result<&Array1<f64>> {
        self.check_cluster(cluster)?;
        self.check_variable(variable)?;
        Ok(self.atom_models[cluster][variable].atom_probs())
    }

    pub fn set_atom_probs(
        &mut self,
        cluster: usize,
        variable: usize,
        probs: &ArrayView1<f64>,
    ) -> Result<()> {
        self.check_cluster(cluster)?;
        self.check_variable(variable)?;
        self.atom_models[cluster][variable].set_atom_probs(probs)
    }

    pub fn atom_error_probs(&self, cluster: usize, variable: usize) -> Result<&Array2<f64>> {
        self.check_cluster(cluster)?;
        self.check_variable(variable)?;
        Ok(self.atom_models[cluster][variable].atom_error_probs())
    }

    pub fn set_atom_error_probs(
        &mut self,
        cluster: usize,
        variable: usize,
        probs: &ArrayView2<f64>,
    ) -> Result<()> {
        self.check_cluster(cluster)?;
        self.check_variable(variable)?;
        self.atom_models[cluster][variable].set_atom_error_probs(probs)
    }

    /// Current cluster of each training row.
    pub fn cluster_assignments(&self) -> Vec<usize> {
        self.rows.iter().map(|r| r.cluster).collect()
    }

    /// Number of training rows currently in each cluster.
    pub fn cluster_occupancy(&self) -> Array1<f64> {
        let mut counts = Array1::<f64>::zeros(self.nclusters());
        for row in &self.rows {
            counts[row.cluster] += 1.0;
        }
        counts
    }

    pub fn empirical_distributions(&self) -> Vec<EmpiricalDistributionState> {
        self.copulas
            .iter()
            .map(|c| c.marginal().save_state())
            .collect()
    }

    pub fn set_empirical_distributions(
        &mut self,
        states: Vec<EmpiricalDistributionState>,
    ) -> Result<()> {
        if states.len() != self.ydim() {
            return Err(ImputerError::shape(
                format!("{} empirical distributions", self.ydim()),
                format!("{} empirical distributions", states.len()),
            ));
        }
        let marginals = states
            .into_iter()
            .map(EmpiricalDistribution::from_state)
            .collect::<Result<Vec<_>>>()?;
        for (copula, marginal) in self.copulas.iter_mut().zip(marginals) {
            *copula.marginal_mut() = marginal;
        }
        Ok(())
    }

    /// Log prior density of the current parameters: regression, mixing
    /// weights and every cluster's atom tables.
    pub fn log_prior(&self) -> Result<f64> {
        let mut total = self.regression.log_prior()?;
        total += self.clusters.log_prior()?;
        for models in &self.atom_models {
            for (model, prior) in models.iter().zip(&self.atom_priors) {
                total += model.log_prior(prior)?;
            }
        }
        Ok(total)
    }

    // ---- persistence ----

    /// Save configuration, priors, parameters and empirical distributions.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let state = ImputerState {
            config: self.config.clone(),
            copulas: self.copulas.clone(),
            atom_priors: self.atom_priors.clone(),
            atom_models: self.atom_models.clone(),
            clusters: self.clusters.clone(),
            regression: self.regression.clone(),
            iteration: self.iteration,
        };
        let state_bytes = bincode::serialize(&state)?;

        let mut file = File::create(path)?;
        let state_len = state_bytes.len() as u64;
        file.write_all(&state_len.to_le_bytes())?;
        file.write_all(&state_bytes)?;
        Ok(())
    }

    /// Load a model written by [`save`](Self::save).
    ///
    /// The loaded imputer has no training rows. Its random stream is
    /// re-seeded from the saved seed and sweep count.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut state_len_bytes = [0u8; 8];
        file.read_exact(&mut state_len_bytes)?;
        let state_len = u64::from_le_bytes(state_len_bytes);
        if state_len > file_len.saturating_sub(8) {
            return Err(ImputerError::SerializationError(format!(
                "state length {} exceeds the {} bytes left in the file",
                state_len,
                file_len.saturating_sub(8)
            )));
        }
        let mut state_bytes = vec![0u8; state_len as usize];
        file.read_exact(&mut state_bytes)?;
        let state: ImputerState = bincode::deserialize(&state_bytes)?;

        state.config.validate()?;
        let pool = Self::build_pool(&state.config, state.config.nworkers)?;
        let rng = ChaCha8Rng::seed_from_u64(state.config.seed.wrapping_add(state.iteration as u64));
        Ok(Self {
            observations: Vec::new(),
            rows: Vec::new(),
            copulas: state.copulas,
            atom_priors: state.atom_priors,
            atom_models: state.atom_models,
            clusters: state.clusters,
            regression: state.regression,
            pool,
            rng,
            iteration: state.iteration,
            config: state.config,
        })
    }
}

fn empty_marginal(variable: usize) -> ImputerError {
    ImputerError::InvalidInput(format!(
        "variable {} has no continuous data in its empirical distribution",
        variable
    ))
}
