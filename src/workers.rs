//! Fixed-size worker pool for the per-row half of a Gibbs sweep.
//!
//! Rows are split into contiguous blocks, one per worker. Each worker owns a
//! preallocated [`WorkerAccumulator`] and the mutable latent state of its
//! block, and reads the model parameters through a shared [`SweepContext`].
//! After the parallel phase the driver reduces the accumulators in worker
//! order, so a given seed and worker count always produce the same draws.

use crate::atoms::{AtomCounts, AtomModel};
use crate::clusters::ClusterModel;
use crate::copula::{CellValue, CopulaTransform};
use crate::distributions::mvn::gibbs_update_free;
use crate::error::{ImputerError, Result};
use crate::regression::{MvRegModel, RegressionSuf};
use crate::types::{Observation, RowState};
use crate::utils::sample_log_categorical;
use ndarray::Array1;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::ThreadPool;
use rayon::prelude::*;
use std::ops::Range;
use tracing::{debug, info};

/// Read-only view of everything a worker needs during one sweep.
#[derive(Clone, Copy)]
pub struct SweepContext<'a> {
    pub observations: &'a [Observation],
    pub copulas: &'a [CopulaTransform],
    /// Indexed `[cluster][variable]`.
    pub atom_models: &'a [Vec<AtomModel>],
    pub clusters: &'a ClusterModel,
    pub regression: &'a MvRegModel,
}

/// Statistics gathered by one worker, plus its scratch space.
#[derive(Debug, Clone)]
pub struct WorkerAccumulator {
    pub suf: RegressionSuf,
    /// Indexed `[cluster][variable]`.
    pub atom_counts: Vec<Vec<AtomCounts>>,
    pub occupancy: Array1<f64>,
    log_probs: Vec<f64>,
    mean: Vec<f64>,
    free: Vec<bool>,
    recorded: Vec<Option<usize>>,
    true_level: Vec<usize>,
    level_weights: Vec<f64>,
}

impl WorkerAccumulator {
    pub fn new(nclusters: usize, xdim: usize, atoms_per_variable: &[usize]) -> Self {
        let ydim = atoms_per_variable.len();
        let max_levels = atoms_per_variable.iter().max().map_or(1, |k| k + 1);
        let atom_counts = (0..nclusters)
            .map(|_| atoms_per_variable.iter().map(|&k| AtomCounts::new(k)).collect())
            .collect();
        Self {
            suf: RegressionSuf::new(xdim, ydim),
            atom_counts,
            occupancy: Array1::zeros(nclusters),
            log_probs: vec![0.0; nclusters],
            mean: vec![0.0; ydim],
            free: vec![false; ydim],
            recorded: vec![None; ydim],
            true_level: vec![0; ydim],
            level_weights: vec![0.0; max_levels],
        }
    }

    pub fn clear(&mut self) {
        self.suf.clear();
        self.atom_counts
            .iter_mut()
            .flatten()
            .for_each(AtomCounts::clear);
        self.occupancy.fill(0.0);
    }

    /// Add another accumulator's statistics. Scratch space is ignored.
    pub fn combine(&mut self, other: &WorkerAccumulator) {
        self.suf.combine(&other.suf);
        for (mine, theirs) in self
            .atom_counts
            .iter_mut()
            .flatten()
            .zip(other.atom_counts.iter().flatten())
        {
            mine.combine(theirs);
        }
        self.occupancy += &other.occupancy;
    }

    /// Run one sweep over a block of rows starting at observation `offset`.
    fn process_block(
        &mut self,
        ctx: &SweepContext<'_>,
        rows: &mut [RowState],
        offset: usize,
        seed: u64,
    ) -> Result<()> {
        self.clear();
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        for (i, state) in rows.iter_mut().enumerate() {
            self.process_row(ctx, &ctx.observations[offset + i], state, &mut rng)
                .map_err(|e| match e {
                    ImputerError::Numerical(msg) => {
                        ImputerError::Numerical(format!("row {}: {}", offset + i, msg))
                    }
                    other => other,
                })?;
        }
        Ok(())
    }

    fn process_row<R: Rng + ?Sized>(
        &mut self,
        ctx: &SweepContext<'_>,
        obs: &Observation,
        state: &mut RowState,
        rng: &mut R,
    ) -> Result<()> {
        let y = obs.y();
        for (j, copula) in ctx.copulas.iter().enumerate() {
            self.recorded[j] = copula.observed_level(y[j]);
        }

        fill_cluster_log_probs(ctx.clusters, ctx.atom_models, &self.recorded, &mut self.log_probs);
        let cluster = sample_log_categorical(&mut self.log_probs, rng.random()).ok_or_else(|| {
            ImputerError::Numerical("every cluster has zero probability".to_string())
        })?;
        state.cluster = cluster;
        self.occupancy[cluster] += 1.0;

        let models = &ctx.atom_models[cluster];
        for (j, copula) in ctx.copulas.iter().enumerate() {
            let model = &models[j];
            let counts = &mut self.atom_counts[cluster][j];
            let continuous = copula.continuous_level();
            match copula.classify(y[j]) {
                CellValue::Continuous(score) => {
                    counts.record(continuous, continuous);
                    state.latent[j] = score;
                    self.free[j] = false;
                    self.true_level[j] = continuous;
                }
                CellValue::Atom(m) => {
                    let weights = &mut self.level_weights[..=continuous];
                    let t = model
                        .draw_true_level(m, rng.random(), weights)
                        .ok_or_else(|| zero_row_error("recorded atom", m))?;
                    counts.record(t, m);
                    self.free[j] = true;
                    self.true_level[j] = t;
                }
                CellValue::Missing => {
                    self.true_level[j] = model
                        .draw_level(rng.random())
                        .ok_or_else(|| zero_row_error("atom", j))?;
                    self.free[j] = true;
                }
            }
        }

        ctx.regression.predict_into(&obs.x().view(), &mut self.mean);
        if let Some(latent) = state.latent.as_slice_mut() {
            gibbs_update_free(
                &self.mean,
                &ctx.regression.sigma_precision().view(),
                latent,
                &self.free,
                rng,
            );
        }

        for (j, copula) in ctx.copulas.iter().enumerate() {
            if !self.free[j] {
                state.completed[j] = y[j];
            } else {
                state.completed[j] = match copula.atom_value(self.true_level[j]) {
                    Some(atom) => atom,
                    None => copula.decode(state.latent[j]),
                };
            }
        }

        self.suf.add(&obs.x().view(), &state.latent.view());
        Ok(())
    }
}

fn zero_row_error(what: &str, index: usize) -> ImputerError {
    ImputerError::Numerical(format!("{} probabilities for index {} are all zero", what, index))
}

/// Unnormalised log posterior of each cluster given the recorded levels.
///
/// A recorded level contributes `ln Σ_t atom_probs[t] · atom_error_probs[t, level]`.
///
/// Missing cells (`None`) contribute nothing. The copula-scale normal density
/// is the same in every cluster and is left out.
pub(crate) fn fill_cluster_log_probs(
    clusters: &ClusterModel,
    atom_models: &[Vec<AtomModel>],
    recorded: &[Option<usize>],
    out: &mut [f64],
) {
    for ((lp, log_w), models) in out.iter_mut().zip(clusters.log_weights()).zip(atom_models) {
        *lp = log_w;
        for (level, model) in recorded.iter().zip(models) {
            if let Some(level) = *level {
                *lp += model.log_prob_recorded(level);
            }
        }
    }
}

/// Contiguous row ranges for `nworkers` workers.
///
/// Worker `w` gets `n / nworkers` rows, plus one more if `w < n % nworkers`.
pub fn partition(n: usize, nworkers: usize) -> Vec<Range<usize>> {
    let nworkers = nworkers.max(1);
    let q = n / nworkers;
    let r = n % nworkers;
    (0..nworkers)
        .map(|w| {
            let start = w * q + w.min(r);
            let len = q + usize::from(w < r);
            start..start + len
        })
        .collect()
}

/// A rayon thread pool with one accumulator slot per worker.
pub struct WorkerPool {
    pool: ThreadPool,
    accumulators: Vec<WorkerAccumulator>,
    totals: WorkerAccumulator,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("nworkers", &self.nworkers())
            .finish()
    }
}

impl WorkerPool {
    pub fn new(
        nworkers: usize,
        nclusters: usize,
        xdim: usize,
        atoms_per_variable: &[usize],
    ) -> Result<Self> {
        if nworkers == 0 {
            return Err(ImputerError::InvalidParameter(
                "nworkers must be at least 1".to_string(),
            ));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(nworkers)
            .thread_name(|i| format!("mvimpute-worker-{}", i))
            .build()?;
        info!(nworkers, "worker pool ready");
        let slot = WorkerAccumulator::new(nclusters, xdim, atoms_per_variable);
        Ok(Self {
            pool,
            accumulators: vec![slot.clone(); nworkers],
            totals: slot,
        })
    }

    pub fn nworkers(&self) -> usize {
        self.accumulators.len()
    }

    /// Run the per-row phase of one sweep and return the reduced statistics.
    ///
    /// `seeds` holds one seed per worker.
    pub fn run_sweep(
        &mut self,
        ctx: &SweepContext<'_>,
        rows: &mut [RowState],
        seeds: &[u64],
    ) -> Result<&WorkerAccumulator> {
        if seeds.len() != self.nworkers() {
            return Err(ImputerError::shape(
                format!("{} worker seeds", self.nworkers()),
                format!("{} worker seeds", seeds.len()),
            ));
        }
        let ranges = partition(rows.len(), self.nworkers());
        let mut blocks = Vec::with_capacity(ranges.len());
        let mut rest = rows;
        for range in &ranges {
            let (head, tail) = std::mem::take(&mut rest).split_at_mut(range.len());
            blocks.push(head);
            rest = tail;
        }

        let jobs: Vec<_> = blocks
            .into_iter()
            .zip(self.accumulators.iter_mut())
            .zip(ranges.iter().map(|r| r.start))
            .zip(seeds.iter().copied())
            .collect();

        let results: Vec<Result<()>> = self.pool.install(|| {
            jobs.into_par_iter()
                .map(|(((block, acc), offset), seed)| acc.process_block(ctx, block, offset, seed))
                .collect()
        });
        results.into_iter().collect::<Result<Vec<()>>>()?;

        self.totals.clear();
        for acc in &self.accumulators {
            self.totals.combine(acc);
        }
        debug!(
            rows = self.totals.suf.n,
            occupancy = ?self.totals.occupancy,
            "sweep statistics reduced"
        );
        Ok(&self.totals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::AtomPrior;
    use crate::distributions::EmpiricalDistribution;
    use ndarray::array;

    #[test]
    fn test_partition_is_contiguous_and_balanced() {
        let ranges = partition(10, 3);
        assert_eq!(ranges, vec![0..4, 4..7, 7..10]);
        let ranges = partition(2, 4);
        assert_eq!(ranges, vec![0..1, 1..2, 2..2, 2..2]);
        assert_eq!(partition(0, 2), vec![0..0, 0..0]);
    }

    #[test]
    fn test_pool_rejects_zero_workers() {
        assert!(WorkerPool::new(0, 1, 1, &[0]).is_err());
    }

    #[test]
    fn test_cluster_log_probs_skip_missing() {
        let clusters = ClusterModel::new(2).unwrap();
        let mut a = AtomModel::new(&AtomPrior::default_for(1));
        a.set_atom_probs(&array![0.9, 0.1].view()).unwrap();
        let mut b = AtomModel::new(&AtomPrior::default_for(1));
        b.set_atom_probs(&array![0.2, 0.8].view()).unwrap();
        let models = vec![vec![a], vec![b]];

        // Default error rows: a true atom is recorded as itself, a continuous
        // value is recorded as the atom half of the time.
        let mut out = [0.0; 2];
        fill_cluster_log_probs(&clusters, &models, &[Some(0)], &mut out);
        assert!((out[0] - (0.5f64.ln() + 0.95f64.ln())).abs() < 1e-12);
        assert!((out[1] - (0.5f64.ln() + 0.6f64.ln())).abs() < 1e-12);

        fill_cluster_log_probs(&clusters, &models, &[None], &mut out);
        assert_eq!(out[0], out[1]);
    }

    #[test]
    fn test_sweep_accumulates_every_row() {
        let mut marginal = EmpiricalDistribution::new(10);
        for i in 0..50 {
            marginal.add(i as f64);
        }
        marginal.update_cdf();
        let copulas = vec![CopulaTransform::new(vec![0.0], marginal)];
        let observations: Vec<Observation> = (0..7)
            .map(|i| {
                let y = if i == 3 { f64::NAN } else { i as f64 * 5.0 };
                Observation::from_slices(&[1.0], &[y]).unwrap()
            })
            .collect();
        let mut rows: Vec<RowState> = observations.iter().map(RowState::new).collect();
        let prior = AtomPrior::default_for(1);
        let atom_models = vec![vec![AtomModel::new(&prior)]; 2];
        let clusters = ClusterModel::new(2).unwrap();
        let regression = MvRegModel::new(1, 1);
        let ctx = SweepContext {
            observations: &observations,
            copulas: &copulas,
            atom_models: &atom_models,
            clusters: &clusters,
            regression: &regression,
        };

        let mut pool = WorkerPool::new(3, 2, 1, &[1]).unwrap();
        let totals = pool.run_sweep(&ctx, &mut rows, &[1, 2, 3]).unwrap();
        assert_eq!(totals.suf.n, 7.0);
        assert_eq!(totals.occupancy.sum(), 7.0);
        let counted: f64 = totals
            .atom_counts
            .iter()
            .map(|per_var| per_var[0].levels.sum())
            .sum();
        let continuous_recorded: f64 = totals
            .atom_counts
            .iter()
            .map(|per_var| per_var[0].errors.column(1).sum())
            .sum();
        // The missing row is not counted.
        assert_eq!(counted, 6.0);
        // Row 0 recorded the atom; the other five were continuous.
        assert_eq!(continuous_recorded, 5.0);
        assert!(rows[3].completed[0].is_finite());
        assert_eq!(rows[2].completed[0], 10.0);
    }
}
