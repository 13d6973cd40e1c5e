//! Atom model: how often each level is the truth, and how it gets recorded.
//!
//! For a variable with `k` atoms there are `k + 1` levels, the last being the
//! continuous level. Each (cluster, variable) pair owns
//!
//! * `atom_probs`: the probability that the true value is at each level;
//! * `atom_error_probs`: a `(k + 1) × (k + 1)` matrix. Row `t` is the true
//!   level and column `r` the recorded one, so each row is the distribution
//!   of what gets written down. Entry `(k, m)` is the rate at which a
//!   continuous value is disguised as atom `m`.
//!
//! A recorded atom `m` is explained by true level `t` with weight
//! `atom_probs[t] · atom_error_probs[t, m]`.

use crate::distributions::Dirichlet;
use crate::error::{ImputerError, Result};
use crate::utils::sample_categorical;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Tolerance used when checking that supplied probabilities sum to one.
const SUM_TOLERANCE: f64 = 1e-6;

/// Prior counts for the atom model of one variable.
///
/// Negative counts mark a level as a priori impossible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomPrior {
    atom_counts: Array1<f64>,
    error_counts: Array2<f64>,
}

impl AtomPrior {
    /// One prior count per level. A true atom is always recorded as itself,
    /// and a continuous value is equally likely to be recorded as any level.
    pub fn default_for(n_atoms: usize) -> Self {
        let atom_counts = Array1::ones(n_atoms + 1);
        let error_counts = Array2::from_shape_fn((n_atoms + 1, n_atoms + 1), |(t, r)| {
            if t == r || t == n_atoms { 1.0 } else { -1.0 }
        });
        Self {
            atom_counts,
            error_counts,
        }
    }

    pub fn n_atoms(&self) -> usize {
        self.atom_counts.len() - 1
    }

    pub fn atom_counts(&self) -> &Array1<f64> {
        &self.atom_counts
    }

    pub fn error_counts(&self) -> &Array2<f64> {
        &self.error_counts
    }

    /// Replace the prior counts on the true level.
    pub fn set_atom_counts(&mut self, counts: &ArrayView1<f64>) -> Result<()> {
        if counts.len() != self.atom_counts.len() {
            return Err(ImputerError::shape(
                format!("{} prior counts (atoms + 1)", self.atom_counts.len()),
                format!("{} prior counts", counts.len()),
            ));
        }
        Dirichlet::new(counts.to_owned())?;
        self.atom_counts.assign(counts);
        Ok(())
    }

    /// Replace the prior counts on the atom-error matrix, indexed
    /// `[true level, recorded level]`.
    pub fn set_error_counts(&mut self, counts: &ArrayView2<f64>) -> Result<()> {
        if counts.dim() != self.error_counts.dim() {
            return Err(ImputerError::shape(
                format!("{:?}", self.error_counts.dim()),
                format!("{:?}", counts.dim()),
            ));
        }
        for (t, row) in counts.axis_iter(Axis(0)).enumerate() {
            Dirichlet::new(row.to_owned()).map_err(|_| {
                ImputerError::InvalidParameter(format!(
                    "atom error prior row {} needs a finite positive count",
                    t
                ))
            })?;
        }
        self.error_counts.assign(counts);
        Ok(())
    }
}

/// Level and error counts gathered from one cluster's rows for one variable.
#[derive(Debug, Clone, PartialEq)]
pub struct AtomCounts {
    /// Counts of true levels.
    pub levels: Array1<f64>,
    /// Counts of (true level, recorded level) pairs.
    pub errors: Array2<f64>,
}

impl AtomCounts {
    pub fn new(n_atoms: usize) -> Self {
        Self {
            levels: Array1::zeros(n_atoms + 1),
            errors: Array2::zeros((n_atoms + 1, n_atoms + 1)),
        }
    }

    /// Count one observed cell whose true level is `truth`.
    pub fn record(&mut self, truth: usize, recorded: usize) {
        self.levels[truth] += 1.0;
        self.errors[[truth, recorded]] += 1.0;
    }

    pub fn clear(&mut self) {
        self.levels.fill(0.0);
        self.errors.fill(0.0);
    }

    pub fn combine(&mut self, other: &AtomCounts) {
        self.levels += &other.levels;
        self.errors += &other.errors;
    }
}

/// Atom and atom-error probabilities for one (cluster, variable) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomModel {
    atom_probs: Array1<f64>,
    atom_error_probs: Array2<f64>,
}

impl AtomModel {
    /// Start at the prior mean.
    pub fn new(prior: &AtomPrior) -> Self {
        let atom_probs = prior_mean(&prior.atom_counts.view());
        let mut atom_error_probs = Array2::zeros(prior.error_counts.dim());
        for (mut row, counts) in atom_error_probs
            .axis_iter_mut(Axis(0))
            .zip(prior.error_counts.axis_iter(Axis(0)))
        {
            row.assign(&prior_mean(&counts));
        }
        Self {
            atom_probs,
            atom_error_probs,
        }
    }

    pub fn n_atoms(&self) -> usize {
        self.atom_probs.len() - 1
    }

    pub fn atom_probs(&self) -> &Array1<f64> {
        &self.atom_probs
    }

    pub fn atom_error_probs(&self) -> &Array2<f64> {
        &self.atom_error_probs
    }

    pub fn set_atom_probs(&mut self, probs: &ArrayView1<f64>) -> Result<()> {
        if probs.len() != self.atom_probs.len() {
            return Err(ImputerError::shape(
                format!("{} probabilities", self.atom_probs.len()),
                format!("{} probabilities", probs.len()),
            ));
        }
        check_probability_vector(probs, "atom_probs")?;
        self.atom_probs.assign(probs);
        Ok(())
    }

    pub fn set_atom_error_probs(&mut self, probs: &ArrayView2<f64>) -> Result<()> {
        if probs.dim() != self.atom_error_probs.dim() {
            return Err(ImputerError::shape(
                format!("{:?}", self.atom_error_probs.dim()),
                format!("{:?}", probs.dim()),
            ));
        }
        for row in probs.axis_iter(Axis(0)) {
            check_probability_vector(&row, "atom_error_probs row")?;
        }
        self.atom_error_probs.assign(probs);
        Ok(())
    }

    /// Log probability that a cell is recorded at `level`.
    ///
    /// A recorded continuous value is always taken as the truth, so only the
    /// continuous row contributes to it.
    pub fn log_prob_recorded(&self, level: usize) -> f64 {
        let continuous = self.n_atoms();
        if level == continuous {
            (self.atom_probs[continuous] * self.atom_error_probs[[continuous, continuous]]).ln()
        } else {
            self.atom_probs
                .iter()
                .zip(self.atom_error_probs.column(level))
                .map(|(p, e)| p * e)
                .sum::<f64>()
                .ln()
        }
    }

    /// Draw a true level from `atom_probs`, as for a missing cell.
    pub fn draw_level(&self, u: f64) -> Option<usize> {
        sample_categorical(self.atom_probs.iter(), u)
    }

    /// Draw the true level behind a recorded atom.
    ///
    /// `weights` is scratch space of length `k + 1`. Returns `None` when no
    /// level can produce `recorded_atom`.
    pub fn draw_true_level(&self, recorded_atom: usize, u: f64, weights: &mut [f64]) -> Option<usize> {
        for ((w, p), e) in weights
            .iter_mut()
            .zip(&self.atom_probs)
            .zip(self.atom_error_probs.column(recorded_atom))
        {
            *w = p * e;
        }
        sample_categorical(weights.iter(), u)
    }

    /// Conjugate Dirichlet draws of both probability tables.
    pub fn draw<R: Rng + ?Sized>(
        &mut self,
        prior: &AtomPrior,
        counts: &AtomCounts,
        rng: &mut R,
    ) -> Result<()> {
        let posterior = Dirichlet::new(prior.atom_counts.clone())?.posterior(&counts.levels.view())?;
        self.atom_probs = posterior.sample(rng)?;

        for (t, mut row) in self.atom_error_probs.axis_iter_mut(Axis(0)).enumerate() {
            let posterior = Dirichlet::new(prior.error_counts.row(t).to_owned())?
                .posterior(&counts.errors.row(t))?;
            row.assign(&posterior.sample(rng)?);
        }
        Ok(())
    }

    /// Log prior density of the current probabilities.
    pub fn log_prior(&self, prior: &AtomPrior) -> Result<f64> {
        let mut total = Dirichlet::new(prior.atom_counts.clone())?.log_density(&self.atom_probs.view());
        for (t, row) in self.atom_error_probs.axis_iter(Axis(0)).enumerate() {
            total += Dirichlet::new(prior.error_counts.row(t).to_owned())?.log_density(&row);
        }
        Ok(total)
    }
}

fn prior_mean(counts: &ArrayView1<f64>) -> Array1<f64> {
    let positive = counts.mapv(|c| c.max(0.0));
    let total = positive.sum();
    if total > 0.0 {
        positive / total
    } else {
        Array1::from_elem(counts.len(), 1.0 / counts.len() as f64)
    }
}

fn check_probability_vector(probs: &ArrayView1<f64>, what: &str) -> Result<()> {
    if probs.iter().any(|&p| !(p >= 0.0) || !p.is_finite()) {
        return Err(ImputerError::InvalidParameter(format!(
            "{} must be finite and non-negative",
            what
        )));
    }
    let total = probs.sum();
    if (total - 1.0).abs() > SUM_TOLERANCE {
        return Err(ImputerError::InvalidParameter(format!(
            "{} must sum to 1 (sum = {})",
            what, total
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_default_prior_shapes() {
        let prior = AtomPrior::default_for(2);
        assert_eq!(prior.atom_counts(), &array![1.0, 1.0, 1.0]);
        assert_eq!(
            prior.error_counts(),
            &array![[1.0, -1.0, -1.0], [-1.0, 1.0, -1.0], [1.0, 1.0, 1.0]]
        );
        let model = AtomModel::new(&prior);
        assert_relative_eq!(model.atom_probs()[0], 1.0 / 3.0, epsilon = 1e-12);
        assert_eq!(model.atom_error_probs().row(0), array![1.0, 0.0, 0.0]);
        assert_relative_eq!(model.atom_error_probs()[[2, 1]], 1.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_no_atoms_has_single_level() {
        let prior = AtomPrior::default_for(0);
        let model = AtomModel::new(&prior);
        assert_eq!(model.atom_probs(), &array![1.0]);
        assert_eq!(model.atom_error_probs(), &array![[1.0]]);
        assert_eq!(model.log_prob_recorded(0), 0.0);
    }

    #[test]
    fn test_set_atom_counts_validates_length() {
        let mut prior = AtomPrior::default_for(1);
        assert!(prior.set_atom_counts(&array![1.0, 2.0, 3.0].view()).is_err());
        assert!(prior.set_atom_counts(&array![-1.0, -1.0].view()).is_err());
        prior.set_atom_counts(&array![-1.0, 4.0].view()).unwrap();
        assert_eq!(prior.atom_counts(), &array![-1.0, 4.0]);
    }

    #[test]
    fn test_set_error_counts_validates_rows() {
        let mut prior = AtomPrior::default_for(1);
        assert!(prior.set_error_counts(&array![[9.0, 1.0]].view()).is_err());
        assert!(prior
            .set_error_counts(&array![[1.0, -1.0], [-1.0, 0.0]].view())
            .is_err());
        prior
            .set_error_counts(&array![[1.0, -1.0], [1.0, 9.0]].view())
            .unwrap();
    }

    #[test]
    fn test_recorded_atom_weighs_truth_by_error_rate() {
        let mut model = AtomModel::new(&AtomPrior::default_for(1));
        model.set_atom_probs(&array![0.2, 0.8].view()).unwrap();
        model
            .set_atom_error_probs(&array![[1.0, 0.0], [0.25, 0.75]].view())
            .unwrap();
        // P(record 0) = 0.2 * 1 + 0.8 * 0.25 = 0.4, half of it genuine.
        assert_relative_eq!(model.log_prob_recorded(0), 0.4_f64.ln(), epsilon = 1e-12);
        assert_relative_eq!(model.log_prob_recorded(1), 0.6_f64.ln(), epsilon = 1e-12);
        let mut scratch = [0.0; 2];
        assert_eq!(model.draw_true_level(0, 0.49, &mut scratch), Some(0));
        assert_eq!(model.draw_true_level(0, 0.51, &mut scratch), Some(1));
        assert_eq!(model.draw_level(0.1), Some(0));
    }

    #[test]
    fn test_impossible_truth_is_never_drawn() {
        let mut model = AtomModel::new(&AtomPrior::default_for(1));
        model.set_atom_probs(&array![0.0, 1.0].view()).unwrap();
        let mut scratch = [0.0; 2];
        for i in 0..20 {
            let u = i as f64 / 20.0;
            assert_eq!(model.draw_true_level(0, u, &mut scratch), Some(1));
        }
        model
            .set_atom_error_probs(&array![[1.0, 0.0], [0.0, 1.0]].view())
            .unwrap();
        assert_eq!(model.draw_true_level(0, 0.5, &mut scratch), None);
        assert_eq!(model.log_prob_recorded(0), f64::NEG_INFINITY);
    }

    #[test]
    fn test_draw_keeps_probabilities_normalised() {
        let prior = AtomPrior::default_for(2);
        let mut model = AtomModel::new(&prior);
        let mut counts = AtomCounts::new(2);
        for _ in 0..30 {
            counts.record(0, 0);
        }
        counts.record(1, 1);
        for _ in 0..8 {
            counts.record(2, 2);
        }
        counts.record(2, 0);
        counts.record(2, 1);
        assert_eq!(counts.levels, array![30.0, 1.0, 10.0]);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        for _ in 0..50 {
            model.draw(&prior, &counts, &mut rng).unwrap();
            assert_relative_eq!(model.atom_probs().sum(), 1.0, epsilon = 1e-12);
            for row in model.atom_error_probs().rows() {
                assert_relative_eq!(row.sum(), 1.0, epsilon = 1e-12);
            }
            // A true atom is never recorded as something else.
            assert_eq!(model.atom_error_probs().row(0), array![1.0, 0.0, 0.0]);
            assert_eq!(model.atom_error_probs().row(1), array![0.0, 1.0, 0.0]);
            assert!(model.atom_error_probs()[[2, 0]] > 0.0);
        }
    }

    #[test]
    fn test_negative_prior_forces_zero_probability() {
        let mut prior = AtomPrior::default_for(1);
        prior.set_atom_counts(&array![-5.0, 1.0].view()).unwrap();
        let mut model = AtomModel::new(&prior);
        let mut counts = AtomCounts::new(1);
        counts.levels.assign(&array![2.0, 20.0]);
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        model.draw(&prior, &counts, &mut rng).unwrap();
        assert_eq!(model.atom_probs()[0], 0.0);
        assert_eq!(model.atom_probs()[1], 1.0);
    }

    #[test]
    fn test_setters_validate() {
        let mut model = AtomModel::new(&AtomPrior::default_for(1));
        assert!(model.set_atom_probs(&array![0.5, 0.6].view()).is_err());
        assert!(model.set_atom_probs(&array![1.5, -0.5].view()).is_err());
        assert!(model.set_atom_probs(&array![0.5].view()).is_err());
        model.set_atom_probs(&array![0.25, 0.75].view()).unwrap();
        assert!(model.set_atom_error_probs(&array![[0.9, 0.1]].view()).is_err());
        assert!(model
            .set_atom_error_probs(&array![[1.0, 0.0], [0.5, 0.4]].view())
            .is_err());
        model
            .set_atom_error_probs(&array![[1.0, 0.0], [0.1, 0.9]].view())
            .unwrap();
    }

    #[test]
    fn test_log_prior_uniform() {
        let prior = AtomPrior::default_for(1);
        let model = AtomModel::new(&prior);
        // Dirichlet(1, 1) on the true level and on the continuous error row.
        // The atom row has a single possible level and density one.
        assert_relative_eq!(model.log_prior(&prior).unwrap(), 0.0, epsilon = 1e-10);
    }
}
