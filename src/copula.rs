//! Copula transform between raw values and standard normal scores.
//!
//! Each response variable has its own transform: a list of atoms, which are
//! matched exactly and never transformed, and an empirical distribution used
//! for `encode(v) = Φ⁻¹(F(v))` and `decode(s) = F⁻¹(Φ(s))`.

use crate::distributions::EmpiricalDistribution;
use crate::utils::{normal_cdf, normal_quantile};
use serde::{Deserialize, Serialize};

/// Distance kept between a CDF value and the ends of [0, 1] before applying `Φ⁻¹`.
pub const CDF_CLIP: f64 = 1e-10;

/// Category of a single response cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CellValue {
    /// The raw value equals the atom with this index.
    Atom(usize),
    /// The value is missing.
    Missing,
    /// A continuous value, carried as its copula-scale score.
    Continuous(f64),
}

/// Copula transform for one response variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopulaTransform {
    atoms: Vec<f64>,
    marginal: EmpiricalDistribution,
}

impl CopulaTransform {
    pub fn new(atoms: Vec<f64>, marginal: EmpiricalDistribution) -> Self {
        Self { atoms, marginal }
    }

    pub fn atoms(&self) -> &[f64] {
        &self.atoms
    }

    /// Index of the continuous level.
    pub fn continuous_level(&self) -> usize {
        self.atoms.len()
    }

    pub fn marginal(&self) -> &EmpiricalDistribution {
        &self.marginal
    }

    pub fn marginal_mut(&mut self) -> &mut EmpiricalDistribution {
        &mut self.marginal
    }

    /// Atom index for `value`, if it matches one exactly.
    pub fn atom_index(&self, value: f64) -> Option<usize> {
        self.atoms.iter().position(|&a| a == value)
    }

    /// Value of the given level: the atom itself, or `None` for the continuous level.
    pub fn atom_value(&self, level: usize) -> Option<f64> {
        self.atoms.get(level).copied()
    }

    /// Classify a raw value as an atom, missing, or continuous.
    pub fn classify(&self, value: f64) -> CellValue {
        if value.is_nan() {
            return CellValue::Missing;
        }
        match self.atom_index(value) {
            Some(m) => CellValue::Atom(m),
            None => CellValue::Continuous(self.encode(value)),
        }
    }

    /// Level index recorded for a raw value, `None` when missing.
    pub fn observed_level(&self, value: f64) -> Option<usize> {
        if value.is_nan() {
            None
        } else {
            Some(self.atom_index(value).unwrap_or(self.atoms.len()))
        }
    }

    /// Map a continuous value to its standard normal score.
    ///
    /// Returns NaN if the empirical distribution holds no data yet.
    pub fn encode(&self, value: f64) -> f64 {
        let u = self.marginal.cdf(value);
        if u.is_nan() {
            return f64::NAN;
        }
        normal_quantile(u.clamp(CDF_CLIP, 1.0 - CDF_CLIP))
    }

    /// Map a standard normal score back to the original scale.
    ///
    /// Returns NaN if the empirical distribution holds no data yet.
    pub fn decode(&self, score: f64) -> f64 {
        self.marginal.quantile(normal_cdf(score))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution as RandDistribution, Exp};

    fn trained_transform(atoms: Vec<f64>) -> (CopulaTransform, Vec<f64>) {
        let mut rng = ChaCha8Rng::seed_from_u64(31);
        let exp = Exp::new(0.5).unwrap();
        let data: Vec<f64> = (0..500).map(|_| exp.sample(&mut rng) + 0.1).collect();
        let mut marginal = EmpiricalDistribution::new(25);
        for &x in &data {
            marginal.add(x);
        }
        marginal.update_cdf();
        (CopulaTransform::new(atoms, marginal), data)
    }

    #[test]
    fn test_classify_atoms_missing_and_continuous() {
        let (copula, _) = trained_transform(vec![0.0, -99.0]);
        assert_eq!(copula.classify(0.0), CellValue::Atom(0));
        assert_eq!(copula.classify(-99.0), CellValue::Atom(1));
        assert_eq!(copula.classify(f64::NAN), CellValue::Missing);
        assert!(matches!(copula.classify(1.3), CellValue::Continuous(s) if s.is_finite()));
        assert_eq!(copula.continuous_level(), 2);
        assert_eq!(copula.observed_level(2.0), Some(2));
        assert_eq!(copula.observed_level(-99.0), Some(1));
        assert_eq!(copula.observed_level(f64::NAN), None);
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let (copula, data) = trained_transform(vec![0.0]);
        let q = copula.marginal().quantiles();
        let (lo, hi) = (q[0], q[q.len() - 1]);
        for &v in data.iter().filter(|&&v| v > lo && v < hi) {
            assert_abs_diff_eq!(copula.decode(copula.encode(v)), v, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_encode_clips_extremes() {
        let (copula, _) = trained_transform(vec![]);
        let low = copula.encode(-1000.0);
        let high = copula.encode(1e6);
        assert!(low.is_finite() && low < -6.0);
        assert!(high.is_finite() && high > 6.0);
    }

    #[test]
    fn test_empty_marginal_gives_nan() {
        let copula = CopulaTransform::new(vec![], EmpiricalDistribution::default());
        assert!(copula.encode(1.0).is_nan());
        assert!(copula.decode(0.0).is_nan());
    }
}
