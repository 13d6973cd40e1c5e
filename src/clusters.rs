//! Mixing weights over the latent error-pattern clusters.

use crate::distributions::Dirichlet;
use crate::error::{ImputerError, Result};
use crate::sampler::PosteriorSampler;
use ndarray::{Array1, ArrayView1};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Cluster mixing weights with a Dirichlet prior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterModel {
    weights: Array1<f64>,
    prior: Dirichlet,
}

impl ClusterModel {
    /// Uniform weights and one prior count per cluster.
    pub fn new(num_clusters: usize) -> Result<Self> {
        if num_clusters == 0 {
            return Err(ImputerError::InvalidParameter(
                "num_clusters must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            weights: Array1::from_elem(num_clusters, 1.0 / num_clusters as f64),
            prior: Dirichlet::uniform(num_clusters),
        })
    }

    pub fn nclusters(&self) -> usize {
        self.weights.len()
    }

    pub fn weights(&self) -> &Array1<f64> {
        &self.weights
    }

    pub fn prior(&self) -> &Dirichlet {
        &self.prior
    }

    pub fn set_default_prior(&mut self) {
        self.prior = Dirichlet::uniform(self.nclusters());
    }

    pub fn set_prior(&mut self, counts: &ArrayView1<f64>) -> Result<()> {
        if counts.len() != self.nclusters() {
            return Err(ImputerError::shape(
                format!("{} prior counts", self.nclusters()),
                format!("{} prior counts", counts.len()),
            ));
        }
        self.prior = Dirichlet::new(counts.to_owned())?;
        Ok(())
    }

    /// Log of each mixing weight, in cluster order.
    pub fn log_weights(&self) -> impl Iterator<Item = f64> + '_ {
        self.weights.iter().map(|w| w.ln())
    }

    /// Draw new weights from the posterior given cluster occupancy counts.
    pub fn draw<R: Rng + ?Sized>(&mut self, occupancy: &ArrayView1<f64>, rng: &mut R) -> Result<()> {
        if let Some(c) = occupancy.iter().position(|&n| n == 0.0) {
            warn!(cluster = c, "cluster has no rows this sweep");
        }
        self.weights = self.prior.posterior(occupancy)?.sample(rng)?;
        Ok(())
    }
}

impl PosteriorSampler for ClusterModel {
    fn log_prior(&self) -> Result<f64> {
        Ok(self.prior.log_density(&self.weights.view()))
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
    fn test_rejects_zero_clusters() {
        assert!(ClusterModel::new(0).is_err());
    }

    #[test]
    fn test_draw_follows_occupancy() {
        let mut model = ClusterModel::new(2).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let occupancy = array![900.0, 100.0];
        let mut mean = 0.0;
        for _ in 0..200 {
            model.draw(&occupancy.view(), &mut rng).unwrap();
            assert_relative_eq!(model.weights().sum(), 1.0, epsilon = 1e-12);
            mean += model.weights()[0];
        }
        assert_relative_eq!(mean / 200.0, 0.9, epsilon = 0.01);
    }

    #[test]
    fn test_set_prior_checks_length() {
        let mut model = ClusterModel::new(3).unwrap();
        assert!(model.set_prior(&array![1.0, 1.0].view()).is_err());
        model.set_prior(&array![2.0, 2.0, 2.0].view()).unwrap();
        assert_eq!(model.prior().alpha(), &array![2.0, 2.0, 2.0]);
        model.set_default_prior();
        assert_eq!(model.prior().alpha(), &array![1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_log_prior_uniform_weights() {
        // Dirichlet(1, 1, 1) has density Γ(3) = 2 everywhere on the simplex.
        let model = ClusterModel::new(3).unwrap();
        assert_relative_eq!(model.log_prior().unwrap(), 2.0_f64.ln(), epsilon = 1e-10);
    }
}
