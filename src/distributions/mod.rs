//! Probability distributions used by the Gibbs sampler.
//!
//! Conjugate Dirichlet draws with structural zeros, inverse-Wishart draws,
//! conditional multivariate normal draws, and the streaming empirical
//! distribution behind each copula transform.

mod dirichlet;
pub mod empirical;
pub mod mvn;
pub mod wishart;

pub use dirichlet::Dirichlet;
pub use empirical::{EmpiricalDistribution, EmpiricalDistributionState};
