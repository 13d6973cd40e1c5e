//! Common interface of the model components that carry a prior.

use crate::error::Result;

/// A model component whose parameters are drawn from a conjugate posterior.
pub trait PosteriorSampler {
    /// Log prior density of the current parameter values.
    fn log_prior(&self) -> Result<f64>;
}
