//! # mvimpute
//!
//! Bayesian imputation of multivariate data with missing values and
//! contaminated special codes.
//!
//! Each response variable may have *atoms*: exact values such as `0` or a
//! sentinel code that are recorded often and may be genuine or a disguised
//! data-entry error. Rows belong to latent clusters with their own atom and
//! error probabilities, while the continuous part of every variable is linked
//! to the predictors through a multivariate regression on the Gaussian copula
//! scale. Parameters are learned by Gibbs sampling, with the per-row work
//! spread over a fixed pool of worker threads.
//!
//! ## Example
//!
//! ```ignore
//! use mvimpute::prelude::*;
//!
//! let mut imputer = MvRegCopulaDataImputer::with_config(
//!     ImputerConfig::new(2, vec![vec![0.0], vec![]], 1)
//!         .with_seed(42)
//!         .with_nworkers(4),
//! )?;
//! imputer.add_data(Observation::from_slices(&[1.0], &[0.0, 3.1])?)?;
//! imputer.add_data(Observation::from_slices(&[1.0], &[2.4, f64::NAN])?)?;
//!
//! imputer.train(&McmcConfig::new(500, 100))?;
//! let completed = imputer.impute_data_set(&new_rows, 7)?;
//! ```

pub mod atoms;
pub mod clusters;
pub mod copula;
pub mod distributions;
pub mod error;
pub mod model;
pub mod regression;
pub mod sampler;
pub mod training;
pub mod types;
pub mod utils;
pub mod workers;

pub mod prelude {
    //! Convenient re-exports of commonly used types.
    pub use crate::atoms::{AtomModel, AtomPrior};
    pub use crate::copula::{CellValue, CopulaTransform};
    pub use crate::distributions::{EmpiricalDistribution, EmpiricalDistributionState};
    pub use crate::error::{ImputerError, Result};
    pub use crate::model::{ImputerConfig, MvRegCopulaDataImputer};
    pub use crate::regression::RegressionPrior;
    pub use crate::sampler::PosteriorSampler;
    pub use crate::training::{
        CallbackAction, CallbackList, HistoryCallback, LogCallback, McmcConfig, McmcResult,
        SweepCallback, SweepSummary,
    };
    pub use crate::types::Observation;
}
