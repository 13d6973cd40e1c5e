//! Core data types for representing training rows.

use crate::error::{ImputerError, Result};
use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// One row of the data table: a predictor vector and a response vector.
///
/// Missing responses are marked with `f64::NAN`. Predictors must be fully
/// observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    x: Array1<f64>,
    y: Array1<f64>,
}

impl Observation {
    pub fn new(x: Array1<f64>, y: Array1<f64>) -> Result<Self> {
        if let Some(i) = x.iter().position(|v| !v.is_finite()) {
            return Err(ImputerError::InvalidInput(format!(
                "predictor {} is not finite ({})",
                i, x[i]
            )));
        }
        if let Some(i) = y.iter().position(|v| v.is_infinite()) {
            return Err(ImputerError::InvalidInput(format!(
                "response {} is infinite; mark missing values with NaN",
                i
            )));
        }
        Ok(Self { x, y })
    }

    /// Build from slices, copying the data.
    pub fn from_slices(x: &[f64], y: &[f64]) -> Result<Self> {
        Self::new(Array1::from(x.to_vec()), Array1::from(y.to_vec()))
    }

    pub fn x(&self) -> &Array1<f64> {
        &self.x
    }

    pub fn y(&self) -> &Array1<f64> {
        &self.y
    }

    pub fn xdim(&self) -> usize {
        self.x.len()
    }

    pub fn ydim(&self) -> usize {
        self.y.len()
    }
}

/// Latent per-row state carried between sweeps.
#[derive(Debug, Clone)]
pub struct RowState {
    /// Current cluster assignment.
    pub cluster: usize,
    /// Current copula-scale values, observed or latent.
    pub latent: Array1<f64>,
    /// Completed row on the original scale from the most recent sweep.
    pub completed: Array1<f64>,
}

impl RowState {
    pub(crate) fn new(obs: &Observation) -> Self {
        Self {
            cluster: 0,
            latent: Array1::zeros(obs.ydim()),
            completed: obs.y().clone(),
        }
    }
}
