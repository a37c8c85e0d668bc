// ekf_sim/src/errors.rs

use ekf_core::errors::EkfError;
use thiserror::Error;

/// Failures of a simulation run.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("failed to load scenario: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("invalid scenario: {0}")]
    Scenario(String),

    #[error("invalid noise for {sensor}: {source}")]
    Noise {
        sensor: &'static str,
        #[source]
        source: rand_distr::NormalError,
    },

    #[error(transparent)]
    Filter(#[from] EkfError),
}

pub type SimResult<T> = Result<T, SimError>;
