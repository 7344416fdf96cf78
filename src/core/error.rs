use thiserror::Error;

use super::tax::TaxError;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("tax oracle failed: {0}")]
    Tax(#[from] TaxError),
    #[error("no results found for scenario: {0}")]
    UnknownScenario(String),
    #[error("spending sweep is empty")]
    EmptySweep,
}

impl SimError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        SimError::InvalidConfig(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, SimError>;

impl From<SimError> for String {
    fn from(e: SimError) -> Self {
        e.to_string()
    }
}
