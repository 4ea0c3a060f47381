use thiserror::Error;

use crate::id::OperatorId;

/// Canonical result for core.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Plan error: {0}")]
    Plan(String),

    #[error("Operator {0} not found in plan")]
    OperatorNotFound(OperatorId),
}
