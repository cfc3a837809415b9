use thiserror::Error;

pub type Result<T> = std::result::Result<T, ExecError>;

/// Errors surfaced by tasks and drivers.
///
/// `Clone` so the first error latched by a task can be handed to every
/// caller that asks for it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error("Operator::{method} failed for [operator: {operator}, plan node ID: {plan_node_id}]: {message}")]
    Operator {
        method: String,
        operator: String,
        plan_node_id: String,
        message: String,
    },

    #[error("Cancelled")]
    Canceled,

    #[error("Aborted")]
    Aborted,

    #[error("driver creation failed: {0}")]
    DriverCreation(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("terminated: {0}")]
    Terminated(String),

    #[error("memory error: {0}")]
    Memory(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<strata_core::Error> for ExecError {
    fn from(e: strata_core::Error) -> Self {
        match e {
            strata_core::Error::Config(msg) => ExecError::Config(msg),
            other => ExecError::InvalidState(other.to_string()),
        }
    }
}

impl From<strata_io::Error> for ExecError {
    fn from(e: strata_io::Error) -> Self {
        ExecError::Config(e.to_string())
    }
}

impl From<strata_mem::Error> for ExecError {
    fn from(e: strata_mem::Error) -> Self {
        ExecError::Memory(e.to_string())
    }
}
