use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while building configs and plans, before any driver runs.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad `ExecConfig` value, from code or from a `STRATA_*` variable.
    #[error("config error: {0}")]
    Config(String),

    #[error("plan error: {0}")]
    Plan(String),

    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Plan(format!("invalid plan JSON at line {}: {e}", e.line()))
    }
}
