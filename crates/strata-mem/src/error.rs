use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The pool could not grow even after memory arbitration.
    #[error(
        "memory pool '{pool}' cannot grow by {requested} bytes: budget capacity {capacity}, in use {used}"
    )]
    BudgetExceeded {
        pool: String,
        requested: usize,
        capacity: usize,
        used: usize,
    },

    #[error("spill storage: {0}")]
    Storage(String),

    #[error("unsupported spill codec: {0}")]
    CodecUnsupported(String),

    #[error("spill codec: {0}")]
    Codec(String),

    #[error("spill segment {0} failed checksum verification")]
    ChecksumMismatch(String),

    #[error("spill: {0}")]
    Spill(String),
}
