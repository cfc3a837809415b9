#![forbid(unsafe_code)]
//! strata-core: shared vocabulary of the execution engine.
//!
//! Everything here is plain data or small synchronization primitives. The
//! memory/spill machinery lives in `strata-mem`, operators in
//! `strata-operators`, and the driver/task runtime in `strata-exec`.

pub mod budget;
pub mod config;
pub mod error;
pub mod future;
pub mod id;
pub mod plan;
pub mod prelude;
pub mod schema;
pub mod spill_stats;
pub mod succinct;
pub mod types;

pub use config::{ExecConfig, SpillConfig};
pub use error::{Error, Result};
pub use future::{make_continue_future, ContinueFuture, ContinuePromise};
pub use plan::{PlanBuilder, PlanNode, PlanNodeIdGenerator};
pub use spill_stats::SpillStats;
pub use types::{Column, RowBatch, Scalar};
