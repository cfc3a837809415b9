#![forbid(unsafe_code)]
//! strata-exec: the driver/task runtime.
//!
//! A [`Task`] runs one plan with N [`Driver`]s on a shared
//! [`DriverExecutor`] thread pool. Drivers move batches through their
//! operator chains and check for pause/cancel/abort/yield requests between
//! operator calls, never in the middle of one. Code that may block for
//! reasons unrelated to the query (memory arbitration, mostly) runs inside a
//! [`SuspendedSection`], which takes the driver out of the task's running
//! count so pauses can complete.
//!
//! Memory pressure is handled by the [`MemoryArbitrator`]: when an operator
//! pool cannot grow, it pauses tasks and asks their operators to spill.

pub mod arbitrator;
pub mod cursor;
pub mod driver;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod query_ctx;
pub mod state;
pub mod stats;
pub mod stop_reason;
pub mod suspended;
pub mod task;

pub use arbitrator::{ArbitratorStats, MemoryArbitrator};
pub use cursor::{TaskCursor, TaskQueue};
pub use driver::{driver_thread_context, Driver, OpCallInfo};
pub use error::{ExecError, Result};
pub use executor::DriverExecutor;
pub use query_ctx::{QueryCtx, QueryCtxBuilder};
pub use state::ThreadState;
pub use stats::{OperatorStats, TaskStats};
pub use stop_reason::{resolve_stop_reason, StopInputs, StopReason, TerminateKind};
pub use suspended::SuspendedSection;
pub use task::{Task, TaskState};
