#![forbid(unsafe_code)]
//! strata: a cooperative query driver runtime.
//!
//! This crate re-exports the workspace crates under one name:
//! - [`strata_core`]: ids, batches, plan nodes, configuration, continue futures.
//! - [`strata_mem`]: memory budgets and pools, the spill engine.
//! - [`strata_io`]: spill storage backends.
//! - [`strata_operators`]: the operator trait and built-in operators.
//! - [`strata_exec`]: drivers, tasks, the executor pool and memory arbitration.

pub use strata_core;
pub use strata_exec;
pub use strata_io;
pub use strata_mem;
pub use strata_operators;

pub use strata_core::{ExecConfig, PlanBuilder, PlanNode, RowBatch};
pub use strata_exec::{ExecError, QueryCtx, Task, TaskCursor, TaskState};
