//! Convenient re-exports for downstream crates.

pub use crate::config::{ExecConfig, SpillConfig, StorageConfig};
pub use crate::error::{Error, Result};
pub use crate::future::{make_continue_future, ContinueFuture, ContinuePromise};
pub use crate::id::{DriverId, OpId, PlanNodeId};
pub use crate::plan::{PlanBuilder, PlanNode, PlanNodeIdGenerator};
pub use crate::schema::{DataType, Field, Schema};
pub use crate::spill_stats::SpillStats;
pub use crate::types::{Column, RowBatch, Scalar};
