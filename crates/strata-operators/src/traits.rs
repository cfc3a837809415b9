//! Operator trait + blocking protocol.
//!
//! A driver owns a chain of operators and moves batches between neighbours.
//! Before every call it asks `is_blocked`; a blocked operator hands back a
//! future and the driver goes off-thread until that future is realized.
//!
//! Invariants:
//! - `needs_input` returns false once `no_more_input` has been called.
//! - `is_blocked` never reports a reason other than `NotBlocked` without a
//!   future. The driver treats that as a fault.
//! - State memory is accounted through `ctx().pool`.

use std::fmt;
use std::sync::Arc;

use strata_core::config::SpillConfig;
use strata_core::id::{DriverId, OpId, PlanNodeId};
use strata_core::{ContinueFuture, RowBatch, SpillStats};
use strata_mem::{MemoryPool, ReclaimStats, Storage};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OpError {
    #[error("planning error: {0}")]
    Plan(String),

    #[error("execution error: {0}")]
    Exec(String),

    #[error(transparent)]
    Memory(#[from] strata_mem::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockingReason {
    NotBlocked,
    WaitForConsumer,
    WaitForProducer,
    WaitForMemory,
    WaitForSplit,
    /// The operator asks the driver to give up its thread and come back.
    Yield,
}

impl fmt::Display for BlockingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BlockingReason::NotBlocked => "kNotBlocked",
            BlockingReason::WaitForConsumer => "kWaitForConsumer",
            BlockingReason::WaitForProducer => "kWaitForProducer",
            BlockingReason::WaitForMemory => "kWaitForMemory",
            BlockingReason::WaitForSplit => "kWaitForSplit",
            BlockingReason::Yield => "kYield",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct BlockingState {
    pub reason: BlockingReason,
    pub future: Option<ContinueFuture>,
}

impl BlockingState {
    pub fn not_blocked() -> Self {
        Self {
            reason: BlockingReason::NotBlocked,
            future: None,
        }
    }

    pub fn blocked(reason: BlockingReason, future: ContinueFuture) -> Self {
        Self {
            reason,
            future: Some(future),
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.reason != BlockingReason::NotBlocked
    }
}

/// Where and how a spilling operator writes its spill files.
#[derive(Clone)]
pub struct OperatorSpillCtx {
    pub config: SpillConfig,
    pub storage: Arc<dyn Storage>,
    /// Unique per operator instance; spillers append their own suffix.
    pub path_prefix: String,
}

impl fmt::Debug for OperatorSpillCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorSpillCtx")
            .field("config", &self.config)
            .field("path_prefix", &self.path_prefix)
            .finish()
    }
}

pub type YieldCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Everything an operator knows about where it runs.
#[derive(Clone)]
pub struct OperatorCtx {
    pub task_id: String,
    pub driver_id: DriverId,
    pub op_id: OpId,
    pub plan_node_id: PlanNodeId,
    /// Operator type name, e.g. `Filter` or a custom node kind.
    pub operator_type: String,
    pub pool: Arc<MemoryPool>,
    /// Present when spilling is enabled for this operator.
    pub spill: Option<OperatorSpillCtx>,
    /// True when the owning driver should give up its thread soon.
    pub should_yield: YieldCheck,
}

impl OperatorCtx {
    pub fn new(
        task_id: impl Into<String>,
        driver_id: DriverId,
        op_id: OpId,
        plan_node_id: PlanNodeId,
        operator_type: impl Into<String>,
        pool: Arc<MemoryPool>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            driver_id,
            op_id,
            plan_node_id,
            operator_type: operator_type.into(),
            pool,
            spill: None,
            should_yield: Arc::new(|| false),
        }
    }

    pub fn with_spill(mut self, spill: Option<OperatorSpillCtx>) -> Self {
        self.spill = spill;
        self
    }

    pub fn with_yield_check(mut self, should_yield: YieldCheck) -> Self {
        self.should_yield = should_yield;
        self
    }
}

impl fmt::Debug for OperatorCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorCtx")
            .field("task_id", &self.task_id)
            .field("driver_id", &self.driver_id)
            .field("op_id", &self.op_id)
            .field("plan_node_id", &self.plan_node_id)
            .field("operator_type", &self.operator_type)
            .field("spill", &self.spill)
            .finish()
    }
}

/// Trait that all operators must implement.
pub trait Operator: Send {
    fn ctx(&self) -> &OperatorCtx;

    fn operator_type(&self) -> &str {
        &self.ctx().operator_type
    }

    fn needs_input(&self) -> bool;

    fn add_input(&mut self, batch: RowBatch) -> Result<(), OpError>;

    /// Upstream is exhausted. May kick off restoring spilled state.
    fn no_more_input(&mut self) -> Result<(), OpError>;

    fn get_output(&mut self) -> Result<Option<RowBatch>, OpError>;

    fn is_blocked(&mut self) -> Result<BlockingState, OpError> {
        Ok(BlockingState::not_blocked())
    }

    fn is_finished(&self) -> bool;

    fn can_reclaim(&self) -> bool {
        false
    }

    /// Free memory, typically by spilling. Called only while the owning
    /// driver is off-thread.
    fn reclaim(&mut self, _target_bytes: u64, _stats: &mut ReclaimStats) -> Result<(), OpError> {
        Ok(())
    }

    fn spill_stats(&self) -> SpillStats {
        SpillStats::default()
    }

    fn close(&mut self) {}
}
