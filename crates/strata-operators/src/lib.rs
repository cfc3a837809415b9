#![forbid(unsafe_code)]
//! strata-operators: operators driven by `strata-exec` drivers.
//!
//! Design intent:
//! - Operators are synchronous and pull-based: the driver asks
//!   `needs_input`, feeds `add_input`, drains `get_output`, and polls
//!   `is_blocked` before every call.
//! - Operator state memory is accounted through the operator's
//!   `strata_mem::MemoryPool`; spilling operators partition their state with
//!   `strata_mem::spill`.
//! - Plan nodes map to operators through the [`OperatorRegistry`]; custom
//!   node kinds plug in with a [`PlanNodeTranslator`].

pub mod callback_sink;
pub mod filter;
pub mod registry;
pub mod row_number;
pub mod traits;
pub mod values;

pub use callback_sink::{BatchConsumer, CallbackSink};
pub use filter::FilterOperator;
pub use registry::{OperatorRegistry, PlanNodeTranslator};
pub use row_number::RowNumberOperator;
pub use traits::{
    BlockingReason, BlockingState, OpError, Operator, OperatorCtx, OperatorSpillCtx, YieldCheck,
};
pub use values::ValuesOperator;

#[cfg(test)]
pub(crate) mod test_util {
    use std::sync::Arc;

    use strata_core::id::{DriverId, OpId, PlanNodeId};
    use strata_mem::{MemoryBudgetImpl, MemoryPool};

    use crate::OperatorCtx;

    pub fn ctx(operator_type: &str, mem_cap: usize) -> OperatorCtx {
        let pool = MemoryPool::new(
            format!("test.{operator_type}"),
            MemoryBudgetImpl::new(mem_cap),
            None,
        );
        OperatorCtx::new(
            "test-task",
            DriverId::new(0),
            OpId::new(0),
            PlanNodeId::from("0"),
            operator_type,
            Arc::new(pool),
        )
    }
}
