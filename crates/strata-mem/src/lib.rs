#![forbid(unsafe_code)]
//! strata-mem: memory budgets, arbitrated pools, and the spill engine.
//!
//! This crate provides the concrete implementation of the budget interfaces
//! in `strata-core::budget`. Operators account their state through a
//! [`MemoryPool`]; when a pool cannot grow, it asks a
//! [`MemoryArbitrationHook`] (implemented in `strata-exec`) to free capacity
//! before giving up. Spilling operators partition their state with the
//! [`spill`] module.
//!
//! No driver/task logic lives here. Storage backends are behind the
//! [`Storage`] trait and implemented by `strata-io`.

pub mod error;
pub mod guard;
pub mod pool;
pub mod spill;
pub mod tracking;

pub use error::{Error, Result};
pub use guard::{BudgetGuardImpl, MemoryBudgetImpl};
pub use pool::{MemoryArbitrationHook, MemoryPool, ReclaimStats};
pub use spill::{
    Codec, HashBitRange, HashPartitionFunction, SharedSpillStats, SpillPartition,
    SpillPartitionId, SpillPartitionReader, SpillPartitionSet, SpillState, Spiller, Storage,
};
