//! Per-operator memory pools built on top of the query budget.
//!
//! A pool tracks two numbers: `used` (bytes the operator currently holds) and
//! `reserved` (bytes taken from the budget through the pool's guard). Usage
//! may grow freely inside the reservation. Growing the reservation goes to
//! the budget first and, when that fails, to the arbitration hook which may
//! reclaim memory from other operators.

use std::sync::Arc;

use parking_lot::Mutex;
use strata_core::budget::BudgetGuard;

use crate::error::{Error, Result};
use crate::guard::{BudgetGuardImpl, MemoryBudgetImpl};
use crate::tracking::PeakTracker;

/// Called when a pool cannot grow its reservation from the budget.
///
/// Implementations free capacity elsewhere (typically by asking other
/// operators to spill) and return whether the caller should retry.
pub trait MemoryArbitrationHook: Send + Sync {
    fn grow_capacity(&self, pool: &MemoryPool, bytes: usize) -> bool;
}

/// Outcome of a reclaim request against one or more operators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimStats {
    pub reclaimed_bytes: u64,
    pub reclaim_exec_time_us: u64,
    /// Operators skipped because they were running or cannot reclaim.
    pub num_non_reclaimable_attempts: u64,
}

impl std::ops::AddAssign for ReclaimStats {
    fn add_assign(&mut self, rhs: Self) {
        self.reclaimed_bytes += rhs.reclaimed_bytes;
        self.reclaim_exec_time_us += rhs.reclaim_exec_time_us;
        self.num_non_reclaimable_attempts += rhs.num_non_reclaimable_attempts;
    }
}

struct PoolState {
    reservation: BudgetGuardImpl,
    used: usize,
}

pub struct MemoryPool {
    name: String,
    budget: MemoryBudgetImpl,
    state: Mutex<PoolState>,
    arbitrator: Option<Arc<dyn MemoryArbitrationHook>>,
    peak: PeakTracker,
}

impl MemoryPool {
    pub fn new(
        name: impl Into<String>,
        budget: MemoryBudgetImpl,
        arbitrator: Option<Arc<dyn MemoryArbitrationHook>>,
    ) -> Self {
        let reservation = budget.empty_guard("memory_pool");
        Self {
            name: name.into(),
            budget,
            state: Mutex::new(PoolState {
                reservation,
                used: 0,
            }),
            arbitrator,
            peak: PeakTracker::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn budget(&self) -> &MemoryBudgetImpl {
        &self.budget
    }

    pub fn used_bytes(&self) -> usize {
        self.state.lock().used
    }

    pub fn reserved_bytes(&self) -> usize {
        self.state.lock().reservation.bytes()
    }

    /// Reserved bytes not yet used.
    pub fn available_reservation(&self) -> usize {
        let state = self.state.lock();
        state.reservation.bytes().saturating_sub(state.used)
    }

    pub fn peak_bytes(&self) -> usize {
        self.peak.peak()
    }

    /// Try to make room for `bytes` more usage without allocating it.
    /// Returns false if neither the budget nor arbitration could cover it.
    pub fn maybe_reserve(&self, bytes: usize) -> bool {
        let target = self.used_bytes().saturating_add(bytes);
        self.grow_reservation(target)
    }

    /// Account `bytes` of new usage, growing the reservation if needed.
    pub fn allocate(&self, bytes: usize) -> Result<()> {
        if self.try_use(bytes) {
            return Ok(());
        }
        let target = self.used_bytes().saturating_add(bytes);
        if self.grow_reservation(target) && self.try_use(bytes) {
            return Ok(());
        }
        Err(Error::BudgetExceeded {
            pool: self.name.clone(),
            requested: bytes,
            capacity: self.budget.capacity_bytes(),
            used: self.budget.used_bytes(),
        })
    }

    /// Return `bytes` of usage; the reservation is kept.
    pub fn free(&self, bytes: usize) {
        let mut state = self.state.lock();
        state.used = state.used.saturating_sub(bytes);
    }

    /// Shrink the reservation down to current usage.
    pub fn release(&self) {
        let mut state = self.state.lock();
        let used = state.used;
        state.reservation.try_resize(used);
    }

    fn try_use(&self, bytes: usize) -> bool {
        let mut state = self.state.lock();
        let next = state.used.saturating_add(bytes);
        if next > state.reservation.bytes() {
            return false;
        }
        state.used = next;
        drop(state);
        self.peak.observe(next);
        true
    }

    fn try_resize_to(&self, target: usize) -> bool {
        let mut state = self.state.lock();
        if state.reservation.bytes() >= target {
            return true;
        }
        state.reservation.try_resize(target)
    }

    fn grow_reservation(&self, target: usize) -> bool {
        if self.try_resize_to(target) {
            return true;
        }
        let Some(arbitrator) = &self.arbitrator else {
            return false;
        };
        let needed = target.saturating_sub(self.reserved_bytes());
        tracing::debug!(pool = %self.name, needed, "memory pool requests arbitration");
        arbitrator.grow_capacity(self, needed) && self.try_resize_to(target)
    }
}

impl std::fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryPool")
            .field("name", &self.name)
            .field("used", &state.used)
            .field("reserved", &state.reservation.bytes())
            .finish()
    }
}
