//! Memory budget interfaces.
//!
//! A budget is the hard cap for one query. Each memory pool holds a single
//! resizable guard (its reservation) taken from the budget. `strata-mem`
//! implements both traits; other crates only need the API.

/// Bytes reserved from a budget, returned when the guard drops.
pub trait BudgetGuard: Send {
    fn bytes(&self) -> usize;

    /// Resize to `new_bytes`. Shrinking always succeeds; growing fails and
    /// leaves the guard unchanged when the budget cannot cover it.
    fn try_resize(&mut self, new_bytes: usize) -> bool;

    /// Label shown in debug output.
    fn tag(&self) -> &'static str {
        "guard"
    }
}

pub trait MemoryBudget: Send + Sync + 'static {
    type Guard: BudgetGuard;

    /// A zero-byte guard to be grown with [`BudgetGuard::try_resize`].
    fn empty_guard(&self, tag: &'static str) -> Self::Guard;

    fn capacity_bytes(&self) -> usize;

    /// Bytes held by all live guards. Advisory under concurrency.
    fn used_bytes(&self) -> usize;

    fn available_bytes(&self) -> usize {
        self.capacity_bytes().saturating_sub(self.used_bytes())
    }
}
