//! Budget and reservation guard backing the memory pools.
//!
//! The budget is the query-wide hard cap. Memory pools hold one growable
//! guard each (their reservation); dropping a guard returns its bytes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use strata_core::budget::{BudgetGuard, MemoryBudget};

struct BudgetInner {
    capacity: usize,
    used: AtomicUsize,
}

impl BudgetInner {
    fn try_acquire(&self, bytes: usize) -> bool {
        let mut cur = self.used.load(Ordering::Relaxed);
        loop {
            let next = cur.saturating_add(bytes);
            if next > self.capacity {
                return false;
            }
            match self
                .used
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(observed) => cur = observed,
            }
        }
    }

    fn release(&self, bytes: usize) {
        self.used.fetch_sub(bytes, Ordering::AcqRel);
    }
}

/// Concrete MemoryBudget shared by every pool of a query.
#[derive(Clone)]
pub struct MemoryBudgetImpl {
    inner: Arc<BudgetInner>,
}

impl MemoryBudgetImpl {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            inner: Arc::new(BudgetInner {
                capacity: capacity_bytes,
                used: AtomicUsize::new(0),
            }),
        }
    }

    pub fn used_bytes(&self) -> usize {
        MemoryBudget::used_bytes(self)
    }

    pub fn capacity_bytes(&self) -> usize {
        MemoryBudget::capacity_bytes(self)
    }

    pub fn available_bytes(&self) -> usize {
        MemoryBudget::available_bytes(self)
    }

    pub fn empty_guard(&self, tag: &'static str) -> BudgetGuardImpl {
        MemoryBudget::empty_guard(self, tag)
    }
}

impl MemoryBudget for MemoryBudgetImpl {
    type Guard = BudgetGuardImpl;

    fn empty_guard(&self, tag: &'static str) -> BudgetGuardImpl {
        BudgetGuardImpl {
            inner: Arc::clone(&self.inner),
            bytes: 0,
            tag,
        }
    }

    fn capacity_bytes(&self) -> usize {
        self.inner.capacity
    }

    fn used_bytes(&self) -> usize {
        self.inner.used.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for MemoryBudgetImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBudgetImpl")
            .field("capacity", &self.capacity_bytes())
            .field("used", &self.used_bytes())
            .finish()
    }
}

/// One reservation against a [`MemoryBudgetImpl`].
pub struct BudgetGuardImpl {
    inner: Arc<BudgetInner>,
    bytes: usize,
    tag: &'static str,
}

impl Drop for BudgetGuardImpl {
    fn drop(&mut self) {
        if self.bytes > 0 {
            self.inner.release(self.bytes);
            self.bytes = 0;
        }
    }
}

impl BudgetGuard for BudgetGuardImpl {
    fn bytes(&self) -> usize {
        self.bytes
    }

    fn try_resize(&mut self, new_bytes: usize) -> bool {
        if new_bytes <= self.bytes {
            self.inner.release(self.bytes - new_bytes);
            self.bytes = new_bytes;
            return true;
        }
        if !self.inner.try_acquire(new_bytes - self.bytes) {
            return false;
        }
        self.bytes = new_bytes;
        true
    }

    fn tag(&self) -> &'static str {
        self.tag
    }
}
