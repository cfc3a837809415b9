//! Query-level memory arbitration.
//!
//! The arbitrator owns the memory budget shared by every operator pool of the
//! tasks registered with it. When a pool cannot grow its reservation, the
//! requesting driver is suspended and the arbitrator, holding the global
//! pause lock, pauses each live task in turn, asks the operators of its idle
//! drivers to spill, and resumes it, until the request fits.

use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::Serialize;
use strata_mem::{MemoryArbitrationHook, MemoryBudgetImpl, MemoryPool, ReclaimStats};
use tracing::debug;

use crate::driver::driver_thread_context;
use crate::suspended::SuspendedSection;
use crate::task::Task;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArbitratorStats {
    pub num_requests: u64,
    pub num_succeeded: u64,
    pub num_failed: u64,
    pub reclaimed_bytes: u64,
    pub num_non_reclaimable_attempts: u64,
    pub reclaim_time_us: u64,
}

pub struct MemoryArbitrator {
    budget: MemoryBudgetImpl,
    tasks: Mutex<Vec<Weak<Task>>>,
    pause_lock: Mutex<()>,
    stats: Mutex<ArbitratorStats>,
}

impl MemoryArbitrator {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            budget: MemoryBudgetImpl::new(capacity_bytes),
            tasks: Mutex::new(Vec::new()),
            pause_lock: Mutex::new(()),
            stats: Mutex::new(ArbitratorStats::default()),
        }
    }

    pub fn budget(&self) -> &MemoryBudgetImpl {
        &self.budget
    }

    pub fn register_task(&self, task: &Arc<Task>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| t.strong_count() > 0);
        tasks.push(Arc::downgrade(task));
    }

    /// Registered tasks that are still alive, in registration order.
    pub fn live_tasks(&self) -> Vec<Arc<Task>> {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| t.strong_count() > 0);
        tasks.iter().filter_map(Weak::upgrade).collect()
    }

    pub fn random_task(&self) -> Option<Arc<Task>> {
        self.live_tasks().choose(&mut rand::thread_rng()).cloned()
    }

    /// Serializes every cross-task pause/resume, arbitration included.
    /// Anything else pausing tasks it does not own must hold it too.
    pub fn pause_lock(&self) -> &Mutex<()> {
        &self.pause_lock
    }

    pub fn stats(&self) -> ArbitratorStats {
        *self.stats.lock()
    }

    fn reclaim_from_tasks(&self, bytes: usize) -> ReclaimStats {
        let mut total = ReclaimStats::default();
        for task in self.live_tasks() {
            if self.budget.available_bytes() >= bytes {
                break;
            }
            if !task.is_running() {
                continue;
            }
            let needed = bytes.saturating_sub(self.budget.available_bytes()) as u64;
            task.request_pause().wait();
            total += task.reclaim(needed);
            task.resume();
        }
        total
    }
}

impl MemoryArbitrationHook for MemoryArbitrator {
    fn grow_capacity(&self, pool: &MemoryPool, bytes: usize) -> bool {
        // The requester must not count as running while tasks are paused.
        let _section = match driver_thread_context() {
            Some(driver) => match SuspendedSection::new(driver) {
                Ok(section) => Some(section),
                Err(e) => {
                    debug!(pool = pool.name(), error = %e, "skipping arbitration");
                    return false;
                }
            },
            None => None,
        };

        let _pause = self.pause_lock.lock();
        let start = Instant::now();
        let reclaimed = self.reclaim_from_tasks(bytes);
        let succeeded = self.budget.available_bytes() >= bytes;

        let mut stats = self.stats.lock();
        stats.num_requests += 1;
        if succeeded {
            stats.num_succeeded += 1;
        } else {
            stats.num_failed += 1;
        }
        stats.reclaimed_bytes += reclaimed.reclaimed_bytes;
        stats.num_non_reclaimable_attempts += reclaimed.num_non_reclaimable_attempts;
        stats.reclaim_time_us += start.elapsed().as_micros() as u64;
        debug!(
            pool = pool.name(),
            bytes,
            reclaimed_bytes = reclaimed.reclaimed_bytes,
            succeeded,
            "memory arbitration"
        );
        succeeded
    }
}

impl std::fmt::Debug for MemoryArbitrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryArbitrator")
            .field("budget", &self.budget)
            .field("stats", &self.stats())
            .finish()
    }
}
