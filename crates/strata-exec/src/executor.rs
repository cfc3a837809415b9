//! Fixed-size thread pool running driver slices.
//!
//! Workers pop jobs from a shared FIFO guarded by a mutex and condvar. A job
//! is one `Driver::run` call: it runs until the driver yields, blocks, pauses
//! or finishes, so a driver is on at most one worker at a time.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::error::{ExecError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct ExecutorShared {
    queue: Mutex<VecDeque<Job>>,
    cv: Condvar,
    shutdown: AtomicBool,
}

pub struct DriverExecutor {
    shared: Arc<ExecutorShared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    num_threads: usize,
}

impl DriverExecutor {
    pub fn new(num_threads: usize) -> Result<Self> {
        if num_threads == 0 {
            return Err(ExecError::Config("executor needs at least one thread".into()));
        }
        let shared = Arc::new(ExecutorShared {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let mut workers = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let shared_cloned = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("strata-driver-{i}"))
                .spawn(move || worker_loop(shared_cloned))
                .map_err(|e| ExecError::InvalidState(format!("spawn driver thread: {e}")));
            match handle {
                Ok(h) => workers.push(h),
                Err(e) => {
                    shared.shutdown.store(true, Ordering::Release);
                    shared.cv.notify_all();
                    for h in workers {
                        let _ = h.join();
                    }
                    return Err(e);
                }
            }
        }
        debug!(num_threads, "driver executor started");
        Ok(Self {
            shared,
            workers: Mutex::new(workers),
            num_threads,
        })
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub fn num_queued(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Queue `job`; returns false once the executor is shut down.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> bool {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return false;
        }
        self.shared.queue.lock().push_back(Box::new(job));
        self.shared.cv.notify_one();
        true
    }

    /// Stop accepting jobs and join the workers. Queued jobs are dropped.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.cv.notify_all();
        let workers = std::mem::take(&mut *self.workers.lock());
        let current = thread::current().id();
        for handle in workers {
            // The last owner may drop the executor from one of its own workers.
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
        self.shared.queue.lock().clear();
    }
}

impl Drop for DriverExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for DriverExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverExecutor")
            .field("num_threads", &self.num_threads)
            .field("num_queued", &self.num_queued())
            .finish()
    }
}

fn worker_loop(shared: Arc<ExecutorShared>) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                if let Some(job) = queue.pop_front() {
                    break job;
                }
                shared.cv.wait(&mut queue);
            }
        };
        if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
            error!(
                panic = %panic_message(payload.as_ref()),
                "driver job panicked outside operator calls"
            );
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
