//! Driver: one operator chain executed on the shared executor.
//!
//! A driver is either queued, on a worker thread, blocked on a future, or
//! off-thread waiting for a resume. While on-thread it loops over its
//! operators, moving batches downstream, and checks the task's stop flags at
//! the top of every pass. Operator calls are never interrupted: pause, cancel
//! and yield only take effect between calls.
//!
//! Every operator call goes through [`Driver::call_op`], which records the
//! call for diagnostics and turns both `Err` results and panics into an
//! [`ExecError::Operator`] tagged with the operator and method.

use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use strata_core::id::{DriverId, OpId};
use strata_core::{ContinueFuture, RowBatch};
use strata_mem::ReclaimStats;
use strata_operators::{CallbackSink, OpError, Operator, YieldCheck};
use tracing::{debug, warn};

use crate::error::{ExecError, Result};
use crate::executor::panic_message;
use crate::state::{current_thread_token, ThreadState};
use crate::stats::OperatorStats;
use crate::stop_reason::StopReason;
use crate::task::{LeaveAction, Task};

static YIELD_COUNT: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static DRIVER_THREAD_CONTEXT: RefCell<Option<Arc<Driver>>> = const { RefCell::new(None) };
}

/// The driver running on the calling thread, if any.
pub fn driver_thread_context() -> Option<Arc<Driver>> {
    DRIVER_THREAD_CONTEXT.with(|c| c.borrow().clone())
}

struct DriverThreadContextGuard {
    prev: Option<Arc<Driver>>,
}

impl DriverThreadContextGuard {
    fn set(driver: &Arc<Driver>) -> Self {
        let prev = DRIVER_THREAD_CONTEXT.with(|c| c.borrow_mut().replace(Arc::clone(driver)));
        Self { prev }
    }
}

impl Drop for DriverThreadContextGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        DRIVER_THREAD_CONTEXT.with(|c| *c.borrow_mut() = prev);
    }
}

/// A call currently in flight on one of the driver's operators.
#[derive(Debug, Clone)]
struct OpCallStatus {
    op_index: usize,
    method: &'static str,
    start: Instant,
    tid: u64,
}

/// Snapshot of a long-running operator call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpCallInfo {
    pub op_id: u64,
    /// `<operator type>.<plan node id>::<method>`
    pub op_call: String,
    pub duration_ms: u64,
    pub tid: u64,
    pub task_id: String,
}

#[derive(Debug, Clone)]
struct OpDesc {
    op_id: OpId,
    operator_type: String,
    plan_node_id: String,
}

struct Pipeline {
    operators: Vec<Box<dyn Operator>>,
    stats: Vec<OperatorStats>,
}

enum LoopOutcome {
    Finished,
    Terminated,
    Yield,
    Pause,
    Blocked(ContinueFuture),
}

pub struct Driver {
    task: Arc<Task>,
    driver_id: DriverId,
    state: ThreadState,
    pipeline: Mutex<Pipeline>,
    op_descs: Vec<OpDesc>,
    op_call_status: Mutex<Option<OpCallStatus>>,
    closed: AtomicBool,
}

impl Driver {
    /// Build the operator chain for driver `index` of `task`.
    pub(crate) fn create(task: &Arc<Task>, index: usize) -> Result<Arc<Driver>> {
        let driver_id = DriverId::new(index as u64);
        let mut failure = None;
        let driver = Arc::new_cyclic(|weak: &Weak<Driver>| {
            let operators = match build_operators(task, driver_id, weak) {
                Ok(ops) => ops,
                Err(e) => {
                    failure = Some(e);
                    Vec::new()
                }
            };
            let op_descs: Vec<OpDesc> = operators
                .iter()
                .map(|op| OpDesc {
                    op_id: op.ctx().op_id,
                    operator_type: op.operator_type().to_string(),
                    plan_node_id: op.ctx().plan_node_id.to_string(),
                })
                .collect();
            let stats = op_descs
                .iter()
                .map(|d| OperatorStats::new(&d.operator_type, &d.plan_node_id, d.op_id.get()))
                .collect();
            Driver {
                task: Arc::clone(task),
                driver_id,
                state: ThreadState::new(),
                pipeline: Mutex::new(Pipeline { operators, stats }),
                op_descs,
                op_call_status: Mutex::new(None),
                closed: AtomicBool::new(false),
            }
        });
        match failure {
            Some(e) => Err(e),
            None => Ok(driver),
        }
    }

    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    pub fn driver_id(&self) -> DriverId {
        self.driver_id
    }

    pub fn state(&self) -> &ThreadState {
        &self.state
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn num_operators(&self) -> usize {
        self.op_descs.len()
    }

    /// Number of times any driver gave up its thread to yield.
    pub fn yield_count() -> u64 {
        YIELD_COUNT.load(Ordering::Relaxed)
    }

    /// True if the driver should give up its thread at the next chance:
    /// its time slice is used up or the task asked running drivers to yield.
    pub fn should_yield(&self) -> bool {
        let limit = self.task.query_ctx().config().driver_cpu_time_slice_limit_ms;
        self.state.time_slice_exceeded(limit) || self.state.yield_requested()
    }

    /// Hand the driver to the executor. The caller has marked it enqueued
    /// under the task lock.
    pub(crate) fn enqueue(driver: Arc<Driver>) {
        let executor = Arc::clone(driver.task.query_ctx().executor());
        let job_driver = Arc::clone(&driver);
        if !executor.submit(move || job_driver.run()) {
            warn!(
                task_id = %driver.task.task_id(),
                driver = driver.driver_id.get(),
                "driver executor is shut down, failing task"
            );
            driver.state.set_enqueued(false);
            driver
                .task
                .set_error(ExecError::InvalidState("driver executor is shut down".into()));
        }
    }

    /// Run one slice: until the driver finishes, blocks, yields, pauses or
    /// is terminated.
    pub fn run(self: Arc<Self>) {
        let _context = DriverThreadContextGuard::set(&self);
        match self.task.enter(&self.state) {
            StopReason::None => {}
            StopReason::Terminate(_) => {
                self.close();
                return;
            }
            // Paused drivers are re-enqueued by resume; terminated ones were
            // claimed by whoever processed the termination.
            StopReason::Pause | StopReason::Yield | StopReason::AlreadyTerminated => return,
        }

        match self.run_loop() {
            Ok(LoopOutcome::Finished) => {
                debug!(
                    task_id = %self.task.task_id(),
                    driver = self.driver_id.get(),
                    "driver finished"
                );
                self.close();
            }
            Ok(LoopOutcome::Terminated) => self.close(),
            Err(e) => {
                self.task.set_error(e);
                self.close();
            }
            Ok(LoopOutcome::Yield) => {
                YIELD_COUNT.fetch_add(1, Ordering::Relaxed);
                self.leave_and(|_| true);
            }
            Ok(LoopOutcome::Pause) => {
                // A resume that raced with this exit could not see us off-thread.
                self.leave_and(|reason| matches!(reason, StopReason::None | StopReason::Yield));
            }
            Ok(LoopOutcome::Blocked(future)) => {
                self.state.set_blocking_future(true);
                match self.task.leave(&self.state, |_| false) {
                    LeaveAction::Close => {
                        self.state.set_blocking_future(false);
                        self.close();
                    }
                    LeaveAction::Requeue | LeaveAction::Detach => {
                        let driver = Arc::clone(&self);
                        future.on_ready(move || {
                            if driver.task.unblock(&driver.state) {
                                Driver::enqueue(driver);
                            }
                        });
                    }
                }
            }
        }
    }

    fn leave_and(self: &Arc<Self>, requeue: impl FnOnce(StopReason) -> bool) {
        match self.task.leave(&self.state, requeue) {
            LeaveAction::Close => self.close(),
            LeaveAction::Requeue => Driver::enqueue(Arc::clone(self)),
            LeaveAction::Detach => {}
        }
    }

    fn run_loop(&self) -> Result<LoopOutcome> {
        let mut pipeline = self.pipeline.lock();
        let num_ops = pipeline.operators.len();
        if num_ops == 0 {
            return Ok(LoopOutcome::Finished);
        }
        loop {
            match self.task.should_stop(&self.state) {
                StopReason::None => {}
                StopReason::Yield => return Ok(LoopOutcome::Yield),
                StopReason::Pause => return Ok(LoopOutcome::Pause),
                StopReason::Terminate(_) | StopReason::AlreadyTerminated => {
                    return Ok(LoopOutcome::Terminated)
                }
            }

            for i in 0..num_ops {
                if let Some(future) = self.blocking_future(&mut pipeline, i)? {
                    return Ok(LoopOutcome::Blocked(future));
                }
                if i + 1 < num_ops {
                    if let Some(future) = self.blocking_future(&mut pipeline, i + 1)? {
                        return Ok(LoopOutcome::Blocked(future));
                    }
                    let needs_input = self.call_op(&mut pipeline, i + 1, "needsInput", |op| {
                        Ok(op.needs_input())
                    })?;
                    if !needs_input {
                        continue;
                    }
                    match self.get_output(&mut pipeline, i)? {
                        Some(batch) => self.add_input(&mut pipeline, i + 1, batch)?,
                        None => {
                            let finished = self.call_op(&mut pipeline, i, "isFinished", |op| {
                                Ok(op.is_finished())
                            })?;
                            if finished {
                                self.call_op(&mut pipeline, i + 1, "noMoreInput", |op| {
                                    op.no_more_input()
                                })?;
                            }
                        }
                    }
                } else {
                    // Output of the last operator is dropped unless it is a sink.
                    self.get_output(&mut pipeline, i)?;
                    if self.call_op(&mut pipeline, i, "isFinished", |op| Ok(op.is_finished()))? {
                        return Ok(LoopOutcome::Finished);
                    }
                }
            }
        }
    }

    fn blocking_future(
        &self,
        pipeline: &mut Pipeline,
        index: usize,
    ) -> Result<Option<ContinueFuture>> {
        let blocking = self.call_op(pipeline, index, "isBlocked", |op| op.is_blocked())?;
        if !blocking.is_blocked() {
            return Ok(None);
        }
        match blocking.future {
            Some(future) => {
                pipeline.stats[index].blocked_count += 1;
                Ok(Some(future))
            }
            None => Err(ExecError::Invariant(format!(
                "The operator {} is blocked but blocking future is not valid",
                self.op_descs[index].operator_type
            ))),
        }
    }

    fn get_output(&self, pipeline: &mut Pipeline, index: usize) -> Result<Option<RowBatch>> {
        let start = Instant::now();
        let output = self.call_op(pipeline, index, "getOutput", |op| op.get_output())?;
        let stats = &mut pipeline.stats[index];
        stats.get_output_nanos += start.elapsed().as_nanos() as u64;
        if let Some(batch) = &output {
            stats.output_rows += batch.num_rows() as u64;
            stats.output_batches += 1;
        }
        Ok(output)
    }

    fn add_input(&self, pipeline: &mut Pipeline, index: usize, batch: RowBatch) -> Result<()> {
        let rows = batch.num_rows() as u64;
        let start = Instant::now();
        self.call_op(pipeline, index, "addInput", |op| op.add_input(batch))?;
        let stats = &mut pipeline.stats[index];
        stats.add_input_nanos += start.elapsed().as_nanos() as u64;
        stats.input_rows += rows;
        stats.input_batches += 1;
        Ok(())
    }

    fn call_op<T>(
        &self,
        pipeline: &mut Pipeline,
        index: usize,
        method: &'static str,
        f: impl FnOnce(&mut dyn Operator) -> std::result::Result<T, OpError>,
    ) -> Result<T> {
        *self.op_call_status.lock() = Some(OpCallStatus {
            op_index: index,
            method,
            start: Instant::now(),
            tid: current_thread_token(),
        });
        let op = &mut *pipeline.operators[index];
        let result = catch_unwind(AssertUnwindSafe(|| f(op)));
        *self.op_call_status.lock() = None;
        match result {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(self.operator_error(index, method, e.to_string())),
            Err(payload) => {
                Err(self.operator_error(index, method, panic_message(payload.as_ref())))
            }
        }
    }

    fn operator_error(&self, index: usize, method: &str, message: String) -> ExecError {
        let desc = &self.op_descs[index];
        ExecError::Operator {
            method: method.to_string(),
            operator: desc.operator_type.clone(),
            plan_node_id: desc.plan_node_id.clone(),
            message,
        }
    }

    /// Close all operators and unregister from the task. The caller owns the
    /// driver: it is either on this thread or was claimed by the task.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let stats = {
            let mut pipeline = self.pipeline.lock();
            let Pipeline { operators, stats } = &mut *pipeline;
            for (op, s) in operators.iter_mut().zip(stats.iter_mut()) {
                s.spill = op.spill_stats();
                s.peak_memory_bytes = op.ctx().pool.peak_bytes() as u64;
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| op.close())) {
                    warn!(
                        task_id = %self.task.task_id(),
                        operator = op.operator_type(),
                        panic = %panic_message(payload.as_ref()),
                        "operator close panicked"
                    );
                }
                op.ctx().pool.release();
            }
            operators.clear();
            stats.clone()
        };
        self.task.driver_closed(self, stats);
    }

    /// Ask reclaimable operators to free up to `target_bytes`. Drivers that
    /// are running (their pipeline is locked) are skipped.
    pub(crate) fn reclaim(&self, target_bytes: u64, stats: &mut ReclaimStats) -> Result<()> {
        let Some(mut pipeline) = self.pipeline.try_lock() else {
            stats.num_non_reclaimable_attempts += 1;
            return Ok(());
        };
        for i in 0..pipeline.operators.len() {
            if stats.reclaimed_bytes >= target_bytes {
                break;
            }
            if !pipeline.operators[i].can_reclaim() {
                continue;
            }
            let remaining = target_bytes - stats.reclaimed_bytes;
            self.call_op(&mut pipeline, i, "reclaim", |op| op.reclaim(remaining, stats))?;
            pipeline.stats[i].spill = pipeline.operators[i].spill_stats();
        }
        Ok(())
    }

    /// The operator call in flight, if it has run for at least `min_ms`.
    pub(crate) fn op_call_info(&self, min_ms: u64) -> Option<OpCallInfo> {
        let status = self.op_call_status.lock().clone()?;
        let duration_ms = status.start.elapsed().as_millis() as u64;
        if duration_ms < min_ms {
            return None;
        }
        let desc = &self.op_descs[status.op_index];
        Some(OpCallInfo {
            op_id: desc.op_id.get(),
            op_call: format!("{}.{}::{}", desc.operator_type, desc.plan_node_id, status.method),
            duration_ms,
            tid: status.tid,
            task_id: self.task.task_id().to_string(),
        })
    }

    /// Current operator stats, unless the driver is running.
    pub fn operator_stats(&self) -> Option<Vec<OperatorStats>> {
        self.pipeline.try_lock().map(|p| p.stats.clone())
    }
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("task_id", &self.task.task_id())
            .field("driver_id", &self.driver_id)
            .field("state", &self.state)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn build_operators(
    task: &Arc<Task>,
    driver_id: DriverId,
    weak: &Weak<Driver>,
) -> Result<Vec<Box<dyn Operator>>> {
    let should_yield: YieldCheck = {
        let weak = weak.clone();
        Arc::new(move || weak.upgrade().map(|d| d.should_yield()).unwrap_or(false))
    };
    let registry = task.query_ctx().registry();
    let nodes = task.plan().linearize();
    let mut operators: Vec<Box<dyn Operator>> = Vec::with_capacity(nodes.len() + 1);
    for (i, node) in nodes.iter().enumerate() {
        let ctx = task.operator_ctx(
            driver_id,
            OpId::new(i as u64),
            node.id().clone(),
            node.kind(),
            Arc::clone(&should_yield),
        );
        let op = registry.create_operator(ctx, node).map_err(|e| {
            ExecError::DriverCreation(format!("{} ({}): {e}", node.kind(), node.id()))
        })?;
        operators.push(op);
    }
    if let Some(consumer) = task.consumer() {
        let ctx = task.operator_ctx(
            driver_id,
            OpId::new(nodes.len() as u64),
            task.plan().id().clone(),
            "CallbackSink",
            should_yield,
        );
        operators.push(Box::new(CallbackSink::new(ctx, Arc::clone(consumer))));
    }
    Ok(operators)
}
