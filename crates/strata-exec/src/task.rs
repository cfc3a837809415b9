//! Task: one plan executed by N drivers.
//!
//! The task owns the run state (running/finished/canceled/aborted/failed),
//! the drivers, and the count of drivers currently on a thread. All of these
//! change under one mutex. Drivers read the pause/terminate/yield requests
//! through atomics at the top of each loop pass.
//!
//! Pause: `request_pause` returns a future realized once every driver is
//! off-thread or suspended. `resume` clears the flag, re-enqueues paused
//! drivers and wakes threads waiting in `leave_suspended`.
//!
//! Cancel/abort: the first terminal request wins. Drivers that are
//! off-thread are claimed and closed by the terminating thread; drivers on a
//! thread (including suspended ones) are marked and close themselves when
//! they next check their stop reason. The returned completion future is
//! realized once every driver has closed.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use strata_core::id::{DriverId, OpId, PlanNodeId};
use strata_core::{make_continue_future, ContinueFuture, ContinuePromise, PlanNode};
use strata_mem::{MemoryArbitrationHook, MemoryPool, ReclaimStats};
use strata_operators::{BatchConsumer, OperatorCtx, OperatorSpillCtx, YieldCheck};
use tracing::{debug, error, info, warn};

use crate::driver::{Driver, OpCallInfo};
use crate::error::{ExecError, Result};
use crate::metrics;
use crate::query_ctx::QueryCtx;
use crate::state::ThreadState;
use crate::stats::TaskStats;
use crate::stop_reason::{resolve_stop_reason, StopInputs, StopReason, TerminateKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Running,
    Finished,
    Canceled,
    Aborted,
    Failed,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Running => "Running",
            TaskState::Finished => "Finished",
            TaskState::Canceled => "Canceled",
            TaskState::Aborted => "Aborted",
            TaskState::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// What a driver does after leaving its thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LeaveAction {
    /// The task was terminated; the driver still owns itself and closes.
    Close,
    /// The driver was marked enqueued and must be handed to the executor.
    Requeue,
    /// Nothing to do; something else will enqueue or close the driver.
    Detach,
}

struct TaskInner {
    state: TaskState,
    started: bool,
    drivers: Vec<Option<Arc<Driver>>>,
    num_total_drivers: usize,
    num_running_drivers: usize,
    num_finished_drivers: usize,
    /// Drivers on a thread and not suspended.
    num_threads: usize,
    error: Option<ExecError>,
    /// Realized when `num_threads` drops to zero.
    thread_finish_promises: Vec<ContinuePromise>,
    /// Realized when the task is no longer running and no driver is left.
    completion_promises: Vec<ContinuePromise>,
    stats: TaskStats,
}

pub struct Task {
    task_id: String,
    spill_prefix: String,
    plan: PlanNode,
    query_ctx: Arc<QueryCtx>,
    consumer: Option<BatchConsumer>,
    inner: Mutex<TaskInner>,
    resume_cv: Condvar,
    pause_requested: AtomicBool,
    terminate_kind: AtomicU8,
    created_at: Instant,
}

impl Task {
    /// Create a task for `plan`. Batches reaching the end of the pipeline go
    /// to `consumer` when one is given.
    pub fn create(
        task_id: impl Into<String>,
        plan: PlanNode,
        query_ctx: Arc<QueryCtx>,
        consumer: Option<BatchConsumer>,
    ) -> Result<Arc<Task>> {
        plan.validate()?;
        let task_id = task_id.into();
        let spill_prefix = format!("{task_id}-{}", uuid::Uuid::new_v4().simple());
        let task = Arc::new(Task {
            task_id,
            spill_prefix,
            plan,
            query_ctx,
            consumer,
            inner: Mutex::new(TaskInner {
                state: TaskState::Running,
                started: false,
                drivers: Vec::new(),
                num_total_drivers: 0,
                num_running_drivers: 0,
                num_finished_drivers: 0,
                num_threads: 0,
                error: None,
                thread_finish_promises: Vec::new(),
                completion_promises: Vec::new(),
                stats: TaskStats::default(),
            }),
            resume_cv: Condvar::new(),
            pause_requested: AtomicBool::new(false),
            terminate_kind: AtomicU8::new(0),
            created_at: Instant::now(),
        });
        task.query_ctx.arbitrator().register_task(&task);
        debug!(task_id = %task.task_id, root = %task.plan.kind(), "task created");
        Ok(task)
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn plan(&self) -> &PlanNode {
        &self.plan
    }

    pub fn query_ctx(&self) -> &Arc<QueryCtx> {
        &self.query_ctx
    }

    pub(crate) fn consumer(&self) -> Option<&BatchConsumer> {
        self.consumer.as_ref()
    }

    pub fn state(&self) -> TaskState {
        self.inner.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == TaskState::Running
    }

    /// First error latched by the task. Cancel/abort latch `Cancelled` /
    /// `Aborted` unless a failure came first.
    pub fn error(&self) -> Option<ExecError> {
        self.inner.lock().error.clone()
    }

    pub fn num_total_drivers(&self) -> usize {
        self.inner.lock().num_total_drivers
    }

    /// Drivers created and not yet closed.
    pub fn num_running_drivers(&self) -> usize {
        self.inner.lock().num_running_drivers
    }

    pub fn num_finished_drivers(&self) -> usize {
        self.inner.lock().num_finished_drivers
    }

    /// Drivers currently on a thread and not suspended.
    pub fn num_threads(&self) -> usize {
        self.inner.lock().num_threads
    }

    pub fn pause_requested(&self) -> bool {
        self.pause_requested.load(Ordering::Acquire)
    }

    pub fn terminate_kind(&self) -> Option<TerminateKind> {
        TerminateKind::from_u8(self.terminate_kind.load(Ordering::Acquire))
    }

    /// Create the drivers and enqueue them. A driver that cannot be built
    /// fails the task; drivers built before it are closed.
    pub fn start(self: &Arc<Self>, max_drivers: usize) -> Result<()> {
        let num_drivers = self.query_ctx.registry().max_drivers(&self.plan, max_drivers);
        let (drivers, failure) = {
            let mut inner = self.inner.lock();
            if inner.state != TaskState::Running {
                return Err(ExecError::InvalidState(format!(
                    "cannot start task {} in state {}",
                    self.task_id, inner.state
                )));
            }
            if inner.started {
                return Err(ExecError::InvalidState(format!(
                    "task {} already started",
                    self.task_id
                )));
            }
            inner.started = true;

            let mut drivers = Vec::with_capacity(num_drivers);
            let mut failure = None;
            for i in 0..num_drivers {
                match Driver::create(self, i) {
                    Ok(driver) => drivers.push(driver),
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            inner.num_total_drivers = drivers.len();
            inner.num_running_drivers = drivers.len();
            inner.drivers = drivers.iter().cloned().map(Some).collect();
            if failure.is_none() {
                for driver in &drivers {
                    driver.state().set_enqueued(true);
                }
            }
            (drivers, failure)
        };

        if let Some(e) = failure {
            self.set_error(e.clone());
            return Err(e);
        }
        info!(task_id = %self.task_id, num_drivers = drivers.len(), "task started");
        for driver in drivers {
            Driver::enqueue(driver);
        }
        Ok(())
    }

    /// Operator context for one operator of one driver: a fresh memory pool
    /// on the query budget, and spill settings if the operator may spill.
    pub(crate) fn operator_ctx(
        &self,
        driver_id: DriverId,
        op_id: OpId,
        plan_node_id: PlanNodeId,
        operator_type: &str,
        should_yield: YieldCheck,
    ) -> OperatorCtx {
        let arbitrator = self.query_ctx.arbitrator();
        let hook: Arc<dyn MemoryArbitrationHook> = Arc::clone(arbitrator) as Arc<dyn MemoryArbitrationHook>;
        let pool = Arc::new(MemoryPool::new(
            format!(
                "{}.{}.{}.{}",
                self.task_id,
                driver_id.get(),
                operator_type,
                plan_node_id
            ),
            arbitrator.budget().clone(),
            Some(hook),
        ));
        let spill = self.spill_ctx(driver_id, op_id, operator_type);
        OperatorCtx::new(
            self.task_id.clone(),
            driver_id,
            op_id,
            plan_node_id,
            operator_type,
            pool,
        )
        .with_spill(spill)
        .with_yield_check(should_yield)
    }

    fn spill_ctx(
        &self,
        driver_id: DriverId,
        op_id: OpId,
        operator_type: &str,
    ) -> Option<OperatorSpillCtx> {
        let config = self.query_ctx.config();
        if !config.spill_enabled {
            return None;
        }
        match operator_type {
            "Values" | "Filter" | "CallbackSink" => return None,
            "RowNumber" if !config.row_number_spill_enabled => return None,
            _ => {}
        }
        let storage = Arc::clone(self.query_ctx.spill_storage()?);
        Some(OperatorSpillCtx {
            config: config.spill_config(),
            storage,
            path_prefix: format!(
                "{}/{}/{}-{}",
                self.spill_prefix,
                driver_id.get(),
                op_id.get(),
                operator_type
            ),
        })
    }

    fn stop_inputs(&self, state: &ThreadState) -> StopInputs {
        StopInputs {
            terminate: self.terminate_kind(),
            termination_visible: state.is_terminated(),
            pause_requested: self.pause_requested(),
            yield_requested: false,
            time_slice_exceeded: false,
        }
    }

    /// Stop check at the top of each driver loop pass. Consumes the driver's
    /// pending yield request if nothing stronger applies.
    pub(crate) fn should_stop(&self, state: &ThreadState) -> StopReason {
        let mut inputs = self.stop_inputs(state);
        let reason = resolve_stop_reason(&inputs);
        if reason != StopReason::None {
            return reason;
        }
        let limit = self.query_ctx.config().driver_cpu_time_slice_limit_ms;
        inputs.time_slice_exceeded = state.time_slice_exceeded(limit);
        inputs.yield_requested = !inputs.time_slice_exceeded && state.take_yield_request();
        resolve_stop_reason(&inputs)
    }

    /// Drop the driver from the on-thread count; returns the promises to
    /// realize if that was the last one.
    fn uncount_locked(&self, inner: &mut TaskInner, state: &ThreadState) -> Vec<ContinuePromise> {
        state.set_yield_requested(false);
        if !state.is_counted() {
            return Vec::new();
        }
        state.set_counted(false);
        inner.num_threads = inner.num_threads.saturating_sub(1);
        if inner.num_threads == 0 {
            std::mem::take(&mut inner.thread_finish_promises)
        } else {
            Vec::new()
        }
    }

    /// Called by a dequeued driver before it runs.
    pub(crate) fn enter(&self, state: &ThreadState) -> StopReason {
        let mut inner = self.inner.lock();
        state.set_enqueued(false);
        if state.is_terminated() {
            return StopReason::AlreadyTerminated;
        }
        if state.is_on_thread() {
            warn!(task_id = %self.task_id, tid = state.tid(), "driver is already on a thread");
            return StopReason::AlreadyTerminated;
        }
        let reason = resolve_stop_reason(&self.stop_inputs(state));
        match reason {
            StopReason::None => {
                inner.num_threads += 1;
                state.set_counted(true);
                state.set_blocking_future(false);
                state.set_thread();
            }
            StopReason::Terminate(_) => {
                state.set_terminated();
                state.claim();
            }
            _ => {}
        }
        reason
    }

    /// Called by a driver giving up its thread without closing. `requeue`
    /// decides, under the task lock, whether the driver goes back on the
    /// executor given the stop reason at that moment.
    pub(crate) fn leave(
        &self,
        state: &ThreadState,
        requeue: impl FnOnce(StopReason) -> bool,
    ) -> LeaveAction {
        let (action, promises) = {
            let mut inner = self.inner.lock();
            let promises = self.uncount_locked(&mut inner, state);
            if state.is_terminated() || self.terminate_kind().is_some() {
                state.set_terminated();
                (LeaveAction::Close, promises)
            } else {
                state.clear_thread();
                let reason = resolve_stop_reason(&self.stop_inputs(state));
                if requeue(reason) {
                    state.set_enqueued(true);
                    (LeaveAction::Requeue, promises)
                } else {
                    (LeaveAction::Detach, promises)
                }
            }
        };
        for promise in promises {
            promise.set_value();
        }
        action
    }

    /// Called when a blocked driver's future is realized. Returns true if
    /// the caller must enqueue the driver.
    pub(crate) fn unblock(&self, state: &ThreadState) -> bool {
        let _inner = self.inner.lock();
        state.set_blocking_future(false);
        if state.is_terminated() || state.is_on_thread() || state.is_enqueued() {
            return false;
        }
        if self.pause_requested() {
            // resume picks it up
            return false;
        }
        state.set_enqueued(true);
        true
    }

    /// Unregister a closed driver.
    pub(crate) fn driver_closed(&self, driver: &Driver, stats: Vec<crate::stats::OperatorStats>) {
        let state = driver.state();
        let (thread_promises, completion_promises, done) = {
            let mut inner = self.inner.lock();
            let thread_promises = self.uncount_locked(&mut inner, state);
            state.clear_thread();
            let index = driver.driver_id().get() as usize;
            let removed = inner
                .drivers
                .get_mut(index)
                .and_then(Option::take)
                .is_some();
            if removed {
                inner.num_running_drivers -= 1;
                inner.num_finished_drivers += 1;
                inner.stats.merge_pipeline(&stats);
                inner.stats.driver_exec_time_ms += state.total_exec_time_ms();
                if inner.num_running_drivers == 0 && inner.state == TaskState::Running {
                    inner.state = TaskState::Finished;
                }
            }
            let done = removed
                && inner.num_running_drivers == 0
                && inner.state != TaskState::Running;
            let completion_promises = if done {
                std::mem::take(&mut inner.completion_promises)
            } else {
                Vec::new()
            };
            (thread_promises, completion_promises, done)
        };
        for promise in thread_promises {
            promise.set_value();
        }
        if done {
            let stats = self.task_stats();
            info!(
                task_id = %self.task_id,
                state = %stats.state,
                elapsed_ms = stats.elapsed_ms,
                "task completed"
            );
            metrics::emit_task_stats(&stats);
        }
        for promise in completion_promises {
            promise.set_value();
        }
    }

    fn completion_future_locked(&self, inner: &mut TaskInner) -> ContinueFuture {
        if inner.state != TaskState::Running && inner.num_running_drivers == 0 {
            return ContinueFuture::ready();
        }
        let (promise, future) = make_continue_future("Task::completion");
        inner.completion_promises.push(promise);
        future
    }

    /// Realized once the task is no longer running and all drivers closed.
    pub fn task_completion_future(&self) -> ContinueFuture {
        let mut inner = self.inner.lock();
        self.completion_future_locked(&mut inner)
    }

    /// Ask every driver to go off-thread. The future is realized once no
    /// driver is on a thread outside a suspended section.
    pub fn request_pause(&self) -> ContinueFuture {
        let mut inner = self.inner.lock();
        self.pause_requested.store(true, Ordering::Release);
        debug!(task_id = %self.task_id, num_threads = inner.num_threads, "pause requested");
        if inner.num_threads == 0 {
            return ContinueFuture::ready();
        }
        let (promise, future) = make_continue_future("Task::requestPause");
        inner.thread_finish_promises.push(promise);
        future
    }

    pub fn resume(&self) {
        let (to_enqueue, to_close) = {
            let inner = self.inner.lock();
            self.pause_requested.store(false, Ordering::Release);
            let mut to_enqueue = Vec::new();
            let mut to_close = Vec::new();
            for driver in inner.drivers.iter().flatten() {
                let state = driver.state();
                if state.is_on_thread() {
                    continue;
                }
                if state.is_terminated() {
                    state.claim();
                    to_close.push(Arc::clone(driver));
                    continue;
                }
                if state.is_enqueued() || state.has_blocking_future() {
                    continue;
                }
                state.set_enqueued(true);
                to_enqueue.push(Arc::clone(driver));
            }
            self.resume_cv.notify_all();
            (to_enqueue, to_close)
        };
        debug!(
            task_id = %self.task_id,
            resumed = to_enqueue.len(),
            "task resumed"
        );
        for driver in to_close {
            driver.close();
        }
        for driver in to_enqueue {
            Driver::enqueue(driver);
        }
    }

    /// Ask every driver currently on a thread to yield once. Returns the
    /// number of drivers asked.
    pub fn request_yield(&self) -> usize {
        let inner = self.inner.lock();
        let mut num_requested = 0;
        for driver in inner.drivers.iter().flatten() {
            let state = driver.state();
            if state.is_counted() {
                state.set_yield_requested(true);
                num_requested += 1;
            }
        }
        num_requested
    }

    pub fn request_cancel(&self) -> ContinueFuture {
        self.terminate(TaskState::Canceled, TerminateKind::Cancel)
    }

    pub fn request_abort(&self) -> ContinueFuture {
        self.terminate(TaskState::Aborted, TerminateKind::Abort)
    }

    /// Latch `error` and fail the task. Only the first error is kept; later
    /// ones are logged and dropped.
    pub fn set_error(&self, error: ExecError) {
        {
            let mut inner = self.inner.lock();
            if inner.state != TaskState::Running || inner.error.is_some() {
                warn!(
                    task_id = %self.task_id,
                    error = %error,
                    "suppressing error, task already failed or terminated"
                );
                return;
            }
            inner.error = Some(error.clone());
        }
        error!(task_id = %self.task_id, error = %error, "task failed");
        self.terminate(TaskState::Failed, TerminateKind::Error);
    }

    fn terminate(&self, target: TaskState, kind: TerminateKind) -> ContinueFuture {
        let (to_close, future) = {
            let mut inner = self.inner.lock();
            if inner.state != TaskState::Running {
                return self.completion_future_locked(&mut inner);
            }
            inner.state = target;
            if inner.error.is_none() {
                match kind {
                    TerminateKind::Cancel => inner.error = Some(ExecError::Canceled),
                    TerminateKind::Abort => inner.error = Some(ExecError::Aborted),
                    TerminateKind::Error => {}
                }
            }
            self.terminate_kind.store(kind.to_u8(), Ordering::Release);

            let mut to_close = Vec::new();
            for driver in inner.drivers.iter().flatten() {
                let state = driver.state();
                state.set_terminated();
                // Drivers on a thread, suspended ones included, close themselves.
                if state.is_on_thread() {
                    continue;
                }
                state.claim();
                to_close.push(Arc::clone(driver));
            }
            (to_close, self.completion_future_locked(&mut inner))
        };
        self.resume_cv.notify_all();
        info!(task_id = %self.task_id, state = %target, "task terminated");
        for driver in to_close {
            driver.close();
        }
        future
    }

    /// Mark the calling driver suspended. Returns the stop reason at entry;
    /// a terminal reason means the section must not be entered. Must be
    /// called from the driver's own thread.
    pub fn enter_suspended(&self, state: &ThreadState) -> Result<StopReason> {
        let (reason, promises) = {
            let mut inner = self.inner.lock();
            if !state.is_current_thread() {
                return Err(ExecError::InvalidState(format!(
                    "suspended section entered off the driver thread in task {}",
                    self.task_id
                )));
            }
            if state.has_blocking_future() {
                return Err(ExecError::Invariant(format!(
                    "blocked driver entered a suspended section in task {}",
                    self.task_id
                )));
            }
            if state.is_terminated() {
                return Ok(StopReason::AlreadyTerminated);
            }
            if self.terminate_kind().is_some() {
                state.set_terminated();
                return Ok(StopReason::AlreadyTerminated);
            }
            let reason = resolve_stop_reason(&self.stop_inputs(state));
            let depth = state.num_suspensions();
            state.set_num_suspensions(depth + 1);
            if depth > 0 {
                return Ok(reason);
            }
            state.set_suspended(true);
            (reason, self.uncount_locked(&mut inner, state))
        };
        for promise in promises {
            promise.set_value();
        }
        Ok(reason)
    }

    /// Leave a suspended section. The outermost leave waits while the task
    /// is paused and returns a terminal reason if the task was terminated
    /// meanwhile.
    pub fn leave_suspended(&self, state: &ThreadState) -> Result<StopReason> {
        let mut inner = self.inner.lock();
        if !state.is_current_thread() {
            return Err(ExecError::InvalidState(format!(
                "suspended section left off the driver thread in task {}",
                self.task_id
            )));
        }
        let depth = state.num_suspensions();
        if depth == 0 {
            return Err(ExecError::Invariant(format!(
                "leave_suspended without enter_suspended in task {}",
                self.task_id
            )));
        }
        if depth > 1 {
            state.set_num_suspensions(depth - 1);
            return Ok(resolve_stop_reason(&self.stop_inputs(state)));
        }
        loop {
            if state.is_terminated() || self.terminate_kind().is_some() {
                state.set_terminated();
                state.set_num_suspensions(0);
                state.set_suspended(false);
                let kind = self.terminate_kind().unwrap_or(TerminateKind::Error);
                return Ok(StopReason::Terminate(kind));
            }
            if !self.pause_requested() {
                state.set_num_suspensions(0);
                state.set_suspended(false);
                state.set_counted(true);
                inner.num_threads += 1;
                return Ok(resolve_stop_reason(&self.stop_inputs(state)));
            }
            self.resume_cv.wait_for(&mut inner, Duration::from_millis(1));
        }
    }

    /// Reclaim memory from operators of drivers that are not running.
    pub fn reclaim(&self, target_bytes: u64) -> ReclaimStats {
        let start = Instant::now();
        let mut stats = ReclaimStats::default();
        for driver in self.drivers() {
            if stats.reclaimed_bytes >= target_bytes {
                break;
            }
            if let Err(e) = driver.reclaim(target_bytes, &mut stats) {
                warn!(task_id = %self.task_id, error = %e, "reclaim failed");
                self.set_error(e);
                break;
            }
        }
        stats.reclaim_exec_time_us += start.elapsed().as_micros() as u64;
        debug!(
            task_id = %self.task_id,
            target_bytes,
            reclaimed_bytes = stats.reclaimed_bytes,
            "task reclaim"
        );
        stats
    }

    fn drivers(&self) -> Vec<Arc<Driver>> {
        self.inner.lock().drivers.iter().flatten().cloned().collect()
    }

    /// Call `f` on every live driver, outside the task lock.
    pub fn visit_drivers(&self, mut f: impl FnMut(&Arc<Driver>)) {
        for driver in self.drivers() {
            f(&driver);
        }
    }

    /// Operator calls that have been running for at least `min_ms`. Returns
    /// `None` if the task lock could not be taken within `lock_timeout`.
    pub fn long_running_op_calls(
        &self,
        lock_timeout: Duration,
        min_ms: u64,
    ) -> Option<Vec<OpCallInfo>> {
        let inner = self.inner.try_lock_for(lock_timeout)?;
        Some(
            inner
                .drivers
                .iter()
                .flatten()
                .filter_map(|d| d.op_call_info(min_ms))
                .collect(),
        )
    }

    /// Stats of closed drivers plus a snapshot of the idle ones.
    pub fn task_stats(&self) -> TaskStats {
        let inner = self.inner.lock();
        let mut stats = inner.stats.clone();
        stats.task_id = self.task_id.clone();
        stats.state = inner.state.to_string();
        stats.num_total_drivers = inner.num_total_drivers;
        stats.num_finished_drivers = inner.num_finished_drivers;
        stats.num_running_drivers = inner.num_running_drivers;
        stats.elapsed_ms = self.created_at.elapsed().as_millis() as u64;
        for driver in inner.drivers.iter().flatten() {
            if let Some(ops) = driver.operator_stats() {
                stats.merge_pipeline(&ops);
            }
        }
        stats
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Task")
            .field("task_id", &self.task_id)
            .field("state", &inner.state)
            .field("num_running_drivers", &inner.num_running_drivers)
            .field("num_threads", &inner.num_threads)
            .field("pause_requested", &self.pause_requested())
            .finish()
    }
}
