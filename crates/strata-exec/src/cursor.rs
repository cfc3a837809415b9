//! Pull-style access to a task's results.
//!
//! A [`TaskCursor`] runs its task with a [`TaskQueue`] as the batch consumer.
//! The queue is capped in bytes: once full, producers get a future that the
//! consumer realizes as it drains, which blocks their sinks in the meantime.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use strata_core::{make_continue_future, ContinueFuture, ContinuePromise, PlanNode, RowBatch};
use strata_operators::BatchConsumer;

use crate::error::{ExecError, Result};
use crate::query_ctx::QueryCtx;
use crate::task::{Task, TaskState};

#[derive(Default)]
struct QueueInner {
    batches: VecDeque<RowBatch>,
    bytes: usize,
    producer_promises: Vec<ContinuePromise>,
    closed: bool,
}

pub struct TaskQueue {
    max_bytes: usize,
    inner: Mutex<QueueInner>,
    cv: Condvar,
}

impl TaskQueue {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes: max_bytes.max(1),
            inner: Mutex::new(QueueInner::default()),
            cv: Condvar::new(),
        }
    }

    /// Add a batch. Returns a future to wait on when the queue is full.
    /// Batches offered after `close` are dropped.
    pub fn enqueue(&self, batch: RowBatch) -> Option<ContinueFuture> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return None;
        }
        inner.bytes += batch.estimated_bytes();
        inner.batches.push_back(batch);
        self.cv.notify_one();
        if inner.bytes < self.max_bytes {
            return None;
        }
        let (promise, future) = make_continue_future("TaskQueue::enqueue");
        inner.producer_promises.push(promise);
        Some(future)
    }

    /// Next batch, waiting until one arrives. `None` once the queue is
    /// closed and drained.
    pub fn dequeue(&self) -> Option<RowBatch> {
        let (batch, released) = {
            let mut inner = self.inner.lock();
            loop {
                if let Some(batch) = inner.batches.pop_front() {
                    inner.bytes = inner.bytes.saturating_sub(batch.estimated_bytes());
                    let released = if inner.bytes < self.max_bytes {
                        std::mem::take(&mut inner.producer_promises)
                    } else {
                        Vec::new()
                    };
                    break (Some(batch), released);
                }
                if inner.closed {
                    break (None, Vec::new());
                }
                self.cv.wait(&mut inner);
            }
        };
        for promise in released {
            promise.set_value();
        }
        batch
    }

    /// No more batches will be accepted; waiting producers are released.
    pub fn close(&self) {
        let released = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            std::mem::take(&mut inner.producer_promises)
        };
        self.cv.notify_all();
        for promise in released {
            promise.set_value();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> usize {
        self.inner.lock().bytes
    }
}

pub struct TaskCursor {
    task: Arc<Task>,
    queue: Arc<TaskQueue>,
    max_drivers: usize,
    started: bool,
    current: Option<RowBatch>,
    peeked: Option<RowBatch>,
    at_end: bool,
}

impl TaskCursor {
    /// Create a cursor over `plan`. The task starts on the first
    /// `move_next`/`has_next` call with `config.max_drivers` drivers.
    pub fn new(plan: PlanNode, query_ctx: Arc<QueryCtx>) -> Result<Self> {
        let queue = Arc::new(TaskQueue::new(query_ctx.config().cursor_queue_max_bytes));
        let consumer: BatchConsumer = {
            let queue = Arc::clone(&queue);
            Arc::new(move |batch| queue.enqueue(batch))
        };
        let max_drivers = query_ctx.config().max_drivers;
        let task_id = format!("{}.cursor.{}", query_ctx.query_id(), uuid::Uuid::new_v4().simple());
        let task = Task::create(task_id, plan, query_ctx, Some(consumer))?;
        {
            let queue = Arc::clone(&queue);
            task.task_completion_future().on_ready(move || queue.close());
        }
        Ok(Self {
            task,
            queue,
            max_drivers,
            started: false,
            current: None,
            peeked: None,
            at_end: false,
        })
    }

    pub fn with_max_drivers(mut self, max_drivers: usize) -> Self {
        self.max_drivers = max_drivers;
        self
    }

    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    pub fn current(&self) -> Option<&RowBatch> {
        self.current.as_ref()
    }

    /// Advance to the next batch. Returns false at the end of a finished
    /// task; a canceled, aborted or failed task reports its error once the
    /// batches it produced are drained.
    pub fn move_next(&mut self) -> Result<bool> {
        if self.at_end {
            self.current = None;
            return Ok(false);
        }
        let next = match self.peeked.take() {
            Some(batch) => Some(batch),
            None => self.fetch()?,
        };
        self.at_end = next.is_none();
        self.current = next;
        Ok(self.current.is_some())
    }

    pub fn has_next(&mut self) -> Result<bool> {
        if self.at_end {
            return Ok(false);
        }
        if self.peeked.is_none() {
            self.peeked = self.fetch()?;
        }
        Ok(self.peeked.is_some())
    }

    fn fetch(&mut self) -> Result<Option<RowBatch>> {
        if !self.started {
            self.started = true;
            self.task.start(self.max_drivers)?;
        }
        if let Some(batch) = self.queue.dequeue() {
            return Ok(Some(batch));
        }
        match self.task.state() {
            TaskState::Finished => Ok(None),
            TaskState::Canceled => Err(self.task.error().unwrap_or(ExecError::Canceled)),
            TaskState::Aborted => Err(self.task.error().unwrap_or(ExecError::Aborted)),
            TaskState::Failed => Err(self.task.error().unwrap_or_else(|| {
                ExecError::Invariant(format!("task {} failed without error", self.task.task_id()))
            })),
            TaskState::Running => Err(ExecError::Invariant(format!(
                "result queue of task {} closed while running",
                self.task.task_id()
            ))),
        }
    }
}

impl Drop for TaskCursor {
    fn drop(&mut self) {
        if self.task.is_running() {
            self.task.request_cancel();
        }
        self.queue.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use strata_core::{Column, ExecConfig, PlanBuilder, Scalar};

    fn batch(rows: i64) -> RowBatch {
        RowBatch::new(vec![Column::new("c0", (0..rows).map(Scalar::I64).collect())])
    }

    #[test]
    fn full_queue_blocks_producer_until_drained() {
        let one = batch(10).estimated_bytes();
        let queue = TaskQueue::new(one * 2);
        assert!(queue.enqueue(batch(10)).is_none());
        let future = queue.enqueue(batch(10)).unwrap();
        assert!(!future.is_ready());
        assert_eq!(queue.len(), 2);
        assert!(queue.dequeue().is_some());
        assert!(future.is_ready());

        queue.close();
        assert!(queue.enqueue(batch(1)).is_none());
        assert!(queue.dequeue().is_some());
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn cursor_reads_all_rows() {
        let config = ExecConfig {
            executor_threads: 2,
            max_drivers: 2,
            cursor_queue_max_bytes: 1024,
            ..Default::default()
        };
        let ctx = QueryCtx::new(config).unwrap();
        let plan = PlanBuilder::new()
            .values_repeated(vec![batch(100)], true, 20)
            .filter("c0 % 10 == 0")
            .plan_node()
            .unwrap();
        let mut cursor = TaskCursor::new(plan, ctx).unwrap();
        let mut rows = 0;
        assert!(cursor.has_next().unwrap());
        while cursor.move_next().unwrap() {
            rows += cursor.current().unwrap().num_rows();
        }
        assert_eq!(rows, 2 * 20 * 10);
        assert!(!cursor.move_next().unwrap());
        assert!(cursor
            .task()
            .task_completion_future()
            .wait_for(Duration::from_secs(10)));
        assert_eq!(cursor.task().state(), TaskState::Finished);
    }
}
