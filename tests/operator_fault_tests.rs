//! Operator failures: panics, errors, protocol faults and driver creation.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{counter_batches, query_ctx, FnTranslator, GateOperator};
use strata_core::{make_continue_future, PlanBuilder, RowBatch};
use strata_exec::{ExecError, Task, TaskState};
use strata_operators::{OpError, Operator, OperatorCtx};

fn run_to_end(task: &Arc<Task>, drivers: usize) {
    task.start(drivers).unwrap();
    assert!(task
        .task_completion_future()
        .wait_for(Duration::from_secs(30)));
}

#[test]
fn panic_in_operator_fails_task_with_tagged_error() {
    let ctx = query_ctx(2);
    ctx.registry().register(FnTranslator::hook(
        "Explode",
        Arc::new(|_, _| panic!("boom")),
    ));
    let plan = PlanBuilder::new()
        .values(counter_batches(3, 10), true)
        .custom("Explode", serde_json::Value::Null)
        .plan_node()
        .unwrap();
    let task = Task::create("panic", plan, ctx, None).unwrap();
    run_to_end(&task, 4);

    assert_eq!(task.state(), TaskState::Failed);
    assert_eq!(task.num_running_drivers(), 0);
    match task.error() {
        Some(ExecError::Operator {
            method,
            operator,
            plan_node_id,
            message,
        }) => {
            assert_eq!(method, "addInput");
            assert_eq!(operator, "Explode");
            assert_eq!(plan_node_id, "1");
            assert!(message.contains("boom"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(task
        .error()
        .unwrap()
        .to_string()
        .starts_with("Operator::addInput failed for [operator: Explode, plan node ID: 1]"));
}

#[test]
fn first_operator_error_wins() {
    let ctx = query_ctx(4);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    ctx.registry().register(FnTranslator::hook(
        "Fail",
        Arc::new(move |op_ctx, _| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Err(OpError::Exec(format!(
                "failure {n} in driver {}",
                op_ctx.driver_id.get()
            )))
        }),
    ));
    let plan = PlanBuilder::new()
        .values(counter_batches(1, 10), true)
        .custom("Fail", serde_json::Value::Null)
        .plan_node()
        .unwrap();
    let task = Task::create("first-error", plan, ctx, None).unwrap();
    run_to_end(&task, 4);

    assert_eq!(task.state(), TaskState::Failed);
    let error = task.error().unwrap();
    let first = error.to_string();
    assert!(first.contains("execution error: failure"));
    // Later failures do not replace the latched one.
    task.set_error(ExecError::Invariant("late".into()));
    assert_eq!(task.error().unwrap().to_string(), first);
}

#[test]
fn blocked_without_future_is_a_fault() {
    let ctx = query_ctx(2);
    let (_promise, gate) = make_continue_future("unused");
    ctx.registry()
        .register(FnTranslator::gate("Faulty", gate, false));
    let plan = PlanBuilder::new()
        .values(counter_batches(1, 10), false)
        .custom("Faulty", serde_json::Value::Null)
        .plan_node()
        .unwrap();
    let task = Task::create("no-future", plan, ctx, None).unwrap();
    run_to_end(&task, 1);

    assert_eq!(task.state(), TaskState::Failed);
    assert_eq!(
        task.error(),
        Some(ExecError::Invariant(
            "The operator Faulty is blocked but blocking future is not valid".into()
        ))
    );
}

/// Passes batches through and panics when closed.
struct ClosePanics {
    ctx: OperatorCtx,
    pending: Option<RowBatch>,
    no_more_input: bool,
}

impl Operator for ClosePanics {
    fn ctx(&self) -> &OperatorCtx {
        &self.ctx
    }
    fn needs_input(&self) -> bool {
        !self.no_more_input && self.pending.is_none()
    }
    fn add_input(&mut self, batch: RowBatch) -> Result<(), OpError> {
        self.pending = Some(batch);
        Ok(())
    }
    fn no_more_input(&mut self) -> Result<(), OpError> {
        self.no_more_input = true;
        Ok(())
    }
    fn get_output(&mut self) -> Result<Option<RowBatch>, OpError> {
        Ok(self.pending.take())
    }
    fn is_finished(&self) -> bool {
        self.no_more_input && self.pending.is_none()
    }
    fn close(&mut self) {
        panic!("close failed");
    }
}

#[test]
fn panic_in_close_does_not_fail_finished_task() {
    let ctx = query_ctx(2);
    ctx.registry().register(FnTranslator::new("ClosePanics", |op_ctx| {
        Ok(Box::new(ClosePanics {
            ctx: op_ctx,
            pending: None,
            no_more_input: false,
        }))
    }));
    let plan = PlanBuilder::new()
        .values(counter_batches(2, 10), true)
        .custom("ClosePanics", serde_json::Value::Null)
        .plan_node()
        .unwrap();
    let task = Task::create("close-panics", plan, ctx, None).unwrap();
    run_to_end(&task, 2);
    assert_eq!(task.state(), TaskState::Finished);
    assert!(task.error().is_none());
    assert_eq!(task.task_stats().pipeline[1].output_rows, 2 * 2 * 10);
}

#[test]
fn driver_creation_failure_fails_task() {
    let ctx = query_ctx(2);
    ctx.registry().register(FnTranslator::new("Flaky", |op_ctx| {
        if op_ctx.driver_id.get() == 2 {
            return Err(OpError::Plan("dependency failed to initialize".into()));
        }
        let (_promise, gate) = make_continue_future("never");
        Ok(Box::new(GateOperator::new(op_ctx, gate)))
    }));
    let plan = PlanBuilder::new()
        .values(counter_batches(1, 10), true)
        .custom("Flaky", serde_json::Value::Null)
        .plan_node()
        .unwrap();
    let task = Task::create("creation", plan, ctx, None).unwrap();

    let err = task.start(4).unwrap_err();
    assert!(matches!(&err, ExecError::DriverCreation(msg) if msg.contains("dependency failed")));
    assert_eq!(task.state(), TaskState::Failed);
    assert_eq!(task.error(), Some(err));
    assert!(task
        .task_completion_future()
        .wait_for(Duration::from_secs(10)));
    assert_eq!(task.num_total_drivers(), 2);
    assert_eq!(task.num_finished_drivers(), 2);
    assert_eq!(task.num_running_drivers(), 0);
}

#[test]
fn unknown_custom_node_fails_at_start() {
    let ctx = query_ctx(1);
    let plan = PlanBuilder::new()
        .values(counter_batches(1, 10), true)
        .custom("Missing", serde_json::Value::Null)
        .plan_node()
        .unwrap();
    let task = Task::create("missing", plan, ctx, None).unwrap();
    let err = task.start(2).unwrap_err();
    assert!(err.to_string().starts_with("driver creation failed: Missing (1)"));
    assert_eq!(task.state(), TaskState::Failed);
    assert_eq!(task.num_total_drivers(), 0);
}
