//! Pull-based consumption of task results through `TaskCursor`.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{counter_batches, FnTranslator};
use strata_core::{ExecConfig, PlanBuilder};
use strata_exec::{ExecError, QueryCtx, TaskCursor, TaskState};
use strata_operators::OpError;

fn small_queue_ctx() -> Arc<QueryCtx> {
    QueryCtx::new(ExecConfig {
        executor_threads: 2,
        max_drivers: 2,
        cursor_queue_max_bytes: 16 << 10,
        ..Default::default()
    })
    .unwrap()
}

#[test]
fn failing_pipeline_surfaces_operator_error() {
    let ctx = small_queue_ctx();
    ctx.registry().register(FnTranslator::hook(
        "FailLate",
        Arc::new(|_, batch| {
            let first = batch.column("c0").and_then(|c| c.values[0].as_i64());
            match first {
                Some(v) if v >= 500 => Err(OpError::Exec("late failure".into())),
                _ => Ok(()),
            }
        }),
    ));
    let plan = PlanBuilder::new()
        .values(counter_batches(10, 100), false)
        .custom("FailLate", serde_json::Value::Null)
        .plan_node()
        .unwrap();
    let mut cursor = TaskCursor::new(plan, ctx).unwrap().with_max_drivers(1);

    let mut rows = 0;
    let err = loop {
        match cursor.move_next() {
            Ok(true) => rows += cursor.current().unwrap().num_rows(),
            Ok(false) => panic!("cursor ended without an error"),
            Err(e) => break e,
        }
    };
    assert!(rows <= 500);
    match err {
        ExecError::Operator {
            method, message, ..
        } => {
            assert_eq!(method, "addInput");
            assert!(message.contains("late failure"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(cursor.task().state(), TaskState::Failed);
}

#[test]
fn dropping_cursor_cancels_task() {
    let ctx = small_queue_ctx();
    let plan = PlanBuilder::new()
        .values_repeated(counter_batches(100, 1000), true, 100)
        .plan_node()
        .unwrap();
    let mut cursor = TaskCursor::new(plan, ctx).unwrap();
    assert!(cursor.move_next().unwrap());
    assert_eq!(cursor.current().unwrap().num_rows(), 1000);
    let task = Arc::clone(cursor.task());
    drop(cursor);

    assert!(task
        .task_completion_future()
        .wait_for(Duration::from_secs(30)));
    assert_eq!(task.state(), TaskState::Canceled);
    assert_eq!(task.num_running_drivers(), 0);
}

#[test]
fn has_next_does_not_consume() {
    let ctx = small_queue_ctx();
    let plan = PlanBuilder::new()
        .values(counter_batches(3, 10), false)
        .filter("c0 % 2 == 0")
        .plan_node()
        .unwrap();
    let mut cursor = TaskCursor::new(plan, ctx).unwrap().with_max_drivers(1);
    assert!(cursor.current().is_none());
    assert!(cursor.has_next().unwrap());
    assert!(cursor.has_next().unwrap());

    let mut values = Vec::new();
    while cursor.move_next().unwrap() {
        let batch = cursor.current().unwrap();
        values.extend(batch.columns[0].values.iter().map(|v| v.as_i64().unwrap()));
    }
    assert_eq!(values, (0..30).step_by(2).collect::<Vec<i64>>());
    assert!(!cursor.has_next().unwrap());
    assert!(cursor.current().is_none());
}

#[test]
fn cursors_share_one_executor() {
    let ctx = small_queue_ctx();
    let mut cursors: Vec<TaskCursor> = (0..3)
        .map(|_| {
            let plan = PlanBuilder::new()
                .values_repeated(counter_batches(20, 500), true, 2)
                .filter("c0 % 5 == 0")
                .plan_node()
                .unwrap();
            TaskCursor::new(plan, Arc::clone(&ctx)).unwrap()
        })
        .collect();

    // Interleave reads so every task makes progress under backpressure.
    let mut totals = vec![0usize; cursors.len()];
    let mut live = cursors.len();
    while live > 0 {
        live = 0;
        for (cursor, total) in cursors.iter_mut().zip(totals.iter_mut()) {
            if cursor.move_next().unwrap() {
                *total += cursor.current().unwrap().num_rows();
                live += 1;
            }
        }
    }
    for total in totals {
        assert_eq!(total, 2 * 2 * 20 * 500 / 5);
    }
    for cursor in &cursors {
        assert_eq!(cursor.task().state(), TaskState::Finished);
    }
}
