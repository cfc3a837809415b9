//! End-to-end driver/task scenarios: cancel, pause, abort, yield, blocking.

mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{counter_batches, counting_consumer, query_ctx, wait_until, FnTranslator};
use strata_core::{make_continue_future, ExecConfig, PlanBuilder};
use strata_exec::{Driver, ExecError, QueryCtx, Task, TaskState};

#[test]
fn cancel_running_task() {
    let ctx = query_ctx(4);
    let plan = PlanBuilder::new()
        .values_repeated(counter_batches(100, 1000), true, 10)
        .filter("c0 % 10 == 0")
        .plan_node()
        .unwrap();
    let rows = Arc::new(AtomicU64::new(0));
    let task = Task::create("cancel", plan, ctx, Some(counting_consumer(&rows))).unwrap();
    task.start(10).unwrap();
    assert_eq!(task.num_total_drivers(), 10);

    assert!(wait_until(Duration::from_secs(30), || rows.load(Ordering::Relaxed) > 0));
    let canceled = task.request_cancel();
    assert!(canceled.wait_for(Duration::from_secs(30)));

    assert_eq!(task.state(), TaskState::Canceled);
    assert_eq!(task.num_running_drivers(), 0);
    assert_eq!(task.error(), Some(ExecError::Canceled));
    assert_eq!(task.error().unwrap().to_string(), "Cancelled");

    let stats = task.task_stats();
    let read = stats.pipeline[0].output_rows;
    assert!(read > 0);
    assert!(read <= 10 * 1000 * 1000);
    assert!(rows.load(Ordering::Relaxed) <= read / 10 + 10);

    // A second terminal request changes nothing.
    assert!(task.request_abort().is_ready());
    assert_eq!(task.state(), TaskState::Canceled);
}

#[test]
fn pause_and_resume_produces_all_rows() {
    let ctx = query_ctx(2);
    ctx.registry().register(FnTranslator::hook(
        "Slow",
        Arc::new(|_, _| {
            std::thread::sleep(Duration::from_millis(1));
            Ok(())
        }),
    ));
    let plan = PlanBuilder::new()
        .values(counter_batches(100, 1000), true)
        .custom("Slow", serde_json::Value::Null)
        .filter("c0 % 10 == 0")
        .plan_node()
        .unwrap();
    let rows = Arc::new(AtomicU64::new(0));
    let task = Task::create("pause", plan, ctx, Some(counting_consumer(&rows))).unwrap();
    task.start(4).unwrap();

    let paused = task.request_pause();
    assert!(paused.wait_for(Duration::from_secs(30)));
    assert_eq!(task.num_threads(), 0);

    let mut paused_not_suspended = 0;
    task.visit_drivers(|driver| {
        let state = driver.state();
        if !state.is_on_thread() && !state.is_suspended() {
            paused_not_suspended += 1;
        }
    });
    assert!(paused_not_suspended >= 1);

    // Nothing runs while paused.
    let before = rows.load(Ordering::Relaxed);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(rows.load(Ordering::Relaxed), before);
    assert_eq!(task.state(), TaskState::Running);

    task.resume();
    assert!(task
        .task_completion_future()
        .wait_for(Duration::from_secs(60)));
    assert_eq!(task.state(), TaskState::Finished);
    assert_eq!(rows.load(Ordering::Relaxed), 4 * 100 * 1000 / 10);
    assert!(task.error().is_none());
}

#[test]
fn abort_wins_over_later_cancel() {
    let ctx = query_ctx(2);
    let plan = PlanBuilder::new()
        .values_repeated(counter_batches(10, 1000), true, 1000)
        .filter("c0 % 2 == 0")
        .plan_node()
        .unwrap();
    let task = Task::create("abort", plan, ctx, None).unwrap();
    task.start(3).unwrap();

    let aborted = task.request_abort();
    let canceled = task.request_cancel();
    assert!(aborted.wait_for(Duration::from_secs(30)));
    assert!(canceled.wait_for(Duration::from_secs(30)));
    assert_eq!(task.state(), TaskState::Aborted);
    assert_eq!(task.error(), Some(ExecError::Aborted));
    assert_eq!(task.num_running_drivers(), 0);
    assert_eq!(task.num_finished_drivers(), 3);
}

#[test]
fn time_slice_forces_yield() {
    let ctx = QueryCtx::new(ExecConfig {
        executor_threads: 2,
        driver_cpu_time_slice_limit_ms: 1,
        ..Default::default()
    })
    .unwrap();
    ctx.registry().register(FnTranslator::hook(
        "Slow",
        Arc::new(|_, _| {
            std::thread::sleep(Duration::from_millis(2));
            Ok(())
        }),
    ));
    let plan = PlanBuilder::new()
        .values(counter_batches(20, 100), true)
        .custom("Slow", serde_json::Value::Null)
        .plan_node()
        .unwrap();
    let rows = Arc::new(AtomicU64::new(0));
    let before = Driver::yield_count();
    let task = Task::create("slice", plan, ctx, Some(counting_consumer(&rows))).unwrap();
    task.start(4).unwrap();
    assert!(task.request_yield() <= 4);
    assert!(task
        .task_completion_future()
        .wait_for(Duration::from_secs(60)));

    assert_eq!(task.state(), TaskState::Finished);
    assert_eq!(rows.load(Ordering::Relaxed), 4 * 20 * 100);
    assert!(Driver::yield_count() > before);
    assert!(task.task_stats().driver_exec_time_ms > 0);
}

#[test]
fn blocked_drivers_count_as_off_thread() {
    let ctx = query_ctx(2);
    let (promise, gate) = make_continue_future("test gate");
    ctx.registry()
        .register(FnTranslator::gate("Gate", gate.clone(), true));
    let plan = PlanBuilder::new()
        .values(counter_batches(5, 100), true)
        .custom("Gate", serde_json::Value::Null)
        .plan_node()
        .unwrap();
    let rows = Arc::new(AtomicU64::new(0));
    let task = Task::create("gate", plan, ctx, Some(counting_consumer(&rows))).unwrap();
    task.start(2).unwrap();

    assert!(wait_until(Duration::from_secs(10), || {
        let mut blocked = 0;
        task.visit_drivers(|d| {
            if d.state().has_blocking_future() {
                blocked += 1;
            }
        });
        blocked == 2
    }));

    // Blocked drivers acknowledge a pause right away.
    assert!(task.request_pause().wait_for(Duration::from_secs(10)));
    assert_eq!(task.num_threads(), 0);

    // Realized while paused: drivers wait for the resume.
    promise.set_value();
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(rows.load(Ordering::Relaxed), 0);
    assert_eq!(task.state(), TaskState::Running);

    task.resume();
    assert!(task
        .task_completion_future()
        .wait_for(Duration::from_secs(30)));
    assert_eq!(task.state(), TaskState::Finished);
    assert_eq!(rows.load(Ordering::Relaxed), 2 * 5 * 100);
    let stats = task.task_stats();
    assert!(stats.pipeline[1].blocked_count >= 2);
}

#[test]
fn cancel_closes_blocked_drivers() {
    let ctx = query_ctx(2);
    let (_promise, gate) = make_continue_future("never");
    ctx.registry().register(FnTranslator::gate("Gate", gate, true));
    let plan = PlanBuilder::new()
        .values(counter_batches(1, 10), true)
        .custom("Gate", serde_json::Value::Null)
        .plan_node()
        .unwrap();
    let task = Task::create("blocked-cancel", plan, ctx, None).unwrap();
    task.start(3).unwrap();
    assert!(wait_until(Duration::from_secs(10), || task.num_threads() == 0
        && {
            let mut blocked = 0;
            task.visit_drivers(|d| blocked += d.state().has_blocking_future() as usize);
            blocked == 3
        }));

    assert!(task.request_cancel().wait_for(Duration::from_secs(10)));
    assert_eq!(task.state(), TaskState::Canceled);
    assert_eq!(task.num_finished_drivers(), 3);
}

#[test]
fn long_running_operator_calls_are_reported() {
    let ctx = query_ctx(2);
    let (release, gate) = make_continue_future("sleepy");
    ctx.registry().register(FnTranslator::hook(
        "Sleepy",
        Arc::new(move |_, _| {
            gate.wait_for(Duration::from_secs(10));
            Ok(())
        }),
    ));
    let plan = PlanBuilder::new()
        .values(counter_batches(1, 10), false)
        .custom("Sleepy", serde_json::Value::Null)
        .plan_node()
        .unwrap();
    let task = Task::create("long-call", plan, ctx, None).unwrap();
    task.start(1).unwrap();

    let mut calls = Vec::new();
    assert!(wait_until(Duration::from_secs(10), || {
        calls = task
            .long_running_op_calls(Duration::from_secs(1), 50)
            .unwrap_or_default();
        !calls.is_empty()
    }));
    let call = &calls[0];
    assert_eq!(call.op_call, "Sleepy.1::addInput");
    assert_eq!(call.op_id, 1);
    assert_eq!(call.task_id, "long-call");
    assert!(call.duration_ms >= 50);
    assert_ne!(call.tid, 0);

    release.set_value();
    assert!(task
        .task_completion_future()
        .wait_for(Duration::from_secs(10)));
    assert!(task
        .long_running_op_calls(Duration::from_secs(1), 0)
        .unwrap()
        .is_empty());
}

#[test]
fn yield_request_does_not_outlive_blocking() {
    let ctx = query_ctx(2);
    let entered = Arc::new(AtomicU64::new(0));
    let (release_promise, release) = make_continue_future("hook release");
    let (gate_promise, gate) = make_continue_future("test gate");
    {
        let entered = Arc::clone(&entered);
        ctx.registry().register(FnTranslator::hook(
            "Hold",
            Arc::new(move |_, _| {
                entered.fetch_add(1, Ordering::AcqRel);
                release.wait();
                Ok(())
            }),
        ));
    }
    ctx.registry()
        .register(FnTranslator::gate("Gate", gate, true));
    let plan = PlanBuilder::new()
        .values(counter_batches(5, 100), false)
        .custom("Hold", serde_json::Value::Null)
        .custom("Gate", serde_json::Value::Null)
        .plan_node()
        .unwrap();
    let rows = Arc::new(AtomicU64::new(0));
    let task = Task::create("yield-block", plan, ctx, Some(counting_consumer(&rows))).unwrap();
    task.start(1).unwrap();

    // The driver is inside an operator call, so it is on a thread.
    assert!(wait_until(Duration::from_secs(30), || entered.load(Ordering::Acquire) > 0));
    assert_eq!(task.request_yield(), 1);
    let mut pending = 0;
    task.visit_drivers(|d| pending += d.state().yield_requested() as usize);
    assert_eq!(pending, 1);

    // It blocks on the gate before its next stop check.
    release_promise.set_value();
    assert!(wait_until(Duration::from_secs(30), || task.num_threads() == 0
        && task.num_running_drivers() == 1));
    task.visit_drivers(|d| assert!(!d.state().yield_requested()));
    assert_eq!(task.request_yield(), 0);

    gate_promise.set_value();
    assert!(task
        .task_completion_future()
        .wait_for(Duration::from_secs(30)));
    assert_eq!(task.state(), TaskState::Finished);
    assert_eq!(rows.load(Ordering::Relaxed), 5 * 100);
}
