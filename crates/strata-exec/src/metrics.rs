//! Tracing hooks for runtime metrics.
//!
//! Wire these up to a metrics backend in the binary layer.

use crate::stats::TaskStats;

pub fn emit_span(event: &str, key_values: &[(&str, String)]) {
    let span = tracing::trace_span!("strata", event);
    let _entered = span.enter();
    for (k, v) in key_values {
        tracing::trace!(%event, %k, %v, "metric");
    }
}

pub fn emit_task_stats(stats: &TaskStats) {
    let spill = stats.spill_stats();
    emit_span(
        "task_finished",
        &[
            ("task_id", stats.task_id.clone()),
            ("state", stats.state.clone()),
            ("drivers", stats.num_total_drivers.to_string()),
            ("driver_exec_time_ms", stats.driver_exec_time_ms.to_string()),
            ("elapsed_ms", stats.elapsed_ms.to_string()),
            ("output_rows", stats.output_rows().to_string()),
            ("spill_runs", spill.spill_runs.to_string()),
            ("spilled_bytes", spill.spilled_bytes.to_string()),
        ],
    );
}
