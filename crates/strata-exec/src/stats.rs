//! Operator and task runtime statistics.

use serde::Serialize;
use strata_core::SpillStats;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OperatorStats {
    pub operator_type: String,
    pub plan_node_id: String,
    pub op_id: u64,
    pub input_rows: u64,
    pub input_batches: u64,
    pub output_rows: u64,
    pub output_batches: u64,
    pub add_input_nanos: u64,
    pub get_output_nanos: u64,
    pub blocked_count: u64,
    pub peak_memory_bytes: u64,
    pub spill: SpillStats,
}

impl OperatorStats {
    pub fn new(operator_type: &str, plan_node_id: &str, op_id: u64) -> Self {
        Self {
            operator_type: operator_type.to_string(),
            plan_node_id: plan_node_id.to_string(),
            op_id,
            ..Default::default()
        }
    }

    /// Fold another driver's stats for the same pipeline position into these.
    pub fn merge(&mut self, other: &OperatorStats) {
        if self.operator_type.is_empty() {
            self.operator_type = other.operator_type.clone();
            self.plan_node_id = other.plan_node_id.clone();
            self.op_id = other.op_id;
        }
        self.input_rows += other.input_rows;
        self.input_batches += other.input_batches;
        self.output_rows += other.output_rows;
        self.output_batches += other.output_batches;
        self.add_input_nanos += other.add_input_nanos;
        self.get_output_nanos += other.get_output_nanos;
        self.blocked_count += other.blocked_count;
        self.peak_memory_bytes = self.peak_memory_bytes.max(other.peak_memory_bytes);
        self.spill += other.spill;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    pub task_id: String,
    pub state: String,
    pub num_total_drivers: usize,
    pub num_finished_drivers: usize,
    pub num_running_drivers: usize,
    /// Sum of on-thread time over closed drivers.
    pub driver_exec_time_ms: u64,
    pub elapsed_ms: u64,
    /// One entry per pipeline position, aggregated over drivers.
    pub pipeline: Vec<OperatorStats>,
}

impl TaskStats {
    pub fn merge_pipeline(&mut self, stats: &[OperatorStats]) {
        if self.pipeline.len() < stats.len() {
            self.pipeline.resize_with(stats.len(), OperatorStats::default);
        }
        for (agg, s) in self.pipeline.iter_mut().zip(stats) {
            agg.merge(s);
        }
    }

    /// Sum of spill stats over all operators.
    pub fn spill_stats(&self) -> SpillStats {
        let mut total = SpillStats::default();
        for op in &self.pipeline {
            total += op.spill;
        }
        total
    }

    pub fn output_rows(&self) -> u64 {
        self.pipeline.last().map(|s| s.output_rows).unwrap_or_default()
    }
}
