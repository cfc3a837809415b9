//! Helpers shared by the integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use strata_core::{Column, ContinueFuture, ExecConfig, PlanNode, RowBatch, Scalar};
use strata_exec::QueryCtx;
use strata_operators::{
    BatchConsumer, BlockingReason, BlockingState, OpError, Operator, OperatorCtx,
    PlanNodeTranslator,
};

pub fn query_ctx(threads: usize) -> Arc<QueryCtx> {
    QueryCtx::new(ExecConfig {
        executor_threads: threads,
        ..Default::default()
    })
    .unwrap()
}

/// `batches` batches of `rows` rows; `c0` counts up from zero across batches.
pub fn counter_batches(batches: usize, rows: usize) -> Vec<RowBatch> {
    (0..batches)
        .map(|b| {
            let base = (b * rows) as i64;
            let values = (0..rows as i64).map(|i| Scalar::I64(base + i)).collect();
            RowBatch::new(vec![Column::new("c0", values)])
        })
        .collect()
}

pub fn counting_consumer(rows: &Arc<AtomicU64>) -> BatchConsumer {
    let rows = Arc::clone(rows);
    Arc::new(move |batch: RowBatch| {
        rows.fetch_add(batch.num_rows() as u64, Ordering::Relaxed);
        None
    })
}

/// Poll `f` until it returns true or `timeout` passes.
pub fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    f()
}

pub type InputHook = Arc<dyn Fn(&OperatorCtx, &RowBatch) -> Result<(), OpError> + Send + Sync>;

/// Passes batches through, calling a hook on every input batch.
pub struct HookOperator {
    ctx: OperatorCtx,
    hook: InputHook,
    pending: Option<RowBatch>,
    no_more_input: bool,
}

impl Operator for HookOperator {
    fn ctx(&self) -> &OperatorCtx {
        &self.ctx
    }

    fn needs_input(&self) -> bool {
        !self.no_more_input && self.pending.is_none()
    }

    fn add_input(&mut self, batch: RowBatch) -> Result<(), OpError> {
        (self.hook)(&self.ctx, &batch)?;
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
}

/// Passes batches through once `gate` is realized; blocked until then.
pub struct GateOperator {
    ctx: OperatorCtx,
    gate: ContinueFuture,
    reason: BlockingReason,
    with_future: bool,
    pending: Option<RowBatch>,
    no_more_input: bool,
}

impl GateOperator {
    pub fn new(ctx: OperatorCtx, gate: ContinueFuture) -> Self {
        Self {
            ctx,
            gate,
            reason: BlockingReason::WaitForProducer,
            with_future: true,
            pending: None,
            no_more_input: false,
        }
    }
}

impl Operator for GateOperator {
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

    fn is_blocked(&mut self) -> Result<BlockingState, OpError> {
        if self.gate.is_ready() {
            return Ok(BlockingState::not_blocked());
        }
        Ok(BlockingState {
            reason: self.reason,
            future: self.with_future.then(|| self.gate.clone()),
        })
    }

    fn is_finished(&self) -> bool {
        self.no_more_input && self.pending.is_none()
    }
}

type MakeOperator = Box<dyn Fn(OperatorCtx) -> Result<Box<dyn Operator>, OpError> + Send + Sync>;

/// Translator for test-only custom plan nodes.
pub struct FnTranslator {
    kind: String,
    make: MakeOperator,
}

impl FnTranslator {
    pub fn new(
        kind: &str,
        make: impl Fn(OperatorCtx) -> Result<Box<dyn Operator>, OpError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind: kind.to_string(),
            make: Box::new(make),
        })
    }

    pub fn hook(kind: &str, hook: InputHook) -> Arc<Self> {
        Self::new(kind, move |ctx| {
            Ok(Box::new(HookOperator {
                ctx,
                hook: Arc::clone(&hook),
                pending: None,
                no_more_input: false,
            }))
        })
    }

    pub fn gate(kind: &str, gate: ContinueFuture, with_future: bool) -> Arc<Self> {
        Self::new(kind, move |ctx| {
            let mut op = GateOperator::new(ctx, gate.clone());
            op.with_future = with_future;
            Ok(Box::new(op))
        })
    }
}

impl PlanNodeTranslator for FnTranslator {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn to_operator(&self, ctx: OperatorCtx, _node: &PlanNode) -> Result<Box<dyn Operator>, OpError> {
        (self.make)(ctx)
    }
}
