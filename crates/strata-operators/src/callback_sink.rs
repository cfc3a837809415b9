//! Sink handing every batch to a consumer callback.
//!
//! The consumer may return a future to apply backpressure: until it is
//! realized the sink reports `WaitForConsumer` and takes no more input.

use std::sync::Arc;

use strata_core::{ContinueFuture, RowBatch};

use crate::traits::{BlockingReason, BlockingState, OpError, Operator, OperatorCtx};

pub type BatchConsumer = Arc<dyn Fn(RowBatch) -> Option<ContinueFuture> + Send + Sync>;

pub struct CallbackSink {
    ctx: OperatorCtx,
    consumer: BatchConsumer,
    blocking: Option<ContinueFuture>,
    no_more_input: bool,
}

impl CallbackSink {
    pub fn new(ctx: OperatorCtx, consumer: BatchConsumer) -> Self {
        Self {
            ctx,
            consumer,
            blocking: None,
            no_more_input: false,
        }
    }
}

impl Operator for CallbackSink {
    fn ctx(&self) -> &OperatorCtx {
        &self.ctx
    }

    fn needs_input(&self) -> bool {
        !self.no_more_input && self.blocking.is_none()
    }

    fn add_input(&mut self, batch: RowBatch) -> Result<(), OpError> {
        self.blocking = (self.consumer)(batch).filter(|f| !f.is_ready());
        Ok(())
    }

    fn no_more_input(&mut self) -> Result<(), OpError> {
        self.no_more_input = true;
        Ok(())
    }

    fn get_output(&mut self) -> Result<Option<RowBatch>, OpError> {
        Ok(None)
    }

    fn is_blocked(&mut self) -> Result<BlockingState, OpError> {
        match &self.blocking {
            Some(f) if !f.is_ready() => Ok(BlockingState::blocked(
                BlockingReason::WaitForConsumer,
                f.clone(),
            )),
            _ => {
                self.blocking = None;
                Ok(BlockingState::not_blocked())
            }
        }
    }

    fn is_finished(&self) -> bool {
        self.no_more_input && self.blocking.is_none()
    }
}
