//! Source operator emitting in-memory batches.

use std::sync::Arc;

use strata_core::RowBatch;

use crate::traits::{OpError, Operator, OperatorCtx};

pub struct ValuesOperator {
    ctx: OperatorCtx,
    values: Arc<Vec<RowBatch>>,
    repeat_times: usize,
    round: usize,
    next: usize,
}

impl ValuesOperator {
    pub fn new(ctx: OperatorCtx, values: Arc<Vec<RowBatch>>, repeat_times: usize) -> Self {
        Self {
            ctx,
            values,
            repeat_times,
            round: 0,
            next: 0,
        }
    }
}

impl Operator for ValuesOperator {
    fn ctx(&self) -> &OperatorCtx {
        &self.ctx
    }

    fn needs_input(&self) -> bool {
        false
    }

    fn add_input(&mut self, _batch: RowBatch) -> Result<(), OpError> {
        Err(OpError::Exec("Values operator does not take input".into()))
    }

    fn no_more_input(&mut self) -> Result<(), OpError> {
        Ok(())
    }

    fn get_output(&mut self) -> Result<Option<RowBatch>, OpError> {
        if self.is_finished() {
            return Ok(None);
        }
        let batch = self.values[self.next].clone();
        self.next += 1;
        if self.next == self.values.len() {
            self.next = 0;
            self.round += 1;
        }
        Ok(Some(batch))
    }

    fn is_finished(&self) -> bool {
        self.values.is_empty() || self.round >= self.repeat_times
    }
}
