//! Scoped suspension of the calling driver.
//!
//! Wrap code that may block for reasons unrelated to the query (waiting for
//! memory arbitration, for example) in a [`SuspendedSection`]. While it
//! lives, the driver does not count as running, so pause requests on its
//! task can complete.

use std::sync::Arc;

use tracing::warn;

use crate::driver::Driver;
use crate::error::{ExecError, Result};

pub struct SuspendedSection {
    driver: Arc<Driver>,
}

impl SuspendedSection {
    /// Fails if the task was terminated before entry or if called off the
    /// driver's thread.
    pub fn new(driver: Arc<Driver>) -> Result<Self> {
        let reason = driver.task().enter_suspended(driver.state())?;
        if reason.is_terminal() {
            return Err(ExecError::Terminated(format!(
                "Terminate detected when entering suspended section for driver {} from task {}",
                driver.driver_id().get(),
                driver.task().task_id()
            )));
        }
        Ok(Self { driver })
    }

    pub fn driver(&self) -> &Arc<Driver> {
        &self.driver
    }
}

impl Drop for SuspendedSection {
    fn drop(&mut self) {
        match self.driver.task().leave_suspended(self.driver.state()) {
            Ok(reason) if reason.is_terminal() => warn!(
                "Terminate detected when leaving suspended section for driver {} from task {}",
                self.driver.driver_id().get(),
                self.driver.task().task_id()
            ),
            Ok(_) => {}
            Err(e) => warn!(
                error = %e,
                task_id = %self.driver.task().task_id(),
                "failed to leave suspended section"
            ),
        }
    }
}
