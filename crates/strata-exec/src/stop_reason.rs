//! Why a driver should stop running.
//!
//! The decision is a pure function over a snapshot of task and driver flags
//! so every combination can be checked without threads. Priority:
//! termination already visible to the driver, then an active termination
//! request, then pause, then yield.

use std::fmt;

/// Kind of termination requested for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminateKind {
    Cancel,
    Abort,
    /// The task failed; drivers are torn down like on abort.
    Error,
}

impl TerminateKind {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            TerminateKind::Cancel => 1,
            TerminateKind::Abort => 2,
            TerminateKind::Error => 3,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(TerminateKind::Cancel),
            2 => Some(TerminateKind::Abort),
            3 => Some(TerminateKind::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopReason {
    /// Keep running.
    None,
    /// Give up the thread and get re-enqueued.
    Yield,
    /// Go off-thread until the task is resumed.
    Pause,
    /// Tear the driver down.
    Terminate(TerminateKind),
    /// Termination was already processed for this driver.
    AlreadyTerminated,
}

impl StopReason {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StopReason::Terminate(_) | StopReason::AlreadyTerminated)
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::None => f.write_str("NONE"),
            StopReason::Yield => f.write_str("YIELD"),
            StopReason::Pause => f.write_str("PAUSE"),
            StopReason::Terminate(kind) => write!(f, "TERMINATE({kind:?})"),
            StopReason::AlreadyTerminated => f.write_str("ALREADY_TERMINATED"),
        }
    }
}

/// Flags a stop decision is made from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopInputs {
    /// Active cancel/abort/failure request on the task.
    pub terminate: Option<TerminateKind>,
    /// The driver has already been marked terminated by the task.
    pub termination_visible: bool,
    pub pause_requested: bool,
    pub yield_requested: bool,
    pub time_slice_exceeded: bool,
}

pub fn resolve_stop_reason(inputs: &StopInputs) -> StopReason {
    if inputs.termination_visible {
        return StopReason::AlreadyTerminated;
    }
    if let Some(kind) = inputs.terminate {
        return StopReason::Terminate(kind);
    }
    if inputs.pause_requested {
        return StopReason::Pause;
    }
    if inputs.yield_requested || inputs.time_slice_exceeded {
        return StopReason::Yield;
    }
    StopReason::None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_flag_combination_follows_priority() {
        let kinds = [
            None,
            Some(TerminateKind::Cancel),
            Some(TerminateKind::Abort),
            Some(TerminateKind::Error),
        ];
        for terminate in kinds {
            for bits in 0u8..16 {
                let inputs = StopInputs {
                    terminate,
                    termination_visible: bits & 1 != 0,
                    pause_requested: bits & 2 != 0,
                    yield_requested: bits & 4 != 0,
                    time_slice_exceeded: bits & 8 != 0,
                };
                let reason = resolve_stop_reason(&inputs);
                let expected = if inputs.termination_visible {
                    StopReason::AlreadyTerminated
                } else if let Some(kind) = terminate {
                    StopReason::Terminate(kind)
                } else if inputs.pause_requested {
                    StopReason::Pause
                } else if inputs.yield_requested || inputs.time_slice_exceeded {
                    StopReason::Yield
                } else {
                    StopReason::None
                };
                assert_eq!(reason, expected, "inputs: {inputs:?}");
                assert_eq!(
                    reason.is_terminal(),
                    inputs.termination_visible || terminate.is_some()
                );
            }
        }
    }

    #[test]
    fn terminate_kind_round_trips_through_u8() {
        for kind in [TerminateKind::Cancel, TerminateKind::Abort, TerminateKind::Error] {
            assert_eq!(TerminateKind::from_u8(kind.to_u8()), Some(kind));
        }
        assert_eq!(TerminateKind::from_u8(0), None);
    }
}
