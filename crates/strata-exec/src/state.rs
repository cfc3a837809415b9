//! Per-driver execution flags.
//!
//! The task mutates these under its own lock; other threads (diagnostics,
//! operators asking whether to yield) read them through the atomics.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

/// Small non-zero number identifying the calling thread.
pub fn current_thread_token() -> u64 {
    THREAD_TOKEN.with(|t| *t)
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(Debug, Default)]
pub struct ThreadState {
    /// Token of the thread the driver is on; 0 when off-thread.
    tid: AtomicU64,
    is_enqueued: AtomicBool,
    is_terminated: AtomicBool,
    has_blocking_future: AtomicBool,
    is_suspended: AtomicBool,
    /// Nesting depth of suspended sections.
    num_suspensions: AtomicU32,
    /// Whether the driver is included in the task's on-thread count.
    counted: AtomicBool,
    /// Set by `Task::request_yield` while on-thread; cleared when consumed
    /// or when the driver leaves its thread.
    yield_requested: AtomicBool,
    start_exec_time_ms: AtomicU64,
    total_exec_time_ms: AtomicU64,
}

impl ThreadState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tid(&self) -> u64 {
        self.tid.load(Ordering::Acquire)
    }

    pub fn is_on_thread(&self) -> bool {
        self.tid() != 0
    }

    /// True if the calling thread is the one the driver is on.
    pub fn is_current_thread(&self) -> bool {
        self.tid() == current_thread_token()
    }

    pub(crate) fn set_thread(&self) {
        self.tid.store(current_thread_token(), Ordering::Release);
        self.start_exec_time_ms.store(now_ms(), Ordering::Relaxed);
    }

    /// Take ownership of an off-thread driver without starting a slice.
    pub(crate) fn claim(&self) {
        self.tid.store(current_thread_token(), Ordering::Release);
    }

    /// Go off-thread, folding the current slice into the total exec time.
    pub(crate) fn clear_thread(&self) {
        let start = self.start_exec_time_ms.swap(0, Ordering::Relaxed);
        if start != 0 {
            self.total_exec_time_ms
                .fetch_add(now_ms().saturating_sub(start), Ordering::Relaxed);
        }
        self.tid.store(0, Ordering::Release);
    }

    pub fn is_enqueued(&self) -> bool {
        self.is_enqueued.load(Ordering::Acquire)
    }

    pub(crate) fn set_enqueued(&self, v: bool) {
        self.is_enqueued.store(v, Ordering::Release);
    }

    pub fn is_terminated(&self) -> bool {
        self.is_terminated.load(Ordering::Acquire)
    }

    pub(crate) fn set_terminated(&self) {
        self.is_terminated.store(true, Ordering::Release);
    }

    pub fn has_blocking_future(&self) -> bool {
        self.has_blocking_future.load(Ordering::Acquire)
    }

    pub(crate) fn set_blocking_future(&self, v: bool) {
        self.has_blocking_future.store(v, Ordering::Release);
    }

    pub fn is_suspended(&self) -> bool {
        self.is_suspended.load(Ordering::Acquire)
    }

    pub(crate) fn set_suspended(&self, v: bool) {
        self.is_suspended.store(v, Ordering::Release);
    }

    pub fn num_suspensions(&self) -> u32 {
        self.num_suspensions.load(Ordering::Acquire)
    }

    pub(crate) fn set_num_suspensions(&self, v: u32) {
        self.num_suspensions.store(v, Ordering::Release);
    }

    pub(crate) fn is_counted(&self) -> bool {
        self.counted.load(Ordering::Acquire)
    }

    pub(crate) fn set_counted(&self, v: bool) {
        self.counted.store(v, Ordering::Release);
    }

    pub fn yield_requested(&self) -> bool {
        self.yield_requested.load(Ordering::Acquire)
    }

    pub(crate) fn set_yield_requested(&self, v: bool) {
        self.yield_requested.store(v, Ordering::Release);
    }

    /// Consume a pending yield request.
    pub(crate) fn take_yield_request(&self) -> bool {
        self.yield_requested.swap(false, Ordering::AcqRel)
    }

    /// Wall-clock start of the current on-thread slice; 0 when off-thread.
    pub fn start_exec_time_ms(&self) -> u64 {
        self.start_exec_time_ms.load(Ordering::Relaxed)
    }

    /// Milliseconds spent in the current slice.
    pub fn exec_time_ms(&self) -> u64 {
        match self.start_exec_time_ms() {
            0 => 0,
            start => now_ms().saturating_sub(start),
        }
    }

    /// Milliseconds spent on-thread across all finished slices.
    pub fn total_exec_time_ms(&self) -> u64 {
        self.total_exec_time_ms.load(Ordering::Relaxed)
    }

    pub(crate) fn time_slice_exceeded(&self, limit_ms: u64) -> bool {
        limit_ms > 0 && self.exec_time_ms() > limit_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn on_thread_bookkeeping() {
        let state = ThreadState::new();
        assert!(!state.is_on_thread());
        assert_eq!(state.exec_time_ms(), 0);

        state.set_thread();
        assert!(state.is_current_thread());
        assert!(state.start_exec_time_ms() > 0);
        assert!(!state.time_slice_exceeded(0));

        let other = std::thread::spawn(current_thread_token).join().unwrap();
        assert_ne!(other, current_thread_token());

        state.clear_thread();
        assert!(!state.is_on_thread());
        assert_eq!(state.start_exec_time_ms(), 0);
    }

    #[test]
    fn yield_request_is_consumed_once() {
        let state = ThreadState::new();
        assert!(!state.take_yield_request());
        state.set_yield_requested(true);
        assert!(state.yield_requested());
        assert!(state.take_yield_request());
        assert!(!state.yield_requested());
        assert!(!state.take_yield_request());
    }
}
