//! One-shot continue notifications.
//!
//! A `ContinuePromise` is held by whoever will unblock the waiter (a task
//! finishing its drivers, a consumer draining a queue, an operator finishing
//! IO); the paired `ContinueFuture` is handed out to waiters. Futures are
//! cloneable and support blocking waits as well as callbacks. Dropping an
//! unfulfilled promise realizes the future so no waiter can hang on a lost
//! promise.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    name: &'static str,
    state: Mutex<FutureState>,
    cv: Condvar,
}

#[derive(Default)]
struct FutureState {
    ready: bool,
    callbacks: Vec<Callback>,
}

impl Shared {
    fn fulfil(&self) {
        let callbacks = {
            let mut state = self.state.lock();
            if state.ready {
                return;
            }
            state.ready = true;
            std::mem::take(&mut state.callbacks)
        };
        self.cv.notify_all();
        for cb in callbacks {
            cb();
        }
    }
}

/// Create a connected promise/future pair. `name` shows up in debug output.
pub fn make_continue_future(name: &'static str) -> (ContinuePromise, ContinueFuture) {
    let shared = Arc::new(Shared {
        name,
        state: Mutex::new(FutureState::default()),
        cv: Condvar::new(),
    });
    (
        ContinuePromise {
            shared: Some(Arc::clone(&shared)),
        },
        ContinueFuture { shared },
    )
}

#[derive(Clone)]
pub struct ContinueFuture {
    shared: Arc<Shared>,
}

impl ContinueFuture {
    /// A future that is already realized.
    pub fn ready() -> Self {
        let (promise, future) = make_continue_future("ready");
        promise.set_value();
        future
    }

    pub fn is_ready(&self) -> bool {
        self.shared.state.lock().ready
    }

    pub fn wait(&self) {
        let mut state = self.shared.state.lock();
        while !state.ready {
            self.shared.cv.wait(&mut state);
        }
    }

    /// Wait up to `timeout`; returns whether the future became ready.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while !state.ready {
            if self.shared.cv.wait_until(&mut state, deadline).timed_out() {
                return state.ready;
            }
        }
        true
    }

    /// Run `f` once the future is realized. Runs inline if it already is.
    ///
    /// Callbacks run on the thread that fulfils the promise, outside of any
    /// internal lock.
    pub fn on_ready<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.shared.state.lock();
            if !state.ready {
                state.callbacks.push(Box::new(f));
                return;
            }
        }
        f();
    }

    pub fn name(&self) -> &'static str {
        self.shared.name
    }
}

impl fmt::Debug for ContinueFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContinueFuture")
            .field("name", &self.shared.name)
            .field("ready", &self.is_ready())
            .finish()
    }
}

pub struct ContinuePromise {
    shared: Option<Arc<Shared>>,
}

impl ContinuePromise {
    pub fn set_value(mut self) {
        if let Some(shared) = self.shared.take() {
            shared.fulfil();
        }
    }
}

impl Drop for ContinuePromise {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.fulfil();
        }
    }
}

impl fmt::Debug for ContinuePromise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContinuePromise")
            .field("name", &self.shared.as_ref().map(|s| s.name))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn callbacks_run_on_fulfil() {
        let (promise, future) = make_continue_future("test");
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        future.on_ready(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!future.is_ready());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        promise.set_value();
        assert!(future.is_ready());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let h = Arc::clone(&hits);
        future.on_ready(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dropped_promise_realizes_future() {
        let (promise, future) = make_continue_future("dropped");
        drop(promise);
        assert!(future.wait_for(Duration::from_millis(10)));
    }

    #[test]
    fn wait_for_times_out() {
        let (_promise, future) = make_continue_future("pending");
        assert!(!future.wait_for(Duration::from_millis(5)));
    }

    #[test]
    fn wait_across_threads() {
        let (promise, future) = make_continue_future("threaded");
        let waiter = {
            let future = future.clone();
            std::thread::spawn(move || future.wait())
        };
        std::thread::sleep(Duration::from_millis(5));
        promise.set_value();
        waiter.join().unwrap();
        assert!(ContinueFuture::ready().is_ready());
    }
}
