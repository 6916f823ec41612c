//! Cancellable asynchronous invocations.
//!
//! An [`Async`] wraps one invocation running on its own thread (one thread
//! per invocation, not a pooled scheduler). The handle is move-only;
//! dropping it detaches the task, but the shared cancellation flag stays
//! alive so a late `cancel()` from the engine side cannot dangle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

struct AsyncState<T> {
    result: Mutex<Option<T>>,
    done: Condvar,
}

/// A handle to an execution running in a background thread.
pub struct Async<T> {
    state: Arc<AsyncState<T>>,
    cancel: Arc<AtomicBool>,
}

impl<T: Send + 'static> Async<T> {
    /// Spawns `task` on a fresh thread; `cancel` is the flag the running
    /// executor polls at opcode boundaries and blocking primitives.
    pub(crate) fn spawn<F>(cancel: Arc<AtomicBool>, task: F) -> Async<T>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let state = Arc::new(AsyncState {
            result: Mutex::new(None),
            done: Condvar::new(),
        });
        let shared = Arc::clone(&state);
        thread::Builder::new()
            .name("wasmex-async".into())
            .spawn(move || {
                let value = task();
                *shared.result.lock() = Some(value);
                shared.done.notify_all();
            })
            .expect("failed to spawn async invocation thread");
        Async { state, cancel }
    }

    /// Blocks until the task finishes.
    pub fn wait(&self) {
        let mut result = self.state.result.lock();
        while result.is_none() {
            self.state.done.wait(&mut result);
        }
    }

    /// Blocks for at most `timeout`; returns whether the task finished.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        self.wait_until(Instant::now() + timeout)
    }

    /// Blocks until `deadline`; returns whether the task finished.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let mut result = self.state.result.lock();
        while result.is_none() {
            if self.state.done.wait_until(&mut result, deadline).timed_out() {
                return result.is_some();
            }
        }
        true
    }

    /// Whether the task has finished.
    pub fn is_done(&self) -> bool {
        self.state.result.lock().is_some()
    }

    /// Signals cancellation.
    ///
    /// The interpreter observes the flag at every opcode boundary, at every
    /// host re-entry and inside blocking primitives, and unwinds with
    /// [`TrapCode::Interrupted`](crate::TrapCode::Interrupted).
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }
}

impl<T: Send + Clone + 'static> Async<T> {
    /// Blocks until the task finishes and returns its result.
    ///
    /// The result is shared: `get` may be called any number of times.
    pub fn get(&self) -> T {
        self.wait();
        self.state
            .result
            .lock()
            .clone()
            .expect("wait() returned, so the result is present")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_is_repeatable() {
        let handle = Async::spawn(Arc::new(AtomicBool::new(false)), || 41 + 1);
        assert_eq!(handle.get(), 42);
        assert_eq!(handle.get(), 42);
        assert!(handle.is_done());
    }

    #[test]
    fn wait_for_times_out_on_slow_tasks() {
        let handle = Async::spawn(Arc::new(AtomicBool::new(false)), || {
            thread::sleep(Duration::from_millis(200));
        });
        assert!(!handle.wait_for(Duration::from_millis(10)));
        assert!(handle.wait_for(Duration::from_secs(5)));
    }

    #[test]
    fn cancel_sets_the_shared_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        let handle = Async::spawn(Arc::clone(&flag), || ());
        handle.cancel();
        assert!(flag.load(Ordering::Relaxed));
    }
}
