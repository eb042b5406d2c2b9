// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! One-shot channel carrying the outcome of a submitted task.

use super::util::Status;
use crate::error::{Error, Result};
use std::sync::Arc;

/// Creates a connected pair of [`Completer`] and [`TaskHandle`].
pub fn channel<R>() -> (Completer<R>, TaskHandle<R>) {
    let slot = Arc::new(Status::new(Slot::Pending));
    (Completer { slot: slot.clone() }, TaskHandle { slot })
}

/// State of the shared slot.
enum Slot<R> {
    /// The task hasn't completed yet.
    Pending,
    /// The task completed with this outcome, not yet retrieved.
    Ready(Result<R>),
    /// The outcome was retrieved by the handle.
    Taken,
}

impl<R> Slot<R> {
    fn is_pending(&self) -> bool {
        matches!(self, Slot::Pending)
    }
}

/// Producer half of the channel, moved into the task.
///
/// Dropping it without calling [`complete()`](Self::complete) resolves the
/// handle with [`Error::TaskAbandoned`].
pub struct Completer<R> {
    slot: Arc<Status<Slot<R>>>,
}

impl<R> Completer<R> {
    /// Publishes the outcome of the task and wakes up the waiter, if any.
    pub fn complete(self, result: Result<R>) {
        self.fill(result);
    }

    fn fill(&self, result: Result<R>) {
        self.slot.update_notify_all(|slot| {
            if slot.is_pending() {
                *slot = Slot::Ready(result);
            }
        });
    }
}

impl<R> Drop for Completer<R> {
    fn drop(&mut self) {
        // No-op if the outcome was already published.
        self.fill(Err(Error::TaskAbandoned));
    }
}

/// A handle to wait for the outcome of a task submitted to a
/// [`ThreadPool`](crate::ThreadPool).
///
/// ```
/// # use blockpool::ThreadPool;
/// let pool = ThreadPool::new(2);
/// let handle = pool.submit(|_worker_id| 6 * 7).unwrap();
/// assert_eq!(handle.wait(), Ok(42));
/// ```
#[must_use = "dropping a TaskHandle doesn't cancel the task, but its outcome is lost"]
pub struct TaskHandle<R> {
    slot: Arc<Status<Slot<R>>>,
}

impl<R> TaskHandle<R> {
    /// Returns whether the task has completed, without blocking.
    pub fn is_ready(&self) -> bool {
        !self.slot.lock().is_pending()
    }

    /// Blocks until the task has completed, and returns its outcome.
    ///
    /// If the task panicked, this returns [`Error::TaskPanicked`].
    pub fn wait(self) -> Result<R> {
        let mut guard = self.slot.wait_while(|slot| slot.is_pending());
        match std::mem::replace(&mut *guard, Slot::Taken) {
            Slot::Ready(result) => result,
            Slot::Pending | Slot::Taken => unreachable!("TaskHandle: outcome was already taken"),
        }
    }
}

impl<R> std::fmt::Debug for TaskHandle<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("ready", &self.is_ready())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_send_sync() {
        fn is_send_sync<T: Send + Sync>() {}
        is_send_sync::<Completer<u64>>();
        is_send_sync::<TaskHandle<Vec<u8>>>();
    }

    #[test]
    fn test_complete_then_wait() {
        let (completer, handle) = channel();
        assert!(!handle.is_ready());
        completer.complete(Ok(42));
        assert!(handle.is_ready());
        assert_eq!(handle.wait(), Ok(42));
    }

    #[test]
    fn test_wait_blocks_until_complete() {
        let (completer, handle) = channel::<&str>();
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            completer.complete(Ok("done"));
        });
        assert_eq!(handle.wait(), Ok("done"));
        thread.join().unwrap();
    }

    #[test]
    fn test_error_outcome() {
        let (completer, handle) = channel::<()>();
        completer.complete(Err(Error::PoolStopped));
        assert_eq!(handle.wait(), Err(Error::PoolStopped));
    }

    #[test]
    fn test_dropped_completer() {
        let (completer, handle) = channel::<u32>();
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            drop(completer);
        });
        assert_eq!(handle.wait(), Err(Error::TaskAbandoned));
        thread.join().unwrap();
    }

    #[test]
    fn test_dropped_handle() {
        let (completer, handle) = channel::<u32>();
        drop(handle);
        // Completing without a waiter is fine.
        completer.complete(Ok(1));
    }
}
