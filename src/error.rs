// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Error type returned by the thread pool.

use crate::core::RangeIndex;
use std::any::Any;

/// Errors reported by a [`ThreadPool`](crate::ThreadPool) and by the
/// [`TaskHandle`](crate::TaskHandle)s it hands out.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A task was submitted after the pool started shutting down. The task
    /// wasn't queued.
    #[error("submit on a stopped thread pool")]
    PoolStopped,
    /// A task panicked while running on a worker thread.
    #[error("task panicked on worker thread #{worker_id}: {message}")]
    TaskPanicked {
        /// Index of the worker thread that ran the task.
        worker_id: usize,
        /// Panic payload, if it was a string.
        message: String,
    },
    /// A task was dropped without ever running.
    #[error("task was dropped before completing")]
    TaskAbandoned,
    /// A range whose start is greater than its end was passed to a parallel
    /// loop. The bounds are widened to [`i128`], whatever the index type.
    #[error("invalid range: start {start} is greater than end {end}")]
    InvalidRange {
        /// Start of the rejected range.
        start: i128,
        /// End of the rejected range.
        end: i128,
    },
}

/// Result type using this crate's [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn invalid_range<T: RangeIndex>(start: T, end: T) -> Self {
        Error::InvalidRange {
            start: start.to_i128(),
            end: end.to_i128(),
        }
    }

    pub(crate) fn task_panicked(worker_id: usize, payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "Box<dyn Any>".to_owned()
        };
        Error::TaskPanicked { worker_id, message }
    }
}
