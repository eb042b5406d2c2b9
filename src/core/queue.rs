// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! FIFO task queue shared between the submitting threads and the workers.

use super::util::Status;
use std::collections::VecDeque;

/// A type-erased unit of work, called with the index of the worker thread
/// running it.
pub type Task = Box<dyn FnOnce(usize) + Send + 'static>;

/// State protected by the queue's mutex.
#[derive(Default)]
struct QueueState {
    /// Pending tasks, in submission order.
    tasks: VecDeque<Task>,
    /// Set once when the pool starts shutting down, never reset.
    stopping: bool,
}

/// A multi-producer, multi-consumer FIFO of [`Task`]s with a stop flag.
pub struct TaskQueue {
    state: Status<QueueState>,
}

impl TaskQueue {
    /// Creates an empty, running queue.
    pub fn new() -> Self {
        Self {
            state: Status::new(QueueState::default()),
        }
    }

    /// Appends a task to the back of the queue and wakes up one worker.
    ///
    /// Fails and gives the task back if the queue is stopping.
    pub fn push(&self, task: Task) -> Result<(), Task> {
        self.state.update_notify_one(|state| {
            if state.stopping {
                Err(task)
            } else {
                state.tasks.push_back(task);
                Ok(())
            }
        })
    }

    /// Blocks until a task is available and pops it from the front of the
    /// queue.
    ///
    /// Returns [`None`] once the queue is stopping and fully drained.
    pub fn pop(&self) -> Option<Task> {
        let mut guard = self
            .state
            .wait_while(|state| state.tasks.is_empty() && !state.stopping);
        // Remaining tasks are still handed out after the stop signal.
        guard.tasks.pop_front()
    }

    /// Marks the queue as stopping and wakes up all the workers.
    ///
    /// Returns whether this call is the one that stopped the queue.
    pub fn stop(&self) -> bool {
        self.state
            .update_notify_all(|state| !std::mem::replace(&mut state.stopping, true))
    }

    /// Number of tasks waiting to be picked up.
    pub fn len(&self) -> usize {
        self.state.lock().tasks.len()
    }
}
