// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A fixed-size thread pool pulling tasks from a shared FIFO queue.

use super::completion::{self, TaskHandle};
use super::queue::{Task, TaskQueue};
use crate::error::{Error, Result};
#[cfg(feature = "log_parallelism")]
use crate::macros::log_info;
use crate::macros::{log_debug, log_error, log_trace, log_warn};
use crossbeam_utils::CachePadded;
// Platforms that support `libc::sched_setaffinity()`.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
use nix::{
    sched::{sched_setaffinity, CpuSet},
    unistd::Pid,
};
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;

/// Number of threads to spawn in a thread pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadCount {
    /// Spawn the number of threads returned by
    /// [`std::thread::available_parallelism()`].
    AvailableParallelism,
    /// Spawn the given number of threads.
    Count(NonZeroUsize),
}

impl ThreadCount {
    /// Resolves the number of threads to spawn.
    ///
    /// If the available parallelism can't be queried, this falls back to a
    /// single thread.
    pub fn count(self) -> NonZeroUsize {
        match self {
            ThreadCount::AvailableParallelism => {
                std::thread::available_parallelism().unwrap_or_else(|_e| {
                    log_warn!("Getting the available parallelism failed, using 1 thread: {_e}");
                    NonZeroUsize::MIN
                })
            }
            ThreadCount::Count(count) => count,
        }
    }
}

impl TryFrom<usize> for ThreadCount {
    type Error = <NonZeroUsize as TryFrom<usize>>::Error;

    fn try_from(thread_count: usize) -> Result<Self, Self::Error> {
        let count = NonZeroUsize::try_from(thread_count)?;
        Ok(ThreadCount::Count(count))
    }
}

/// Policy to pin worker threads to CPUs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuPinningPolicy {
    /// Don't pin worker threads to CPUs.
    No,
    /// Pin each worker thread to a CPU, if CPU pinning is supported and
    /// implemented on this platform.
    IfSupported,
    /// Pin each worker thread to a CPU. If CPU pinning isn't supported on this
    /// platform (or not implemented), building a thread pool will panic.
    Always,
}

/// A builder for [`ThreadPool`].
#[derive(Clone, Debug)]
pub struct ThreadPoolBuilder {
    /// Number of worker threads to spawn in the pool.
    pub num_threads: ThreadCount,
    /// Policy to pin worker threads to CPUs.
    pub cpu_pinning: CpuPinningPolicy,
}

impl Default for ThreadPoolBuilder {
    fn default() -> Self {
        Self {
            num_threads: ThreadCount::AvailableParallelism,
            cpu_pinning: CpuPinningPolicy::No,
        }
    }
}

impl ThreadPoolBuilder {
    /// Spawns a thread pool.
    ///
    /// ```
    /// # use blockpool::{CpuPinningPolicy, ThreadCount, ThreadPoolBuilder};
    /// # use std::sync::atomic::{AtomicU64, Ordering};
    /// let pool = ThreadPoolBuilder {
    ///     num_threads: ThreadCount::try_from(4).unwrap(),
    ///     cpu_pinning: CpuPinningPolicy::No,
    /// }
    /// .build();
    /// assert_eq!(pool.num_threads().get(), 4);
    ///
    /// let sum = AtomicU64::new(0);
    /// pool.parallel_for_each(1, 11, |i, _worker_id| {
    ///     sum.fetch_add(i, Ordering::Relaxed);
    /// })
    /// .unwrap();
    /// assert_eq!(sum.into_inner(), 55);
    /// ```
    ///
    /// # Panics
    ///
    /// Panics if a worker thread can't be spawned, or if the
    /// [`CpuPinningPolicy::Always`] policy can't be honored.
    pub fn build(&self) -> ThreadPool {
        ThreadPool::from_builder(self)
    }
}

/// A fixed set of worker threads executing tasks from a shared FIFO queue.
///
/// Tasks are submitted with [`submit()`](Self::submit), or in bulk by the
/// parallel loops such as [`parallel_for()`](Self::parallel_for). Each task
/// receives the index of the worker thread that runs it, in
/// `0..num_threads()`.
///
/// Dropping the pool (or calling [`shutdown()`](Self::shutdown)) stops
/// accepting new tasks, lets the workers drain the queue, and joins them.
pub struct ThreadPool {
    /// Number of worker threads spawned at construction.
    num_threads: NonZeroUsize,
    /// State shared with the worker threads.
    shared: Arc<SharedContext>,
    /// Handles to the worker threads, emptied once they are joined.
    threads: Mutex<Vec<JoinHandle<()>>>,
}

/// Context shared between the pool handle and the worker threads.
struct SharedContext {
    /// Queue of pending tasks.
    queue: TaskQueue,
    /// Number of tasks executed by each worker thread.
    executed: Box<[CachePadded<AtomicUsize>]>,
}

impl ThreadPool {
    /// Spawns a pool of `thread_count` worker threads, or of the available
    /// parallelism if `thread_count` is zero.
    ///
    /// ```
    /// # use blockpool::ThreadPool;
    /// let pool = ThreadPool::new(3);
    /// assert_eq!(pool.num_threads().get(), 3);
    ///
    /// let pool = ThreadPool::new(0);
    /// assert_eq!(
    ///     pool.num_threads(),
    ///     std::thread::available_parallelism().unwrap()
    /// );
    /// ```
    pub fn new(thread_count: usize) -> Self {
        ThreadPoolBuilder {
            num_threads: ThreadCount::try_from(thread_count)
                .unwrap_or(ThreadCount::AvailableParallelism),
            cpu_pinning: CpuPinningPolicy::No,
        }
        .build()
    }

    fn from_builder(builder: &ThreadPoolBuilder) -> Self {
        let num_threads = builder.num_threads.count();
        let cpu_pinning = builder.cpu_pinning;

        #[cfg(any(
            miri,
            not(any(
                target_os = "android",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "linux"
            ))
        ))]
        match cpu_pinning {
            CpuPinningPolicy::No => (),
            CpuPinningPolicy::IfSupported => {
                log_warn!("Pinning threads to CPUs is not implemented on this platform.")
            }
            CpuPinningPolicy::Always => {
                panic!("Pinning threads to CPUs is not implemented on this platform.")
            }
        }

        let shared = Arc::new(SharedContext {
            queue: TaskQueue::new(),
            executed: (0..num_threads.get())
                .map(|_| CachePadded::new(AtomicUsize::new(0)))
                .collect(),
        });

        // Each worker reports whether it could apply the pinning policy before
        // entering its loop.
        let (ready_tx, ready_rx) = mpsc::channel();
        let threads = (0..num_threads.get())
            .map(|id| {
                let context = WorkerContext {
                    id,
                    shared: shared.clone(),
                };
                let ready_tx = ready_tx.clone();
                std::thread::Builder::new()
                    .name(format!("blockpool-worker-{id}"))
                    .spawn(move || {
                        let pinned = pin_current_thread(id, cpu_pinning);
                        let proceed = pinned.is_ok();
                        let _ = ready_tx.send(pinned);
                        drop(ready_tx);
                        if proceed {
                            context.run();
                        }
                    })
                    .expect("Failed to spawn a worker thread")
            })
            .collect();
        drop(ready_tx);
        log_debug!("[main thread] Spawned {num_threads} threads");

        let pool = Self {
            num_threads,
            shared,
            threads: Mutex::new(threads),
        };

        let failure = ready_rx
            .iter()
            .take(num_threads.get())
            .find_map(|pinned| pinned.err());
        if let Some(message) = failure {
            log_error!("[main thread] {message}");
            // Dropping the pool joins the workers that did start.
            drop(pool);
            panic!("{message}");
        }

        pool
    }

    /// Returns the number of worker threads that have been spawned in this
    /// thread pool.
    pub fn num_threads(&self) -> NonZeroUsize {
        self.num_threads
    }

    /// Returns the number of tasks that each worker thread has executed so
    /// far, indexed by worker.
    ///
    /// The counts are final once the pool has been [shut
    /// down](Self::shutdown).
    pub fn tasks_per_worker(&self) -> Vec<usize> {
        self.shared
            .executed
            .iter()
            .map(|count| count.load(Ordering::Relaxed))
            .collect()
    }

    /// Returns the number of tasks waiting in the queue.
    pub fn pending_tasks(&self) -> usize {
        self.shared.queue.len()
    }

    /// Submits a task to the pool, returning a handle to wait for its outcome.
    ///
    /// The task receives the index of the worker thread running it. If the
    /// task panics, the panic is caught and reported by
    /// [`TaskHandle::wait()`] as [`Error::TaskPanicked`], and the worker
    /// thread keeps processing other tasks.
    ///
    /// ```
    /// # use blockpool::{Error, ThreadPool};
    /// let pool = ThreadPool::new(2);
    /// let handle = pool.submit(|worker_id| worker_id < 2).unwrap();
    /// assert_eq!(handle.wait(), Ok(true));
    ///
    /// pool.shutdown();
    /// assert_eq!(pool.submit(|_| ()).unwrap_err(), Error::PoolStopped);
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolStopped`] without queuing anything if the pool has
    /// started shutting down.
    pub fn submit<F, R>(&self, f: F) -> Result<TaskHandle<R>>
    where
        F: FnOnce(usize) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (completer, handle) = completion::channel();
        self.push(Box::new(move |worker_id| {
            completer.complete(run_catching_panic(worker_id, f))
        }))?;
        Ok(handle)
    }

    /// Submits a task that may borrow from the caller's stack.
    ///
    /// # Safety
    ///
    /// The caller must wait on the returned handle before the end of the
    /// `'scope` lifetime, including when unwinding.
    pub(crate) unsafe fn submit_scoped<'scope, F>(&self, f: F) -> Result<TaskHandle<()>>
    where
        F: FnOnce(usize) + Send + 'scope,
    {
        let (completer, handle) = completion::channel();
        let task: Box<dyn FnOnce(usize) + Send + 'scope> = Box::new(move |worker_id| {
            completer.complete(run_catching_panic(worker_id, f))
        });
        // SAFETY: Only the lifetime changes. The task signals its handle as its last
        // step, and the caller waits on that handle before `'scope` ends, so the
        // task doesn't use any borrow after it expires. If the task is rejected, it
        // is dropped within this function.
        let task: Task = unsafe {
            std::mem::transmute::<Box<dyn FnOnce(usize) + Send + 'scope>, Task>(task)
        };
        self.push(task)?;
        Ok(handle)
    }

    fn push(&self, task: Task) -> Result<()> {
        self.shared.queue.push(task).map_err(|_rejected| {
            log_warn!("[main thread] Rejected a task submitted to a stopped thread pool");
            Error::PoolStopped
        })
    }

    /// Stops accepting new tasks, waits for the worker threads to execute all
    /// the queued tasks, and joins them.
    ///
    /// This is called when the pool is dropped. Calling it more than once is a
    /// no-op. When called from one of this pool's own tasks, the calling worker
    /// isn't joined. If another thread is already joining the workers, this
    /// returns without waiting for them.
    #[allow(clippy::unused_enumerate_index)]
    pub fn shutdown(&self) {
        if self.shared.queue.stop() {
            log_debug!("[main thread] Notifying threads to finish...");
        }

        // The lock isn't held while joining, as a worker being joined may call
        // this function too.
        let threads = std::mem::take(&mut *self.threads.lock().unwrap());
        if threads.is_empty() {
            return;
        }

        log_debug!("[main thread] Joining threads in the pool...");
        let current = std::thread::current().id();
        for (_i, t) in threads.into_iter().enumerate() {
            if t.thread().id() == current {
                log_warn!("[thread {_i}] Shutting down the pool from its own worker thread");
                continue;
            }
            let result = t.join();
            match result {
                Ok(_) => log_debug!("[main thread] Thread {_i} joined with result: {result:?}"),
                Err(_) => log_error!("[main thread] Thread {_i} joined with result: {result:?}"),
            }
        }
        log_debug!("[main thread] Joined threads.");

        #[cfg(feature = "log_parallelism")]
        self.print_statistics();
    }

    #[cfg(feature = "log_parallelism")]
    fn print_statistics(&self) {
        let tasks = self.tasks_per_worker();
        let total = tasks.iter().sum::<usize>();
        log_info!("Executed {total} tasks on {} threads", self.num_threads);
        for (i, count) in tasks.iter().enumerate() {
            log_info!(
                "- [thread {i}] {count} tasks ({:.1}%)",
                *count as f64 * 100.0 / total.max(1) as f64
            );
        }
    }
}

impl Drop for ThreadPool {
    /// Joins all the threads in the pool.
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("num_threads", &self.num_threads)
            .field("pending_tasks", &self.pending_tasks())
            .finish()
    }
}

/// Runs `f`, converting a panic into an [`Error::TaskPanicked`].
fn run_catching_panic<R>(worker_id: usize, f: impl FnOnce(usize) -> R) -> Result<R> {
    std::panic::catch_unwind(AssertUnwindSafe(|| f(worker_id))).map_err(|payload| {
        let error = Error::task_panicked(worker_id, payload.as_ref());
        log_error!("[thread {worker_id}] {error}");
        error
    })
}

/// Applies the pinning policy to the calling worker thread.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
fn pin_current_thread(id: usize, cpu_pinning: CpuPinningPolicy) -> Result<(), String> {
    if cpu_pinning == CpuPinningPolicy::No {
        return Ok(());
    }

    let mut cpu_set = CpuSet::new();
    let pinned = cpu_set
        .set(id)
        .and_then(|()| sched_setaffinity(Pid::from_raw(0), &cpu_set));
    match pinned {
        Ok(()) => {
            log_debug!("Pinned thread #{id} to CPU #{id}");
            Ok(())
        }
        Err(e) if cpu_pinning == CpuPinningPolicy::IfSupported => {
            log_warn!("Failed to set CPU affinity for thread #{id}: {e}");
            Ok(())
        }
        Err(e) => Err(format!("Failed to set CPU affinity for thread #{id}: {e}")),
    }
}

/// Applies the pinning policy to the calling worker thread.
///
/// Unsupported policies are rejected before spawning any thread.
#[cfg(any(
    miri,
    not(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    ))
))]
fn pin_current_thread(_id: usize, _cpu_pinning: CpuPinningPolicy) -> Result<(), String> {
    Ok(())
}

/// Context object owned by a worker thread.
struct WorkerContext {
    /// Thread index.
    id: usize,
    /// State shared with the pool.
    shared: Arc<SharedContext>,
}

impl WorkerContext {
    /// Main function run by this thread.
    fn run(&self) {
        log_debug!("[thread {}] Waiting for tasks", self.id);
        while let Some(task) = self.shared.queue.pop() {
            log_trace!("[thread {}] Running a task", self.id);
            task(self.id);
            self.shared.executed[self.id].fetch_add(1, Ordering::Relaxed);
        }
        log_debug!("[thread {}] Queue drained, exiting", self.id);
    }
}
