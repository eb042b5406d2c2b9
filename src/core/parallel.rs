// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Parallel loops over index ranges, split into one block per worker thread.

use super::completion::TaskHandle;
use super::range::{partition, BlockedRange, RangeIndex};
use super::thread_pool::ThreadPool;
use super::util::SliceMutView;
use crate::error::{Error, Result};
use crate::macros::{log_debug, log_warn};

impl ThreadPool {
    /// Runs `f` on blocks of the range `start..end` in parallel, and waits for
    /// all of them to complete.
    ///
    /// The range is split by [`partition()`] into at most
    /// [`num_threads()`](Self::num_threads) contiguous blocks of nearly equal
    /// lengths, and each block is submitted as a separate task. The function
    /// receives the block and the index of the worker thread running it.
    ///
    /// The blocks never overlap, so `f` may write to disjoint per-index
    /// locations without further synchronization (see also
    /// [`parallel_chunks_mut()`](Self::parallel_chunks_mut)).
    ///
    /// ```
    /// # use blockpool::ThreadPool;
    /// # use std::sync::atomic::{AtomicU64, Ordering};
    /// let pool = ThreadPool::new(4);
    /// let sums = (0..4).map(|_| AtomicU64::new(0)).collect::<Vec<_>>();
    /// pool.parallel_for(0u64, 1000, |range, worker_id| {
    ///     let block_sum = range.iter().sum::<u64>();
    ///     sums[worker_id].fetch_add(block_sum, Ordering::Relaxed);
    /// })
    /// .unwrap();
    /// let total = sums.iter().map(|x| x.load(Ordering::Relaxed)).sum::<u64>();
    /// assert_eq!(total, 999 * 1000 / 2);
    /// ```
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRange`] if `start > end`, without running anything.
    /// - [`Error::PoolStopped`] if the pool is shutting down. Blocks submitted
    ///   before that point still run to completion before this returns.
    /// - [`Error::TaskPanicked`] if `f` panicked on any block. All the other
    ///   blocks still run to completion, and the first failure in block order
    ///   is returned.
    pub fn parallel_for<T, F>(&self, start: T, end: T, f: F) -> Result<()>
    where
        T: RangeIndex,
        F: Fn(BlockedRange<T>, usize) + Sync,
    {
        if start > end {
            log_warn!("[main thread] Rejected a reversed range {start:?}..{end:?}");
            return Err(Error::invalid_range(start, end));
        }

        let blocks = partition(start, end, self.num_threads());
        log_debug!(
            "[main thread] Submitting {} blocks for range {start:?}..{end:?}",
            blocks.len()
        );

        let f = &f;
        submit_blocks(blocks, |range| {
            // SAFETY: `submit_blocks()` waits on every handle before returning,
            // including when unwinding, so the borrow of `f` outlives all the tasks.
            unsafe { self.submit_scoped(move |worker_id| f(range, worker_id)) }
        })
    }

    /// Runs `f` on every index of `start..end` in parallel, and waits for all
    /// of them to complete.
    ///
    /// This is a [`parallel_for()`](Self::parallel_for) where each block calls
    /// `f` once per index, in increasing order within the block. The function
    /// receives the index and the index of the worker thread running it.
    ///
    /// ```
    /// # use blockpool::ThreadPool;
    /// # use std::sync::atomic::{AtomicI32, Ordering};
    /// let pool = ThreadPool::new(4);
    /// let v = (1..=10).map(AtomicI32::new).collect::<Vec<_>>();
    /// pool.parallel_for_each(0, v.len(), |i, _worker_id| {
    ///     v[i].fetch_add(1, Ordering::Relaxed);
    /// })
    /// .unwrap();
    /// let v = v.into_iter().map(AtomicI32::into_inner).collect::<Vec<_>>();
    /// assert_eq!(v, [2, 3, 4, 5, 6, 7, 8, 9, 10, 11]);
    /// ```
    ///
    /// # Errors
    ///
    /// Same as [`parallel_for()`](Self::parallel_for).
    pub fn parallel_for_each<T, F>(&self, start: T, end: T, f: F) -> Result<()>
    where
        T: RangeIndex,
        F: Fn(T, usize) + Sync,
    {
        self.parallel_for(start, end, |range, worker_id| {
            for i in range {
                f(i, worker_id);
            }
        })
    }

    /// Runs `f` on blocks of the given slice in parallel, giving each block
    /// exclusive access to its chunk of the slice.
    ///
    /// The function receives the block's range of indices in the slice, the
    /// corresponding chunk, and the index of the worker thread running it.
    ///
    /// ```
    /// # use blockpool::ThreadPool;
    /// let pool = ThreadPool::new(4);
    /// let mut v = (1..=10).collect::<Vec<i32>>();
    /// pool.parallel_chunks_mut(&mut v, |range, chunk, _worker_id| {
    ///     for (i, x) in range.iter().zip(chunk) {
    ///         *x += i as i32;
    ///     }
    /// })
    /// .unwrap();
    /// assert_eq!(v, [1, 3, 5, 7, 9, 11, 13, 15, 17, 19]);
    /// ```
    ///
    /// # Errors
    ///
    /// Same as [`parallel_for()`](Self::parallel_for).
    pub fn parallel_chunks_mut<E, F>(&self, slice: &mut [E], f: F) -> Result<()>
    where
        E: Send,
        F: Fn(BlockedRange<usize>, &mut [E], usize) + Sync,
    {
        let view = SliceMutView::new(slice);
        self.parallel_for(0, view.len(), |range, worker_id| {
            // SAFETY: The blocks of a `parallel_for()` are pairwise disjoint.
            let chunk = unsafe { view.range_mut(range.into()) };
            f(range, chunk, worker_id)
        })
    }

    /// Runs `f` on every item of the given slice in parallel.
    ///
    /// The function receives the index of the item, a mutable reference to
    /// it, and the index of the worker thread running it.
    ///
    /// ```
    /// # use blockpool::ThreadPool;
    /// let pool = ThreadPool::new(4);
    /// let mut v = (1..=10).collect::<Vec<i32>>();
    /// pool.parallel_for_each_mut(&mut v, |_i, x, _worker_id| *x += 1)
    ///     .unwrap();
    /// assert_eq!(v, [2, 3, 4, 5, 6, 7, 8, 9, 10, 11]);
    /// ```
    ///
    /// # Errors
    ///
    /// Same as [`parallel_for()`](Self::parallel_for).
    pub fn parallel_for_each_mut<E, F>(&self, slice: &mut [E], f: F) -> Result<()>
    where
        E: Send,
        F: Fn(usize, &mut E, usize) + Sync,
    {
        self.parallel_chunks_mut(slice, |range, chunk, worker_id| {
            for (i, item) in range.iter().zip(chunk) {
                f(i, item, worker_id);
            }
        })
    }
}

/// Submits one task per block with `submit`, and waits for all the submitted
/// tasks.
///
/// Submission stops at the first rejected block. The tasks submitted before it
/// are still waited on, and their first failure takes precedence over the
/// rejection.
fn submit_blocks<T>(
    blocks: Vec<BlockedRange<T>>,
    mut submit: impl FnMut(BlockedRange<T>) -> Result<TaskHandle<()>>,
) -> Result<()> {
    let mut pending = PendingTasks::with_capacity(blocks.len());
    for range in blocks {
        match submit(range) {
            Ok(handle) => pending.push(handle),
            Err(e) => return pending.finish().and(Err(e)),
        }
    }
    pending.finish()
}

/// Handles of the tasks submitted by a parallel loop, all of which are waited
/// on before this object goes away.
struct PendingTasks {
    handles: Vec<TaskHandle<()>>,
}

impl PendingTasks {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            handles: Vec::with_capacity(capacity),
        }
    }

    fn push(&mut self, handle: TaskHandle<()>) {
        self.handles.push(handle);
    }

    /// Waits for all the tasks, and returns the first failure in submission
    /// order.
    fn finish(mut self) -> Result<()> {
        let mut first_error = None;
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.wait() {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for PendingTasks {
    fn drop(&mut self) {
        // Only reached with handles left if the calling thread is unwinding.
        for handle in self.handles.drain(..) {
            let _ = handle.wait();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::num::NonZeroUsize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[test]
    fn test_parallel_for_blocks_match_partition() {
        let pool = ThreadPool::new(4);
        let seen = Mutex::new(Vec::new());
        pool.parallel_for(0usize, 11, |range, _| seen.lock().unwrap().push(range))
            .unwrap();

        let mut seen = seen.into_inner().unwrap();
        seen.sort_by_key(|r| r.begin());
        assert_eq!(seen, partition(0, 11, pool.num_threads()));
    }

    #[test]
    fn test_parallel_for_empty_range() {
        let pool = ThreadPool::new(4);
        let calls = AtomicUsize::new(0);
        pool.parallel_for(5, 5, |_, _| {
            calls.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
        assert_eq!(calls.into_inner(), 0);
    }

    #[test]
    fn test_parallel_for_single_element_goes_through_worker() {
        let pool = ThreadPool::new(2);
        let seen = Mutex::new(Vec::new());
        let caller = std::thread::current().id();
        pool.parallel_for(-1i32, 0, |range, worker_id| {
            assert_ne!(std::thread::current().id(), caller);
            seen.lock().unwrap().push((range, worker_id));
        })
        .unwrap();

        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, BlockedRange::new(-1, 0));
        assert!(seen[0].1 < 2);
    }

    #[test]
    fn test_parallel_for_more_workers_than_elements() {
        let pool = ThreadPool::new(8);
        let seen = Mutex::new(Vec::new());
        pool.parallel_for(100u16, 103, |range, _| seen.lock().unwrap().push(range))
            .unwrap();

        let mut seen = seen.into_inner().unwrap();
        seen.sort_by_key(|r| r.begin());
        assert_eq!(
            seen,
            [
                BlockedRange::new(100, 101),
                BlockedRange::new(101, 102),
                BlockedRange::new(102, 103),
            ]
        );
    }

    #[test]
    fn test_parallel_for_reversed_range() {
        let pool = ThreadPool::new(2);
        let calls = AtomicUsize::new(0);
        let result = pool.parallel_for(10, 3, |_, _| {
            calls.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(
            result,
            Err(Error::InvalidRange { start: 10, end: 3 })
        );
        assert_eq!(calls.into_inner(), 0);
        assert_eq!(
            pool.parallel_for_each(1, 0, |_, _| ()),
            Err(Error::invalid_range(1, 0))
        );
    }

    #[test]
    fn test_parallel_for_after_shutdown() {
        let pool = ThreadPool::new(2);
        pool.shutdown();
        let calls = AtomicUsize::new(0);
        let result = pool.parallel_for(0, 100, |_, _| {
            calls.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(result, Err(Error::PoolStopped));
        assert_eq!(calls.into_inner(), 0);

        // Empty loops don't submit anything.
        assert_eq!(pool.parallel_for(0, 0, |_, _| ()), Ok(()));
    }

    #[test]
    fn test_submit_blocks_stopped_midway() {
        let pool = ThreadPool::new(2);
        let blocks = partition(0, 10, NonZeroUsize::new(5).unwrap());
        let ran = Arc::new(Mutex::new(Vec::new()));

        let result = submit_blocks(blocks, |range| {
            if range.begin() >= 4 {
                return Err(Error::PoolStopped);
            }
            let ran = ran.clone();
            pool.submit(move |_| {
                std::thread::sleep(Duration::from_millis(20));
                ran.lock().unwrap().push(range);
            })
        });

        assert_eq!(result, Err(Error::PoolStopped));
        // The blocks submitted before the rejection completed before returning.
        let mut ran = ran.lock().unwrap().clone();
        ran.sort_by_key(|r| r.begin());
        assert_eq!(ran, [BlockedRange::new(0, 2), BlockedRange::new(2, 4)]);
    }

    #[test]
    fn test_submit_blocks_stopped_after_failure() {
        let pool = ThreadPool::new(2);
        let blocks = partition(0, 10, NonZeroUsize::new(5).unwrap());

        let result = submit_blocks(blocks, |range| {
            if range.begin() >= 4 {
                return Err(Error::PoolStopped);
            }
            pool.submit(move |_| {
                if range.begin() == 2 {
                    panic!("block 2 failed");
                }
            })
        });

        assert!(matches!(
            result,
            Err(Error::TaskPanicked { ref message, .. }) if message == "block 2 failed"
        ));
    }

    #[test]
    fn test_parallel_for_stopped_during_loop() {
        // One block shuts the pool down while the loop is still submitting, so
        // the outcome depends on timing, but every started block runs to the end.
        let pool = ThreadPool::new(8);
        let started = AtomicUsize::new(0);
        let completed = AtomicUsize::new(0);
        let result = pool.parallel_for(0, 8, |range, _| {
            started.fetch_add(1, Ordering::SeqCst);
            if range.begin() == 0 {
                pool.shutdown();
            }
            completed.fetch_add(1, Ordering::SeqCst);
        });

        assert!(matches!(result, Ok(()) | Err(Error::PoolStopped)));
        assert_eq!(started.into_inner(), completed.into_inner());
    }

    #[test]
    fn test_parallel_for_waits_for_all_blocks_on_failure() {
        let pool = ThreadPool::new(4);
        let completed = AtomicUsize::new(0);
        let result = pool.parallel_for(0, 4, |range, _| {
            if range.begin() == 0 {
                panic!("first block failed");
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
            completed.fetch_add(1, Ordering::SeqCst);
        });

        assert!(matches!(
            result,
            Err(Error::TaskPanicked { ref message, .. }) if message == "first block failed"
        ));
        // Every other block ran to completion before returning.
        assert_eq!(completed.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_parallel_for_reports_first_failure_in_block_order() {
        let pool = ThreadPool::new(4);
        let result = pool.parallel_for(0, 8, |range, _| {
            if range.begin() >= 4 {
                panic!("block {} failed", range.begin());
            }
        });
        assert!(matches!(
            result,
            Err(Error::TaskPanicked { ref message, .. }) if message == "block 4 failed"
        ));
    }

    #[test]
    fn test_parallel_for_each_mut_indices() {
        let pool = ThreadPool::new(3);
        let mut v = vec![0usize; 1000];
        pool.parallel_for_each_mut(&mut v, |i, x, _| *x = i * 2)
            .unwrap();
        assert!(v.iter().enumerate().all(|(i, x)| *x == i * 2));
    }

    #[test]
    fn test_parallel_chunks_mut_worker_ids() {
        let pool = ThreadPool::new(4);
        let mut v = vec![usize::MAX; 103];
        pool.parallel_chunks_mut(&mut v, |range, chunk, worker_id| {
            assert_eq!(range.len(), chunk.len());
            chunk.fill(worker_id);
        })
        .unwrap();
        assert!(v.iter().all(|&id| id < 4));
    }

    #[test]
    fn test_parallel_chunks_mut_empty_slice() {
        let pool = ThreadPool::new(2);
        let mut v: Vec<u8> = Vec::new();
        pool.parallel_chunks_mut(&mut v, |_, _, _| unreachable!())
            .unwrap();
    }
}
