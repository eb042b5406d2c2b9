// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::marker::PhantomData;
use std::sync::{Condvar, Mutex, MutexGuard};

/// An ergonomic wrapper around a [`Mutex`]-[`Condvar`] pair.
pub struct Status<T> {
    mutex: Mutex<T>,
    condvar: Condvar,
}

impl<T> Status<T> {
    /// Creates a new status initialized with the given value.
    pub fn new(t: T) -> Self {
        Self {
            mutex: Mutex::new(t),
            condvar: Condvar::new(),
        }
    }

    /// Locks the status.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.mutex.lock().unwrap()
    }

    /// Runs `f` on the locked status, then wakes one waiting thread.
    pub fn update_notify_one<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let result = f(&mut self.lock());
        self.condvar.notify_one();
        result
    }

    /// Runs `f` on the locked status, then wakes all waiting threads.
    pub fn update_notify_all<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let result = f(&mut self.lock());
        self.condvar.notify_all();
        result
    }

    /// Waits until the predicate is false on this status.
    ///
    /// This returns a [`MutexGuard`], allowing to further inspect or modify the
    /// status.
    pub fn wait_while(&self, predicate: impl FnMut(&mut T) -> bool) -> MutexGuard<'_, T> {
        self.condvar.wait_while(self.lock(), predicate).unwrap()
    }
}

/// A lifetime-erased mutable slice, handing out non-overlapping sub-slices to
/// multiple threads at once.
pub struct SliceMutView<'a, T> {
    ptr: *mut T,
    len: usize,
    _marker: PhantomData<&'a mut [T]>,
}

impl<'a, T> SliceMutView<'a, T> {
    /// Creates a view that exclusively borrows the given slice.
    pub fn new(slice: &'a mut [T]) -> Self {
        Self {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
            _marker: PhantomData,
        }
    }

    /// Returns the length of the underlying slice.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns the sub-slice at the given range.
    ///
    /// # Panics
    ///
    /// Panics if the range is reversed or out of bounds.
    ///
    /// # Safety
    ///
    /// The ranges passed to concurrent or overlapping-lifetime calls of this
    /// function must be pairwise disjoint.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn range_mut(&self, range: std::ops::Range<usize>) -> &mut [T] {
        assert!(range.start <= range.end && range.end <= self.len);
        // SAFETY:
        // - The pointer-length pair was obtained from a `&'a mut [T]` and the
        //   requested range is in bounds, as asserted above.
        // - The returned slice doesn't alias any other slice returned by this function,
        //   as ensured by the caller.
        // - The output lifetime is bounded by `&self`, itself bounded by `'a`.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.add(range.start), range.len()) }
    }
}

/// SAFETY:
///
/// A [`SliceMutView`] hands out disjoint `&mut [T]` to other threads, which is
/// sound if and only if `T` is [`Send`].
unsafe impl<T: Send> Send for SliceMutView<'_, T> {}
/// SAFETY:
///
/// A [`SliceMutView`] hands out disjoint `&mut [T]` to other threads, which is
/// sound if and only if `T` is [`Send`].
unsafe impl<T: Send> Sync for SliceMutView<'_, T> {}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn status_wait_while() {
        let status = Arc::new(Status::new(0));

        let thread = std::thread::spawn({
            let status = status.clone();
            move || {
                for _ in 0..3 {
                    std::thread::sleep(Duration::from_millis(10));
                    status.update_notify_all(|x| *x += 1);
                }
            }
        });

        let guard = status.wait_while(|x| *x < 3);
        assert_eq!(*guard, 3);
        drop(guard);
        thread.join().unwrap();
    }

    #[test]
    fn status_update_returns_value() {
        let status = Status::new(vec![1, 2]);
        let len = status.update_notify_one(|v| {
            v.push(3);
            v.len()
        });
        assert_eq!(len, 3);
        assert_eq!(*status.lock(), [1, 2, 3]);
    }

    #[test]
    fn slice_mut_view_disjoint_threads() {
        let mut values = vec![0u32; 100];
        let view = SliceMutView::new(&mut values);
        assert_eq!(view.len(), 100);

        std::thread::scope(|scope| {
            for i in 0..4 {
                let view = &view;
                scope.spawn(move || {
                    // SAFETY: The ranges are disjoint between threads.
                    let chunk = unsafe { view.range_mut(i * 25..(i + 1) * 25) };
                    for x in chunk {
                        *x = i as u32;
                    }
                });
            }
        });

        for (i, x) in values.iter().enumerate() {
            assert_eq!(*x, (i / 25) as u32);
        }
    }

    #[test]
    #[should_panic]
    fn slice_mut_view_out_of_bounds() {
        let mut values = [0u8; 4];
        let view = SliceMutView::new(&mut values);
        // SAFETY: No other slice is borrowed.
        let _ = unsafe { view.range_mut(2..5) };
    }
}
