// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Index ranges and the block partitioning of a range across worker threads.

use std::fmt::Debug;
use std::iter::FusedIterator;
use std::num::NonZeroUsize;

/// An integer type that can index a [`BlockedRange`].
pub trait RangeIndex: Copy + Ord + Debug + Send + Sync + 'static {
    /// Returns the number of indices in `start..end`.
    ///
    /// The caller must ensure that `start <= end`.
    ///
    /// # Panics
    ///
    /// Panics if the number of indices doesn't fit in a [`usize`], which can
    /// happen for 64-bit index types on 32-bit targets.
    fn distance(start: Self, end: Self) -> usize;

    /// Returns the index `n` steps after `self`.
    ///
    /// The caller must ensure that the result is representable.
    fn offset(self, n: usize) -> Self;

    /// Converts this index to an [`i128`], which holds every value of the
    /// supported index types.
    fn to_i128(self) -> i128;
}

macro_rules! impl_range_index {
    ( $($t:ty),* ) => {
        $(
            impl RangeIndex for $t {
                #[inline(always)]
                fn distance(start: Self, end: Self) -> usize {
                    debug_assert!(start <= end);
                    usize::try_from(end as i128 - start as i128).unwrap_or_else(|_| {
                        panic!("range {start}..{end} has more than usize::MAX indices")
                    })
                }

                #[inline(always)]
                fn offset(self, n: usize) -> Self {
                    (self as i128 + n as i128) as $t
                }

                #[inline(always)]
                fn to_i128(self) -> i128 {
                    self as i128
                }
            }
        )*
    };
}

impl_range_index!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize);

/// A half-open range of indices `begin..end`, handed to the function of a
/// [`parallel_for()`](crate::ThreadPool::parallel_for) loop.
///
/// ```
/// # use blockpool::BlockedRange;
/// let range = BlockedRange::new(3, 7);
/// assert_eq!(range.len(), 4);
/// assert_eq!(range.iter().collect::<Vec<i32>>(), [3, 4, 5, 6]);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockedRange<T> {
    begin: T,
    end: T,
}

impl<T: RangeIndex> BlockedRange<T> {
    /// Creates the range `begin..end`.
    ///
    /// # Panics
    ///
    /// Panics if `begin > end`.
    pub fn new(begin: T, end: T) -> Self {
        assert!(
            begin <= end,
            "BlockedRange: begin ({begin:?}) is greater than end ({end:?})"
        );
        Self { begin, end }
    }

    /// Creates the range containing only `index`.
    fn unit(index: T) -> Self {
        Self {
            begin: index,
            end: index.offset(1),
        }
    }

    /// First index in this range.
    pub fn begin(&self) -> T {
        self.begin
    }

    /// One past the last index in this range.
    pub fn end(&self) -> T {
        self.end
    }

    /// Number of indices in this range.
    pub fn len(&self) -> usize {
        T::distance(self.begin, self.end)
    }

    /// Whether this range contains no index.
    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    /// Returns an iterator over the indices in this range.
    pub fn iter(&self) -> BlockedRangeIter<T> {
        BlockedRangeIter {
            next: self.begin,
            end: self.end,
        }
    }
}

impl<T: RangeIndex> IntoIterator for BlockedRange<T> {
    type Item = T;
    type IntoIter = BlockedRangeIter<T>;

    fn into_iter(self) -> BlockedRangeIter<T> {
        self.iter()
    }
}

impl<T> From<BlockedRange<T>> for std::ops::Range<T> {
    fn from(range: BlockedRange<T>) -> Self {
        range.begin..range.end
    }
}

/// Iterator over the indices of a [`BlockedRange`].
#[derive(Clone, Debug)]
pub struct BlockedRangeIter<T> {
    next: T,
    end: T,
}

impl<T: RangeIndex> Iterator for BlockedRangeIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.next < self.end {
            let index = self.next;
            self.next = index.offset(1);
            Some(index)
        } else {
            None
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = T::distance(self.next, self.end);
        (len, Some(len))
    }
}

impl<T: RangeIndex> ExactSizeIterator for BlockedRangeIter<T> {}
impl<T: RangeIndex> FusedIterator for BlockedRangeIter<T> {}

/// Splits `start..end` into the blocks that a pool of `num_blocks` workers
/// processes.
///
/// - Ranges of fewer than 2 indices yield one unit range per index.
/// - If there are fewer indices than blocks, each index gets its own unit
///   range.
/// - Otherwise, exactly `num_blocks` contiguous ranges are returned, in
///   increasing order. Their lengths differ by at most one, the longer ones
///   coming first.
///
/// In all cases the returned ranges are non-empty, don't overlap, and their
/// union is exactly `start..end`.
///
/// ```
/// # use blockpool::{partition, BlockedRange};
/// # use std::num::NonZeroUsize;
/// let blocks = partition(0, 10, NonZeroUsize::new(4).unwrap());
/// assert_eq!(
///     blocks,
///     [
///         BlockedRange::new(0, 3),
///         BlockedRange::new(3, 6),
///         BlockedRange::new(6, 8),
///         BlockedRange::new(8, 10),
///     ]
/// );
/// ```
///
/// # Panics
///
/// Panics if `start > end`.
pub fn partition<T: RangeIndex>(
    start: T,
    end: T,
    num_blocks: NonZeroUsize,
) -> Vec<BlockedRange<T>> {
    assert!(
        start <= end,
        "partition: start ({start:?}) is greater than end ({end:?})"
    );
    let length = T::distance(start, end);
    if length < 2 {
        return (0..length)
            .map(|i| BlockedRange::unit(start.offset(i)))
            .collect();
    }

    let num_blocks = num_blocks.get();
    let block_size = length / num_blocks;
    let mut leftover = length - block_size * num_blocks;

    if block_size == 0 {
        return (0..leftover)
            .map(|i| BlockedRange::unit(start.offset(i)))
            .collect();
    }

    let mut cursor = start;
    (0..num_blocks)
        .map(|_| {
            let size = if leftover > 0 {
                leftover -= 1;
                block_size + 1
            } else {
                block_size
            };
            let begin = cursor;
            cursor = cursor.offset(size);
            BlockedRange { begin, end: cursor }
        })
        .collect()
}
