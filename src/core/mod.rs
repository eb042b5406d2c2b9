// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Core engine: thread pool, task queue, completion handles and block
//! partitioning.

mod completion;
mod parallel;
mod queue;
mod range;
mod thread_pool;
mod util;

pub use completion::TaskHandle;
pub use range::{partition, BlockedRange, BlockedRangeIter, RangeIndex};
pub use thread_pool::{CpuPinningPolicy, ThreadCount, ThreadPool, ThreadPoolBuilder};
