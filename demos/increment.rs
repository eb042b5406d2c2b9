// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Increments a small vector on a pool of 4 threads, first index by index,
//! then block by block.

use blockpool::ThreadPool;
use std::sync::atomic::{AtomicI32, Ordering};

fn main() -> blockpool::Result<()> {
    env_logger::init();

    let pool = ThreadPool::new(4);
    let values = (1..=10).map(AtomicI32::new).collect::<Vec<_>>();

    pool.parallel_for_each(0, values.len(), |i, _| {
        values[i].fetch_add(1, Ordering::Relaxed);
    })?;
    print_values(&values);

    pool.parallel_for(0, values.len(), |range, worker_id| {
        println!("worker #{worker_id} got {:?}", std::ops::Range::from(range));
        for i in range {
            values[i].fetch_add(1, Ordering::Relaxed);
        }
    })?;
    print_values(&values);

    Ok(())
}

fn print_values(values: &[AtomicI32]) {
    let values = values
        .iter()
        .map(|x| x.load(Ordering::Relaxed).to_string())
        .collect::<Vec<_>>();
    println!("{}", values.join(" "));
}
