// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! CLI tool to run examples of parallel loops.

use blockpool::{CpuPinningPolicy, ThreadCount, ThreadPool, ThreadPoolBuilder};
use clap::{Parser, ValueEnum};
use crossbeam_utils::CachePadded;
use std::hint::black_box;
use std::num::NonZeroUsize;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let thread_pool = ThreadPoolBuilder {
        num_threads: match cli.num_threads {
            Some(num_threads) => ThreadCount::Count(num_threads),
            None => ThreadCount::AvailableParallelism,
        },
        cpu_pinning: CpuPinningPolicy::IfSupported,
    }
    .build();

    let result = match cli.scenario {
        Scenario::Increment => increment(&thread_pool, cli.input_size),
        Scenario::Add => add(&thread_pool, cli.input_size),
        Scenario::Sum => sum(&thread_pool, cli.input_size),
    };
    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }

    thread_pool.shutdown();
    println!("tasks per worker = {:?}", thread_pool.tasks_per_worker());
}

/// Increments every item of a vector twice, once per index and once per
/// block.
fn increment(thread_pool: &ThreadPool, input_size: u64) -> blockpool::Result<()> {
    let mut values = (0..input_size).collect::<Vec<u64>>();
    thread_pool.parallel_for_each_mut(&mut values, |_, x, _| *x += 1)?;
    thread_pool.parallel_chunks_mut(&mut values, |_, chunk, _| {
        for x in chunk {
            *x += 1;
        }
    })?;

    let ok = values.iter().zip(0..).all(|(&x, i)| x == i + 2);
    println!("incremented {} elements, ok = {ok}", black_box(values).len());
    Ok(())
}

/// Adds two vectors element-wise.
fn add(thread_pool: &ThreadPool, input_size: u64) -> blockpool::Result<()> {
    let mut output = vec![0; input_size as usize];
    let left = (0..input_size).collect::<Vec<u64>>();
    let right = (0..input_size).collect::<Vec<u64>>();

    let left_slice = black_box(left.as_slice());
    let right_slice = black_box(right.as_slice());
    thread_pool.parallel_chunks_mut(&mut output, |range, chunk, _| {
        let range = Range::from(range);
        for ((out, a), b) in chunk
            .iter_mut()
            .zip(&left_slice[range.clone()])
            .zip(&right_slice[range])
        {
            *out = a + b;
        }
    })?;
    println!("added {} elements", black_box(output).len());
    Ok(())
}

/// Sums a vector, accumulating one partial sum per worker thread.
fn sum(thread_pool: &ThreadPool, input_size: u64) -> blockpool::Result<()> {
    let input = (0..input_size).collect::<Vec<u64>>();
    let partial_sums = (0..thread_pool.num_threads().get())
        .map(|_| CachePadded::new(AtomicU64::new(0)))
        .collect::<Vec<_>>();

    let input_slice = black_box(input.as_slice());
    thread_pool.parallel_for(0, input_slice.len(), |range, worker_id| {
        let block_sum = input_slice[Range::from(range)].iter().sum::<u64>();
        partial_sums[worker_id].fetch_add(block_sum, Ordering::Relaxed);
    })?;

    let sum = partial_sums
        .iter()
        .map(|x| x.load(Ordering::Relaxed))
        .sum::<u64>();
    println!("sum = {sum}");
    Ok(())
}

/// CLI tool to run examples of parallel loops.
#[derive(Parser, Debug, PartialEq, Eq)]
#[command(version)]
struct Cli {
    /// Number of worker threads. Default to the available parallelism.
    #[arg(long)]
    num_threads: Option<NonZeroUsize>,

    /// Scenario to run in parallel.
    #[arg(long, value_enum)]
    scenario: Scenario,

    /// Number of items in the input.
    #[arg(long, default_value_t = 1_000_000)]
    input_size: u64,
}

/// Scenario to run.
#[derive(ValueEnum, Clone, Debug, PartialEq, Eq)]
enum Scenario {
    /// Increment every item of a vector twice.
    Increment,
    /// Add two slices element-wise.
    Add,
    /// Sum a slice of numbers.
    Sum,
}
