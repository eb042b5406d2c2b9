// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Internal logging macros.
//!
//! With the `log` feature, these forward to the [`log`](https://docs.rs/log)
//! facade. Without it, the arguments are still type-checked (so that values
//! only used for logging don't trigger warnings) but nothing is emitted.
//! The per-task and statistics macros ([`log_info`] and [`log_trace`]) are
//! additionally gated behind the `log_parallelism` feature.

#[cfg(feature = "log")]
macro_rules! log_at {
    ( $level:ident, $($args:tt)* ) => {
        log::$level!( $($args)* )
    };
}

#[cfg(not(feature = "log"))]
macro_rules! log_at {
    ( $level:ident, $($args:tt)* ) => {
        if false {
            let _ = format_args!( $($args)* );
        }
    };
}

macro_rules! log_debug {
    ( $($args:tt)* ) => {
        $crate::macros::log_at!(debug, $($args)*)
    };
}

macro_rules! log_warn {
    ( $($args:tt)* ) => {
        $crate::macros::log_at!(warn, $($args)*)
    };
}

macro_rules! log_error {
    ( $($args:tt)* ) => {
        $crate::macros::log_at!(error, $($args)*)
    };
}

#[cfg(feature = "log_parallelism")]
macro_rules! log_info {
    ( $($args:tt)* ) => {
        $crate::macros::log_at!(info, $($args)*)
    };
}

#[cfg(feature = "log_parallelism")]
macro_rules! log_trace {
    ( $($args:tt)* ) => {
        $crate::macros::log_at!(trace, $($args)*)
    };
}

#[cfg(not(feature = "log_parallelism"))]
macro_rules! log_trace {
    ( $($args:tt)* ) => {
        if false {
            let _ = format_args!( $($args)* );
        }
    };
}

pub(crate) use log_at;
pub(crate) use log_debug;
pub(crate) use log_error;
#[cfg(feature = "log_parallelism")]
pub(crate) use log_info;
pub(crate) use log_trace;
pub(crate) use log_warn;
