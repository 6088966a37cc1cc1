#![doc = include_str!("../README.md")]
#![no_std]
#![deny(missing_docs)]
#![cfg_attr(feature = "allocator_api", feature(allocator_api))]

#[cfg(test)]
extern crate std;

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(feature = "log")] {
        macro_rules! log_trace { ($($t:tt)*) => { log::trace!($($t)*) } }
        macro_rules! log_warn { ($($t:tt)*) => { log::warn!($($t)*) } }
        macro_rules! log_error { ($($t:tt)*) => { log::error!($($t)*) } }
    } else {
        macro_rules! log_trace { ($($t:tt)*) => {} }
        macro_rules! log_warn { ($($t:tt)*) => {} }
        macro_rules! log_error { ($($t:tt)*) => {} }
    }
}

pub mod arena;
mod block;
mod error;
mod free_list;
mod heap;
pub mod layout;
mod mutex;

pub use arena::{BreakError, BreakProvider, Region};
pub use error::HeapError;
pub use heap::{BlockInfo, Heap, HeapStats};
pub use mutex::{Lock, SingleThreadedLock, SpinLock};

#[cfg(all(feature = "sbrk", unix))]
pub use arena::Sbrk;

cfg_if! {
    if #[cfg(feature = "allocator_api")] {
        pub use core::alloc::{AllocError, Allocator};
    } else if #[cfg(feature = "allocator_api2")] {
        pub use allocator_api2::alloc::{AllocError, Allocator};
    }
}
