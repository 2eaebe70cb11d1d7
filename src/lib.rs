#![no_std]

//! A boundary-tag memory allocator over a single global arena.
//!
//! Memory comes from the OS one page at a time. Each page (an "extent") is
//! cut into chunks, every chunk carrying its own size and its neighbor's
//! size in a two-word header, so free neighbors can be found and merged by
//! address arithmetic alone. Freed chunks go on a first-fit free list; the
//! untouched tail of the newest extent is the "wilderness", cut from when
//! the free list has nothing suitable. Requests too large for an extent get
//! a mapping of their own.
//!
//! There are no OS locks anywhere. Allocations are serialized by one spin
//! flag, releases by another, and the two sides coordinate through a
//! lock bit in every chunk header.
//!
//! ```no_run
//! use chunk_allocator::UnixAllocator;
//!
//! #[global_allocator]
//! static ALLOCATOR: UnixAllocator = UnixAllocator::new();
//!
//! fn main() {
//!     let v: Vec<u64> = (0..1000).collect();
//!     let (validity, stats) = ALLOCATOR.stats();
//!     assert!(validity.is_valid());
//!     println!("{} in {} extents", v.len(), stats.extents);
//! }
//! ```

#[cfg(test)]
extern crate std;

// Allocation paths can be traced through `log` with the `debug-log` feature.
// Without it this expands to nothing.
macro_rules! trace {
    ($($arg:tt)*) => {
        #[cfg(feature = "debug-log")]
        log::trace!($($arg)*);
    };
}

pub mod allocator;
pub mod arena;
pub mod chunk;
mod coalesce;
pub mod error;
pub mod extent;
pub mod flag;
pub mod freelist;
pub mod pages;
pub mod stats;

pub use allocator::{Allocator, UnixAllocator};
pub use error::HeapError;
pub use flag::SchedYield;
pub use pages::{BoundedPages, MmapPages, PageSource};
pub use stats::{Stats, Validity};
