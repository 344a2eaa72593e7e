#![no_std]

//! A segregated free-list heap allocator.
//!
//! The allocator manages one contiguous, monotonically growing memory region
//! obtained from a [`MemorySource`]. Blocks carry boundary tags (a header
//! word duplicated as a footer) and freed blocks are kept in 25
//! size-classed, size-ordered doubly-linked lists threaded through their own
//! payload bytes, so the bookkeeping never allocates.
//!
//! Placement is first-fit over the size classes, with a clustering twist:
//! small requests grow the heap in pairs so small blocks end up next to each
//! other, and a large free block at the heap's tail is stretched by exactly
//! the shortfall instead of being bypassed. Freeing coalesces eagerly in
//! both directions, and reallocation resizes in place whenever a free
//! neighbor or the heap tail allows it.
//!
//! ```
//! use seg_allocator::{Allocator, FixedRegion};
//!
//! let mut heap = Allocator::new(FixedRegion::<4096>::new()).unwrap();
//! unsafe {
//!     let p = heap.allocate(100);
//!     let p = heap.reallocate(p, 200);
//!     heap.free(p);
//! }
//! let (validity, _) = heap.validate();
//! assert!(validity.is_valid());
//! ```
//!
//! The allocator is single-threaded by design; wrap it in your own lock if
//! you need shared access.

pub mod allocator;
pub mod block;
pub mod seglist;

#[cfg(feature = "use_libc")]
pub use allocator::SbrkSource;
pub use allocator::{Allocator, FixedRegion, MemorySource, RegionExhausted, Stats, Validity};
