//! The allocator proper, and the memory sources it draws from.
//!
//! ## Types
//!
//! ### [`Allocator`](struct.Allocator.html)
//!
//! A single-threaded heap manager over a contiguous, monotonically growing
//! memory region. It hands out 8-byte-aligned payloads with
//! [`allocate`](Allocator::allocate), takes them back with
//! [`free`](Allocator::free), and resizes them with
//! [`reallocate`](Allocator::reallocate), reusing freed space through the
//! segregated free lists in [`crate::seglist`]. It is not thread-safe;
//! embedders wanting shared access must serialize outside.
//!
//! ### [`MemorySource`](trait.MemorySource.html)
//!
//! `MemorySource` abstracts the underlying provider of heap memory: a base
//! address, a current size, and an `extend` operation that appends bytes to
//! the region. Unlike an mmap-style provider, extensions are contiguous with
//! the existing region; block arithmetic relies on that.
//!
//! ### [`FixedRegion`](struct.FixedRegion.html)
//!
//! An array-backed `MemorySource` that refuses to grow past its capacity.
//! Mainly useful for tests, where it makes the out-of-memory paths
//! deterministic.
//!
//! ### [`SbrkSource`](struct.SbrkSource.html)
//!
//! A process-break `MemorySource` built on `libc::sbrk`, behind the
//! `use_libc` feature.

use core::fmt;
use core::ptr::{self, null_mut, NonNull};

use log::{debug, warn};

use crate::block::{BlockRef, MIN_BLOCK, WORD};
use crate::seglist::{bucket_index, prefix_size, SegList, BUCKETS};

/// Free tails and requests above this size are placed exactly. Smaller
/// traffic is clustered: small requests get a same-sized free neighbor
/// reserved next to them, and a small free tail is left alone for the next
/// small request rather than stretched. 50 words is a knob, not a law.
const LARGE_BLOCK: usize = 50 * WORD;

/// The provider of raw heap memory.
///
/// Implementations hand out one contiguous region that only ever grows:
/// `extend(n)` appends exactly `n` bytes to the high end and returns the base
/// address of the appended run. `low()` never changes once the region exists.
///
/// # Safety contract
///
/// The region must be 8-byte aligned, and memory returned by `extend` must be
/// unused by anything else for as long as the allocator lives. A failed
/// `extend` must leave the region exactly as it was. The provider must not
/// call back into the allocator.
pub trait MemorySource {
    type Err;

    /// Base address of the managed region.
    fn low(&self) -> NonNull<u8>;

    /// Number of bytes currently managed.
    fn size(&self) -> usize;

    /// Append `size` bytes to the region, returning the base of the new run.
    ///
    /// # Safety
    ///
    /// Callers must uphold single-threaded, non-reentrant use.
    unsafe fn extend(&mut self, size: usize) -> Result<NonNull<u8>, Self::Err>;
}

/// A `MemorySource` over an inline byte array. Growth past the capacity
/// fails with [`RegionExhausted`], which makes this the source of choice for
/// exercising out-of-memory behavior in tests.
#[repr(C, align(8))]
pub struct FixedRegion<const N: usize> {
    bytes: [u8; N],
    used: usize,
}

/// The error a [`FixedRegion`] reports when asked to grow past its capacity.
#[derive(Debug)]
pub struct RegionExhausted;

impl<const N: usize> FixedRegion<N> {
    pub fn new() -> Self {
        FixedRegion {
            bytes: [0; N],
            used: 0,
        }
    }
}

impl<const N: usize> Default for FixedRegion<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> MemorySource for FixedRegion<N> {
    type Err = RegionExhausted;

    fn low(&self) -> NonNull<u8> {
        NonNull::from(&self.bytes).cast()
    }

    fn size(&self) -> usize {
        self.used
    }

    unsafe fn extend(&mut self, size: usize) -> Result<NonNull<u8>, RegionExhausted> {
        if self.used + size > N {
            return Err(RegionExhausted);
        }
        let base = self.bytes.as_mut_ptr().add(self.used);
        self.used += size;
        Ok(NonNull::new_unchecked(base))
    }
}

/// A `MemorySource` over the process break. `sbrk` is the one POSIX
/// primitive that actually yields a contiguous, monotonically growing
/// region; failures surface as the thread's `errno`.
#[cfg(feature = "use_libc")]
pub struct SbrkSource {
    base: NonNull<u8>,
    len: usize,
}

#[cfg(feature = "use_libc")]
impl SbrkSource {
    /// Capture the current break as the region base. Nothing else in the
    /// process may move the break afterwards.
    pub fn new() -> Result<Self, errno::Errno> {
        let base = unsafe { libc::sbrk(0) };
        if base as isize == -1 || base.is_null() {
            return Err(errno::errno());
        }
        Ok(SbrkSource {
            base: unsafe { NonNull::new_unchecked(base as *mut u8) },
            len: 0,
        })
    }
}

#[cfg(feature = "use_libc")]
impl MemorySource for SbrkSource {
    type Err = errno::Errno;

    fn low(&self) -> NonNull<u8> {
        self.base
    }

    fn size(&self) -> usize {
        self.len
    }

    unsafe fn extend(&mut self, size: usize) -> Result<NonNull<u8>, errno::Errno> {
        let run = libc::sbrk(size as libc::intptr_t);
        if run as isize == -1 {
            return Err(errno::errno());
        }
        debug_assert_eq!(run as *mut u8, self.base.as_ptr().add(self.len));
        self.len += size;
        Ok(NonNull::new_unchecked(run as *mut u8))
    }
}

/// Total block size needed to serve a request of `size` payload bytes:
/// room for the header and footer, rounded up to the word, floored at the
/// minimum block. `None` if the request is so large the rounding overflows.
fn request_size(size: usize) -> Option<usize> {
    let need = size.checked_add(2 * WORD + (WORD - 1))? & !(WORD - 1);
    Some(usize::max(need, MIN_BLOCK))
}

/// A segregated free-list heap allocator over a [`MemorySource`].
///
/// Construction reserves the bucket-head prefix at the bottom of the region;
/// everything after it is a gapless sequence of boundary-tagged blocks.
///
/// The allocator does not track outstanding payloads. As with any heap,
/// pointers it hands out dangle if the allocator (and an inline source like
/// [`FixedRegion`]) is moved while they are live.
pub struct Allocator<S: MemorySource> {
    pub source: S,
}

impl<S: MemorySource> Allocator<S> {
    /// Initialize an allocator over a fresh (zero-sized) source, reserving
    /// and zeroing the bucket-head prefix.
    pub fn new(mut source: S) -> Result<Self, S::Err> {
        unsafe {
            let base = source.extend(prefix_size())?;
            debug_assert_eq!(base.as_ptr(), source.low().as_ptr());
            SegList::initialize(base);
        }
        Ok(Allocator { source })
    }

    /// Address of the first block (one past the bucket-head prefix).
    fn heap_start(&self) -> *mut u8 {
        unsafe { self.source.low().as_ptr().add(prefix_size()) }
    }

    /// One past the last managed byte.
    fn heap_end(&self) -> *mut u8 {
        unsafe { self.source.low().as_ptr().add(self.source.size()) }
    }

    /// Whether any block exists beyond the prefix.
    fn has_blocks(&self) -> bool {
        self.source.size() > prefix_size()
    }

    fn seglist(&self) -> SegList {
        unsafe { SegList::from_base(self.source.low()) }
    }

    /// Allocate `size` usable bytes, 8-byte aligned.
    ///
    /// Returns null when `size == 0` or when the source refuses to grow; in
    /// the latter case the heap is left exactly as it was.
    ///
    /// # Safety
    ///
    /// The returned pointer is only valid while the allocator stays in place
    /// and must be released through [`free`](Allocator::free) or
    /// [`reallocate`](Allocator::reallocate) of this same allocator.
    pub unsafe fn allocate(&mut self, size: usize) -> *mut u8 {
        if size == 0 {
            return null_mut();
        }
        let need = match request_size(size) {
            Some(need) => need,
            None => return null_mut(),
        };
        debug!("allocate({}): need {}", size, need);

        if let Some(block) = self.seglist().find(need) {
            let mut list = self.seglist();
            list.unlink(block);
            let found = block.size();
            if found - need >= MIN_BLOCK {
                block.write_tag(need, true);
                let rest = block.next_physical();
                rest.write_tag(found - need, false);
                list.insert(rest);
            } else {
                block.write_tag(found, true);
            }
            return block.payload().as_ptr();
        }

        match self.place_from_source(need) {
            Some(block) => {
                block.write_tag(need, true);
                block.payload().as_ptr()
            }
            None => null_mut(),
        }
    }

    /// No free block fits: grow the heap. Where and by how much depends on
    /// the heap's last block; the caller tags the returned base with `need`.
    unsafe fn place_from_source(&mut self, need: usize) -> Option<BlockRef> {
        if self.has_blocks() {
            let footer = NonNull::new_unchecked(self.heap_end().sub(WORD));
            let last = BlockRef::from_footer(footer);
            if !last.is_allocated() {
                if last.size() > LARGE_BLOCK {
                    // A large free tail: stretch it by just the shortfall
                    // and allocate at its base.
                    let shortfall = need - last.size();
                    self.source.extend(shortfall).ok()?;
                    self.seglist().unlink(last);
                    return Some(last);
                }
                // A small free tail stays put; odds are a later small
                // request absorbs it. Allocate past it.
                let base = self.source.extend(need).ok()?;
                return Some(BlockRef::from_header(base));
            }
        }
        if need > LARGE_BLOCK {
            let base = self.source.extend(need).ok()?;
            return Some(BlockRef::from_header(base));
        }
        // Small request against an allocated tail (or an empty heap):
        // reserve a same-sized free block right behind it, so small blocks
        // end up next to each other.
        let base = self.source.extend(2 * need).ok()?;
        let block = BlockRef::from_header(base);
        let spare = BlockRef::from_header(NonNull::new_unchecked(base.as_ptr().add(need)));
        spare.write_tag(need, false);
        self.seglist().insert(spare);
        Some(block)
    }

    /// Release a payload previously returned by this allocator.
    ///
    /// Freeing a block that is already free is reported with a warning and
    /// otherwise ignored. Freeing null is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a payload pointer obtained from this allocator
    /// that has not been freed since.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        let ptr = match NonNull::new(ptr) {
            Some(ptr) => ptr,
            None => return,
        };
        let block = BlockRef::from_payload(ptr);
        if !block.is_allocated() {
            warn!("free: block at {:p} is already free", ptr);
            return;
        }
        debug!("free({:p}): block of {}", ptr, block.size());
        let block = self.coalesce(block);
        block.write_tag(block.size(), false);
        self.seglist().insert(block);
    }

    /// Merge `block` with its free physical neighbors, unlinking them from
    /// their buckets. Returns the merged block, which may start lower than
    /// the original and is in no bucket; the caller reinserts as
    /// appropriate.
    unsafe fn coalesce(&mut self, block: BlockRef) -> BlockRef {
        let mut block = block;

        let next = block.next_physical();
        if next.addr() < self.heap_end() && !next.is_allocated() {
            self.seglist().unlink(next);
            block.write_tag(block.size() + next.size(), block.is_allocated());
        }

        if block.addr() > self.heap_start() {
            let prev = block.prev_physical();
            if !prev.is_allocated() {
                self.seglist().unlink(prev);
                prev.write_tag(prev.size() + block.size(), false);
                block = prev;
            }
        }

        block
    }

    /// Resize a payload, preserving its bytes up to the smaller of the old
    /// and new sizes. Prefers resizing in place, absorbing free neighbors or
    /// stretching the heap's tail; only as a last resort does it allocate
    /// elsewhere and copy.
    ///
    /// Returns the (possibly moved) payload, or null if the source refuses
    /// to grow, in which case the original payload is untouched and still
    /// live.
    ///
    /// # Safety
    ///
    /// `ptr` must be null (in which case this is
    /// [`allocate`](Allocator::allocate)) or a live payload pointer of this
    /// allocator. On success the old pointer must no longer be used.
    pub unsafe fn reallocate(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        let ptr = match NonNull::new(ptr) {
            Some(ptr) => ptr,
            None => return self.allocate(size),
        };
        let need = match request_size(size) {
            Some(need) => need,
            None => return null_mut(),
        };
        let block = BlockRef::from_payload(ptr);
        let current = block.size();
        debug!("reallocate({:p}, {}): {} -> {}", ptr, size, current, need);

        if need <= current {
            self.shrink(block, need);
            return ptr.as_ptr();
        }
        self.grow(block, size, need)
    }

    /// Give the tail of an oversized block back to the free lists. Keeps the
    /// block whole unless the cut leaves strictly more than a minimum block.
    unsafe fn shrink(&mut self, block: BlockRef, need: usize) {
        let current = block.size();
        if current - need > MIN_BLOCK {
            block.write_tag(need, true);
            let tail = block.next_physical();
            tail.write_tag(current - need, false);
            let tail = self.coalesce(tail);
            self.seglist().insert(tail);
        }
    }

    unsafe fn grow(&mut self, block: BlockRef, size: usize, need: usize) -> *mut u8 {
        let current = block.size();
        let payload_len = current - 2 * WORD;
        let src = block.payload().as_ptr();

        let next = block.next_physical();
        let next = if next.addr() < self.heap_end() {
            Some(next)
        } else {
            None
        };
        let next_free = next.filter(|n| !n.is_allocated());
        let prev_free = if block.addr() > self.heap_start() {
            let prev = block.prev_physical();
            if prev.is_allocated() {
                None
            } else {
                Some(prev)
            }
        } else {
            None
        };

        // Sandwiched between two free blocks whose span suffices: relocate
        // within the span. The block lands at the top of the span and the
        // bottom becomes one free block, unless the slack is too small to
        // stand alone.
        if let (Some(prev), Some(next)) = (prev_free, next_free) {
            let span = prev.size() + current + next.size();
            if span >= need {
                let slack = span - need;
                let mut list = self.seglist();
                list.unlink(next);
                list.unlink(prev);
                if slack < MIN_BLOCK {
                    ptr::copy(src, prev.payload().as_ptr(), payload_len);
                    prev.write_tag(span, true);
                    return prev.payload().as_ptr();
                }
                let dest = BlockRef::from_header(NonNull::new_unchecked(
                    next.addr().add(next.size()).sub(need),
                ));
                ptr::copy(src, dest.payload().as_ptr(), payload_len);
                dest.write_tag(need, true);
                prev.write_tag(slack, false);
                self.seglist().insert(prev);
                return dest.payload().as_ptr();
            }
        }

        // The successor alone suffices: absorb it without moving anything.
        if let Some(next) = next_free {
            let span = current + next.size();
            if span >= need {
                let residue = span - need;
                self.seglist().unlink(next);
                if residue < MIN_BLOCK {
                    block.write_tag(span, true);
                } else {
                    block.write_tag(need, true);
                    let rest = block.next_physical();
                    rest.write_tag(residue, false);
                    let rest = self.coalesce(rest);
                    self.seglist().insert(rest);
                }
                return block.payload().as_ptr();
            }
        }

        // The predecessor alone suffices: slide the payload down, placing
        // the block at the top of the span when a free block fits below it.
        if let Some(prev) = prev_free {
            let span = prev.size() + current;
            if span >= need {
                let residue = span - need;
                self.seglist().unlink(prev);
                if residue < MIN_BLOCK {
                    ptr::copy(src, prev.payload().as_ptr(), payload_len);
                    prev.write_tag(span, true);
                    return prev.payload().as_ptr();
                }
                let dest = BlockRef::from_header(NonNull::new_unchecked(
                    block.addr().add(current).sub(need),
                ));
                ptr::copy(src, dest.payload().as_ptr(), payload_len);
                dest.write_tag(need, true);
                prev.write_tag(residue, false);
                self.seglist().insert(prev);
                return dest.payload().as_ptr();
            }
        }

        // Last block of the heap: extend by just the shortfall, absorbing a
        // free predecessor first if there is one. The heap is extended
        // before anything is unlinked or moved, so a refusal leaves every
        // block and list as it was.
        if next.is_none() {
            if let Some(prev) = prev_free {
                let shortfall = need - (current + prev.size());
                if self.source.extend(shortfall).is_err() {
                    return null_mut();
                }
                self.seglist().unlink(prev);
                ptr::copy(src, prev.payload().as_ptr(), payload_len);
                prev.write_tag(need, true);
                return prev.payload().as_ptr();
            }
            let shortfall = need - current;
            if self.source.extend(shortfall).is_err() {
                return null_mut();
            }
            block.write_tag(need, true);
            return block.payload().as_ptr();
        }

        // No neighbor helps: fresh allocation, copy, release.
        let fresh = self.allocate(size);
        if fresh.is_null() {
            return null_mut();
        }
        ptr::copy_nonoverlapping(src, fresh, payload_len);
        self.free(src);
        fresh
    }

    /// Walk every block and every bucket and count invariant violations.
    /// Diagnostic only; the heap is not touched.
    pub fn validate(&self) -> (Validity, Stats) {
        let mut validity = Validity::default();
        let mut stats = Stats::default();
        let list = self.seglist();

        unsafe {
            let end = self.heap_end();
            let mut cursor = self.heap_start();
            let mut previous_free = false;
            while cursor < end {
                let block = BlockRef::from_header(NonNull::new_unchecked(cursor));
                let size = block.size();
                // The walk cannot continue past a misaligned or nonsensical
                // size; everything below assumes in-bounds, aligned words.
                if size % WORD != 0 || cursor as usize % WORD != 0 {
                    validity.misaligned += 1;
                    break;
                }
                if size < MIN_BLOCK
                    || (cursor as usize)
                        .checked_add(size)
                        .map_or(true, |n| n > end as usize)
                {
                    validity.corrupt_walk += 1;
                    break;
                }
                if !block.tags_match() {
                    validity.mismatched_tags += 1;
                }
                let free = !block.is_allocated();
                if free {
                    stats.free_blocks += 1;
                    stats.free_bytes += size;
                    if previous_free {
                        validity.uncoalesced += 1;
                    }
                    if !list.bucket_contains(bucket_index(size), block) {
                        validity.unlisted_free += 1;
                    }
                }
                stats.blocks += 1;
                previous_free = free;
                cursor = cursor.add(size);
            }

            for index in 0..BUCKETS {
                let mut last_size = 0;
                let mut cursor = list.head(index);
                while let Some(block) = cursor {
                    if block.is_allocated() {
                        validity.allocated_in_list += 1;
                    }
                    if bucket_index(block.size()) != index {
                        validity.misfiled += 1;
                    }
                    if block.size() < last_size {
                        validity.out_of_order += 1;
                    }
                    last_size = block.size();
                    cursor = block.next_free();
                }
            }
        }

        (validity, stats)
    }
}

impl<S: MemorySource> fmt::Display for Allocator<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FreeLists(")?;
        let list = self.seglist();
        let mut first = true;
        for index in 0..BUCKETS {
            let mut cursor = list.head(index);
            if cursor.is_none() {
                continue;
            }
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(f, "[{}]", index)?;
            while let Some(block) = cursor {
                write!(f, " {}@{:p}", block.size(), block.addr())?;
                cursor = block.next_free();
            }
        }
        write!(f, ")")
    }
}

/// Counts of invariant violations found by [`Allocator::validate`]. All
/// zeros means the heap is coherent.
#[derive(Default, Debug)]
pub struct Validity {
    /// Blocks whose header and footer words disagree.
    pub mismatched_tags: usize,

    /// Block starts or sizes that are not multiples of the word size.
    pub misaligned: usize,

    /// Pairs of physically adjacent free blocks. These should have been
    /// merged when the second one was freed.
    pub uncoalesced: usize,

    /// Free blocks found in the heap walk but missing from their bucket.
    pub unlisted_free: usize,

    /// Blocks found in a bucket with their allocated bit set.
    pub allocated_in_list: usize,

    /// Blocks linked into a bucket that does not match their size.
    pub misfiled: usize,

    /// Bucket links whose sizes are not in non-decreasing order.
    pub out_of_order: usize,

    /// Blocks whose size made the heap walk impossible to continue.
    /// This indicates corruption.
    pub corrupt_walk: usize,
}

impl Validity {
    /// A quick check that every count is zero.
    pub fn is_valid(&self) -> bool {
        self.mismatched_tags == 0
            && self.misaligned == 0
            && self.uncoalesced == 0
            && self.unlisted_free == 0
            && self.allocated_in_list == 0
            && self.misfiled == 0
            && self.out_of_order == 0
            && self.corrupt_walk == 0
    }
}

impl From<Validity> for bool {
    fn from(validity: Validity) -> bool {
        validity.is_valid()
    }
}

/// Heap totals gathered during [`Allocator::validate`].
#[derive(Default, Debug)]
pub struct Stats {
    pub blocks: usize,
    pub free_blocks: usize,
    pub free_bytes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    fn fresh<const N: usize>() -> Allocator<FixedRegion<N>> {
        Allocator::new(FixedRegion::<N>::new()).expect("region too small for the prefix")
    }

    fn assert_valid<const N: usize>(allocator: &Allocator<FixedRegion<N>>) -> Stats {
        let (validity, stats) = allocator.validate();
        log::info!("{} {:?} {:?}", allocator, validity, stats);
        assert!(validity.is_valid(), "invalid heap: {:?}", validity);
        stats
    }

    #[test]
    fn zero_sized_request_is_null() {
        let mut allocator = fresh::<4096>();
        assert!(unsafe { allocator.allocate(0) }.is_null());
        assert_eq!(allocator.source.size(), prefix_size());
    }

    #[test]
    fn first_small_allocation_reserves_a_twin() {
        let mut allocator = fresh::<4096>();
        let p = unsafe { allocator.allocate(1) };

        // A 1-byte request rounds up to a minimum block, and an empty heap
        // grows by two of them: the allocation plus a reserved free twin.
        assert_eq!(allocator.source.size(), prefix_size() + 2 * MIN_BLOCK);
        assert_eq!(p, unsafe { allocator.heap_start().add(WORD) });

        let stats = assert_valid(&allocator);
        assert_eq!(stats.blocks, 2);
        assert_eq!(stats.free_blocks, 1);
        let twin = allocator.seglist().head(0).expect("twin should be listed");
        assert_eq!(twin.addr(), unsafe { allocator.heap_start().add(MIN_BLOCK) });
        assert_eq!(twin.size(), MIN_BLOCK);
    }

    #[test]
    fn large_allocation_grows_exactly_and_frees_to_its_bucket() {
        let mut allocator = fresh::<4096>();
        let p = unsafe { allocator.allocate(1000) };
        assert!(!p.is_null());

        // 1000 + two tag words rounds to 1016; large requests grow the heap
        // by exactly that.
        assert_eq!(allocator.source.size(), prefix_size() + 1016);

        unsafe { allocator.free(p) };
        let stats = assert_valid(&allocator);
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.free_bytes, 1016);

        // 1016 files under bucket 4.
        assert_eq!(bucket_index(1016), 4);
        let head = allocator.seglist().head(4).expect("block should be filed");
        assert_eq!(head.size(), 1016);
    }

    #[test]
    fn freed_block_is_reused_first_fit() {
        let mut allocator = fresh::<4096>();
        let a = unsafe { allocator.allocate(100) };
        let b = unsafe { allocator.allocate(100) };
        assert!(!a.is_null() && !b.is_null());
        let grown = allocator.source.size();

        unsafe { allocator.free(a) };
        let again = unsafe { allocator.allocate(100) };

        assert_eq!(again, a);
        assert_eq!(allocator.source.size(), grown);
        assert_valid(&allocator);
    }

    #[test]
    fn allocate_free_allocate_keeps_the_footprint() {
        let mut allocator = fresh::<8192>();
        let p = unsafe { allocator.allocate(600) };
        let footprint = allocator.source.size();
        unsafe { allocator.free(p) };
        let q = unsafe { allocator.allocate(600) };
        assert_eq!(q, p);
        assert_eq!(allocator.source.size(), footprint);
        assert_valid(&allocator);
    }

    #[test]
    fn free_coalesces_both_neighbors() {
        let mut allocator = fresh::<8192>();
        let a = unsafe { allocator.allocate(100) };
        let b = unsafe { allocator.allocate(100) };
        let c = unsafe { allocator.allocate(100) };
        unsafe { allocator.free(a) };
        unsafe { allocator.free(c) };
        let stats = assert_valid(&allocator);
        let free_before = stats.free_blocks;

        // Freeing b bridges a and c (and whatever free tail follows c) into
        // a single block.
        unsafe { allocator.free(b) };
        let stats = assert_valid(&allocator);
        assert_eq!(stats.free_blocks, free_before - 1);
    }

    #[test]
    fn double_free_is_reported_not_fatal() {
        let mut allocator = fresh::<4096>();
        let p = unsafe { allocator.allocate(64) };
        unsafe { allocator.free(p) };
        let stats = assert_valid(&allocator);
        let free_blocks = stats.free_blocks;

        // The second free warns and changes nothing.
        unsafe { allocator.free(p) };
        let stats = assert_valid(&allocator);
        assert_eq!(stats.free_blocks, free_blocks);
    }

    #[test]
    fn free_of_null_is_a_noop() {
        let mut allocator = fresh::<4096>();
        unsafe { allocator.free(null_mut()) };
        assert_valid(&allocator);
    }

    #[test]
    fn realloc_grows_into_free_successor_in_place() {
        let mut allocator = fresh::<8192>();
        let a = unsafe { allocator.allocate(100) };
        let b = unsafe { allocator.allocate(100) };
        unsafe { allocator.free(b) };

        let grown = unsafe { allocator.reallocate(a, 200) };
        assert_eq!(grown, a);
        assert_valid(&allocator);
    }

    #[test]
    fn realloc_relocates_within_a_sandwich() {
        let mut allocator = fresh::<8192>();
        let a = unsafe { allocator.allocate(64) };
        let b = unsafe { allocator.allocate(64) };
        let c = unsafe { allocator.allocate(64) };
        assert!(!a.is_null() && !b.is_null() && !c.is_null());

        for i in 0..64u8 {
            unsafe { *b.add(i as usize) = i };
        }
        unsafe { allocator.free(a) };
        unsafe { allocator.free(c) };
        assert_valid(&allocator);

        let moved = unsafe { allocator.reallocate(b, 160) };
        assert!(!moved.is_null());
        // The combined span suffices, so the block relocates within it
        // rather than growing the heap; it lands at the top of the span.
        assert_ne!(moved, b);
        assert!(moved > b);
        for i in 0..64u8 {
            assert_eq!(unsafe { *moved.add(i as usize) }, i);
        }
        assert_valid(&allocator);
    }

    #[test]
    fn realloc_slides_into_free_predecessor() {
        let mut allocator = fresh::<8192>();
        let a = unsafe { allocator.allocate(100) };
        let b = unsafe { allocator.allocate(100) };
        // A third allocation keeps b away from the heap tail.
        let c = unsafe { allocator.allocate(100) };
        assert!(!c.is_null());

        for i in 0..100u8 {
            unsafe { *b.add(i as usize) = i };
        }
        unsafe { allocator.free(a) };

        let moved = unsafe { allocator.reallocate(b, 200) };
        assert!(!moved.is_null());
        assert!(moved < b);
        for i in 0..100u8 {
            assert_eq!(unsafe { *moved.add(i as usize) }, i);
        }
        assert_valid(&allocator);
    }

    #[test]
    fn realloc_shrink_below_the_split_threshold_keeps_the_block() {
        let mut allocator = fresh::<4096>();
        let p = unsafe { allocator.allocate(64) };
        let before = block_size_of(p);

        let q = unsafe { allocator.reallocate(p, 32) };

        // The residue would be too small for a block of its own, so nothing
        // moves and nothing is carved off.
        assert_eq!(q, p);
        assert_eq!(block_size_of(p), before);
        assert_valid(&allocator);
    }

    #[test]
    fn realloc_shrink_returns_the_tail() {
        let mut allocator = fresh::<8192>();
        let p = unsafe { allocator.allocate(500) };
        let q = unsafe { allocator.reallocate(p, 100) };
        assert_eq!(q, p);
        assert_eq!(block_size_of(p), 120);
        let stats = assert_valid(&allocator);
        assert!(stats.free_bytes >= 500 - 100);
    }

    #[test]
    fn realloc_stretches_the_last_block() {
        let mut allocator = fresh::<8192>();
        let p = unsafe { allocator.allocate(1000) };
        let footprint = allocator.source.size();

        let q = unsafe { allocator.reallocate(p, 2000) };
        assert_eq!(q, p);
        // 2000 + two tag words rounds to 2016; the heap grew by only the
        // shortfall over the block's 1016.
        assert_eq!(allocator.source.size(), footprint + (2016 - 1016));
        assert_valid(&allocator);
    }

    #[test]
    fn realloc_of_null_allocates() {
        let mut allocator = fresh::<4096>();
        let p = unsafe { allocator.reallocate(null_mut(), 48) };
        assert!(!p.is_null());
        assert_valid(&allocator);
    }

    #[test]
    fn realloc_fallback_preserves_the_payload() {
        let mut allocator = fresh::<8192>();
        let a = unsafe { allocator.allocate(40) };
        // Pin an allocated block after a so no in-place path applies.
        let b = unsafe { allocator.allocate(40) };
        assert!(!b.is_null());
        for i in 0..40u8 {
            unsafe { *a.add(i as usize) = 0xA0 ^ i };
        }

        let moved = unsafe { allocator.reallocate(a, 4000) };
        assert!(!moved.is_null());
        assert_ne!(moved, a);
        for i in 0..40u8 {
            assert_eq!(unsafe { *moved.add(i as usize) }, 0xA0 ^ i);
        }
        assert_valid(&allocator);
    }

    #[test]
    fn exhaustion_returns_null_and_preserves_the_heap() {
        // 512 bytes: the 200-byte prefix plus room for two 120-byte blocks.
        let mut allocator = fresh::<512>();
        let a = unsafe { allocator.allocate(100) };
        let b = unsafe { allocator.allocate(100) };
        assert!(!a.is_null() && !b.is_null());
        unsafe { *a = 17 };
        unsafe { *b = 34 };

        let c = unsafe { allocator.allocate(100) };
        assert!(c.is_null());
        assert_eq!(unsafe { *a }, 17);
        assert_eq!(unsafe { *b }, 34);
        assert_valid(&allocator);

        // Growth refusal during reallocate leaves the block live too.
        let grown = unsafe { allocator.reallocate(b, 400) };
        assert!(grown.is_null());
        assert_eq!(unsafe { *b }, 34);
        assert_valid(&allocator);
    }

    #[test]
    fn validate_catches_a_clobbered_footer() {
        let mut allocator = fresh::<4096>();
        let p = unsafe { allocator.allocate(64) };
        let block = unsafe { BlockRef::from_payload(NonNull::new(p).unwrap()) };

        // Overwrite the footer word, as a payload overrun would.
        unsafe {
            *(block.addr().add(block.size() - WORD) as *mut usize) = 0xdead_beef;
        }
        let (validity, _) = allocator.validate();
        assert!(!validity.is_valid());
        assert!(validity.mismatched_tags > 0);
    }

    // The block size behind a payload pointer, for assertions.
    fn block_size_of(p: *mut u8) -> usize {
        unsafe { BlockRef::from_payload(NonNull::new(p).unwrap()).size() }
    }
}
