//! The segregated free-list index: `BUCKETS` doubly-linked lists of free
//! blocks, one per power-of-two size class.
//!
//! The bucket heads are not stored in the allocator value. They live in the
//! heap itself, as an array of `BUCKETS` words at the very bottom of the
//! managed region, written there when the allocator initializes. [`SegList`]
//! is a transient view over that array; all link storage is in-band, inside
//! the free blocks being linked, so no list operation allocates.
//!
//! Within a bucket, blocks are kept in non-decreasing size order. Insertion
//! walks to the first successor at least as large and splices in front of it;
//! combined with the first-fit scan this makes the scan a best-fit within
//! each bucket.

use core::ptr::NonNull;

use crate::block::{align_up, BlockRef, WORD};

/// Number of size-class buckets.
pub const BUCKETS: usize = 25;

/// Bytes reserved at the bottom of the heap for the bucket-head array.
pub const fn prefix_size() -> usize {
    align_up(BUCKETS * WORD)
}

/// Map a block size to its bucket: bucket `i` covers `[2^(i+5), 2^(i+6))`,
/// with everything below 64 in bucket 0 and the top bucket catching all the
/// rest.
pub fn bucket_index(size: usize) -> usize {
    if size < 64 {
        0
    } else {
        usize::min(BUCKETS - 1, size.ilog2() as usize - 5)
    }
}

/// A view over the bucket-head array at the bottom of the heap.
///
/// Cheap to construct; the allocator materializes one per operation rather
/// than storing pointers into a region that its memory source may move on
/// construction.
pub struct SegList {
    heads: NonNull<usize>,
}

impl SegList {
    /// Zero every bucket head. Called once, right after the prefix bytes are
    /// reserved from the memory source.
    ///
    /// # Safety
    ///
    /// `base` must be the base of the managed region, with at least
    /// [`prefix_size`] writable bytes.
    pub unsafe fn initialize(base: NonNull<u8>) -> SegList {
        let heads = base.cast::<usize>();
        for i in 0..BUCKETS {
            *heads.as_ptr().add(i) = 0;
        }
        SegList { heads }
    }

    /// Reconstruct the view from the region base.
    ///
    /// # Safety
    ///
    /// `base` must be the base of a region on which [`SegList::initialize`]
    /// has run.
    pub unsafe fn from_base(base: NonNull<u8>) -> SegList {
        SegList {
            heads: base.cast::<usize>(),
        }
    }

    /// The first (smallest) block of bucket `index`, if any.
    pub fn head(&self, index: usize) -> Option<BlockRef> {
        let word = unsafe { *self.heads.as_ptr().add(index) };
        NonNull::new(word as *mut u8).map(|p| unsafe { BlockRef::from_header(p) })
    }

    unsafe fn set_head(&mut self, index: usize, block: Option<BlockRef>) {
        *self.heads.as_ptr().add(index) = block.map_or(0, |b| b.addr() as usize);
    }

    /// Link a free block into the bucket for its size, keeping the bucket in
    /// non-decreasing size order.
    ///
    /// # Safety
    ///
    /// `block` must be a free block of the managed heap that is not currently
    /// in any bucket.
    pub unsafe fn insert(&mut self, block: BlockRef) {
        let index = bucket_index(block.size());

        let head = match self.head(index) {
            None => {
                block.set_prev_free(None);
                block.set_next_free(None);
                self.set_head(index, Some(block));
                return;
            }
            Some(head) => head,
        };

        if head.size() >= block.size() {
            block.set_prev_free(None);
            block.set_next_free(Some(head));
            head.set_prev_free(Some(block));
            self.set_head(index, Some(block));
            return;
        }

        // Walk to the last sibling smaller than us and splice in after it.
        let mut cursor = head;
        while let Some(next) = cursor.next_free() {
            if next.size() >= block.size() {
                break;
            }
            cursor = next;
        }

        let next = cursor.next_free();
        block.set_prev_free(Some(cursor));
        block.set_next_free(next);
        if let Some(next) = next {
            next.set_prev_free(Some(block));
        }
        cursor.set_next_free(Some(block));
    }

    /// Remove a block from its bucket.
    ///
    /// Must run before any size change: the bucket is found from the block's
    /// current size.
    ///
    /// # Safety
    ///
    /// `block` must currently be linked into the bucket for its size.
    pub unsafe fn unlink(&mut self, block: BlockRef) {
        let index = bucket_index(block.size());
        match (block.prev_free(), block.next_free()) {
            (None, None) => self.set_head(index, None),
            (Some(prev), None) => prev.set_next_free(None),
            (None, Some(next)) => {
                next.set_prev_free(None);
                self.set_head(index, Some(next));
            }
            (Some(prev), Some(next)) => {
                prev.set_next_free(Some(next));
                next.set_prev_free(Some(prev));
            }
        }
        block.set_prev_free(None);
        block.set_next_free(None);
    }

    /// First-fit scan: starting at the bucket for `need`, return the first
    /// block with `size >= need`, moving to higher buckets as needed.
    pub fn find(&self, need: usize) -> Option<BlockRef> {
        for index in bucket_index(need)..BUCKETS {
            let mut cursor = self.head(index);
            while let Some(block) = cursor {
                if block.size() >= need {
                    return Some(block);
                }
                cursor = block.next_free();
            }
        }
        None
    }

    /// Whether `block` is linked into bucket `index`. Used by the integrity
    /// checker only; walks the whole bucket.
    pub fn bucket_contains(&self, index: usize, block: BlockRef) -> bool {
        let mut cursor = self.head(index);
        while let Some(candidate) = cursor {
            if candidate == block {
                return true;
            }
            cursor = candidate.next_free();
        }
        false
    }
}
