//! Boundary-tagged blocks: the raw-word layout of the managed heap.
//!
//! Every block in the heap starts with a header word encoding its size and an
//! allocated bit, and ends with a footer word duplicating the header. Free
//! blocks additionally store two pointer words at the start of their payload,
//! linking them into one of the segregated free lists:
//!
//! ```text
//! offset 0        header          size | allocated-bit
//! offset W        payload         prev free-list link when free
//! offset 2W       payload         next free-list link when free
//! ...
//! offset size-W   footer          duplicate of the header
//! ```
//!
//! [`BlockRef`] is the only place in the crate that touches heap words
//! directly. Everything above it works in terms of blocks and sizes.

use core::ptr::NonNull;

use static_assertions::const_assert;

/// The word size, in bytes. Sizes, addresses and alignment are all in units
/// of this.
pub const WORD: usize = core::mem::size_of::<usize>();

/// The block format stores the allocated flag in bit 0 of the size and keeps
/// all sizes 8-byte aligned; both only work out on 64-bit words.
const_assert!(WORD == 8);

/// Smallest representable block: header, two link words, footer.
pub const MIN_BLOCK: usize = 4 * WORD;

const ALLOCATED: usize = 1;

/// Round `n` up to the next multiple of the word size.
pub const fn align_up(n: usize) -> usize {
    (n + WORD - 1) & !(WORD - 1)
}

/// A reference to a block, by the address of its header word.
///
/// `BlockRef` is a plain address with accessors; it does not own the block.
/// Constructing one is unsafe: the caller asserts that the address is the
/// header of a live block (or, for [`BlockRef::from_footer`], that the
/// address is its footer). Given that, the read accessors are safe; the
/// mutating ones are unsafe because they can break heap invariants that
/// other code relies on.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct BlockRef(NonNull<u8>);

impl BlockRef {
    /// Interpret `ptr` as the header word of a block.
    ///
    /// # Safety
    ///
    /// `ptr` must be 8-byte aligned and point at the header of a block
    /// within a live heap region.
    pub unsafe fn from_header(ptr: NonNull<u8>) -> BlockRef {
        BlockRef(ptr)
    }

    /// Recover a block from a payload pointer, i.e. one previously handed to
    /// a caller: the header sits one word below it.
    ///
    /// # Safety
    ///
    /// `ptr` must be a payload pointer of a block within a live heap region.
    pub unsafe fn from_payload(ptr: NonNull<u8>) -> BlockRef {
        BlockRef(NonNull::new_unchecked(ptr.as_ptr().sub(WORD)))
    }

    /// Recover a block from the address of its footer word. This is how the
    /// heap's last block is found: its footer is the word just below
    /// `heap_end`.
    ///
    /// # Safety
    ///
    /// `ptr` must point at the footer word of a block within a live heap
    /// region.
    pub unsafe fn from_footer(ptr: NonNull<u8>) -> BlockRef {
        let tag = *(ptr.as_ptr() as *const usize);
        let size = tag & !ALLOCATED;
        BlockRef(NonNull::new_unchecked(ptr.as_ptr().add(WORD).sub(size)))
    }

    /// The address of the header word.
    pub fn addr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// The payload pointer handed out to callers, one word past the header.
    pub fn payload(self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.0.as_ptr().add(WORD)) }
    }

    fn word_at(self, byte_offset: usize) -> *mut usize {
        unsafe { self.0.as_ptr().add(byte_offset) as *mut usize }
    }

    fn header(self) -> usize {
        unsafe { *self.word_at(0) }
    }

    /// The block size in bytes, header and footer included.
    pub fn size(self) -> usize {
        self.header() & !ALLOCATED
    }

    pub fn is_allocated(self) -> bool {
        self.header() & ALLOCATED != 0
    }

    /// Whether the header and footer words agree exactly.
    pub fn tags_match(self) -> bool {
        self.header() == unsafe { *self.word_at(self.size() - WORD) }
    }

    /// Write the header and the matching footer in one go.
    ///
    /// # Safety
    ///
    /// The block must actually span `size` bytes of heap owned by the caller;
    /// the footer word lands at `addr + size - W`.
    pub unsafe fn write_tag(self, size: usize, allocated: bool) {
        let tag = size | allocated as usize;
        *self.word_at(0) = tag;
        *self.word_at(size - WORD) = tag;
    }

    /// The block physically after this one. For the heap's last block this is
    /// one-past-the-end; callers bounds-check against the heap limit before
    /// dereferencing.
    ///
    /// # Safety
    ///
    /// This block's header must be intact.
    pub unsafe fn next_physical(self) -> BlockRef {
        BlockRef(NonNull::new_unchecked(self.0.as_ptr().add(self.size())))
    }

    /// The block physically before this one, found through the footer word
    /// directly below this header.
    ///
    /// # Safety
    ///
    /// There must actually be a block below this one; the first block of the
    /// heap has the bucket-head prefix below it instead, so callers check
    /// against `heap_start` first.
    pub unsafe fn prev_physical(self) -> BlockRef {
        let prev_tag = *(self.0.as_ptr().sub(WORD) as *const usize);
        let prev_size = prev_tag & !ALLOCATED;
        BlockRef(NonNull::new_unchecked(self.0.as_ptr().sub(prev_size)))
    }

    fn read_link(self, byte_offset: usize) -> Option<BlockRef> {
        let word = unsafe { *self.word_at(byte_offset) };
        NonNull::new(word as *mut u8).map(BlockRef)
    }

    unsafe fn write_link(self, byte_offset: usize, link: Option<BlockRef>) {
        let word = link.map_or(0, |b| b.addr() as usize);
        *self.word_at(byte_offset) = word;
    }

    /// The previous sibling in this block's free list, stored in the first
    /// payload word. Meaningless while the block is allocated.
    pub fn prev_free(self) -> Option<BlockRef> {
        self.read_link(WORD)
    }

    /// The next sibling in this block's free list, stored in the second
    /// payload word. Meaningless while the block is allocated.
    pub fn next_free(self) -> Option<BlockRef> {
        self.read_link(2 * WORD)
    }

    /// # Safety
    ///
    /// The block must be free and owned by a free list being edited.
    pub unsafe fn set_prev_free(self, link: Option<BlockRef>) {
        self.write_link(WORD, link);
    }

    /// # Safety
    ///
    /// The block must be free and owned by a free list being edited.
    pub unsafe fn set_next_free(self, link: Option<BlockRef>) {
        self.write_link(2 * WORD, link);
    }
}
