//! The chunk header codec.
//!
//! Every block of memory handed out or tracked by the allocator starts with a
//! [`Chunk`] header:
//!
//! ```text
//! +-----------+----------------------------------------------+
//! | pre_size  | size of the previous chunk | LOCKED | PREV_IN_USE |
//! +-----------+----------------------------------------------+
//! | size      | size of this chunk         | MAPPED | IN_USE      |
//! +-----------+----------------------------------------------+ <- payload
//! | next      | free list link (only while free)             |
//! +-----------+----------------------------------------------+
//! | last      | free list link (only while free)             |
//! +-----------+----------------------------------------------+
//! | ...       |                                              |
//! ```
//!
//! Sizes are always multiples of 8, so the low three bits of both size words
//! carry flags. The `next` / `last` words overlap the payload: they are only
//! meaningful while the chunk is free, and belong to the caller once the chunk
//! is in use.

use core::mem::size_of;
use core::ptr::{self, null_mut, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use spin::relax::RelaxStrategy;
use static_assertions::{const_assert, const_assert_eq};

/// Size of a machine word.
pub const WORD: usize = size_of::<usize>();

/// Alignment of every chunk, and of every payload.
pub const MIN_ALIGN: usize = 8;

/// Bytes between the start of a chunk and its payload.
pub const HEADER_SIZE: usize = 2 * WORD;

/// The smallest chunk that can sit on the free list.
pub const MIN_CHUNK: usize = size_of::<Chunk>();

/// Bytes added to every request: the header, plus enough room for the free
/// list links once the chunk is released.
pub const REQUEST_OVERHEAD: usize = 4 * WORD;

// Flags stored in `size`
const IN_USE: usize = 0b001;
const MAPPED: usize = 0b010;

// Flags stored in `pre_size`
const PREV_IN_USE: usize = 0b001;
const LOCKED: usize = 0b010;

const FLAGS: usize = MIN_ALIGN - 1;

// The ordering here is SeqCst because that's the safest, if not the most
// efficient.
const ORD: Ordering = Ordering::SeqCst;

#[repr(C)]
pub struct Chunk {
    pre_size: AtomicUsize,
    size: AtomicUsize,
    next: AtomicPtr<Chunk>,
    last: AtomicPtr<Chunk>,
}

const_assert_eq!(MIN_CHUNK, 4 * WORD);
const_assert_eq!(MIN_CHUNK, REQUEST_OVERHEAD);
const_assert!(HEADER_SIZE % MIN_ALIGN == 0);
const_assert!(FLAGS & (IN_USE | MAPPED) == IN_USE | MAPPED);

/// Round a raw request up to the allocator's granularity.
///
/// Returns `None` for requests with the top bit set: read as a signed value,
/// those are negative, and are rejected before any allocation is attempted.
pub fn real_size(request: usize) -> Option<usize> {
    if request >> (usize::BITS - 1) != 0 {
        return None;
    }
    Some((request + FLAGS) & !FLAGS)
}

/// The full chunk size needed to serve a request of `request` bytes.
pub fn request_size(request: usize) -> Option<usize> {
    real_size(request).map(|size| size + REQUEST_OVERHEAD)
}

fn link(chunk: Option<&Chunk>) -> *mut Chunk {
    chunk.map_or(null_mut(), |c| c as *const Chunk as *mut Chunk)
}

impl Chunk {
    /// Write a fresh, unlinked header at `at` with the given boundary tags.
    ///
    /// # Safety
    ///
    /// `at` must be 8-aligned and point to at least `MIN_CHUNK` bytes of
    /// mapped memory not reachable by any other thread.
    pub unsafe fn write<'a>(at: NonNull<u8>, pre_size: usize, size: usize) -> &'a Chunk {
        debug_assert!(at.as_ptr() as usize % MIN_ALIGN == 0);
        let chunk = at.cast::<Chunk>().as_ptr();
        ptr::write(
            chunk,
            Chunk {
                pre_size: AtomicUsize::new(pre_size),
                size: AtomicUsize::new(size),
                next: AtomicPtr::new(null_mut()),
                last: AtomicPtr::new(null_mut()),
            },
        );
        &*chunk
    }

    /// View the header at `addr`.
    ///
    /// # Safety
    ///
    /// `addr` must be the start of a chunk inside mapped memory.
    pub unsafe fn at<'a>(addr: usize) -> &'a Chunk {
        &*(addr as *const Chunk)
    }

    /// Recover a chunk from a payload pointer handed out earlier.
    ///
    /// This is exact address arithmetic; it returns `None` only if the
    /// subtraction would wrap.
    pub fn from_payload(payload: NonNull<u8>) -> Option<usize> {
        (payload.as_ptr() as usize).checked_sub(HEADER_SIZE)
    }

    pub fn addr(&self) -> usize {
        self as *const Chunk as usize
    }

    /// The payload handed to callers: right past the two header words.
    pub fn payload(&self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked((self.addr() + HEADER_SIZE) as *mut u8) }
    }

    ////////////////////////////////////////////////////////////
    // `size` word

    /// The true length of this chunk in bytes, header included.
    pub fn size(&self) -> usize {
        self.size.load(ORD) & !FLAGS
    }

    /// Change the length, keeping the flags.
    pub fn set_size(&self, size: usize) {
        debug_assert!(size & FLAGS == 0, "unaligned chunk size {}", size);
        let _ = self
            .size
            .fetch_update(ORD, ORD, |word| Some(size | (word & FLAGS)));
    }

    pub fn is_in_use(&self) -> bool {
        self.size.load(ORD) & IN_USE != 0
    }

    pub fn set_in_use(&self, in_use: bool) {
        if in_use {
            self.size.fetch_or(IN_USE, ORD);
        } else {
            self.size.fetch_and(!IN_USE, ORD);
        }
    }

    pub fn is_mapped(&self) -> bool {
        self.size.load(ORD) & MAPPED != 0
    }

    pub fn set_mapped(&self, mapped: bool) {
        if mapped {
            self.size.fetch_or(MAPPED, ORD);
        } else {
            self.size.fetch_and(!MAPPED, ORD);
        }
    }

    /// Clear the header of a chunk that has been absorbed by a neighbor.
    ///
    /// A zero size word reads as "not in use", so releasing a stale pointer
    /// into the merged region is caught as a double release.
    pub fn retire(&self) {
        self.size.store(0, ORD);
    }

    ////////////////////////////////////////////////////////////
    // `pre_size` word

    /// Length of the chunk right before this one; 0 for the first chunk of an
    /// extent.
    pub fn prev_size(&self) -> usize {
        self.pre_size.load(ORD) & !FLAGS
    }

    pub fn prev_in_use(&self) -> bool {
        self.pre_size.load(ORD) & PREV_IN_USE != 0
    }

    pub fn set_prev_in_use(&self, in_use: bool) {
        if in_use {
            self.pre_size.fetch_or(PREV_IN_USE, ORD);
        } else {
            self.pre_size.fetch_and(!PREV_IN_USE, ORD);
        }
    }

    /// Rewrite the boundary tag describing the previous chunk. The lock bit
    /// is left alone, whoever holds it.
    pub fn set_prev(&self, size: usize, in_use: bool) {
        debug_assert!(size & FLAGS == 0, "unaligned chunk size {}", size);
        let flag = if in_use { PREV_IN_USE } else { 0 };
        let _ = self
            .pre_size
            .fetch_update(ORD, ORD, |word| Some(size | flag | (word & LOCKED)));
    }

    pub fn is_locked(&self) -> bool {
        self.pre_size.load(ORD) & LOCKED != 0
    }

    /// Take the exclusive-access bit if it is free.
    pub fn try_lock(&self) -> bool {
        self.pre_size.fetch_or(LOCKED, ORD) & LOCKED == 0
    }

    /// Spin until the exclusive-access bit is ours.
    pub fn lock<R: RelaxStrategy>(&self) {
        while !self.try_lock() {
            R::relax();
        }
    }

    pub fn unlock(&self) {
        let word = self.pre_size.fetch_and(!LOCKED, ORD);
        debug_assert!(word & LOCKED != 0, "unlocking an unlocked chunk");
    }

    ////////////////////////////////////////////////////////////
    // Neighbors

    /// The chunk ending where this one starts.
    ///
    /// # Safety
    ///
    /// The previous chunk must exist, i.e. `prev_size() != 0`.
    pub unsafe fn neighbor_before<'a>(&self) -> &'a Chunk {
        debug_assert!(self.prev_size() != 0);
        Chunk::at(self.addr() - self.prev_size())
    }

    /// The chunk starting where this one ends, which may be past the end of
    /// the extent.
    pub fn neighbor_after_addr(&self) -> usize {
        self.addr() + self.size()
    }

    /// The chunk starting where this one ends, or `None` if this chunk is
    /// the last of its extent.
    ///
    /// # Safety
    ///
    /// This chunk must live in a heap extent of `page_size` bytes.
    pub unsafe fn following<'a>(&self, page_size: usize) -> Option<&'a Chunk> {
        let next = self.neighbor_after_addr();
        if next % page_size == 0 {
            return None;
        }
        Some(Chunk::at(next))
    }

    ////////////////////////////////////////////////////////////
    // Free list links

    pub fn next(&self) -> Option<&Chunk> {
        // Links only ever hold null or chunks inside mapped extents.
        unsafe { self.next.load(ORD).as_ref() }
    }

    pub fn last(&self) -> Option<&Chunk> {
        unsafe { self.last.load(ORD).as_ref() }
    }

    pub fn set_next(&self, next: Option<&Chunk>) {
        self.next.store(link(next), ORD);
    }

    pub fn set_last(&self, last: Option<&Chunk>) {
        self.last.store(link(last), ORD);
    }

    pub fn clear_links(&self) {
        self.set_next(None);
        self.set_last(None);
    }

    pub fn as_ptr(&self) -> NonNull<Chunk> {
        NonNull::from(self)
    }
}
