//! Heap extents: the pages the arena carves chunks from.
//!
//! Each extent is exactly one page, mapped page-aligned, and starts with a
//! small [`HeapExtent`] descriptor linking it to the other extents:
//!
//! ```text
//! page boundary
//! +------------+-----------------+---------+---------+-----+
//! | HeapExtent | (sentinel)      | chunk   | chunk   | ... | <- next page boundary
//! +------------+-----------------+---------+---------+-----+
//! ```
//!
//! The first extent also holds the free list sentinel, right after its
//! descriptor, and its descriptor points back at the arena that owns it. Chunks never cross a page boundary, so "the next chunk starts
//! on a page boundary" means "this is the last chunk of its extent".
//!
//! Extents are never returned to the OS.

use core::iter;
use core::mem::size_of;
use core::ptr::{self, null_mut, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use static_assertions::const_assert;

use crate::chunk::{Chunk, MIN_ALIGN};

#[repr(C)]
pub struct HeapExtent {
    next: AtomicPtr<HeapExtent>,
    last: AtomicPtr<HeapExtent>,
    // Address of the owning arena; first extent only, 0 elsewhere.
    arena: AtomicUsize,
}

/// Bytes taken by the descriptor at the start of every extent.
pub const EXTENT_HEADER: usize = size_of::<HeapExtent>();

const_assert!(EXTENT_HEADER % MIN_ALIGN == 0);

pub fn is_page_aligned(addr: usize, page_size: usize) -> bool {
    addr % page_size == 0
}

/// Round value up to the nearest multiple of increment
pub fn round_up(value: usize, increment: usize) -> usize {
    if value == 0 {
        return 0;
    }
    increment * ((value - 1) / increment + 1)
}

impl HeapExtent {
    /// Format a freshly mapped page as an extent holding a single free chunk.
    ///
    /// `reserved` bytes right after the descriptor are left out of the chunk.
    ///
    /// # Safety
    ///
    /// `base` must be a fresh, page-aligned mapping of `page_size` bytes.
    pub unsafe fn format<'a>(
        base: NonNull<u8>,
        page_size: usize,
        reserved: usize,
    ) -> (&'a HeapExtent, &'a Chunk) {
        let extent = base.cast::<HeapExtent>().as_ptr();
        ptr::write(
            extent,
            HeapExtent {
                next: AtomicPtr::new(null_mut()),
                last: AtomicPtr::new(null_mut()),
                arena: AtomicUsize::new(0),
            },
        );

        let offset = EXTENT_HEADER + reserved;
        let at = NonNull::new_unchecked(base.as_ptr().add(offset));
        let chunk = Chunk::write(at, 0, page_size - offset);
        (&*extent, chunk)
    }

    pub fn addr(&self) -> usize {
        self as *const HeapExtent as usize
    }

    pub fn next(&self) -> Option<&HeapExtent> {
        unsafe { self.next.load(Ordering::SeqCst).as_ref() }
    }

    pub fn last(&self) -> Option<&HeapExtent> {
        unsafe { self.last.load(Ordering::SeqCst).as_ref() }
    }

    /// The arena this extent roots, as recorded when the arena was
    /// initialized. `None` for every extent but the first.
    ///
    /// An arena moved after initialization leaves this stale.
    pub fn arena(&self) -> Option<usize> {
        match self.arena.load(Ordering::SeqCst) {
            0 => None,
            addr => Some(addr),
        }
    }

    pub(crate) fn set_arena(&self, addr: usize) {
        self.arena.store(addr, Ordering::SeqCst);
    }

    /// Does this extent contain `addr`?
    pub fn contains(&self, addr: usize, page_size: usize) -> bool {
        (self.addr()..self.addr() + page_size).contains(&addr)
    }
}

/// The list of every extent the arena has mapped, oldest first.
///
/// Mutated only under the arena's structural flag.
pub struct ExtentList {
    head: AtomicPtr<HeapExtent>,
    tail: AtomicPtr<HeapExtent>,
}

impl ExtentList {
    pub const fn new() -> Self {
        ExtentList {
            head: AtomicPtr::new(null_mut()),
            tail: AtomicPtr::new(null_mut()),
        }
    }

    pub fn head(&self) -> Option<&HeapExtent> {
        unsafe { self.head.load(Ordering::SeqCst).as_ref() }
    }

    pub fn tail(&self) -> Option<&HeapExtent> {
        unsafe { self.tail.load(Ordering::SeqCst).as_ref() }
    }

    /// Append an extent at the tail.
    ///
    /// # Safety
    ///
    /// The caller must hold the arena flag, and `extent` must not be in any
    /// list yet.
    pub unsafe fn push(&self, extent: &HeapExtent) {
        let ptr = extent as *const HeapExtent as *mut HeapExtent;
        match self.tail() {
            None => self.head.store(ptr, Ordering::SeqCst),
            Some(tail) => {
                extent.last.store(tail as *const _ as *mut _, Ordering::SeqCst);
                tail.next.store(ptr, Ordering::SeqCst);
            }
        }
        self.tail.store(ptr, Ordering::SeqCst);
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeapExtent> {
        iter::successors(self.head(), |&extent| extent.next())
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.head().is_none()
    }

    /// Find the extent holding `addr`, if any.
    pub fn find(&self, addr: usize, page_size: usize) -> Option<&HeapExtent> {
        self.iter().find(|extent| extent.contains(addr, page_size))
    }
}

impl Default for ExtentList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::pages::{MmapPages, PageSource};
    use test_env_log::test;

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0, 4096), 0);
        assert_eq!(round_up(1, 4096), 4096);
        assert_eq!(round_up(4096, 4096), 4096);
        assert_eq!(round_up(4097, 4096), 8192);
    }

    #[test]
    fn test_format_and_list() {
        let pages = MmapPages::new();
        let page_size = pages.page_size();
        let list = ExtentList::new();
        assert!(list.is_empty());

        unsafe {
            let first = pages.map(page_size).unwrap();
            let (extent, chunk) = HeapExtent::format(first, page_size, 32);
            assert_eq!(extent.addr(), first.as_ptr() as usize);
            assert_eq!(chunk.addr(), extent.addr() + EXTENT_HEADER + 32);
            assert_eq!(chunk.size(), page_size - EXTENT_HEADER - 32);
            assert_eq!(chunk.prev_size(), 0);
            assert!(chunk.following(page_size).is_none());
            list.push(extent);

            let second = pages.map(page_size).unwrap();
            let (other, chunk) = HeapExtent::format(second, page_size, 0);
            assert_eq!(chunk.size(), page_size - EXTENT_HEADER);
            list.push(other);

            assert_eq!(list.len(), 2);
            assert_eq!(list.head().unwrap().addr(), extent.addr());
            assert_eq!(list.tail().unwrap().addr(), other.addr());
            assert_eq!(other.last().unwrap().addr(), extent.addr());
            assert!(extent.last().is_none());
            assert_eq!(extent.arena(), None);
            assert_eq!(other.arena(), None);
            assert_eq!(extent.next().unwrap().addr(), other.addr());

            let found = list.find(chunk.addr(), page_size).unwrap();
            assert_eq!(found.addr(), other.addr());
            assert!(is_page_aligned(extent.addr(), page_size));
        }
    }
}
