//! The arena, and the allocation side of the allocator.
//!
//! There is exactly one arena per allocator. It owns:
//!
//! - the free list (rooted at a sentinel in the first extent),
//! - the wilderness ("top") chunk: the unclaimed tail of the newest extent,
//!   or nothing once that tail has been handed out whole,
//! - the list of extents,
//! - a structural flag, held while the top pointer or the extent list
//!   changes, and while the top chunk itself is resized.
//!
//! An allocation is served, in order of preference, by a dedicated mapping
//! (for requests too large for an extent), the first free chunk big enough,
//! the top chunk, or the top chunk of a freshly mapped extent.
//!
//! Everything here assumes the caller holds the allocator's allocation flag,
//! so at most one thread is ever in these methods. Releases, handled in
//! [`coalesce`](../coalesce/index.html), run alongside.

use core::ptr::{null_mut, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use spin::relax::RelaxStrategy;

use crate::chunk::{request_size, Chunk, MIN_CHUNK};
use crate::error::HeapError;
use crate::extent::{round_up, ExtentList, HeapExtent, EXTENT_HEADER};
use crate::flag::SpinFlag;
use crate::freelist::FreeList;
use crate::pages::PageSource;

pub struct Arena<P, R> {
    pub(crate) pages: P,
    // 0 until `init` has run.
    pub(crate) page_size: AtomicUsize,
    pub(crate) free: FreeList,
    pub(crate) top: AtomicPtr<Chunk>,
    pub(crate) extents: ExtentList,
    pub(crate) flag: SpinFlag<R>,
    pub(crate) large_chunks: AtomicUsize,
    pub(crate) large_bytes: AtomicUsize,
}

impl<P, R> Arena<P, R> {
    pub const fn new(pages: P) -> Self {
        Arena {
            pages,
            page_size: AtomicUsize::new(0),
            free: FreeList::new(),
            top: AtomicPtr::new(null_mut()),
            extents: ExtentList::new(),
            flag: SpinFlag::new(),
            large_chunks: AtomicUsize::new(0),
            large_bytes: AtomicUsize::new(0),
        }
    }

    pub fn pages(&self) -> &P {
        &self.pages
    }

    pub fn page_size(&self) -> usize {
        self.page_size.load(Ordering::SeqCst)
    }

    pub fn is_initialized(&self) -> bool {
        self.page_size() != 0
    }

    /// Requests whose chunk would be larger than this get their own mapping.
    pub fn large_threshold(&self) -> usize {
        self.page_size() - EXTENT_HEADER - MIN_CHUNK
    }

    /// The current wilderness chunk, if there is one.
    pub fn top(&self) -> Option<&Chunk> {
        unsafe { self.top.load(Ordering::SeqCst).as_ref() }
    }

    pub fn is_top(&self, chunk: &Chunk) -> bool {
        self.top.load(Ordering::SeqCst) as usize == chunk.addr()
    }

    pub(crate) fn set_top(&self, chunk: Option<&Chunk>) {
        let ptr = chunk.map_or(null_mut(), |c| c.as_ptr().as_ptr());
        self.top.store(ptr, Ordering::SeqCst);
    }

    pub fn free_list(&self) -> &FreeList {
        &self.free
    }

    pub fn extents(&self) -> &ExtentList {
        &self.extents
    }
}

impl<P: PageSource, R: RelaxStrategy> Arena<P, R> {
    unsafe fn map(&self, len: usize) -> Result<NonNull<u8>, HeapError> {
        self.pages
            .map(len)
            .map_err(|errno| HeapError::Map { len, errno })
    }

    /// Map the first extent: it holds the free list sentinel, and the rest of
    /// it becomes the wilderness.
    ///
    /// # Safety
    ///
    /// Must be called once, before any other operation on the arena.
    pub unsafe fn init(&self) -> Result<(), HeapError> {
        let page_size = self.pages.page_size();
        let base = self.map(page_size)?;
        let (extent, chunk) = HeapExtent::format(base, page_size, MIN_CHUNK);
        extent.set_arena(self as *const Self as usize);
        // Nothing before the first chunk of an extent can be merged with it.
        chunk.set_prev_in_use(true);
        self.free
            .install(NonNull::new_unchecked(base.as_ptr().add(EXTENT_HEADER)));

        let _guard = self.flag.acquire();
        self.extents.push(extent);
        self.set_top(Some(chunk));
        self.page_size.store(page_size, Ordering::SeqCst);
        trace!(
            "arena: initialized at {:#x}, page size {}",
            extent.addr(),
            page_size
        );
        Ok(())
    }

    /// Allocate a chunk for `request` bytes and return its payload.
    ///
    /// # Safety
    ///
    /// The arena must be initialized, and the caller must hold the allocation
    /// flag.
    pub unsafe fn allocate(&self, request: usize) -> Result<NonNull<u8>, HeapError> {
        let size = request_size(request).ok_or(HeapError::Oversized(request))?;

        if size > self.large_threshold() {
            return self.allocate_large(size);
        }

        if let Some(chunk) = self.take_from_free_list(size)? {
            return Ok(chunk.payload());
        }

        if let Some(chunk) = self.split_top(size) {
            return Ok(chunk.payload());
        }

        self.extend(size).map(Chunk::payload)
    }

    /// Give a chunk of `size` bytes its own mapping.
    unsafe fn allocate_large(&self, size: usize) -> Result<NonNull<u8>, HeapError> {
        let len = round_up(size + EXTENT_HEADER, self.page_size());
        let base = self.map(len)?;

        // Offset into the mapping so the chunk address is not page-aligned,
        // like every other chunk.
        let at = NonNull::new_unchecked(base.as_ptr().add(EXTENT_HEADER));
        let chunk = Chunk::write(at, 0, len - EXTENT_HEADER);
        chunk.set_mapped(true);
        chunk.set_in_use(true);
        chunk.set_prev_in_use(true);
        chunk.try_lock();

        self.large_chunks.fetch_add(1, Ordering::SeqCst);
        self.large_bytes.fetch_add(len, Ordering::SeqCst);
        trace!("allocate: mapped {} bytes at {:#x}", len, base.as_ptr() as usize);
        Ok(chunk.payload())
    }

    /// First-fit from the free list, splitting off whatever is left over if
    /// it is big enough to be a chunk of its own.
    unsafe fn take_from_free_list(&self, size: usize) -> Result<Option<&Chunk>, HeapError> {
        let chunk = match self.free.take_first_fit::<R>(size)? {
            None => return Ok(None),
            Some(chunk) => chunk,
        };
        let page_size = self.page_size();
        chunk.set_in_use(true);

        let rest = chunk.size() - size;
        if rest > MIN_CHUNK {
            let at = NonNull::new_unchecked((chunk.addr() + size) as *mut u8);
            let remainder = Chunk::write(at, size, rest);
            remainder.set_prev_in_use(true);
            remainder.try_lock();
            chunk.set_size(size);
            if let Some(after) = remainder.following(page_size) {
                after.set_prev(rest, false);
            }
            self.free.append::<R>(remainder, page_size)?;
            trace!(
                "allocate: split free chunk at {:#x} into {} + {}",
                chunk.addr(),
                size,
                rest
            );
        } else {
            if let Some(after) = chunk.following(page_size) {
                after.set_prev_in_use(true);
            }
            trace!(
                "allocate: free chunk at {:#x} of {} bytes",
                chunk.addr(),
                chunk.size()
            );
        }

        Ok(Some(chunk))
    }

    /// Carve `size` bytes off the front of the wilderness.
    ///
    /// Returns `None`, leaving the wilderness alone, if there is none or it
    /// is too small. Otherwise the returned chunk is in use and locked.
    pub(crate) unsafe fn split_top(&self, size: usize) -> Option<&Chunk> {
        let _guard = self.flag.acquire();
        let top = self.top()?;
        top.lock::<R>();

        let top_size = top.size();
        if top_size < size {
            top.unlock();
            return None;
        }

        let rest = top_size - size;
        if rest > MIN_CHUNK {
            let at = NonNull::new_unchecked((top.addr() + size) as *mut u8);
            let new_top = Chunk::write(at, size, rest);
            new_top.set_prev_in_use(true);
            top.set_size(size);
            self.set_top(Some(new_top));
        } else {
            // Too little left to track; hand out all of it.
            self.set_top(None);
        }
        top.set_in_use(true);

        trace!("allocate: {} bytes from the top at {:#x}", top.size(), top.addr());
        Some(top)
    }

    /// Map a new extent, make it the wilderness, and allocate from it.
    ///
    /// The old wilderness, if any, goes onto the free list.
    unsafe fn extend(&self, size: usize) -> Result<&Chunk, HeapError> {
        let page_size = self.page_size();
        let base = self.map(page_size)?;
        let (extent, chunk) = HeapExtent::format(base, page_size, 0);
        chunk.set_prev_in_use(true);

        let old = {
            let _guard = self.flag.acquire();
            self.extents.push(extent);
            let old = self.top();
            if let Some(old) = old {
                old.lock::<R>();
            }
            self.set_top(Some(chunk));
            old
        };
        trace!("extend: new extent at {:#x}", extent.addr());

        if let Some(old) = old {
            self.free.append::<R>(old, page_size)?;
        }

        self.split_top(size).ok_or(HeapError::Exhausted(size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::vec::Vec;

    use spin::relax::Spin;
    use test_env_log::test;

    use crate::chunk::{HEADER_SIZE, REQUEST_OVERHEAD};
    use crate::pages::{BoundedPages, MmapPages};

    fn arena() -> Arena<MmapPages, Spin> {
        let arena = Arena::new(MmapPages::new());
        unsafe { arena.init().unwrap() };
        arena
    }

    unsafe fn chunk(payload: NonNull<u8>) -> &'static Chunk {
        Chunk::at(Chunk::from_payload(payload).unwrap())
    }

    #[test]
    fn test_init() {
        let arena = arena();
        let page_size = arena.page_size();
        assert_eq!(arena.extents().len(), 1);
        assert!(arena.free_list().is_empty());

        let top = arena.top().unwrap();
        let base = arena.extents().head().unwrap().addr();
        assert_eq!(top.addr(), base + EXTENT_HEADER + MIN_CHUNK);
        assert_eq!(top.size(), page_size - EXTENT_HEADER - MIN_CHUNK);
        assert_eq!(top.size(), arena.large_threshold());
        assert!(!top.is_in_use());
    }

    #[test]
    fn test_first_extent_points_at_arena() {
        let arena: Arena<MmapPages, Spin> = Arena::new(MmapPages::new());
        unsafe { arena.init().unwrap() };
        let owner = &arena as *const Arena<MmapPages, Spin> as usize;
        assert_eq!(arena.extents().head().unwrap().arena(), Some(owner));

        // Later extents don't
        unsafe { arena.allocate(arena.large_threshold() - REQUEST_OVERHEAD).unwrap() };
        unsafe { arena.allocate(8).unwrap() };
        let tail = arena.extents().tail().unwrap();
        assert_eq!(arena.extents().len(), 2);
        assert_eq!(tail.arena(), None);
        assert_eq!(tail.last().unwrap().arena(), Some(owner));
    }

    #[test]
    fn test_split_top() {
        let arena = arena();
        let top = arena.top().unwrap().addr();
        let p1 = unsafe { arena.allocate(40).unwrap() };
        let p2 = unsafe { arena.allocate(8).unwrap() };

        // Consecutive allocations come from consecutive stretches of the top
        assert_eq!(p1.as_ptr() as usize, top + HEADER_SIZE);
        let first = unsafe { chunk(p1) };
        assert_eq!(first.size(), 40 + REQUEST_OVERHEAD);
        assert_eq!(p2.as_ptr() as usize, first.neighbor_after_addr() + HEADER_SIZE);

        let second = unsafe { chunk(p2) };
        assert!(first.is_in_use() && first.is_locked());
        assert!(second.prev_in_use());
        assert_eq!(second.prev_size(), first.size());
        assert_eq!(arena.top().unwrap().addr(), second.neighbor_after_addr());
    }

    #[test]
    fn test_large_threshold() {
        let arena = arena();
        let threshold = arena.large_threshold();

        // Exactly at the threshold: still a heap chunk, and it consumes the
        // whole first wilderness.
        let below = threshold - REQUEST_OVERHEAD;
        let p = unsafe { arena.allocate(below).unwrap() };
        let c = unsafe { chunk(p) };
        assert!(!c.is_mapped());
        assert_eq!(c.size(), threshold);
        assert!(arena.top().is_none());
        assert_eq!(arena.large_chunks.load(Ordering::SeqCst), 0);

        // One word more gets a mapping of its own.
        let p = unsafe { arena.allocate(below + 8).unwrap() };
        let c = unsafe { chunk(p) };
        assert!(c.is_mapped() && c.is_in_use());
        assert_ne!(c.addr() % arena.page_size(), 0);
        assert_eq!(arena.large_chunks.load(Ordering::SeqCst), 1);
        assert_eq!(arena.large_bytes.load(Ordering::SeqCst), arena.page_size());
        assert_eq!(arena.extents().len(), 1);
    }

    #[test]
    fn test_oversized() {
        let arena = arena();
        let err = unsafe { arena.allocate(usize::MAX).unwrap_err() };
        assert_eq!(err, HeapError::Oversized(usize::MAX));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_wilderness_growth() {
        let arena = arena();
        let page_size = arena.page_size();

        let mut chunks = Vec::new();
        while arena.extents().len() < 4 {
            let p = unsafe { arena.allocate(200).unwrap() };
            chunks.push(unsafe { chunk(p) });
        }

        for c in &chunks {
            assert!(c.is_in_use());
            // A chunk never crosses into the next extent
            let first_page = c.addr() / page_size;
            let last_page = (c.addr() + c.size() - 1) / page_size;
            assert_eq!(first_page, last_page);
            assert!(arena.extents().find(c.addr(), page_size).is_some());
        }

        // Each superseded wilderness that was big enough to keep went to the
        // free list.
        for free in arena.free_list().iter() {
            assert!(free.size() > MIN_CHUNK);
            assert!(free.size() < 200 + REQUEST_OVERHEAD);
            assert!(!free.is_in_use() && !free.is_locked());
        }
    }

    #[test]
    fn test_free_list_first_fit_and_split() {
        let arena = arena();
        let page_size = arena.page_size();
        unsafe {
            let big = arena.allocate(256).unwrap();
            let _fence = arena.allocate(8).unwrap();

            // Put the big chunk on the free list by hand
            let c = chunk(big);
            arena.free.append::<Spin>(c, page_size).unwrap();
            assert_eq!(arena.free_list().len(), 1);

            // A small request is cut from its front, and the remainder stays
            // on the list.
            let small = arena.allocate(16).unwrap();
            assert_eq!(small, big);
            assert_eq!(c.size(), 16 + REQUEST_OVERHEAD);
            let rest = arena.free_list().iter().next().unwrap();
            assert_eq!(rest.addr(), c.neighbor_after_addr());
            assert_eq!(rest.size(), 256 - 16);
            assert_eq!(rest.prev_size(), c.size());
            assert!(rest.prev_in_use());
            assert!(!rest.following(page_size).unwrap().prev_in_use());

            // A request for the whole remainder, give or take less than a
            // chunk, takes all of it.
            let rest_addr = rest.addr();
            let all = arena.allocate(256 - 16 - REQUEST_OVERHEAD - 8).unwrap();
            assert_eq!(chunk(all).addr(), rest_addr);
            assert_eq!(chunk(all).size(), 256 - 16);
            assert!(arena.free_list().is_empty());
            assert!(chunk(all).following(page_size).unwrap().prev_in_use());
        }
    }

    #[test]
    fn test_map_failure() {
        let inner = MmapPages::new();
        let page_size = crate::pages::PageSource::page_size(&inner);
        let arena: Arena<_, Spin> = Arena::new(BoundedPages::new(inner, page_size));
        unsafe {
            arena.init().unwrap();
            let threshold = arena.large_threshold();
            arena.allocate(threshold - REQUEST_OVERHEAD).unwrap();

            let err = arena.allocate(8).unwrap_err();
            assert!(matches!(err, HeapError::Map { len, .. } if len == page_size));
            assert!(err.is_fatal());
        }
    }
}
