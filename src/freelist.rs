//! The free list: a doubly linked list of unused chunks, threaded through the
//! chunks themselves and rooted at a permanent sentinel.
//!
//! Order is insertion order, and searches are first-fit.
//!
//! There is no lock on the list as a whole. Links are only changed by a
//! thread holding the exclusive-access bit of every chunk whose links it
//! writes:
//!
//! - walking holds the current chunk while taking the next one
//!   (hand-over-hand), so a chunk seen by a walk is still on the list;
//! - `append` holds the tail;
//! - unlinking holds the chunk and both of its list neighbors.
//!
//! Walks only ever *try* a lock, and start over from the sentinel when the try
//! fails. A walk never waits while holding a chunk, so it cannot deadlock
//! against a thread that does; it can, in principle, livelock.

use core::iter;
use core::ptr::{null_mut, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use spin::relax::RelaxStrategy;

use crate::chunk::Chunk;
use crate::error::HeapError;

pub struct FreeList {
    sentinel: AtomicPtr<Chunk>,
    // Chunks linked in, kept alongside the links.
    count: AtomicUsize,
}

impl FreeList {
    pub const fn new() -> Self {
        FreeList {
            sentinel: AtomicPtr::new(null_mut()),
            count: AtomicUsize::new(0),
        }
    }

    /// Write the sentinel at `at`. Its `size` and `pre_size` are both 0, and
    /// it is never allocated or released.
    ///
    /// # Safety
    ///
    /// `at` must point to `MIN_CHUNK` bytes of mapped memory reserved for the
    /// sentinel for the life of the process.
    pub unsafe fn install(&self, at: NonNull<u8>) {
        let sentinel = Chunk::write(at, 0, 0);
        self.sentinel
            .store(sentinel as *const Chunk as *mut Chunk, Ordering::SeqCst);
    }

    pub fn sentinel(&self) -> Option<&Chunk> {
        unsafe { self.sentinel.load(Ordering::SeqCst).as_ref() }
    }

    fn root(&self) -> Result<&Chunk, HeapError> {
        self.sentinel().ok_or(HeapError::SentinelCorrupted)
    }

    pub fn is_sentinel(&self, chunk: &Chunk) -> bool {
        self.sentinel.load(Ordering::SeqCst) as usize == chunk.addr()
    }

    /// Link `chunk` in at the tail.
    ///
    /// The chunk is marked free, the chunk after it in memory is told so, and
    /// the chunk's exclusive-access bit is released once it is linked.
    ///
    /// # Safety
    ///
    /// `chunk` must be locked by the caller, on no list, and live in an extent
    /// of `page_size` bytes.
    pub unsafe fn append<R: RelaxStrategy>(
        &self,
        chunk: &Chunk,
        page_size: usize,
    ) -> Result<(), HeapError> {
        debug_assert!(chunk.is_locked());
        let sentinel = self.root()?;
        chunk.set_in_use(false);
        if let Some(after) = chunk.following(page_size) {
            after.set_prev_in_use(false);
        }

        'walk: loop {
            if !sentinel.try_lock() {
                R::relax();
                continue;
            }

            let mut tail = sentinel;
            while let Some(next) = tail.next() {
                if !next.try_lock() {
                    tail.unlock();
                    R::relax();
                    continue 'walk;
                }
                tail.unlock();
                tail = next;
            }

            chunk.set_next(None);
            chunk.set_last(Some(tail));
            tail.set_next(Some(chunk));
            self.count.fetch_add(1, Ordering::SeqCst);
            tail.unlock();
            break;
        }

        chunk.unlock();
        Ok(())
    }

    /// Take `chunk` off the list.
    ///
    /// Locks on both list neighbors are needed; if the second can't be had,
    /// the first is dropped again before retrying, so we never wait on one
    /// while holding the other.
    ///
    /// # Safety
    ///
    /// `chunk` must be locked by the caller and linked into this list.
    pub unsafe fn unlink<R: RelaxStrategy>(&self, chunk: &Chunk) -> Result<(), HeapError> {
        if self.is_sentinel(chunk) {
            return Err(HeapError::SentinelCorrupted);
        }
        debug_assert!(chunk.is_locked());

        // Every linked chunk has at least the sentinel before it.
        let last = chunk.last().ok_or(HeapError::SentinelCorrupted)?;
        let next = chunk.next();

        loop {
            if !last.try_lock() {
                R::relax();
                continue;
            }
            if let Some(next) = next {
                if !next.try_lock() {
                    last.unlock();
                    R::relax();
                    continue;
                }
            }
            break;
        }

        last.set_next(next);
        if let Some(next) = next {
            next.set_last(Some(last));
            next.unlock();
        }
        self.count.fetch_sub(1, Ordering::SeqCst);
        last.unlock();
        chunk.clear_links();
        Ok(())
    }

    /// Find the first chunk of at least `size` bytes and take it off the list.
    ///
    /// The chunk comes back locked.
    ///
    /// # Safety
    ///
    /// Every chunk on the list must still be mapped.
    pub unsafe fn take_first_fit<R: RelaxStrategy>(
        &self,
        size: usize,
    ) -> Result<Option<&Chunk>, HeapError> {
        let sentinel = self.root()?;
        'search: loop {
            if !sentinel.try_lock() {
                R::relax();
                continue;
            }

            let mut prev = sentinel;
            loop {
                let cur = match prev.next() {
                    None => {
                        prev.unlock();
                        return Ok(None);
                    }
                    Some(cur) => cur,
                };
                if !cur.try_lock() {
                    prev.unlock();
                    R::relax();
                    continue 'search;
                }

                if cur.size() < size {
                    prev.unlock();
                    prev = cur;
                    continue;
                }

                // Found one; its successor has to be held too before we can
                // splice it out.
                let next = cur.next();
                if let Some(next) = next {
                    if !next.try_lock() {
                        cur.unlock();
                        prev.unlock();
                        R::relax();
                        continue 'search;
                    }
                }

                prev.set_next(next);
                if let Some(next) = next {
                    next.set_last(Some(prev));
                    next.unlock();
                }
                self.count.fetch_sub(1, Ordering::SeqCst);
                prev.unlock();
                cur.clear_links();
                debug_assert!(!cur.is_in_use());
                return Ok(Some(cur));
            }
        }
    }

    /// Iterate through the list, sentinel excluded.
    ///
    /// This does not lock anything, and is only meaningful while no other
    /// thread is allocating or releasing.
    pub fn iter(&self) -> impl Iterator<Item = &Chunk> {
        iter::successors(self.sentinel().and_then(|s| s.next()), |&chunk| {
            chunk.next()
        })
    }

    /// Number of chunks on the list. Same caveats as `iter`.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Number of chunks on the list, by the running count. Unlike `len`,
    /// this is safe to read while other threads use the list.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.sentinel().and_then(|s| s.next()).is_none()
    }
}

impl Default for FreeList {
    fn default() -> Self {
        Self::new()
    }
}
