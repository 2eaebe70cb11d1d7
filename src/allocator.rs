//! The public face of the allocator.
//!
//! ### [`Allocator`](struct.Allocator.html)
//!
//! An `Allocator` wraps an [`Arena`](../arena/struct.Arena.html) with two
//! global spin flags: one serializing all allocations, one serializing all
//! releases. Allocations and releases still run concurrently with each other.
//! The arena is set up lazily by the first allocation.
//!
//! It is generic over where its pages come from
//! ([`PageSource`](../pages/trait.PageSource.html)) and over how its spin
//! loops back off ([`RelaxStrategy`](spin::relax::RelaxStrategy)).
//!
//! ### [`UnixAllocator`](struct.UnixAllocator.html)
//!
//! An `Allocator` over `mmap`-ed pages with busy-spinning, and a `const fn
//! new()`, ready to be the `#[global_allocator]`.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{null_mut, NonNull};
use core::sync::atomic::{AtomicU8, Ordering};

use spin::relax::{RelaxStrategy, Spin};

use crate::arena::Arena;
use crate::chunk::{Chunk, HEADER_SIZE, MIN_ALIGN, WORD};
use crate::error::{fatal, HeapError};
use crate::extent::round_up;
use crate::flag::SpinFlag;
use crate::pages::{MmapPages, PageSource};
use crate::stats::{Stats, Validity};

// Values of `Allocator::init`
const UNTOUCHED: u8 = 0;
const INITIALIZING: u8 = 1;
const INITIALIZED: u8 = 2;

pub struct Allocator<P, R = Spin> {
    alloc_flag: SpinFlag<R>,
    release_flag: SpinFlag<R>,
    init: AtomicU8,
    arena: Arena<P, R>,
}

impl<P, R> Allocator<P, R> {
    pub const fn with_pages(pages: P) -> Self {
        Allocator {
            alloc_flag: SpinFlag::new(),
            release_flag: SpinFlag::new(),
            init: AtomicU8::new(UNTOUCHED),
            arena: Arena::new(pages),
        }
    }

    pub fn pages(&self) -> &P {
        self.arena.pages()
    }
}

impl<P: PageSource + Default, R> Default for Allocator<P, R> {
    fn default() -> Self {
        Self::with_pages(P::default())
    }
}

impl<P: PageSource, R: RelaxStrategy> Allocator<P, R> {
    /// Get the arena, setting it up first if nobody has.
    ///
    /// # Safety
    ///
    /// The caller must hold the allocation flag.
    unsafe fn arena(&self) -> Result<&Arena<P, R>, HeapError> {
        // The plan:
        // - If initialization hasn't started, mark it as in progress,
        //   initialize, then mark it as done
        // - If it has started but not completed, spin until it is done
        // - If it finished, continue
        //
        // The allocation flag already keeps two allocations from getting
        // here at once, so the middle case should not come up.
        let state = self.init.compare_exchange(
            UNTOUCHED,
            INITIALIZING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );

        match state {
            Err(INITIALIZED) => {}
            Ok(_) => {
                if let Err(err) = self.arena.init() {
                    self.init.store(UNTOUCHED, Ordering::SeqCst);
                    return Err(err);
                }
                self.init.store(INITIALIZED, Ordering::SeqCst);
            }
            Err(_) => {
                while self.init.load(Ordering::SeqCst) == INITIALIZING {
                    R::relax();
                }
                if self.init.load(Ordering::SeqCst) != INITIALIZED {
                    // Whoever was initializing gave up; so do we.
                    return self.arena();
                }
            }
        }

        Ok(&self.arena)
    }

    /// Allocate at least `size` bytes, 8-byte aligned.
    pub fn try_allocate(&self, size: usize) -> Result<NonNull<u8>, HeapError> {
        let _guard = self.alloc_flag.acquire();
        unsafe { self.arena()?.allocate(size) }
    }

    /// Allocate at least `size` bytes, 8-byte aligned.
    ///
    /// Returns null for requests that are too large (top bit set) and when
    /// memory runs out. Any other failure ends the process.
    pub fn allocate(&self, size: usize) -> *mut u8 {
        match self.try_allocate(size) {
            Ok(ptr) => ptr.as_ptr(),
            Err(err) if !err.is_fatal() => null_mut(),
            Err(err) => fatal(&err),
        }
    }

    /// Release memory from `allocate`. Null is ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or have come from this allocator. Releasing it
    /// twice is detected (and an error) only as long as its memory has not
    /// been handed out again.
    pub unsafe fn try_release(&self, ptr: *mut u8) -> Result<(), HeapError> {
        let payload = match NonNull::new(ptr) {
            None => return Ok(()),
            Some(payload) => payload,
        };
        let _guard = self.release_flag.acquire();
        self.arena.release(payload)
    }

    /// Release memory from `allocate`. Null is ignored; a pointer that
    /// cannot be a live allocation ends the process.
    ///
    /// # Safety
    ///
    /// See `try_release`.
    pub unsafe fn release(&self, ptr: *mut u8) {
        if let Err(err) = self.try_release(ptr) {
            fatal(&err)
        }
    }

    /// How many bytes the allocation at `ptr` can actually hold.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation from this allocator.
    pub unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
        NonNull::new(ptr)
            .and_then(Chunk::from_payload)
            .map_or(0, |addr| Chunk::at(addr).size() - HEADER_SIZE)
    }

    /// Get statistics on this allocator, and verify validity of the heap.
    ///
    /// All allocation and release is held off while this runs.
    pub fn stats(&self) -> (Validity, Stats) {
        let _alloc = self.alloc_flag.acquire();
        let _release = self.release_flag.acquire();
        unsafe { self.arena.stats() }
    }
}

unsafe impl<P: PageSource, R: RelaxStrategy> GlobalAlloc for Allocator<P, R> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= MIN_ALIGN {
            return self.allocate(layout.size());
        }

        // Over-allocate, and keep the pointer we really got in the word just
        // before the one we hand out.
        let size = match layout.size().checked_add(layout.align()) {
            Some(size) => size,
            None => return null_mut(),
        };
        let raw = self.allocate(size);
        if raw.is_null() {
            return raw;
        }

        let aligned = round_up(raw as usize + 1, layout.align());
        debug_assert!(aligned - raw as usize >= WORD);
        ((aligned - WORD) as *mut usize).write(raw as usize);
        aligned as *mut u8
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if layout.align() <= MIN_ALIGN {
            return self.release(ptr);
        }

        let raw = ((ptr as usize - WORD) as *const usize).read();
        self.release(raw as *mut u8)
    }
}

/// The allocator to install with `#[global_allocator]` on Unix.
#[derive(Default)]
pub struct UnixAllocator {
    alloc: Allocator<MmapPages>,
}

impl UnixAllocator {
    pub const fn new() -> Self {
        UnixAllocator {
            alloc: Allocator::with_pages(MmapPages::new()),
        }
    }

    pub fn stats(&self) -> (Validity, Stats) {
        self.alloc.stats()
    }

    pub fn pages(&self) -> &MmapPages {
        self.alloc.pages()
    }
}

unsafe impl GlobalAlloc for UnixAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.alloc.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.alloc.dealloc(ptr, layout)
    }
}
