//! Getting pages of memory from the OS.
//!
//! ### [`PageSource`](trait.PageSource.html)
//!
//! `PageSource` is a simple trait interface meant to abstract over the calls to
//! the OS to map and unmap memory.
//!
//! ### [`MmapPages`](struct.MmapPages.html)
//!
//! Anonymous private mappings from `mmap`, returned with `munmap`.
//!
//! ### [`BoundedPages`](struct.BoundedPages.html)
//!
//! Wraps another source with a hard byte budget. It is mainly useful for
//! testing what happens when the OS says no.

use core::ptr::{null_mut, NonNull};
use core::sync::atomic::{AtomicUsize, Ordering};

use errno::Errno;

pub trait PageSource {
    /// The granularity of mappings. Assumed constant for the life of the
    /// process.
    fn page_size(&self) -> usize;

    /// Map `len` bytes of zeroed, readable and writable memory, aligned to
    /// `page_size()`.
    ///
    /// # Safety
    ///
    /// `len` must be a nonzero multiple of `page_size()`.
    unsafe fn map(&self, len: usize) -> Result<NonNull<u8>, Errno>;

    /// Return a mapping to the OS.
    ///
    /// # Safety
    ///
    /// `ptr` and `len` must describe exactly one earlier `map` result, and
    /// nothing may touch that memory afterwards.
    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> Result<(), Errno>;
}

/// MmapPages uses virtual memory to grow the heap upon request.
#[derive(Default)]
pub struct MmapPages {
    // Just for tracking, not really needed
    pages: AtomicUsize,
    growths: AtomicUsize,
}

impl MmapPages {
    pub const fn new() -> Self {
        MmapPages {
            pages: AtomicUsize::new(0),
            growths: AtomicUsize::new(0),
        }
    }

    /// Pages currently mapped through this source.
    pub fn pages(&self) -> usize {
        self.pages.load(Ordering::SeqCst)
    }

    /// Number of successful `map` calls so far.
    pub fn growths(&self) -> usize {
        self.growths.load(Ordering::SeqCst)
    }
}

impl PageSource for MmapPages {
    fn page_size(&self) -> usize {
        sysconf::page::pagesize()
    }

    unsafe fn map(&self, len: usize) -> Result<NonNull<u8>, Errno> {
        let ptr = libc::mmap(
            // Address we want the memory at. We don't care, so null it is.
            null_mut(),
            // Amount of memory to allocate
            len,
            // We want read/write access to this memory
            libc::PROT_WRITE | libc::PROT_READ,
            // MAP_ANON: We don't want a file descriptor, we're just going to
            //   use the memory.
            //
            // MAP_PRIVATE: We're not sharing this with any other process.
            libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        );

        if ptr == libc::MAP_FAILED {
            return Err(errno::errno());
        }

        let ptr = NonNull::new(ptr as *mut u8).ok_or(Errno(libc::ENOMEM))?;
        self.pages.fetch_add(len / self.page_size(), Ordering::SeqCst);
        self.growths.fetch_add(1, Ordering::SeqCst);
        Ok(ptr)
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> Result<(), Errno> {
        if libc::munmap(ptr.as_ptr() as *mut libc::c_void, len) != 0 {
            return Err(errno::errno());
        }
        self.pages.fetch_sub(len / self.page_size(), Ordering::SeqCst);
        Ok(())
    }
}

/// A page source that refuses to hold more than `budget` bytes at once.
pub struct BoundedPages<P> {
    inner: P,
    budget: usize,
    used: AtomicUsize,
}

impl<P> BoundedPages<P> {
    pub const fn new(inner: P, budget: usize) -> Self {
        BoundedPages {
            inner,
            budget,
            used: AtomicUsize::new(0),
        }
    }

    /// Bytes currently mapped through this source.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }
}

impl<P: PageSource> PageSource for BoundedPages<P> {
    fn page_size(&self) -> usize {
        self.inner.page_size()
    }

    unsafe fn map(&self, len: usize) -> Result<NonNull<u8>, Errno> {
        let budget = self.budget;
        self.used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                used.checked_add(len).filter(|&total| total <= budget)
            })
            .map_err(|_| Errno(libc::ENOMEM))?;

        self.inner.map(len).map_err(|err| {
            self.used.fetch_sub(len, Ordering::SeqCst);
            err
        })
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> Result<(), Errno> {
        self.inner.unmap(ptr, len)?;
        self.used.fetch_sub(len, Ordering::SeqCst);
        Ok(())
    }
}
