//! The release side: validating released pointers, returning dedicated
//! mappings, and merging released chunks with their free neighbors.
//!
//! Everything here assumes the caller holds the allocator's release flag.
//! Allocations run concurrently, so every chunk found by address arithmetic
//! is locked before it is inspected, and a lock that cannot be had is
//! either retried (backward) or taken as the end of the merge (forward).

use core::ptr::NonNull;
use core::sync::atomic::Ordering;

use spin::relax::RelaxStrategy;

use crate::arena::Arena;
use crate::chunk::{Chunk, MIN_ALIGN};
use crate::error::HeapError;
use crate::extent::{is_page_aligned, EXTENT_HEADER};
use crate::pages::PageSource;

impl<P: PageSource, R: RelaxStrategy> Arena<P, R> {
    /// Release the allocation at `payload`.
    ///
    /// # Safety
    ///
    /// The caller must hold the release flag, and `payload` must have come
    /// from `allocate` on this arena. Pointers that are not page-aligned and
    /// were never handed out are undefined behavior; the checks here only
    /// catch what the chunk headers can tell us.
    pub unsafe fn release(&self, payload: NonNull<u8>) -> Result<(), HeapError> {
        let chunk = self.chunk_of(payload)?;

        if chunk.is_mapped() {
            return self.release_large(chunk);
        }

        if !chunk.is_in_use() {
            return Err(HeapError::DoubleRelease(chunk.addr()));
        }

        // Held since allocation.
        chunk.unlock();
        if !self.try_combine(chunk)? {
            self.free.append::<R>(chunk, self.page_size())?;
        }
        trace!("release: {} chunks on the free list", self.free.count());
        Ok(())
    }

    /// Find the chunk behind a payload pointer.
    pub(crate) unsafe fn chunk_of(&self, payload: NonNull<u8>) -> Result<&Chunk, HeapError> {
        let page_size = self.page_size();
        let addr = Chunk::from_payload(payload)
            .ok_or(HeapError::InvalidPointer(payload.as_ptr() as usize))?;

        if page_size == 0 || addr % MIN_ALIGN != 0 || is_page_aligned(addr, page_size) {
            return Err(HeapError::InvalidPointer(addr));
        }

        Ok(Chunk::at(addr))
    }

    unsafe fn release_large(&self, chunk: &Chunk) -> Result<(), HeapError> {
        let addr = chunk.addr() - EXTENT_HEADER;
        let len = chunk.size() + EXTENT_HEADER;

        self.pages
            .unmap(NonNull::new_unchecked(addr as *mut u8), len)
            .map_err(|errno| HeapError::Unmap { addr, len, errno })?;

        self.large_chunks.fetch_sub(1, Ordering::SeqCst);
        self.large_bytes.fetch_sub(len, Ordering::SeqCst);
        trace!("release: unmapped {} bytes at {:#x}", len, addr);
        Ok(())
    }

    /// Merge `chunk` with any free neighbors in its extent.
    ///
    /// Returns `true` if anything merged; the merged region is then already
    /// on the free list, or is the wilderness. Returns `false` if nothing
    /// merged, leaving `chunk` locked, free, and for the caller to list.
    unsafe fn try_combine<'a>(&'a self, chunk: &'a Chunk) -> Result<bool, HeapError> {
        let page_size = self.page_size();
        chunk.lock::<R>();
        chunk.set_in_use(false);

        let mut cur = chunk;
        let mut merged = false;

        // Backward. The tag is re-read on every pass: an allocation may be
        // splitting the chunk before us while we wait for it.
        loop {
            if cur.prev_size() == 0 || cur.prev_in_use() {
                break;
            }

            let prev = cur.neighbor_before();
            if !prev.try_lock() {
                R::relax();
                continue;
            }

            // Chunks in use stay locked, so a lockable neighbor should be a
            // listed free chunk. Anything else and we stop merging here.
            if prev.is_in_use()
                || prev.neighbor_after_addr() != cur.addr()
                || self.is_top(prev)
            {
                prev.unlock();
                break;
            }

            self.free.unlink::<R>(prev)?;
            let size = prev.size() + cur.size();
            prev.set_size(size);
            cur.retire();
            if let Some(after) = prev.following(page_size) {
                after.set_prev(size, false);
            }
            trace!("release: merged back into {:#x}, {} bytes", prev.addr(), size);

            cur = prev;
            merged = true;
        }

        // Forward.
        loop {
            let next = match cur.following(page_size) {
                None => break,
                Some(next) => next,
            };
            if next.is_in_use() {
                break;
            }

            {
                let _guard = self.flag.acquire();
                if self.is_top(next) {
                    next.lock::<R>();
                    let size = cur.size() + next.size();
                    cur.set_size(size);
                    next.retire();
                    self.set_top(Some(cur));
                    cur.unlock();
                    trace!("release: {:#x} is the new top, {} bytes", cur.addr(), size);
                    return Ok(true);
                }
            }

            if !next.try_lock() {
                break;
            }
            if next.is_in_use() {
                next.unlock();
                break;
            }

            self.free.unlink::<R>(next)?;
            let size = cur.size() + next.size();
            cur.set_size(size);
            next.retire();
            if let Some(after) = cur.following(page_size) {
                after.set_prev(size, false);
            }
            trace!("release: merged forward into {:#x}, {} bytes", cur.addr(), size);
            merged = true;
        }

        if merged {
            self.free.append::<R>(cur, page_size)?;
        }
        Ok(merged)
    }
}
