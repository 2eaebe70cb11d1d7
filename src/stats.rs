//! Walking the heap to check it and count what is in it.

use core::fmt;
use core::sync::atomic::Ordering;

use crate::arena::Arena;
use crate::chunk::{Chunk, MIN_CHUNK};
use crate::extent::{is_page_aligned, EXTENT_HEADER};

/// Validity contains a representation of all invalid states found in a
/// heap walk.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validity {
    /// Chunks whose `pre_size` doesn't match the size of the chunk before
    /// them.
    pub tag_mismatches: usize,

    /// Chunks whose previous-in-use bit disagrees with the chunk before
    /// them, or heap chunks marked as mapped.
    pub flag_mismatches: usize,

    /// Extents whose chunks don't add up to exactly the end of the page:
    /// a zero size, or a chunk running past the end.
    ///
    /// This likely indicates corruption, and ends the walk of that extent,
    /// so other counts may be low.
    pub overruns: usize,

    /// Free list entries that are in use, badly linked, or outside the heap,
    /// plus any difference between the free chunks on the list, in the heap,
    /// and in the list's running count.
    pub list_mismatches: usize,

    /// Chunks in use that are not locked, or free chunks that are.
    pub lock_mismatches: usize,

    /// Free chunks directly adjacent to each other, and not merged.
    ///
    /// Releases racing with allocations can leave these behind, so they are
    /// reported, but aren't counted as invalid.
    pub adjacents: usize,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        self.tag_mismatches == 0
            && self.flag_mismatches == 0
            && self.overruns == 0
            && self.list_mismatches == 0
            && self.lock_mismatches == 0
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Heap extents mapped.
    pub extents: usize,
    /// Bytes mapped from the OS, extents and large chunks together.
    pub mapped_bytes: usize,
    /// Extent descriptors and the free list sentinel.
    pub overhead_bytes: usize,
    /// Chunks on the free list.
    pub free_chunks: usize,
    pub free_bytes: usize,
    /// Size of the wilderness chunk, 0 if there is none.
    pub top_bytes: usize,
    /// Heap chunks in use.
    pub used_chunks: usize,
    pub used_bytes: usize,
    /// Live dedicated mappings.
    pub large_chunks: usize,
    pub large_bytes: usize,
}

impl Stats {
    /// Every byte the walk could account for.
    ///
    /// Equal to `mapped_bytes` when nothing has leaked.
    pub fn accounted(&self) -> usize {
        self.overhead_bytes + self.free_bytes + self.top_bytes + self.used_bytes + self.large_bytes
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} extents ({} bytes mapped): {} used ({} bytes), {} free ({} bytes), top {} bytes, {} large ({} bytes)",
            self.extents,
            self.mapped_bytes,
            self.used_chunks,
            self.used_bytes,
            self.free_chunks,
            self.free_bytes,
            self.top_bytes,
            self.large_chunks,
            self.large_bytes,
        )
    }
}

// What the walk remembers about the chunk before the current one.
struct Previous {
    size: usize,
    in_use: bool,
    free: bool,
}

impl<P, R> Arena<P, R> {
    /// Walk every extent and the free list.
    ///
    /// # Safety
    ///
    /// Nothing may allocate or release while this runs.
    pub unsafe fn stats(&self) -> (Validity, Stats) {
        let mut validity = Validity::default();
        let mut stats = Stats::default();
        if !self.is_initialized() {
            return (validity, stats);
        }

        let page_size = self.page_size();
        let mut walked_free = 0;
        // Lowest and highest address of any extent
        let mut bounds = (usize::MAX, 0);

        for (i, extent) in self.extents.iter().enumerate() {
            stats.extents += 1;
            stats.overhead_bytes += EXTENT_HEADER;

            let end = extent.addr() + page_size;
            bounds = (bounds.0.min(extent.addr()), bounds.1.max(end));
            let mut addr = extent.addr() + EXTENT_HEADER;
            if i == 0 {
                // The sentinel
                stats.overhead_bytes += MIN_CHUNK;
                addr += MIN_CHUNK;
            }

            let mut previous: Option<Previous> = None;
            while addr < end {
                let chunk = Chunk::at(addr);
                let size = chunk.size();
                if size == 0 || addr + size > end {
                    validity.overruns += 1;
                    break;
                }

                let (expected_size, expected_in_use) = match previous {
                    None => (0, true),
                    Some(ref prev) => (prev.size, prev.in_use),
                };
                if chunk.prev_size() != expected_size {
                    validity.tag_mismatches += 1;
                }
                if chunk.prev_in_use() != expected_in_use || chunk.is_mapped() {
                    validity.flag_mismatches += 1;
                }
                if chunk.is_locked() != chunk.is_in_use() {
                    validity.lock_mismatches += 1;
                }

                let is_top = self.is_top(chunk);
                let free = !is_top && !chunk.is_in_use();
                if is_top {
                    stats.top_bytes += size;
                    if chunk.neighbor_after_addr() != end {
                        // The wilderness is the tail of its extent.
                        validity.overruns += 1;
                    }
                } else if chunk.is_in_use() {
                    stats.used_chunks += 1;
                    stats.used_bytes += size;
                } else {
                    walked_free += 1;
                }

                if free && previous.as_ref().map_or(false, |prev| prev.free) {
                    validity.adjacents += 1;
                }

                previous = Some(Previous {
                    size,
                    in_use: chunk.is_in_use(),
                    free,
                });
                addr += size;
            }
        }

        let mut last = match self.free.sentinel() {
            Some(sentinel) => sentinel,
            None => {
                validity.list_mismatches += 1;
                return (validity, stats);
            }
        };
        for chunk in self.free.iter() {
            stats.free_chunks += 1;
            stats.free_bytes += chunk.size();

            let linked_back = chunk.last().map(Chunk::addr) == Some(last.addr());
            if chunk.is_in_use() || chunk.is_mapped() || self.is_top(chunk) || !linked_back {
                validity.list_mismatches += 1;
            }
            // Free chunks found outside the list show up in the count
            // comparison below; here only check it points into the heap.
            let addr = chunk.addr();
            if addr < bounds.0 || addr >= bounds.1 || is_page_aligned(addr, page_size) {
                validity.list_mismatches += 1;
            }
            last = chunk;
        }

        validity.list_mismatches += if walked_free > stats.free_chunks {
            walked_free - stats.free_chunks
        } else {
            stats.free_chunks - walked_free
        };
        if self.free.count() != stats.free_chunks {
            validity.list_mismatches += 1;
        }

        stats.large_chunks = self.large_chunks.load(Ordering::SeqCst);
        stats.large_bytes = self.large_bytes.load(Ordering::SeqCst);
        stats.mapped_bytes = stats.extents * page_size + stats.large_bytes;

        (validity, stats)
    }
}
