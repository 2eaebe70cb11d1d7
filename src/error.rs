//! Errors, and what to do with the ones we can't recover from.

use core::fmt::{self, Write};

use errno::Errno;

/// Everything that can go wrong inside the allocator.
///
/// Only `Oversized` and `Exhausted` are reported to callers (as a null
/// pointer). The rest mean the OS failed us or the caller broke the
/// allocation contract; the arena may already be inconsistent, so they end
/// the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// The request has its top bit set: it is negative when read as signed.
    Oversized(usize),
    /// Neither the free list nor a fresh extent could hold the request.
    Exhausted(usize),
    /// The OS refused to map `len` bytes.
    Map { len: usize, errno: Errno },
    /// The OS refused to unmap a mapping.
    Unmap { addr: usize, len: usize, errno: Errno },
    /// A released pointer cannot be a chunk: it is page-aligned, misaligned,
    /// or the arena has never handed anything out.
    InvalidPointer(usize),
    /// A released chunk is not in use.
    DoubleRelease(usize),
    /// Someone tried to take the free list sentinel off the list.
    SentinelCorrupted,
}

impl HeapError {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, HeapError::Oversized(_) | HeapError::Exhausted(_))
    }
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            HeapError::Oversized(size) => write!(f, "request of {} bytes is negative", size),
            HeapError::Exhausted(size) => write!(f, "out of memory for {} bytes", size),
            HeapError::Map { len, errno } => write!(f, "mmap of {} bytes failed: {}", len, errno),
            HeapError::Unmap { addr, len, errno } => {
                write!(f, "munmap of {} bytes at {:#x} failed: {}", len, addr, errno)
            }
            HeapError::InvalidPointer(addr) => write!(f, "free chunk invalid: {:#x}", addr),
            HeapError::DoubleRelease(addr) => write!(f, "double free: {:#x}", addr),
            HeapError::SentinelCorrupted => write!(f, "free list sentinel corrupted"),
        }
    }
}

// Formatting must not allocate: we may be inside the global allocator.
struct StackBuf {
    bytes: [u8; 192],
    len: usize,
}

impl Write for StackBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.bytes.len() - self.len;
        let n = s.len().min(room);
        self.bytes[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

/// Report `err` on stderr and abort the process, without unwinding.
pub fn fatal(err: &HeapError) -> ! {
    let mut buf = StackBuf {
        bytes: [0; 192],
        len: 0,
    };
    let _ = writeln!(buf, "chunk_allocator: {}", err);
    unsafe {
        libc::write(
            libc::STDERR_FILENO,
            buf.bytes.as_ptr() as *const libc::c_void,
            buf.len,
        );
        libc::abort()
    }
}
