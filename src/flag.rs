//! Spin flags guarding the arena.
//!
//! The allocator never parks a thread: every wait is a compare-and-swap loop.
//! Each loop calls its [`RelaxStrategy`] between attempts, so the backoff is a
//! type parameter: [`Spin`](spin::relax::Spin) busy-spins, [`SchedYield`]
//! hands the CPU back to the scheduler. There is no retry limit under either.

use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::relax::RelaxStrategy;

/// A [`RelaxStrategy`] that yields to the OS scheduler between attempts.
///
/// Useful when there are more spinning threads than cores, where pure
/// busy-spinning can starve the thread holding the flag.
pub struct SchedYield;

impl RelaxStrategy for SchedYield {
    #[inline]
    fn relax() {
        unsafe {
            libc::sched_yield();
        }
    }
}

/// A process-wide mutual exclusion flag, acquired by spinning.
pub struct SpinFlag<R> {
    held: AtomicBool,
    relax: PhantomData<R>,
}

/// Proof that a [`SpinFlag`] is held. The flag is released when this is
/// dropped, on every return path.
#[must_use]
pub struct FlagGuard<'a> {
    held: &'a AtomicBool,
}

impl<R> SpinFlag<R> {
    pub const fn new() -> Self {
        SpinFlag {
            held: AtomicBool::new(false),
            relax: PhantomData,
        }
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    /// Take the flag if nobody holds it.
    pub fn try_acquire(&self) -> Option<FlagGuard<'_>> {
        self.held
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| FlagGuard { held: &self.held })
    }
}

impl<R: RelaxStrategy> SpinFlag<R> {
    /// Spin until the flag is ours.
    pub fn acquire(&self) -> FlagGuard<'_> {
        loop {
            if let Some(guard) = self.try_acquire() {
                return guard;
            }
            R::relax();
        }
    }
}

impl<R> Default for SpinFlag<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.held.store(false, Ordering::SeqCst);
    }
}
