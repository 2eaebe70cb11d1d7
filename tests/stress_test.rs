use core::alloc::{GlobalAlloc, Layout};
use core::ptr::null_mut;

use chunk_allocator::{Allocator, MmapPages};

use rand::distributions::Distribution;
use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};
use test_env_log::test;

// A live allocation: where, how, and the byte it was filled with.
#[derive(Clone, Copy)]
struct Live {
    ptr: *mut u8,
    layout: Layout,
    fill: u8,
}

const EMPTY: Live = Live {
    ptr: null_mut(),
    layout: Layout::new::<usize>(),
    fill: 0,
};

fn validate(allocator: &Allocator<MmapPages>, live: usize) {
    let (validity, stats) = allocator.stats();
    log::info!("Live: {}; Validity: {:?}, Stats: {}", live, validity, stats);
    assert!(validity.is_valid(), "{:?}", validity);

    // Every mapped byte is somewhere
    assert_eq!(stats.accounted(), stats.mapped_bytes);
    assert_eq!(stats.used_chunks + stats.large_chunks, live);
    assert_eq!(
        allocator.pages().pages() * allocator_page_size(allocator),
        stats.mapped_bytes
    );
}

fn allocator_page_size(allocator: &Allocator<MmapPages>) -> usize {
    use chunk_allocator::PageSource;
    allocator.pages().page_size()
}

unsafe fn check_fill(entry: &Live) {
    let bytes = core::slice::from_raw_parts(entry.ptr, entry.layout.size());
    assert!(
        bytes.iter().all(|&b| b == entry.fill),
        "allocation at {:?} was overwritten",
        entry.ptr
    );
}

#[test]
fn test_stress() {
    let allocator: Allocator<MmapPages> = Allocator::default();

    // Note: the null pointer means not allocated
    let mut pointers: [Live; 128] = [EMPTY; 128];
    let mut live: usize = 0;

    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("Using seed {}", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let range = rand::distributions::Uniform::new_inclusive(1usize, 32);

    for _ in 0..1024 * 10 {
        let chosen = pointers.choose_mut(&mut rng).unwrap();
        if chosen.ptr.is_null() {
            // Let's try allocating. Now and then, something too big for an
            // extent.
            let mut new_size = range.sample(&mut rng) * range.sample(&mut rng);
            if rng.gen_ratio(1, 32) {
                new_size *= 16;
            }
            let &align = [1usize, 2, 4, 8, 16, 64].choose(&mut rng).unwrap();
            let layout = Layout::from_size_align(new_size, align).unwrap();
            let ptr = unsafe { allocator.alloc(layout) };
            log::info!("Allocated {:?} {}@{}", ptr, layout.size(), layout.align());
            assert!(!ptr.is_null());
            assert_eq!(ptr as usize % align, 0);

            let fill: u8 = rng.gen();
            unsafe { core::ptr::write_bytes(ptr, fill, new_size) };
            *chosen = Live { ptr, layout, fill };
            live += 1;
        } else {
            // Let's try freeing
            log::info!(
                "Deallocating {:?} {}@{}",
                chosen.ptr,
                chosen.layout.size(),
                chosen.layout.align()
            );
            unsafe {
                check_fill(chosen);
                allocator.dealloc(chosen.ptr, chosen.layout);
            }
            *chosen = EMPTY;
            live -= 1;
        }

        // And validate that everything is ok
        validate(&allocator, live);
    }

    // Nothing that is still live was disturbed
    for entry in pointers.iter().filter(|entry| !entry.ptr.is_null()) {
        unsafe {
            check_fill(entry);
            allocator.dealloc(entry.ptr, entry.layout);
        }
    }
    validate(&allocator, 0);

    let (_, stats) = allocator.stats();
    assert_eq!(stats.used_bytes, 0);
    assert_eq!(stats.large_bytes, 0);
}

#[test]
fn test_reuse_after_release() {
    let allocator: Allocator<MmapPages> = Allocator::default();

    for &size in &[8usize, 100, 1000, 3000] {
        let a = allocator.allocate(size);
        let fence = allocator.allocate(8);
        unsafe { allocator.release(a) };
        let b = allocator.allocate(size);
        assert_eq!(a, b, "{} bytes", size);
        unsafe {
            allocator.release(b);
            allocator.release(fence);
        }
    }

    let (validity, stats) = allocator.stats();
    assert!(validity.is_valid());
    assert_eq!(stats.used_chunks, 0);
}

#[test]
fn test_many_extents() {
    let allocator: Allocator<MmapPages> = Allocator::default();
    let page_size = allocator_page_size(&allocator);

    let mut ptrs: Vec<*mut u8> = Vec::new();
    while allocator.pages().pages() <= 10 {
        ptrs.push(allocator.allocate(8 + ptrs.len() % 300));
    }
    let (validity, stats) = allocator.stats();
    assert!(validity.is_valid());
    assert_eq!(stats.extents, 11);
    assert_eq!(stats.large_chunks, 0);

    // No allocation straddles a page boundary
    for &p in &ptrs {
        let usable = unsafe { allocator.usable_size(p) };
        let start = p as usize;
        assert_eq!(start / page_size, (start + usable - 1) / page_size);
    }

    // Release every other one, then the rest
    for &p in ptrs.iter().step_by(2) {
        unsafe { allocator.release(p) };
    }
    let (validity, stats) = allocator.stats();
    assert!(validity.is_valid());
    assert_eq!(stats.used_chunks, ptrs.len() / 2);

    for &p in ptrs.iter().skip(1).step_by(2) {
        unsafe { allocator.release(p) };
    }
    let (validity, stats) = allocator.stats();
    assert!(validity.is_valid());
    assert_eq!(validity.adjacents, 0);
    assert_eq!(stats.used_chunks, 0);
    assert_eq!(stats.accounted(), stats.mapped_bytes);
    // Fully merged: at most one free chunk per extent except the newest,
    // which went back into the wilderness.
    assert!(stats.free_chunks < stats.extents);
}
