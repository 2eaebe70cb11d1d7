//! This is a very minimal example to show using a PageSource directly.

use chunk_allocator::{BoundedPages, MmapPages, PageSource};

fn main() {
    // MmapPages uses libc to call mmap
    let pages = MmapPages::new();
    let page_size = pages.page_size();
    println!("Page size: {}", page_size);

    unsafe {
        let p = pages.map(2 * page_size).unwrap();
        println!("Returned: ({:p}={}, {})", p, p.as_ptr() as usize, 2 * page_size);
        pages.unmap(p, 2 * page_size).unwrap();
    }

    // BoundedPages refuses to go past its budget
    let bounded = BoundedPages::new(MmapPages::new(), page_size);
    unsafe {
        let p = bounded.map(page_size).unwrap();
        match bounded.map(page_size) {
            Ok(_) => println!("Unexpectedly mapped past the budget"),
            Err(errno) => println!("Second page refused: {}", errno),
        }
        bounded.unmap(p, page_size).unwrap();
    }
}
