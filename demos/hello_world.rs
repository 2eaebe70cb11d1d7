use chunk_allocator::UnixAllocator;

#[global_allocator]
static A: UnixAllocator = UnixAllocator::new();

fn main() {
    let greeting = String::from("Hello, World!");
    println!("{}", greeting);

    let (validity, stats) = A.stats();
    assert!(validity.is_valid());
    println!("{}", stats);
}
