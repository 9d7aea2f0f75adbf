//! A tour of the allocator: carve blocks out of OS pages, free and
//! defragment, then run a bump arena on top.
//!
//! Run with `cargo run --example walkthrough`.

use pagealloc::{Allocator, Arena, DumpConfig, MmapSource};

fn dump(label: &str, allocator: &Allocator<MmapSource>) {
    let mut out = String::new();
    allocator
        .dump(
            &mut out,
            DumpConfig {
                addresses: true,
                jumps: true,
            },
        )
        .unwrap();
    println!("{}:\n{}", label, out);
}

fn main() {
    env_logger::init();

    let mut allocator = Allocator::with_system_page_size(MmapSource::default());

    let small = allocator.allocate(24);
    let medium = allocator.allocate(100);
    let large = allocator.allocate(1000);
    dump("after three allocations", &allocator);

    unsafe {
        allocator.free(medium);
        allocator.free(large);
    }
    dump("after freeing two", &allocator);

    allocator.defragment();
    dump("after defragmenting", &allocator);

    let (validity, stats) = allocator.stats();
    println!("valid: {}, stats: {:?}\n", validity.is_valid(), stats);

    // Hand the allocator to an arena and bump-allocate out of one block.
    let mut arena = Arena::new(2048, allocator);
    while arena.alloc(96).is_some() {}
    println!("{}", arena);

    arena.reset();
    println!("after reset: {}", arena);

    let mut allocator = arena.free();
    dump("after releasing the arena", &allocator);

    unsafe { allocator.free(small) };
}
