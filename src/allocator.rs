//! The allocator engine and its page sources.
//!
//! ## Basic Types
//!
//! ### [`PageSource`](trait.PageSource.html)
//!
//! `PageSource` is a simple trait interface meant to abstract over the calls
//! to the OS (or whatever else backs the allocator) to obtain raw contiguous
//! spans of memory and hand them back on teardown.
//!
//! ### [`MmapSource`](struct.MmapSource.html)
//!
//! An `MmapSource` supplies pages of virtual memory via `mmap`, rounded to
//! the system page size, and returns them with `munmap`.
//!
//! ### [`FixedHeap`](struct.FixedHeap.html)
//!
//! `FixedHeap` is a fixed-size in-memory buffer that can pretend to be a page
//! supply. It is mainly useful for testing.
//!
//! ### [`Allocator`](struct.Allocator.html)
//!
//! An `Allocator` owns a chain of [`Page`]s carved into blocks. It is
//! single-threaded by design: allocate is a first-fit scan with jump-pointer
//! shortcuts, free is an O(1) status flip, and all coalescing cost is
//! deferred to an explicit [`defragment`](struct.Allocator.html#method.defragment)
//! pass.

use core::fmt;
use core::ptr::NonNull;

use errno::Errno;
use log::debug;

use crate::block::{round_up, BlockHeader, Status, ALIGN, HEADER_SIZE, MIN_PAYLOAD};
use crate::page::{adjusted_size, DumpConfig, Page, Stats, Validity};

/// The backing memory supply for an [`Allocator`].
///
/// The contract is deliberately small: "give me at least N contiguous bytes"
/// and "take back these N bytes". Returned spans must be aligned to
/// [`ALIGN`], and the reported actual size must be a multiple of [`ALIGN`]
/// no smaller than the request.
pub trait PageSource {
    type Err: fmt::Debug;

    /// Obtain at least `size` contiguous bytes. Returns the span's base
    /// pointer and its actual size.
    ///
    /// # Safety
    ///
    /// On success the returned span must be writable, unused by any other
    /// live code, and must remain valid until passed back to
    /// [`release`](PageSource::release).
    unsafe fn acquire(&mut self, size: usize) -> Result<(NonNull<u8>, usize), Self::Err>;

    /// Return a span previously handed out by
    /// [`acquire`](PageSource::acquire).
    ///
    /// # Safety
    ///
    /// `ptr` and `size` must be exactly what `acquire` returned, and no
    /// pointers into the span may be used afterwards.
    unsafe fn release(&mut self, ptr: NonNull<u8>, size: usize);
}

/// `MmapSource` uses virtual memory to supply pages on request.
#[derive(Default)]
pub struct MmapSource {
    // Just for tracking, not really needed
    pages: usize,
    growths: usize,
}

/// An `mmap` failure, as reported by errno.
#[derive(Debug)]
pub struct MmapError(pub Errno);

impl PageSource for MmapSource {
    type Err = MmapError;

    unsafe fn acquire(&mut self, size: usize) -> Result<(NonNull<u8>, usize), MmapError> {
        let pagesize = sysconf::page::pagesize();
        let to_allocate = round_up(size.max(1), pagesize);

        let ptr = libc::mmap(
            // Address we want the memory at. We don't care, so null it is.
            core::ptr::null_mut(),
            // Amount of memory to allocate
            to_allocate,
            // We want read/write access to this memory
            libc::PROT_WRITE | libc::PROT_READ,
            // MAP_ANON: We don't want a file descriptor, we're just going to
            //   use the memory.
            //
            // MAP_PRIVATE: We're not sharing this with any other process.
            libc::MAP_ANON | libc::MAP_PRIVATE,
            // No file descriptor backs an anonymous mapping.
            -1,
            0,
        );

        if ptr == libc::MAP_FAILED || ptr.is_null() {
            return Err(MmapError(errno::errno()));
        }

        self.pages += to_allocate / pagesize;
        self.growths += 1;

        Ok((NonNull::new_unchecked(ptr as *mut u8), to_allocate))
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>, size: usize) {
        libc::munmap(ptr.as_ptr() as *mut libc::c_void, size);
    }
}

/// A fixed-size buffer that can pretend to be a page supply, for testing.
///
/// The buffer is boxed (and `u64`-backed, keeping it 8-aligned) so the
/// spans it hands out stay put when the owning allocator moves.
pub struct FixedHeap {
    heap: Box<[u64]>,
    /// Bytes handed out so far.
    pub size: usize,
    /// Spans are rounded up to a multiple of this.
    pub granularity: usize,
}

impl Default for FixedHeap {
    fn default() -> Self {
        FixedHeap {
            heap: vec![0u64; 32 * 1024].into_boxed_slice(),
            size: 0,
            granularity: ALIGN,
        }
    }
}

/// The fixed heap has run out of room.
#[derive(Debug)]
pub struct FixedHeapOverflow();

impl PageSource for FixedHeap {
    type Err = FixedHeapOverflow;

    unsafe fn acquire(&mut self, size: usize) -> Result<(NonNull<u8>, usize), FixedHeapOverflow> {
        let allocating = round_up(size, self.granularity);
        if self.size + allocating > self.heap.len() * 8 {
            return Err(FixedHeapOverflow());
        }

        let ptr = (self.heap.as_mut_ptr() as *mut u8).add(self.size);
        self.size += allocating;
        Ok((NonNull::new_unchecked(ptr), allocating))
    }

    unsafe fn release(&mut self, _ptr: NonNull<u8>, _size: usize) {
        // Individual spans are never handed back; the buffer is reclaimed
        // when the heap itself drops.
    }
}

/// A page-chain allocator: first-fit allocation with in-place free-list
/// shortcuts, O(1) free, and explicit defragmentation.
///
/// Not thread-safe; external synchronization is required to share one across
/// threads.
pub struct Allocator<S: PageSource> {
    source: S,
    head: Page,
}

impl<S: PageSource> Allocator<S> {
    /// Create an allocator whose first page holds `page_size` bytes
    /// (8-aligned, and at least one block's worth). Later pages double in
    /// size as needed.
    pub fn new(mut source: S, page_size: usize) -> Self {
        let size = round_up(page_size.max(HEADER_SIZE + MIN_PAYLOAD), ALIGN);
        let head = unsafe { Self::acquire_page(&mut source, size) };
        Allocator { source, head }
    }

    /// Create an allocator whose first page is one system page.
    pub fn with_system_page_size(source: S) -> Self {
        Self::new(source, sysconf::page::pagesize())
    }

    unsafe fn acquire_page(source: &mut S, size: usize) -> Page {
        match source.acquire(size) {
            Ok((base, actual)) => {
                debug!("acquired a {} byte page", actual);
                Page::new(base, actual)
            }
            // Exhaustion of the backing memory source is fatal; there is no
            // recovery path above this one.
            Err(err) => panic!("page source failed to supply {} bytes: {:?}", size, err),
        }
    }

    /// Allocate a block with at least `size` payload bytes and return its
    /// payload pointer, 8-byte aligned.
    ///
    /// Scans each page in chain order; when no page satisfies the request, a
    /// new page is appended (the last page's size doubled until the adjusted
    /// request fits) and the request is satisfied from it. Panics only if
    /// the page source itself is exhausted.
    pub fn allocate(&mut self, size: usize) -> NonNull<u8> {
        let needed = adjusted_size(size);
        debug!("allocating {} bytes ({} byte block)", size, needed);

        // The chain is walked with a raw cursor: the loop both mutates the
        // page it inspects (stale-pointer demotion) and must end holding the
        // last page to append a grown one.
        unsafe {
            let mut page: *mut Page = &mut self.head;
            loop {
                if let Some(offset) = (*page).claim(needed) {
                    return (*page).payload_ptr(offset);
                }
                match (*page).next {
                    Some(ref mut next) => page = &mut **next,
                    None => break,
                }
            }

            // No page can satisfy the request; grow. The new page alone is
            // retried, not the whole chain.
            let last = &mut *page;
            let mut new_size = last.size();
            while new_size < needed {
                new_size *= 2;
            }
            let new_size = round_up(new_size, ALIGN);
            debug!("growing: appending a {} byte page", new_size);

            let mut new_page = Box::new(Self::acquire_page(&mut self.source, new_size));
            let offset = new_page
                .claim(needed)
                .expect("a fresh page satisfies the request it was grown for");
            let ptr = new_page.payload_ptr(offset);
            last.next = Some(new_page);
            ptr
        }
    }

    /// Mark the block holding `ptr` free, in O(1).
    ///
    /// No coalescing or clearing happens here; reclaimed space only becomes
    /// part of a larger block at the next [`defragment`](Allocator::defragment).
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate`](Allocator::allocate) on
    /// this allocator and not freed since.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        debug_assert!(self.owns(ptr.as_ptr()), "freeing a foreign pointer");
        let header = ptr.as_ptr().sub(HEADER_SIZE) as *mut BlockHeader;
        debug_assert_eq!((*header).status, Status::Allocated);
        (*header).status = Status::Free;
    }

    /// Coalesce adjacent free blocks and rebuild the jump-pointer chains,
    /// one pass over every page. Merges never cross a page boundary.
    pub fn defragment(&mut self) {
        debug!("defragmenting the page chain");
        let mut page = Some(&mut self.head);
        while let Some(p) = page {
            p.defragment();
            page = p.next.as_deref_mut();
        }
    }

    /// Iterate over the pages in chain order.
    pub fn pages(&self) -> PageIter {
        PageIter {
            next: Some(&self.head),
        }
    }

    pub fn page_count(&self) -> usize {
        self.pages().count()
    }

    /// The largest span any single allocation could ever occupy without
    /// growing the chain. Pages only ever grow, so this is the last page.
    pub(crate) fn largest_page_size(&self) -> usize {
        self.pages().map(Page::size).max().unwrap_or(0)
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Get statistics on this allocator, and verify validity of every page.
    pub fn stats(&self) -> (Validity, Stats) {
        let mut validity = Validity::default();
        let mut stats = Stats::default();
        for page in self.pages() {
            page.inspect(&mut validity, &mut stats);
        }
        (validity, stats)
    }

    fn owns(&self, ptr: *const u8) -> bool {
        self.pages().any(|page| page.contains(ptr))
    }

    /// Write a human-readable dump of every page's block list.
    pub fn dump<W: fmt::Write>(&self, w: &mut W, config: DumpConfig) -> fmt::Result {
        for (index, page) in self.pages().enumerate() {
            writeln!(w, "page {}: {} bytes", index, page.size())?;
            page.dump(w, config)?;
        }
        Ok(())
    }
}

impl<S: PageSource> Drop for Allocator<S> {
    fn drop(&mut self) {
        unsafe {
            self.source.release(self.head.base(), self.head.size());
            // Unlink iteratively so a long chain cannot recurse on drop.
            let mut next = self.head.next.take();
            while let Some(mut page) = next {
                self.source.release(page.base(), page.size());
                next = page.next.take();
            }
        }
    }
}

pub struct PageIter<'alloc> {
    next: Option<&'alloc Page>,
}

impl<'alloc> Iterator for PageIter<'alloc> {
    type Item = &'alloc Page;

    fn next(&mut self) -> Option<Self::Item> {
        let page = self.next.take()?;
        self.next = page.next.as_deref();
        Some(page)
    }
}

impl<S: PageSource> fmt::Display for Allocator<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Allocator(")?;
        let mut start = true;
        for page in self.pages() {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            write!(f, "{}", page)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn test_basic() {
        let mut allocator = Allocator::new(FixedHeap::default(), 256);

        const BLOCKS: usize = 3;
        let sizes: [usize; BLOCKS] = [24, 24, 64];

        let mut pointers = [core::ptr::NonNull::<u8>::dangling(); BLOCKS];
        for (i, &size) in sizes.iter().enumerate() {
            pointers[i] = allocator.allocate(size);
            assert_eq!(pointers[i].as_ptr() as usize % ALIGN, 0);
            let (validity, _stats) = allocator.stats();
            assert!(validity.is_valid());
        }

        // Blocks are carved front to back: each next payload sits one
        // header past the previous payload's end.
        for i in 0..BLOCKS - 1 {
            let expected = unsafe { pointers[i].as_ptr().add(sizes[i] + HEADER_SIZE) };
            assert_eq!(expected, pointers[i + 1].as_ptr());
        }

        // One page was acquired, exactly page-sized.
        assert_eq!(allocator.page_count(), 1);
        assert_eq!(allocator.source().size, 256);

        let (_validity, stats) = allocator.stats();
        assert_eq!(stats.blocks, BLOCKS + 1);
        assert_eq!(stats.allocated_bytes, 24 + 24 + 64);
        assert_eq!(stats.free_bytes, 256 - stats.allocated_bytes - 4 * HEADER_SIZE);

        ////////////////////////////////////////////////////////////
        // Free the middle pointer, then allocate something that fits in
        // its block: first-fit hands the same address back.
        unsafe { allocator.free(pointers[1]) };
        let (validity, stats) = allocator.stats();
        assert!(validity.is_valid());
        assert_eq!(stats.free_blocks, 2);
        log::info!("after free: {}", allocator);

        let reused = allocator.allocate(16);
        assert_eq!(reused, pointers[1]);
        log::info!("after reuse: {}", allocator);
    }

    #[test]
    fn test_split_leaves_free_remainder_in_page() {
        // A 64-byte page holds a single 48-byte-payload free block. A
        // 24-byte request splits it into a 24-byte payload and an 8-byte
        // payload remainder that stays free, still within the page.
        let mut allocator = Allocator::new(FixedHeap::default(), 64);
        let ptr = allocator.allocate(24);
        assert_eq!(ptr.as_ptr() as usize % ALIGN, 0);

        let (validity, stats) = allocator.stats();
        assert!(validity.is_valid());
        assert_eq!(stats.pages, 1);
        assert_eq!(stats.blocks, 2);
        assert_eq!(stats.allocated_bytes, 24);
        assert_eq!(stats.free_bytes, 8);
    }

    #[test]
    fn test_middle_block_reuse_after_defragment() {
        // Three 8-byte blocks tile a 72-byte page exactly. Free the middle
        // one, defragment, allocate 8 bytes: the only adequate free region
        // is the middle block, so its address comes back.
        let mut allocator = Allocator::new(FixedHeap::default(), 72);

        let a = allocator.allocate(8);
        let b = allocator.allocate(8);
        let c = allocator.allocate(8);
        assert_eq!(unsafe { a.as_ptr().add(24) }, b.as_ptr());
        assert_eq!(unsafe { b.as_ptr().add(24) }, c.as_ptr());

        unsafe { allocator.free(b) };
        allocator.defragment();

        let reused = allocator.allocate(8);
        assert_eq!(reused, b);
        assert_eq!(allocator.page_count(), 1);
    }

    #[test]
    fn test_growth_doubles_pages() {
        let mut allocator = Allocator::new(FixedHeap::default(), 64);

        // 128 payload bytes need a 144-byte block; 64 doubles to 256.
        let ptr = allocator.allocate(128);
        assert_eq!(ptr.as_ptr() as usize % ALIGN, 0);

        let sizes: Vec<usize> = allocator.pages().map(Page::size).collect();
        assert_eq!(sizes, vec![64, 256]);

        let (validity, stats) = allocator.stats();
        assert!(validity.is_valid());
        assert_eq!(stats.pages, 2);
        assert_eq!(stats.allocated_bytes, 128);

        // The head page is still whole; small requests keep landing there.
        let small = allocator.allocate(8);
        assert!(allocator.pages().next().unwrap().contains(small.as_ptr()));
        assert_eq!(allocator.page_count(), 2);
    }

    #[test]
    fn test_stale_pointer_heals() {
        let mut allocator = Allocator::new(FixedHeap::default(), 128);

        let a = allocator.allocate(8);
        let _b = allocator.allocate(48);
        let c = allocator.allocate(8);

        unsafe {
            allocator.free(a);
            allocator.free(c);
        }
        // Defragmentation threads a jump pointer from a's block to c's.
        allocator.defragment();
        let (_validity, stats) = allocator.stats();
        assert_eq!(stats.stale_jumps, 0);

        // Reusing c's block makes that pointer stale.
        let reused = allocator.allocate(16);
        assert_eq!(reused, c);
        let (validity, stats) = allocator.stats();
        assert!(validity.is_valid());
        assert_eq!(stats.stale_jumps, 1);

        // The next scan follows the stale pointer, demotes it, and ends up
        // growing the chain; the shortcut is gone afterwards.
        let elsewhere = allocator.allocate(16);
        assert!(!allocator.pages().next().unwrap().contains(elsewhere.as_ptr()));
        let (validity, stats) = allocator.stats();
        assert!(validity.is_valid());
        assert_eq!(stats.stale_jumps, 0);
        // The demoted block in the head page plus the new page's remainder.
        assert_eq!(stats.free_blocks, 2);
        assert_eq!(allocator.page_count(), 2);
    }

    #[test]
    fn test_zero_size_allocation() {
        let mut allocator = Allocator::new(FixedHeap::default(), 64);
        let ptr = allocator.allocate(0);
        assert_eq!(ptr.as_ptr() as usize % ALIGN, 0);

        let (validity, stats) = allocator.stats();
        assert!(validity.is_valid());
        // Zero-size requests still get the minimum payload.
        assert_eq!(stats.allocated_bytes, MIN_PAYLOAD);
    }

    #[test]
    fn test_mmap_source_roundtrip() {
        let mut allocator = Allocator::with_system_page_size(MmapSource::default());

        let ptr = allocator.allocate(1024);
        unsafe {
            core::ptr::write_bytes(ptr.as_ptr(), 0xa5, 1024);
            assert_eq!(*ptr.as_ptr().add(1023), 0xa5);
            allocator.free(ptr);
        }

        let (validity, _stats) = allocator.stats();
        assert!(validity.is_valid());
        // Dropping returns the pages to the OS.
        drop(allocator);
    }

    #[test]
    fn test_dump() {
        let mut allocator = Allocator::new(FixedHeap::default(), 128);
        let ptr = allocator.allocate(24);
        unsafe { allocator.free(ptr) };
        allocator.defragment();

        let mut out = String::new();
        allocator
            .dump(&mut out, DumpConfig::default())
            .expect("dump never fails on a String");
        assert!(out.contains("page 0: 128 bytes"));
        assert!(out.contains("FreeFinal"));

        let mut with_addresses = String::new();
        allocator
            .dump(
                &mut with_addresses,
                DumpConfig {
                    addresses: true,
                    jumps: true,
                },
            )
            .expect("dump never fails on a String");
        assert!(with_addresses.contains("data: 0x"));
    }
}
