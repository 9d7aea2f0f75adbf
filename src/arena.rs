//! A bump allocator carved from a single block.
//!
//! An [`Arena`] asks its backing [`Allocator`] for one block up front, then
//! hands out sub-ranges of it by bumping an offset: no header is written per
//! sub-allocation, nothing can be freed individually, and callers are
//! responsible for tracking the layout of what they put inside. In exchange,
//! allocation is a bounds check and an add, and the whole arena can be
//! recycled with [`reset`](Arena::reset) or given back with
//! [`free`](Arena::free) in O(1).

use core::fmt;
use core::ptr::NonNull;

use log::debug;

use crate::allocator::{Allocator, PageSource};
use crate::block::{round_up, ALIGN};
use crate::page::adjusted_size;

/// A bump allocator over a single block obtained from an [`Allocator`].
///
/// The arena owns its backing allocator; [`free`](Arena::free) hands it
/// back. Sub-allocations carry no alignment guarantee beyond the 8-byte
/// alignment of the arena's base.
pub struct Arena<S: PageSource> {
    allocator: Allocator<S>,
    base: NonNull<u8>,
    capacity: usize,
    used: usize,
}

impl<S: PageSource + Default> Arena<S> {
    /// Create an arena with a private allocator sized at 1.25× `capacity`
    /// (and no smaller than one backing block's footprint).
    pub fn with_capacity(capacity: usize) -> Self {
        let page_size = round_up(capacity + capacity / 4, ALIGN).max(adjusted_size(capacity));
        Arena::new(capacity, Allocator::new(S::default(), page_size))
    }
}

impl<S: PageSource> Arena<S> {
    /// Carve an arena of `capacity` bytes out of `allocator`, taking
    /// ownership of it.
    ///
    /// # Panics
    ///
    /// An arena's backing block never spans pages, so an allocator whose
    /// pages cannot hold `capacity` in a single allocation is a fatal
    /// configuration error, not a recoverable one.
    pub fn new(capacity: usize, mut allocator: Allocator<S>) -> Self {
        assert!(capacity > 0, "arena capacity must be nonzero");
        assert!(
            allocator.largest_page_size() >= adjusted_size(capacity),
            "arena capacity {} does not fit a single allocation in a {} byte page",
            capacity,
            allocator.largest_page_size(),
        );

        let base = allocator.allocate(capacity);
        debug!("arena carved: {} bytes at {:p}", capacity, base);
        Arena {
            allocator,
            base,
            capacity,
            used: 0,
        }
    }

    /// Hand out the next `size` bytes, or `None` if they would run past the
    /// arena's capacity. O(1); no header is written.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        let end = self.used.checked_add(size)?;
        if end > self.capacity {
            return None;
        }
        let ptr = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(self.used)) };
        self.used = end;
        Some(ptr)
    }

    /// Abandon every sub-allocation at once. O(1); the memory is not wiped,
    /// previously handed-out pointers just must not be reused.
    pub fn reset(&mut self) {
        self.used = 0;
    }

    /// Release the backing block and hand the backing allocator back to the
    /// caller, who becomes responsible for it.
    pub fn free(self) -> Allocator<S> {
        let Arena {
            mut allocator,
            base,
            capacity,
            ..
        } = self;
        debug!("arena released: {} bytes at {:p}", capacity, base);
        unsafe { allocator.free(base) };
        allocator
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.used
    }

    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub fn allocator(&self) -> &Allocator<S> {
        &self.allocator
    }
}

impl<S: PageSource> fmt::Display for Arena<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Arena(capacity: {}, used: {}, remaining: {}, base: {:p})",
            self.capacity,
            self.used,
            self.remaining(),
            self.base,
        )
    }
}
