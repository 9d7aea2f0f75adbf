//! A page-based memory allocator with embedded free lists and a bump arena.
//!
//! The [`Allocator`] acquires raw pages from a [`PageSource`], formats each
//! one as a sequence of header-prefixed blocks, and chains pages together as
//! they fill up. Allocation is a first-fit scan that splits oversized free
//! blocks down to size; freeing is an O(1) status flip with no coalescing.
//! An explicit [`defragment`](Allocator::defragment) pass merges adjacent
//! free blocks and threads a jump-pointer list through the freed payloads
//! themselves, so that later scans can leap over allocated stretches. The
//! free list costs no memory of its own.
//!
//! On top of the engine, an [`Arena`] carves one block into header-less bump
//! allocations with bulk reset and release.
//!
//! The whole crate is single-threaded by design: no locking exists, and
//! sharing an allocator across threads requires external synchronization.

pub mod allocator;
pub mod arena;
pub mod block;
pub mod page;

pub use crate::allocator::{Allocator, FixedHeap, MmapSource, PageSource};
pub use crate::arena::Arena;
pub use crate::block::{BlockHeader, Status, ALIGN, HEADER_SIZE, MIN_PAYLOAD};
pub use crate::page::{DumpConfig, Page, Stats, Validity};
