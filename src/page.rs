//! Pages: contiguous raw spans formatted as a sequence of header-prefixed
//! blocks.
//!
//! All block addressing inside a page is done with byte offsets from the page
//! base, so every header read and write is bounds-checked against the page
//! size before any pointer arithmetic happens. The only raw pointers that
//! escape are payload pointers handed to the caller.
//!
//! A page starts life as one big free block. Allocation carves blocks off the
//! front of free blocks ([`Page::claim`]), freeing just flips a status tag,
//! and [`Page::defragment`] merges adjacent free blocks back together while
//! threading the jump-pointer list that lets later scans skip over allocated
//! stretches.

use core::fmt;
use core::ptr::NonNull;

use log::trace;

use crate::block::{round_up, BlockHeader, Status, ALIGN, HEADER_SIZE, MIN_PAYLOAD};

/// One contiguous memory span owned by the allocator, formatted as a block
/// sequence, with a link to the next page in the chain.
///
/// A `Page` does not release its span on drop; the allocator that acquired
/// the span returns it to its page source.
pub struct Page {
    base: NonNull<u8>,
    size: usize,
    pub(crate) next: Option<Box<Page>>,
}

/// What the allocation scan does after examining one block.
enum Step {
    /// Move to the block directly after the current one.
    Advance,
    /// Follow a jump pointer to the block at this header offset, skipping
    /// everything in between.
    Jump(usize),
    /// The block at this header offset satisfies the request.
    Claim(usize),
}

/// How a stored jump pointer relates to the page it lives in.
enum Jump {
    /// Points at a free block further along the page.
    Live(usize),
    /// Points at a block that has been reused since the pointer was written.
    /// Not corruption; the scan heals these by demoting the source to `Free`.
    Stale,
    /// Out of bounds, misaligned, or not strictly forward.
    Corrupt,
}

impl Page {
    /// Format `size` bytes at `base` as a page holding a single free block.
    ///
    /// # Safety
    ///
    /// `base` must point to `size` bytes of writable memory, aligned to
    /// [`ALIGN`], owned exclusively by this page for its whole lifetime.
    pub(crate) unsafe fn new(base: NonNull<u8>, size: usize) -> Page {
        assert!(
            size >= HEADER_SIZE + MIN_PAYLOAD,
            "page of {} bytes cannot hold a single block",
            size
        );
        debug_assert_eq!(base.as_ptr() as usize % ALIGN, 0);
        debug_assert_eq!(size % ALIGN, 0);

        let mut page = Page {
            base,
            size,
            next: None,
        };
        page.set_header(0, BlockHeader::new(size - HEADER_SIZE, Status::Free));
        page
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Whether `ptr` falls within this page's span.
    pub(crate) fn contains(&self, ptr: *const u8) -> bool {
        let base = self.base.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= base && addr < base + self.size
    }

    /// Pointer to the payload of the block whose header is at `offset`.
    pub(crate) fn payload_ptr(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset + HEADER_SIZE <= self.size);
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset + HEADER_SIZE)) }
    }

    fn header(&self, offset: usize) -> BlockHeader {
        debug_assert!(offset + HEADER_SIZE <= self.size);
        unsafe { core::ptr::read(self.base.as_ptr().add(offset) as *const BlockHeader) }
    }

    fn set_header(&mut self, offset: usize, header: BlockHeader) {
        debug_assert!(offset + HEADER_SIZE <= self.size);
        unsafe {
            core::ptr::write(self.base.as_ptr().add(offset) as *mut BlockHeader, header);
        }
    }

    fn set_status(&mut self, offset: usize, status: Status) {
        let mut header = self.header(offset);
        header.status = status;
        self.set_header(offset, header);
    }

    /// Read the jump pointer stored in the payload of the block at `offset`.
    /// Only meaningful while the block's status is `FreePointer`.
    fn read_jump(&self, offset: usize) -> usize {
        debug_assert!(offset + HEADER_SIZE + MIN_PAYLOAD <= self.size);
        unsafe { core::ptr::read(self.base.as_ptr().add(offset + HEADER_SIZE) as *const usize) }
    }

    /// Store a jump pointer in the payload of the block at `offset`. The
    /// value is the *payload* offset of the target block, matching what
    /// freeing code elsewhere expects to follow.
    fn write_jump(&mut self, offset: usize, target_payload: usize) {
        debug_assert!(offset + HEADER_SIZE + MIN_PAYLOAD <= self.size);
        debug_assert!(target_payload > offset + HEADER_SIZE);
        unsafe {
            core::ptr::write(
                self.base.as_ptr().add(offset + HEADER_SIZE) as *mut usize,
                target_payload,
            );
        }
    }

    /// Decode and classify the jump pointer of the block at `offset`.
    ///
    /// Jump pointers must land strictly forward of their source; that rule
    /// makes pointer cycles impossible, so the scan can follow them blindly.
    fn jump(&self, offset: usize) -> Jump {
        let target_payload = self.read_jump(offset);
        if target_payload < HEADER_SIZE {
            return Jump::Corrupt;
        }
        let target = target_payload - HEADER_SIZE;
        if target <= offset || target % ALIGN != 0 || target + HEADER_SIZE > self.size {
            return Jump::Corrupt;
        }
        let header = self.header(target);
        if target + header.footprint() > self.size {
            return Jump::Corrupt;
        }
        if header.status.is_free() {
            Jump::Live(target)
        } else {
            Jump::Stale
        }
    }

    /// Divide the free block at `offset` into a left block of exactly `want`
    /// payload bytes and a right remainder block.
    ///
    /// Fails, leaving the block untouched, if the block is allocated or the
    /// remainder payload would fall below [`MIN_PAYLOAD`]; the caller then
    /// uses the whole block and accepts the internal waste.
    ///
    /// The remainder inherits the original block's status. A `FreePointer`'s
    /// jump value is copied into the remainder — the remainder is now the
    /// live free region downstream pointers should reach — and the left block
    /// is demoted to plain `Free`.
    pub(crate) fn split(&mut self, offset: usize, want: usize) -> bool {
        debug_assert!(want >= MIN_PAYLOAD && want % ALIGN == 0);

        let header = self.header(offset);
        if !header.status.is_free() {
            return false;
        }
        if header.size < want + HEADER_SIZE + MIN_PAYLOAD {
            return false;
        }

        let remainder = header.size - want - HEADER_SIZE;
        let right = offset + HEADER_SIZE + want;
        self.set_header(right, BlockHeader::new(remainder, header.status));

        let left_status = if header.status == Status::FreePointer {
            self.write_jump(right, self.read_jump(offset));
            Status::Free
        } else {
            header.status
        };
        self.set_header(offset, BlockHeader::new(want, left_status));

        trace!(
            "split block at {} into {}+{} payload bytes",
            offset,
            want,
            remainder
        );
        true
    }

    /// Examine one block during the allocation scan and decide what to do
    /// next. `needed` is the full footprint the request requires.
    fn step(&mut self, offset: usize, header: BlockHeader, needed: usize) -> Step {
        match header.status {
            Status::Allocated => Step::Advance,
            Status::Free | Status::FreeFinal => {
                if header.footprint() >= needed {
                    Step::Claim(offset)
                } else {
                    Step::Advance
                }
            }
            Status::FreePointer => {
                // A big enough FreePointer block is taken like any free
                // block; its jump value is simply discarded.
                if header.footprint() >= needed {
                    return Step::Claim(offset);
                }
                match self.jump(offset) {
                    Jump::Live(target) => Step::Jump(target),
                    Jump::Stale | Jump::Corrupt => {
                        // The shortcut no longer points at free memory; heal
                        // it and resume the linear walk.
                        trace!("demoting stale jump pointer at offset {}", offset);
                        self.set_status(offset, Status::Free);
                        Step::Advance
                    }
                }
            }
        }
    }

    /// First-fit scan for a free block with a footprint of at least `needed`
    /// bytes. On success the block is split down to size where possible,
    /// marked allocated, and its header offset returned.
    pub(crate) fn claim(&mut self, needed: usize) -> Option<usize> {
        let mut offset = 0;
        while offset + HEADER_SIZE <= self.size {
            let header = self.header(offset);
            let end = offset + header.footprint();
            if end > self.size {
                // Formatting invariant violated; stop rather than walk off
                // the page.
                debug_assert!(false, "block at {} overruns its page", offset);
                break;
            }

            match self.step(offset, header, needed) {
                Step::Claim(found) => {
                    if header.footprint() > needed {
                        self.split(found, needed - HEADER_SIZE);
                    }
                    self.set_status(found, Status::Allocated);
                    return Some(found);
                }
                Step::Jump(target) => offset = target,
                Step::Advance => offset = end,
            }
        }
        None
    }

    /// Merge adjacent free blocks and rebuild the jump-pointer chain.
    ///
    /// Walks the page once in address order. Every free-class block becomes a
    /// merge seed: it absorbs the run of plain `Free` blocks directly after
    /// it (`FreePointer` and `Allocated` blocks stop the run), and receives a
    /// jump pointer from the previous free block found earlier in the page.
    /// The last free block is promoted to `FreeFinal`.
    pub(crate) fn defragment(&mut self) {
        let mut prev_free: Option<usize> = None;
        let mut offset = 0;

        while offset + HEADER_SIZE <= self.size {
            let header = self.header(offset);
            let mut end = offset + header.footprint();
            if end > self.size {
                debug_assert!(false, "block at {} overruns its page", offset);
                break;
            }

            if header.status.is_free() {
                if let Some(prev) = prev_free {
                    self.write_jump(prev, offset + HEADER_SIZE);
                    self.set_status(prev, Status::FreePointer);
                }

                let mut size = header.size;
                while end + HEADER_SIZE <= self.size {
                    let next = self.header(end);
                    if next.status != Status::Free || end + next.footprint() > self.size {
                        break;
                    }
                    size += next.footprint();
                    end += next.footprint();
                }
                if size != header.size {
                    trace!(
                        "coalesced {} bytes of free payload at offset {}",
                        size,
                        offset
                    );
                    self.set_header(offset, BlockHeader::new(size, header.status));
                }

                prev_free = Some(offset);
            }

            offset = end;
        }

        if let Some(last) = prev_free {
            self.set_status(last, Status::FreeFinal);
        }
    }

    /// Iterate over `(header_offset, header)` pairs in address order.
    pub fn blocks(&self) -> Blocks {
        Blocks {
            page: self,
            offset: 0,
        }
    }

    /// Accumulate structural checks and occupancy counters for this page.
    pub(crate) fn inspect(&self, validity: &mut Validity, stats: &mut Stats) {
        stats.pages += 1;

        let mut covered = 0;
        let mut prev_plain_free = false;
        let mut offset = 0;
        while offset + HEADER_SIZE <= self.size {
            let header = self.header(offset);
            let end = offset + header.footprint();
            if end > self.size {
                validity.oversized += 1;
                break;
            }

            stats.blocks += 1;
            if header.size % ALIGN != 0 {
                validity.misaligned += 1;
            }
            if header.status.is_free() {
                stats.free_blocks += 1;
                stats.free_bytes += header.size;
                if header.status == Status::FreePointer {
                    match self.jump(offset) {
                        Jump::Live(_) => {}
                        Jump::Stale => stats.stale_jumps += 1,
                        Jump::Corrupt => validity.bad_jumps += 1,
                    }
                }
            } else {
                stats.allocated_bytes += header.size;
            }

            if prev_plain_free && header.status == Status::Free {
                stats.adjacent_free += 1;
            }
            prev_plain_free = header.status == Status::Free;

            covered = end;
            offset = end;
        }

        if covered != self.size {
            validity.untiled += 1;
        }
    }

    /// Write a human-readable block listing, one line per block.
    pub fn dump<W: fmt::Write>(&self, w: &mut W, config: DumpConfig) -> fmt::Result {
        for (offset, header) in self.blocks() {
            write!(
                w,
                "\toffset: {:>6}, size: {:>6}, status: {:?}",
                offset, header.size, header.status
            )?;
            if config.jumps && header.status == Status::FreePointer {
                write!(w, " -> {}", self.read_jump(offset))?;
            }
            if config.addresses {
                write!(w, ", data: {:p}", self.payload_ptr(offset))?;
            }
            writeln!(w)?;
        }
        Ok(())
    }
}

pub struct Blocks<'page> {
    page: &'page Page,
    offset: usize,
}

impl<'page> Iterator for Blocks<'page> {
    type Item = (usize, BlockHeader);

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset + HEADER_SIZE > self.page.size {
            return None;
        }
        let header = self.page.header(self.offset);
        let offset = self.offset;
        if offset + header.footprint() > self.page.size {
            // Truncate iteration instead of reading past the span.
            return None;
        }
        self.offset = offset + header.footprint();
        Some((offset, header))
    }
}

impl fmt::Display for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Page({}, [", self.size)?;
        let mut start = true;
        for (offset, header) in self.blocks() {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            write!(f, "Block({}, {}, {:?})", offset, header.size, header.status)?;
        }
        write!(f, "])")
    }
}

/// Structural problems found while walking a page chain. All counters should
/// be zero at all times; any nonzero count indicates corruption.
#[derive(Default, Debug)]
pub struct Validity {
    /// Blocks whose footprint runs past the end of their page.
    pub oversized: usize,
    /// Blocks whose payload size is not a multiple of [`ALIGN`].
    pub misaligned: usize,
    /// Jump pointers that are out of bounds, misaligned, or not strictly
    /// forward. Stale pointers (target reused) are *not* counted here; those
    /// are a normal, self-healing condition tallied in [`Stats`].
    pub bad_jumps: usize,
    /// Pages whose block sequence does not cover the span exactly.
    pub untiled: usize,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        self.oversized == 0 && self.misaligned == 0 && self.bad_jumps == 0 && self.untiled == 0
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

/// Occupancy counters for a page chain.
#[derive(Default, Debug)]
pub struct Stats {
    pub pages: usize,
    pub blocks: usize,
    pub free_blocks: usize,
    /// Payload bytes held in free-class blocks.
    pub free_bytes: usize,
    /// Payload bytes held in allocated blocks.
    pub allocated_bytes: usize,
    /// Pairs of directly adjacent plain `Free` blocks. Normal between a
    /// `free` and the next `defragment`; zero right after a defragment pass.
    pub adjacent_free: usize,
    /// Jump pointers whose target has been reused since they were written.
    pub stale_jumps: usize,
}

/// Verbosity switches for the diagnostic dumps, passed explicitly per call.
#[derive(Copy, Clone, Debug)]
pub struct DumpConfig {
    /// Print raw payload addresses alongside offsets.
    pub addresses: bool,
    /// Print jump-pointer targets for `FreePointer` blocks.
    pub jumps: bool,
}

impl Default for DumpConfig {
    fn default() -> Self {
        DumpConfig {
            addresses: false,
            jumps: true,
        }
    }
}

/// Compute the full block footprint needed to satisfy a request for `size`
/// payload bytes: header added, then rounded up to the alignment boundary.
/// Zero-size requests are treated as the minimum payload.
pub(crate) fn adjusted_size(size: usize) -> usize {
    round_up(size.max(MIN_PAYLOAD) + HEADER_SIZE, ALIGN)
}
