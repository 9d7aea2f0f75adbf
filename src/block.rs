//! The fixed binary layout prefixed to every block of memory in a page.

use static_assertions::const_assert;

/// All block payloads are carved in multiples of this, and every payload
/// pointer handed out is aligned to it.
pub const ALIGN: usize = 8;

/// The smallest payload a block may have. A split that would leave a
/// remainder below this fails, and the caller uses the whole block instead.
pub const MIN_PAYLOAD: usize = 8;

/// The space reserved for a [`BlockHeader`] in front of every payload.
///
/// This matches two machine words on 64-bit targets and keeps payloads
/// aligned as long as pages start on an aligned address.
pub const HEADER_SIZE: usize = 16;

const_assert!(core::mem::size_of::<BlockHeader>() <= HEADER_SIZE);
const_assert!(HEADER_SIZE % ALIGN == 0);

/// The occupancy state of a block.
///
/// A block's payload is interpreted according to this tag: for
/// [`Status::FreePointer`] the first 8 payload bytes hold a jump pointer to a
/// free block later in the same page (the in-place free list); for every
/// other state the payload bytes are uninterpreted.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum Status {
    /// Not in use. Payload contents are leftover data.
    Free = 0,
    /// Not in use; the first 8 payload bytes are the payload offset of the
    /// next known free block in this page.
    FreePointer = 1,
    /// Not in use, and the last free block of its page. A sentinel written by
    /// defragmentation; eligible for allocation like any free block.
    FreeFinal = 2,
    /// In use. The payload belongs to the caller.
    Allocated = 3,
}

impl Status {
    /// True for every state except [`Status::Allocated`].
    pub fn is_free(self) -> bool {
        self != Status::Allocated
    }
}

/// The header preceding every block's payload.
///
/// `size` is the payload length in bytes, excluding the header itself. For
/// blocks carved by the allocator it is always a multiple of [`ALIGN`].
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct BlockHeader {
    pub size: usize,
    pub status: Status,
}

impl BlockHeader {
    pub fn new(size: usize, status: Status) -> Self {
        BlockHeader { size, status }
    }

    /// The whole footprint of the block: header plus payload.
    pub fn footprint(&self) -> usize {
        HEADER_SIZE + self.size
    }
}

/// Round `value` up to the nearest multiple of `increment`.
pub fn round_up(value: usize, increment: usize) -> usize {
    if value == 0 {
        return 0;
    }
    increment * ((value - 1) / increment + 1)
}
