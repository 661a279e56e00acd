//! Data block allocation
//!
//! The blockstore only needs three things from an allocator: mark a block,
//! ask whether a block is marked, and count the free ones. [`BlockBitmap`]
//! is the bundled implementation; the write path may bring its own.

/// Free-block tracker consumed by recovery and stabilization
pub trait Allocator {
    /// Mark a block as allocated (`true`) or free (`false`)
    fn set(&mut self, block: u64, allocated: bool);

    /// Whether a block is allocated
    fn get(&self, block: u64) -> bool;

    /// Number of free blocks
    fn get_free_count(&self) -> u64;
}

/// Bitmap for tracking block allocation
///
/// Uses one bit per block: 0 = free, 1 = used
#[derive(Clone, Debug)]
pub struct BlockBitmap {
    /// Bitmap data
    data: Vec<u8>,
    /// Total number of blocks
    total_blocks: u64,
    /// Number of free blocks (cached)
    free_blocks: u64,
}

impl BlockBitmap {
    /// Create a new bitmap for the given number of blocks (all free)
    #[must_use]
    pub fn new(total_blocks: u64) -> Self {
        let bytes_needed = total_blocks.div_ceil(8) as usize;
        Self {
            data: vec![0u8; bytes_needed],
            total_blocks,
            free_blocks: total_blocks,
        }
    }

    /// Check if a bit is set in a byte slice
    fn is_set_in_slice(data: &[u8], block: u64) -> bool {
        let byte_idx = (block / 8) as usize;
        let bit_idx = (block % 8) as u8;
        data[byte_idx] & (1 << bit_idx) != 0
    }
}

impl Allocator for BlockBitmap {
    fn set(&mut self, block: u64, allocated: bool) {
        if block >= self.total_blocks {
            return;
        }
        let byte_idx = (block / 8) as usize;
        let mask = 1u8 << (block % 8);
        let was_set = self.data[byte_idx] & mask != 0;
        if allocated && !was_set {
            self.data[byte_idx] |= mask;
            self.free_blocks -= 1;
        } else if !allocated && was_set {
            self.data[byte_idx] &= !mask;
            self.free_blocks += 1;
        }
    }

    fn get(&self, block: u64) -> bool {
        if block >= self.total_blocks {
            return true; // Out of range blocks are considered allocated
        }
        Self::is_set_in_slice(&self.data, block)
    }

    fn get_free_count(&self) -> u64 {
        self.free_blocks
    }
}
