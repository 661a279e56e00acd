//! Circular journal
//!
//! Journal block 0 holds a single START entry pointing at the oldest live
//! entry. The rest of the area is a ring of sectors (journal blocks) that
//! hold packed entries, with small-write data placed between them at the
//! running free cursor. Entries never cross a sector boundary.

pub mod format;
mod image;

pub use format::{
    BigWriteEntry, DecodedEntry, EntryError, EntryType, JournalRecord, SmallWriteEntry,
    StartEntry, JOURNAL_MAGIC, JOURNAL_VERSION, OBJ_VER_ENTRY_SIZE,
};
pub use image::{EntryPosition, JournalImage};

use crate::layout::DiskLayout;
use crate::raw_io::AlignedBuffer;
use std::collections::BTreeMap;
use tessera_common::checksum::crc32c;
use tessera_common::{Error, Result};

/// A filled sector ready to be written
#[derive(Debug)]
pub struct SectorWrite {
    /// Journal-relative offset of the sector
    pub sector: u64,
    /// Absolute device offset
    pub device_offset: u64,
    /// Sector contents
    pub buf: AlignedBuffer,
}

/// Runtime state of the journal area
#[derive(Debug)]
pub struct Journal {
    /// Device offset of the area
    pub offset: u64,
    /// Length of the area
    pub len: u64,
    /// Sector size
    pub block_size: u64,
    /// Oldest live position
    pub used_start: u64,
    /// Free cursor: where the next sector or data goes
    pub next_free: u64,
    /// First position not yet handed to the flusher
    pub dirty_start: u64,
    /// Checksum of the newest entry
    pub crc32_last: u32,
    /// Live dirty entries per sector
    pub used_sectors: BTreeMap<u64, u64>,
    /// Sector writes submitted but not yet completed, per sector
    sector_writes: BTreeMap<u64, u32>,
    cur_sector: u64,
    sector_buf: Vec<u8>,
    in_sector_pos: usize,
    sector_dirty: bool,
    buffer: Option<Vec<u8>>,
}

impl Journal {
    /// Create an empty journal for a layout
    ///
    /// With `inmemory` a copy of the whole area is kept in memory.
    #[must_use]
    pub fn new(layout: &DiskLayout, inmemory: bool) -> Self {
        let block_size = u64::from(layout.journal_block_size);
        Self {
            offset: layout.journal_offset,
            len: layout.journal_len,
            block_size,
            used_start: block_size,
            next_free: block_size,
            dirty_start: block_size,
            crc32_last: 0,
            used_sectors: BTreeMap::new(),
            sector_writes: BTreeMap::new(),
            cur_sector: 0,
            sector_buf: vec![0u8; block_size as usize],
            in_sector_pos: block_size as usize,
            sector_dirty: false,
            buffer: inmemory.then(|| vec![0u8; layout.journal_len as usize]),
        }
    }

    /// Cursor after starting a sector at `pos`
    #[must_use]
    pub const fn advance_sector(&self, pos: u64) -> u64 {
        let next = pos + self.block_size;
        if next >= self.len { self.block_size } else { next }
    }

    /// Place `len` bytes of small-write data at `cursor`
    ///
    /// Returns the data location and the cursor after it.
    #[must_use]
    pub const fn place_data(&self, cursor: u64, len: u64) -> (u64, u64) {
        let location = if cursor + len > self.len {
            self.block_size
        } else {
            cursor
        };
        let mut next = location + len;
        if next >= self.len {
            next = self.block_size;
        }
        (location, next)
    }

    /// Free bytes between the free cursor and the oldest live position
    #[must_use]
    pub const fn free_space(&self) -> u64 {
        if self.next_free >= self.used_start {
            self.len - self.block_size - (self.next_free - self.used_start)
        } else {
            self.used_start - self.next_free
        }
    }

    /// Whether an entry of `size` bytes fits into the current sector
    #[must_use]
    pub const fn entry_fits(&self, size: usize) -> bool {
        self.block_size as usize - self.in_sector_pos >= size
    }

    /// Number of sector writes needed to append `entries` entries of
    /// `entry_size` bytes followed by `data_after` bytes of data
    ///
    /// Returns `None` when the journal does not have the room.
    #[must_use]
    pub fn check_available(&self, entries: usize, entry_size: usize, data_after: u64) -> Option<usize> {
        let bs = self.block_size as usize;
        let per_sector = bs / entry_size;
        if per_sector == 0 {
            return None;
        }
        let mut remaining = entries;
        let mut sectors = 0;
        let fits_now = (bs - self.in_sector_pos.min(bs)) / entry_size;
        if fits_now > 0 && remaining > 0 {
            sectors = 1;
            remaining = remaining.saturating_sub(fits_now);
        }
        let mut new_sectors = 0u64;
        while remaining > 0 {
            new_sectors += 1;
            sectors += 1;
            remaining = remaining.saturating_sub(per_sector);
        }
        let needed = new_sectors * self.block_size + data_after;
        if needed > 0 && needed + self.block_size > self.free_space() {
            return None;
        }
        Some(sectors)
    }

    /// Journal-relative offset of the current sector
    #[must_use]
    pub const fn current_sector(&self) -> u64 {
        self.cur_sector
    }

    /// Bytes used in the current sector
    #[must_use]
    pub const fn in_sector_pos(&self) -> usize {
        self.in_sector_pos
    }

    /// Whether the current sector holds entries not yet taken for writing
    #[must_use]
    pub const fn has_dirty_sector(&self) -> bool {
        self.sector_dirty
    }

    /// Force the next entry into a fresh sector
    pub fn reset_sector(&mut self) {
        self.in_sector_pos = self.block_size as usize;
        self.sector_dirty = false;
    }

    /// Append one entry, chaining it to the previous one
    ///
    /// When the entry starts a new sector and the current one still has
    /// unwritten entries, the write for the current sector is returned.
    pub fn append(&mut self, record: &JournalRecord) -> Option<SectorWrite> {
        let closed = self.reserve(record.encoded_size());
        self.fill(record);
        closed
    }

    /// Append a small write and place its data
    ///
    /// The entry's data offset and checksum are filled in. Returns the write
    /// of a closed sector, if any, and the journal offset the data must be
    /// written to.
    pub fn append_small_write(
        &mut self,
        mut entry: SmallWriteEntry,
        data: &[u8],
    ) -> Result<(Option<SectorWrite>, u64)> {
        let len = data.len() as u64;
        if len == 0 || len % self.block_size != 0 {
            return Err(Error::storage(format!(
                "small write data of {len} bytes is not a multiple of the journal block size {}",
                self.block_size
            )));
        }
        let record_size = format::SMALL_WRITE_SIZE + entry.bitmap.len();
        let closed = self.reserve(record_size);
        let (location, next) = self.place_data(self.next_free, len);
        self.next_free = next;

        entry.len = len as u32;
        entry.data_offset = location;
        entry.crc32_data = crc32c(data);
        self.fill(&JournalRecord::SmallWrite(entry));
        self.mirror(location, data);
        Ok((closed, location))
    }

    /// Take the current sector for writing
    pub fn take_sector_write(&mut self) -> SectorWrite {
        self.sector_dirty = false;
        SectorWrite {
            sector: self.cur_sector,
            device_offset: self.offset + self.cur_sector,
            buf: AlignedBuffer::from_slice(&self.sector_buf),
        }
    }

    /// Record a submitted write of `sector`
    pub fn start_sector_write(&mut self, sector: u64) {
        *self.sector_writes.entry(sector).or_default() += 1;
    }

    /// Record a completed write of `sector`
    pub fn finish_sector_write(&mut self, sector: u64) {
        if let Some(count) = self.sector_writes.get_mut(&sector) {
            *count -= 1;
            if *count == 0 {
                self.sector_writes.remove(&sector);
            }
        }
    }

    /// Whether the next entry would rewrite a sector whose previous write
    /// has not completed
    ///
    /// Sectors are written whole, so a sector must not be written again
    /// before its previous write completes.
    #[must_use]
    pub fn current_sector_busy(&self, entry_size: usize) -> bool {
        self.entry_fits(entry_size) && self.sector_writes.contains_key(&self.cur_sector)
    }

    /// In-memory copy of the area
    #[must_use]
    pub fn buffer(&self) -> Option<&[u8]> {
        self.buffer.as_deref()
    }

    /// Copy `bytes` into the in-memory area at `pos`, if there is one
    pub fn mirror(&mut self, pos: u64, bytes: &[u8]) {
        if let Some(buffer) = self.buffer.as_mut() {
            let start = pos as usize;
            buffer[start..start + bytes.len()].copy_from_slice(bytes);
        }
    }

    fn reserve(&mut self, size: usize) -> Option<SectorWrite> {
        if self.entry_fits(size) {
            return None;
        }
        let closed = self.sector_dirty.then(|| self.take_sector_write());
        self.cur_sector = self.next_free;
        self.next_free = self.advance_sector(self.next_free);
        self.sector_buf.fill(0);
        self.in_sector_pos = 0;
        closed
    }

    fn fill(&mut self, record: &JournalRecord) {
        let size = record.encoded_size();
        let pos = self.in_sector_pos;
        let crc = record.encode(self.crc32_last, &mut self.sector_buf[pos..pos + size]);
        self.crc32_last = crc;
        self.in_sector_pos += size;
        self.sector_dirty = true;
        let at = self.cur_sector + pos as u64;
        if let Some(buffer) = self.buffer.as_mut() {
            let start = at as usize;
            buffer[start..start + size].copy_from_slice(&self.sector_buf[pos..pos + size]);
        }
    }
}
