//! In-memory journal area builder
//!
//! Produces a journal area byte-for-byte as the writer would leave it on
//! disk, for tests and offline tooling.

use super::format::{JournalRecord, SmallWriteEntry, StartEntry, JOURNAL_VERSION, START_ENTRY_SIZE};
use super::Journal;
use crate::layout::DiskLayout;
use tessera_common::Result;

/// Where an appended entry landed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryPosition {
    /// Journal-relative offset of the sector
    pub sector: u64,
    /// Offset of the entry inside the sector
    pub offset: usize,
    /// Encoded size
    pub size: usize,
    /// Journal offset of small-write data
    pub data_location: Option<u64>,
}

impl EntryPosition {
    /// Journal-relative offset of the entry
    #[must_use]
    pub const fn position(&self) -> u64 {
        self.sector + self.offset as u64
    }
}

/// Journal area under construction
#[derive(Debug)]
pub struct JournalImage {
    journal: Journal,
}

impl JournalImage {
    /// Empty journal whose first entry goes right after block 0
    #[must_use]
    pub fn new(layout: &DiskLayout) -> Self {
        Self::with_start(layout, u64::from(layout.journal_block_size))
    }

    /// Empty journal whose first entry goes at `journal_start`
    #[must_use]
    pub fn with_start(layout: &DiskLayout, journal_start: u64) -> Self {
        let mut journal = Journal::new(layout, true);
        journal.used_start = journal_start;
        journal.next_free = journal_start;

        let start = JournalRecord::Start(StartEntry {
            journal_start,
            version: JOURNAL_VERSION,
        });
        let mut block0 = [0u8; START_ENTRY_SIZE];
        start.encode(0, &mut block0);
        journal.mirror(0, &block0);
        Self { journal }
    }

    /// Append an entry
    pub fn push(&mut self, record: &JournalRecord) -> EntryPosition {
        self.journal.append(record);
        self.position(record.encoded_size(), None)
    }

    /// Append a small write followed by its data
    pub fn push_small_write(&mut self, entry: SmallWriteEntry, data: &[u8]) -> Result<EntryPosition> {
        let size = super::format::SMALL_WRITE_SIZE + entry.bitmap.len();
        let (_, location) = self.journal.append_small_write(entry, data)?;
        Ok(self.position(size, Some(location)))
    }

    fn position(&self, size: usize, data_location: Option<u64>) -> EntryPosition {
        EntryPosition {
            sector: self.journal.current_sector(),
            offset: self.journal.in_sector_pos() - size,
            size,
            data_location,
        }
    }

    /// Free cursor after the last entry
    #[must_use]
    pub const fn next_free(&self) -> u64 {
        self.journal.next_free
    }

    /// Checksum of the last entry
    #[must_use]
    pub const fn crc32_last(&self) -> u32 {
        self.journal.crc32_last
    }

    /// Area contents
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.journal.buffer().unwrap_or_default()
    }

    /// Area contents
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}
