//! Journal recovery
//!
//! Replays the journal on top of the clean index built by metadata recovery:
//! 1. read block 0; a blank journal is initialized, otherwise its START
//!    entry gives the position of the oldest live entry
//! 2. read the journal from there in large buffers, wrapping after the end,
//!    while walking it sector by sector and applying every valid entry
//! 3. stop at the first sector that does not start with a valid entry, or at
//!    a small write whose data is torn; a torn sector is zeroed on disk
//! 4. check deferred double allocations, write the metadata slots of
//!    versions that became clean during replay, and publish the cursors
//!
//! The checksum chain links every entry to the previous one; an entry whose
//! `crc32_prev` does not match ends its sector.

use crate::index::{DirtyEntry, EntryBitmap, EntryKind, EntryState, Workflow, UNRESOLVED_LOCATION};
use crate::io::{check_sync, check_transfer, IoOwner, IoQueue};
use crate::journal::format::{START_ENTRY_SIZE, StartEntry};
use crate::journal::{BigWriteEntry, JournalRecord, SmallWriteEntry, JOURNAL_VERSION};
use crate::layout::CleanDiskEntry;
use crate::raw_io::AlignedBuffer;
use crate::ring::{DeviceKind, IoCompletion, IoRequest, Ring};
use crate::store::{BlockstoreState, MetaUpdate};
use std::collections::VecDeque;
use tessera_common::checksum::is_zero;
use tessera_common::{DataCrc, Error, ObjVerId, Result};
use tracing::{debug, info, warn};

/// Request tags of journal recovery
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JournalIo {
    /// Block 0 read, journal initialization or torn sector write
    Block,
    /// Journal scan buffer
    Read,
    /// Metadata slot update read or write
    Compaction,
    /// Journal or metadata fsync
    Fsync,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Step {
    Begin,
    ReadStart,
    InitWrite,
    InitFsync,
    Scan,
    TornWrite,
    TornFsync,
    Drain,
    Finish,
    CompactRead,
    CompactWrite,
    CompactFsync,
    Done,
}

/// Outcome of processing the oldest completed buffer
enum Part {
    /// The journal ends here
    End,
    /// The buffer was fully processed
    Consumed,
    /// An entry needs data from a buffer not read yet
    NeedMore,
}

#[derive(Debug)]
struct DoneBuf {
    buf: AlignedBuffer,
    pos: u64,
    len: u64,
}

/// Journal recovery state machine
#[derive(Debug)]
pub struct InitJournal {
    step: Step,
    waiting: usize,
    block: Option<AlignedBuffer>,
    read_in_flight: bool,
    read_len: usize,
    journal_pos: u64,
    wrapped: bool,
    done: VecDeque<DoneBuf>,
    next_free: u64,
    continue_pos: Option<u64>,
    started: bool,
    crc32_last: u32,
    entries_loaded: u64,
    double_allocs: Vec<ObjVerId>,
    torn: Option<(u64, AlignedBuffer)>,
    compact: Vec<(u64, Vec<(u64, MetaUpdate)>)>,
    compact_pos: usize,
}

impl InitJournal {
    /// Prepare recovery for a store
    #[must_use]
    pub fn new(st: &BlockstoreState) -> Self {
        Self {
            step: Step::Begin,
            waiting: 0,
            block: None,
            read_in_flight: false,
            read_len: 0,
            journal_pos: 0,
            wrapped: false,
            done: VecDeque::new(),
            next_free: st.journal.block_size,
            continue_pos: None,
            started: false,
            crc32_last: 0,
            entries_loaded: 0,
            double_allocs: Vec::new(),
            torn: None,
            compact: Vec::new(),
            compact_pos: 0,
        }
    }

    /// Record the completion of one of our requests
    pub fn handle_completion(
        &mut self,
        tag: JournalIo,
        completion: IoCompletion,
        st: &mut BlockstoreState,
    ) -> Result<()> {
        match tag {
            JournalIo::Read => {
                let offset = st.journal.offset + self.journal_pos;
                check_transfer("read journal", offset, self.read_len, completion.result)?;
                let Some(buf) = completion.buf else {
                    return Err(Error::internal("journal read completed without a buffer"));
                };
                st.journal.mirror(self.journal_pos, buf.as_slice());
                self.done.push_back(DoneBuf {
                    buf,
                    pos: self.journal_pos,
                    len: self.read_len as u64,
                });
                self.journal_pos += self.read_len as u64;
                if self.journal_pos >= st.journal.len {
                    // Continue from the beginning
                    self.journal_pos = st.journal.block_size;
                    self.wrapped = true;
                }
                self.read_in_flight = false;
            }
            JournalIo::Block | JournalIo::Compaction => {
                let len = completion.buf.as_ref().map_or(0, AlignedBuffer::len);
                check_transfer("journal recovery I/O", st.journal.offset, len, completion.result)?;
                self.block = completion.buf;
                self.waiting -= 1;
            }
            JournalIo::Fsync => {
                check_sync("fsync during journal recovery", completion.result)?;
                self.waiting -= 1;
            }
        }
        Ok(())
    }

    /// Run until the next suspension point
    ///
    /// Returns `true` once recovery is complete.
    pub fn advance<R: Ring>(&mut self, st: &mut BlockstoreState, io: &mut IoQueue<R>) -> Result<bool> {
        loop {
            if self.waiting > 0 {
                return Ok(false);
            }
            match self.step {
                Step::Begin => {
                    info!("Reading blockstore journal");
                    self.submit(io, JournalIo::Block, IoRequest::Read {
                        device: DeviceKind::Journal,
                        offset: st.journal.offset,
                        buf: AlignedBuffer::new(st.journal.block_size as usize),
                    })?;
                    self.step = Step::ReadStart;
                }
                Step::ReadStart => {
                    let block = self.take_block()?;
                    if is_zero(block.as_slice()) {
                        self.init_journal(st, io)?;
                    } else {
                        self.read_start(st, block.as_slice())?;
                        self.step = Step::Scan;
                    }
                }
                Step::InitWrite => {
                    self.block = None;
                    if st.config.disable_journal_fsync {
                        self.step = Step::Finish;
                    } else {
                        self.submit(io, JournalIo::Fsync, IoRequest::Fsync {
                            device: DeviceKind::Journal,
                        })?;
                        self.step = Step::InitFsync;
                    }
                }
                Step::InitFsync => self.step = Step::Finish,
                Step::Scan => {
                    if !self.scan(st, io)? {
                        return Ok(false);
                    }
                }
                Step::TornWrite => {
                    self.block = None;
                    if st.config.disable_journal_fsync {
                        self.step = Step::Drain;
                    } else {
                        self.submit(io, JournalIo::Fsync, IoRequest::Fsync {
                            device: DeviceKind::Journal,
                        })?;
                        self.step = Step::TornFsync;
                    }
                }
                Step::TornFsync => self.step = Step::Drain,
                Step::Drain => {
                    // Wait for the outstanding read, then drop what was read
                    if self.read_in_flight {
                        return Ok(false);
                    }
                    self.done.clear();
                    self.step = Step::Finish;
                }
                Step::Finish => self.finish_scan(st, io)?,
                Step::CompactRead => {
                    let mut block = self.take_block()?;
                    self.patch_meta_block(st, block.as_mut_slice());
                    self.write_compact_block(st, io, block)?;
                }
                Step::CompactWrite => {
                    self.block = None;
                    self.compact_pos += 1;
                    self.next_compaction(st, io)?;
                }
                Step::CompactFsync => self.publish(st),
                Step::Done => return Ok(true),
            }
        }
    }

    fn take_block(&mut self) -> Result<AlignedBuffer> {
        self.block
            .take()
            .ok_or_else(|| Error::internal("journal block I/O completed without a buffer"))
    }

    fn submit<R: Ring>(&mut self, io: &mut IoQueue<R>, tag: JournalIo, request: IoRequest) -> Result<()> {
        io.push_or_fail(IoOwner::Journal(tag), request, "recovering the journal")?;
        self.waiting += 1;
        Ok(())
    }

    fn init_journal<R: Ring>(&mut self, st: &mut BlockstoreState, io: &mut IoQueue<R>) -> Result<()> {
        let bs = st.journal.block_size;
        st.journal.used_start = bs;
        st.journal.next_free = bs;
        self.next_free = bs;

        let mut buf = AlignedBuffer::new(2 * bs as usize);
        JournalRecord::Start(StartEntry {
            journal_start: bs,
            version: JOURNAL_VERSION,
        })
        .encode(0, &mut buf.as_mut_slice()[..START_ENTRY_SIZE]);
        st.journal.mirror(0, buf.as_slice());

        if st.config.readonly {
            warn!("Skipping journal initialization because blockstore is readonly");
            self.step = Step::Finish;
        } else {
            info!("Resetting journal");
            self.submit(io, JournalIo::Block, IoRequest::Write {
                device: DeviceKind::Journal,
                offset: st.journal.offset,
                buf,
            })?;
            self.step = Step::InitWrite;
        }
        Ok(())
    }

    fn read_start(&mut self, st: &mut BlockstoreState, block: &[u8]) -> Result<()> {
        let start = StartEntry::parse(block)?;
        let bs = st.journal.block_size;
        if start.journal_start % bs != 0
            || start.journal_start < bs
            || start.journal_start >= st.journal.len
        {
            return Err(Error::corrupt_journal(format!(
                "START entry points outside the journal (journal_start={:#x})",
                start.journal_start
            )));
        }
        st.journal.mirror(0, block);
        st.journal.used_start = start.journal_start;
        st.journal.next_free = start.journal_start;
        self.next_free = start.journal_start;
        self.journal_pos = start.journal_start;
        self.crc32_last = 0;
        Ok(())
    }

    /// Returns `true` once the scan is over and the next step is set
    fn scan<R: Ring>(&mut self, st: &mut BlockstoreState, io: &mut IoQueue<R>) -> Result<bool> {
        if self.read_in_flight {
            return Ok(false);
        }
        let more = !self.wrapped || self.journal_pos < st.journal.used_start;
        if more {
            let end = if self.journal_pos < st.journal.used_start {
                st.journal.used_start
            } else {
                st.journal.len
            };
            self.read_len = (end - self.journal_pos).min(st.config.journal_buffer_size) as usize;
            io.push_or_fail(
                IoOwner::Journal(JournalIo::Read),
                IoRequest::Read {
                    device: DeviceKind::Journal,
                    offset: st.journal.offset + self.journal_pos,
                    buf: AlignedBuffer::new(self.read_len),
                },
                "reading the journal",
            )?;
            self.read_in_flight = true;
        }

        while !self.done.is_empty() {
            match self.handle_part(st, !more)? {
                Part::End => {
                    self.step = match self.torn.take() {
                        Some((sector, buf)) if !st.config.readonly => {
                            self.submit(io, JournalIo::Block, IoRequest::Write {
                                device: DeviceKind::Journal,
                                offset: st.journal.offset + sector,
                                buf,
                            })?;
                            Step::TornWrite
                        }
                        _ => Step::Drain,
                    };
                    return Ok(true);
                }
                Part::Consumed => {
                    self.done.pop_front();
                }
                Part::NeedMore => break,
            }
        }

        if !more {
            self.done.clear();
            self.step = Step::Finish;
            return Ok(true);
        }
        Ok(false)
    }

    /// Walk the sectors of the oldest completed buffer
    fn handle_part(&mut self, st: &mut BlockstoreState, last_read: bool) -> Result<Part> {
        let bs = st.journal.block_size;
        let bitmap_size = st.layout.clean_entry_bitmap_size;
        let (done_pos, done_len) = (self.done[0].pos, self.done[0].len);
        let mut resume = self.continue_pos.take();

        loop {
            let (proc_pos, mut pos) = match resume.take() {
                Some(at) => (at / bs * bs, (at % bs) as usize),
                None => {
                    if self.next_free < done_pos || self.next_free >= done_pos + done_len {
                        break;
                    }
                    let sector = self.next_free;
                    self.next_free = st.journal.advance_sector(self.next_free);
                    (sector, 0)
                }
            };
            let sector_start = (proc_pos - done_pos) as usize;
            let sector_end = sector_start + bs as usize;

            while pos < bs as usize {
                let raw = &self.done[0].buf.as_slice()[sector_start + pos..sector_end];
                let entry = match JournalRecord::decode(raw, bitmap_size) {
                    Ok(entry) if !self.started || entry.crc32_prev == self.crc32_last => entry,
                    other => {
                        if pos == 0 {
                            // Invalid entry at a sector start: the journal ends here
                            debug!("Journal ends at {:#x} ({:?})", proc_pos, other.err());
                            st.journal.next_free = proc_pos;
                            return Ok(Part::End);
                        }
                        // Partially filled sector
                        break;
                    }
                };

                match entry.record {
                    JournalRecord::SmallWrite(sw) => {
                        let prev_free = self.next_free;
                        if u64::from(sw.len) % bs != 0 {
                            return Err(Error::internal(format!(
                                "small write {} has length {} not aligned to the journal block size",
                                sw.ov, sw.len
                            )));
                        }
                        let (location, next) = st.journal.place_data(self.next_free, u64::from(sw.len));
                        self.next_free = next;
                        if location != sw.data_offset {
                            return Err(Error::internal(format!(
                                "calculated journal data offset ({location:#010x}) != stored journal data offset ({:#010x})",
                                sw.data_offset
                            )));
                        }
                        let crc = self.data_crc(location, u64::from(sw.len));
                        if crc.covered() < u64::from(sw.len) && !last_read {
                            self.continue_pos = Some(proc_pos + pos as u64);
                            self.next_free = prev_free;
                            return Ok(Part::NeedMore);
                        }
                        if crc.covered() < u64::from(sw.len) || crc.value() != sw.crc32_data {
                            warn!(
                                "Journal entry data is corrupt (data crc32 {:x} != {:x})",
                                crc.value(),
                                sw.crc32_data
                            );
                            self.tear_sector(st, proc_pos, pos, prev_free);
                            return Ok(Part::End);
                        }
                        replay_small_write(st, sw, location, proc_pos);
                    }
                    JournalRecord::BigWrite(bw) => {
                        if let Some(ov) = replay_big_write(st, bw, proc_pos)? {
                            self.double_allocs.push(ov);
                        }
                    }
                    JournalRecord::Stable(ov) => {
                        debug!("Replay stable {}", ov);
                        st.mark_stable(ov, true);
                    }
                    JournalRecord::Rollback(ov) => {
                        debug!("Replay rollback {}", ov);
                        st.mark_rolled_back(ov);
                    }
                    JournalRecord::Delete(ov) => replay_delete(st, ov, proc_pos),
                    JournalRecord::Start(_) => {}
                }
                self.started = true;
                pos += entry.size;
                self.crc32_last = entry.crc32;
                self.entries_loaded += 1;
            }
        }
        st.journal.next_free = self.next_free;
        Ok(Part::Consumed)
    }

    /// Checksum the part of `[location, location + len)` present in the
    /// completed buffers
    fn data_crc(&self, location: u64, len: u64) -> DataCrc {
        let mut crc = DataCrc::new();
        let end = location + len;
        for part in &self.done {
            let part_end = part.pos + part.len;
            if end > part.pos && location < part_end {
                let from = location.max(part.pos);
                let to = end.min(part_end);
                crc.update(&part.buf.as_slice()[(from - part.pos) as usize..(to - part.pos) as usize]);
            }
        }
        crc
    }

    /// Zero the rest of a sector holding a torn small write
    fn tear_sector(&mut self, st: &mut BlockstoreState, proc_pos: u64, pos: usize, prev_free: u64) {
        let bs = st.journal.block_size as usize;
        let sector_start = (proc_pos - self.done[0].pos) as usize;
        let data = self.done[0].buf.as_mut_slice();
        data[sector_start + pos..sector_start + bs].fill(0);
        let sector = AlignedBuffer::from_slice(&data[sector_start..sector_start + bs]);
        st.journal.mirror(proc_pos, sector.as_slice());
        st.journal.next_free = if pos == 0 { proc_pos } else { prev_free };
        info!("Journal torn at {:#x}, zeroing the rest of the sector", proc_pos + pos as u64);
        self.torn = Some((proc_pos, sector));
    }

    fn finish_scan<R: Ring>(&mut self, st: &mut BlockstoreState, io: &mut IoQueue<R>) -> Result<()> {
        for ov in &self.double_allocs {
            if st
                .dirty_db
                .get(ov)
                .is_some_and(|e| e.state.is_big_write() && e.location == UNRESOLVED_LOCATION)
            {
                return Err(Error::internal(format!(
                    "{ov} big_write journal entry was allocated over another object"
                )));
            }
        }

        // Group the queued slot changes by metadata block
        let per_block = st.layout.entries_per_block;
        let mut groups: Vec<(u64, Vec<(u64, MetaUpdate)>)> = Vec::new();
        for (slot, update) in std::mem::take(&mut st.pending_meta) {
            let table_block = slot / per_block;
            match groups.last_mut() {
                Some((block, slots)) if *block == table_block => slots.push((slot, update)),
                _ => groups.push((table_block, vec![(slot, update)])),
            }
        }
        self.compact = groups;
        self.compact_pos = 0;
        if !self.compact.is_empty() {
            debug!("Compacting {} metadata blocks after replay", self.compact.len());
        }
        self.next_compaction(st, io)
    }

    fn next_compaction<R: Ring>(&mut self, st: &mut BlockstoreState, io: &mut IoQueue<R>) -> Result<()> {
        while self.compact_pos < self.compact.len() {
            let table_block = self.compact[self.compact_pos].0;
            if st.config.inmemory_metadata || st.config.readonly {
                let mut block = AlignedBuffer::new(st.layout.meta_block_size as usize);
                if let Some(table) = st.metadata_buffer.as_ref() {
                    let len = block.len();
                    let start = (table_block * u64::from(st.layout.meta_block_size)) as usize;
                    block.as_mut_slice().copy_from_slice(&table[start..start + len]);
                }
                self.patch_meta_block(st, block.as_mut_slice());
                if st.config.readonly {
                    self.compact_pos += 1;
                    continue;
                }
                return self.write_compact_block(st, io, block);
            }
            self.submit(io, JournalIo::Compaction, IoRequest::Read {
                device: DeviceKind::Meta,
                offset: st.layout.meta_block_offset(table_block),
                buf: AlignedBuffer::new(st.layout.meta_block_size as usize),
            })?;
            self.step = Step::CompactRead;
            return Ok(());
        }

        if self.compact.is_empty() || st.config.readonly || st.config.disable_meta_fsync {
            self.publish(st);
        } else {
            self.submit(io, JournalIo::Fsync, IoRequest::Fsync {
                device: DeviceKind::Meta,
            })?;
            self.step = Step::CompactFsync;
        }
        Ok(())
    }

    /// Apply the current group of slot changes to one metadata block
    fn patch_meta_block(&self, st: &mut BlockstoreState, block: &mut [u8]) {
        let layout = &st.layout;
        let entry_size = layout.clean_entry_size;
        let bitmaps = 2 * layout.clean_entry_bitmap_size;
        let table_block = self.compact[self.compact_pos].0;
        for (slot, update) in &self.compact[self.compact_pos].1 {
            let pos = (slot % layout.entries_per_block) as usize * entry_size;
            let raw = &mut block[pos..pos + entry_size];
            match update {
                MetaUpdate::Write {
                    oid,
                    version,
                    bitmap,
                    ext_bitmap,
                } => CleanDiskEntry {
                    oid: *oid,
                    version: *version,
                }
                .encode(raw, bitmap, ext_bitmap),
                MetaUpdate::Zero => raw.fill(0),
            }
            if let Some(table) = st.metadata_buffer.as_mut() {
                let at = layout.slot_position(*slot);
                table[at..at + entry_size].copy_from_slice(raw);
            } else if bitmaps > 0 {
                let at = *slot as usize * bitmaps;
                st.clean_bitmaps[at..at + bitmaps]
                    .copy_from_slice(&raw[crate::layout::CLEAN_ENTRY_HEADER_SIZE..]);
            }
        }
        debug!("Patched metadata block {}", table_block);
    }

    fn write_compact_block<R: Ring>(
        &mut self,
        st: &BlockstoreState,
        io: &mut IoQueue<R>,
        block: AlignedBuffer,
    ) -> Result<()> {
        let table_block = self.compact[self.compact_pos].0;
        self.submit(io, JournalIo::Compaction, IoRequest::Write {
            device: DeviceKind::Meta,
            offset: st.layout.meta_block_offset(table_block),
            buf: block,
        })?;
        self.step = Step::CompactWrite;
        Ok(())
    }

    fn publish(&mut self, st: &mut BlockstoreState) {
        st.flusher.mark_trim_possible();
        st.journal.dirty_start = st.journal.next_free;
        st.journal.crc32_last = self.crc32_last;
        st.journal.reset_sector();
        st.journal_entries_loaded = self.entries_loaded;
        info!(
            "Journal entries loaded: {}, free journal space: {} bytes ({:08x}..{:08x} is used), free blocks: {} / {}",
            self.entries_loaded,
            st.journal.free_space(),
            st.journal.used_start,
            st.journal.next_free,
            st.alloc.get_free_count(),
            st.layout.block_count
        );
        self.step = Step::Done;
    }
}

fn replay_small_write(st: &mut BlockstoreState, sw: SmallWriteEntry, location: u64, sector: u64) {
    debug!(
        "Replay small write{} {} offset={} len={}",
        if sw.instant { " (instant)" } else { "" },
        sw.ov,
        sw.offset,
        sw.len
    );
    let newer = st
        .clean_db
        .find(&sw.ov.oid)
        .is_none_or(|c| c.version < sw.ov.version);
    if !newer {
        return;
    }
    let inserted = st.dirty_db.emplace(
        sw.ov,
        DirtyEntry {
            state: EntryState::new(EntryKind::SmallWrite, Workflow::Synced),
            location,
            offset: sw.offset,
            len: sw.len,
            journal_sector: sector,
            bitmap: EntryBitmap::from_slice(&sw.bitmap),
        },
    );
    if inserted {
        *st.journal.used_sectors.entry(sector).or_default() += 1;
    }
    let unstable = st.unstable_writes.entry(sw.ov.oid).or_default();
    *unstable = (*unstable).max(sw.ov.version);
    if sw.instant {
        st.mark_stable(sw.ov, true);
    }
}

/// Returns the version when its block was already allocated
fn replay_big_write(st: &mut BlockstoreState, bw: BigWriteEntry, sector: u64) -> Result<Option<ObjVerId>> {
    let block = bw.location >> st.layout.block_order;
    debug!(
        "Replay big write{} {} block={}",
        if bw.instant { " (instant)" } else { "" },
        bw.ov,
        block
    );
    if bw.location % u64::from(st.layout.data_block_size) != 0 || block >= st.layout.block_count {
        return Err(Error::internal(format!(
            "big write {} points outside the data area (location {:#x})",
            bw.ov, bw.location
        )));
    }

    // A big write may follow a delete of an equal or newer version: the
    // delete is already applied, so the older history is forgotten
    if let Some((last, entry)) = st.dirty_db.latest(bw.ov.oid)
        && last.version >= bw.ov.version
        && entry.state.is_delete()
    {
        st.erase_dirty_object(last);
    }

    let newer = st
        .clean_db
        .find(&bw.ov.oid)
        .is_none_or(|c| c.version < bw.ov.version);
    if !newer || st.dirty_db.contains(&bw.ov) {
        return Ok(None);
    }

    let mut double_alloc = None;
    let location = if st.alloc.get(block) {
        // Probably already flushed and freed; rechecked after the scan
        double_alloc = Some(bw.ov);
        UNRESOLVED_LOCATION
    } else {
        debug!("Allocate block (journal) {}: {}", block, bw.ov);
        st.alloc.set(block, true);
        block
    };
    st.dirty_db.emplace(
        bw.ov,
        DirtyEntry {
            state: EntryState::new(EntryKind::BigWrite, Workflow::Synced),
            location,
            offset: bw.offset,
            len: bw.len,
            journal_sector: sector,
            bitmap: EntryBitmap::from_slice(&bw.bitmap),
        },
    );
    *st.journal.used_sectors.entry(sector).or_default() += 1;
    let unstable = st.unstable_writes.entry(bw.ov.oid).or_default();
    *unstable = (*unstable).max(bw.ov.version);
    if bw.instant {
        st.mark_stable(bw.ov, true);
    }
    Ok(double_alloc)
}

fn replay_delete(st: &mut BlockstoreState, ov: ObjVerId, sector: u64) {
    debug!("Replay delete {}", ov);
    let last_dirty = st.dirty_db.latest(ov.oid).map(|(key, _)| key);
    let clean_exists = st
        .clean_db
        .find(&ov.oid)
        .is_some_and(|c| c.version < ov.version);
    if !clean_exists {
        // No clean version: the delete was already flushed, so the dirty
        // history must not be flushed anymore
        if let Some(last) = last_dirty {
            st.erase_dirty_object(last);
        }
        return;
    }
    let inserted = st.dirty_db.emplace(
        ov,
        DirtyEntry {
            state: EntryState::new(EntryKind::Delete, Workflow::Synced),
            location: 0,
            offset: 0,
            len: 0,
            journal_sector: sector,
            bitmap: EntryBitmap::default(),
        },
    );
    if inserted {
        *st.journal.used_sectors.entry(sector).or_default() += 1;
    }
    // Deletes are stable as soon as they are durable
    st.mark_stable(ov, true);
}
