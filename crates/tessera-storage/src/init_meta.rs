//! Metadata recovery
//!
//! Loads the clean index and the allocator from the metadata area:
//! 1. read the superblock, initializing it when the area is blank
//! 2. scan the slot table with two buffers in flight, installing the newest
//!    slot of every object and zeroing superseded and stale slots
//! 3. zero superseded slots that were already written back
//! 4. fsync a freshly initialized area
//!
//! Each step suspends on I/O; [`InitMeta::advance`] resumes where it left.

use crate::io::{check_sync, check_transfer, IoOwner, IoQueue};
use crate::index::CleanEntry;
use crate::layout::{CleanDiskEntry, MetaSuperblock};
use crate::raw_io::AlignedBuffer;
use crate::ring::{DeviceKind, IoCompletion, IoRequest, Ring};
use crate::store::BlockstoreState;
use tessera_common::checksum::is_zero;
use tessera_common::{Error, Result};
use tracing::{debug, info, warn};

/// Request tags of metadata recovery
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetaIo {
    /// Superblock read or write
    Superblock,
    /// Slot table buffer
    Buffer(usize),
    /// Deferred zeroing read or write
    ZeroBlock,
    /// Final fsync
    Fsync,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Step {
    Begin,
    ReadSuperblock,
    InitSuperblock,
    Scan,
    ZeroRead,
    ZeroWrite,
    Fsync,
    Done,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BufState {
    Empty,
    Loading,
    Loaded,
    Writing,
}

#[derive(Debug)]
struct ScanBuf {
    state: BufState,
    /// Offset inside the slot table
    offset: u64,
    len: usize,
    data: Option<AlignedBuffer>,
}

impl ScanBuf {
    const fn empty() -> Self {
        Self {
            state: BufState::Empty,
            offset: 0,
            len: 0,
            data: None,
        }
    }
}

/// Metadata recovery state machine
#[derive(Debug)]
pub struct InitMeta {
    step: Step,
    waiting: usize,
    block: Option<AlignedBuffer>,
    zero_on_init: bool,
    bufs: [ScanBuf; 2],
    table_len: u64,
    next_offset: u64,
    next_process: u64,
    entries_to_zero: Vec<u64>,
    zero_pos: usize,
    zero_end: usize,
    entries_loaded: u64,
}

impl InitMeta {
    /// Prepare recovery for a store
    #[must_use]
    pub fn new(st: &BlockstoreState) -> Self {
        Self {
            step: Step::Begin,
            waiting: 0,
            block: None,
            zero_on_init: false,
            bufs: [ScanBuf::empty(), ScanBuf::empty()],
            table_len: st.layout.meta_len - u64::from(st.layout.meta_block_size),
            next_offset: 0,
            next_process: 0,
            entries_to_zero: Vec::new(),
            zero_pos: 0,
            zero_end: 0,
            entries_loaded: 0,
        }
    }

    /// Whether the area was blank and got initialized
    #[must_use]
    pub const fn zero_on_init(&self) -> bool {
        self.zero_on_init
    }

    /// Record the completion of one of our requests
    pub fn handle_completion(
        &mut self,
        tag: MetaIo,
        completion: IoCompletion,
        st: &mut BlockstoreState,
    ) -> Result<()> {
        match tag {
            MetaIo::Buffer(i) => {
                let buf = &mut self.bufs[i];
                let device_offset =
                    st.layout.meta_offset + u64::from(st.layout.meta_block_size) + buf.offset;
                match buf.state {
                    BufState::Loading => {
                        let op = if self.zero_on_init {
                            "write metadata"
                        } else {
                            "read metadata"
                        };
                        check_transfer(op, device_offset, buf.len, completion.result)?;
                        if let (Some(table), Some(data)) =
                            (st.metadata_buffer.as_mut(), completion.buf.as_ref())
                        {
                            let start = buf.offset as usize;
                            table[start..start + buf.len].copy_from_slice(data.as_slice());
                        }
                        buf.data = completion.buf;
                        buf.state = BufState::Loaded;
                    }
                    BufState::Writing => {
                        check_transfer("write metadata", device_offset, buf.len, completion.result)?;
                        buf.data = None;
                        buf.state = BufState::Empty;
                    }
                    BufState::Empty | BufState::Loaded => {
                        warn!("Unexpected completion for metadata buffer {}", i);
                    }
                }
            }
            MetaIo::Superblock | MetaIo::ZeroBlock => {
                let len = completion.buf.as_ref().map_or(0, AlignedBuffer::len);
                check_transfer("metadata block I/O", st.layout.meta_offset, len, completion.result)?;
                self.block = completion.buf;
                self.waiting -= 1;
            }
            MetaIo::Fsync => {
                check_sync("fsync metadata", completion.result)?;
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
                    info!("Reading blockstore metadata");
                    let len = st.layout.meta_block_size as usize;
                    self.submit_block(io, IoRequest::Read {
                        device: DeviceKind::Meta,
                        offset: st.layout.meta_offset,
                        buf: AlignedBuffer::new(len),
                    })?;
                    self.step = Step::ReadSuperblock;
                }
                Step::ReadSuperblock => {
                    let block = self.take_block()?;
                    if is_zero(block.as_slice()) {
                        let sb = st.layout.superblock();
                        if st.config.readonly {
                            warn!("Skipping metadata initialization because blockstore is readonly");
                            self.start_scan();
                        } else {
                            info!("Initializing metadata area");
                            let bytes = sb.to_bytes(st.layout.meta_block_size as usize);
                            self.submit_block(io, IoRequest::Write {
                                device: DeviceKind::Meta,
                                offset: st.layout.meta_offset,
                                buf: AlignedBuffer::from_slice(&bytes),
                            })?;
                            self.step = Step::InitSuperblock;
                        }
                    } else {
                        MetaSuperblock::from_bytes(block.as_slice())?.check(&st.layout)?;
                        self.start_scan();
                    }
                }
                Step::InitSuperblock => {
                    self.block = None;
                    self.zero_on_init = true;
                    self.start_scan();
                }
                Step::Scan => {
                    if !self.scan(st, io)? {
                        return Ok(false);
                    }
                    self.entries_to_zero.sort_unstable();
                    self.entries_to_zero.dedup();
                    if !self.entries_to_zero.is_empty()
                        && !st.config.inmemory_metadata
                        && !st.config.readonly
                    {
                        self.zero_pos = 0;
                        self.read_zero_group(st, io)?;
                    } else {
                        self.entries_to_zero.clear();
                        self.finish(st, io)?;
                    }
                }
                Step::ZeroRead => {
                    let mut block = self.take_block()?;
                    let entry_size = st.layout.clean_entry_size;
                    let per_block = st.layout.entries_per_block;
                    for &slot in &self.entries_to_zero[self.zero_pos..self.zero_end] {
                        let pos = (slot % per_block) as usize * entry_size;
                        block.as_mut_slice()[pos..pos + entry_size].fill(0);
                    }
                    let table_block = self.entries_to_zero[self.zero_pos] / per_block;
                    self.submit_zero_block(io, IoRequest::Write {
                        device: DeviceKind::Meta,
                        offset: st.layout.meta_block_offset(table_block),
                        buf: block,
                    })?;
                    self.step = Step::ZeroWrite;
                }
                Step::ZeroWrite => {
                    self.block = None;
                    self.zero_pos = self.zero_end;
                    if self.zero_pos < self.entries_to_zero.len() {
                        self.read_zero_group(st, io)?;
                    } else {
                        self.entries_to_zero.clear();
                        self.finish(st, io)?;
                    }
                }
                Step::Fsync => {
                    self.step = Step::Done;
                }
                Step::Done => return Ok(true),
            }
        }
    }

    fn take_block(&mut self) -> Result<AlignedBuffer> {
        self.block
            .take()
            .ok_or_else(|| Error::internal("metadata block I/O completed without a buffer"))
    }

    fn submit_block<R: Ring>(&mut self, io: &mut IoQueue<R>, request: IoRequest) -> Result<()> {
        io.push_or_fail(IoOwner::Meta(MetaIo::Superblock), request, "reading metadata")?;
        self.waiting += 1;
        Ok(())
    }

    fn submit_zero_block<R: Ring>(&mut self, io: &mut IoQueue<R>, request: IoRequest) -> Result<()> {
        io.push_or_fail(IoOwner::Meta(MetaIo::ZeroBlock), request, "zeroing metadata")?;
        self.waiting += 1;
        Ok(())
    }

    fn start_scan(&mut self) {
        self.next_offset = 0;
        self.next_process = 0;
        self.step = Step::Scan;
    }

    /// Returns `true` once the whole table was processed and written back
    fn scan<R: Ring>(&mut self, st: &mut BlockstoreState, io: &mut IoQueue<R>) -> Result<bool> {
        loop {
            self.submit_scan_buffers(st, io)?;
            let ready = self.bufs.iter().position(|b| {
                b.state == BufState::Loaded && b.offset == self.next_process
            });
            match ready {
                Some(i) => self.process_buffer(i, st, io)?,
                None => break,
            }
        }
        Ok(self.bufs.iter().all(|b| b.state == BufState::Empty) && self.next_offset >= self.table_len)
    }

    fn submit_scan_buffers<R: Ring>(&mut self, st: &BlockstoreState, io: &mut IoQueue<R>) -> Result<()> {
        let buf_size = st.config.meta_buf_size;
        for i in 0..self.bufs.len() {
            if self.next_offset >= self.table_len {
                break;
            }
            if self.bufs[i].state != BufState::Empty {
                continue;
            }
            let len = (self.table_len - self.next_offset).min(buf_size) as usize;
            let offset = self.next_offset;
            let device_offset = st.layout.meta_offset + u64::from(st.layout.meta_block_size) + offset;
            let data = AlignedBuffer::new(len);
            let request = if self.zero_on_init {
                IoRequest::Write {
                    device: DeviceKind::Meta,
                    offset: device_offset,
                    buf: data,
                }
            } else {
                IoRequest::Read {
                    device: DeviceKind::Meta,
                    offset: device_offset,
                    buf: data,
                }
            };
            io.push_or_fail(IoOwner::Meta(MetaIo::Buffer(i)), request, "reading metadata")?;
            self.bufs[i] = ScanBuf {
                state: BufState::Loading,
                offset,
                len,
                data: None,
            };
            self.next_offset += len as u64;
        }
        Ok(())
    }

    fn process_buffer<R: Ring>(
        &mut self,
        i: usize,
        st: &mut BlockstoreState,
        io: &mut IoQueue<R>,
    ) -> Result<()> {
        let offset = self.bufs[i].offset;
        let len = self.bufs[i].len;
        let range = offset..offset + len as u64;
        self.next_process = range.end;

        if let Some(mut table) = st.metadata_buffer.take() {
            // The whole table is in memory: superseded slots are always local
            self.scan_slots(st, &mut table, 0, range);
            st.metadata_buffer = Some(table);
            self.bufs[i] = ScanBuf::empty();
            return Ok(());
        }

        let Some(mut data) = self.bufs[i].data.take() else {
            self.bufs[i] = ScanBuf::empty();
            return Ok(());
        };
        let changed = self.scan_slots(st, data.as_mut_slice(), offset, range);
        if changed && !st.config.readonly {
            let device_offset = st.layout.meta_offset + u64::from(st.layout.meta_block_size) + offset;
            io.push_or_fail(
                IoOwner::Meta(MetaIo::Buffer(i)),
                IoRequest::Write {
                    device: DeviceKind::Meta,
                    offset: device_offset,
                    buf: data,
                },
                "writing metadata",
            )?;
            self.bufs[i].state = BufState::Writing;
        } else {
            self.bufs[i] = ScanBuf::empty();
        }
        Ok(())
    }

    /// Apply the slots in `range` (table offsets) found in `buf`, which
    /// starts at table offset `buf_start`
    ///
    /// Returns `true` when `buf` was modified.
    fn scan_slots(
        &mut self,
        st: &mut BlockstoreState,
        buf: &mut [u8],
        buf_start: u64,
        range: std::ops::Range<u64>,
    ) -> bool {
        let layout = st.layout.clone();
        let block_size = u64::from(layout.meta_block_size);
        let bitmaps = 2 * layout.clean_entry_bitmap_size;
        let buf_end = buf_start + buf.len() as u64;
        let mut changed = false;

        let mut block_start = range.start;
        while block_start < range.end {
            let first_slot = block_start / block_size * layout.entries_per_block;
            let count = layout
                .entries_per_block
                .min(layout.block_count.saturating_sub(first_slot));
            for i in 0..count {
                let slot = first_slot + i;
                let pos = (block_start - buf_start) as usize + i as usize * layout.clean_entry_size;
                let raw = &buf[pos..pos + layout.clean_entry_size];
                if !st.config.inmemory_metadata && bitmaps > 0 {
                    let at = slot as usize * bitmaps;
                    st.clean_bitmaps[at..at + bitmaps]
                        .copy_from_slice(&raw[crate::layout::CLEAN_ENTRY_HEADER_SIZE..]);
                }
                let entry = CleanDiskEntry::decode(raw);
                if entry.oid.inode == 0 {
                    continue;
                }
                match st.clean_db.find(&entry.oid).copied() {
                    Some(clean) if clean.version >= entry.version => {
                        debug!(
                            "Old clean entry {}: {} v{}",
                            slot, entry.oid, entry.version
                        );
                        buf[pos..pos + layout.clean_entry_size].fill(0);
                        changed = true;
                    }
                    previous => {
                        if let Some(old) = previous {
                            let old_pos = layout.slot_position(old.location) as u64;
                            if old_pos >= buf_start && old_pos < buf_end {
                                let at = (old_pos - buf_start) as usize;
                                buf[at..at + layout.clean_entry_size].fill(0);
                                changed = true;
                            } else {
                                self.entries_to_zero.push(old.location);
                            }
                            debug!(
                                "Free block {} from {} v{} (new location is {})",
                                old.location, entry.oid, old.version, slot
                            );
                            st.alloc.set(old.location, false);
                        } else {
                            *st.inode_space_stats.entry(entry.oid.inode).or_default() +=
                                u64::from(layout.data_block_size);
                        }
                        self.entries_loaded += 1;
                        debug!(
                            "Allocate block (clean entry) {}: {} v{}",
                            slot, entry.oid, entry.version
                        );
                        st.alloc.set(slot, true);
                        st.clean_db.emplace(
                            entry.oid,
                            CleanEntry {
                                version: entry.version,
                                location: slot,
                            },
                        );
                    }
                }
            }
            block_start += block_size;
        }
        changed
    }

    fn read_zero_group<R: Ring>(&mut self, st: &BlockstoreState, io: &mut IoQueue<R>) -> Result<()> {
        let per_block = st.layout.entries_per_block;
        let table_block = self.entries_to_zero[self.zero_pos] / per_block;
        self.zero_end = self.zero_pos
            + self.entries_to_zero[self.zero_pos..]
                .iter()
                .take_while(|&&slot| slot / per_block == table_block)
                .count();
        self.submit_zero_block(io, IoRequest::Read {
            device: DeviceKind::Meta,
            offset: st.layout.meta_block_offset(table_block),
            buf: AlignedBuffer::new(st.layout.meta_block_size as usize),
        })?;
        self.step = Step::ZeroRead;
        Ok(())
    }

    fn finish<R: Ring>(&mut self, st: &mut BlockstoreState, io: &mut IoQueue<R>) -> Result<()> {
        st.meta_entries_loaded = self.entries_loaded;
        info!(
            "Metadata entries loaded: {}, free blocks: {} / {}",
            self.entries_loaded,
            st.alloc.get_free_count(),
            st.layout.block_count
        );
        if self.zero_on_init && !st.config.disable_meta_fsync {
            io.push_or_fail(
                IoOwner::Meta(MetaIo::Fsync),
                IoRequest::Fsync {
                    device: DeviceKind::Meta,
                },
                "syncing metadata",
            )?;
            self.waiting += 1;
            self.step = Step::Fsync;
        } else {
            self.step = Step::Done;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::device::FaultOn;
    use crate::layout::MetaSuperblock;
    use crate::ring::CompletionOrder;
    use crate::test_util::{boot, boot_with, open_with, small_config, small_layout, Devices};
    use tessera_common::{Error, ObjectId};

    const BLOCK: u64 = 128 * 1024;

    #[test]
    fn test_blank_metadata_is_initialized() {
        let layout = small_layout();
        let devices = Devices::new(&layout);
        let (store, _) = boot(&devices);

        let sb = MetaSuperblock::from_bytes(&devices.meta.read_range(0, 4096)).unwrap();
        sb.check(&layout).unwrap();
        assert_eq!(store.state().meta_entries_loaded, 0);
        assert_eq!(store.allocator().get_free_count(), 1000);
        assert!(store.clean_db().is_empty());
        // Superblock write plus one zero-fill write per scan buffer
        assert_eq!(devices.meta.write_count(), 1 + 4);
        assert_eq!(devices.meta.sync_count(), 1);
    }

    #[test]
    fn test_clean_entries_are_loaded() {
        let layout = small_layout();
        let devices = Devices::new(&layout);
        devices.format_meta(&layout);
        devices.put_clean(&layout, 5, ObjectId::new(1, 0), 3);
        devices.put_clean(&layout, 200, ObjectId::new(2, 0), 1);
        devices.put_clean(&layout, 999, ObjectId::new(1, 1), 7);

        let (store, _) = boot(&devices);
        let clean = store.clean_db();
        assert_eq!(clean.len(), 3);
        assert_eq!(clean.find(&ObjectId::new(1, 0)).unwrap().location, 5);
        assert_eq!(clean.find(&ObjectId::new(2, 0)).unwrap().location, 200);
        assert_eq!(clean.find(&ObjectId::new(1, 1)).unwrap().version, 7);
        assert!(store.allocator().get(5) && store.allocator().get(999));
        assert_eq!(store.allocator().get_free_count(), 997);
        assert_eq!(store.stats().get(&1), Some(&(2 * BLOCK)));
        assert_eq!(store.stats().get(&2), Some(&BLOCK));
        assert_eq!(store.state().meta_entries_loaded, 3);

        // Bitmaps are kept for every slot
        let bitmaps = store.state().slot_bitmaps(5).unwrap();
        assert_eq!(bitmaps, &[0xff, 0xff, 0xff, 0xff, 0x0f, 0x0f, 0x0f, 0x0f]);
        // Nothing was stale, so nothing was written
        assert_eq!(devices.meta.write_count(), 0);
    }

    #[test]
    fn test_superseded_slot_in_other_buffer_is_zeroed_later() {
        let layout = small_layout();
        let devices = Devices::new(&layout);
        devices.format_meta(&layout);
        devices.put_clean(&layout, 3, ObjectId::new(1, 0), 1);
        devices.put_clean(&layout, 900, ObjectId::new(1, 0), 2);

        let (store, _) = boot(&devices);
        let entry = store.clean_db().find(&ObjectId::new(1, 0)).unwrap();
        assert_eq!((entry.version, entry.location), (2, 900));
        assert!(!store.allocator().get(3));
        assert_eq!(store.allocator().get_free_count(), 999);
        assert_eq!(store.stats().get(&1), Some(&BLOCK));
        assert!(devices.slot(&layout, 3).iter().all(|&b| b == 0));
        assert_eq!(devices.slot_entry(&layout, 900).version, 2);
    }

    #[test]
    fn test_stale_slot_is_zeroed_in_place() {
        let layout = small_layout();
        let devices = Devices::new(&layout);
        devices.format_meta(&layout);
        devices.put_clean(&layout, 3, ObjectId::new(1, 0), 2);
        devices.put_clean(&layout, 4, ObjectId::new(2, 0), 1);
        devices.put_clean(&layout, 6, ObjectId::new(2, 0), 2);
        devices.put_clean(&layout, 900, ObjectId::new(1, 0), 1);

        let (store, _) = boot(&devices);
        assert_eq!(store.clean_db().find(&ObjectId::new(1, 0)).unwrap().location, 3);
        assert_eq!(store.clean_db().find(&ObjectId::new(2, 0)).unwrap().location, 6);
        assert!(devices.slot(&layout, 900).iter().all(|&b| b == 0));
        assert!(devices.slot(&layout, 4).iter().all(|&b| b == 0));
        assert!(!store.allocator().get(4) && !store.allocator().get(900));
        assert_eq!(store.allocator().get_free_count(), 998);
    }

    #[test]
    fn test_out_of_order_completions() {
        let layout = small_layout();
        let devices = Devices::new(&layout);
        devices.format_meta(&layout);
        for slot in [10, 300, 520, 700] {
            devices.put_clean(&layout, slot, ObjectId::new(slot, 0), 1);
        }
        devices.put_clean(&layout, 990, ObjectId::new(10, 0), 2);

        let (mut store, _) = open_with(small_config(), &devices, CompletionOrder::Reversed);
        store.run_until_ready().unwrap();
        assert_eq!(store.clean_db().len(), 4);
        assert_eq!(store.clean_db().find(&ObjectId::new(10, 0)).unwrap().location, 990);
        assert!(devices.slot(&layout, 10).iter().all(|&b| b == 0));
        assert_eq!(store.allocator().get_free_count(), 996);
    }

    #[test]
    fn test_config_mismatch() {
        let layout = small_layout();
        let devices = Devices::new(&layout);
        let sb = MetaSuperblock {
            bitmap_granularity: 8192,
            ..layout.superblock()
        };
        devices.meta.patch(0, &sb.to_bytes(4096));

        let (mut store, _) = open_with(small_config(), &devices, CompletionOrder::Fifo);
        let err = store.run_until_ready().unwrap_err();
        assert!(matches!(err, Error::MetadataMismatch { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_corrupt_superblock() {
        let layout = small_layout();
        let devices = Devices::new(&layout);
        devices.meta.patch(8, &[0xde, 0xad]);

        let (mut store, _) = open_with(small_config(), &devices, CompletionOrder::Fifo);
        assert!(matches!(
            store.run_until_ready(),
            Err(Error::CorruptMetadata(_))
        ));
    }

    #[test]
    fn test_readonly_blank_metadata() {
        let layout = small_layout();
        let devices = Devices::new(&layout);
        let mut cfg = small_config();
        cfg.readonly = true;

        let (store, _) = boot_with(cfg, &devices);
        assert!(store.is_ready());
        assert_eq!(devices.meta.write_count(), 0);
        assert_eq!(devices.journal.write_count(), 0);
        assert_eq!(devices.meta.sync_count(), 0);
    }

    #[test]
    fn test_inmemory_metadata() {
        let layout = small_layout();
        let devices = Devices::new(&layout);
        devices.format_meta(&layout);
        devices.put_clean(&layout, 3, ObjectId::new(1, 0), 1);
        devices.put_clean(&layout, 900, ObjectId::new(1, 0), 2);
        let mut cfg = small_config();
        cfg.inmemory_metadata = true;

        let (store, _) = boot_with(cfg, &devices);
        let st = store.state();
        let table = st.metadata_buffer.as_ref().unwrap();
        let at = layout.slot_position(3);
        assert!(table[at..at + layout.clean_entry_size].iter().all(|&b| b == 0));
        assert_eq!(st.slot_bitmaps(900).unwrap()[..4], [0xff; 4]);
        assert_eq!(st.clean_db.find(&ObjectId::new(1, 0)).unwrap().location, 900);
        // The superseded slot is only cleared in memory
        assert_eq!(devices.slot_entry(&layout, 3).version, 1);
        assert_eq!(devices.meta.write_count(), 0);
    }

    #[test]
    fn test_read_error_is_fatal() {
        let layout = small_layout();
        let devices = Devices::new(&layout);
        devices.format_meta(&layout);
        devices.meta.inject_fault(FaultOn::Read, libc::EIO);

        let (mut store, _) = open_with(small_config(), &devices, CompletionOrder::Fifo);
        let err = store.run_until_ready().unwrap_err();
        assert!(matches!(err, Error::Io { errno, .. } if errno == libc::EIO));
    }
}
