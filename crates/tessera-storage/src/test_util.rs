//! Shared fixtures for the unit tests

use crate::device::MemDevice;
use crate::flusher::FlushScheduler;
use crate::journal::{BigWriteEntry, JournalRecord};
use crate::layout::{CleanDiskEntry, DiskLayout};
use crate::ring::{BlockingRing, CompletionOrder};
use crate::store::{Blockstore, BlockstoreState};
use parking_lot::Mutex;
use std::sync::Arc;
use tessera_common::{BlockstoreConfig, ObjVerId, ObjectId};

/// 1000 blocks of 128 KiB, 4-byte bitmaps, 64 KiB journal, three devices
pub fn small_config() -> BlockstoreConfig {
    let mut cfg = BlockstoreConfig::default();
    cfg.devices.data_device = "data".into();
    cfg.devices.meta_device = Some("meta".into());
    cfg.devices.journal_device = Some("journal".into());
    cfg.devices.data_size = 1000 * 128 * 1024;
    cfg.devices.journal_size = 64 * 1024;
    cfg.meta_buf_size = 8192;
    cfg.journal_buffer_size = 16384;
    cfg.clean_db_shards = 4;
    cfg.ring_depth = 32;
    cfg
}

pub fn small_layout() -> DiskLayout {
    DiskLayout::from_config(&small_config()).unwrap()
}

pub fn ov(inode: u64, version: u64) -> ObjVerId {
    ObjVerId::new(ObjectId::new(inode, 0), version)
}

pub fn big_write(layout: &DiskLayout, inode: u64, version: u64, block: u64) -> JournalRecord {
    JournalRecord::BigWrite(BigWriteEntry {
        ov: ov(inode, version),
        offset: 0,
        len: layout.data_block_size,
        location: block << layout.block_order,
        bitmap: vec![0xff; layout.clean_entry_bitmap_size],
        instant: false,
    })
}

pub fn stable(inode: u64, version: u64) -> JournalRecord {
    JournalRecord::Stable(ov(inode, version))
}

#[derive(Debug, Default)]
struct Recorded {
    flushes: Vec<ObjVerId>,
    removed: Vec<ObjectId>,
    trims: usize,
}

/// Flusher that remembers every notification
#[derive(Clone, Debug, Default)]
pub struct RecordingFlusher {
    inner: Arc<Mutex<Recorded>>,
}

impl RecordingFlusher {
    pub fn flushes(&self) -> Vec<ObjVerId> {
        self.inner.lock().flushes.clone()
    }

    pub fn removed(&self) -> Vec<ObjectId> {
        self.inner.lock().removed.clone()
    }

    pub fn trims(&self) -> usize {
        self.inner.lock().trims
    }
}

impl FlushScheduler for RecordingFlusher {
    fn mark_trim_possible(&mut self) {
        self.inner.lock().trims += 1;
    }

    fn enqueue_flush(&mut self, ov: ObjVerId) {
        self.inner.lock().flushes.push(ov);
    }

    fn remove_flush(&mut self, oid: ObjectId) {
        self.inner.lock().removed.push(oid);
    }
}

/// Empty state over the small layout
pub fn state() -> (BlockstoreState, RecordingFlusher) {
    let flusher = RecordingFlusher::default();
    let st = BlockstoreState::new(small_config(), Box::new(flusher.clone())).unwrap();
    (st, flusher)
}

/// In-memory images of the three areas
#[derive(Clone, Debug)]
pub struct Devices {
    pub meta: MemDevice,
    pub journal: MemDevice,
    pub data: MemDevice,
}

impl Devices {
    /// Blank devices sized for `layout`
    pub fn new(layout: &DiskLayout) -> Self {
        Self {
            meta: MemDevice::new(layout.meta_offset + layout.meta_len),
            journal: MemDevice::new(layout.journal_offset + layout.journal_len),
            // Recovery never touches the data area
            data: MemDevice::new(4096),
        }
    }

    pub fn ring(&self, order: CompletionOrder) -> BlockingRing {
        BlockingRing::new(
            Box::new(self.meta.clone()),
            Box::new(self.journal.clone()),
            Box::new(self.data.clone()),
            32,
        )
        .with_order(order)
    }

    /// Store a clean entry in its slot
    pub fn put_clean(&self, layout: &DiskLayout, slot: u64, oid: ObjectId, version: u64) {
        let mut raw = vec![0u8; layout.clean_entry_size];
        let bitmap = vec![0xff; layout.clean_entry_bitmap_size];
        let ext = vec![0x0f; layout.clean_entry_bitmap_size];
        CleanDiskEntry { oid, version }.encode(&mut raw, &bitmap, &ext);
        self.meta.patch(self.slot_offset(layout, slot), &raw);
    }

    /// Raw slot contents
    pub fn slot(&self, layout: &DiskLayout, slot: u64) -> Vec<u8> {
        self.meta
            .read_range(self.slot_offset(layout, slot), layout.clean_entry_size)
    }

    /// Decoded slot header
    pub fn slot_entry(&self, layout: &DiskLayout, slot: u64) -> CleanDiskEntry {
        CleanDiskEntry::decode(&self.slot(layout, slot))
    }

    fn slot_offset(&self, layout: &DiskLayout, slot: u64) -> u64 {
        layout.meta_offset + u64::from(layout.meta_block_size) + layout.slot_position(slot) as u64
    }

    /// Write the metadata superblock for `layout`
    pub fn format_meta(&self, layout: &DiskLayout) {
        let sb = layout.superblock().to_bytes(layout.meta_block_size as usize);
        self.meta.patch(layout.meta_offset, &sb);
    }

    /// Replace the journal area
    pub fn put_journal(&self, layout: &DiskLayout, image: &[u8]) {
        self.journal.patch(layout.journal_offset, image);
    }

    pub fn journal_bytes(&self, layout: &DiskLayout) -> Vec<u8> {
        self.journal
            .read_range(layout.journal_offset, layout.journal_len as usize)
    }
}

/// Store over `devices`, not yet recovered
pub fn open_with(
    config: BlockstoreConfig,
    devices: &Devices,
    order: CompletionOrder,
) -> (Blockstore<BlockingRing>, RecordingFlusher) {
    let flusher = RecordingFlusher::default();
    let store = Blockstore::new(config, devices.ring(order), Box::new(flusher.clone())).unwrap();
    (store, flusher)
}

/// Recovered store over `devices` with the small configuration
pub fn boot(devices: &Devices) -> (Blockstore<BlockingRing>, RecordingFlusher) {
    boot_with(small_config(), devices)
}

pub fn boot_with(
    config: BlockstoreConfig,
    devices: &Devices,
) -> (Blockstore<BlockingRing>, RecordingFlusher) {
    let (mut store, flusher) = open_with(config, devices, CompletionOrder::Fifo);
    store.run_until_ready().unwrap();
    (store, flusher)
}
