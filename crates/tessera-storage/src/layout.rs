//! Disk layout definitions
//!
//! Metadata area:
//! ```text
//! +------------------+  meta_offset
//! |   Superblock     |  one metadata block: zero, magic, version, sizes
//! +------------------+
//! |   Slot table     |  one clean entry per data block, packed per
//! |                  |  metadata block (entries never straddle blocks)
//! +------------------+
//! ```
//!
//! Clean entry (slot index = data block index):
//! ```text
//! +-------+--------+---------+-------------+-----------------+
//! | inode | stripe | version | bitmap[B]   | ext_bitmap[B]   |
//! |  u64  |  u64   |   u64   |             |                 |
//! +-------+--------+---------+-------------+-----------------+
//! ```
//! where `B = data_block_size / bitmap_granularity / 8`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tessera_common::{BlockstoreConfig, Error, ObjectId, Result};

/// Magic number of the metadata superblock ("VITAStor" little-endian)
pub const META_MAGIC: u64 = 0x726F_7473_4154_4956;

/// Current metadata format version
pub const META_VERSION: u64 = 1;

/// Bytes of the superblock that carry data
pub const META_SUPERBLOCK_SIZE: usize = 36;

/// Fixed part of a clean entry (oid + version)
pub const CLEAN_ENTRY_HEADER_SIZE: usize = 24;

/// Geometry of the three on-disk areas, derived from the configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiskLayout {
    /// Metadata block size
    pub meta_block_size: u32,
    /// Data block size
    pub data_block_size: u32,
    /// Journal block size
    pub journal_block_size: u32,
    /// Bitmap granularity
    pub bitmap_granularity: u32,
    /// log2(data_block_size)
    pub block_order: u32,
    /// Number of data blocks
    pub block_count: u64,
    /// Size of one bitmap in a clean entry
    pub clean_entry_bitmap_size: usize,
    /// Size of one clean entry
    pub clean_entry_size: usize,
    /// Clean entries per metadata block
    pub entries_per_block: u64,
    /// Metadata area offset
    pub meta_offset: u64,
    /// Metadata area length (superblock included)
    pub meta_len: u64,
    /// Journal area offset
    pub journal_offset: u64,
    /// Journal area length
    pub journal_len: u64,
    /// Data area offset
    pub data_offset: u64,
    /// Data area length
    pub data_len: u64,
}

impl DiskLayout {
    /// Compute the layout for a configuration
    ///
    /// `devices.data_size` must already be resolved to a non-zero size.
    pub fn from_config(cfg: &BlockstoreConfig) -> Result<Self> {
        cfg.validate()?;
        let dev = &cfg.devices;

        let block_count = dev.data_size / u64::from(cfg.data_block_size);
        if block_count == 0 {
            return Err(Error::configuration(format!(
                "data area of {} bytes holds no {}-byte blocks",
                dev.data_size, cfg.data_block_size
            )));
        }

        let clean_entry_bitmap_size = (cfg.data_block_size / cfg.bitmap_granularity / 8) as usize;
        let clean_entry_size = CLEAN_ENTRY_HEADER_SIZE + 2 * clean_entry_bitmap_size;
        let entries_per_block = u64::from(cfg.meta_block_size) / clean_entry_size as u64;
        if entries_per_block == 0 {
            return Err(Error::configuration(format!(
                "meta_block_size {} cannot hold a {}-byte clean entry",
                cfg.meta_block_size, clean_entry_size
            )));
        }

        let meta_len =
            u64::from(cfg.meta_block_size) * (1 + block_count.div_ceil(entries_per_block));
        if dev.meta_size != 0 && dev.meta_size < meta_len {
            return Err(Error::configuration(format!(
                "meta_size {} is too small, {} bytes are needed for {} blocks",
                dev.meta_size, meta_len, block_count
            )));
        }

        let layout = Self {
            meta_block_size: cfg.meta_block_size,
            data_block_size: cfg.data_block_size,
            journal_block_size: cfg.journal_block_size,
            bitmap_granularity: cfg.bitmap_granularity,
            block_order: cfg.data_block_size.trailing_zeros(),
            block_count,
            clean_entry_bitmap_size,
            clean_entry_size,
            entries_per_block,
            meta_offset: dev.meta_offset,
            meta_len,
            journal_offset: dev.journal_offset,
            journal_len: dev.journal_size,
            data_offset: dev.data_offset,
            data_len: dev.data_size,
        };

        let data = (layout.data_offset, layout.data_len);
        let meta = (layout.meta_offset, layout.meta_len);
        let journal = (layout.journal_offset, layout.journal_len);
        if dev.meta_path() == &dev.data_device && overlaps(meta, data) {
            return Err(Error::configuration("metadata area overlaps the data area"));
        }
        if dev.journal_path() == &dev.data_device && overlaps(journal, data) {
            return Err(Error::configuration("journal area overlaps the data area"));
        }
        if dev.journal_path() == dev.meta_path() && overlaps(journal, meta) {
            return Err(Error::configuration("journal area overlaps the metadata area"));
        }

        Ok(layout)
    }

    /// Number of metadata blocks in the slot table
    #[must_use]
    pub const fn meta_table_blocks(&self) -> u64 {
        self.block_count.div_ceil(self.entries_per_block)
    }

    /// Device offset of a slot-table block
    #[must_use]
    pub const fn meta_block_offset(&self, table_block: u64) -> u64 {
        self.meta_offset + (1 + table_block) * self.meta_block_size as u64
    }

    /// Position of a slot inside the slot table, in bytes from its start
    #[must_use]
    pub const fn slot_position(&self, slot: u64) -> usize {
        let block = slot / self.entries_per_block;
        let index = slot % self.entries_per_block;
        (block * self.meta_block_size as u64) as usize + index as usize * self.clean_entry_size
    }

    /// Superblock describing this layout
    #[must_use]
    pub const fn superblock(&self) -> MetaSuperblock {
        MetaSuperblock {
            zero: 0,
            magic: META_MAGIC,
            version: META_VERSION,
            meta_block_size: self.meta_block_size,
            data_block_size: self.data_block_size,
            bitmap_granularity: self.bitmap_granularity,
        }
    }
}

const fn overlaps(a: (u64, u64), b: (u64, u64)) -> bool {
    a.0 < b.0 + b.1 && b.0 < a.0 + a.1
}

/// Superblock stored in the first metadata block
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetaSuperblock {
    /// Always zero; a non-zero value means the area holds something else
    pub zero: u64,
    /// Format magic
    pub magic: u64,
    /// Format version
    pub version: u64,
    /// Metadata block size the area was created with
    pub meta_block_size: u32,
    /// Data block size the area was created with
    pub data_block_size: u32,
    /// Bitmap granularity the area was created with
    pub bitmap_granularity: u32,
}

impl MetaSuperblock {
    /// Serialize into a full metadata block
    #[must_use]
    pub fn to_bytes(&self, block_size: usize) -> Bytes {
        let mut buf = BytesMut::with_capacity(block_size);

        buf.put_u64_le(self.zero);
        buf.put_u64_le(self.magic);
        buf.put_u64_le(self.version);
        buf.put_u32_le(self.meta_block_size);
        buf.put_u32_le(self.data_block_size);
        buf.put_u32_le(self.bitmap_granularity);

        // Pad to the block size
        buf.resize(block_size, 0);

        buf.freeze()
    }

    /// Parse the superblock fields
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < META_SUPERBLOCK_SIZE {
            return Err(Error::corrupt_metadata("superblock too small"));
        }

        let mut buf = data;
        Ok(Self {
            zero: buf.get_u64_le(),
            magic: buf.get_u64_le(),
            version: buf.get_u64_le(),
            meta_block_size: buf.get_u32_le(),
            data_block_size: buf.get_u32_le(),
            bitmap_granularity: buf.get_u32_le(),
        })
    }

    /// Check that the stored superblock belongs to this layout
    pub fn check(&self, layout: &DiskLayout) -> Result<()> {
        if self.zero != 0 || self.magic != META_MAGIC {
            return Err(Error::corrupt_metadata(
                "superblock has no valid signature, this is not a blockstore metadata area",
            ));
        }
        if self.version != META_VERSION {
            return Err(Error::corrupt_metadata(format!(
                "metadata version {} is not supported (this build supports version {})",
                self.version, META_VERSION
            )));
        }
        if self.meta_block_size != layout.meta_block_size
            || self.data_block_size != layout.data_block_size
            || self.bitmap_granularity != layout.bitmap_granularity
        {
            return Err(Error::MetadataMismatch {
                stored: describe(
                    self.meta_block_size,
                    self.data_block_size,
                    self.bitmap_granularity,
                ),
                configured: describe(
                    layout.meta_block_size,
                    layout.data_block_size,
                    layout.bitmap_granularity,
                ),
            });
        }
        Ok(())
    }
}

fn describe(meta_block_size: u32, data_block_size: u32, bitmap_granularity: u32) -> String {
    format!(
        "meta_block_size={meta_block_size}, data_block_size={data_block_size}, \
         bitmap_granularity={bitmap_granularity}"
    )
}

/// Decoded header of a clean entry slot
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CleanDiskEntry {
    /// Object stored in the block
    pub oid: ObjectId,
    /// Version of the object
    pub version: u64,
}

impl CleanDiskEntry {
    /// Read the oid and version of the slot at the start of `slot`
    #[must_use]
    pub fn decode(slot: &[u8]) -> Self {
        let mut buf = slot;
        let inode = buf.get_u64_le();
        let stripe = buf.get_u64_le();
        let version = buf.get_u64_le();
        Self {
            oid: ObjectId::new(inode, stripe),
            version,
        }
    }

    /// Write the slot: header followed by both bitmaps
    ///
    /// `slot` must be exactly one clean entry long.
    pub fn encode(&self, slot: &mut [u8], bitmap: &[u8], ext_bitmap: &[u8]) {
        let mut buf = slot;
        buf.put_u64_le(self.oid.inode);
        buf.put_u64_le(self.oid.stripe);
        buf.put_u64_le(self.version);
        buf.put_slice(bitmap);
        buf.put_slice(ext_bitmap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> BlockstoreConfig {
        let mut cfg = BlockstoreConfig::default();
        cfg.devices.data_device = "data".into();
        cfg.devices.meta_device = Some("meta".into());
        cfg.devices.journal_device = Some("journal".into());
        cfg.devices.data_size = 1000 * u64::from(cfg.data_block_size);
        cfg.devices.journal_size = 64 * 1024;
        cfg
    }

    #[test]
    fn test_layout_geometry() {
        let layout = DiskLayout::from_config(&small_config()).unwrap();
        assert_eq!(layout.block_order, 17);
        assert_eq!(layout.block_count, 1000);
        assert_eq!(layout.clean_entry_bitmap_size, 4);
        assert_eq!(layout.clean_entry_size, 32);
        assert_eq!(layout.entries_per_block, 128);
        // 1000 slots need 8 table blocks, plus the superblock
        assert_eq!(layout.meta_table_blocks(), 8);
        assert_eq!(layout.meta_len, 9 * 4096);
        assert_eq!(layout.meta_block_offset(0), 4096);
        assert_eq!(layout.slot_position(129), 4096 + 32);
    }

    #[test]
    fn test_meta_size_too_small() {
        let mut cfg = small_config();
        cfg.devices.meta_size = 4096;
        assert!(matches!(
            DiskLayout::from_config(&cfg),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_overlapping_areas_on_shared_device() {
        let mut cfg = small_config();
        cfg.devices.meta_device = None;
        cfg.devices.journal_device = None;
        cfg.devices.journal_offset = 0;
        cfg.devices.meta_offset = 64 * 1024;
        cfg.devices.data_offset = 64 * 1024 + 4096;
        assert!(DiskLayout::from_config(&cfg).is_err());

        cfg.devices.data_offset = 1024 * 1024;
        DiskLayout::from_config(&cfg).unwrap();
    }

    #[test]
    fn test_superblock_roundtrip_and_check() {
        let layout = DiskLayout::from_config(&small_config()).unwrap();
        let sb = layout.superblock();
        let bytes = sb.to_bytes(4096);
        assert_eq!(bytes.len(), 4096);

        let parsed = MetaSuperblock::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, sb);
        parsed.check(&layout).unwrap();
    }

    #[test]
    fn test_superblock_mismatch() {
        let layout = DiskLayout::from_config(&small_config()).unwrap();
        let mut sb = layout.superblock();
        sb.data_block_size = 256 * 1024;
        assert!(matches!(
            sb.check(&layout),
            Err(Error::MetadataMismatch { .. })
        ));

        let mut sb = layout.superblock();
        sb.magic = 1;
        assert!(matches!(sb.check(&layout), Err(Error::CorruptMetadata(_))));

        let mut sb = layout.superblock();
        sb.version = 2;
        assert!(matches!(sb.check(&layout), Err(Error::CorruptMetadata(_))));
    }

    #[test]
    fn test_clean_entry_codec() {
        let mut slot = [0u8; 32];
        let entry = CleanDiskEntry {
            oid: ObjectId::new(7, 0x20000),
            version: 3,
        };
        entry.encode(&mut slot, &[0xff; 4], &[0x0f; 4]);
        assert_eq!(CleanDiskEntry::decode(&slot), entry);
        assert_eq!(&slot[24..28], &[0xff; 4]);
        assert_eq!(&slot[28..32], &[0x0f; 4]);
    }
}
