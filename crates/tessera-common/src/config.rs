//! Configuration types for the blockstore
//!
//! All fields have defaults so a partial TOML file is enough. Sizes are in
//! bytes.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default metadata block size (4KB)
pub const DEFAULT_META_BLOCK_SIZE: u32 = 4096;

/// Default data block size (128KB)
pub const DEFAULT_DATA_BLOCK_SIZE: u32 = 128 * 1024;

/// Default journal block size (4KB)
pub const DEFAULT_JOURNAL_BLOCK_SIZE: u32 = 4096;

/// Default bitmap granularity (4KB)
pub const DEFAULT_BITMAP_GRANULARITY: u32 = 4096;

/// Default journal size (32MB)
pub const DEFAULT_JOURNAL_SIZE: u64 = 32 * 1024 * 1024;

/// Default scan buffer size for metadata and journal recovery (4MB)
pub const DEFAULT_SCAN_BUFFER_SIZE: u64 = 4 * 1024 * 1024;

/// Smallest ring depth that lets recovery keep its buffers in flight
pub const MIN_RING_DEPTH: u32 = 4;

/// Blockstore configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockstoreConfig {
    /// Where the three areas live
    pub devices: DeviceConfig,
    /// Metadata block size
    pub meta_block_size: u32,
    /// Data block size (one object stripe)
    pub data_block_size: u32,
    /// Journal block ("sector") size
    pub journal_block_size: u32,
    /// Size of one bit in the per-object written bitmap
    pub bitmap_granularity: u32,
    /// Never write to any device
    pub readonly: bool,
    /// Skip fsync on the metadata device
    pub disable_meta_fsync: bool,
    /// Skip fsync on the journal device
    pub disable_journal_fsync: bool,
    /// Keep the whole metadata area in memory
    pub inmemory_metadata: bool,
    /// Keep the whole journal area in memory
    pub inmemory_journal: bool,
    /// Size of each metadata scan buffer
    pub meta_buf_size: u64,
    /// Size of each journal scan buffer
    pub journal_buffer_size: u64,
    /// Number of clean index shards
    pub clean_db_shards: u32,
    /// Submission ring depth
    pub ring_depth: u32,
}

impl Default for BlockstoreConfig {
    fn default() -> Self {
        Self {
            devices: DeviceConfig::default(),
            meta_block_size: DEFAULT_META_BLOCK_SIZE,
            data_block_size: DEFAULT_DATA_BLOCK_SIZE,
            journal_block_size: DEFAULT_JOURNAL_BLOCK_SIZE,
            bitmap_granularity: DEFAULT_BITMAP_GRANULARITY,
            readonly: false,
            disable_meta_fsync: false,
            disable_journal_fsync: false,
            inmemory_metadata: false,
            inmemory_journal: false,
            meta_buf_size: DEFAULT_SCAN_BUFFER_SIZE,
            journal_buffer_size: DEFAULT_SCAN_BUFFER_SIZE,
            clean_db_shards: 64,
            ring_depth: 128,
        }
    }
}

/// Device paths and area placement
///
/// The metadata and journal areas default to the data device when no
/// separate path is given; the offsets then decide where each area lives.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Data device path
    pub data_device: PathBuf,
    /// Metadata device path (defaults to the data device)
    pub meta_device: Option<PathBuf>,
    /// Journal device path (defaults to the metadata device)
    pub journal_device: Option<PathBuf>,
    /// Offset of the data area
    pub data_offset: u64,
    /// Size of the data area (0 = up to the end of the device)
    pub data_size: u64,
    /// Offset of the metadata area
    pub meta_offset: u64,
    /// Size of the metadata area (0 = exactly what the data area needs)
    pub meta_size: u64,
    /// Offset of the journal area
    pub journal_offset: u64,
    /// Size of the journal area
    pub journal_size: u64,
    /// Open devices with O_DIRECT
    pub direct_io: bool,
}

impl DeviceConfig {
    /// Effective metadata device path
    #[must_use]
    pub fn meta_path(&self) -> &PathBuf {
        self.meta_device.as_ref().unwrap_or(&self.data_device)
    }

    /// Effective journal device path
    #[must_use]
    pub fn journal_path(&self) -> &PathBuf {
        self.journal_device
            .as_ref()
            .unwrap_or_else(|| self.meta_path())
    }
}

impl BlockstoreConfig {
    /// Check the configuration for values the on-disk format cannot express
    pub fn validate(&self) -> Result<()> {
        check_block_size("meta_block_size", self.meta_block_size)?;
        check_block_size("data_block_size", self.data_block_size)?;
        check_block_size("journal_block_size", self.journal_block_size)?;

        if !self.bitmap_granularity.is_power_of_two() {
            return Err(Error::configuration(format!(
                "bitmap_granularity {} is not a power of two",
                self.bitmap_granularity
            )));
        }
        if self.data_block_size % self.bitmap_granularity != 0
            || (self.data_block_size / self.bitmap_granularity) % 8 != 0
        {
            return Err(Error::configuration(format!(
                "data_block_size {} must hold a whole number of bitmap bytes at granularity {}",
                self.data_block_size, self.bitmap_granularity
            )));
        }

        check_multiple("meta_buf_size", self.meta_buf_size, self.meta_block_size)?;
        check_multiple(
            "journal_buffer_size",
            self.journal_buffer_size,
            self.journal_block_size,
        )?;

        let dev = &self.devices;
        let journal_block = u64::from(self.journal_block_size);
        if dev.journal_size < 2 * journal_block || dev.journal_size % journal_block != 0 {
            return Err(Error::configuration(format!(
                "journal_size {} must be a multiple of {} and hold at least two blocks",
                dev.journal_size, self.journal_block_size
            )));
        }
        if dev.journal_offset % journal_block != 0 {
            return Err(Error::configuration(format!(
                "journal_offset {} is not aligned to {}",
                dev.journal_offset, self.journal_block_size
            )));
        }
        if dev.meta_offset % u64::from(self.meta_block_size) != 0 {
            return Err(Error::configuration(format!(
                "meta_offset {} is not aligned to {}",
                dev.meta_offset, self.meta_block_size
            )));
        }
        if dev.data_offset % u64::from(self.bitmap_granularity) != 0 {
            return Err(Error::configuration(format!(
                "data_offset {} is not aligned to {}",
                dev.data_offset, self.bitmap_granularity
            )));
        }

        if self.clean_db_shards == 0 {
            return Err(Error::configuration("clean_db_shards must be at least 1"));
        }
        if self.ring_depth < MIN_RING_DEPTH {
            return Err(Error::configuration(format!(
                "ring_depth {} is below the minimum of {}",
                self.ring_depth, MIN_RING_DEPTH
            )));
        }
        Ok(())
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            data_device: PathBuf::new(),
            meta_device: None,
            journal_device: None,
            data_offset: 0,
            data_size: 0,
            meta_offset: 0,
            meta_size: 0,
            journal_offset: 0,
            journal_size: DEFAULT_JOURNAL_SIZE,
            direct_io: false,
        }
    }
}

fn check_block_size(name: &str, size: u32) -> Result<()> {
    if size < 512 || !size.is_power_of_two() {
        return Err(Error::configuration(format!(
            "{name} {size} must be a power of two of at least 512"
        )));
    }
    Ok(())
}

fn check_multiple(name: &str, value: u64, unit: u32) -> Result<()> {
    if value == 0 || value % u64::from(unit) != 0 {
        return Err(Error::configuration(format!(
            "{name} {value} must be a non-zero multiple of {unit}"
        )));
    }
    Ok(())
}
