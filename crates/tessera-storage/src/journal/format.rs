//! Journal entry format
//!
//! Every entry starts with the same envelope:
//! ```text
//! +--------+-------+------+------+------------+-------------+
//! | crc32  | magic | type | size | crc32_prev | payload ... |
//! |  u32   |  u16  | u16  | u32  |    u32     |             |
//! +--------+-------+------+------+------------+-------------+
//! ```
//! `crc32` covers bytes `[4, size)` of the entry. `crc32_prev` is the crc of
//! the entry written before it, which chains the whole journal together.
//! The START entry reuses the `crc32_prev` slot as a reserved zero field.
//!
//! Payloads (all little-endian):
//! - START: journal_start u64, version u64
//! - SMALL_WRITE: inode, stripe, version, offset u32, len u32,
//!   data_offset u64, crc32_data u32, bitmap
//! - BIG_WRITE: inode, stripe, version, offset u32, len u32, location u64,
//!   bitmap
//! - STABLE / DELETE / ROLLBACK: inode, stripe, version

use bytes::{Buf, BufMut};
use tessera_common::checksum::crc32c;
use tessera_common::{Error, ObjVerId, ObjectId, Result};

/// Magic value of every journal entry
pub const JOURNAL_MAGIC: u16 = 0x4A33;

/// Current journal format version
pub const JOURNAL_VERSION: u64 = 1;

/// Size of the common envelope
pub const ENTRY_HEADER_SIZE: usize = 16;

/// Size of a START entry
pub const START_ENTRY_SIZE: usize = 32;

/// Size of a START entry written before the version field existed
pub const LEGACY_START_ENTRY_SIZE: usize = 24;

/// Fixed part of a small write entry
pub const SMALL_WRITE_SIZE: usize = 60;

/// Fixed part of a big write entry
pub const BIG_WRITE_SIZE: usize = 56;

/// Size of STABLE, DELETE and ROLLBACK entries
pub const OBJ_VER_ENTRY_SIZE: usize = 40;

/// Journal entry type
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum EntryType {
    Start = 1,
    SmallWrite = 2,
    BigWrite = 3,
    Stable = 4,
    Delete = 5,
    Rollback = 6,
    SmallWriteInstant = 7,
    BigWriteInstant = 8,
}

impl TryFrom<u16> for EntryType {
    type Error = u16;

    fn try_from(v: u16) -> std::result::Result<Self, u16> {
        match v {
            1 => Ok(Self::Start),
            2 => Ok(Self::SmallWrite),
            3 => Ok(Self::BigWrite),
            4 => Ok(Self::Stable),
            5 => Ok(Self::Delete),
            6 => Ok(Self::Rollback),
            7 => Ok(Self::SmallWriteInstant),
            8 => Ok(Self::BigWriteInstant),
            other => Err(other),
        }
    }
}

/// START entry payload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StartEntry {
    /// Offset of the oldest live entry
    pub journal_start: u64,
    /// Format version
    pub version: u64,
}

/// Small write: data is stored in the journal itself
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SmallWriteEntry {
    /// Object version written
    pub ov: ObjVerId,
    /// Offset inside the object
    pub offset: u32,
    /// Data length
    pub len: u32,
    /// Journal offset of the data
    pub data_offset: u64,
    /// CRC32C of the data
    pub crc32_data: u32,
    /// Caller bitmap
    pub bitmap: Vec<u8>,
    /// Stable as soon as it is written
    pub instant: bool,
}

/// Big write: data is stored in its own data block
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BigWriteEntry {
    /// Object version written
    pub ov: ObjVerId,
    /// Offset inside the object
    pub offset: u32,
    /// Data length
    pub len: u32,
    /// Byte offset of the block inside the data area
    pub location: u64,
    /// Caller bitmap
    pub bitmap: Vec<u8>,
    /// Stable as soon as it is written
    pub instant: bool,
}

/// Decoded journal entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JournalRecord {
    Start(StartEntry),
    SmallWrite(SmallWriteEntry),
    BigWrite(BigWriteEntry),
    Stable(ObjVerId),
    Delete(ObjVerId),
    Rollback(ObjVerId),
}

/// Why bytes did not decode as an entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryError {
    /// Not enough room for an envelope
    Truncated,
    /// Wrong magic
    BadMagic,
    /// Size field impossible for the type or the buffer
    BadSize,
    /// Entry checksum mismatch
    BadCrc,
    /// Type outside the known range
    BadType,
}

/// An entry together with its envelope
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedEntry {
    /// Entry checksum
    pub crc32: u32,
    /// Checksum of the previous entry
    pub crc32_prev: u32,
    /// Encoded size
    pub size: usize,
    /// Payload
    pub record: JournalRecord,
}

impl JournalRecord {
    /// Entry type
    #[must_use]
    pub const fn entry_type(&self) -> EntryType {
        match self {
            Self::Start(_) => EntryType::Start,
            Self::SmallWrite(e) if e.instant => EntryType::SmallWriteInstant,
            Self::SmallWrite(_) => EntryType::SmallWrite,
            Self::BigWrite(e) if e.instant => EntryType::BigWriteInstant,
            Self::BigWrite(_) => EntryType::BigWrite,
            Self::Stable(_) => EntryType::Stable,
            Self::Delete(_) => EntryType::Delete,
            Self::Rollback(_) => EntryType::Rollback,
        }
    }

    /// Encoded size in bytes
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        match self {
            Self::Start(_) => START_ENTRY_SIZE,
            Self::SmallWrite(e) => SMALL_WRITE_SIZE + e.bitmap.len(),
            Self::BigWrite(e) => BIG_WRITE_SIZE + e.bitmap.len(),
            Self::Stable(_) | Self::Delete(_) | Self::Rollback(_) => OBJ_VER_ENTRY_SIZE,
        }
    }

    /// Encode into `out`, which must be exactly [`Self::encoded_size`] long
    ///
    /// Returns the entry checksum.
    pub fn encode(&self, crc32_prev: u32, out: &mut [u8]) -> u32 {
        let size = self.encoded_size();
        debug_assert_eq!(out.len(), size);
        {
            let mut buf = &mut out[..];
            buf.put_u32_le(0);
            buf.put_u16_le(JOURNAL_MAGIC);
            buf.put_u16_le(self.entry_type() as u16);
            buf.put_u32_le(size as u32);
            match self {
                Self::Start(e) => {
                    buf.put_u32_le(0);
                    buf.put_u64_le(e.journal_start);
                    buf.put_u64_le(e.version);
                }
                Self::SmallWrite(e) => {
                    buf.put_u32_le(crc32_prev);
                    put_ov(&mut buf, &e.ov);
                    buf.put_u32_le(e.offset);
                    buf.put_u32_le(e.len);
                    buf.put_u64_le(e.data_offset);
                    buf.put_u32_le(e.crc32_data);
                    buf.put_slice(&e.bitmap);
                }
                Self::BigWrite(e) => {
                    buf.put_u32_le(crc32_prev);
                    put_ov(&mut buf, &e.ov);
                    buf.put_u32_le(e.offset);
                    buf.put_u32_le(e.len);
                    buf.put_u64_le(e.location);
                    buf.put_slice(&e.bitmap);
                }
                Self::Stable(ov) | Self::Delete(ov) | Self::Rollback(ov) => {
                    buf.put_u32_le(crc32_prev);
                    put_ov(&mut buf, ov);
                }
            }
        }
        let crc = crc32c(&out[4..size]);
        out[..4].copy_from_slice(&crc.to_le_bytes());
        crc
    }

    /// Decode the entry at the start of `buf`
    ///
    /// `buf` ends where the entry's sector ends; `bitmap_size` is the size
    /// of the bitmap carried by write entries.
    pub fn decode(buf: &[u8], bitmap_size: usize) -> std::result::Result<DecodedEntry, EntryError> {
        if buf.len() < ENTRY_HEADER_SIZE {
            return Err(EntryError::Truncated);
        }
        let mut hdr = buf;
        let crc32 = hdr.get_u32_le();
        let magic = hdr.get_u16_le();
        let raw_type = hdr.get_u16_le();
        let size = hdr.get_u32_le() as usize;
        let crc32_prev = hdr.get_u32_le();

        if magic != JOURNAL_MAGIC {
            return Err(EntryError::BadMagic);
        }
        if size < ENTRY_HEADER_SIZE || size > buf.len() {
            return Err(EntryError::BadSize);
        }
        if crc32c(&buf[4..size]) != crc32 {
            return Err(EntryError::BadCrc);
        }
        let entry_type = EntryType::try_from(raw_type).map_err(|_| EntryError::BadType)?;

        let min_size = match entry_type {
            EntryType::Start => LEGACY_START_ENTRY_SIZE,
            EntryType::SmallWrite | EntryType::SmallWriteInstant => SMALL_WRITE_SIZE + bitmap_size,
            EntryType::BigWrite | EntryType::BigWriteInstant => BIG_WRITE_SIZE + bitmap_size,
            EntryType::Stable | EntryType::Delete | EntryType::Rollback => OBJ_VER_ENTRY_SIZE,
        };
        if size < min_size {
            return Err(EntryError::BadSize);
        }

        let mut body = &buf[ENTRY_HEADER_SIZE..size];
        let record = match entry_type {
            EntryType::Start => JournalRecord::Start(StartEntry {
                journal_start: body.get_u64_le(),
                version: if size >= START_ENTRY_SIZE {
                    body.get_u64_le()
                } else {
                    0
                },
            }),
            EntryType::SmallWrite | EntryType::SmallWriteInstant => {
                let ov = get_ov(&mut body);
                JournalRecord::SmallWrite(SmallWriteEntry {
                    ov,
                    offset: body.get_u32_le(),
                    len: body.get_u32_le(),
                    data_offset: body.get_u64_le(),
                    crc32_data: body.get_u32_le(),
                    bitmap: body[..bitmap_size].to_vec(),
                    instant: entry_type == EntryType::SmallWriteInstant,
                })
            }
            EntryType::BigWrite | EntryType::BigWriteInstant => {
                let ov = get_ov(&mut body);
                JournalRecord::BigWrite(BigWriteEntry {
                    ov,
                    offset: body.get_u32_le(),
                    len: body.get_u32_le(),
                    location: body.get_u64_le(),
                    bitmap: body[..bitmap_size].to_vec(),
                    instant: entry_type == EntryType::BigWriteInstant,
                })
            }
            EntryType::Stable => JournalRecord::Stable(get_ov(&mut body)),
            EntryType::Delete => JournalRecord::Delete(get_ov(&mut body)),
            EntryType::Rollback => JournalRecord::Rollback(get_ov(&mut body)),
        };

        Ok(DecodedEntry {
            crc32,
            crc32_prev,
            size,
            record,
        })
    }
}

impl StartEntry {
    /// Parse and validate the START entry in the first journal block
    pub fn parse(block: &[u8]) -> Result<Self> {
        let entry = JournalRecord::decode(block, 0).map_err(|e| {
            Error::corrupt_journal(format!("first entry is not a valid START entry ({e:?})"))
        })?;
        let JournalRecord::Start(start) = entry.record else {
            return Err(Error::corrupt_journal("first entry is not a START entry"));
        };
        if entry.size != START_ENTRY_SIZE && entry.size != LEGACY_START_ENTRY_SIZE {
            return Err(Error::corrupt_journal(format!(
                "START entry has unexpected size {}",
                entry.size
            )));
        }
        if entry.size == LEGACY_START_ENTRY_SIZE || start.version != JOURNAL_VERSION {
            return Err(Error::UnsupportedJournalVersion {
                found: start.version,
                supported: JOURNAL_VERSION,
            });
        }
        Ok(start)
    }
}

fn put_ov(buf: &mut &mut [u8], ov: &ObjVerId) {
    buf.put_u64_le(ov.oid.inode);
    buf.put_u64_le(ov.oid.stripe);
    buf.put_u64_le(ov.version);
}

fn get_ov(buf: &mut &[u8]) -> ObjVerId {
    let inode = buf.get_u64_le();
    let stripe = buf.get_u64_le();
    ObjVerId::new(ObjectId::new(inode, stripe), buf.get_u64_le())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ov(inode: u64, version: u64) -> ObjVerId {
        ObjVerId::new(ObjectId::new(inode, 0), version)
    }

    fn encode(record: &JournalRecord, prev: u32) -> (Vec<u8>, u32) {
        let mut out = vec![0u8; record.encoded_size()];
        let crc = record.encode(prev, &mut out);
        (out, crc)
    }

    #[test]
    fn test_big_write_entry() {
        let record = JournalRecord::BigWrite(BigWriteEntry {
            ov: ov(1, 1),
            offset: 0,
            len: 128 * 1024,
            location: 5 << 17,
            bitmap: vec![0xff; 4],
            instant: false,
        });
        let (bytes, crc) = encode(&record, 0xdead_beef);
        assert_eq!(bytes.len(), 60);

        // Decoding from a whole sector stops at the entry size
        let mut sector = bytes.clone();
        sector.resize(4096, 0);
        let decoded = JournalRecord::decode(&sector, 4).unwrap();
        assert_eq!(decoded.crc32, crc);
        assert_eq!(decoded.crc32_prev, 0xdead_beef);
        assert_eq!(decoded.size, 60);
        assert_eq!(decoded.record, record);
    }

    #[test]
    fn test_instant_types() {
        let record = JournalRecord::SmallWrite(SmallWriteEntry {
            ov: ov(3, 2),
            offset: 4096,
            len: 4096,
            data_offset: 8192,
            crc32_data: 7,
            bitmap: vec![1, 0, 0, 0],
            instant: true,
        });
        assert_eq!(record.entry_type(), EntryType::SmallWriteInstant);
        let (bytes, _) = encode(&record, 0);
        assert_eq!(u16::from_le_bytes([bytes[6], bytes[7]]), 7);
        assert_eq!(JournalRecord::decode(&bytes, 4).unwrap().record, record);
    }

    #[test]
    fn test_decode_rejects_damage() {
        let (bytes, _) = encode(&JournalRecord::Stable(ov(1, 1)), 0);

        let mut bad = bytes.clone();
        bad[4] ^= 1;
        assert_eq!(JournalRecord::decode(&bad, 4), Err(EntryError::BadMagic));

        let mut bad = bytes.clone();
        bad[30] ^= 1;
        assert_eq!(JournalRecord::decode(&bad, 4), Err(EntryError::BadCrc));

        assert_eq!(
            JournalRecord::decode(&bytes[..39], 4),
            Err(EntryError::BadSize)
        );
        assert_eq!(JournalRecord::decode(&[0u8; 8], 4), Err(EntryError::Truncated));
        assert_eq!(JournalRecord::decode(&[0u8; 64], 4), Err(EntryError::BadMagic));
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let (mut bytes, _) = encode(&JournalRecord::Delete(ov(1, 1)), 0);
        bytes[6..8].copy_from_slice(&9u16.to_le_bytes());
        let crc = crc32c(&bytes[4..]);
        bytes[..4].copy_from_slice(&crc.to_le_bytes());
        assert_eq!(JournalRecord::decode(&bytes, 4), Err(EntryError::BadType));
    }

    #[test]
    fn test_start_entry() {
        let record = JournalRecord::Start(StartEntry {
            journal_start: 4096,
            version: JOURNAL_VERSION,
        });
        let (mut block, _) = encode(&record, 0);
        block.resize(4096, 0);
        let start = StartEntry::parse(&block).unwrap();
        assert_eq!(start.journal_start, 4096);

        assert!(matches!(
            StartEntry::parse(&[0u8; 4096]),
            Err(Error::CorruptJournal(_))
        ));
    }

    #[test]
    fn test_legacy_start_entry_is_unsupported() {
        let mut block = vec![0u8; 4096];
        {
            let mut buf = &mut block[..];
            buf.put_u32_le(0);
            buf.put_u16_le(JOURNAL_MAGIC);
            buf.put_u16_le(EntryType::Start as u16);
            buf.put_u32_le(LEGACY_START_ENTRY_SIZE as u32);
            buf.put_u32_le(0);
            buf.put_u64_le(4096);
        }
        let crc = crc32c(&block[4..LEGACY_START_ENTRY_SIZE]);
        block[..4].copy_from_slice(&crc.to_le_bytes());

        assert!(matches!(
            StartEntry::parse(&block),
            Err(Error::UnsupportedJournalVersion { found: 0, .. })
        ));
    }

    #[test]
    fn test_wrong_start_version() {
        let record = JournalRecord::Start(StartEntry {
            journal_start: 4096,
            version: 2,
        });
        let (mut block, _) = encode(&record, 0);
        block.resize(4096, 0);
        assert!(matches!(
            StartEntry::parse(&block),
            Err(Error::UnsupportedJournalVersion { found: 2, .. })
        ));
    }
}
