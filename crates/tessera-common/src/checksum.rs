//! Checksum utilities
//!
//! Journal entries and small-write payloads are protected with CRC32C.

/// CRC32C of a byte slice
#[must_use]
pub fn crc32c(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// Continue a CRC32C over more data
#[must_use]
pub fn crc32c_append(crc: u32, data: &[u8]) -> u32 {
    crc32c::crc32c_append(crc, data)
}

/// Whether every byte of the slice is zero
#[must_use]
pub fn is_zero(data: &[u8]) -> bool {
    data.iter().all(|&b| b == 0)
}

/// Streaming CRC32C over a payload that arrives in pieces
///
/// Tracks how many bytes were fed so callers can tell whether the whole
/// payload was covered.
#[derive(Clone, Copy, Debug, Default)]
pub struct DataCrc {
    crc: u32,
    covered: u64,
}

impl DataCrc {
    /// Start an empty checksum
    #[must_use]
    pub const fn new() -> Self {
        Self { crc: 0, covered: 0 }
    }

    /// Feed the next piece of the payload
    pub fn update(&mut self, data: &[u8]) {
        self.crc = crc32c_append(self.crc, data);
        self.covered += data.len() as u64;
    }

    /// Number of bytes fed so far
    #[must_use]
    pub const fn covered(&self) -> u64 {
        self.covered
    }

    /// Checksum of everything fed so far
    #[must_use]
    pub const fn value(&self) -> u32 {
        self.crc
    }
}
