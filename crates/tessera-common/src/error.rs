//! Error types for Tessera
//!
//! Bootstrap failures (bad configuration, corrupt metadata, unresolvable
//! inconsistencies, I/O errors) are fatal: the caller is expected to log
//! them and stop the process. Admission errors from live operations are
//! ordinary results handed back to whoever queued the operation.

use crate::types::ObjVerId;
use thiserror::Error;

/// Common result type for Tessera operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Tessera
#[derive(Debug, Error)]
pub enum Error {
    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("metadata is corrupt: {0}")]
    CorruptMetadata(String),

    #[error("metadata was created with {stored}, but the configuration says {configured}")]
    MetadataMismatch { stored: String, configured: String },

    #[error("journal is corrupt: {0}")]
    CorruptJournal(String),

    #[error("journal version {found} is not supported (this build supports version {supported})")]
    UnsupportedJournalVersion { found: u64, supported: u64 },

    // Internal consistency errors
    #[error("internal consistency violation: {0}")]
    InternalConsistency(String),

    // I/O errors
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("{op} at offset {offset} failed with errno {errno}")]
    Io {
        op: &'static str,
        offset: u64,
        errno: i32,
    },

    #[error("short {op} at offset {offset}: expected {expected} bytes, got {actual}")]
    ShortIo {
        op: &'static str,
        offset: u64,
        expected: u64,
        actual: u64,
    },

    #[error("I/O ring is full while {0}")]
    RingFull(&'static str),

    #[error("storage error: {0}")]
    Storage(String),

    // Live operation admission errors
    #[error("no such version: {0}")]
    NoSuchVersion(ObjVerId),

    #[error("version is not synced yet: {0}")]
    NotSynced(ObjVerId),

    #[error("cannot roll back a stable version above {0}")]
    RollbackStable(ObjVerId),
}

impl Error {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a corrupt metadata error
    pub fn corrupt_metadata(msg: impl Into<String>) -> Self {
        Self::CorruptMetadata(msg.into())
    }

    /// Create a corrupt journal error
    pub fn corrupt_journal(msg: impl Into<String>) -> Self {
        Self::CorruptJournal(msg.into())
    }

    /// Create an internal consistency error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::InternalConsistency(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Build an error from a negative ring result
    #[must_use]
    pub fn from_ring_result(op: &'static str, offset: u64, result: i64) -> Self {
        Self::Io {
            op,
            offset,
            errno: i32::try_from(-result).unwrap_or(libc::EIO),
        }
    }

    /// Whether the error must stop the process
    ///
    /// Everything except the admission errors of live operations is fatal.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::NoSuchVersion(_) | Self::NotSynced(_) | Self::RollbackStable(_)
        )
    }

    /// Negative errno reported to operation callers
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::NoSuchVersion(_) => -libc::ENOENT,
            Self::NotSynced(_) | Self::RollbackStable(_) => -libc::EBUSY,
            Self::Configuration(_) => -libc::EINVAL,
            Self::Io { errno, .. } => -errno,
            Self::DiskIo(e) => -e.raw_os_error().unwrap_or(libc::EIO),
            _ => -libc::EIO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ObjectId;

    #[test]
    fn test_admission_errors_are_not_fatal() {
        let ov = ObjVerId::new(ObjectId::new(1, 0), 3);
        assert!(!Error::NoSuchVersion(ov).is_fatal());
        assert!(!Error::NotSynced(ov).is_fatal());
        assert!(!Error::RollbackStable(ov).is_fatal());
        assert!(Error::internal("double allocation").is_fatal());
        assert!(Error::corrupt_journal("bad start").is_fatal());
    }

    #[test]
    fn test_errno_mapping() {
        let ov = ObjVerId::new(ObjectId::new(1, 0), 3);
        assert_eq!(Error::NoSuchVersion(ov).errno(), -libc::ENOENT);
        assert_eq!(Error::NotSynced(ov).errno(), -libc::EBUSY);
        assert_eq!(
            Error::from_ring_result("read", 4096, -i64::from(libc::EIO)).errno(),
            -libc::EIO
        );
    }

    #[test]
    fn test_ring_result_message() {
        let err = Error::from_ring_result("journal read", 8192, -5);
        assert_eq!(
            err.to_string(),
            "journal read at offset 8192 failed with errno 5"
        );
    }
}
