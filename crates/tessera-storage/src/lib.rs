//! Tessera Storage - Crash-consistent blockstore
//!
//! This crate implements the blockstore core:
//! - On-disk layout of the metadata, journal and data areas
//! - Metadata recovery (clean index rebuild)
//! - Journal recovery (dirty index replay and compaction)
//! - Stabilization and rollback of journaled versions
//! - Submission/completion ring over raw devices

pub mod alloc;
mod batch;
pub mod device;
pub mod flusher;
pub mod index;
pub mod init_journal;
pub mod init_meta;
pub mod io;
pub mod journal;
pub mod layout;
pub mod raw_io;
pub mod ring;
mod rollback;
mod stable;
pub mod store;

#[cfg(test)]
mod test_util;

// Re-exports
pub use alloc::{Allocator, BlockBitmap};
pub use batch::BatchKind;
pub use device::{BlockDevice, FaultOn, MemDevice};
pub use flusher::{FlushScheduler, NoopFlusher};
pub use index::{
    CleanDb, CleanEntry, DirtyDb, DirtyEntry, EntryBitmap, EntryKind, EntryState, Workflow,
    UNRESOLVED_LOCATION,
};
pub use journal::{Journal, JournalImage, JournalRecord};
pub use layout::{CleanDiskEntry, DiskLayout, MetaSuperblock};
pub use raw_io::{AlignedBuffer, RawFile, ALIGNMENT};
pub use ring::{BlockingRing, CompletionOrder, DeviceKind, IoCompletion, IoRequest, Ring};
pub use store::{Blockstore, BlockstoreState, BlockstoreStatus, OpId};
