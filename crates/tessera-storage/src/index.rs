//! Object/version index
//!
//! Two maps describe every object the store knows about:
//! - the clean index: the version whose data sits in its final data block
//!   and whose slot is written to the metadata area
//! - the dirty index: versions that only exist in the journal so far,
//!   ordered by `(oid, version)` so the history of one object is contiguous

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use tessera_common::{ObjVerId, ObjectId};
use xxhash_rust::xxh64::xxh64;

/// Location of a replayed big write whose block was already allocated
pub const UNRESOLVED_LOCATION: u64 = u64::MAX;

/// Entry of the clean index
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct CleanEntry {
    /// Version stored in the data block
    pub version: u64,
    /// Data block index (also the metadata slot index)
    pub location: u64,
}

/// Clean index, split into shards by a hash of the object id
#[derive(Debug)]
pub struct CleanDb {
    shards: Vec<BTreeMap<ObjectId, CleanEntry>>,
}

impl CleanDb {
    /// Create an empty index with `shard_count` shards
    #[must_use]
    pub fn new(shard_count: u32) -> Self {
        Self {
            shards: (0..shard_count.max(1)).map(|_| BTreeMap::new()).collect(),
        }
    }

    /// Shard holding `oid`
    #[must_use]
    pub fn shard_of(&self, oid: &ObjectId) -> usize {
        (xxh64(&oid.to_le_bytes(), 0) % self.shards.len() as u64) as usize
    }

    /// Number of shards
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Look up an object
    #[must_use]
    pub fn find(&self, oid: &ObjectId) -> Option<&CleanEntry> {
        self.shards[self.shard_of(oid)].get(oid)
    }

    /// Insert or replace an object, returning the previous entry
    pub fn emplace(&mut self, oid: ObjectId, entry: CleanEntry) -> Option<CleanEntry> {
        let shard = self.shard_of(&oid);
        self.shards[shard].insert(oid, entry)
    }

    /// Remove an object
    pub fn remove(&mut self, oid: &ObjectId) -> Option<CleanEntry> {
        let shard = self.shard_of(oid);
        self.shards[shard].remove(oid)
    }

    /// Total number of objects
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(BTreeMap::len).sum()
    }

    /// Whether the index is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(BTreeMap::is_empty)
    }

    /// Iterate over all objects, shard by shard
    pub fn iter(&self) -> impl Iterator<Item = (&ObjectId, &CleanEntry)> {
        self.shards.iter().flat_map(BTreeMap::iter)
    }

    /// All objects in oid order
    #[must_use]
    pub fn to_sorted_vec(&self) -> Vec<(ObjectId, CleanEntry)> {
        let mut all: Vec<_> = self.iter().map(|(k, v)| (*k, *v)).collect();
        all.sort_unstable_by_key(|(k, _)| *k);
        all
    }
}

/// What a dirty entry writes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum EntryKind {
    /// Data lives in the journal
    SmallWrite,
    /// Data lives in its own data block
    BigWrite,
    /// Tombstone
    Delete,
}

/// How far a dirty entry has progressed
///
/// Ordered: every state compares greater than the states before it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Workflow {
    /// Submitted but not yet on the device
    InFlight,
    /// On the device, not yet fsynced
    Written,
    /// Durable, but may still be rolled back
    Synced,
    /// Durable and committed
    Stable,
}

/// Type and workflow state of a dirty entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct EntryState {
    /// What the entry writes
    pub kind: EntryKind,
    /// Progress of the entry
    pub workflow: Workflow,
}

impl EntryState {
    /// Create a state
    #[must_use]
    pub const fn new(kind: EntryKind, workflow: Workflow) -> Self {
        Self { kind, workflow }
    }

    /// Still on its way to the device
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        self.workflow == Workflow::InFlight
    }

    /// Synced or stable
    #[must_use]
    pub fn is_synced(&self) -> bool {
        self.workflow >= Workflow::Synced
    }

    /// Committed
    #[must_use]
    pub fn is_stable(&self) -> bool {
        self.workflow == Workflow::Stable
    }

    /// Big write
    #[must_use]
    pub fn is_big_write(&self) -> bool {
        self.kind == EntryKind::BigWrite
    }

    /// Tombstone
    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.kind == EntryKind::Delete
    }
}

/// Largest bitmap kept inline
const INLINE_BITMAP_BYTES: usize = std::mem::size_of::<usize>();

/// Per-entry bitmap, stored inline when it fits in a pointer
#[derive(Clone, PartialEq, Eq)]
pub enum EntryBitmap {
    /// Up to [`EntryBitmap::INLINE_CAPACITY`] bytes kept in place
    Inline { len: u8, bytes: [u8; INLINE_BITMAP_BYTES] },
    /// Larger bitmaps
    Heap(Box<[u8]>),
}

impl EntryBitmap {
    /// Largest bitmap kept inline
    pub const INLINE_CAPACITY: usize = INLINE_BITMAP_BYTES;

    /// Copy a bitmap
    #[must_use]
    pub fn from_slice(data: &[u8]) -> Self {
        if data.len() <= Self::INLINE_CAPACITY {
            let mut bytes = [0u8; Self::INLINE_CAPACITY];
            bytes[..data.len()].copy_from_slice(data);
            Self::Inline {
                len: data.len() as u8,
                bytes,
            }
        } else {
            Self::Heap(data.into())
        }
    }

    /// Bitmap bytes
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Self::Inline { len, bytes } => &bytes[..usize::from(*len)],
            Self::Heap(data) => data,
        }
    }

    /// Whether the bitmap is stored inline
    #[must_use]
    pub const fn is_inline(&self) -> bool {
        matches!(self, Self::Inline { .. })
    }
}

impl Default for EntryBitmap {
    fn default() -> Self {
        Self::from_slice(&[])
    }
}

impl fmt::Debug for EntryBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryBitmap(")?;
        for b in self.as_slice() {
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}

/// Entry of the dirty index
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirtyEntry {
    /// Type and progress
    pub state: EntryState,
    /// Journal byte offset of small-write data, data block index of a big
    /// write, [`UNRESOLVED_LOCATION`] for an unresolved big write, 0 for deletes
    pub location: u64,
    /// Offset of the write inside the object
    pub offset: u32,
    /// Length of the write
    pub len: u32,
    /// Journal sector holding the entry
    pub journal_sector: u64,
    /// Caller bitmap carried by the entry
    pub bitmap: EntryBitmap,
}

/// Dirty index ordered by `(oid, version)`
#[derive(Debug, Default)]
pub struct DirtyDb {
    entries: BTreeMap<ObjVerId, DirtyEntry>,
}

impl DirtyDb {
    /// Create an empty index
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up one version
    #[must_use]
    pub fn get(&self, ov: &ObjVerId) -> Option<&DirtyEntry> {
        self.entries.get(ov)
    }

    /// Look up one version for modification
    pub fn get_mut(&mut self, ov: &ObjVerId) -> Option<&mut DirtyEntry> {
        self.entries.get_mut(ov)
    }

    /// Whether a version is present
    #[must_use]
    pub fn contains(&self, ov: &ObjVerId) -> bool {
        self.entries.contains_key(ov)
    }

    /// Insert a version unless it is already present
    ///
    /// Returns `true` when the entry was inserted.
    pub fn emplace(&mut self, ov: ObjVerId, entry: DirtyEntry) -> bool {
        match self.entries.entry(ov) {
            std::collections::btree_map::Entry::Occupied(_) => false,
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(entry);
                true
            }
        }
    }

    /// Remove one version
    pub fn remove(&mut self, ov: &ObjVerId) -> Option<DirtyEntry> {
        self.entries.remove(ov)
    }

    /// Newest dirty version of an object
    #[must_use]
    pub fn latest(&self, oid: ObjectId) -> Option<(ObjVerId, &DirtyEntry)> {
        self.entries
            .range(ObjVerId::first_of(oid)..=ObjVerId::last_of(oid))
            .next_back()
            .map(|(k, v)| (*k, v))
    }

    /// Version of the same object directly before `ov`
    #[must_use]
    pub fn previous(&self, ov: &ObjVerId) -> Option<(ObjVerId, &DirtyEntry)> {
        self.entries
            .range((Bound::Included(ObjVerId::first_of(ov.oid)), Bound::Excluded(*ov)))
            .next_back()
            .map(|(k, v)| (*k, v))
    }

    /// All versions of an object older than `ov`, oldest first
    #[must_use]
    pub fn older_than(&self, ov: &ObjVerId) -> Vec<ObjVerId> {
        self.entries
            .range((Bound::Included(ObjVerId::first_of(ov.oid)), Bound::Excluded(*ov)))
            .map(|(k, _)| *k)
            .collect()
    }

    /// All versions of an object up to and including `ov`, oldest first
    #[must_use]
    pub fn up_to(&self, ov: &ObjVerId) -> Vec<ObjVerId> {
        self.entries
            .range(ObjVerId::first_of(ov.oid)..=*ov)
            .map(|(k, _)| *k)
            .collect()
    }

    /// All versions of an object, oldest first
    pub fn versions(&self, oid: ObjectId) -> impl DoubleEndedIterator<Item = (&ObjVerId, &DirtyEntry)> {
        self.entries
            .range(ObjVerId::first_of(oid)..=ObjVerId::last_of(oid))
    }

    /// Iterate in `(oid, version)` order
    pub fn iter(&self) -> impl Iterator<Item = (&ObjVerId, &DirtyEntry)> {
        self.entries.iter()
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
