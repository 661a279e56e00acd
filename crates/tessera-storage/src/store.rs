//! Blockstore aggregate and event loop
//!
//! A [`Blockstore`] owns everything: the ring, the indices, the journal and
//! the bootstrap state machines. It is driven by [`Blockstore::poll`], which
//! never blocks: completions are routed to whoever submitted them, the
//! current phase (metadata recovery, journal recovery, then live operations)
//! advances as far as it can, and new requests are submitted.

use crate::alloc::{Allocator, BlockBitmap};
use crate::batch::{BatchKind, BatchOp};
use crate::flusher::FlushScheduler;
use crate::index::{CleanDb, DirtyDb};
use crate::init_journal::InitJournal;
use crate::init_meta::InitMeta;
use crate::io::{IoOwner, IoQueue};
use crate::journal::Journal;
use crate::layout::DiskLayout;
use crate::ring::{IoCompletion, Ring};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use tessera_common::{BlockstoreConfig, Error, ObjVerId, ObjectId, Result};
use tracing::{debug, info, warn};

/// Identifier of a queued live operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub u64);

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// Verdict of the admission check of a live batch
#[derive(Debug)]
pub enum Admission {
    /// A version is still in flight: retry later
    Defer,
    /// Nothing to write: succeed immediately
    Complete,
    /// Reject the batch
    Fail(Error),
    /// Journal entries must be written
    Write,
}

/// Queued change of one metadata slot
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetaUpdate {
    /// Store a clean entry
    Write {
        oid: ObjectId,
        version: u64,
        bitmap: Vec<u8>,
        ext_bitmap: Vec<u8>,
    },
    /// Clear the slot
    Zero,
}

/// Everything the state machines and operations work on
pub struct BlockstoreState {
    /// Geometry of the three areas
    pub layout: DiskLayout,
    /// Options
    pub config: BlockstoreConfig,
    /// Clean index
    pub clean_db: CleanDb,
    /// Dirty index
    pub dirty_db: DirtyDb,
    /// Data block allocator
    pub alloc: Box<dyn Allocator>,
    /// Newest unstable version per object
    pub unstable_writes: HashMap<ObjectId, u64>,
    /// Bytes charged per inode
    pub inode_space_stats: BTreeMap<u64, u64>,
    /// Journal cursors and writer
    pub journal: Journal,
    /// Background flusher hooks
    pub flusher: Box<dyn FlushScheduler>,
    /// Slot table, when metadata is kept in memory
    pub metadata_buffer: Option<Vec<u8>>,
    /// Both bitmaps of every slot, when metadata is not kept in memory
    pub clean_bitmaps: Vec<u8>,
    /// Slot changes queued by replay, keyed by slot
    pub pending_meta: BTreeMap<u64, MetaUpdate>,
    /// Clean entries installed by metadata recovery
    pub meta_entries_loaded: u64,
    /// Entries applied by journal recovery
    pub journal_entries_loaded: u64,
}

impl BlockstoreState {
    /// Create the empty state for a configuration
    ///
    /// `config.devices.data_size` must already be resolved.
    pub fn new(config: BlockstoreConfig, flusher: Box<dyn FlushScheduler>) -> Result<Self> {
        let layout = DiskLayout::from_config(&config)?;
        let metadata_buffer = config
            .inmemory_metadata
            .then(|| vec![0u8; (layout.meta_len - u64::from(layout.meta_block_size)) as usize]);
        let clean_bitmaps = if config.inmemory_metadata {
            Vec::new()
        } else {
            vec![0u8; layout.block_count as usize * 2 * layout.clean_entry_bitmap_size]
        };
        Ok(Self {
            clean_db: CleanDb::new(config.clean_db_shards),
            dirty_db: DirtyDb::new(),
            alloc: Box::new(BlockBitmap::new(layout.block_count)),
            unstable_writes: HashMap::new(),
            inode_space_stats: BTreeMap::new(),
            journal: Journal::new(&layout, config.inmemory_journal),
            flusher,
            metadata_buffer,
            clean_bitmaps,
            pending_meta: BTreeMap::new(),
            meta_entries_loaded: 0,
            journal_entries_loaded: 0,
            layout,
            config,
        })
    }

    /// Both bitmaps of a slot as stored in its metadata entry
    #[must_use]
    pub fn slot_bitmaps(&self, slot: u64) -> Option<&[u8]> {
        if slot >= self.layout.block_count {
            return None;
        }
        let bitmaps = 2 * self.layout.clean_entry_bitmap_size;
        match self.metadata_buffer.as_deref() {
            Some(table) => {
                let at = self.layout.slot_position(slot) + crate::layout::CLEAN_ENTRY_HEADER_SIZE;
                Some(&table[at..at + bitmaps])
            }
            None => {
                let at = slot as usize * bitmaps;
                Some(&self.clean_bitmaps[at..at + bitmaps])
            }
        }
    }
}

impl fmt::Debug for BlockstoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockstoreState")
            .field("clean", &self.clean_db.len())
            .field("dirty", &self.dirty_db.len())
            .field("free_blocks", &self.alloc.get_free_count())
            .field("journal_used_start", &self.journal.used_start)
            .field("journal_next_free", &self.journal.next_free)
            .finish_non_exhaustive()
    }
}

enum Phase {
    Meta(InitMeta),
    Journal(InitJournal),
    Ready,
}

/// Point-in-time summary of a blockstore
#[derive(Clone, Debug, Serialize)]
pub struct BlockstoreStatus {
    /// Whether recovery finished
    pub ready: bool,
    /// Clean entries installed by metadata recovery
    pub meta_entries_loaded: u64,
    /// Entries applied by journal recovery
    pub journal_entries_loaded: u64,
    /// Free data blocks
    pub free_blocks: u64,
    /// Total data blocks
    pub total_blocks: u64,
    /// Oldest live journal position
    pub journal_used_start: u64,
    /// Journal free cursor
    pub journal_next_free: u64,
    /// Free journal bytes
    pub journal_free_bytes: u64,
    /// Objects in the clean index
    pub clean_objects: usize,
    /// Versions in the dirty index
    pub dirty_entries: usize,
    /// Objects with unstable versions
    pub unstable_objects: usize,
    /// Bytes charged per inode
    pub inode_space: BTreeMap<u64, u64>,
}

/// Crash-consistent blockstore
pub struct Blockstore<R: Ring> {
    state: BlockstoreState,
    io: IoQueue<R>,
    phase: Phase,
    next_op: u64,
    ops: VecDeque<BatchOp>,
    finished: Vec<(OpId, Result<()>)>,
}

impl<R: Ring> Blockstore<R> {
    /// Create a blockstore; recovery starts on the first poll
    pub fn new(config: BlockstoreConfig, ring: R, flusher: Box<dyn FlushScheduler>) -> Result<Self> {
        let state = BlockstoreState::new(config, flusher)?;
        let phase = Phase::Meta(InitMeta::new(&state));
        Ok(Self {
            state,
            io: IoQueue::new(ring),
            phase,
            next_op: 1,
            ops: VecDeque::new(),
            finished: Vec::new(),
        })
    }

    /// Whether recovery finished
    pub const fn is_ready(&self) -> bool {
        matches!(self.phase, Phase::Ready)
    }

    /// Queue a stabilize batch
    pub fn enqueue_stable(&mut self, batch: Vec<ObjVerId>) -> OpId {
        self.enqueue(BatchKind::Stable, batch)
    }

    /// Queue a rollback batch
    pub fn enqueue_rollback(&mut self, batch: Vec<ObjVerId>) -> OpId {
        self.enqueue(BatchKind::Rollback, batch)
    }

    fn enqueue(&mut self, kind: BatchKind, batch: Vec<ObjVerId>) -> OpId {
        let id = OpId(self.next_op);
        self.next_op += 1;
        debug!("Queued {:?} batch {} of {} versions", kind, id, batch.len());
        self.ops.push_back(BatchOp::new(id, kind, batch));
        id
    }

    /// Results of the operations that finished since the last call
    pub fn take_finished(&mut self) -> Vec<(OpId, Result<()>)> {
        std::mem::take(&mut self.finished)
    }

    /// Make as much progress as possible without blocking
    ///
    /// Any error is fatal for the blockstore.
    pub fn poll(&mut self) -> Result<()> {
        for (owner, completion) in self.io.drain() {
            self.dispatch(owner, completion)?;
        }
        self.advance()?;
        self.io.submit()
    }

    fn dispatch(&mut self, owner: IoOwner, completion: IoCompletion) -> Result<()> {
        match (owner, &mut self.phase) {
            (IoOwner::Meta(tag), Phase::Meta(init)) => {
                init.handle_completion(tag, completion, &mut self.state)
            }
            (IoOwner::Journal(tag), Phase::Journal(init)) => {
                init.handle_completion(tag, completion, &mut self.state)
            }
            (IoOwner::Op(id), _) => match self.ops.iter_mut().find(|op| op.id() == id) {
                Some(op) => op.handle_completion(completion, &mut self.state),
                None => {
                    warn!("Completion for unknown operation {}", id);
                    Ok(())
                }
            },
            (owner, _) => Err(Error::internal(format!(
                "completion for {owner:?} outside of its recovery phase"
            ))),
        }
    }

    fn advance(&mut self) -> Result<()> {
        loop {
            match &mut self.phase {
                Phase::Meta(init) => {
                    if !init.advance(&mut self.state, &mut self.io)? {
                        return Ok(());
                    }
                    self.phase = Phase::Journal(InitJournal::new(&self.state));
                }
                Phase::Journal(init) => {
                    if !init.advance(&mut self.state, &mut self.io)? {
                        return Ok(());
                    }
                    info!("Blockstore is ready");
                    self.phase = Phase::Ready;
                }
                Phase::Ready => return self.advance_ops(),
            }
        }
    }

    /// Start queued operations in order and move started ones forward
    fn advance_ops(&mut self) -> Result<()> {
        let mut blocked = false;
        for op in &mut self.ops {
            if !op.is_started() && blocked {
                continue;
            }
            op.advance(&mut self.state, &mut self.io)?;
            if !op.is_started() {
                blocked = true;
            }
        }
        while let Some(pos) = self.ops.iter().position(BatchOp::is_done) {
            if let Some(mut op) = self.ops.remove(pos) {
                let result = op.take_result();
                if let Err(e) = &result {
                    debug!("{} failed: {}", op.id(), e);
                }
                self.finished.push((op.id(), result));
            }
        }
        Ok(())
    }

    /// Poll until recovery is complete
    pub fn run_until_ready(&mut self) -> Result<()> {
        loop {
            self.poll()?;
            if self.is_ready() {
                return Ok(());
            }
            if self.io.in_flight() == 0 {
                return Err(Error::internal("recovery stalled with no I/O in flight"));
            }
            self.io.wait()?;
        }
    }

    /// Poll until no queued operation can make progress
    ///
    /// Operations still deferred are left in the queue.
    pub fn run_until_idle(&mut self) -> Result<()> {
        self.run_until_ready()?;
        loop {
            self.poll()?;
            if self.ops.is_empty() || self.io.in_flight() == 0 {
                return Ok(());
            }
            self.io.wait()?;
        }
    }

    /// Number of queued operations
    pub fn pending_ops(&self) -> usize {
        self.ops.len()
    }

    /// Clean index
    pub const fn clean_db(&self) -> &CleanDb {
        &self.state.clean_db
    }

    /// Dirty index
    pub const fn dirty_db(&self) -> &DirtyDb {
        &self.state.dirty_db
    }

    /// Dirty index, for the write path
    pub const fn dirty_db_mut(&mut self) -> &mut DirtyDb {
        &mut self.state.dirty_db
    }

    /// Data block allocator
    pub fn allocator(&self) -> &dyn Allocator {
        self.state.alloc.as_ref()
    }

    /// Journal cursors
    pub const fn journal(&self) -> &Journal {
        &self.state.journal
    }

    /// Geometry
    pub const fn layout(&self) -> &DiskLayout {
        &self.state.layout
    }

    /// Bytes charged per inode
    pub const fn stats(&self) -> &BTreeMap<u64, u64> {
        &self.state.inode_space_stats
    }

    /// Newest unstable version per object
    pub const fn unstable_writes(&self) -> &HashMap<ObjectId, u64> {
        &self.state.unstable_writes
    }

    /// Shared state
    pub const fn state(&self) -> &BlockstoreState {
        &self.state
    }

    /// Underlying ring
    pub const fn ring(&self) -> &R {
        self.io.ring()
    }

    /// Point-in-time summary
    pub fn status(&self) -> BlockstoreStatus {
        let st = &self.state;
        BlockstoreStatus {
            ready: self.is_ready(),
            meta_entries_loaded: st.meta_entries_loaded,
            journal_entries_loaded: st.journal_entries_loaded,
            free_blocks: st.alloc.get_free_count(),
            total_blocks: st.layout.block_count,
            journal_used_start: st.journal.used_start,
            journal_next_free: st.journal.next_free,
            journal_free_bytes: st.journal.free_space(),
            clean_objects: st.clean_db.len(),
            dirty_entries: st.dirty_db.len(),
            unstable_objects: st.unstable_writes.len(),
            inode_space: st.inode_space_stats.clone(),
        }
    }
}
