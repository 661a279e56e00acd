//! Live stabilize and rollback batches
//!
//! A batch is admitted against the indices, then one STABLE or ROLLBACK
//! entry per member is appended to the journal. Once the sector writes
//! complete (and the journal is fsynced) the batch is applied to the
//! indices. Admission is retried on every poll while it is deferred.

use crate::io::{check_sync, check_transfer, IoOwner, IoQueue};
use crate::journal::{JournalRecord, SectorWrite, OBJ_VER_ENTRY_SIZE};
use crate::ring::{DeviceKind, IoCompletion, IoRequest, Ring};
use crate::store::{Admission, BlockstoreState, OpId};
use tessera_common::{Error, ObjVerId, Result};
use tracing::debug;

/// What a batch does
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchKind {
    /// Make versions stable
    Stable,
    /// Drop unstable versions above the given ones
    Rollback,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Admit,
    Writing,
    Syncing,
    Done,
}

/// One queued batch
#[derive(Debug)]
pub struct BatchOp {
    id: OpId,
    kind: BatchKind,
    batch: Vec<ObjVerId>,
    stage: Stage,
    waiting: usize,
    /// Journal sectors this batch has writes in flight for
    sectors: Vec<u64>,
    result: Option<Result<()>>,
}

impl BatchOp {
    pub fn new(id: OpId, kind: BatchKind, batch: Vec<ObjVerId>) -> Self {
        Self {
            id,
            kind,
            batch,
            stage: Stage::Admit,
            waiting: 0,
            sectors: Vec::new(),
            result: None,
        }
    }

    pub const fn id(&self) -> OpId {
        self.id
    }

    /// Whether the batch got past admission
    pub fn is_started(&self) -> bool {
        self.stage != Stage::Admit
    }

    pub fn is_done(&self) -> bool {
        self.stage == Stage::Done
    }

    pub fn take_result(&mut self) -> Result<()> {
        self.result
            .take()
            .unwrap_or_else(|| Err(Error::internal(format!("{} finished without a result", self.id))))
    }

    pub fn handle_completion(&mut self, completion: IoCompletion, st: &mut BlockstoreState) -> Result<()> {
        match completion.buf {
            Some(buf) => check_transfer("write journal", st.journal.offset, buf.len(), completion.result)?,
            None => check_sync("fsync journal", completion.result)?,
        }
        self.waiting -= 1;
        if self.waiting == 0 {
            // Completions do not say which sector they were for
            for sector in self.sectors.drain(..) {
                st.journal.finish_sector_write(sector);
            }
        }
        Ok(())
    }

    pub fn advance<R: Ring>(&mut self, st: &mut BlockstoreState, io: &mut IoQueue<R>) -> Result<()> {
        loop {
            if self.waiting > 0 {
                return Ok(());
            }
            match self.stage {
                Stage::Admit => {
                    let admission = match self.kind {
                        BatchKind::Stable => st.admit_stable(&self.batch),
                        BatchKind::Rollback => st.admit_rollback(&self.batch),
                    };
                    match admission {
                        Admission::Defer => return Ok(()),
                        Admission::Complete => self.finish(Ok(())),
                        Admission::Fail(e) => self.finish(Err(e)),
                        Admission::Write => {
                            if !self.write_entries(st, io)? {
                                return Ok(());
                            }
                        }
                    }
                }
                Stage::Writing => {
                    if st.config.disable_journal_fsync {
                        self.apply(st);
                    } else {
                        let fsync = IoRequest::Fsync {
                            device: DeviceKind::Journal,
                        };
                        if io.push(IoOwner::Op(self.id), fsync).is_err() {
                            // Ring is full, retry on the next poll
                            return Ok(());
                        }
                        self.waiting += 1;
                        self.stage = Stage::Syncing;
                    }
                }
                Stage::Syncing => self.apply(st),
                Stage::Done => return Ok(()),
            }
        }
    }

    /// Append the batch to the journal
    ///
    /// Returns `false` when the journal or the ring lacks room.
    fn write_entries<R: Ring>(&mut self, st: &mut BlockstoreState, io: &mut IoQueue<R>) -> Result<bool> {
        let Some(sectors) = st
            .journal
            .check_available(self.batch.len(), OBJ_VER_ENTRY_SIZE, 0)
        else {
            debug!("{} waits for journal space", self.id);
            return Ok(false);
        };
        if st.journal.current_sector_busy(OBJ_VER_ENTRY_SIZE) {
            debug!(
                "{} waits for the write of journal sector {}",
                self.id,
                st.journal.current_sector()
            );
            return Ok(false);
        }
        let needed = sectors + usize::from(st.journal.has_dirty_sector());
        if io.space_left() < needed {
            debug!("{} waits for ring space", self.id);
            return Ok(false);
        }

        for i in 0..self.batch.len() {
            let ov = self.batch[i];
            let record = match self.kind {
                BatchKind::Stable => JournalRecord::Stable(ov),
                BatchKind::Rollback => JournalRecord::Rollback(ov),
            };
            if let Some(closed) = st.journal.append(&record) {
                self.submit_sector(st, io, closed)?;
            }
        }
        let current = st.journal.take_sector_write();
        self.submit_sector(st, io, current)?;
        self.stage = Stage::Writing;
        Ok(true)
    }

    fn submit_sector<R: Ring>(
        &mut self,
        st: &mut BlockstoreState,
        io: &mut IoQueue<R>,
        write: SectorWrite,
    ) -> Result<()> {
        st.journal.start_sector_write(write.sector);
        self.sectors.push(write.sector);
        io.push_or_fail(
            IoOwner::Op(self.id),
            IoRequest::Write {
                device: DeviceKind::Journal,
                offset: write.device_offset,
                buf: write.buf,
            },
            "writing journal entries",
        )?;
        self.waiting += 1;
        Ok(())
    }

    fn apply(&mut self, st: &mut BlockstoreState) {
        for &ov in &self.batch {
            match self.kind {
                BatchKind::Stable => st.mark_stable(ov, false),
                BatchKind::Rollback => st.mark_rolled_back(ov),
            }
        }
        debug!("{} applied {} {:?} entries", self.id, self.batch.len(), self.kind);
        self.finish(Ok(()));
    }

    fn finish(&mut self, result: Result<()>) {
        self.result = Some(result);
        self.stage = Stage::Done;
    }
}
