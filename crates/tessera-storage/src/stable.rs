//! Stabilization
//!
//! A synced version becomes stable once a STABLE entry for it is durable in
//! the journal. Promotion walks the object's dirty run backward from the
//! version, so stabilizing `v` also commits every synced version below it.
//!
//! Space is charged when a big write or a delete becomes stable, not when it
//! is written.
//!
//! During replay superseded history is forgotten: a stable big write or
//! delete drops every older dirty entry of its object and is folded into the
//! clean index, queueing the matching metadata slot change.

use crate::index::{CleanEntry, EntryKind, Workflow, UNRESOLVED_LOCATION};
use crate::store::{Admission, BlockstoreState, MetaUpdate};
use tessera_common::{Error, ObjVerId};
use tracing::debug;

impl BlockstoreState {
    /// Promote `ov` and the synced versions below it to stable
    ///
    /// With `forget_dirty` a stable big write or delete supersedes the older
    /// history of its object and is folded into the clean index.
    pub fn mark_stable(&mut self, ov: ObjVerId, forget_dirty: bool) {
        if self.dirty_db.contains(&ov) {
            let mut cur = ov;
            loop {
                let Some(entry) = self.dirty_db.get_mut(&cur) else {
                    break;
                };
                let was_stable = entry.state.is_stable();
                let kind = entry.state.kind;
                if entry.state.workflow == Workflow::Synced {
                    entry.state.workflow = Workflow::Stable;
                    match kind {
                        EntryKind::BigWrite => {
                            let exists = match self.dirty_db.previous(&cur) {
                                Some((_, prev)) => !prev.state.is_delete(),
                                None => self.clean_db.find(&cur.oid).is_some(),
                            };
                            if !exists {
                                *self.inode_space_stats.entry(cur.oid.inode).or_default() +=
                                    u64::from(self.layout.data_block_size);
                            }
                        }
                        EntryKind::Delete => self.release_space(cur.oid.inode),
                        EntryKind::SmallWrite => {}
                    }
                }
                if forget_dirty && kind != EntryKind::SmallWrite {
                    let older = self.dirty_db.older_than(&cur);
                    let clean_loc = self
                        .clean_db
                        .find(&cur.oid)
                        .map_or(UNRESOLVED_LOCATION, |c| c.location);
                    self.erase_dirty(&older, clean_loc);
                    self.fold_into_clean(cur);
                    break;
                }
                if was_stable {
                    break;
                }
                match self.dirty_db.previous(&cur) {
                    Some((prev, _)) => cur = prev,
                    None => break,
                }
            }
            if self.dirty_db.contains(&ov) {
                self.flusher.enqueue_flush(ov);
            }
        }
        if self
            .unstable_writes
            .get(&ov.oid)
            .is_some_and(|&v| v <= ov.version)
        {
            self.unstable_writes.remove(&ov.oid);
        }
    }

    /// Remove dirty entries
    ///
    /// Big-write blocks are freed unless they are `clean_loc` (still
    /// referenced by the clean index) or were never resolved.
    pub fn erase_dirty(&mut self, keys: &[ObjVerId], clean_loc: u64) {
        for ov in keys {
            let Some(entry) = self.dirty_db.remove(ov) else {
                continue;
            };
            if entry.state.is_big_write()
                && entry.location != clean_loc
                && entry.location != UNRESOLVED_LOCATION
            {
                debug!("Free block {} from {} (dirty entry)", entry.location, ov);
                self.alloc.set(entry.location, false);
            }
            if let Some(refs) = self.journal.used_sectors.get_mut(&entry.journal_sector) {
                *refs = refs.saturating_sub(1);
                if *refs == 0 {
                    self.journal.used_sectors.remove(&entry.journal_sector);
                    self.flusher.mark_trim_possible();
                }
            }
        }
    }

    /// Forget the whole dirty run of an object up to and including `last`
    pub fn erase_dirty_object(&mut self, last: ObjVerId) {
        let oid = last.oid;
        let keys = self.dirty_db.up_to(&last);
        let counted = self.dirty_db.get(&last).is_some_and(|e| !e.state.is_delete())
            && keys.iter().any(|k| {
                self.dirty_db
                    .get(k)
                    .is_some_and(|e| e.state.is_big_write() && e.state.is_stable())
            });
        let clean_loc = self.clean_db.find(&oid).map(|c| c.location);
        if counted && clean_loc.is_none() {
            self.release_space(oid.inode);
        }
        self.erase_dirty(&keys, clean_loc.unwrap_or(UNRESOLVED_LOCATION));
        self.flusher.remove_flush(oid);
    }

    /// Move a stable big write or delete from the dirty to the clean index
    fn fold_into_clean(&mut self, ov: ObjVerId) {
        let Some(entry) = self.dirty_db.get(&ov).cloned() else {
            return;
        };
        if !entry.state.is_stable() {
            return;
        }
        match entry.state.kind {
            EntryKind::BigWrite => {
                if entry.location == UNRESOLVED_LOCATION {
                    return;
                }
                self.erase_dirty(&[ov], entry.location);
                let previous = self.clean_db.emplace(
                    ov.oid,
                    CleanEntry {
                        version: ov.version,
                        location: entry.location,
                    },
                );
                if let Some(old) = previous.filter(|old| old.location != entry.location) {
                    self.alloc.set(old.location, false);
                    self.pending_meta.insert(old.location, MetaUpdate::Zero);
                }
                debug!("Fold {} into clean block {}", ov, entry.location);
                self.pending_meta.insert(
                    entry.location,
                    MetaUpdate::Write {
                        oid: ov.oid,
                        version: ov.version,
                        bitmap: self.granule_bitmap(entry.offset, entry.len),
                        ext_bitmap: entry.bitmap.as_slice().to_vec(),
                    },
                );
            }
            EntryKind::Delete => {
                self.erase_dirty(&[ov], UNRESOLVED_LOCATION);
                if let Some(old) = self.clean_db.remove(&ov.oid) {
                    debug!("Fold delete {}, freeing block {}", ov, old.location);
                    self.alloc.set(old.location, false);
                    self.pending_meta.insert(old.location, MetaUpdate::Zero);
                }
            }
            EntryKind::SmallWrite => {}
        }
    }

    /// Bitmap of the granules covered by `[offset, offset + len)`
    pub(crate) fn granule_bitmap(&self, offset: u32, len: u32) -> Vec<u8> {
        let mut bitmap = vec![0u8; self.layout.clean_entry_bitmap_size];
        let granularity = self.layout.bitmap_granularity;
        let first = offset / granularity;
        let end = (offset + len).div_ceil(granularity);
        for bit in first..end {
            let byte = (bit / 8) as usize;
            if byte < bitmap.len() {
                bitmap[byte] |= 1 << (bit % 8);
            }
        }
        bitmap
    }

    /// Give back one data block of space charged to `inode`
    pub(crate) fn release_space(&mut self, inode: u64) {
        let block = u64::from(self.layout.data_block_size);
        match self.inode_space_stats.get_mut(&inode) {
            Some(used) if *used > block => *used -= block,
            _ => {
                self.inode_space_stats.remove(&inode);
            }
        }
    }

    /// Decide what a live stabilize batch has to do
    pub(crate) fn admit_stable(&self, batch: &[ObjVerId]) -> Admission {
        let mut todo = 0;
        for ov in batch {
            match self.dirty_db.get(ov) {
                None => {
                    let stable = self
                        .clean_db
                        .find(&ov.oid)
                        .is_some_and(|c| c.version >= ov.version);
                    if !stable {
                        return Admission::Fail(Error::NoSuchVersion(*ov));
                    }
                }
                Some(entry) if entry.state.is_in_flight() => return Admission::Defer,
                Some(entry) if !entry.state.is_synced() => {
                    return Admission::Fail(Error::NotSynced(*ov));
                }
                Some(entry) if !entry.state.is_stable() => todo += 1,
                Some(_) => {}
            }
        }
        if todo == 0 {
            Admission::Complete
        } else {
            Admission::Write
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{DirtyEntry, EntryBitmap, EntryState};
    use crate::journal::{JournalImage, JournalRecord};
    use crate::ring::BlockingRing;
    use crate::store::Blockstore;
    use crate::test_util::{big_write, boot, ov, small_layout, stable, state, Devices};
    use std::collections::BTreeMap;
    use tessera_common::ObjectId;

    fn dirty(kind: EntryKind, workflow: Workflow, location: u64) -> DirtyEntry {
        DirtyEntry {
            state: EntryState::new(kind, workflow),
            location,
            offset: 0,
            len: 128 * 1024,
            journal_sector: 4096,
            bitmap: EntryBitmap::from_slice(&[0xff; 4]),
        }
    }

    #[test]
    fn test_mark_stable_walks_back() {
        let (mut st, flusher) = state();
        st.dirty_db.emplace(ov(1, 1), dirty(EntryKind::SmallWrite, Workflow::Synced, 8192));
        st.dirty_db.emplace(ov(1, 2), dirty(EntryKind::SmallWrite, Workflow::Synced, 12288));
        st.dirty_db.emplace(ov(1, 3), dirty(EntryKind::SmallWrite, Workflow::Synced, 16384));
        st.unstable_writes.insert(ObjectId::new(1, 0), 3);

        st.mark_stable(ov(1, 2), false);
        assert!(st.dirty_db.get(&ov(1, 1)).unwrap().state.is_stable());
        assert!(st.dirty_db.get(&ov(1, 2)).unwrap().state.is_stable());
        assert!(!st.dirty_db.get(&ov(1, 3)).unwrap().state.is_stable());
        // The newest unstable version is above the stabilized one
        assert_eq!(st.unstable_writes.get(&ObjectId::new(1, 0)), Some(&3));
        assert_eq!(flusher.flushes(), vec![ov(1, 2)]);

        st.mark_stable(ov(1, 3), false);
        assert!(st.unstable_writes.is_empty());
    }

    #[test]
    fn test_big_write_space_accounting() {
        let (mut st, _) = state();
        st.dirty_db.emplace(ov(1, 1), dirty(EntryKind::BigWrite, Workflow::Synced, 5));
        st.alloc.set(5, true);
        st.mark_stable(ov(1, 1), false);
        assert_eq!(st.inode_space_stats.get(&1), Some(&(128 * 1024)));

        // Overwriting an existing object does not charge again
        st.dirty_db.emplace(ov(1, 2), dirty(EntryKind::BigWrite, Workflow::Synced, 6));
        st.alloc.set(6, true);
        st.mark_stable(ov(1, 2), false);
        assert_eq!(st.inode_space_stats.get(&1), Some(&(128 * 1024)));

        st.dirty_db.emplace(ov(1, 3), dirty(EntryKind::Delete, Workflow::Synced, 0));
        st.mark_stable(ov(1, 3), false);
        assert!(st.inode_space_stats.get(&1).is_none());
    }

    #[test]
    fn test_forget_folds_big_write() {
        let (mut st, flusher) = state();
        st.clean_db.emplace(
            ObjectId::new(1, 0),
            CleanEntry {
                version: 1,
                location: 3,
            },
        );
        st.alloc.set(3, true);
        st.journal.used_sectors.insert(4096, 2);
        st.dirty_db.emplace(ov(1, 2), dirty(EntryKind::BigWrite, Workflow::Synced, 7));
        st.dirty_db.emplace(ov(1, 3), dirty(EntryKind::BigWrite, Workflow::Synced, 9));
        st.alloc.set(7, true);
        st.alloc.set(9, true);

        st.mark_stable(ov(1, 3), true);

        assert!(st.dirty_db.is_empty());
        assert_eq!(
            st.clean_db.find(&ObjectId::new(1, 0)),
            Some(&CleanEntry {
                version: 3,
                location: 9
            })
        );
        // Both the superseded dirty block and the old clean block are free
        assert!(!st.alloc.get(7));
        assert!(!st.alloc.get(3));
        assert!(st.alloc.get(9));
        assert!(st.journal.used_sectors.is_empty());
        assert_eq!(flusher.trims(), 1);
        assert!(flusher.flushes().is_empty());

        assert_eq!(st.pending_meta.get(&3), Some(&MetaUpdate::Zero));
        let Some(MetaUpdate::Write { version, bitmap, .. }) = st.pending_meta.get(&9) else {
            panic!("expected a slot write");
        };
        assert_eq!(*version, 3);
        assert_eq!(bitmap, &vec![0xff; 4]);
    }

    #[test]
    fn test_forget_keeps_unresolved_big_write() {
        let (mut st, _) = state();
        st.dirty_db.emplace(
            ov(1, 1),
            dirty(EntryKind::BigWrite, Workflow::Synced, UNRESOLVED_LOCATION),
        );
        st.mark_stable(ov(1, 1), true);
        let entry = st.dirty_db.get(&ov(1, 1)).unwrap();
        assert!(entry.state.is_stable());
        assert!(st.clean_db.is_empty());
        assert!(st.pending_meta.is_empty());
    }

    #[test]
    fn test_granule_bitmap() {
        let (st, _) = state();
        assert_eq!(st.granule_bitmap(0, 4096), vec![1, 0, 0, 0]);
        assert_eq!(st.granule_bitmap(4096, 8192), vec![6, 0, 0, 0]);
        assert_eq!(st.granule_bitmap(0, 128 * 1024), vec![0xff; 4]);
        assert_eq!(st.granule_bitmap(8192, 1), vec![4, 0, 0, 0]);
    }

    #[test]
    fn test_admission() {
        let (mut st, _) = state();
        st.clean_db.emplace(
            ObjectId::new(9, 0),
            CleanEntry {
                version: 4,
                location: 1,
            },
        );
        st.dirty_db.emplace(ov(1, 1), dirty(EntryKind::SmallWrite, Workflow::Written, 8192));
        st.dirty_db.emplace(ov(2, 1), dirty(EntryKind::SmallWrite, Workflow::InFlight, 8192));
        st.dirty_db.emplace(ov(3, 1), dirty(EntryKind::SmallWrite, Workflow::Synced, 8192));
        st.dirty_db.emplace(ov(4, 1), dirty(EntryKind::SmallWrite, Workflow::Stable, 8192));

        assert!(matches!(st.admit_stable(&[ov(9, 3)]), Admission::Complete));
        assert!(matches!(st.admit_stable(&[ov(4, 1), ov(9, 4)]), Admission::Complete));
        assert!(matches!(
            st.admit_stable(&[ov(9, 5)]),
            Admission::Fail(Error::NoSuchVersion(_))
        ));
        assert!(matches!(
            st.admit_stable(&[ov(1, 1)]),
            Admission::Fail(Error::NotSynced(_))
        ));
        assert!(matches!(st.admit_stable(&[ov(3, 1), ov(2, 1)]), Admission::Defer));
        assert!(matches!(st.admit_stable(&[ov(3, 1), ov(4, 1)]), Admission::Write));
    }

    #[test]
    fn test_stabilize_is_monotonic() {
        let (mut st, _) = state();
        st.dirty_db.emplace(ov(1, 1), dirty(EntryKind::BigWrite, Workflow::Synced, 5));
        st.dirty_db.emplace(ov(1, 2), dirty(EntryKind::SmallWrite, Workflow::Synced, 8192));
        st.dirty_db.emplace(ov(1, 3), dirty(EntryKind::SmallWrite, Workflow::Synced, 12288));
        st.alloc.set(5, true);

        st.mark_stable(ov(1, 2), false);
        let charged = st.inode_space_stats.clone();
        assert_eq!(charged.get(&1), Some(&(128 * 1024)));

        // Repeating or going below an already stable version changes nothing
        st.mark_stable(ov(1, 2), false);
        st.mark_stable(ov(1, 1), false);
        assert_eq!(st.inode_space_stats, charged);
        assert!(st.dirty_db.get(&ov(1, 1)).unwrap().state.is_stable());
        assert!(!st.dirty_db.get(&ov(1, 3)).unwrap().state.is_stable());

        st.mark_stable(ov(1, 3), false);
        st.mark_stable(ov(1, 1), false);
        assert!(st.dirty_db.iter().all(|(_, e)| e.state.is_stable()));
        assert_eq!(st.inode_space_stats, charged);
    }

    #[test]
    fn test_replayed_stable_never_moves_back() {
        let layout = small_layout();
        let devices = Devices::new(&layout);
        devices.format_meta(&layout);
        let mut image = JournalImage::new(&layout);
        image.push(&big_write(&layout, 1, 1, 5));
        image.push(&stable(1, 1));
        image.push(&big_write(&layout, 1, 2, 6));
        image.push(&stable(1, 2));
        image.push(&stable(1, 1));
        image.push(&stable(1, 2));
        devices.put_journal(&layout, image.as_bytes());

        let (store, _) = boot(&devices);
        let clean = store.clean_db().find(&ObjectId::new(1, 0)).unwrap();
        assert_eq!((clean.version, clean.location), (2, 6));
        assert!(store.dirty_db().is_empty());
        assert!(!store.allocator().get(5));
        assert_eq!(store.stats().get(&1), Some(&(128 * 1024)));
    }

    /// One data block per object that currently owns stable data
    fn expected_space(store: &Blockstore<BlockingRing>) -> BTreeMap<u64, u64> {
        let mut expected = BTreeMap::new();
        let mut owners: Vec<ObjectId> = store.clean_db().iter().map(|(oid, _)| *oid).collect();
        for (key, entry) in store.dirty_db().iter() {
            if entry.state.is_big_write() && entry.state.is_stable() && !owners.contains(&key.oid) {
                owners.push(key.oid);
            }
        }
        for oid in owners {
            *expected.entry(oid.inode).or_default() += 128 * 1024;
        }
        expected
    }

    #[test]
    fn test_space_matches_live_blocks() {
        let layout = small_layout();
        let devices = Devices::new(&layout);
        devices.format_meta(&layout);
        devices.put_clean(&layout, 20, ObjectId::new(6, 0), 1);
        let mut image = JournalImage::new(&layout);
        // Written once and committed
        image.push(&big_write(&layout, 1, 1, 10));
        image.push(&stable(1, 1));
        // Overwritten after the first commit
        image.push(&big_write(&layout, 2, 1, 11));
        image.push(&stable(2, 1));
        image.push(&big_write(&layout, 2, 2, 12));
        image.push(&stable(2, 2));
        // Never committed
        image.push(&big_write(&layout, 3, 1, 13));
        // Committed, then deleted
        image.push(&big_write(&layout, 4, 1, 14));
        image.push(&stable(4, 1));
        image.push(&JournalRecord::Delete(ov(4, 2)));
        // Second version rolled back before the first is committed
        image.push(&big_write(&layout, 5, 1, 15));
        image.push(&big_write(&layout, 5, 2, 16));
        image.push(&JournalRecord::Rollback(ov(5, 1)));
        image.push(&stable(5, 1));
        // Clean object overwritten through the journal
        image.push(&big_write(&layout, 6, 2, 17));
        image.push(&stable(6, 2));
        devices.put_journal(&layout, image.as_bytes());

        let (store, _) = boot(&devices);
        let expected = expected_space(&store);
        assert_eq!(store.stats(), &expected);
        assert_eq!(expected.keys().copied().collect::<Vec<_>>(), vec![1, 2, 5, 6]);
        // Clean blocks 10, 12, 15, 17 and the unstable block 13
        assert_eq!(store.allocator().get_free_count(), 995);
        for block in [11, 14, 16, 20] {
            assert!(!store.allocator().get(block));
        }

        // A second recovery over the compacted metadata agrees
        let (again, _) = boot(&devices);
        assert_eq!(again.stats(), &expected);
        assert_eq!(again.allocator().get_free_count(), 995);
    }
}
