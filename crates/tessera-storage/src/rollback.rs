//! Rollback of unstable versions
//!
//! Rolling an object back to version `v` drops the synced but unstable
//! versions above `v`. Stable versions can never be rolled back, and a
//! version still on its way to the device makes the rollback wait.

use crate::index::UNRESOLVED_LOCATION;
use crate::store::{Admission, BlockstoreState};
use tessera_common::{Error, ObjVerId};

impl BlockstoreState {
    /// Drop the dirty versions of `ov.oid` above `ov.version`
    ///
    /// Walks down from the newest version and stops at the first version
    /// that is in flight, stable, or not above `ov`.
    pub fn mark_rolled_back(&mut self, ov: ObjVerId) {
        let mut removed = Vec::new();
        let mut max_unstable = 0;
        for (key, entry) in self.dirty_db.versions(ov.oid).rev() {
            if key.version <= ov.version {
                if !entry.state.is_stable() {
                    max_unstable = key.version;
                }
                break;
            }
            if entry.state.is_in_flight() || entry.state.is_stable() {
                break;
            }
            removed.push(*key);
        }
        if removed.is_empty() {
            return;
        }
        self.erase_dirty(&removed, UNRESOLVED_LOCATION);
        if max_unstable == 0 {
            self.unstable_writes.remove(&ov.oid);
        } else if let Some(unstable) = self.unstable_writes.get_mut(&ov.oid) {
            *unstable = max_unstable;
        }
    }

    /// Decide what a live rollback batch has to do
    pub(crate) fn admit_rollback(&self, batch: &[ObjVerId]) -> Admission {
        let mut todo = 0;
        for ov in batch {
            let mut above = false;
            for (key, entry) in self.dirty_db.versions(ov.oid).rev() {
                if key.version <= ov.version {
                    break;
                }
                if entry.state.is_stable() {
                    return Admission::Fail(Error::RollbackStable(*ov));
                }
                if entry.state.is_in_flight() {
                    return Admission::Defer;
                }
                above = true;
            }
            let clean = self.clean_db.find(&ov.oid);
            if clean.is_some_and(|c| c.version > ov.version) {
                return Admission::Fail(Error::RollbackStable(*ov));
            }
            let exists =
                self.dirty_db.contains(ov) || clean.is_some_and(|c| c.version == ov.version);
            if !exists {
                return Admission::Fail(Error::NoSuchVersion(*ov));
            }
            if above {
                todo += 1;
            }
        }
        if todo == 0 {
            Admission::Complete
        } else {
            Admission::Write
        }
    }
}
