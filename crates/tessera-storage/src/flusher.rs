//! Hooks into the background flusher
//!
//! The flusher copies stable journal data to its final place and trims the
//! journal. The blockstore only notifies it; every call is fire-and-forget.

use tessera_common::{ObjVerId, ObjectId};

/// Notifications sent to the flusher
pub trait FlushScheduler {
    /// Journal sectors may have become unused
    fn mark_trim_possible(&mut self);

    /// A version became stable and can be flushed
    fn enqueue_flush(&mut self, ov: ObjVerId);

    /// Pending flushes of an object are obsolete
    fn remove_flush(&mut self, oid: ObjectId);
}

/// Flusher that ignores every notification
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopFlusher;

impl FlushScheduler for NoopFlusher {
    fn mark_trim_possible(&mut self) {}

    fn enqueue_flush(&mut self, _ov: ObjVerId) {}

    fn remove_flush(&mut self, _oid: ObjectId) {}
}
