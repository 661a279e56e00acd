//! Completion routing
//!
//! Every request pushed to the ring gets a fresh `user_data` token that maps
//! back to the state machine or operation that submitted it. Draining the
//! ring yields `(owner, completion)` pairs, so out-of-order completions are
//! matched by identity rather than by arrival order.

use crate::init_journal::JournalIo;
use crate::init_meta::MetaIo;
use crate::ring::{IoCompletion, IoRequest, Ring};
use crate::store::OpId;
use std::collections::HashMap;
use tessera_common::{Error, Result};
use tracing::warn;

/// Submitter of an in-flight request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoOwner {
    /// Metadata recovery
    Meta(MetaIo),
    /// Journal recovery
    Journal(JournalIo),
    /// A live operation
    Op(OpId),
}

/// Ring wrapper that remembers who submitted what
pub struct IoQueue<R: Ring> {
    ring: R,
    next_user_data: u64,
    owners: HashMap<u64, IoOwner>,
}

impl<R: Ring> IoQueue<R> {
    /// Wrap a ring
    pub fn new(ring: R) -> Self {
        Self {
            ring,
            next_user_data: 1,
            owners: HashMap::new(),
        }
    }

    /// Free submission slots
    pub fn space_left(&self) -> usize {
        self.ring.space_left()
    }

    /// Requests pushed whose completion was not delivered yet
    pub fn in_flight(&self) -> usize {
        self.owners.len()
    }

    /// Queue a request, handing it back when the ring is full
    pub fn push(&mut self, owner: IoOwner, request: IoRequest) -> std::result::Result<(), IoRequest> {
        let user_data = self.next_user_data;
        self.ring.push(user_data, request)?;
        self.next_user_data += 1;
        self.owners.insert(user_data, owner);
        Ok(())
    }

    /// Queue a request where a full ring is fatal
    pub fn push_or_fail(&mut self, owner: IoOwner, request: IoRequest, what: &'static str) -> Result<()> {
        self.push(owner, request).map_err(|_| Error::RingFull(what))
    }

    /// Hand queued requests to the device
    pub fn submit(&mut self) -> Result<()> {
        self.ring.submit()
    }

    /// Block until a completion is available
    pub fn wait(&mut self) -> Result<()> {
        self.ring.wait()
    }

    /// Collect available completions with their owners
    pub fn drain(&mut self) -> Vec<(IoOwner, IoCompletion)> {
        let mut done = Vec::new();
        let owners = &mut self.owners;
        self.ring.drain(&mut |completion| match owners.remove(&completion.user_data) {
            Some(owner) => done.push((owner, completion)),
            None => warn!(
                user_data = completion.user_data,
                "Dropping completion of an unknown request"
            ),
        });
        done
    }

    /// Underlying ring
    pub const fn ring(&self) -> &R {
        &self.ring
    }
}

/// Check a read or write result against the expected byte count
pub fn check_transfer(op: &'static str, offset: u64, expected: usize, result: i64) -> Result<()> {
    if result < 0 {
        return Err(Error::from_ring_result(op, offset, result));
    }
    if result as u64 != expected as u64 {
        return Err(Error::ShortIo {
            op,
            offset,
            expected: expected as u64,
            actual: result as u64,
        });
    }
    Ok(())
}

/// Check an fsync result
pub fn check_sync(op: &'static str, result: i64) -> Result<()> {
    if result < 0 {
        return Err(Error::from_ring_result(op, 0, result));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use crate::raw_io::AlignedBuffer;
    use crate::ring::{BlockingRing, CompletionOrder, DeviceKind};

    fn queue(depth: usize) -> IoQueue<BlockingRing> {
        let ring = BlockingRing::new(
            Box::new(MemDevice::new(16 * 4096)),
            Box::new(MemDevice::new(16 * 4096)),
            Box::new(MemDevice::new(16 * 4096)),
            depth,
        )
        .with_order(CompletionOrder::Reversed);
        IoQueue::new(ring)
    }

    fn read(offset: u64) -> IoRequest {
        IoRequest::Read {
            device: DeviceKind::Meta,
            offset,
            buf: AlignedBuffer::new(4096),
        }
    }

    #[test]
    fn test_completions_keep_their_owner() {
        let mut io = queue(8);
        io.push(IoOwner::Meta(MetaIo::Superblock), read(0)).unwrap();
        io.push(IoOwner::Op(OpId(7)), read(4096)).unwrap();
        assert_eq!(io.in_flight(), 2);
        io.submit().unwrap();

        let done = io.drain();
        assert_eq!(io.in_flight(), 0);
        let owners: Vec<_> = done.iter().map(|(o, _)| *o).collect();
        assert_eq!(
            owners,
            vec![IoOwner::Op(OpId(7)), IoOwner::Meta(MetaIo::Superblock)]
        );
    }

    #[test]
    fn test_full_ring() {
        let mut io = queue(1);
        io.push_or_fail(IoOwner::Op(OpId(1)), read(0), "test").unwrap();
        let err = io
            .push_or_fail(IoOwner::Op(OpId(2)), read(0), "test")
            .unwrap_err();
        assert!(matches!(err, Error::RingFull("test")));
        assert_eq!(io.in_flight(), 1);
    }

    #[test]
    fn test_transfer_checks() {
        check_transfer("read", 0, 4096, 4096).unwrap();
        assert!(matches!(
            check_transfer("read", 0, 4096, 512),
            Err(Error::ShortIo { actual: 512, .. })
        ));
        assert!(matches!(
            check_transfer("write", 8192, 4096, -i64::from(libc::EIO)),
            Err(Error::Io { offset: 8192, .. })
        ));
        assert!(check_sync("fsync", -1).is_err());
    }
}
