//! Submission/completion I/O ring
//!
//! The blockstore never blocks on I/O. It pushes requests tagged with a
//! `user_data` token, submits them, and later drains completions carrying a
//! signed result: the byte count on success or a negated errno on failure.
//! Completions may arrive in any order.
//!
//! Buffers are owned by the request and handed back in the completion, so
//! nothing borrowed has to outlive a submission.

use crate::device::BlockDevice;
use crate::raw_io::AlignedBuffer;
use std::collections::VecDeque;
use tessera_common::Result;

/// Area a request targets
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    /// Metadata area device
    Meta,
    /// Journal area device
    Journal,
    /// Data area device
    Data,
}

/// One queued I/O operation
#[derive(Debug)]
pub enum IoRequest {
    /// Fill `buf` from `offset`
    Read {
        device: DeviceKind,
        offset: u64,
        buf: AlignedBuffer,
    },
    /// Write `buf` at `offset`
    Write {
        device: DeviceKind,
        offset: u64,
        buf: AlignedBuffer,
    },
    /// Flush the device
    Fsync { device: DeviceKind },
}

impl IoRequest {
    /// Target device
    #[must_use]
    pub const fn device(&self) -> DeviceKind {
        match self {
            Self::Read { device, .. } | Self::Write { device, .. } | Self::Fsync { device } => {
                *device
            }
        }
    }
}

/// Result of one operation
#[derive(Debug)]
pub struct IoCompletion {
    /// Token given at push time
    pub user_data: u64,
    /// Bytes transferred, or a negated errno
    pub result: i64,
    /// The request buffer (reads come back filled)
    pub buf: Option<AlignedBuffer>,
}

/// Asynchronous I/O ring consumed by the blockstore
pub trait Ring {
    /// Free submission slots
    fn space_left(&self) -> usize;

    /// Queue a request, handing it back when the ring is full
    fn push(&mut self, user_data: u64, request: IoRequest) -> std::result::Result<(), IoRequest>;

    /// Hand queued requests to the device
    fn submit(&mut self) -> Result<()>;

    /// Deliver every available completion without blocking
    fn drain(&mut self, f: &mut dyn FnMut(IoCompletion));

    /// Block until at least one completion is available
    fn wait(&mut self) -> Result<()>;
}

/// Order in which [`BlockingRing`] runs and completes one submission
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CompletionOrder {
    /// Submission order
    #[default]
    Fifo,
    /// Run in submission order, complete in reverse
    Reversed,
    /// Run and complete in reverse submission order
    Backwards,
}

/// Ring that performs each request synchronously on submit
///
/// Portable stand-in for a kernel ring: requests run against three
/// [`BlockDevice`]s with positional I/O, completions are queued until
/// drained, and the depth bounds queued plus undrained operations.
pub struct BlockingRing {
    meta: Box<dyn BlockDevice>,
    journal: Box<dyn BlockDevice>,
    data: Box<dyn BlockDevice>,
    depth: usize,
    order: CompletionOrder,
    queued: Vec<(u64, IoRequest)>,
    completed: VecDeque<IoCompletion>,
}

impl BlockingRing {
    /// Create a ring over the three devices
    #[must_use]
    pub fn new(
        meta: Box<dyn BlockDevice>,
        journal: Box<dyn BlockDevice>,
        data: Box<dyn BlockDevice>,
        depth: usize,
    ) -> Self {
        Self {
            meta,
            journal,
            data,
            depth,
            order: CompletionOrder::Fifo,
            queued: Vec::new(),
            completed: VecDeque::new(),
        }
    }

    /// Deliver completions in the given order
    #[must_use]
    pub const fn with_order(mut self, order: CompletionOrder) -> Self {
        self.order = order;
        self
    }

    fn device(&self, kind: DeviceKind) -> &dyn BlockDevice {
        match kind {
            DeviceKind::Meta => self.meta.as_ref(),
            DeviceKind::Journal => self.journal.as_ref(),
            DeviceKind::Data => self.data.as_ref(),
        }
    }

    fn execute(&self, user_data: u64, request: IoRequest) -> IoCompletion {
        let (result, buf) = match request {
            IoRequest::Read {
                device,
                offset,
                mut buf,
            } => {
                let res = self.device(device).read_at(offset, buf.as_mut_slice());
                (to_result(res), Some(buf))
            }
            IoRequest::Write {
                device,
                offset,
                buf,
            } => {
                let res = self.device(device).write_at(offset, buf.as_slice());
                (to_result(res), Some(buf))
            }
            IoRequest::Fsync { device } => {
                let res = self.device(device).sync().map(|()| 0);
                (to_result(res), None)
            }
        };
        IoCompletion {
            user_data,
            result,
            buf,
        }
    }
}

fn to_result(res: std::io::Result<usize>) -> i64 {
    match res {
        Ok(n) => n as i64,
        Err(e) => -i64::from(e.raw_os_error().unwrap_or(libc::EIO)),
    }
}

impl Ring for BlockingRing {
    fn space_left(&self) -> usize {
        self.depth
            .saturating_sub(self.queued.len() + self.completed.len())
    }

    fn push(&mut self, user_data: u64, request: IoRequest) -> std::result::Result<(), IoRequest> {
        if self.space_left() == 0 {
            return Err(request);
        }
        self.queued.push((user_data, request));
        Ok(())
    }

    fn submit(&mut self) -> Result<()> {
        let mut queued = std::mem::take(&mut self.queued);
        if self.order == CompletionOrder::Backwards {
            queued.reverse();
        }
        let mut batch: Vec<IoCompletion> = queued
            .into_iter()
            .map(|(user_data, request)| self.execute(user_data, request))
            .collect();
        if self.order == CompletionOrder::Reversed {
            batch.reverse();
        }
        self.completed.extend(batch);
        Ok(())
    }

    fn drain(&mut self, f: &mut dyn FnMut(IoCompletion)) {
        while let Some(completion) = self.completed.pop_front() {
            f(completion);
        }
    }

    fn wait(&mut self) -> Result<()> {
        // Everything submitted has already completed.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{FaultOn, MemDevice};

    fn ring(depth: usize) -> (BlockingRing, MemDevice) {
        let journal = MemDevice::new(16 * 4096);
        let ring = BlockingRing::new(
            Box::new(MemDevice::new(4096)),
            Box::new(journal.clone()),
            Box::new(MemDevice::new(4096)),
            depth,
        );
        (ring, journal)
    }

    fn collect(ring: &mut BlockingRing) -> Vec<IoCompletion> {
        let mut out = Vec::new();
        ring.drain(&mut |c| out.push(c));
        out
    }

    #[test]
    fn test_write_then_read() {
        let (mut ring, journal) = ring(8);
        ring.push(
            1,
            IoRequest::Write {
                device: DeviceKind::Journal,
                offset: 4096,
                buf: AlignedBuffer::from_slice(&[9u8; 4096]),
            },
        )
        .unwrap();
        ring.push(
            2,
            IoRequest::Fsync {
                device: DeviceKind::Journal,
            },
        )
        .unwrap();
        ring.submit().unwrap();

        let done = collect(&mut ring);
        assert_eq!(done.len(), 2);
        assert_eq!((done[0].user_data, done[0].result), (1, 4096));
        assert_eq!((done[1].user_data, done[1].result), (2, 0));
        assert_eq!(journal.sync_count(), 1);

        ring.push(
            3,
            IoRequest::Read {
                device: DeviceKind::Journal,
                offset: 4096,
                buf: AlignedBuffer::new(4096),
            },
        )
        .unwrap();
        ring.submit().unwrap();
        let done = collect(&mut ring);
        assert_eq!(done[0].result, 4096);
        assert_eq!(done[0].buf.as_ref().unwrap().as_slice(), &[9u8; 4096][..]);
    }

    #[test]
    fn test_depth_counts_undrained_completions() {
        let (mut ring, _) = ring(2);
        for id in 0..2 {
            ring.push(
                id,
                IoRequest::Fsync {
                    device: DeviceKind::Meta,
                },
            )
            .unwrap();
        }
        assert_eq!(ring.space_left(), 0);
        let rejected = ring.push(
            5,
            IoRequest::Fsync {
                device: DeviceKind::Meta,
            },
        );
        assert!(rejected.is_err());

        ring.submit().unwrap();
        assert_eq!(ring.space_left(), 0);
        assert_eq!(collect(&mut ring).len(), 2);
        assert_eq!(ring.space_left(), 2);
    }

    #[test]
    fn test_reversed_order_and_errors() {
        let (ring, journal) = ring(8);
        let mut ring = ring.with_order(CompletionOrder::Reversed);
        journal.inject_fault(FaultOn::Read, libc::EIO);
        for id in 0..3 {
            ring.push(
                id,
                IoRequest::Read {
                    device: DeviceKind::Journal,
                    offset: id * 4096,
                    buf: AlignedBuffer::new(4096),
                },
            )
            .unwrap();
        }
        ring.submit().unwrap();
        let done = collect(&mut ring);
        let ids: Vec<_> = done.iter().map(|c| c.user_data).collect();
        assert_eq!(ids, vec![2, 1, 0]);
        // The first executed read hit the injected fault
        assert_eq!(done[2].result, -i64::from(libc::EIO));
        assert_eq!(done[0].result, 4096);
    }

    #[test]
    fn test_backwards_runs_last_submission_first() {
        let (ring, journal) = ring(8);
        let mut ring = ring.with_order(CompletionOrder::Backwards);
        for (id, byte) in [(1, 1u8), (2, 2u8)] {
            ring.push(
                id,
                IoRequest::Write {
                    device: DeviceKind::Journal,
                    offset: 0,
                    buf: AlignedBuffer::from_slice(&[byte; 4096]),
                },
            )
            .unwrap();
        }
        ring.submit().unwrap();
        let ids: Vec<_> = collect(&mut ring).iter().map(|c| c.user_data).collect();
        assert_eq!(ids, vec![2, 1]);
        assert_eq!(journal.read_range(0, 4), vec![1u8; 4]);
    }
}
