//! Block devices behind the I/O ring
//!
//! A device only needs positional reads and writes plus a flush. Real
//! deployments use [`RawFile`]; [`MemDevice`] keeps an area in memory, which
//! is what tests and the in-process simulator use.

use crate::raw_io::RawFile;
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;

/// Positional device used by [`crate::ring::BlockingRing`]
pub trait BlockDevice: Send {
    /// Read up to `buf.len()` bytes at `offset`
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Write all of `buf` at `offset`
    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<usize>;

    /// Make previous writes durable
    fn sync(&self) -> io::Result<()>;

    /// Device size in bytes
    fn size(&self) -> u64;
}

impl BlockDevice for RawFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        Self::read_at(self, offset, buf)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        Self::write_at(self, offset, buf)
    }

    fn sync(&self) -> io::Result<()> {
        self.sync_data()
    }

    fn size(&self) -> u64 {
        Self::size(self)
    }
}

/// Which operation an injected error applies to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOn {
    /// The next read
    Read,
    /// The next write
    Write,
    /// The next sync
    Sync,
}

#[derive(Debug, Default)]
struct MemState {
    data: Vec<u8>,
    reads: u64,
    writes: u64,
    syncs: u64,
    fault: Option<(FaultOn, i32)>,
}

impl MemState {
    fn take_fault(&mut self, on: FaultOn) -> io::Result<()> {
        match self.fault {
            Some((kind, errno)) if kind == on => {
                self.fault = None;
                Err(io::Error::from_raw_os_error(errno))
            }
            _ => Ok(()),
        }
    }
}

/// In-memory device image
///
/// Clones share the same image, so a test can keep a handle while the ring
/// owns another.
#[derive(Clone, Debug, Default)]
pub struct MemDevice {
    state: Arc<Mutex<MemState>>,
}

impl MemDevice {
    /// Create a zero-filled device
    #[must_use]
    pub fn new(size: u64) -> Self {
        Self::from_bytes(vec![0u8; size as usize])
    }

    /// Create a device holding `data`
    #[must_use]
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemState {
                data,
                ..MemState::default()
            })),
        }
    }

    /// Copy of part of the image
    #[must_use]
    pub fn read_range(&self, offset: u64, len: usize) -> Vec<u8> {
        let state = self.state.lock();
        let start = offset as usize;
        state.data[start..start + len].to_vec()
    }

    /// Overwrite part of the image without counting it as a device write
    pub fn patch(&self, offset: u64, bytes: &[u8]) {
        let mut state = self.state.lock();
        let start = offset as usize;
        state.data[start..start + bytes.len()].copy_from_slice(bytes);
    }

    /// Number of reads served
    #[must_use]
    pub fn read_count(&self) -> u64 {
        self.state.lock().reads
    }

    /// Number of writes served
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.state.lock().writes
    }

    /// Number of syncs served
    #[must_use]
    pub fn sync_count(&self) -> u64 {
        self.state.lock().syncs
    }

    /// Fail the next operation of the given kind with `errno`
    pub fn inject_fault(&self, on: FaultOn, errno: i32) {
        self.state.lock().fault = Some((on, errno));
    }
}

impl BlockDevice for MemDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        state.take_fault(FaultOn::Read)?;
        state.reads += 1;
        let start = (offset as usize).min(state.data.len());
        let end = (start + buf.len()).min(state.data.len());
        buf[..end - start].copy_from_slice(&state.data[start..end]);
        Ok(end - start)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        state.take_fault(FaultOn::Write)?;
        let start = offset as usize;
        if start + buf.len() > state.data.len() {
            return Err(io::Error::from_raw_os_error(libc::ENOSPC));
        }
        state.writes += 1;
        state.data[start..start + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn sync(&self) -> io::Result<()> {
        let mut state = self.state.lock();
        state.take_fault(FaultOn::Sync)?;
        state.syncs += 1;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.state.lock().data.len() as u64
    }
}
