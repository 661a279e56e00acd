//! Platform-specific raw disk I/O
//!
//! Provides positional access to the files or block devices that hold the
//! metadata, journal and data areas. With `direct_io` the page cache is
//! bypassed:
//! - Linux: O_DIRECT flag
//! - macOS: F_NOCACHE fcntl

use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::ptr::NonNull;
use tessera_common::{Error, Result};

#[cfg(target_os = "linux")]
use std::os::unix::fs::OpenOptionsExt;

/// Alignment requirement for direct I/O (typically 4KB or 512 bytes)
pub const ALIGNMENT: usize = 4096;

/// Raw file handle with optional direct I/O
#[derive(Debug)]
pub struct RawFile {
    file: File,
    path: String,
    size: u64,
    read_only: bool,
    direct_io: bool,
}

impl RawFile {
    /// Open an existing file or block device
    pub fn open(path: impl AsRef<Path>, read_only: bool, direct_io: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let mut options = OpenOptions::new();
        options.read(true);
        if !read_only {
            options.write(true);
        }

        // Platform-specific direct I/O flags
        #[cfg(target_os = "linux")]
        if direct_io {
            // O_DIRECT bypasses page cache on Linux
            options.custom_flags(libc::O_DIRECT);
        }

        let file = options
            .open(&path)
            .map_err(|e| Error::storage(format!("failed to open {path_str}: {e}")))?;

        #[cfg(target_os = "macos")]
        if direct_io {
            Self::set_nocache(&file, &path_str)?;
        }

        let size = if Self::is_block_device(&path) {
            Self::get_block_device_size(&file, &path_str)?
        } else {
            file.metadata()
                .map_err(|e| Error::storage(format!("failed to get metadata for {path_str}: {e}")))?
                .len()
        };

        Ok(Self {
            file,
            path: path_str,
            size,
            read_only,
            direct_io,
        })
    }

    /// Create (or truncate) a regular file of the given size
    pub fn create(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::storage(format!("failed to create {path_str}: {e}")))?;
        file.set_len(size)
            .map_err(|e| Error::storage(format!("failed to set size for {path_str}: {e}")))?;

        Ok(Self {
            file,
            path: path_str,
            size,
            read_only: false,
            direct_io: false,
        })
    }

    /// Check if path is a block device
    fn is_block_device(path: impl AsRef<Path>) -> bool {
        use std::os::unix::fs::FileTypeExt;
        std::fs::metadata(&path).is_ok_and(|m| m.file_type().is_block_device())
    }

    /// Get block device size using ioctl
    #[cfg(target_os = "linux")]
    #[allow(unsafe_code)]
    fn get_block_device_size(file: &File, path: &str) -> Result<u64> {
        use std::os::unix::io::AsRawFd;

        // BLKGETSIZE64 ioctl
        const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

        let mut size: u64 = 0;
        // SAFETY: the fd is valid for the lifetime of `file` and the ioctl
        // writes exactly one u64 into `size`.
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };
        if ret == -1 {
            return Err(Error::storage(format!(
                "failed to get block device size for {}: {}",
                path,
                io::Error::last_os_error()
            )));
        }
        Ok(size)
    }

    /// Get block device size (non-Linux fallback)
    #[cfg(not(target_os = "linux"))]
    fn get_block_device_size(file: &File, path: &str) -> Result<u64> {
        use std::io::{Seek, SeekFrom};
        let mut f = file;
        f.seek(SeekFrom::End(0))
            .map_err(|e| Error::storage(format!("failed to get device size for {path}: {e}")))
    }

    #[cfg(target_os = "macos")]
    #[allow(unsafe_code)]
    fn set_nocache(file: &File, path: &str) -> Result<()> {
        use std::os::unix::io::AsRawFd;
        // SAFETY: plain fcntl on a valid descriptor.
        if unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) } == -1 {
            return Err(Error::storage(format!(
                "failed to set F_NOCACHE on {}: {}",
                path,
                io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    /// Get the file size
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Get the file path
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Read data at the given offset
    ///
    /// With direct I/O, both offset and buffer size must be aligned to ALIGNMENT
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.check_alignment(offset, buf.len())?;
        let mut done = 0;
        while done < buf.len() {
            match self.file.read_at(&mut buf[done..], offset + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(done)
    }

    /// Write data at the given offset
    ///
    /// With direct I/O, both offset and buffer size must be aligned to ALIGNMENT
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        if self.read_only {
            return Err(io::Error::from_raw_os_error(libc::EROFS));
        }
        self.check_alignment(offset, buf.len())?;
        self.file.write_all_at(buf, offset)?;
        Ok(buf.len())
    }

    /// Sync data to disk
    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    /// Sync data only (not metadata) to disk
    pub fn sync_data(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    /// Check alignment requirements
    fn check_alignment(&self, offset: u64, size: usize) -> io::Result<()> {
        if self.direct_io && (offset % ALIGNMENT as u64 != 0 || size % ALIGNMENT != 0) {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        Ok(())
    }
}

/// Aligned, zero-initialized buffer for direct I/O operations
///
/// The allocation is rounded up to [`ALIGNMENT`]; the logical length is
/// what was asked for.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    capacity: usize,
}

// SAFETY: the buffer owns its allocation exclusively.
#[allow(unsafe_code)]
unsafe impl Send for AlignedBuffer {}
// SAFETY: shared access only hands out `&[u8]`.
#[allow(unsafe_code)]
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Create a zeroed buffer of `len` bytes
    #[must_use]
    #[allow(unsafe_code)]
    pub fn new(len: usize) -> Self {
        let capacity = len.div_ceil(ALIGNMENT).max(1) * ALIGNMENT;
        let layout = Self::layout(capacity);
        // SAFETY: the layout has a non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            handle_alloc_error(layout)
        };
        Self { ptr, len, capacity }
    }

    /// Create a buffer holding a copy of `data`
    #[must_use]
    pub fn from_slice(data: &[u8]) -> Self {
        let mut buf = Self::new(data.len());
        buf.as_mut_slice().copy_from_slice(data);
        buf
    }

    fn layout(capacity: usize) -> Layout {
        Layout::from_size_align(capacity, ALIGNMENT).expect("aligned buffer size overflows")
    }

    /// Logical length
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer is empty
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Get the buffer as a slice
    #[must_use]
    #[allow(unsafe_code)]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `len <= capacity` bytes are allocated and initialized.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Get the buffer as a mutable slice
    #[allow(unsafe_code)]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuffer {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { dealloc(self.ptr.as_ptr(), Self::layout(self.capacity)) }
    }
}

impl Clone for AlignedBuffer {
    fn clone(&self) -> Self {
        Self::from_slice(self.as_slice())
    }
}

impl std::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_aligned_buffer() {
        let mut buf = AlignedBuffer::new(100);
        assert_eq!(buf.len(), 100);
        assert_eq!(buf.as_slice().as_ptr() as usize % ALIGNMENT, 0);
        assert!(buf.as_slice().iter().all(|&b| b == 0));

        buf.as_mut_slice()[99] = 7;
        let copy = buf.clone();
        assert_eq!(copy.as_slice()[99], 7);

        let empty = AlignedBuffer::new(0);
        assert!(empty.is_empty());
        assert!(empty.as_slice().is_empty());
    }

    #[test]
    fn test_raw_file_read_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("area.img");

        let file = RawFile::create(&path, 64 * 1024).unwrap();
        assert_eq!(file.size(), 64 * 1024);

        let data = AlignedBuffer::from_slice(&[0x5a; 4096]);
        assert_eq!(file.write_at(8192, data.as_slice()).unwrap(), 4096);
        file.sync().unwrap();

        let reopened = RawFile::open(&path, true, false).unwrap();
        assert_eq!(reopened.size(), 64 * 1024);
        let mut back = AlignedBuffer::new(4096);
        assert_eq!(reopened.read_at(8192, back.as_mut_slice()).unwrap(), 4096);
        assert_eq!(back.as_slice(), data.as_slice());

        // Read-only handles refuse writes
        let err = reopened.write_at(0, data.as_slice()).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EROFS));
    }

    #[test]
    fn test_raw_file_short_read_at_end() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("small.img");
        let file = RawFile::create(&path, 4096).unwrap();
        let mut buf = vec![0u8; 8192];
        assert_eq!(file.read_at(0, &mut buf).unwrap(), 4096);
    }

    #[test]
    fn test_open_missing_file() {
        let dir = tempdir().unwrap();
        assert!(RawFile::open(dir.path().join("missing"), true, false).is_err());
    }
}
