//! File-backed shared mappings of `f64` slots
//!
//! A segment is a plain file (normally under `/dev/shm`) mapped `MAP_SHARED`, so
//! every process that maps it sees the same pages. The owner maps it read-write;
//! everyone else maps it `PROT_READ`, which makes a stray write from an attached
//! member a fault instead of silent corruption.

use crate::Result;
use anyhow::Context;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr;

const SLOT_BYTES: usize = std::mem::size_of::<f64>();

/// A mapped region of `len` f64 slots
///
/// A zero-length region maps nothing; `mmap` rejects empty mappings.
pub struct Mapping {
    addr: *mut f64,
    len: usize,
    writable: bool,
}

// Safety: the mapping owns its region for its whole lifetime. Mutable access
// requires `&mut self`, so shared references only ever read. Cross-process
// writers are excluded by the publication barrier that precedes any read.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Region of zero slots
    pub fn empty() -> Self {
        Self {
            addr: ptr::null_mut(),
            len: 0,
            writable: false,
        }
    }

    /// Create the backing file at `path`, size it and map it read-write
    ///
    /// Fails if the file already exists.
    pub fn create(path: &Path, len: usize) -> Result<Self> {
        let bytes = byte_len(len)?;
        if bytes == 0 {
            return Ok(Self::empty());
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .with_context(|| format!("Failed to create shared segment {}", path.display()))?;

        let sized = file
            .set_len(bytes as u64)
            .with_context(|| format!("Failed to size shared segment {} to {} bytes", path.display(), bytes))
            .and_then(|_| {
                map(&file, bytes, libc::PROT_READ | libc::PROT_WRITE)
                    .with_context(|| format!("Failed to map shared segment {}", path.display()))
            });
        let addr = match sized {
            Ok(addr) => addr,
            Err(e) => {
                // The file is ours; do not leave a half-made segment behind
                let _ = std::fs::remove_file(path);
                return Err(e);
            }
        };

        Ok(Self {
            addr,
            len,
            writable: true,
        })
    }

    /// Map an existing segment read-only
    ///
    /// The file must hold exactly `len` slots.
    pub fn open(path: &Path, len: usize) -> Result<Self> {
        let bytes = byte_len(len)?;
        if bytes == 0 {
            return Ok(Self::empty());
        }

        let file = File::open(path)
            .with_context(|| format!("Failed to open shared segment {}", path.display()))?;

        let actual = file
            .metadata()
            .with_context(|| format!("Failed to stat shared segment {}", path.display()))?
            .len();
        if actual != bytes as u64 {
            anyhow::bail!(
                "Shared segment {} has {} bytes, expected {} ({} values)",
                path.display(),
                actual,
                bytes,
                len
            );
        }

        let addr = map(&file, bytes, libc::PROT_READ)
            .with_context(|| format!("Failed to map shared segment {}", path.display()))?;

        Ok(Self {
            addr,
            len,
            writable: false,
        })
    }

    /// Number of f64 slots
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn as_slice(&self) -> &[f64] {
        if self.addr.is_null() {
            return &[];
        }
        // Safety: addr maps len * 8 bytes for as long as self lives
        unsafe { std::slice::from_raw_parts(self.addr, self.len) }
    }

    /// Writable view of the slots; fails on a read-only mapping
    pub fn as_mut_slice(&mut self) -> Result<&mut [f64]> {
        if self.addr.is_null() {
            return Ok(Default::default());
        }
        if !self.is_writable() {
            anyhow::bail!("Shared segment is mapped read-only");
        }
        // Safety: the mapping is PROT_WRITE and &mut self guarantees exclusivity
        // within this process
        Ok(unsafe { std::slice::from_raw_parts_mut(self.addr, self.len) })
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if self.addr.is_null() {
            return;
        }
        let result = unsafe { libc::munmap(self.addr as *mut libc::c_void, self.len * SLOT_BYTES) };
        if result != 0 {
            tracing::warn!("munmap failed: {}", std::io::Error::last_os_error());
        }
    }
}

fn byte_len(len: usize) -> Result<usize> {
    len.checked_mul(SLOT_BYTES)
        .with_context(|| format!("Shared segment of {} values overflows the address space", len))
}

fn map(file: &File, bytes: usize, prot: libc::c_int) -> Result<*mut f64> {
    let addr = unsafe { libc::mmap(ptr::null_mut(), bytes, prot, libc::MAP_SHARED, file.as_raw_fd(), 0) };

    if addr == libc::MAP_FAILED {
        let err = std::io::Error::last_os_error();
        return Err(err).context(format!("mmap failed: size={}", bytes));
    }

    // The mapping outlives the descriptor; closing `file` is fine
    Ok(addr as *mut f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_owner_writes_are_visible_to_reader() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("segment");

        let mut owner = Mapping::create(&path, 3).unwrap();
        owner.as_mut_slice().unwrap().copy_from_slice(&[1.0, 2.0, 3.0]);

        let reader = Mapping::open(&path, 3).unwrap();
        assert_eq!(reader.as_slice(), &[1.0, 2.0, 3.0]);
        assert!(!reader.is_writable());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 24);
    }

    #[test]
    fn test_reader_cannot_write() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("segment");
        let _owner = Mapping::create(&path, 2).unwrap();

        let mut reader = Mapping::open(&path, 2).unwrap();
        assert!(reader.as_mut_slice().is_err());
    }

    #[test]
    fn test_size_mismatch_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("segment");
        let _owner = Mapping::create(&path, 4).unwrap();

        let err = Mapping::open(&path, 5).err().unwrap();
        assert!(format!("{:#}", err).contains("expected 40"));
    }

    #[test]
    fn test_create_refuses_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("segment");
        std::fs::write(&path, b"taken").unwrap();

        assert!(Mapping::create(&path, 1).is_err());
    }

    #[test]
    fn test_zero_length_maps_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("never-created");

        let mut owner = Mapping::create(&path, 0).unwrap();
        assert!(owner.is_empty());
        assert!(owner.as_mut_slice().unwrap().is_empty());
        assert!(!path.exists());

        let reader = Mapping::open(&path, 0).unwrap();
        assert!(reader.as_slice().is_empty());
    }

    #[test]
    fn test_overflowing_length_is_rejected() {
        let dir = TempDir::new().unwrap();
        assert!(Mapping::create(&dir.path().join("huge"), usize::MAX).is_err());
    }
}
