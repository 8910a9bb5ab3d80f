//! Backing storage for the shared queue data region

use std::{
    cell::UnsafeCell,
    fmt,
    fs::{File, OpenOptions},
    path::PathBuf,
    ptr::NonNull,
};

use memmap2::{MmapMut, MmapOptions};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SqueueError};

/// Types of backing for the queue data region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackingType {
    /// Process-heap backing; sufficient for single-process worker groups and tests
    Heap,
    /// File-backed shared memory
    FileBacked,
    /// Anonymous memory file descriptor (Linux-specific)
    #[cfg(target_os = "linux")]
    MemFd,
}

enum Backing {
    Heap(UnsafeCell<Box<[u8]>>),
    Mapped { mmap: MmapMut, _file: File },
}

/// The contiguous byte region all consumer rings are carved from.
///
/// The region itself performs no synchronization: every carved range is
/// written and read only while the consumer lock that owns the range is held.
pub struct QueueRegion {
    backing: Backing,
    size: usize,
}

impl QueueRegion {
    /// Allocate or map a region of `size` bytes.
    ///
    /// `path` is only consulted for [`BackingType::FileBacked`]; when absent a
    /// file under the system temp directory is used.
    pub fn new(size: usize, backing_type: BackingType, path: Option<PathBuf>) -> Result<Self> {
        if size == 0 {
            return Err(SqueueError::invalid_parameter(
                "size",
                "Region size must be greater than 0",
            ));
        }

        let backing = match backing_type {
            BackingType::Heap => {
                Backing::Heap(UnsafeCell::new(vec![0u8; size].into_boxed_slice()))
            }
            BackingType::FileBacked => {
                let path =
                    path.unwrap_or_else(|| std::env::temp_dir().join("squeue_region"));
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&path)
                    .map_err(|e| SqueueError::from_io(e, "Failed to create/open region file"))?;
                file.set_len(size as u64)
                    .map_err(|e| SqueueError::from_io(e, "Failed to size region file"))?;
                let mmap = unsafe {
                    MmapOptions::new()
                        .len(size)
                        .map_mut(&file)
                        .map_err(|e| SqueueError::from_io(e, "Failed to map region file"))?
                };
                Backing::Mapped { mmap, _file: file }
            }
            #[cfg(target_os = "linux")]
            BackingType::MemFd => {
                use std::os::fd::FromRawFd;

                let name_cstr = std::ffi::CString::new("squeue_region")
                    .map_err(|_| SqueueError::memory("Region name contains null bytes"))?;

                let fd = unsafe { libc::memfd_create(name_cstr.as_ptr(), libc::MFD_CLOEXEC) };
                if fd == -1 {
                    return Err(SqueueError::memory("Failed to create memfd"));
                }
                // The File takes ownership of the descriptor and closes it on drop.
                let file = unsafe { File::from_raw_fd(fd) };
                file.set_len(size as u64)
                    .map_err(|e| SqueueError::from_io(e, "Failed to size memfd"))?;
                let mmap = unsafe {
                    MmapOptions::new()
                        .len(size)
                        .map_mut(&file)
                        .map_err(|e| SqueueError::from_io(e, "Failed to map memfd"))?
                };
                Backing::Mapped { mmap, _file: file }
            }
        };

        Ok(Self { backing, size })
    }

    /// Size of the region in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Hand out a pointer to a sub-range of the region.
    ///
    /// # Safety
    ///
    /// The returned pointer aliases the region. Callers must guarantee that
    /// carved ranges are disjoint and that each range is only accessed under
    /// the lock that serializes it.
    pub(crate) unsafe fn carve(&self, offset: usize, len: usize) -> Result<NonNull<u8>> {
        if offset
            .checked_add(len)
            .map(|end| end > self.size)
            .unwrap_or(true)
        {
            return Err(SqueueError::memory(format!(
                "Carve out of bounds: offset {} len {} in region of {}",
                offset, len, self.size
            )));
        }
        let base = match &self.backing {
            Backing::Heap(cell) => (*cell.get()).as_mut_ptr(),
            Backing::Mapped { mmap, .. } => mmap.as_ptr() as *mut u8,
        };
        Ok(NonNull::new_unchecked(base.add(offset)))
    }
}

// Safety: all access to the region bytes goes through `carve`, whose contract
// requires external serialization by the per-range consumer locks.
unsafe impl Send for QueueRegion {}
unsafe impl Sync for QueueRegion {}

impl fmt::Debug for QueueRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let backing = match &self.backing {
            Backing::Heap(_) => "heap",
            Backing::Mapped { .. } => "mapped",
        };
        f.debug_struct("QueueRegion")
            .field("size", &self.size)
            .field("backing", &backing)
            .finish()
    }
}
