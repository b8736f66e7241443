//! Shared memory segments backing a link.
//!
//! A named segment lives in `/dev/shm` and is created by the host, which
//! owns the name and unlinks it on drop. The accelerator opens it by name.
//! Anonymous segments serve pairs of peers inside one process.

use nix::fcntl::OFlag;
use nix::sys::mman::{MapFlags, ProtFlags, mmap, mmap_anonymous, munmap, shm_open, shm_unlink};
use nix::sys::stat::{Mode, fstat};
use nix::unistd::{close, ftruncate};
use std::ffi::CString;
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::ptr::NonNull;

use crate::error::{Error, Result};
use crate::region::Region;

/// Longest segment name accepted, leading slash included.
pub const MAX_NAME_LEN: usize = 255;

/// A mapped shared memory segment.
pub struct SharedMemory {
    ptr: NonNull<u8>,
    size: usize,
    backing: Backing,
}

enum Backing {
    Named { name: CString, fd: RawFd, owner: bool },
    Anonymous,
}

unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    /// Creates a new named segment of `size` bytes, zero filled.
    ///
    /// Fails if a segment with the same name already exists.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let name = segment_name(name)?;
        let len = non_zero(size)?;

        let fd = shm_open(
            name.as_c_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(errno)?;

        if let Err(e) = ftruncate(&fd, size as i64) {
            let _ = shm_unlink(name.as_c_str());
            return Err(errno(e));
        }

        let ptr = match map_fd(&fd, len) {
            Ok(p) => p,
            Err(e) => {
                let _ = shm_unlink(name.as_c_str());
                return Err(e);
            }
        };

        tracing::debug!(name = ?name, size, "created shared segment");
        Ok(Self {
            ptr,
            size,
            backing: Backing::Named {
                name,
                fd: fd.into_raw_fd(),
                owner: true,
            },
        })
    }

    /// Opens an existing named segment and maps `size` bytes of it.
    pub fn open(name: &str, size: usize) -> Result<Self> {
        let name = segment_name(name)?;
        let len = non_zero(size)?;

        let fd = shm_open(name.as_c_str(), OFlag::O_RDWR, Mode::empty()).map_err(errno)?;
        let stat = fstat(fd.as_raw_fd()).map_err(errno)?;
        if (stat.st_size as usize) < size {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("segment holds {} bytes, {} expected", stat.st_size, size),
            )));
        }

        let ptr = map_fd(&fd, len)?;
        tracing::debug!(name = ?name, size, "opened shared segment");
        Ok(Self {
            ptr,
            size,
            backing: Backing::Named {
                name,
                fd: fd.into_raw_fd(),
                owner: false,
            },
        })
    }

    /// Maps an anonymous shared segment, zero filled.
    pub fn anonymous(size: usize) -> Result<Self> {
        let len = non_zero(size)?;
        let ptr = unsafe {
            mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )
        }
        .map_err(errno)?;
        Ok(Self {
            ptr: ptr.cast(),
            size,
            backing: Backing::Anonymous,
        })
    }

    /// Returns a pointer to the start of the segment.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Region view covering the whole segment.
    pub fn region(&self) -> Region {
        // SAFETY: the mapping stays valid for the lifetime of `self`.
        unsafe { Region::from_raw(self.ptr, self.size) }
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr.cast(), self.size);
        }
        if let Backing::Named { name, fd, owner } = &self.backing {
            let _ = close(*fd);
            if *owner {
                let _ = shm_unlink(name.as_c_str());
            }
        }
    }
}

fn map_fd(fd: &OwnedFd, len: NonZeroUsize) -> Result<NonNull<u8>> {
    let ptr = unsafe {
        mmap(
            None,
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            fd,
            0,
        )
    }
    .map_err(errno)?;
    Ok(ptr.cast())
}

fn non_zero(size: usize) -> Result<NonZeroUsize> {
    NonZeroUsize::new(size)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "size must be non-zero").into())
}

fn errno(e: nix::errno::Errno) -> Error {
    Error::Io(io::Error::from_raw_os_error(e as i32))
}

fn segment_name(name: &str) -> Result<CString> {
    let name = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{}", name)
    };
    if name.len() > MAX_NAME_LEN {
        return Err(Error::NameTooLong);
    }
    CString::new(name).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "name contains null byte").into()
    })
}
