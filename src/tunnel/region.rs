//! Named POSIX shared-memory segments.

use crate::Error;
use std::ffi::{CStr, CString};
use std::ptr::NonNull;
use tracing::{debug, trace};

/// Size of a memory page, falling back to 4 KiB if the system will not say.
pub(crate) fn page_size() -> usize {
    // Safety: sysconf has no preconditions.
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page > 0 {
        page as usize
    } else {
        4096
    }
}

/// Path of `name` in the shared-memory namespace, which requires exactly one leading slash.
pub(crate) fn shm_path(name: &str) -> crate::Result<CString> {
    let path = format!("/{}", name.trim_start_matches('/'));
    CString::new(path).map_err(|_| Error::RegionLayout {
        name: name.to_owned(),
        reason: "region names may not contain NUL bytes".into(),
    })
}

/// Remove the region at `path`. Returns whether anything was removed; a region that does not exist is not an error.
pub(crate) fn unlink(path: &CStr) -> crate::Result<bool> {
    // Safety: path is a valid NUL-terminated string.
    if unsafe { libc::shm_unlink(path.as_ptr()) } == 0 {
        trace!(path = ?path, "unlinked shared-memory region");
        return Ok(true);
    }
    match std::io::Error::last_os_error().raw_os_error() {
        Some(libc::ENOENT) => Ok(false),
        _ => Err(Error::os("shm_unlink")),
    }
}

/// Device and inode of a segment. Two segments that held the same name at different times never share one while
/// either is still mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Identity {
    device: u64,
    inode: u64,
}

fn identity(fd: libc::c_int) -> crate::Result<(Identity, usize)> {
    // Safety: an all-zero stat is a valid value to be overwritten by fstat.
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    // Safety: fd is open and stat points to writable memory of the right type.
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return Err(Error::os("fstat"));
    }
    let identity = Identity {
        device: stat.st_dev as u64,
        inode: stat.st_ino as u64,
    };
    Ok((identity, stat.st_size as usize))
}

/// A shared-memory segment mapped read-write into this process.
///
/// The mapping is released on drop. Removing the name from the namespace is a separate decision, see [`unlink()`]
/// and [`unlink_if_current()`]; the mapping stays valid after the name is gone.
///
/// [`unlink_if_current()`]: ShmRegion::unlink_if_current
#[derive(Debug)]
pub(crate) struct ShmRegion {
    path: CString,
    identity: Identity,
    base: NonNull<u8>,
    len: usize,
}

impl ShmRegion {
    /// Create a zero-filled segment of `len` bytes at `path`, failing if the name is taken.
    pub(crate) fn create(path: &CStr, len: usize) -> crate::Result<Self> {
        // Safety: path is a valid NUL-terminated string.
        let fd = unsafe {
            libc::shm_open(
                path.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600 as libc::c_uint,
            )
        };
        if fd < 0 {
            return Err(Error::os("shm_open"));
        }

        let result = Self::size_and_map(fd, path, len);
        // Safety: fd was opened above and is not used again.
        unsafe { libc::close(fd) };
        if result.is_err() {
            // Best effort; the original error is what gets reported.
            let _ = unlink(path);
        }
        result
    }

    /// Map the whole of the existing segment at `path`.
    pub(crate) fn open(path: &CStr) -> crate::Result<Self> {
        // Safety: path is a valid NUL-terminated string.
        let fd = unsafe { libc::shm_open(path.as_ptr(), libc::O_RDWR, 0 as libc::c_uint) };
        if fd < 0 {
            return Err(Error::os("shm_open"));
        }

        let result = identity(fd).and_then(|(identity, len)| Self::map(fd, path, identity, len));
        // Safety: fd was opened above and is not used again.
        unsafe { libc::close(fd) };
        result
    }

    fn size_and_map(fd: libc::c_int, path: &CStr, len: usize) -> crate::Result<Self> {
        // Safety: fd refers to a freshly created segment owned by this call.
        if unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
            return Err(Error::os("ftruncate"));
        }
        let (identity, _) = identity(fd)?;
        Self::map(fd, path, identity, len)
    }

    fn map(fd: libc::c_int, path: &CStr, identity: Identity, len: usize) -> crate::Result<Self> {
        if len == 0 {
            return Err(Error::RegionTooSmall {
                required: 1,
                available: 0,
            });
        }
        // Safety: a null hint lets the kernel choose the address; fd is open read-write and covers len bytes.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::os("mmap"));
        }
        let base = NonNull::new(ptr.cast::<u8>()).ok_or_else(|| Error::os("mmap"))?;
        debug!(path = ?path, bytes = len, "mapped shared-memory region");
        Ok(Self {
            path: path.to_owned(),
            identity,
            base,
            len,
        })
    }

    pub(crate) fn path(&self) -> &CStr {
        &self.path
    }

    pub(crate) fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Remove the name only if it still refers to this segment rather than one created under the same name since.
    /// Returns whether the name was removed.
    pub(crate) fn unlink_if_current(&self) -> crate::Result<bool> {
        // Safety: path is a valid NUL-terminated string.
        let fd = unsafe { libc::shm_open(self.path.as_ptr(), libc::O_RDONLY, 0 as libc::c_uint) };
        if fd < 0 {
            return match std::io::Error::last_os_error().raw_os_error() {
                Some(libc::ENOENT) => Ok(false),
                _ => Err(Error::os("shm_open")),
            };
        }
        let current = identity(fd);
        // Safety: fd was opened above and is not used again.
        unsafe { libc::close(fd) };

        if current?.0 == self.identity {
            unlink(&self.path)
        } else {
            trace!(path = ?self.path, "name now refers to a newer region; leaving it");
            Ok(false)
        }
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        // Safety: base and len describe a mapping created in map() that nothing else unmaps.
        unsafe { libc::munmap(self.base.as_ptr().cast(), self.len) };
    }
}
