//! POSIX shared-memory segments backing staged workload payloads.
//!
//! Controller payloads (binaries, manifests) land in POSIX shared memory
//! (`shm_open` + `mmap`) so a launched workload can consume them without a
//! copy. Two types split the lifecycle:
//!
//! - [`Segment`] — the backing allocation: a named shared-memory object
//!   sized to hold one payload.
//! - [`Mapping`] — one process-local view of a segment.
//!
//! Cleanup is RAII: dropping a `Mapping` unmaps it and dropping a `Segment`
//! unlinks the object, so no exit path leaks either. The protocol paths
//! that must observe a cleanup failure use the explicit fallible variants
//! [`Mapping::detach`] and [`Segment::release`] instead.
//!
//! The kernel destroys the memory itself only once the name is unlinked
//! *and* the last mapping (in any process) is gone, so releasing a segment
//! here never pulls pages out from under a workload that still maps them.

use std::fmt;
use std::os::fd::OwnedFd;
use std::ptr::{NonNull, null_mut};
use std::slice;

use rustix::fs::{Mode, ftruncate};
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use rustix::{io, shm};
use thiserror::Error;

/// Result alias for shared memory operations.
pub type Result<T> = std::result::Result<T, ShmError>;

/// Contextual errors produced by [`Segment`] and [`Mapping`].
#[derive(Debug, Error)]
pub enum ShmError {
    /// The shared-memory object name is not POSIX-portable.
    #[error("invalid shared memory name `{path}`: {reason}")]
    InvalidPath {
        /// The offending name.
        path: String,
        /// Why validation rejected it.
        reason: &'static str,
    },
    /// `shm_open`, `ftruncate`, `mmap`, `munmap`, or `shm_unlink` failed.
    #[error("{op} failed for `{path}`: {source}")]
    Posix {
        /// The POSIX operation that failed.
        op: &'static str,
        /// The object name it targeted.
        path: String,
        /// The reported errno.
        source: io::Errno,
    },
}

impl ShmError {
    fn posix(op: &'static str, path: &str, err: io::Errno) -> Self {
        Self::Posix {
            op,
            path: path.to_string(),
            source: err,
        }
    }
}

const POSIX_NAME_MAX: usize = 255;

/// Validated POSIX shared-memory object name.
///
/// For portable use POSIX requires the name to start with `/`, contain no
/// further slashes, and stay within `NAME_MAX` (255) bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShmPath(String);

impl ShmPath {
    /// Validates and wraps a shared-memory object name.
    ///
    /// # Errors
    ///
    /// Returns [`ShmError::InvalidPath`] if the name violates the POSIX
    /// `shm_open` requirements above.
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        if !path.starts_with('/') {
            return Err(ShmError::InvalidPath {
                path,
                reason: "name must start with '/'",
            });
        }
        if path[1..].contains('/') {
            return Err(ShmError::InvalidPath {
                path,
                reason: "name must not contain additional '/' characters",
            });
        }
        if path.len() > POSIX_NAME_MAX {
            return Err(ShmError::InvalidPath {
                path,
                reason: "name length must be <= 255 bytes",
            });
        }
        Ok(Self(path))
    }

    /// Returns the validated name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ShmPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShmPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A backing allocation: one POSIX shared-memory object holding a payload.
///
/// Created exclusively (`O_CREAT | O_EXCL`), so two agents on one host can
/// never adopt each other's objects. Dropping the segment closes the fd and
/// unlinks the name best-effort; [`release`](Segment::release) is the
/// explicit variant for paths that must observe an unlink failure.
pub struct Segment {
    fd: OwnedFd,
    path: ShmPath,
    len: usize,
    linked: bool,
}

impl Segment {
    /// Allocates a new backing object of exactly `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the object already exists, if creation is denied,
    /// or if sizing it fails. A partially created object is unlinked before
    /// the error is returned.
    pub fn allocate(path: ShmPath, len: usize) -> Result<Self> {
        let fd = shm::open(
            path.as_str(),
            shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|err| ShmError::posix("shm_open", path.as_str(), err))?;

        if let Err(err) = ftruncate(&fd, len as u64) {
            drop(fd);
            let _ = shm::unlink(path.as_str());
            return Err(ShmError::posix("ftruncate", path.as_str(), err));
        }

        Ok(Self {
            fd,
            path,
            len,
            linked: true,
        })
    }

    /// Removes a leftover object from a crashed predecessor, ignoring absence.
    pub fn unlink_stale(path: &ShmPath) {
        let _ = shm::unlink(path.as_str());
    }

    /// Resizes the backing object to `len` bytes.
    ///
    /// Named registry slots are created empty and sized once the controller
    /// declares the payload length.
    ///
    /// # Errors
    ///
    /// Returns an error if `ftruncate` fails.
    pub fn resize(&mut self, len: usize) -> Result<()> {
        ftruncate(&self.fd, len as u64)
            .map_err(|err| ShmError::posix("ftruncate", self.path.as_str(), err))?;
        self.len = len;
        Ok(())
    }

    /// Returns the current payload capacity in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the segment holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the object name.
    #[must_use]
    pub fn path(&self) -> &ShmPath {
        &self.path
    }

    /// Maps the object into the local address space.
    ///
    /// # Errors
    ///
    /// Returns an error if `mmap` fails (including for zero-length
    /// segments, which cannot be mapped).
    pub fn map(&self) -> Result<Mapping> {
        Mapping::new(&self.fd, self.len, &self.path)
    }

    /// Releases the backing allocation, reporting unlink failure.
    ///
    /// The fd closes regardless; the kernel frees the memory once the last
    /// mapping anywhere is gone.
    ///
    /// # Errors
    ///
    /// Returns an error if `shm_unlink` fails.
    pub fn release(mut self) -> Result<()> {
        self.linked = false;
        shm::unlink(self.path.as_str())
            .map_err(|err| ShmError::posix("shm_unlink", self.path.as_str(), err))
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if self.linked {
            let _ = shm::unlink(self.path.as_str());
        }
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("path", &self.path)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

/// One process-local view of a [`Segment`].
///
/// Holds the mapped region for exactly its own lifetime: dropping unmaps
/// best-effort, [`detach`](Mapping::detach) unmaps fallibly.
pub struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
    path: String,
    detached: bool,
}

// SAFETY: the mapping is an exclusively owned view of process-shared
// memory, not thread-local state; moving it to another thread moves the
// sole accessor with it.
unsafe impl Send for Mapping {}

impl Mapping {
    fn new(fd: &OwnedFd, len: usize, path: &ShmPath) -> Result<Self> {
        // SAFETY: a fresh SHARED mapping of a valid object fd, aliasing no
        // existing Rust object:
        // - fd is open (the Segment owns it) and the object is `len` bytes
        // - mmap returns page-aligned addresses, satisfying u8 alignment
        // - READ|WRITE matches how payloads are filled and handed on
        let ptr = unsafe {
            mmap(
                null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                fd,
                0,
            )
        }
        .map_err(|err| ShmError::posix("mmap", path.as_str(), err))?;

        // SAFETY: mmap never returns null on success.
        let ptr = unsafe { NonNull::new_unchecked(ptr.cast()) };

        Ok(Self {
            ptr,
            len,
            path: path.as_str().to_string(),
            detached: false,
        })
    }

    /// Returns the mapped length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the mapping covers no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the mapped payload.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr/len come from a successful mmap that stays mapped for
        // the lifetime of self.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Returns the mapped payload for writing.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as for as_slice; &mut self guarantees exclusive access.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Unmaps the view, reporting failure.
    ///
    /// # Errors
    ///
    /// Returns an error if `munmap` fails; the region is not retried.
    pub fn detach(mut self) -> Result<()> {
        self.detached = true;
        // SAFETY: ptr/len from a successful mmap; unmapped exactly once
        // (Drop observes the detached flag).
        unsafe { munmap(self.ptr.as_ptr().cast(), self.len) }
            .map_err(|err| ShmError::posix("munmap", &self.path, err))
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if !self.detached {
            // SAFETY: ptr/len from a successful mmap; unmapped exactly once.
            let _ = unsafe { munmap(self.ptr.as_ptr().cast(), self.len) };
        }
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("path", &self.path)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}
