//! Reusable staging slot for controller-pushed payloads.
//!
//! The protocol is sequential and non-pipelined, so one reusable
//! shared-memory allocation per session bounds memory to a single payload
//! at a time. The previous payload may still be the active input of a
//! running workload launch; reuse therefore waits on an injected busy
//! predicate before the old allocation is torn down.

use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::shm::{Mapping, Segment, ShmError, ShmPath};
use crate::trace::debug;

/// Default backoff between busy-predicate polls during reclaim.
pub const RECLAIM_BACKOFF: Duration = Duration::from_millis(50);

/// Errors produced by [`StagingSlot`].
#[derive(Debug, Error)]
pub enum StagingError {
    /// A staged payload is still valid; reclaim before provisioning.
    #[error("staging slot already holds a valid payload")]
    SlotOccupied,
    /// Allocation, mapping, detach, or release failed at the OS level.
    /// Terminal for the session; callers must not retry.
    #[error("shared memory error: {0}")]
    Shm(#[from] ShmError),
}

struct Staged {
    segment: Segment,
    mapping: Mapping,
}

/// The single reusable payload slot owned by one controller session.
///
/// Validity is type state: the slot either holds a staged
/// segment-and-mapping pair or nothing. At most one payload is ever staged
/// at a time, and a new one cannot be provisioned until the previous one is
/// reclaimed.
pub struct StagingSlot {
    path: ShmPath,
    staged: Option<Staged>,
    backoff: Duration,
}

impl StagingSlot {
    /// Creates an empty slot with the default reclaim backoff.
    #[must_use]
    pub fn new() -> Self {
        Self::with_backoff(RECLAIM_BACKOFF)
    }

    /// Creates an empty slot polling the busy predicate every `backoff`.
    ///
    /// The slot's object name is unique per agent process, so concurrent
    /// agents on one host never collide.
    ///
    /// # Panics
    ///
    /// Never panics — the generated name is always valid (starts with `/`,
    /// no extra `/`, well under 255 bytes).
    #[must_use]
    pub fn with_backoff(backoff: Duration) -> Self {
        let path = format!(
            "/warden-stage-{}-{:08x}",
            std::process::id(),
            rand::random::<u32>()
        );
        let path = ShmPath::new(path).expect("generated name is valid");
        // Remove any leftover object from a crashed predecessor.
        Segment::unlink_stale(&path);
        Self {
            path,
            staged: None,
            backoff,
        }
    }

    /// Returns `true` while the slot holds a valid staged payload.
    #[must_use]
    pub fn is_staged(&self) -> bool {
        self.staged.is_some()
    }

    /// Returns the currently staged payload, if any.
    #[must_use]
    pub fn contents(&self) -> Option<&[u8]> {
        self.staged.as_ref().map(|s| s.mapping.as_slice())
    }

    /// Waits until the previous payload is no longer referenced, then
    /// detaches its mapping and releases its backing allocation.
    ///
    /// No-op on an empty slot — the predicate is not consulted. Otherwise
    /// the predicate is polled with this slot's backoff, unbounded: a
    /// workload that never lets go stalls the session, which is acceptable
    /// on this control path.
    ///
    /// # Errors
    ///
    /// Detach or release failure is an OS-level resource error; callers
    /// must treat it as terminal for the session.
    pub fn reclaim(&mut self, in_use: impl Fn() -> bool) -> Result<(), StagingError> {
        let Some(staged) = self.staged.take() else {
            return Ok(());
        };
        while in_use() {
            thread::sleep(self.backoff);
        }
        debug!(path = %self.path, len = staged.mapping.len(), "releasing staged payload");
        staged.mapping.detach()?;
        staged.segment.release()?;
        Ok(())
    }

    /// Allocates and maps a fresh region of exactly `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`StagingError::SlotOccupied`] if a payload is still staged
    /// (callers reclaim first), or a fatal [`StagingError::Shm`] if the
    /// allocation or mapping fails.
    pub fn provision(&mut self, len: usize) -> Result<&mut [u8], StagingError> {
        if self.staged.is_some() {
            return Err(StagingError::SlotOccupied);
        }
        let segment = Segment::allocate(self.path.clone(), len)?;
        let mapping = segment.map()?;
        debug!(path = %self.path, len, "staged payload provisioned");
        let staged = self.staged.insert(Staged { segment, mapping });
        Ok(staged.mapping.as_mut_slice())
    }
}

impl Default for StagingSlot {
    fn default() -> Self {
        Self::new()
    }
}
