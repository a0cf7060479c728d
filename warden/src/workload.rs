//! Seams to the node-local collaborators.
//!
//! The agent core drives the sidecar interpreter, the workload
//! registry/launcher, and the utilization sampler through these traits.
//! Production implementations wrap IPC to the node's sidecar services and
//! live with the embedder; the daemon binary and the tests carry their own.

use thiserror::Error;

use crate::proto::BinaryName;
use crate::shm::{Segment, ShmError};

/// Errors produced by a [`WorkloadRegistry`].
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The registry could not produce a backing allocation for the name.
    #[error("allocation failed for workload binary `{name}`")]
    AllocationFailed {
        /// The requested binary name.
        name: BinaryName,
    },
    /// The allocation exists but a shared-memory operation on it failed.
    #[error("shared memory error: {0}")]
    Shm(#[from] ShmError),
}

/// The sidecar configuration interpreter.
pub trait ConfigInterpreter {
    /// Executes one configuration command.
    ///
    /// Returns whether the interpreter accepted the command; rejection is
    /// an application-level error, not a session failure.
    fn execute(&mut self, command: &str) -> bool;
}

/// Registry of workload binaries and manifests, plus the launcher.
pub trait WorkloadRegistry {
    /// Returns `true` while a previously staged payload is still the active
    /// input of a workload launch and must not be reallocated.
    fn buffer_in_use(&self) -> bool;

    /// Returns the backing allocation for a named workload binary,
    /// creating it if absent.
    ///
    /// The allocation stays owned by the registry; the session sizes and
    /// fills it, then detaches its own mapping.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AllocationFailed`] if no allocation can be
    /// produced for the name.
    fn binary_slot(&mut self, name: BinaryName) -> Result<&mut Segment, RegistryError>;

    /// Hands a complete task manifest to the manifest parser.
    ///
    /// The agent does not interpret the bytes; they are whatever the
    /// controller shipped.
    fn ingest_manifest(&mut self, manifest: &[u8]);

    /// Launches all registered workloads through the interpreter.
    fn launch_all(&mut self, interpreter: &mut dyn ConfigInterpreter);
}

/// Source of node utilization samples for the telemetry push loop.
pub trait UtilizationSampler: Send + Sync {
    /// Samples the node's idle-time counter.
    fn idle_time(&self) -> i64;
}
