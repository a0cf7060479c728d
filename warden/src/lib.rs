//! Control-plane node agent for a microkernel cluster node.
//!
//! A warden agent runs on a cluster's management node and serves one fleet
//! controller at a time over a persistent TCP connection. The controller
//! drives a small opcode-based protocol: run interpreter commands on the
//! node's sidecar, stage binary payloads and task manifests into shared
//! memory, upload batches of named workload binaries, and trigger workload
//! launch. While a session is active the agent concurrently pushes periodic
//! utilization telemetry back over the same connection.
//!
//! # Architecture
//!
//! ```text
//!  controller ──TCP──> [agent thread]  accept → dispatch loop → re-accept
//!                          │
//!                          ├── StagingSlot (one reusable shm payload slot)
//!                          │
//!                          └── [telemetry thread]  sample → push → wait
//!                                (per session, cancelled on session end)
//! ```
//!
//! The node-local collaborators (the sidecar interpreter, the workload
//! registry/launcher, and the utilization sampler) are reached through the
//! traits in [`workload`]; the agent core never interprets manifests or
//! launches workloads itself.

pub mod agent;
pub mod net;
pub mod proto;
pub mod session;
pub mod shm;
pub mod staging;
pub mod telemetry;
pub mod workload;

mod trace;

pub use trace::init_tracing;
