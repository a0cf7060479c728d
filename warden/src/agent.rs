//! Agent runtime: the accept/reconnect loop and its thread handles.
//!
//! # Architecture
//!
//! The agent owns one OS thread that serves controllers strictly one at a
//! time: accept, dispatch until the session ends, re-accept. Each session
//! additionally gets its own telemetry thread whose lifetime is scoped to
//! the session — spawned right after accept, cancelled and joined before
//! the next accept.
//!
//! ```text
//! [warden-agent thread]            [warden-telemetry thread]
//!   poll_accept ──────────spawn──────> run (sample → push → wait)
//!   Session::run                          │
//!   (loop until error)                    │
//!   cancel + join <──────────────────── exits on token or dead writer
//!   poll_accept ...
//! ```
//!
//! Session outcomes split two ways: a transport error is a routine
//! controller disconnect and the loop simply re-accepts; a resource or
//! protocol error is logged loudly, the session is abandoned the same way,
//! and the agent keeps serving future controllers.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;

use crate::net::{ControlListener, ControlStream, Endpoint};
use crate::session::Session;
use crate::staging::{RECLAIM_BACKOFF, StagingSlot};
use crate::telemetry::{CancelToken, TELEMETRY_INTERVAL, TelemetryLoop};
use crate::trace::{debug, error, info, warn};
use crate::workload::{ConfigInterpreter, UtilizationSampler, WorkloadRegistry};

/// Default control-channel port.
pub const DEFAULT_PORT: u16 = 9433;

/// Interval between accept polls while waiting for a controller.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Configuration for the agent.
pub struct Config {
    /// Endpoint the control listener binds to.
    pub bind_addr: Endpoint,
    /// Interval between telemetry pushes.
    pub telemetry_interval: Duration,
    /// Backoff between busy-predicate polls while reclaiming the staging
    /// slot.
    pub reclaim_backoff: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: Endpoint::any(DEFAULT_PORT),
            telemetry_interval: TELEMETRY_INTERVAL,
            reclaim_backoff: RECLAIM_BACKOFF,
        }
    }
}

/// Error spawning the agent.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Failed to bind the control listener.
    #[error("failed to bind control listener: {0}")]
    Bind(#[from] io::Error),
}

/// Handle to a running agent.
///
/// Dropping the handle signals shutdown but does not wait; use
/// [`AgentHandle::shutdown`] for a graceful join.
pub struct AgentHandle {
    shutdown_flag: Arc<AtomicBool>,
    local_addr: Endpoint,
    thread: Option<JoinHandle<()>>,
}

impl AgentHandle {
    /// Endpoint the control listener actually bound (ephemeral ports
    /// resolve here).
    #[must_use]
    pub fn local_addr(&self) -> Endpoint {
        self.local_addr
    }

    /// Returns a clone of the shutdown flag for external signal handling.
    #[must_use]
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown_flag)
    }

    /// Signals shutdown and joins the agent thread.
    ///
    /// Takes effect between sessions: an active controller session runs to
    /// its own disconnect first, since control reads are blocking by
    /// design.
    pub fn shutdown(mut self) {
        info!("agent shutdown initiated");
        self.shutdown_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        info!("agent shutdown complete");
    }
}

impl Drop for AgentHandle {
    fn drop(&mut self) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
    }
}

/// The agent's serving state, owned by the agent thread.
pub struct Agent {
    listener: ControlListener,
    telemetry_interval: Duration,
    reclaim_backoff: Duration,
    interpreter: Box<dyn ConfigInterpreter + Send>,
    registry: Box<dyn WorkloadRegistry + Send>,
    sampler: Arc<dyn UtilizationSampler>,
    shutdown_flag: Arc<AtomicBool>,
}

impl Agent {
    /// Binds the control listener and spawns the agent thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    ///
    /// # Panics
    ///
    /// Panics if thread spawning fails.
    pub fn spawn(
        config: Config,
        interpreter: Box<dyn ConfigInterpreter + Send>,
        registry: Box<dyn WorkloadRegistry + Send>,
        sampler: Arc<dyn UtilizationSampler>,
    ) -> Result<AgentHandle, AgentError> {
        let listener = ControlListener::bind(config.bind_addr)?;
        let local_addr = listener.local_addr()?;
        info!(
            bind_addr = %local_addr,
            telemetry_interval_ms = config.telemetry_interval.as_millis() as u64,
            "agent starting"
        );

        let shutdown_flag = Arc::new(AtomicBool::new(false));
        let agent = Self {
            listener,
            telemetry_interval: config.telemetry_interval,
            reclaim_backoff: config.reclaim_backoff,
            interpreter,
            registry,
            sampler,
            shutdown_flag: Arc::clone(&shutdown_flag),
        };

        let thread = thread::Builder::new()
            .name("warden-agent".into())
            .spawn(move || {
                info!("agent thread started");
                agent.run();
                info!("agent thread exiting");
            })
            .expect("failed to spawn agent thread");

        Ok(AgentHandle {
            shutdown_flag,
            local_addr,
            thread: Some(thread),
        })
    }

    /// Serves controllers until shutdown, strictly one at a time.
    fn run(mut self) {
        while !self.shutdown_flag.load(Ordering::Relaxed) {
            match self.listener.poll_accept() {
                Ok(Some((stream, _peer))) => {
                    info!(peer = %_peer, "controller connected");
                    self.serve(stream);
                }
                Ok(None) => thread::sleep(ACCEPT_POLL_INTERVAL),
                Err(_e) => {
                    warn!(error = %_e, "accept failed");
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
            }
        }
    }

    /// Serves one controller session to completion.
    fn serve(&mut self, stream: ControlStream) {
        let token = CancelToken::new();
        let telemetry = TelemetryLoop::new(
            stream.writer(),
            Arc::clone(&self.sampler),
            token.clone(),
            self.telemetry_interval,
        );
        debug!("spawning telemetry thread");
        let telemetry_thread = thread::Builder::new()
            .name("warden-telemetry".into())
            .spawn(move || telemetry.run())
            .expect("failed to spawn telemetry thread");

        let staging = StagingSlot::with_backoff(self.reclaim_backoff);
        let mut session = Session::new(
            stream,
            staging,
            self.interpreter.as_mut(),
            self.registry.as_mut(),
        );
        match session.run() {
            Err(e) if e.is_disconnect() => info!(error = %e, "controller disconnected"),
            Err(_e) => error!(error = %_e, "session terminated"),
            Ok(()) => {}
        }
        // Releases the staging slot (and its shared memory) before the
        // next session; a workload still mapping the payload keeps the
        // pages alive through its own mapping.
        drop(session);

        // Telemetry is scoped to the session: cancel and wait for the
        // thread to observe it before accepting the next controller.
        token.cancel();
        let _ = telemetry_thread.join();
    }
}
