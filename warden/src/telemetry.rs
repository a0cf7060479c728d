//! Telemetry push loop and its cancellation token.
//!
//! One telemetry thread runs per controller session, pushing an idle-time
//! sample over the session's connection every interval. Cancellation is
//! cooperative but promptly observable: the token wakes a mid-interval
//! waiter, so teardown latency is not bounded by the push interval.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use crate::net::StreamWriter;
use crate::trace::{debug, info};
use crate::workload::UtilizationSampler;

/// Default interval between telemetry pushes.
pub const TELEMETRY_INTERVAL: Duration = Duration::from_millis(2000);

/// Cooperative cancellation token observable mid-wait.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    /// Creates a fresh, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation and wakes every waiter.
    pub fn cancel(&self) {
        let (flag, cvar) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    /// Returns `true` once cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self
            .inner
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits up to `timeout`, returning early when cancelled.
    ///
    /// Returns `true` if the token was cancelled, `false` on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// Pushes one idle-time sample per interval until cancelled or the
/// connection dies.
pub struct TelemetryLoop {
    writer: StreamWriter,
    sampler: Arc<dyn UtilizationSampler>,
    token: CancelToken,
    interval: Duration,
}

impl TelemetryLoop {
    /// Creates a push loop bound to one session's connection.
    #[must_use]
    pub fn new(
        writer: StreamWriter,
        sampler: Arc<dyn UtilizationSampler>,
        token: CancelToken,
        interval: Duration,
    ) -> Self {
        Self {
            writer,
            sampler,
            token,
            interval,
        }
    }

    /// Runs the push loop to completion.
    ///
    /// Successive pushes are spaced at least one interval apart. The wire
    /// field is 32-bit, so out-of-range samples saturate to the i32 bounds.
    /// A write failure ends the loop: telemetry is best-effort, and the
    /// session thread observes the dead connection on its own read side.
    pub fn run(self) {
        info!("telemetry loop started");
        while !self.token.is_cancelled() {
            let sample = self.sampler.idle_time();
            let word = sample.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
            if let Err(_e) = self.writer.write_word(word) {
                debug!(error = %_e, "telemetry write failed, stopping push loop");
                break;
            }
            if self.token.wait(self.interval) {
                break;
            }
        }
        info!("telemetry loop exiting");
    }
}
