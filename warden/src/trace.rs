//! Tracing infrastructure for the agent.
//!
//! Enable with `--features tracing`. Every trace macro degrades to a no-op
//! when the feature is disabled, so the control path carries no logging
//! overhead in minimal builds.

/// Initialize the tracing subscriber with timestamps.
///
/// Call this from the daemon binary or at the start of tests to enable
/// trace output. Does nothing if the `tracing` feature is not enabled.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warden=debug"));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .with_timer(fmt::time::uptime()),
        )
        .with(filter)
        .init();
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, error, info, warn};

#[cfg(not(feature = "tracing"))]
macro_rules! debug_noop {
    ($($t:tt)*) => {{}};
}

#[cfg(not(feature = "tracing"))]
macro_rules! error_noop {
    ($($t:tt)*) => {{}};
}

#[cfg(not(feature = "tracing"))]
macro_rules! info_noop {
    ($($t:tt)*) => {{}};
}

#[cfg(not(feature = "tracing"))]
macro_rules! warn_noop {
    ($($t:tt)*) => {{}};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use debug_noop as debug;
#[cfg(not(feature = "tracing"))]
pub(crate) use error_noop as error;
#[cfg(not(feature = "tracing"))]
pub(crate) use info_noop as info;
#[cfg(not(feature = "tracing"))]
pub(crate) use warn_noop as warn;
