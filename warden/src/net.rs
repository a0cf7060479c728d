//! Control-channel networking.
//!
//! One fleet controller at a time speaks to the agent over a blocking TCP
//! connection. Reads happen only on the session thread; writes come from
//! both the session thread (protocol replies) and the telemetry thread
//! (utilization samples) and are serialized through [`StreamWriter`] so
//! control words never interleave on the wire.

mod endpoint;
mod stream;

pub use endpoint::Endpoint;
pub use stream::{ControlListener, ControlStream, StreamWriter};
