//! Control-protocol wire vocabulary.
//!
//! ## Wire Format
//!
//! All control words are 4-byte signed little-endian integers. There is no
//! envelope length or checksum; framing is opcode-driven — each opcode
//! dictates the header words and declared-length payloads that follow it.
//!
//! | Sequence (controller → agent) | Reply |
//! |-------------------------------|-------|
//! | `LUA_CMD, len, bytes[len]` | `CMD_OK` or `CMD_ERROR` |
//! | `CONTROL, SEND_BINARY, size` … `bytes[size]` | `GO_SEND` before the payload |
//! | `TASK_DESC, size, bytes[size]` | none |
//! | `SEND_BINARIES, count, (name[8], size, bytes[size]) × count` | `GO_SEND` per item |
//! | `START` | none |
//!
//! The agent additionally pushes one unsolicited telemetry word per
//! interval while a session is active, interleaved with the replies above.

use std::fmt;

use thiserror::Error;

/// Run a command on the sidecar Lua interpreter.
pub const LUA_CMD: i32 = 0x10;
/// Prefix for control-plane transfer commands.
pub const CONTROL: i32 = 0x20;
/// `CONTROL` sub-opcode: stage one binary payload.
pub const SEND_BINARY: i32 = 0x21;
/// Transfer a task manifest.
pub const TASK_DESC: i32 = 0x30;
/// Transfer a batch of named workload binaries.
pub const SEND_BINARIES: i32 = 0x40;
/// Launch all registered workloads.
pub const START: i32 = 0x50;

/// Reply: the interpreter accepted the command.
pub const CMD_OK: i32 = 0;
/// Reply: the interpreter rejected the command.
pub const CMD_ERROR: i32 = -1;
/// Reply: ready to receive the declared-length payload.
pub const GO_SEND: i32 = 1;

/// Upper bound on interpreter command strings, including any terminating NUL.
pub const MAX_COMMAND_LEN: usize = 1024;

/// A decoded top-level opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Run an interpreter command.
    LuaCmd,
    /// Control-plane transfer (sub-opcode follows).
    Control,
    /// Task manifest transfer.
    TaskDesc,
    /// Named workload binary batch.
    SendBinaries,
    /// Workload launch trigger.
    Start,
}

impl Opcode {
    /// Decodes a wire word into an opcode.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnknownOpcode`] for words the protocol does
    /// not define; the raw word is preserved for diagnostics.
    pub fn decode(word: i32) -> Result<Self, ProtocolError> {
        match word {
            LUA_CMD => Ok(Self::LuaCmd),
            CONTROL => Ok(Self::Control),
            TASK_DESC => Ok(Self::TaskDesc),
            SEND_BINARIES => Ok(Self::SendBinaries),
            START => Ok(Self::Start),
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }
}

/// Frames the protocol does not define.
///
/// The protocol carries no per-opcode length prefix, so an undefined frame
/// cannot be skipped; these errors terminate the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Top-level opcode the protocol does not define.
    #[error("unknown opcode {0:#x}")]
    UnknownOpcode(i32),
    /// `CONTROL` sub-opcode the protocol does not define.
    #[error("unknown control sub-opcode {0:#x}")]
    UnknownControlOp(i32),
    /// Declared payload length that cannot back an allocation.
    #[error("invalid declared length {0}")]
    InvalidLength(i32),
}

/// Fixed-width 8-byte workload binary name.
///
/// Identity is exactly the 8 wire bytes: shorter names arrive NUL-padded
/// and longer names are truncated by the controller before transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BinaryName([u8; 8]);

impl BinaryName {
    /// Number of name bytes on the wire.
    pub const WIRE_LEN: usize = 8;

    /// Wraps the 8 name bytes read off the wire.
    #[must_use]
    pub const fn from_wire(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Returns the raw 8-byte name.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl From<&str> for BinaryName {
    /// Pads or truncates `name` to 8 significant bytes.
    fn from(name: &str) -> Self {
        let mut bytes = [0u8; 8];
        for (dst, src) in bytes.iter_mut().zip(name.bytes()) {
            *dst = src;
        }
        Self(bytes)
    }
}

impl fmt::Display for BinaryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(self.0.len());
        write!(f, "{}", String::from_utf8_lossy(&self.0[..end]))
    }
}
