//! Protocol dispatcher for one controller session.
//!
//! A session is one read-dispatch loop: read a 4-byte opcode, run its
//! sequence, repeat. No state persists across iterations beyond the
//! staging slot. The loop ends the moment a read or write fails, a
//! resource operation fails, or the controller sends a frame the protocol
//! does not define — the error propagates to the agent loop, which decides
//! whether to log it as a routine disconnect or a fault.

use std::io;

use thiserror::Error;

use crate::net::{ControlStream, StreamWriter};
use crate::proto::{self, BinaryName, MAX_COMMAND_LEN, Opcode, ProtocolError};
use crate::shm::ShmError;
use crate::staging::{StagingError, StagingSlot};
use crate::trace::{debug, info, warn};
use crate::workload::{ConfigInterpreter, RegistryError, WorkloadRegistry};

/// Why a session ended.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A read or write on the control connection failed, including the
    /// controller closing the connection mid-message or between frames.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    /// The controller sent a frame the protocol does not define.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// The staging slot failed at the OS level.
    #[error("staging error: {0}")]
    Staging(#[from] StagingError),
    /// The workload registry could not provide an allocation.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    /// A shared-memory operation on a registry allocation failed.
    #[error("shared memory error: {0}")]
    Shm(#[from] ShmError),
}

impl SessionError {
    /// Transport errors are routine controller disconnects; everything
    /// else is reported loudly by the agent loop.
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Dispatcher state for one controller session.
pub struct Session<'a> {
    stream: ControlStream,
    writer: StreamWriter,
    staging: StagingSlot,
    interpreter: &'a mut dyn ConfigInterpreter,
    registry: &'a mut dyn WorkloadRegistry,
}

impl<'a> Session<'a> {
    /// Creates a session over an accepted controller connection.
    #[must_use]
    pub fn new(
        stream: ControlStream,
        staging: StagingSlot,
        interpreter: &'a mut dyn ConfigInterpreter,
        registry: &'a mut dyn WorkloadRegistry,
    ) -> Self {
        let writer = stream.writer();
        Self {
            stream,
            writer,
            staging,
            interpreter,
            registry,
        }
    }

    /// Runs the read-dispatch loop until the session ends.
    ///
    /// # Errors
    ///
    /// Always returns the [`SessionError`] that ended the session; an
    /// orderly controller disconnect surfaces as a transport error.
    pub fn run(&mut self) -> Result<(), SessionError> {
        loop {
            let word = self.stream.read_word()?;
            match Opcode::decode(word)? {
                Opcode::LuaCmd => self.run_command()?,
                Opcode::Control => self.stage_payload()?,
                Opcode::TaskDesc => self.receive_manifest()?,
                Opcode::SendBinaries => self.receive_binaries()?,
                Opcode::Start => self.launch()?,
            }
        }
    }

    /// Reads a declared payload length, rejecting values that cannot back
    /// an allocation.
    fn read_len(&mut self) -> Result<usize, SessionError> {
        let len = self.stream.read_word()?;
        if len <= 0 {
            return Err(ProtocolError::InvalidLength(len).into());
        }
        Ok(len as usize)
    }

    /// `LUA_CMD`: declared-length command string forwarded to the
    /// interpreter. The declared length includes any terminating NUL.
    fn run_command(&mut self) -> Result<(), SessionError> {
        let len = self.stream.read_word()?;
        if len < 0 {
            return Err(ProtocolError::InvalidLength(len).into());
        }
        let len = len as usize;
        if len > MAX_COMMAND_LEN {
            // Drain the oversized payload so framing survives, then reject.
            warn!(len, "interpreter command exceeds limit, rejecting");
            self.drain(len)?;
            self.writer.write_word(proto::CMD_ERROR)?;
            return Ok(());
        }

        let mut buf = vec![0u8; len];
        self.stream.read_payload(&mut buf)?;
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        let command = String::from_utf8_lossy(&buf[..end]);
        debug!(command = %command, "interpreter command received");

        let status = if self.interpreter.execute(&command) {
            proto::CMD_OK
        } else {
            proto::CMD_ERROR
        };
        self.writer.write_word(status)?;
        Ok(())
    }

    /// Consumes `len` payload bytes without keeping them.
    fn drain(&mut self, len: usize) -> Result<(), SessionError> {
        let mut chunk = [0u8; 256];
        let mut remaining = len;
        while remaining > 0 {
            let take = remaining.min(chunk.len());
            self.stream.read_payload(&mut chunk[..take])?;
            remaining -= take;
        }
        Ok(())
    }

    /// `CONTROL` + `SEND_BINARY`: stage one binary payload in the slot.
    ///
    /// The previous payload is reclaimed first — polling the registry's
    /// busy predicate until the workload lets go — and `GO_SEND` goes out
    /// only once the fresh region is mapped and ready to fill.
    fn stage_payload(&mut self) -> Result<(), SessionError> {
        let sub = self.stream.read_word()?;
        if sub != proto::SEND_BINARY {
            return Err(ProtocolError::UnknownControlOp(sub).into());
        }
        let size = self.read_len()?;
        info!(size, "staging binary payload");

        let Self {
            stream,
            writer,
            staging,
            registry,
            ..
        } = self;
        staging.reclaim(|| registry.buffer_in_use())?;
        let buf = staging.provision(size)?;
        writer.write_word(proto::GO_SEND)?;
        stream.read_payload(buf)?;
        debug!(size, "binary payload staged");
        Ok(())
    }

    /// `TASK_DESC`: declared-length manifest handed whole to the parser.
    ///
    /// Uses the same staging slot as binary payloads, so the previous
    /// payload is reclaimed here too.
    fn receive_manifest(&mut self) -> Result<(), SessionError> {
        let size = self.read_len()?;
        info!(size, "receiving task manifest");

        let Self {
            stream,
            staging,
            registry,
            ..
        } = self;
        staging.reclaim(|| registry.buffer_in_use())?;
        let buf = staging.provision(size)?;
        stream.read_payload(buf)?;
        registry.ingest_manifest(buf);
        Ok(())
    }

    /// `SEND_BINARIES`: batch of named binaries stored through the registry.
    fn receive_binaries(&mut self) -> Result<(), SessionError> {
        let count = self.stream.read_word()?;
        if count < 0 {
            return Err(ProtocolError::InvalidLength(count).into());
        }
        info!(count, "receiving workload binary batch");
        for index in 0..count {
            self.receive_named_binary(index)?;
        }
        Ok(())
    }

    /// One batch item: `name[8], size, bytes[size]`, answered with
    /// `GO_SEND`. The session's mapping is detached after the fill; the
    /// allocation itself stays with the registry for launch.
    fn receive_named_binary(&mut self, _index: i32) -> Result<(), SessionError> {
        let mut name = [0u8; BinaryName::WIRE_LEN];
        self.stream.read_payload(&mut name)?;
        let name = BinaryName::from_wire(name);
        let size = self.read_len()?;
        debug!(name = %name, size, index = _index, "receiving workload binary");

        let Self {
            stream,
            writer,
            registry,
            ..
        } = self;
        let segment = registry.binary_slot(name)?;
        segment.resize(size)?;
        let mut mapping = segment.map()?;
        stream.read_payload(mapping.as_mut_slice())?;
        mapping.detach()?;
        writer.write_word(proto::GO_SEND)?;
        info!(name = %name, size, "workload binary stored");
        Ok(())
    }

    /// `START`: trigger workload launch. No payload, no reply.
    fn launch(&mut self) -> Result<(), SessionError> {
        info!("workload launch requested");
        self.registry.launch_all(&mut *self.interpreter);
        Ok(())
    }
}
