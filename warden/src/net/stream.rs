//! Blocking TCP transport for the controller connection.
//!
//! The listener polls for connections so the agent loop can observe its
//! shutdown flag between polls; an accepted stream switches back to fully
//! blocking I/O, matching the protocol's sequential read model. Control
//! words are 4-byte signed little-endian integers.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex, PoisonError};

use super::Endpoint;

/// Listener for incoming controller connections.
pub struct ControlListener {
    inner: TcpListener,
}

impl ControlListener {
    /// Binds the listener to the given endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub fn bind(endpoint: Endpoint) -> io::Result<Self> {
        let inner = TcpListener::bind(endpoint.as_socket_addr())?;
        inner.set_nonblocking(true)?;
        Ok(Self { inner })
    }

    /// Returns the endpoint the listener actually bound.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be retrieved.
    pub fn local_addr(&self) -> io::Result<Endpoint> {
        self.inner.local_addr().map(Endpoint::from)
    }

    /// Polls for a pending controller connection.
    ///
    /// Returns `Ok(None)` when no controller is waiting. An accepted
    /// connection is switched to blocking mode before it is handed out.
    ///
    /// # Errors
    ///
    /// Returns an error on accept failure other than `WouldBlock`.
    pub fn poll_accept(&self) -> io::Result<Option<(ControlStream, Endpoint)>> {
        match self.inner.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(false)?;
                Ok(Some((ControlStream::new(stream)?, Endpoint::from(peer))))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// The read side of one accepted controller connection.
///
/// Owned exclusively by the session thread. Replies and telemetry go
/// through the [`StreamWriter`] handle obtained from [`writer`].
///
/// [`writer`]: ControlStream::writer
pub struct ControlStream {
    reader: TcpStream,
    writer: StreamWriter,
}

impl ControlStream {
    fn new(stream: TcpStream) -> io::Result<Self> {
        let writer = StreamWriter::new(stream.try_clone()?);
        Ok(Self {
            reader: stream,
            writer,
        })
    }

    /// Returns a cloneable write handle for this connection.
    #[must_use]
    pub fn writer(&self) -> StreamWriter {
        self.writer.clone()
    }

    /// Reads one 4-byte little-endian control word. Blocks until the word
    /// is complete.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream fails or closes mid-word.
    pub fn read_word(&mut self) -> io::Result<i32> {
        let mut word = [0u8; 4];
        self.reader.read_exact(&mut word)?;
        Ok(i32::from_le_bytes(word))
    }

    /// Fills `buf` completely from the stream.
    ///
    /// # Errors
    ///
    /// A peer that closes before the declared length arrives yields
    /// `UnexpectedEof` — a transport error, never a short read.
    pub fn read_payload(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.reader.read_exact(buf)
    }
}

/// Serialized write handle for one controller connection.
///
/// Cloned into the telemetry thread; the session thread keeps its own
/// clone for protocol replies. The mutex guarantees whole control words on
/// the wire even when both threads write concurrently.
#[derive(Clone)]
pub struct StreamWriter {
    inner: Arc<Mutex<TcpStream>>,
}

impl StreamWriter {
    fn new(stream: TcpStream) -> Self {
        Self {
            inner: Arc::new(Mutex::new(stream)),
        }
    }

    /// Writes one 4-byte little-endian control word.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream fails or closes.
    pub fn write_word(&self, word: i32) -> io::Result<()> {
        let mut stream = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        stream.write_all(&word.to_le_bytes())
    }
}
