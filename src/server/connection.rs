//! Connection handling
//!
//! This module implements buffered I/O for client connections.

use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{MagnetiteError, Result};
use crate::protocol::{encode_frame, parse_frame, Frame, ParseError};
use crate::replication::{random_alnum, ID_LENGTH};

/// Default buffer size (4KB)
const DEFAULT_CONNECTION_BUFFER_SIZE: usize = 4 * 1024;

/// Identifier assigned to every accepted connection.
///
/// Doubles as the replica identity when the connection is promoted via
/// PSYNC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a fresh 40-character alphanumeric id
    pub fn generate() -> Self {
        Self(random_alnum(ID_LENGTH))
    }

    /// The id as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A connection to a client
pub struct Connection {
    /// The TCP stream
    stream: TcpStream,

    /// Read buffer
    read_buf: BytesMut,

    /// Write buffer
    write_buf: BytesMut,

    /// This connection's id
    pub id: ConnectionId,

    /// Remote peer address
    pub peer_addr: Option<SocketAddr>,
}

impl Connection {
    /// Create a new connection
    pub fn new(stream: TcpStream) -> Self {
        let peer_addr = stream.peer_addr().ok();
        Self {
            stream,
            read_buf: BytesMut::with_capacity(DEFAULT_CONNECTION_BUFFER_SIZE),
            write_buf: BytesMut::with_capacity(DEFAULT_CONNECTION_BUFFER_SIZE),
            id: ConnectionId::generate(),
            peer_addr,
        }
    }

    /// Read a frame from the connection
    ///
    /// Returns `Ok(Some(frame))` if a frame was successfully read,
    /// `Ok(None)` if the connection was closed cleanly,
    /// or `Err` if an error occurred.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            match parse_frame(&mut self.read_buf) {
                Ok(Some(frame)) => return Ok(Some(frame)),
                Ok(None) | Err(ParseError::Incomplete) => {
                    // Need more data
                }
                Err(e) => return Err(e.into()),
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                } else {
                    return Err(MagnetiteError::ConnectionClosed);
                }
            }
        }
    }

    /// Write a frame to the connection (immediate write)
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        encode_frame(frame, &mut self.write_buf);
        self.stream.write_all(&self.write_buf).await?;
        self.write_buf.clear();
        Ok(())
    }

    /// Write raw bytes to the connection, for the RDB blob framing which is
    /// not a RESP value
    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    /// Buffer a frame for later writing (batch write support)
    ///
    /// Call `flush_buffered()` to send all buffered frames at once; this
    /// reduces syscalls for pipelined commands.
    #[inline]
    pub fn buffer_frame(&mut self, frame: &Frame) {
        encode_frame(frame, &mut self.write_buf);
    }

    /// Flush all buffered frames to the connection
    pub async fn flush_buffered(&mut self) -> Result<()> {
        if !self.write_buf.is_empty() {
            self.stream.write_all(&self.write_buf).await?;
            self.write_buf.clear();
        }
        Ok(())
    }

    /// Check if there is pending data in the read buffer
    ///
    /// Returns true if there is unprocessed data in the read buffer,
    /// indicating more pipelined commands may be available.
    #[inline]
    pub fn has_pending_data(&self) -> bool {
        !self.read_buf.is_empty()
    }

    /// Try to parse a frame from the existing buffer without reading from
    /// the socket
    pub fn try_parse_buffered(&mut self) -> Result<Option<Frame>> {
        match parse_frame(&mut self.read_buf) {
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) | Err(ParseError::Incomplete) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Drop buffered input after a framing error so the connection can
    /// resynchronize on the next command
    pub fn discard_read_buf(&mut self) {
        self.read_buf.clear();
    }

    /// Take the connection apart for replica promotion: the raw stream and
    /// any bytes already read past the PSYNC frame
    pub fn into_parts(self) -> (TcpStream, BytesMut) {
        (self.stream, self.read_buf)
    }
}
