//! Slave-side replication
//!
//! The replication client performs the PING → REPLCONF → REPLCONF → PSYNC
//! handshake, ingests the RDB snapshot, and then applies the master's
//! command stream while tracking the applied byte offset. It starts on the
//! connection whose dial decided the replica role and redials the master
//! when the link drops.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::commands::{Command, CommandExecutor};
use crate::error::{MagnetiteError, Result};
use crate::persistence::load_rdb;
use crate::protocol::{encode_to_bytes, encoded_len, parse_frame, Frame};
use crate::storage::Store;

use super::ReplicationState;

/// Delay between reconnection attempts to the master
const RECONNECT_DELAY: Duration = Duration::from_millis(100);

/// Replication client run by a slave against its master
pub struct ReplicationClient {
    store: Arc<Store>,
    state: Arc<ReplicationState>,
    executor: CommandExecutor,
    /// Master address in `host:port` form
    master_addr: String,
    /// Our own listen port, announced during the handshake
    listening_port: u16,
}

impl ReplicationClient {
    /// Create a new replication client
    pub fn new(
        store: Arc<Store>,
        state: Arc<ReplicationState>,
        executor: CommandExecutor,
        master_addr: String,
        listening_port: u16,
    ) -> Self {
        Self {
            store,
            state,
            executor,
            master_addr,
            listening_port,
        }
    }

    /// Run the replication link.
    ///
    /// The first session runs over `initial`, the connection whose
    /// successful dial made this server a replica; afterwards the master is
    /// redialed whenever the link drops.
    pub async fn run(self, initial: TcpStream) {
        let mut conn = Some(initial);
        loop {
            let result = match conn.take() {
                Some(stream) => self.sync(stream).await,
                None => match TcpStream::connect(&self.master_addr).await {
                    Ok(stream) => self.sync(stream).await,
                    Err(e) => Err(e.into()),
                },
            };
            match result {
                Ok(()) => info!("replication stream ended"),
                Err(e) => warn!(master = %self.master_addr, error = %e, "replication link failed"),
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    /// One full session: handshake, ingest the RDB, then apply the stream
    async fn sync(&self, mut stream: TcpStream) -> Result<()> {
        let mut buf = BytesMut::with_capacity(64 * 1024);
        info!(master = %self.master_addr, "connected to master");

        self.handshake(&mut stream, &mut buf).await?;
        let offset = self.psync(&mut stream, &mut buf).await?;
        self.state.set_offset(offset);

        self.receive_rdb(&mut stream, &mut buf).await?;
        info!(offset, "full resync complete, entering command stream");

        self.stream_commands(&mut stream, &mut buf).await
    }

    /// The three pre-PSYNC handshake exchanges
    async fn handshake(&self, stream: &mut TcpStream, buf: &mut BytesMut) -> Result<()> {
        let ping = Frame::array(vec![Frame::bulk("PING")]);
        self.send_frame(stream, &ping).await?;
        let response = self.read_response(stream, buf).await?;
        debug!(?response, "PING response");

        let replconf_port = Frame::array(vec![
            Frame::bulk("REPLCONF"),
            Frame::bulk("listening-port"),
            Frame::bulk(self.listening_port.to_string()),
        ]);
        self.send_frame(stream, &replconf_port).await?;
        let response = self.read_response(stream, buf).await?;
        debug!(?response, "REPLCONF listening-port response");

        let replconf_capa = Frame::array(vec![
            Frame::bulk("REPLCONF"),
            Frame::bulk("capa"),
            Frame::bulk("psync2"),
        ]);
        self.send_frame(stream, &replconf_capa).await?;
        let response = self.read_response(stream, buf).await?;
        debug!(?response, "REPLCONF capa response");

        Ok(())
    }

    /// Send PSYNC ? -1 and parse the FULLRESYNC reply, returning the
    /// master's offset
    async fn psync(&self, stream: &mut TcpStream, buf: &mut BytesMut) -> Result<u64> {
        let psync = Frame::array(vec![
            Frame::bulk("PSYNC"),
            Frame::bulk("?"),
            Frame::bulk("-1"),
        ]);
        self.send_frame(stream, &psync).await?;

        let response = self.read_response(stream, buf).await?;
        let Frame::Simple(line) = &response else {
            return Err(MagnetiteError::Replication(format!(
                "unexpected PSYNC response: {response:?}"
            )));
        };
        let line = std::str::from_utf8(line)
            .map_err(|_| MagnetiteError::Replication("non-UTF-8 PSYNC response".to_string()))?;
        let (_replid, offset) = parse_fullresync(line)?;
        Ok(offset)
    }

    /// Read the RDB blob: a `$<len>\r\n` header (no trailing CRLF after the
    /// payload) followed by exactly `len` bytes, which populate the keyspace.
    async fn receive_rdb(&self, stream: &mut TcpStream, buf: &mut BytesMut) -> Result<()> {
        // Read the length line
        let len = loop {
            if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                if buf[0] != b'$' || pos < 2 {
                    return Err(MagnetiteError::Replication(
                        "malformed RDB length header".to_string(),
                    ));
                }
                let len: usize = std::str::from_utf8(&buf[1..pos - 1])
                    .ok()
                    .and_then(|s| s.trim().parse().ok())
                    .ok_or_else(|| {
                        MagnetiteError::Replication("invalid RDB length".to_string())
                    })?;
                buf.advance(pos + 1);
                break len;
            }
            if stream.read_buf(buf).await? == 0 {
                return Err(MagnetiteError::Replication(
                    "connection closed waiting for RDB".to_string(),
                ));
            }
        };

        while buf.len() < len {
            if stream.read_buf(buf).await? == 0 {
                return Err(MagnetiteError::Replication(
                    "connection closed during RDB transfer".to_string(),
                ));
            }
        }

        match load_rdb(&buf[..len], &self.store) {
            Ok(count) => info!(bytes = len, keys = count, "loaded RDB snapshot"),
            Err(e) => warn!(error = %e, "failed to load RDB snapshot, keyspace left as-is"),
        }
        buf.advance(len);
        Ok(())
    }

    /// Apply the open-ended command stream from the master
    async fn stream_commands(&self, stream: &mut TcpStream, buf: &mut BytesMut) -> Result<()> {
        loop {
            while let Some(frame) =
                parse_frame(buf).map_err(|e| MagnetiteError::Replication(e.to_string()))?
            {
                self.handle_streamed_frame(stream, frame).await?;
            }

            if stream.read_buf(buf).await? == 0 {
                return Err(MagnetiteError::Replication(
                    "master closed connection".to_string(),
                ));
            }
        }
    }

    /// Apply one frame from the master stream.
    ///
    /// GETACK answers with the offset as it stood *before* the GETACK frame
    /// and is not itself counted. Every other frame advances the offset by
    /// its canonical encoded length after being applied; replies stay off
    /// the wire unless the command's registry entry says otherwise, and
    /// errors are logged and skipped.
    async fn handle_streamed_frame(&self, stream: &mut TcpStream, frame: Frame) -> Result<()> {
        if is_getack(&frame) {
            let ack = Frame::array(vec![
                Frame::bulk("REPLCONF"),
                Frame::bulk("ACK"),
                Frame::bulk(self.state.repl_offset().to_string()),
            ]);
            self.send_frame(stream, &ack).await?;
            debug!(offset = self.state.repl_offset(), "answered GETACK");
            return Ok(());
        }

        let size = encoded_len(&frame) as u64;

        match Command::from_frame(frame) {
            Ok(cmd) => {
                let reply = self.executor.execute(&cmd);
                if reply.is_error() {
                    warn!(command = cmd.name(), ?reply, "replicated command failed");
                } else if !cmd.spec().suppress_reply {
                    self.send_frame(stream, &reply).await?;
                }
            }
            Err(e) => warn!(error = %e, "unparseable frame on replication stream"),
        }

        self.state.increment_offset(size);
        Ok(())
    }

    async fn send_frame(&self, stream: &mut TcpStream, frame: &Frame) -> Result<()> {
        let bytes = encode_to_bytes(frame);
        stream.write_all(&bytes).await?;
        Ok(())
    }

    async fn read_response(&self, stream: &mut TcpStream, buf: &mut BytesMut) -> Result<Frame> {
        loop {
            if let Some(frame) =
                parse_frame(buf).map_err(|e| MagnetiteError::Replication(e.to_string()))?
            {
                return Ok(frame);
            }
            if stream.read_buf(buf).await? == 0 {
                return Err(MagnetiteError::Replication(
                    "connection closed during handshake".to_string(),
                ));
            }
        }
    }
}

/// Parse a `FULLRESYNC <replid> <offset>` line
fn parse_fullresync(line: &str) -> Result<(&str, u64)> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let ["FULLRESYNC", replid, offset] = parts.as_slice() else {
        return Err(MagnetiteError::Replication(format!(
            "unexpected PSYNC response: {line}"
        )));
    };
    let offset = offset
        .parse()
        .map_err(|_| MagnetiteError::Replication("invalid FULLRESYNC offset".to_string()))?;
    Ok((*replid, offset))
}

/// Whether a frame is `REPLCONF GETACK ...`
fn is_getack(frame: &Frame) -> bool {
    let Some(items) = frame.as_array() else {
        return false;
    };
    let [Frame::Bulk(Some(cmd)), Frame::Bulk(Some(sub)), ..] = &items[..] else {
        return false;
    };
    cmd.eq_ignore_ascii_case(b"REPLCONF") && sub.eq_ignore_ascii_case(b"GETACK")
}
