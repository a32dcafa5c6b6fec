//! Request handler
//!
//! One handler runs per accepted connection: read a command frame, dispatch
//! it, write the reply. Replies for pipelined commands are batched. A PSYNC
//! command consumes the handler and turns the connection into a replication
//! channel.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::commands::{Command, CommandExecutor};
use crate::error::Result;
use crate::persistence::generate_rdb;
use crate::protocol::{parse_frame, Frame};
use crate::replication::{
    ReplicaHandle, ReplicaRegistry, ReplicaSyncState, ReplicationState, Role,
};
use crate::storage::Store;

use super::connection::Connection;

/// Dependency bundle for building a Handler
pub struct HandlerDependencies {
    /// Shared keyspace
    pub store: Arc<Store>,
    /// Command executor
    pub executor: CommandExecutor,
    /// Replication state
    pub state: Arc<ReplicationState>,
    /// Master-side replica registry
    pub registry: Arc<ReplicaRegistry>,
    /// Shutdown signal receiver
    pub shutdown_rx: broadcast::Receiver<()>,
}

/// What the dispatcher decided for one frame
enum Outcome {
    /// Write this reply
    Reply(Frame),
    /// Write nothing
    NoReply,
    /// Turn this connection into a replication channel
    Promote,
}

/// Handler for a single client connection
pub struct Handler {
    connection: Connection,
    store: Arc<Store>,
    executor: CommandExecutor,
    state: Arc<ReplicationState>,
    registry: Arc<ReplicaRegistry>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl Handler {
    /// Create a new handler
    pub fn new(connection: Connection, deps: HandlerDependencies) -> Self {
        Self {
            connection,
            store: deps.store,
            executor: deps.executor,
            state: deps.state,
            registry: deps.registry,
            shutdown_rx: deps.shutdown_rx,
        }
    }

    /// Run the handler loop.
    ///
    /// Framing errors are logged and the connection stays open; transport
    /// errors end it. When multiple pipelined commands are buffered, their
    /// replies are flushed together.
    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                result = self.connection.read_frame() => {
                    match result {
                        Ok(Some(frame)) => {
                            let mut promote = false;
                            match self.handle_frame(frame).await {
                                Outcome::Reply(reply) => self.connection.buffer_frame(&reply),
                                Outcome::NoReply => {}
                                Outcome::Promote => promote = true,
                            }

                            // Drain any pipelined commands already buffered
                            while !promote {
                                match self.connection.try_parse_buffered() {
                                    Ok(Some(next)) => match self.handle_frame(next).await {
                                        Outcome::Reply(reply) => {
                                            self.connection.buffer_frame(&reply)
                                        }
                                        Outcome::NoReply => {}
                                        Outcome::Promote => promote = true,
                                    },
                                    Ok(None) => break,
                                    Err(e) => {
                                        warn!(error = %e, "dropping malformed input");
                                        self.connection.discard_read_buf();
                                        break;
                                    }
                                }
                            }

                            self.connection.flush_buffered().await?;
                            if promote {
                                return self.serve_replica().await;
                            }
                        }
                        Ok(None) => {
                            debug!("connection closed");
                            break;
                        }
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => {
                            warn!(error = %e, "dropping malformed input");
                            self.connection.discard_read_buf();
                        }
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    debug!("shutdown signal received, closing connection");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Dispatch a single frame
    async fn handle_frame(&mut self, frame: Frame) -> Outcome {
        let cmd = match Command::from_frame(frame) {
            Ok(cmd) => cmd,
            Err(e) => return Outcome::Reply(Frame::error(e.to_resp_error())),
        };

        match &cmd {
            Command::Psync { .. } => Outcome::Promote,
            Command::Wait {
                numreplicas,
                timeout_ms,
            } => {
                let acked = self
                    .registry
                    .wait_for_acks(
                        *numreplicas,
                        std::time::Duration::from_millis(*timeout_ms),
                    )
                    .await;
                Outcome::Reply(Frame::integer(acked))
            }
            Command::Replconf { args } if args[0].eq_ignore_ascii_case(b"ACK") => {
                // ACKs normally arrive on a promoted replica channel, which
                // reads them itself; one here has nowhere to go.
                Outcome::NoReply
            }
            _ => {
                let reply = self.executor.execute(&cmd);
                if !reply.is_error()
                    && cmd.spec().propagatable
                    && self.state.role() == Role::Master
                {
                    self.registry.propagate(&cmd.to_propagation_frame());
                }
                Outcome::Reply(reply)
            }
        }
    }

    /// Promote this connection to a replication channel.
    ///
    /// Writes `+FULLRESYNC <replid> <offset>`, the RDB blob framed as
    /// `$<len>\r\n<bytes>` with no trailing CRLF, fires the rdb-ready
    /// barrier, then reads REPLCONF ACKs until the slave disconnects.
    async fn serve_replica(self) -> Result<()> {
        let conn_id = self.connection.id.clone();
        info!(replica = %conn_id, "replica registering via PSYNC");

        let (stream, leftover) = self.connection.into_parts();
        let peer_addr = stream.peer_addr().ok();
        let (mut read_half, write_half) = stream.into_split();

        let replica = Arc::new(ReplicaHandle::new(
            conn_id.as_str().to_string(),
            peer_addr,
            write_half,
        ));
        // The FULLRESYNC offset is captured under the registry lock, so
        // every later propagation lands in this replica's buffer.
        let offset = self.registry.register(replica.clone());

        let result = async {
            let fullresync = Frame::simple(format!(
                "FULLRESYNC {} {}",
                self.state.replication_id(),
                offset
            ));
            replica
                .write_direct(&crate::protocol::encode_to_bytes(&fullresync))
                .await?;

            replica.set_sync_state(ReplicaSyncState::RdbSending);
            let rdb = generate_rdb(&self.store);
            let mut framed = BytesMut::with_capacity(rdb.len() + 16);
            framed.extend_from_slice(format!("${}\r\n", rdb.len()).as_bytes());
            framed.extend_from_slice(&rdb);
            replica.write_direct(&framed).await?;

            replica.mark_rdb_ready();
            replica.set_sync_state(ReplicaSyncState::Streaming);
            info!(replica = %conn_id, rdb_bytes = rdb.len(), "replica online");

            // ACK-reading loop: the only traffic a slave sends back
            let mut buf = leftover;
            loop {
                while let Some(frame) = match parse_frame(&mut buf) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(replica = %conn_id, error = %e, "malformed frame from replica");
                        buf.clear();
                        None
                    }
                } {
                    record_ack(&replica, &frame);
                }

                if read_half.read_buf(&mut buf).await? == 0 {
                    break;
                }
            }
            Ok(())
        }
        .await;

        self.registry.unregister(conn_id.as_str());
        info!(replica = %conn_id, "replica disconnected");
        result
    }
}

/// Store a `REPLCONF ACK <offset>` from a replica into its handle
fn record_ack(replica: &ReplicaHandle, frame: &Frame) {
    let Some(items) = frame.as_array() else {
        return;
    };
    let [Frame::Bulk(Some(cmd)), Frame::Bulk(Some(sub)), Frame::Bulk(Some(offset))] = &items[..]
    else {
        return;
    };
    if !cmd.eq_ignore_ascii_case(b"REPLCONF") || !sub.eq_ignore_ascii_case(b"ACK") {
        return;
    }
    if let Some(offset) = std::str::from_utf8(offset).ok().and_then(|s| s.parse().ok()) {
        replica.record_ack(offset);
        debug!(replica = replica.id(), offset, "replica acknowledged");
    }
}
