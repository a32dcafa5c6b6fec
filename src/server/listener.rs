//! TCP server listener
//!
//! This module implements the main TCP server that accepts connections and
//! spawns one handler task per client.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::commands::{validate_registry, CommandExecutor};
use crate::config::Config;
use crate::error::Result;
use crate::persistence::load_rdb_file;
use crate::replication::{
    ReplicaRegistry, ReplicationClient, ReplicationId, ReplicationState, Role,
};
use crate::storage::Store;

use super::connection::Connection;
use super::handler::{Handler, HandlerDependencies};

/// Magnetite TCP server
pub struct Server {
    /// Server configuration
    config: Arc<Config>,

    /// TCP listener
    listener: TcpListener,

    /// Shared keyspace
    store: Arc<Store>,

    /// Replication state (role, id, offset)
    state: Arc<ReplicationState>,

    /// Master-side replica registry
    registry: Arc<ReplicaRegistry>,

    /// Command executor shared by all handlers
    executor: CommandExecutor,

    /// Shutdown signal sender
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Create a new server instance.
    ///
    /// Binds the listener, loads the RDB file if one exists, decides the
    /// replication role by dialing `--replicaof`, and on a slave starts the
    /// replication client task on the freshly dialed connection.
    pub async fn new(config: Config) -> Result<Self> {
        validate_registry();

        let addr = config.address();
        let listener = TcpListener::bind(&addr).await?;
        info!("server listening on {}", addr);

        let store = Arc::new(Store::new());
        match load_rdb_file(&config.rdb_path(), &store) {
            Ok(0) => {}
            Ok(count) => info!(path = %config.rdb_path().display(), keys = count, "loaded RDB file"),
            Err(e) => {
                warn!(path = %config.rdb_path().display(), error = %e,
                    "failed to load RDB file, starting with an empty keyspace");
            }
        }

        // The role is decided by whether --replicaof is actually reachable:
        // dial it once, and keep the connection for the first sync
        let master_link = match config.master_addr() {
            Some(addr) => match TcpStream::connect(&addr).await {
                Ok(stream) => Some((addr, stream)),
                Err(e) => {
                    warn!(master = %addr, error = %e, "cannot reach --replicaof, staying master");
                    None
                }
            },
            None => None,
        };
        let role = if master_link.is_some() {
            Role::Replica
        } else {
            Role::Master
        };

        let config = Arc::new(config);
        let state = Arc::new(ReplicationState::new(role, ReplicationId::generate()));
        let registry = ReplicaRegistry::new(state.clone());
        let executor = CommandExecutor::new(store.clone(), config.clone(), state.clone());
        let (shutdown_tx, _) = broadcast::channel(1);

        if let Some((master_addr, stream)) = master_link {
            info!(master = %master_addr, "starting as replica");
            let client = ReplicationClient::new(
                store.clone(),
                state.clone(),
                executor.clone(),
                master_addr,
                config.port,
            );
            tokio::spawn(client.run(stream));
        }

        Ok(Self {
            config,
            listener,
            store,
            state,
            registry,
            executor,
            shutdown_tx,
        })
    }

    /// The address the listener actually bound (useful with port 0)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the server until a shutdown signal is received
    pub async fn run(self) -> Result<()> {
        let shutdown_tx = self.shutdown_tx.clone();

        tokio::spawn(async move {
            if let Err(e) = signal::ctrl_c().await {
                error!("failed to listen for ctrl-c: {}", e);
                return;
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(());
        });

        self.accept_loop().await
    }

    /// Accept connections in a loop
    async fn accept_loop(self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!("accepted connection from {}", addr);

                            let connection = Connection::new(stream);
                            let deps = HandlerDependencies {
                                store: self.store.clone(),
                                executor: self.executor.clone(),
                                state: self.state.clone(),
                                registry: self.registry.clone(),
                                shutdown_rx: self.shutdown_tx.subscribe(),
                            };
                            let handler = Handler::new(connection, deps);

                            tokio::spawn(async move {
                                if let Err(e) = handler.run().await {
                                    warn!("connection error from {}: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Configuration in use
    pub fn config(&self) -> &Config {
        &self.config
    }
}
