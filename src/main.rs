//! Magnetite - a single-leader replicated in-memory key-value server
//!
//! This is the main entry point for the server binary.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use magnetite::config::Config;
use magnetite::server::Server;

/// Magnetite - a single-leader replicated in-memory key-value server
#[derive(Parser, Debug)]
#[command(name = "magnetite")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory containing the RDB file
    #[arg(long = "dir", value_name = "PATH", default_value = "/tmp")]
    dir: PathBuf,

    /// RDB filename
    #[arg(long = "dbfilename", value_name = "FILE", default_value = "dump.rdb")]
    dbfilename: String,

    /// TCP port to listen on
    #[arg(
        short = 'p',
        long = "port",
        value_name = "PORT",
        env = "MAGNETITE_PORT",
        default_value_t = 6379
    )]
    port: u16,

    /// Replicate from a master, given as "<host> <port>"
    #[arg(long = "replicaof", value_name = "HOST PORT")]
    replicaof: Option<String>,
}

impl Cli {
    fn into_config(self) -> Config {
        Config {
            dir: self.dir,
            dbfilename: self.dbfilename,
            port: self.port,
            replicaof: self.replicaof,
        }
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let config = Cli::parse().into_config();

    let server = match Server::new(config).await {
        Ok(server) => server,
        Err(e) => {
            error!("failed to start server: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = server.run().await {
        error!("server error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
