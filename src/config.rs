//! Configuration module
//!
//! Configuration is captured from command-line flags at startup and never
//! changes afterwards. `CONFIG GET` reads from this struct.

use std::path::PathBuf;

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing the RDB file
    pub dir: PathBuf,
    /// RDB filename
    pub dbfilename: String,
    /// TCP listen port
    pub port: u16,
    /// `"<host> <port>"` of the master to replicate from, if any
    pub replicaof: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/tmp"),
            dbfilename: "dump.rdb".to_string(),
            port: 6379,
            replicaof: None,
        }
    }
}

impl Config {
    /// The address the listener binds to
    pub fn address(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }

    /// Full path of the RDB file
    pub fn rdb_path(&self) -> PathBuf {
        self.dir.join(&self.dbfilename)
    }

    /// Master address in `host:port` form, if `--replicaof` parses as
    /// `"<host> <port>"`.
    ///
    /// This is only the dial target: whether the server actually becomes a
    /// replica is decided by connecting to it at startup.
    pub fn master_addr(&self) -> Option<String> {
        let replicaof = self.replicaof.as_deref()?;
        let mut parts = replicaof.split_whitespace();
        let host = parts.next()?;
        let port = parts.next()?;
        if parts.next().is_some() || port.parse::<u16>().is_err() {
            return None;
        }
        Some(format!("{host}:{port}"))
    }

    /// Look up a config parameter by name, as exposed via `CONFIG GET`
    pub fn get(&self, name: &str) -> Option<String> {
        match name.to_ascii_lowercase().as_str() {
            "dir" => Some(self.dir.display().to_string()),
            "dbfilename" => Some(self.dbfilename.clone()),
            "port" => Some(self.port.to_string()),
            _ => None,
        }
    }
}
