//! Command layer
//!
//! This module implements command parsing (RESP frames to typed [`Command`]
//! values), the command registry with its per-command flags, and execution.
//!
//! # Adding a new command
//!
//! 1. Add a variant to the [`Command`] enum and a match arm in
//!    `Command::from_frame`.
//! 2. Add a [`CommandSpec`] row to the registry table.
//! 3. Add the execution logic in the executor and tests alongside.

mod executor;
pub mod keys;
mod strings;

pub use executor::CommandExecutor;

use bytes::Bytes;

use crate::error::{MagnetiteError, Result};
use crate::protocol::Frame;

/// SET command options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Expiration in milliseconds
    pub expire_ms: Option<u64>,
    /// Return the previous value
    pub get: bool,
}

/// Parsed command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// GET key
    Get {
        /// Key to read
        key: Bytes,
    },
    /// SET key value [EX seconds | PX milliseconds] [GET]
    Set {
        /// Key to write
        key: Bytes,
        /// Value to store
        value: Bytes,
        /// Optional flags parsed after the value
        options: SetOptions,
    },
    /// ECHO message
    Echo {
        /// Message to echo back
        message: Bytes,
    },
    /// PING
    Ping,
    /// CONFIG GET name [name ...]
    ConfigGet {
        /// Requested parameter names
        names: Vec<String>,
    },
    /// KEYS pattern
    Keys {
        /// Glob pattern
        pattern: String,
    },
    /// INFO section
    Info {
        /// Requested section
        section: String,
    },
    /// REPLCONF arg [arg ...]
    Replconf {
        /// Raw subcommand arguments
        args: Vec<Bytes>,
    },
    /// PSYNC replid offset
    Psync {
        /// Replication id requested by the replica (`?` for a fresh sync)
        replid: String,
        /// Offset requested by the replica (`-1` for a fresh sync)
        offset: i64,
    },
    /// WAIT numreplicas timeout
    Wait {
        /// Number of replica acknowledgements to wait for
        numreplicas: u64,
        /// Timeout in milliseconds
        timeout_ms: u64,
    },
    /// SELECT index (accepted, no-op)
    Select {
        /// Database index
        index: u64,
    },
}

impl Command {
    /// Parse a command from a RESP frame.
    ///
    /// The top-level frame must be a non-empty array of bulk strings.
    pub fn from_frame(frame: Frame) -> Result<Command> {
        let items = frame
            .into_array()
            .ok_or_else(|| MagnetiteError::InvalidFormat("expected command array".to_string()))?;
        if items.is_empty() {
            return Err(MagnetiteError::EmptyCommand);
        }

        let mut args = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Frame::Bulk(Some(data)) => args.push(data),
                // A null bulk is a negative-length argument
                Frame::Bulk(None) => return Err(MagnetiteError::BulkStringTooLarge(-1)),
                _ => {
                    return Err(MagnetiteError::InvalidFormat(
                        "command arguments must be bulk strings".to_string(),
                    ))
                }
            }
        }

        let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
        let args = &args[1..];

        match name.as_str() {
            "GET" => {
                let [key] = args else {
                    return Err(MagnetiteError::Syntax);
                };
                Ok(Command::Get { key: key.clone() })
            }
            "SET" => parse_set(args),
            "ECHO" => {
                let [message] = args else {
                    return Err(MagnetiteError::Syntax);
                };
                Ok(Command::Echo {
                    message: message.clone(),
                })
            }
            "PING" => {
                if !args.is_empty() {
                    return Err(MagnetiteError::Syntax);
                }
                Ok(Command::Ping)
            }
            "CONFIG" => {
                let Some((sub, names)) = args.split_first() else {
                    return Err(MagnetiteError::Syntax);
                };
                if !sub.eq_ignore_ascii_case(b"GET") || names.is_empty() {
                    return Err(MagnetiteError::Syntax);
                }
                let names = names
                    .iter()
                    .map(|n| String::from_utf8_lossy(n).into_owned())
                    .collect();
                Ok(Command::ConfigGet { names })
            }
            "KEYS" => {
                let [pattern] = args else {
                    return Err(MagnetiteError::Syntax);
                };
                Ok(Command::Keys {
                    pattern: String::from_utf8_lossy(pattern).into_owned(),
                })
            }
            "INFO" => {
                let [section] = args else {
                    return Err(MagnetiteError::Syntax);
                };
                Ok(Command::Info {
                    section: String::from_utf8_lossy(section).into_owned(),
                })
            }
            "REPLCONF" => {
                if args.is_empty() {
                    return Err(MagnetiteError::Syntax);
                }
                Ok(Command::Replconf {
                    args: args.to_vec(),
                })
            }
            "PSYNC" => {
                let [replid, offset] = args else {
                    return Err(MagnetiteError::Syntax);
                };
                let offset = std::str::from_utf8(offset)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or(MagnetiteError::Syntax)?;
                Ok(Command::Psync {
                    replid: String::from_utf8_lossy(replid).into_owned(),
                    offset,
                })
            }
            "WAIT" => {
                let [numreplicas, timeout_ms] = args else {
                    return Err(MagnetiteError::Syntax);
                };
                let numreplicas = parse_u64(numreplicas).ok_or(MagnetiteError::Syntax)?;
                let timeout_ms = parse_u64(timeout_ms).ok_or(MagnetiteError::Syntax)?;
                Ok(Command::Wait {
                    numreplicas,
                    timeout_ms,
                })
            }
            "SELECT" => {
                let [index] = args else {
                    return Err(MagnetiteError::Syntax);
                };
                let index = parse_u64(index).ok_or(MagnetiteError::Syntax)?;
                Ok(Command::Select { index })
            }
            _ => Err(MagnetiteError::UnknownCommand(name)),
        }
    }

    /// Uppercased command name, as keyed in the registry
    pub fn name(&self) -> &'static str {
        match self {
            Command::Get { .. } => "GET",
            Command::Set { .. } => "SET",
            Command::Echo { .. } => "ECHO",
            Command::Ping => "PING",
            Command::ConfigGet { .. } => "CONFIG",
            Command::Keys { .. } => "KEYS",
            Command::Info { .. } => "INFO",
            Command::Replconf { .. } => "REPLCONF",
            Command::Psync { .. } => "PSYNC",
            Command::Wait { .. } => "WAIT",
            Command::Select { .. } => "SELECT",
        }
    }

    /// Registry entry for this command
    pub fn spec(&self) -> &'static CommandSpec {
        // Every parseable command has a registry row
        lookup_command(self.name()).expect("parsed command missing from registry")
    }

    /// Canonical frame used to forward this command to replicas.
    ///
    /// The replication offset counts the bytes of this encoding, so it must
    /// be stable for a given logical command. Expirations are normalized to
    /// `PX <ms>`; the `GET` option is not forwarded.
    pub fn to_propagation_frame(&self) -> Frame {
        match self {
            Command::Set { key, value, options } => {
                let mut items = vec![
                    Frame::bulk("SET"),
                    Frame::bulk(key.clone()),
                    Frame::bulk(value.clone()),
                ];
                if let Some(ms) = options.expire_ms {
                    items.push(Frame::bulk("PX"));
                    items.push(Frame::bulk(ms.to_string()));
                }
                Frame::array(items)
            }
            // Only SET carries arguments that replicas need; nothing else is
            // propagatable per the registry.
            other => Frame::array(vec![Frame::bulk(other.name())]),
        }
    }
}

fn parse_u64(raw: &Bytes) -> Option<u64> {
    std::str::from_utf8(raw).ok()?.parse().ok()
}

/// Parse `SET key value [EX seconds | PX milliseconds] [GET]`.
///
/// Flags may appear in any order after the value; an unknown flag is a
/// syntax error, a non-numeric expiry argument its own error. A TTL of zero
/// or less means no expiration.
fn parse_set(args: &[Bytes]) -> Result<Command> {
    if args.len() < 2 {
        return Err(MagnetiteError::Syntax);
    }
    let key = args[0].clone();
    let value = args[1].clone();
    let mut options = SetOptions::default();

    let mut i = 2;
    while i < args.len() {
        let opt = String::from_utf8_lossy(&args[i]).to_ascii_uppercase();
        match opt.as_str() {
            "EX" => {
                i += 1;
                let seconds = expiry_amount(args.get(i), "EX")?;
                options.expire_ms = (seconds > 0).then(|| seconds as u64 * 1000);
            }
            "PX" => {
                i += 1;
                let ms = expiry_amount(args.get(i), "PX")?;
                options.expire_ms = (ms > 0).then(|| ms as u64);
            }
            "GET" => options.get = true,
            _ => return Err(MagnetiteError::Syntax),
        }
        i += 1;
    }

    Ok(Command::Set {
        key,
        value,
        options,
    })
}

fn expiry_amount(raw: Option<&Bytes>, unit: &'static str) -> Result<i64> {
    let raw = raw.ok_or(MagnetiteError::Syntax)?;
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(MagnetiteError::InvalidExpiryTime(unit))
}

/// Per-command registry flags
#[derive(Debug)]
pub struct CommandSpec {
    /// Uppercased command name
    pub name: &'static str,
    /// Mutates the keyspace
    pub writable: bool,
    /// Forwarded to replicas after a successful run on the master
    pub propagatable: bool,
    /// No reply is echoed when a slave applies this from its master stream
    pub suppress_reply: bool,
}

/// The command registry. Writable commands must also be propagatable; see
/// [`validate_registry`].
pub static COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "GET",
        writable: false,
        propagatable: false,
        suppress_reply: false,
    },
    CommandSpec {
        name: "SET",
        writable: true,
        propagatable: true,
        suppress_reply: true,
    },
    CommandSpec {
        name: "ECHO",
        writable: false,
        propagatable: false,
        suppress_reply: false,
    },
    CommandSpec {
        name: "PING",
        writable: false,
        propagatable: false,
        suppress_reply: true,
    },
    CommandSpec {
        name: "CONFIG",
        writable: false,
        propagatable: false,
        suppress_reply: false,
    },
    CommandSpec {
        name: "KEYS",
        writable: false,
        propagatable: false,
        suppress_reply: false,
    },
    CommandSpec {
        name: "INFO",
        writable: false,
        propagatable: false,
        suppress_reply: false,
    },
    CommandSpec {
        name: "REPLCONF",
        writable: false,
        propagatable: false,
        suppress_reply: true,
    },
    CommandSpec {
        name: "PSYNC",
        writable: false,
        propagatable: false,
        suppress_reply: false,
    },
    CommandSpec {
        name: "WAIT",
        writable: false,
        propagatable: false,
        suppress_reply: false,
    },
    CommandSpec {
        name: "SELECT",
        writable: false,
        propagatable: false,
        suppress_reply: true,
    },
];

/// Look up a registry entry by uppercased name
pub fn lookup_command(name: &str) -> Option<&'static CommandSpec> {
    COMMANDS.iter().find(|spec| spec.name == name)
}

/// Check the registry's structural invariant: every writable command is also
/// propagatable. Called once at server construction.
pub fn validate_registry() {
    for spec in COMMANDS {
        assert!(
            !spec.writable || spec.propagatable,
            "writable command {} must be propagatable",
            spec.name
        );
    }
}
