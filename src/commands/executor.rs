//! Command execution
//!
//! The executor runs keyspace-level commands against the shared store. It is
//! used by both the client connection handler and the slave's command-apply
//! loop, so it carries no connection state of its own.

use std::sync::Arc;

use crate::config::Config;
use crate::protocol::Frame;
use crate::replication::{ReplicationState, Role};
use crate::storage::Store;

use super::{keys, strings, Command};

/// Executes commands against the shared server state
#[derive(Clone)]
pub struct CommandExecutor {
    store: Arc<Store>,
    config: Arc<Config>,
    state: Arc<ReplicationState>,
}

impl CommandExecutor {
    /// Create a new executor
    pub fn new(store: Arc<Store>, config: Arc<Config>, state: Arc<ReplicationState>) -> Self {
        Self {
            store,
            config,
            state,
        }
    }

    /// Execute a command and produce its reply frame
    pub fn execute(&self, cmd: &Command) -> Frame {
        match cmd {
            Command::Get { key } => strings::get(&self.store, key),
            Command::Set {
                key,
                value,
                options,
            } => strings::set(&self.store, key.clone(), value.clone(), options),
            Command::Echo { message } => Frame::Bulk(Some(message.clone())),
            Command::Ping => Frame::simple("PONG"),
            Command::ConfigGet { names } => self.config_get(names),
            Command::Keys { pattern } => keys::keys(&self.store, pattern),
            Command::Info { section } => self.info(section),
            Command::Select { .. } => Frame::simple("OK"),
            Command::Replconf { args } => self.replconf(args),
            // PSYNC and WAIT need the connection context; the handler
            // intercepts them before execution reaches this point.
            Command::Psync { .. } | Command::Wait { .. } => Frame::error("ERR syntax error"),
        }
    }

    fn config_get(&self, names: &[String]) -> Frame {
        let mut items = Vec::new();
        for name in names {
            if let Some(value) = self.config.get(name) {
                items.push(Frame::bulk(name.clone()));
                items.push(Frame::bulk(value));
            }
        }
        Frame::array(items)
    }

    fn info(&self, section: &str) -> Frame {
        if !section.eq_ignore_ascii_case("REPLICATION") {
            return Frame::error("ERR syntax error");
        }

        let mut out = String::from("#REPLICATION\r\n");
        match self.state.role() {
            Role::Master => {
                out.push_str("role:master\r\n");
                out.push_str(&format!(
                    "master_replid:{}\r\n",
                    self.state.replication_id()
                ));
                out.push_str(&format!(
                    "master_repl_offset:{}\r\n",
                    self.state.repl_offset()
                ));
            }
            Role::Replica => out.push_str("role:slave\r\n"),
        }
        Frame::bulk(out)
    }

    fn replconf(&self, args: &[bytes::Bytes]) -> Frame {
        if args[0].eq_ignore_ascii_case(b"GETACK") {
            return Frame::array(vec![
                Frame::bulk("REPLCONF"),
                Frame::bulk("ACK"),
                Frame::bulk(self.state.repl_offset().to_string()),
            ]);
        }
        // listening-port, capa, and friends are acknowledged and recorded
        // nowhere: replica identity is keyed by connection id at PSYNC time.
        Frame::simple("OK")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::ReplicationId;
    use bytes::Bytes;

    use super::super::SetOptions;

    fn executor(role: Role) -> CommandExecutor {
        CommandExecutor::new(
            Arc::new(Store::new()),
            Arc::new(Config::default()),
            Arc::new(ReplicationState::new(role, ReplicationId::generate())),
        )
    }

    #[test]
    fn test_ping_and_echo() {
        let exec = executor(Role::Master);
        assert_eq!(exec.execute(&Command::Ping), Frame::simple("PONG"));
        assert_eq!(
            exec.execute(&Command::Echo {
                message: Bytes::from("hello world")
            }),
            Frame::bulk("hello world")
        );
    }

    #[test]
    fn test_set_get_flow() {
        let exec = executor(Role::Master);
        let reply = exec.execute(&Command::Set {
            key: Bytes::from("k"),
            value: Bytes::from("v"),
            options: SetOptions::default(),
        });
        assert_eq!(reply, Frame::simple("OK"));
        assert_eq!(
            exec.execute(&Command::Get {
                key: Bytes::from("k")
            }),
            Frame::simple("v")
        );
    }

    #[test]
    fn test_config_get_skips_unknown() {
        let exec = executor(Role::Master);
        let reply = exec.execute(&Command::ConfigGet {
            names: vec!["dir".to_string(), "bogus".to_string()],
        });
        let arr = reply.into_array().unwrap();
        assert_eq!(arr.len(), 2);
        assert_eq!(arr[0], Frame::bulk("dir"));
        assert_eq!(arr[1], Frame::bulk("/tmp"));
    }

    #[test]
    fn test_info_master() {
        let exec = executor(Role::Master);
        let reply = exec.execute(&Command::Info {
            section: "replication".to_string(),
        });
        let text = reply.as_str().unwrap().to_string();
        assert!(text.starts_with("#REPLICATION\r\n"));
        assert!(text.contains("role:master\r\n"));
        assert!(text.contains("master_replid:"));
        assert!(text.contains("master_repl_offset:0\r\n"));
    }

    #[test]
    fn test_info_slave() {
        let exec = executor(Role::Replica);
        let reply = exec.execute(&Command::Info {
            section: "REPLICATION".to_string(),
        });
        let text = reply.as_str().unwrap().to_string();
        assert!(text.contains("role:slave\r\n"));
        assert!(!text.contains("master_replid"));
    }

    #[test]
    fn test_info_unknown_section() {
        let exec = executor(Role::Master);
        let reply = exec.execute(&Command::Info {
            section: "keyspace".to_string(),
        });
        assert!(reply.is_error());
    }

    #[test]
    fn test_select_is_noop_ok() {
        let exec = executor(Role::Master);
        assert_eq!(
            exec.execute(&Command::Select { index: 7 }),
            Frame::simple("OK")
        );
    }

    #[test]
    fn test_replconf_getack_reports_offset() {
        let exec = executor(Role::Replica);
        exec.state.increment_offset(37);
        let reply = exec.execute(&Command::Replconf {
            args: vec![Bytes::from("GETACK"), Bytes::from("*")],
        });
        assert_eq!(
            reply,
            Frame::array(vec![
                Frame::bulk("REPLCONF"),
                Frame::bulk("ACK"),
                Frame::bulk("37"),
            ])
        );
    }

    #[test]
    fn test_replconf_handshake_ok() {
        let exec = executor(Role::Master);
        let reply = exec.execute(&Command::Replconf {
            args: vec![Bytes::from("listening-port"), Bytes::from("6380")],
        });
        assert_eq!(reply, Frame::simple("OK"));
    }
}
