//! Replication module
//!
//! Single-leader replication: the master registers each connected slave,
//! forwards write commands through per-replica buffers, and answers WAIT by
//! collecting acknowledgements; a slave performs the PSYNC handshake and
//! applies the master's command stream.

mod primary;
mod replica;

pub use primary::{ReplicaHandle, ReplicaRegistry, ReplicaSyncState};
pub use replica::ReplicationClient;

use std::sync::atomic::{AtomicU64, Ordering};

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Length of replication and connection identifiers
pub const ID_LENGTH: usize = 40;

/// Role of this server in the replication topology
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepts writes and streams them to replicas
    Master,
    /// Applies the command stream of a master
    Replica,
}

/// Replication ID: a 40-character alphanumeric identifier generated at
/// startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationId(String);

impl ReplicationId {
    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(random_alnum(ID_LENGTH))
    }

    /// Get the ID as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ReplicationId {
    fn default() -> Self {
        Self::generate()
    }
}

impl std::fmt::Display for ReplicationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Random alphanumeric string, used for replication and connection ids
pub(crate) fn random_alnum(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Process-wide replication state
#[derive(Debug)]
pub struct ReplicationState {
    /// Role, fixed at startup
    role: Role,
    /// This server's replication id
    replid: ReplicationId,
    /// Replication stream offset in bytes of RESP-encoded commands.
    ///
    /// On the master it advances when a propagatable command is forwarded; on
    /// a slave it advances as commands from the master are applied. Readers
    /// (INFO, GETACK) may observe a slightly stale value.
    offset: AtomicU64,
}

impl ReplicationState {
    /// Create the state for a server with the given role
    pub fn new(role: Role, replid: ReplicationId) -> Self {
        Self {
            role,
            replid,
            offset: AtomicU64::new(0),
        }
    }

    /// This server's role
    pub fn role(&self) -> Role {
        self.role
    }

    /// This server's replication id
    pub fn replication_id(&self) -> &str {
        self.replid.as_str()
    }

    /// Current replication offset
    pub fn repl_offset(&self) -> u64 {
        self.offset.load(Ordering::SeqCst)
    }

    /// Advance the replication offset
    pub fn increment_offset(&self, bytes: u64) {
        self.offset.fetch_add(bytes, Ordering::SeqCst);
    }

    /// Overwrite the replication offset (handshake adoption on a slave)
    pub fn set_offset(&self, offset: u64) {
        self.offset.store(offset, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replication_id_shape() {
        let id = ReplicationId::generate();
        assert_eq!(id.as_str().len(), ID_LENGTH);
        assert!(id.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(id, ReplicationId::generate());
    }

    #[test]
    fn test_state_offset_is_monotonic() {
        let state = ReplicationState::new(Role::Master, ReplicationId::generate());
        assert_eq!(state.repl_offset(), 0);
        state.increment_offset(31);
        state.increment_offset(14);
        assert_eq!(state.repl_offset(), 45);
    }

    #[test]
    fn test_state_offset_adoption() {
        let state = ReplicationState::new(Role::Replica, ReplicationId::generate());
        state.set_offset(1000);
        state.increment_offset(29);
        assert_eq!(state.repl_offset(), 1029);
        assert_eq!(state.role(), Role::Replica);
    }
}
