//! Persistence module
//!
//! RDB snapshots back both the on-disk state file and the replication
//! full-sync blob.

mod rdb;

pub use rdb::{generate_rdb, load_rdb, RdbEntry, RdbReader, RdbWriter};

use std::path::Path;

use crate::error::Result;
use crate::storage::Store;

/// Load an RDB file into the store.
///
/// A missing file is not an error: the server starts with an empty keyspace.
pub fn load_rdb_file(path: &Path, store: &Store) -> Result<usize> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    load_rdb(&data, store)
}
