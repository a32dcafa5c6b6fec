//! RDB snapshot format
//!
//! This module implements RDB serialization and deserialization. The same
//! codec backs the on-disk snapshot file and the replication full-sync blob.
//! Only the string value type is produced; unknown value types fail the load.

use bytes::{BufMut, Bytes, BytesMut};
use std::io::Read;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{MagnetiteError, Result};
use crate::storage::{Store, Value};

// RDB constants
const RDB_MAGIC: &[u8] = b"REDIS";
const RDB_VERSION: &[u8] = b"0011";

// RDB opcodes
const RDB_OPCODE_AUX: u8 = 0xFA;
const RDB_OPCODE_RESIZEDB: u8 = 0xFB;
const RDB_OPCODE_EXPIRETIME_MS: u8 = 0xFC;
const RDB_OPCODE_EXPIRETIME: u8 = 0xFD;
const RDB_OPCODE_SELECTDB: u8 = 0xFE;
const RDB_OPCODE_EOF: u8 = 0xFF;

// RDB type constants
const RDB_TYPE_STRING: u8 = 0;

// RDB special string encodings
const RDB_ENC_INT8: u8 = 0;
const RDB_ENC_INT16: u8 = 1;
const RDB_ENC_INT32: u8 = 2;

/// RDB writer for creating snapshots
pub struct RdbWriter {
    buffer: BytesMut,
}

impl RdbWriter {
    /// Create a new RDB writer
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(16 * 1024),
        }
    }

    /// Write the RDB header
    pub fn write_header(&mut self) {
        self.buffer.extend_from_slice(RDB_MAGIC);
        self.buffer.extend_from_slice(RDB_VERSION);
    }

    /// Write an auxiliary field
    pub fn write_aux(&mut self, key: &str, value: &str) {
        self.buffer.put_u8(RDB_OPCODE_AUX);
        self.write_string(key.as_bytes());
        self.write_string(value.as_bytes());
    }

    /// Write the database selector
    pub fn write_select_db(&mut self, db: u8) {
        self.buffer.put_u8(RDB_OPCODE_SELECTDB);
        self.write_length(db as u64);
    }

    /// Write resize db info (keyspace size and number of expiring keys)
    pub fn write_resize_db(&mut self, db_size: u64, expires_size: u64) {
        self.buffer.put_u8(RDB_OPCODE_RESIZEDB);
        self.write_length(db_size);
        self.write_length(expires_size);
    }

    /// Write a string record, with optional expiry in epoch milliseconds
    pub fn write_string_record(&mut self, key: &[u8], value: &[u8], expire_ms: Option<u64>) {
        if let Some(expire_ms) = expire_ms {
            self.buffer.put_u8(RDB_OPCODE_EXPIRETIME_MS);
            self.buffer.put_u64_le(expire_ms);
        }
        self.buffer.put_u8(RDB_TYPE_STRING);
        self.write_string(key);
        self.write_string(value);
    }

    /// Write EOF marker and checksum
    pub fn write_eof(&mut self) {
        self.buffer.put_u8(RDB_OPCODE_EOF);
        let checksum = crc64(&self.buffer);
        self.buffer.put_u64_le(checksum);
    }

    /// Get the serialized RDB data
    pub fn into_bytes(self) -> Bytes {
        self.buffer.freeze()
    }

    /// Write a length-encoded integer
    fn write_length(&mut self, len: u64) {
        if len < 64 {
            // 6-bit length (00xxxxxx)
            self.buffer.put_u8(len as u8);
        } else if len < 16384 {
            // 14-bit length (01xxxxxx xxxxxxxx)
            self.buffer.put_u8(0x40 | ((len >> 8) as u8 & 0x3F));
            self.buffer.put_u8((len & 0xFF) as u8);
        } else if len < (1 << 32) {
            // 32-bit length (10000000 + 4 bytes BE)
            self.buffer.put_u8(0x80);
            self.buffer.extend_from_slice(&(len as u32).to_be_bytes());
        } else {
            // 64-bit length (10000001 + 8 bytes BE)
            self.buffer.put_u8(0x81);
            self.buffer.extend_from_slice(&len.to_be_bytes());
        }
    }

    /// Write a length-prefixed string
    fn write_string(&mut self, s: &[u8]) {
        self.write_length(s.len() as u64);
        self.buffer.extend_from_slice(s);
    }
}

impl Default for RdbWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// One entry read from an RDB stream
#[derive(Debug)]
pub enum RdbEntry {
    /// Auxiliary metadata field
    Aux {
        /// Field name
        key: String,
        /// Field value
        value: String,
    },
    /// Database selector
    SelectDb(u8),
    /// Keyspace sizing hint
    ResizeDb {
        /// Total number of keys
        db_size: u64,
        /// Number of keys carrying an expiry
        expires_size: u64,
    },
    /// A key with its value and optional absolute expiry
    KeyValue {
        /// The key
        key: Bytes,
        /// The value
        value: Value,
        /// Absolute expiry, if the record carried one
        expires_at: Option<SystemTime>,
    },
}

/// RDB reader for parsing snapshots
pub struct RdbReader<R: Read> {
    reader: R,
}

impl<R: Read> RdbReader<R> {
    /// Create a new RDB reader
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Read and verify the RDB header, returning the format version
    pub fn read_header(&mut self) -> Result<u32> {
        let mut magic = [0u8; 5];
        self.reader.read_exact(&mut magic)?;
        if magic != RDB_MAGIC {
            return Err(MagnetiteError::Rdb("invalid RDB magic".into()));
        }

        let mut version = [0u8; 4];
        self.reader.read_exact(&mut version)?;
        let version_str = std::str::from_utf8(&version)
            .map_err(|_| MagnetiteError::Rdb("invalid RDB version".into()))?;
        let version_num: u32 = version_str
            .parse()
            .map_err(|_| MagnetiteError::Rdb("invalid RDB version number".into()))?;

        Ok(version_num)
    }

    /// Read the next entry, or `None` at the EOF marker
    pub fn read_entry(&mut self) -> Result<Option<RdbEntry>> {
        let opcode = self.read_u8()?;

        match opcode {
            RDB_OPCODE_EOF => {
                // Trailing CRC-64, not verified on load
                let mut checksum = [0u8; 8];
                self.reader.read_exact(&mut checksum)?;
                Ok(None)
            }
            RDB_OPCODE_SELECTDB => {
                let db = self.read_length()? as u8;
                Ok(Some(RdbEntry::SelectDb(db)))
            }
            RDB_OPCODE_RESIZEDB => {
                let db_size = self.read_length()?;
                let expires_size = self.read_length()?;
                Ok(Some(RdbEntry::ResizeDb {
                    db_size,
                    expires_size,
                }))
            }
            RDB_OPCODE_AUX => {
                let key = self.read_string()?;
                let value = self.read_string()?;
                Ok(Some(RdbEntry::Aux {
                    key: String::from_utf8_lossy(&key).into_owned(),
                    value: String::from_utf8_lossy(&value).into_owned(),
                }))
            }
            RDB_OPCODE_EXPIRETIME_MS => {
                let expire_ms = self.read_u64_le()?;
                let value_type = self.read_u8()?;
                self.read_key_value(value_type, Some(expire_ms))
            }
            RDB_OPCODE_EXPIRETIME => {
                let expire_sec = self.read_u32_le()?;
                let value_type = self.read_u8()?;
                self.read_key_value(value_type, Some((expire_sec as u64) * 1000))
            }
            value_type => self.read_key_value(value_type, None),
        }
    }

    fn read_key_value(
        &mut self,
        value_type: u8,
        expire_ms: Option<u64>,
    ) -> Result<Option<RdbEntry>> {
        if value_type != RDB_TYPE_STRING {
            return Err(MagnetiteError::Rdb(format!(
                "unsupported RDB value type: {value_type}"
            )));
        }

        let key = self.read_string()?;
        let value = self.read_string()?;

        // Past expiries are kept; lazy expiry makes them behave as absent.
        let expires_at = expire_ms.map(|ms| UNIX_EPOCH + Duration::from_millis(ms));

        Ok(Some(RdbEntry::KeyValue {
            key: Bytes::from(key),
            value: Value::String(Bytes::from(value)),
            expires_at,
        }))
    }

    fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.reader.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_u32_le(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.reader.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64_le(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.reader.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_length(&mut self) -> Result<u64> {
        let first = self.read_u8()?;
        let encoding = (first & 0xC0) >> 6;

        match encoding {
            0 => Ok((first & 0x3F) as u64),
            1 => {
                let second = self.read_u8()?;
                Ok((((first & 0x3F) as u64) << 8) | (second as u64))
            }
            2 => {
                if first == 0x80 {
                    let mut buf = [0u8; 4];
                    self.reader.read_exact(&mut buf)?;
                    Ok(u32::from_be_bytes(buf) as u64)
                } else if first == 0x81 {
                    let mut buf = [0u8; 8];
                    self.reader.read_exact(&mut buf)?;
                    Ok(u64::from_be_bytes(buf))
                } else {
                    Err(MagnetiteError::Rdb("invalid length encoding".into()))
                }
            }
            _ => Err(MagnetiteError::Rdb(
                "special length encoding outside string context".into(),
            )),
        }
    }

    fn read_string(&mut self) -> Result<Vec<u8>> {
        let first = self.read_u8()?;
        let encoding = (first & 0xC0) >> 6;

        if encoding == 3 {
            // Integer string encodings
            let enc_type = first & 0x3F;
            return match enc_type {
                RDB_ENC_INT8 => {
                    let val = self.read_u8()? as i8;
                    Ok(val.to_string().into_bytes())
                }
                RDB_ENC_INT16 => {
                    let mut buf = [0u8; 2];
                    self.reader.read_exact(&mut buf)?;
                    Ok(i16::from_le_bytes(buf).to_string().into_bytes())
                }
                RDB_ENC_INT32 => {
                    let mut buf = [0u8; 4];
                    self.reader.read_exact(&mut buf)?;
                    Ok(i32::from_le_bytes(buf).to_string().into_bytes())
                }
                _ => Err(MagnetiteError::Rdb(format!(
                    "unsupported string encoding: {enc_type}"
                ))),
            };
        }

        let len = match encoding {
            0 => (first & 0x3F) as u64,
            1 => {
                let second = self.read_u8()?;
                (((first & 0x3F) as u64) << 8) | (second as u64)
            }
            2 => {
                if first == 0x80 {
                    let mut buf = [0u8; 4];
                    self.reader.read_exact(&mut buf)?;
                    u32::from_be_bytes(buf) as u64
                } else if first == 0x81 {
                    let mut buf = [0u8; 8];
                    self.reader.read_exact(&mut buf)?;
                    u64::from_be_bytes(buf)
                } else {
                    return Err(MagnetiteError::Rdb("invalid length encoding".into()));
                }
            }
            _ => unreachable!(),
        };

        let mut data = vec![0u8; len as usize];
        self.reader.read_exact(&mut data)?;
        Ok(data)
    }
}

/// Generate an RDB snapshot of the store
pub fn generate_rdb(store: &Store) -> Bytes {
    let mut writer = RdbWriter::new();

    writer.write_header();
    writer.write_aux("redis-ver", env!("CARGO_PKG_VERSION"));
    writer.write_aux("redis-bits", "64");
    writer.write_aux("aof-preamble", "0");

    let snapshot = store.snapshot();
    let expires_count = snapshot
        .iter()
        .filter(|(_, _, expires_at)| expires_at.is_some())
        .count();

    writer.write_select_db(0);
    writer.write_resize_db(snapshot.len() as u64, expires_count as u64);

    for (key, value, expires_at) in snapshot {
        let expire_ms = expires_at.and_then(|at| {
            at.duration_since(UNIX_EPOCH)
                .ok()
                .map(|d| d.as_millis() as u64)
        });
        match value {
            Value::String(data) => writer.write_string_record(&key, &data, expire_ms),
            // Only strings are ever stored; other types never reach a snapshot
            _ => continue,
        }
    }

    writer.write_eof();
    writer.into_bytes()
}

/// Load RDB data into the store, returning the number of keys loaded
pub fn load_rdb(data: &[u8], store: &Store) -> Result<usize> {
    let mut reader = RdbReader::new(std::io::Cursor::new(data));

    let version = reader.read_header()?;
    if version > 11 {
        return Err(MagnetiteError::Rdb(format!(
            "unsupported RDB version: {version}"
        )));
    }

    let mut count = 0;
    while let Some(entry) = reader.read_entry()? {
        if let RdbEntry::KeyValue {
            key,
            value,
            expires_at,
        } = entry
        {
            store.restore(key, value, expires_at);
            count += 1;
        }
    }

    Ok(count)
}

/// CRC-64 of the snapshot body, appended after the EOF opcode
fn crc64(data: &[u8]) -> u64 {
    const POLY: u64 = 0xC96C5795D7870F42;
    let mut crc: u64 = 0;

    for &byte in data {
        crc ^= byte as u64;
        for _ in 0..8 {
            if crc & 1 == 1 {
                crc = (crc >> 1) ^ POLY;
            } else {
                crc >>= 1;
            }
        }
    }

    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_store() -> Store {
        let store = Store::new();
        store.set(Bytes::from("alpha"), Value::String(Bytes::from("1")), None);
        store.set(
            Bytes::from("beta"),
            Value::String(Bytes::from("two")),
            Some(SystemTime::now() + Duration::from_secs(120)),
        );
        store
    }

    #[test]
    fn test_rdb_header() {
        let rdb = generate_rdb(&Store::new());
        assert!(rdb.starts_with(b"REDIS0011"));
    }

    #[test]
    fn test_rdb_round_trip() {
        let source = sample_store();
        let rdb = generate_rdb(&source);

        let target = Store::new();
        let count = load_rdb(&rdb, &target).unwrap();
        assert_eq!(count, 2);
        assert_eq!(
            target.get(b"alpha"),
            Some(Value::String(Bytes::from("1")))
        );
        assert_eq!(
            target.get(b"beta"),
            Some(Value::String(Bytes::from("two")))
        );
    }

    #[test]
    fn test_rdb_round_trip_preserves_expiry() {
        let source = Store::new();
        let expires_at = SystemTime::now() + Duration::from_secs(300);
        source.set(
            Bytes::from("k"),
            Value::String(Bytes::from("v")),
            Some(expires_at),
        );

        let target = Store::new();
        load_rdb(&generate_rdb(&source), &target).unwrap();

        let snapshot = target.snapshot();
        assert_eq!(snapshot.len(), 1);
        let restored = snapshot[0].2.expect("expiry should survive the round trip");
        // Millisecond precision survives; sub-millisecond is truncated
        let delta = restored
            .duration_since(expires_at)
            .unwrap_or_else(|e| e.duration());
        assert!(delta < Duration::from_millis(1));
    }

    #[test]
    fn test_rdb_past_expiry_loads_as_expired() {
        let mut writer = RdbWriter::new();
        writer.write_header();
        writer.write_select_db(0);
        writer.write_resize_db(1, 1);
        writer.write_string_record(b"dead", b"gone", Some(1));
        writer.write_eof();

        let store = Store::new();
        let count = load_rdb(&writer.into_bytes(), &store).unwrap();
        assert_eq!(count, 1);
        // Loaded, but lazily expired on read
        assert_eq!(store.get(b"dead"), None);
    }

    #[test]
    fn test_rdb_invalid_magic() {
        let store = Store::new();
        assert!(load_rdb(b"NOTRDB011\xFF\0\0\0\0\0\0\0\0", &store).is_err());
    }

    #[test]
    fn test_rdb_length_encodings() {
        let mut writer = RdbWriter::new();
        writer.write_length(5);
        writer.write_length(300);
        writer.write_length(70_000);
        let buf = writer.buffer.freeze();

        let mut reader = RdbReader::new(std::io::Cursor::new(&buf[..]));
        assert_eq!(reader.read_length().unwrap(), 5);
        assert_eq!(reader.read_length().unwrap(), 300);
        assert_eq!(reader.read_length().unwrap(), 70_000);
    }

    #[test]
    fn test_crc64_deterministic() {
        assert_eq!(crc64(b"123456789"), crc64(b"123456789"));
        assert_ne!(crc64(b"123456789"), crc64(b"123456780"));
        assert_eq!(crc64(b""), 0);
    }
}
