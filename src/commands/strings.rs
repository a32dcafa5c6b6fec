//! String command implementations
//!
//! SET and GET against the shared keyspace.

use std::time::{Duration, SystemTime};

use bytes::Bytes;

use crate::error::MagnetiteError;
use crate::protocol::Frame;
use crate::storage::{Store, Value};

use super::SetOptions;

/// SET key value [EX seconds | PX milliseconds] [GET]
///
/// With `GET`, the prior value is captured under the same write lock as the
/// insertion and returned as a simple string (empty when absent). Otherwise
/// the reply is `+OK`.
pub fn set(store: &Store, key: Bytes, value: Bytes, options: &SetOptions) -> Frame {
    let expires_at = options
        .expire_ms
        .map(|ms| SystemTime::now() + Duration::from_millis(ms));

    if options.get {
        let prev = store.set_fetch_prev(key, Value::String(value), expires_at);
        match prev {
            Some(Value::String(data)) => Frame::Simple(data),
            _ => Frame::simple(""),
        }
    } else {
        store.set(key, Value::String(value), expires_at);
        Frame::simple("OK")
    }
}

/// GET key
///
/// Missing or lazily expired keys reply null bulk; present values reply a
/// simple string.
pub fn get(store: &Store, key: &[u8]) -> Frame {
    match store.get(key) {
        None => Frame::null(),
        Some(Value::String(data)) => Frame::Simple(data),
        Some(_) => Frame::error(MagnetiteError::WrongType.to_resp_error()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_to_bytes;

    #[test]
    fn test_set_then_get() {
        let store = Store::new();
        let reply = set(
            &store,
            Bytes::from("key"),
            Bytes::from("value"),
            &SetOptions::default(),
        );
        assert_eq!(reply, Frame::simple("OK"));
        assert_eq!(&encode_to_bytes(&get(&store, b"key"))[..], b"+value\r\n");
    }

    #[test]
    fn test_get_missing_is_null_bulk() {
        let store = Store::new();
        assert_eq!(&encode_to_bytes(&get(&store, b"missing"))[..], b"$-1\r\n");
    }

    #[test]
    fn test_set_with_px_expires() {
        let store = Store::new();
        let options = SetOptions {
            expire_ms: Some(10),
            get: false,
        };
        set(&store, Bytes::from("k"), Bytes::from("v"), &options);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(get(&store, b"k"), Frame::null());
    }

    #[test]
    fn test_set_get_option_returns_prior() {
        let store = Store::new();
        let options = SetOptions {
            expire_ms: None,
            get: true,
        };
        // First write has no prior value
        assert_eq!(
            set(&store, Bytes::from("k"), Bytes::from("v1"), &options),
            Frame::simple("")
        );
        // Second write returns the first
        assert_eq!(
            set(&store, Bytes::from("k"), Bytes::from("v2"), &options),
            Frame::simple("v1")
        );
        assert_eq!(get(&store, b"k"), Frame::simple("v2"));
    }
}
