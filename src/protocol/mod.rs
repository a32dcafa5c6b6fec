//! RESP protocol implementation
//!
//! This module implements the RESP2 wire format: frame types, a streaming
//! parser, and an encoder. Commands travel as arrays of bulk strings; replies
//! are any single RESP value.

mod encoder;
mod frame;
mod parser;

pub use encoder::{encode_frame, encode_to_bytes, encoded_len};
pub use frame::Frame;
pub use parser::{parse_frame, ParseError, MAX_BULK_STRING_SIZE};
