//! RESP protocol parser
//!
//! This module implements a streaming parser for the RESP2 protocol. The
//! parser first checks that a complete frame is buffered (without allocating),
//! then parses it and advances the buffer.

use bytes::{Buf, BytesMut};
use std::io::Cursor;

use super::Frame;
use crate::error::MagnetiteError;

/// Maximum bulk string size in bytes (512 MiB, matches redis proto-max-bulk-len)
pub const MAX_BULK_STRING_SIZE: usize = 512 * 1024 * 1024;

/// Parse error types
#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    /// Not enough data to parse a complete frame
    Incomplete,

    /// Invalid protocol framing
    InvalidFormat(String),

    /// A length line did not parse as a valid number
    InvalidLength(String),

    /// Bulk string length is negative or exceeds [`MAX_BULK_STRING_SIZE`]
    BulkStringTooLarge(i64),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Incomplete => write!(f, "incomplete data"),
            ParseError::InvalidFormat(msg) => write!(f, "invalid format: {msg}"),
            ParseError::InvalidLength(msg) => write!(f, "invalid length: {msg}"),
            ParseError::BulkStringTooLarge(size) => {
                write!(f, "bulk string length {size} out of range")
            }
        }
    }
}

impl std::error::Error for ParseError {}

impl From<ParseError> for MagnetiteError {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::Incomplete => {
                MagnetiteError::InvalidFormat("incomplete frame".to_string())
            }
            ParseError::InvalidFormat(msg) => MagnetiteError::InvalidFormat(msg),
            ParseError::InvalidLength(_) => MagnetiteError::InvalidLength,
            ParseError::BulkStringTooLarge(size) => MagnetiteError::BulkStringTooLarge(size),
        }
    }
}

/// Helper to create unexpected-byte error (marked cold)
#[cold]
#[inline(never)]
fn invalid_byte_error(byte: u8) -> ParseError {
    ParseError::InvalidFormat(format!("unexpected byte: {byte:02x}"))
}

/// Helper to create invalid integer error (marked cold)
#[cold]
#[inline(never)]
fn invalid_integer_error(s: &str) -> ParseError {
    ParseError::InvalidLength(format!("invalid integer: {s}"))
}

/// Parse a RESP frame from the buffer
///
/// Returns `Ok(Some(frame))` if a complete frame was parsed (the buffer is
/// advanced past it), `Ok(None)` if more data is needed, or `Err` if the data
/// is invalid.
pub fn parse_frame(buf: &mut BytesMut) -> Result<Option<Frame>, ParseError> {
    if buf.is_empty() {
        return Ok(None);
    }

    // Use a cursor to peek without consuming
    let mut cursor = Cursor::new(&buf[..]);

    match check_frame(&mut cursor) {
        Ok(len) => {
            cursor.set_position(0);
            let frame = parse_frame_internal(&mut cursor)?;
            buf.advance(len);
            Ok(Some(frame))
        }
        Err(ParseError::Incomplete) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Check if a complete frame is available and return its length
fn check_frame(cursor: &mut Cursor<&[u8]>) -> Result<usize, ParseError> {
    match peek_byte(cursor)? {
        b'+' | b'-' | b':' => {
            // Line-framed: read until \r\n
            cursor.advance(1);
            find_line(cursor)?;
            Ok(cursor.position() as usize)
        }
        b'$' => {
            // Bulk string
            cursor.advance(1);
            let len = read_decimal(cursor)?;
            if len == -1 {
                // Null bulk string
                Ok(cursor.position() as usize)
            } else if len < -1 {
                Err(ParseError::BulkStringTooLarge(len))
            } else {
                if len as usize > MAX_BULK_STRING_SIZE {
                    return Err(ParseError::BulkStringTooLarge(len));
                }
                let len = len as usize;
                // Skip the data plus the final \r\n
                let total = cursor.position() as usize + len + 2;
                if cursor.get_ref().len() < total {
                    Err(ParseError::Incomplete)
                } else {
                    cursor.set_position(total as u64);
                    Ok(total)
                }
            }
        }
        b'*' => {
            // Array
            cursor.advance(1);
            let count = read_decimal(cursor)?;
            if count == -1 {
                // Null array
                Ok(cursor.position() as usize)
            } else if count < -1 {
                Err(ParseError::InvalidLength(
                    "negative array length".to_string(),
                ))
            } else {
                for _ in 0..count {
                    check_frame(cursor)?;
                }
                Ok(cursor.position() as usize)
            }
        }
        byte => Err(invalid_byte_error(byte)),
    }
}

/// Parse a frame from the cursor (assumes complete data is available)
fn parse_frame_internal(cursor: &mut Cursor<&[u8]>) -> Result<Frame, ParseError> {
    match get_byte(cursor)? {
        b'+' => {
            let line = read_line(cursor)?;
            Ok(Frame::Simple(bytes::Bytes::copy_from_slice(line)))
        }
        b'-' => {
            let line = read_line(cursor)?;
            Ok(Frame::Error(bytes::Bytes::copy_from_slice(line)))
        }
        b':' => {
            let n = read_decimal(cursor)?;
            Ok(Frame::Integer(n))
        }
        b'$' => {
            let len = read_decimal(cursor)?;
            if len == -1 {
                Ok(Frame::null())
            } else {
                let len = len as usize;
                let data = read_bytes(cursor, len)?;
                let frame = Frame::Bulk(Some(bytes::Bytes::copy_from_slice(data)));
                skip_crlf(cursor)?;
                Ok(frame)
            }
        }
        b'*' => {
            let count = read_decimal(cursor)?;
            if count == -1 {
                Ok(Frame::Array(None))
            } else {
                let mut frames = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    frames.push(parse_frame_internal(cursor)?);
                }
                Ok(Frame::Array(Some(frames)))
            }
        }
        byte => Err(invalid_byte_error(byte)),
    }
}

/// Peek at the next byte without advancing
#[inline]
fn peek_byte(cursor: &Cursor<&[u8]>) -> Result<u8, ParseError> {
    if cursor.position() as usize >= cursor.get_ref().len() {
        return Err(ParseError::Incomplete);
    }
    Ok(cursor.get_ref()[cursor.position() as usize])
}

/// Get the next byte and advance
#[inline]
fn get_byte(cursor: &mut Cursor<&[u8]>) -> Result<u8, ParseError> {
    let byte = peek_byte(cursor)?;
    cursor.advance(1);
    Ok(byte)
}

/// Find the end of a line (\r\n) and position cursor after it
#[inline]
fn find_line(cursor: &mut Cursor<&[u8]>) -> Result<(), ParseError> {
    let start = cursor.position() as usize;
    let buf = cursor.get_ref();

    for i in start..buf.len().saturating_sub(1) {
        if buf[i] == b'\r' && buf[i + 1] == b'\n' {
            cursor.set_position((i + 2) as u64);
            return Ok(());
        }
    }

    Err(ParseError::Incomplete)
}

/// Read a line (excluding \r\n)
#[inline]
fn read_line<'a>(cursor: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], ParseError> {
    let start = cursor.position() as usize;
    let buf: &'a [u8] = cursor.get_ref();

    for i in start..buf.len().saturating_sub(1) {
        if buf[i] == b'\r' && buf[i + 1] == b'\n' {
            cursor.set_position((i + 2) as u64);
            return Ok(&buf[start..i]);
        }
    }

    Err(ParseError::Incomplete)
}

/// Read a decimal number (possibly negative) followed by \r\n
#[inline]
fn read_decimal(cursor: &mut Cursor<&[u8]>) -> Result<i64, ParseError> {
    let line = read_line(cursor)?;
    let s = std::str::from_utf8(line)
        .map_err(|_| ParseError::InvalidFormat("non-UTF-8 length line".to_string()))?;
    s.parse().map_err(|_| invalid_integer_error(s))
}

/// Read exactly n bytes
#[inline]
fn read_bytes<'a>(cursor: &mut Cursor<&'a [u8]>, n: usize) -> Result<&'a [u8], ParseError> {
    let start = cursor.position() as usize;
    let buf: &'a [u8] = cursor.get_ref();

    if start + n > buf.len() {
        return Err(ParseError::Incomplete);
    }

    cursor.set_position((start + n) as u64);
    Ok(&buf[start..start + n])
}

/// Skip \r\n
#[inline]
fn skip_crlf(cursor: &mut Cursor<&[u8]>) -> Result<(), ParseError> {
    let pos = cursor.position() as usize;
    let buf = cursor.get_ref();

    if pos + 2 > buf.len() {
        return Err(ParseError::Incomplete);
    }

    if buf[pos] != b'\r' || buf[pos + 1] != b'\n' {
        return Err(ParseError::InvalidFormat("expected CRLF".to_string()));
    }

    cursor.advance(2);
    Ok(())
}
