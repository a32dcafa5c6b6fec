//! RESP Frame types
//!
//! This module defines the Frame enum representing the RESP2 data types.

use bytes::Bytes;

/// RESP protocol frame types
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Simple string: +OK\r\n
    Simple(Bytes),

    /// Error: -ERR message\r\n
    Error(Bytes),

    /// Integer: :1000\r\n
    Integer(i64),

    /// Bulk string: $5\r\nhello\r\n or $-1\r\n for null
    Bulk(Option<Bytes>),

    /// Array: *2\r\n... or *-1\r\n for null
    Array(Option<Vec<Frame>>),
}

impl Frame {
    /// Create a simple string frame
    #[inline]
    pub fn simple(s: impl Into<Bytes>) -> Self {
        Frame::Simple(s.into())
    }

    /// Create an error frame
    #[cold]
    #[inline]
    pub fn error(s: impl Into<Bytes>) -> Self {
        Frame::Error(s.into())
    }

    /// Create an integer frame
    #[inline]
    pub fn integer(n: i64) -> Self {
        Frame::Integer(n)
    }

    /// Create a bulk string frame
    #[inline]
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Frame::Bulk(Some(data.into()))
    }

    /// Create a null bulk string frame
    #[inline]
    pub fn null() -> Self {
        Frame::Bulk(None)
    }

    /// Create an array frame
    #[inline]
    pub fn array(frames: Vec<Frame>) -> Self {
        Frame::Array(Some(frames))
    }

    /// Check if this frame is an error
    #[inline]
    pub fn is_error(&self) -> bool {
        matches!(self, Frame::Error(_))
    }

    /// Get the string value if this is a Simple or Bulk frame
    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Frame::Simple(b) => std::str::from_utf8(b).ok(),
            Frame::Bulk(Some(b)) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Get the bytes if this is a Bulk frame
    #[inline]
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Frame::Bulk(Some(b)) => Some(b),
            _ => None,
        }
    }

    /// Get the array if this is an Array frame
    pub fn as_array(&self) -> Option<&Vec<Frame>> {
        match self {
            Frame::Array(Some(arr)) => Some(arr),
            _ => None,
        }
    }

    /// Convert to owned array if this is an Array frame
    pub fn into_array(self) -> Option<Vec<Frame>> {
        match self {
            Frame::Array(Some(arr)) => Some(arr),
            _ => None,
        }
    }
}

impl From<String> for Frame {
    fn from(s: String) -> Self {
        Frame::bulk(s)
    }
}

impl From<&str> for Frame {
    fn from(s: &str) -> Self {
        Frame::bulk(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<i64> for Frame {
    fn from(n: i64) -> Self {
        Frame::integer(n)
    }
}

impl From<Bytes> for Frame {
    fn from(b: Bytes) -> Self {
        Frame::bulk(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_constructors() {
        assert_eq!(Frame::simple("OK"), Frame::Simple(Bytes::from("OK")));
        assert_eq!(Frame::error("ERR"), Frame::Error(Bytes::from("ERR")));
        assert_eq!(Frame::integer(42), Frame::Integer(42));
        assert_eq!(Frame::bulk("hello"), Frame::Bulk(Some(Bytes::from("hello"))));
        assert_eq!(Frame::null(), Frame::Bulk(None));
    }

    #[test]
    fn test_frame_is_error() {
        assert!(Frame::error("ERR").is_error());
        assert!(!Frame::simple("OK").is_error());
    }

    #[test]
    fn test_frame_as_str() {
        assert_eq!(Frame::simple("OK").as_str(), Some("OK"));
        assert_eq!(Frame::bulk("hello").as_str(), Some("hello"));
        assert_eq!(Frame::integer(42).as_str(), None);
        assert_eq!(Frame::null().as_str(), None);
    }

    #[test]
    fn test_frame_as_array() {
        let arr = Frame::array(vec![Frame::bulk("a"), Frame::bulk("b")]);
        assert_eq!(arr.as_array().map(Vec::len), Some(2));
        assert_eq!(Frame::simple("OK").as_array(), None);
    }

    #[test]
    fn test_frame_conversions() {
        let frame: Frame = "hello".into();
        assert_eq!(frame.as_str(), Some("hello"));

        let frame: Frame = 42i64.into();
        assert_eq!(frame, Frame::Integer(42));
    }
}
