//! RESP protocol encoder
//!
//! This module implements encoding of RESP frames to bytes, plus the
//! encoded-length helper used for replication offset accounting.

use bytes::{BufMut, BytesMut};

use super::Frame;

/// Encode a frame into the buffer
pub fn encode_frame(frame: &Frame, buf: &mut BytesMut) {
    match frame {
        Frame::Simple(s) => {
            buf.put_u8(b'+');
            buf.put_slice(s);
            buf.put_slice(b"\r\n");
        }
        Frame::Error(s) => {
            buf.put_u8(b'-');
            buf.put_slice(s);
            buf.put_slice(b"\r\n");
        }
        Frame::Integer(n) => {
            buf.put_u8(b':');
            buf.put_slice(n.to_string().as_bytes());
            buf.put_slice(b"\r\n");
        }
        Frame::Bulk(None) => {
            buf.put_slice(b"$-1\r\n");
        }
        Frame::Bulk(Some(data)) => {
            buf.put_u8(b'$');
            buf.put_slice(data.len().to_string().as_bytes());
            buf.put_slice(b"\r\n");
            buf.put_slice(data);
            buf.put_slice(b"\r\n");
        }
        Frame::Array(None) => {
            buf.put_slice(b"*-1\r\n");
        }
        Frame::Array(Some(frames)) => {
            buf.put_u8(b'*');
            buf.put_slice(frames.len().to_string().as_bytes());
            buf.put_slice(b"\r\n");
            for frame in frames {
                encode_frame(frame, buf);
            }
        }
    }
}

/// Convenience function to encode a frame to a new BytesMut
pub fn encode_to_bytes(frame: &Frame) -> BytesMut {
    let mut buf = BytesMut::new();
    encode_frame(frame, &mut buf);
    buf
}

/// Byte length of a frame's encoding without materializing it.
///
/// The replication offset is defined in terms of this length, so it must
/// agree exactly with [`encode_frame`].
pub fn encoded_len(frame: &Frame) -> usize {
    fn decimal_width(n: i64) -> usize {
        // Matches the length of i64::to_string
        let mut width = if n < 0 { 1 } else { 0 };
        let mut n = n.unsigned_abs();
        loop {
            width += 1;
            n /= 10;
            if n == 0 {
                return width;
            }
        }
    }

    match frame {
        Frame::Simple(s) | Frame::Error(s) => 1 + s.len() + 2,
        Frame::Integer(n) => 1 + decimal_width(*n) + 2,
        Frame::Bulk(None) | Frame::Array(None) => 5,
        Frame::Bulk(Some(data)) => 1 + decimal_width(data.len() as i64) + 2 + data.len() + 2,
        Frame::Array(Some(frames)) => {
            1 + decimal_width(frames.len() as i64)
                + 2
                + frames.iter().map(encoded_len).sum::<usize>()
        }
    }
}
