//! Length-prefixed framing used by the streaming RPC transport.
//!
//! Each frame is one flags byte, a big-endian `u32` payload length and then
//! exactly that many payload bytes. Flag `0x02` marks the end-of-stream
//! trailer, whose payload is metadata rather than a message.

use thiserror::Error;
use tracing::{debug, warn};

/// Size of the flags + length header.
pub const HEADER_LEN: usize = 5;

/// Flag bit set on the end-of-stream trailer frame.
pub const FLAG_END_STREAM: u8 = 0x02;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("truncated frame at offset {offset}: expected {expected} bytes, have {available}")]
    Truncated {
        offset: usize,
        expected: usize,
        available: usize,
    },

    #[error("payload of {0} bytes does not fit a frame")]
    TooLarge(usize),
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flags: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn is_trailer(&self) -> bool {
        self.flags & FLAG_END_STREAM != 0
    }
}

/// Wrap one message payload in a data frame.
pub fn encode(payload: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    encode_with_flags(0, payload)
}

pub fn encode_with_flags(flags: u8, payload: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    let len = u32::try_from(payload.len()).map_err(|_| EnvelopeError::TooLarge(payload.len()))?;
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.push(flags);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Split a complete response body into frames, preserving order.
///
/// A truncated tail is an error, unless at least one complete message frame
/// was read before it: then the fragment is logged and dropped, since an
/// earlier frame may already hold the terminal event.
pub fn decode(buf: &[u8]) -> Result<Vec<Frame>, EnvelopeError> {
    let mut frames = Vec::new();
    let mut offset = 0;
    let mut messages = 0usize;

    while offset < buf.len() {
        let remaining = buf.len() - offset;

        let truncated = if remaining < HEADER_LEN {
            Some(EnvelopeError::Truncated {
                offset,
                expected: HEADER_LEN,
                available: remaining,
            })
        } else {
            let flags = buf[offset];
            let len_bytes = [
                buf[offset + 1],
                buf[offset + 2],
                buf[offset + 3],
                buf[offset + 4],
            ];
            let len = u32::from_be_bytes(len_bytes) as usize;
            let body = &buf[offset + HEADER_LEN..];

            if body.len() < len {
                Some(EnvelopeError::Truncated {
                    offset,
                    expected: len,
                    available: body.len(),
                })
            } else {
                let frame = Frame {
                    flags,
                    payload: body[..len].to_vec(),
                };
                if !frame.is_trailer() {
                    messages += 1;
                }
                frames.push(frame);
                offset += HEADER_LEN + len;
                None
            }
        };

        if let Some(err) = truncated {
            if messages > 0 {
                warn!(error = %err, "Dropping partial frame at end of response");
                break;
            }
            return Err(err);
        }
    }

    debug!(frames = frames.len(), bytes = buf.len(), "Decoded response frames");
    Ok(frames)
}

/// Message payloads as JSON text, with trailer frames skipped.
pub fn decode_messages(buf: &[u8]) -> Result<Vec<String>, EnvelopeError> {
    Ok(decode(buf)?
        .into_iter()
        .filter(|frame| !frame.is_trailer())
        .map(|frame| String::from_utf8_lossy(&frame.payload).into_owned())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let frame = encode(b"{}").unwrap();
        assert_eq!(frame, vec![0, 0, 0, 0, 2, b'{', b'}']);
    }

    #[test]
    fn test_round_trip_preserves_text() {
        let json = r#"{"event":{"data":{"stdout":"aGVsbG8K"}}}"#;
        let frame = encode(json.as_bytes()).unwrap();
        assert_eq!(decode_messages(&frame).unwrap(), vec![json.to_string()]);
    }

    #[test]
    fn test_order_is_preserved() {
        let mut body = Vec::new();
        for n in 0..5 {
            body.extend(encode(format!("{{\"n\":{}}}", n).as_bytes()).unwrap());
        }
        let messages = decode_messages(&body).unwrap();
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[0], r#"{"n":0}"#);
        assert_eq!(messages[4], r#"{"n":4}"#);
    }

    #[test]
    fn test_trailer_is_skipped() {
        let trailer = encode_with_flags(FLAG_END_STREAM, b"{}").unwrap();
        assert!(decode_messages(&trailer).unwrap().is_empty());

        let frames = decode(&trailer).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_trailer());
    }

    #[test]
    fn test_empty_body() {
        assert!(decode(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_truncated_first_frame_is_error() {
        let mut frame = encode(b"{\"event\":{}}").unwrap();
        frame.truncate(frame.len() - 3);
        assert!(matches!(
            decode(&frame),
            Err(EnvelopeError::Truncated { offset: 0, .. })
        ));
    }

    #[test]
    fn test_truncated_header_is_error() {
        assert!(matches!(
            decode(&[0, 0, 0]),
            Err(EnvelopeError::Truncated {
                expected: HEADER_LEN,
                available: 3,
                ..
            })
        ));
    }

    #[test]
    fn test_truncated_tail_after_message_is_dropped() {
        let mut body = encode(b"{\"first\":true}").unwrap();
        let mut partial = encode(b"{\"second\":true}").unwrap();
        partial.truncate(8);
        body.extend(partial);

        let messages = decode_messages(&body).unwrap();
        assert_eq!(messages, vec![r#"{"first":true}"#.to_string()]);
    }

    #[test]
    fn test_trailer_alone_does_not_excuse_truncation() {
        let mut body = encode_with_flags(FLAG_END_STREAM, b"{}").unwrap();
        body.extend([0, 0, 0]);
        assert!(decode(&body).is_err());
    }
}
