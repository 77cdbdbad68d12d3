//! Text frame parsing and encoding

use bytes::Bytes;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Stream identifier, unique within one client session
pub type StreamId = u64;

/// Frame decoding errors
///
/// None of these are fatal to a control channel: the offending frame is dropped.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Malformed frame: {0:?}")]
    Malformed(String),

    #[error("Invalid stream id {value:?}: {reason}")]
    InvalidStreamId { value: String, reason: String },

    #[error("Invalid hex payload for stream {stream_id}: {reason}")]
    InvalidPayload { stream_id: StreamId, reason: String },

    #[error("Unknown frame type: {0:?}")]
    UnknownType(String),
}

/// Frame type tag (the first colon-delimited field)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Msg,
    Close,
    Registered,
    Start,
}

impl FrameKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameKind::Msg => "msg",
            FrameKind::Close => "close",
            FrameKind::Registered => "registered",
            FrameKind::Start => "start",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        [
            FrameKind::Msg,
            FrameKind::Close,
            FrameKind::Registered,
            FrameKind::Start,
        ]
        .into_iter()
        .find(|kind| tag.eq_ignore_ascii_case(kind.as_str()))
    }
}

/// A single control-channel frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Payload bytes for a stream
    Msg { stream_id: StreamId, payload: Bytes },
    /// Stream teardown notice
    Close { stream_id: StreamId },
    /// New stream accepted from a hijacked HTTP connection
    Registered { stream_id: StreamId },
    /// New stream accepted from a raw TCP connection
    Start { stream_id: StreamId },
}

impl Frame {
    pub fn msg(stream_id: StreamId, payload: impl Into<Bytes>) -> Self {
        Frame::Msg {
            stream_id,
            payload: payload.into(),
        }
    }

    pub fn close(stream_id: StreamId) -> Self {
        Frame::Close { stream_id }
    }

    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Msg { .. } => FrameKind::Msg,
            Frame::Close { .. } => FrameKind::Close,
            Frame::Registered { .. } => FrameKind::Registered,
            Frame::Start { .. } => FrameKind::Start,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        match self {
            Frame::Msg { stream_id, .. }
            | Frame::Close { stream_id }
            | Frame::Registered { stream_id }
            | Frame::Start { stream_id } => *stream_id,
        }
    }

    /// Whether this frame announces a new stream
    pub fn is_announcement(&self) -> bool {
        matches!(self, Frame::Registered { .. } | Frame::Start { .. })
    }

    /// Parse a text frame
    ///
    /// Field rules, in order:
    /// 1. fewer than two colon-delimited fields is malformed
    /// 2. the second field must be a decimal `u64` (digits only, no sign)
    /// 3. the type tag is matched case-insensitively
    /// 4. `msg` needs exactly three fields and a hex third field (either case)
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let parts: Vec<&str> = text.split(':').collect();
        if parts.len() < 2 {
            return Err(FrameError::Malformed(text.to_string()));
        }

        let stream_id = parse_stream_id(parts[1])?;

        let kind = FrameKind::from_tag(parts[0])
            .ok_or_else(|| FrameError::UnknownType(parts[0].to_string()))?;

        match kind {
            FrameKind::Msg => {
                if parts.len() != 3 {
                    return Err(FrameError::Malformed(text.to_string()));
                }
                let payload = hex::decode(parts[2]).map_err(|e| FrameError::InvalidPayload {
                    stream_id,
                    reason: e.to_string(),
                })?;
                Ok(Frame::Msg {
                    stream_id,
                    payload: Bytes::from(payload),
                })
            }
            FrameKind::Close => Ok(Frame::Close { stream_id }),
            FrameKind::Registered => Ok(Frame::Registered { stream_id }),
            FrameKind::Start => Ok(Frame::Start { stream_id }),
        }
    }

    /// Encode into the text form sent on the control channel
    pub fn encode(&self) -> String {
        match self {
            Frame::Msg { stream_id, payload } => {
                format!("msg:{}:{}", stream_id, hex::encode(payload))
            }
            other => format!("{}:{}", other.kind().as_str(), other.stream_id()),
        }
    }
}

/// Decimal digits only; `str::parse` alone would also take a leading `+`
fn parse_stream_id(field: &str) -> Result<StreamId, FrameError> {
    if !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(FrameError::InvalidStreamId {
            value: field.to_string(),
            reason: "not a decimal number".to_string(),
        });
    }
    field.parse::<StreamId>().map_err(|e| FrameError::InvalidStreamId {
        value: field.to_string(),
        reason: e.to_string(),
    })
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for Frame {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Frame::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_msg() {
        let frame = Frame::parse("msg:2:48656c6c6f").unwrap();
        assert_eq!(frame, Frame::msg(2, &b"Hello"[..]));
        assert_eq!(frame.stream_id(), 2);
        assert_eq!(frame.kind(), FrameKind::Msg);
    }

    #[test]
    fn test_parse_msg_uppercase_hex() {
        let frame = Frame::parse("msg:9:DEADBEEF").unwrap();
        assert_eq!(frame, Frame::msg(9, vec![0xde, 0xad, 0xbe, 0xef]));
    }

    #[test]
    fn test_parse_type_is_case_insensitive() {
        assert_eq!(Frame::parse("MSG:3:00").unwrap(), Frame::msg(3, vec![0u8]));
        assert_eq!(Frame::parse("Close:3").unwrap(), Frame::close(3));
    }

    #[test]
    fn test_parse_empty_payload() {
        let frame = Frame::parse("msg:4:").unwrap();
        assert_eq!(frame, Frame::msg(4, Bytes::new()));
    }

    #[test]
    fn test_msg_without_payload_field_is_malformed() {
        assert!(matches!(
            Frame::parse("msg:7"),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn test_msg_with_extra_field_is_malformed() {
        assert!(matches!(
            Frame::parse("msg:7:aa:bb"),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn test_single_field_is_malformed() {
        assert!(matches!(Frame::parse("close"), Err(FrameError::Malformed(_))));
        assert!(matches!(Frame::parse(""), Err(FrameError::Malformed(_))));
    }

    #[test]
    fn test_invalid_stream_id() {
        for text in [
            "msg:abc:00",
            "close:-1",
            "close:+2",
            "msg:+2:aa",
            "close: 2",
            "close:",
            "close:18446744073709551616",
        ] {
            assert!(
                matches!(Frame::parse(text), Err(FrameError::InvalidStreamId { .. })),
                "{} should have an invalid stream id",
                text
            );
        }
    }

    #[test]
    fn test_invalid_hex() {
        assert_eq!(
            Frame::parse("msg:5:zz").unwrap_err(),
            FrameError::InvalidPayload {
                stream_id: 5,
                reason: hex::FromHexError::InvalidHexCharacter { c: 'z', index: 0 }.to_string(),
            }
        );
        assert!(matches!(
            Frame::parse("msg:5:abc"),
            Err(FrameError::InvalidPayload { stream_id: 5, .. })
        ));
    }

    #[test]
    fn test_unknown_type() {
        assert_eq!(
            Frame::parse("ping:1").unwrap_err(),
            FrameError::UnknownType("ping".to_string())
        );
    }

    #[test]
    fn test_stream_id_checked_before_type() {
        assert!(matches!(
            Frame::parse("ping:x"),
            Err(FrameError::InvalidStreamId { .. })
        ));
    }

    #[test]
    fn test_close_ignores_trailing_fields() {
        assert_eq!(Frame::parse("close:12:whatever").unwrap(), Frame::close(12));
    }

    #[test]
    fn test_announcements() {
        let registered = Frame::parse("registered:2").unwrap();
        let start = Frame::parse("start:3").unwrap();
        assert_eq!(registered, Frame::Registered { stream_id: 2 });
        assert_eq!(start, Frame::Start { stream_id: 3 });
        assert!(registered.is_announcement());
        assert!(start.is_announcement());
        assert!(!Frame::close(2).is_announcement());
    }

    #[test]
    fn test_encode() {
        assert_eq!(Frame::msg(2, &b"GET /"[..]).encode(), "msg:2:474554202f");
        assert_eq!(Frame::close(2).to_string(), "close:2");
        assert_eq!(Frame::Registered { stream_id: 10 }.encode(), "registered:10");
        assert_eq!(Frame::Start { stream_id: 11 }.encode(), "start:11");
    }

    #[test]
    fn test_binary_payload_survives_text_form() {
        let payload: Vec<u8> = (0..=255u8).collect();
        let text = Frame::msg(42, payload.clone()).encode();
        let parsed: Frame = text.parse().unwrap();
        assert_eq!(parsed, Frame::msg(42, payload));
    }
}
