//! Wire format shared by the broker and the client.
//!
//! A tunnel frame is a single WebSocket binary message laid out as
//! `4-char-lowercase-hex(id) || HTTP/1.1 message`: the broker sends framed
//! requests, the client sends framed responses. WebSocket message boundaries
//! delimit frames, so there is no length prefix.

mod http1;

pub use http1::{
    parse_request, parse_response, serialize_request, serialize_response, ParsedRequest, ParsedResponse,
};

use bytes::{BufMut, Bytes, BytesMut};

/// Largest id handed out before wrapping back to zero.
pub const REQUEST_ID_MODULUS: i16 = 32000;

/// Byte length of the hex-encoded id prefixing every frame.
pub const FRAME_ID_LEN: usize = 4;

/// Hop-by-hop headers stripped from tunneled responses on egress (RFC 7230 §6.1).
pub const HOP_BY_HOP_HEADERS: [&str; 5] = ["connection", "keep-alive", "te", "trailers", "transfer-encoding"];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame is shorter than the {FRAME_ID_LEN}-byte id prefix")]
    Truncated,
    #[error("frame id is not 4 lowercase hex digits")]
    BadId,
    #[error("malformed HTTP/1.1 message in frame: {0}")]
    BadHttp(&'static str),
    #[error("HTTP/1.1 message in frame is incomplete")]
    PartialHttp,
}

/// Identifier of one in-flight request, unique within a single tunnel.
///
/// Ids are positive, increment by one per request and wrap at
/// [`REQUEST_ID_MODULUS`]; uniqueness holds because far fewer requests than
/// the modulus may be pending at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(i16);

impl RequestId {
    pub const ZERO: RequestId = RequestId(0);

    /// The id following `self` in the wrapping sequence.
    pub fn next(self) -> RequestId {
        RequestId((self.0 + 1) % REQUEST_ID_MODULUS)
    }

    pub fn value(self) -> i16 {
        self.0
    }

    /// Decodes the 4-hex-digit wire form.
    pub fn decode(bytes: &[u8]) -> Result<RequestId, FrameError> {
        if bytes.len() != FRAME_ID_LEN {
            return Err(FrameError::BadId);
        }
        let mut value: u16 = 0;
        for &b in bytes {
            let digit = match b {
                b'0'..=b'9' => b - b'0',
                b'a'..=b'f' => b - b'a' + 10,
                _ => return Err(FrameError::BadId),
            };
            value = (value << 4) | u16::from(digit);
        }
        if value > i16::MAX as u16 {
            return Err(FrameError::BadId);
        }
        Ok(RequestId(value as i16))
    }

    /// Encodes into the 4-hex-digit wire form.
    pub fn encode(self) -> [u8; FRAME_ID_LEN] {
        const DIGITS: &[u8; 16] = b"0123456789abcdef";
        let v = self.0 as u16;
        [
            DIGITS[usize::from(v >> 12)],
            DIGITS[usize::from((v >> 8) & 0xf)],
            DIGITS[usize::from((v >> 4) & 0xf)],
            DIGITS[usize::from(v & 0xf)],
        ]
    }
}

impl core::fmt::Display for RequestId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:04x}", self.0 as u16)
    }
}

/// Prepends the id to an HTTP/1.1 payload, producing one wire frame.
pub fn encode_frame(id: RequestId, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_ID_LEN + payload.len());
    buf.put_slice(&id.encode());
    buf.put_slice(payload);
    buf.freeze()
}

/// Splits a wire frame into its id and HTTP/1.1 payload.
pub fn decode_frame(frame: Bytes) -> Result<(RequestId, Bytes), FrameError> {
    if frame.len() < FRAME_ID_LEN {
        return Err(FrameError::Truncated);
    }
    let id = RequestId::decode(&frame[..FRAME_ID_LEN])?;
    Ok((id, frame.slice(FRAME_ID_LEN..)))
}

/// True for headers that must not travel past the broker.
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h))
}
