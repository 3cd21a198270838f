//! Byte-level HTTP/1.1 serialization and parsing for tunnel payloads.
//!
//! Tunneled messages travel as the exact bytes of an HTTP/1.1 message, so
//! both sides need to move between `http` types and raw buffers without a
//! connection in the middle.

use bytes::{BufMut, Bytes, BytesMut};
use http::header::HOST;
use http::{HeaderMap, HeaderName, HeaderValue};

use crate::FrameError;

const MAX_HEADERS: usize = 64;

/// An HTTP/1.1 request decoded from a tunnel frame.
#[derive(Debug)]
pub struct ParsedRequest {
    pub method: String,
    /// Origin-form request target (path + optional query).
    pub target: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// An HTTP/1.1 response decoded from a tunnel frame.
#[derive(Debug)]
pub struct ParsedResponse {
    pub status: u16,
    pub headers: Vec<(HeaderName, HeaderValue)>,
    pub body: Bytes,
}

/// Serializes a caller request into the bytes carried over the tunnel.
///
/// The request line uses origin-form; the `Host` header is emitted first,
/// then the remaining headers in map order, then the body.
pub fn serialize_request(method: &str, target: &str, headers: &HeaderMap, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(256 + body.len());
    buf.put_slice(method.as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(target.as_bytes());
    buf.put_slice(b" HTTP/1.1\r\n");

    if let Some(host) = headers.get(HOST) {
        buf.put_slice(b"Host: ");
        buf.put_slice(host.as_bytes());
        buf.put_slice(b"\r\n");
    }
    for (name, value) in headers {
        if *name == HOST {
            continue;
        }
        put_header(&mut buf, name.as_str(), value.as_bytes());
    }
    buf.put_slice(b"\r\n");
    buf.put_slice(body);
    buf.freeze()
}

/// Serializes an HTTP response into tunnel-payload bytes.
///
/// `Content-Length` and `Transfer-Encoding` are replaced with an accurate
/// `Content-Length` for the (already decoded) body; everything else is
/// written through untouched.
pub fn serialize_response(status: u16, reason: &str, headers: &HeaderMap, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(256 + body.len());
    buf.put_slice(b"HTTP/1.1 ");
    buf.put_slice(status.to_string().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(reason.as_bytes());
    buf.put_slice(b"\r\n");

    for (name, value) in headers {
        if *name == http::header::CONTENT_LENGTH || *name == http::header::TRANSFER_ENCODING {
            continue;
        }
        put_header(&mut buf, name.as_str(), value.as_bytes());
    }
    buf.put_slice(b"Content-Length: ");
    buf.put_slice(body.len().to_string().as_bytes());
    buf.put_slice(b"\r\n\r\n");
    buf.put_slice(body);
    buf.freeze()
}

/// Parses the request bytes of a broker→client frame.
pub fn parse_request(payload: Bytes) -> Result<ParsedRequest, FrameError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let header_len = match req.parse(&payload).map_err(|_| FrameError::BadHttp("request head"))? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Err(FrameError::PartialHttp),
    };

    let method = req.method.ok_or(FrameError::BadHttp("missing method"))?.to_owned();
    let target = req.path.ok_or(FrameError::BadHttp("missing request target"))?.to_owned();

    let mut map = HeaderMap::with_capacity(req.headers.len());
    for h in req.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes()).map_err(|_| FrameError::BadHttp("header name"))?;
        let value = HeaderValue::from_bytes(h.value).map_err(|_| FrameError::BadHttp("header value"))?;
        map.append(name, value);
    }

    Ok(ParsedRequest {
        method,
        target,
        headers: map,
        body: payload.slice(header_len..),
    })
}

/// Parses the response bytes of a client→broker frame.
///
/// The body is everything past the header block: the WebSocket message
/// boundary already delimits the response, so no transfer decoding happens
/// here.
pub fn parse_response(payload: Bytes) -> Result<ParsedResponse, FrameError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut headers);

    let header_len = match res.parse(&payload).map_err(|_| FrameError::BadHttp("response head"))? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Err(FrameError::PartialHttp),
    };

    let status = res.code.ok_or(FrameError::BadHttp("missing status code"))?;

    let mut list = Vec::with_capacity(res.headers.len());
    for h in res.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes()).map_err(|_| FrameError::BadHttp("header name"))?;
        let value = HeaderValue::from_bytes(h.value).map_err(|_| FrameError::BadHttp("header value"))?;
        list.push((name, value));
    }

    Ok(ParsedResponse {
        status,
        headers: list,
        body: payload.slice(header_len..),
    })
}

fn put_header(buf: &mut BytesMut, name: &str, value: &[u8]) {
    buf.put_slice(name.as_bytes());
    buf.put_slice(b": ");
    buf.put_slice(value);
    buf.put_slice(b"\r\n");
}
