//! HTTP/1.1 with FIFO-matched pipelining.
//!
//! No per-frame request id is carried over the wire; the socket
//! layer matches completions to the oldest in-flight `ReadSession` in
//! submission order, which is exactly what strict FIFO pipelining
//! requires (see §6.2 and Testable Property 3).

use crate::{FrameOutcome, ParserState, Protocol, ProtocolKind, ProtoError, Request, RequestId, Response};
use corelink_core::buffer::IoBuffer;

const MAX_HEADERS: usize = 64;

#[derive(Debug, Default)]
pub struct HttpProtocol;

impl HttpProtocol {
    pub fn new() -> Self {
        Self
    }
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

impl Protocol for HttpProtocol {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Http
    }

    fn assemble_request(&self, request: &Request, request_id: RequestId) -> Result<IoBuffer, ProtoError> {
        let method = if request.method.is_empty() {
            "POST"
        } else {
            request.method.as_str()
        };
        let path = if request.service.starts_with('/') {
            request.service.clone()
        } else {
            format!("/{}", request.service)
        };
        let host = header_value(&request.headers, "Host").unwrap_or("localhost");

        let mut head = String::new();
        head.push_str(&format!("{method} {path} HTTP/1.1\r\n"));
        if !method.eq_ignore_ascii_case("GET") {
            head.push_str(&format!("Content-Length: {}\r\n", request.payload.len()));
        }
        if let Some(content_type) = header_value(&request.headers, "Content-Type") {
            head.push_str(&format!("Content-Type: {content_type}\r\n"));
        }
        head.push_str(&format!("Host: {host}\r\n"));
        head.push_str("Accept: */*\r\n");
        head.push_str("User-Agent: curl/7.0\r\n");
        head.push_str(&format!("log-id: {request_id}\r\n"));
        head.push_str("Connection: keep-alive\r\n");
        for (key, value) in &request.headers {
            if key.eq_ignore_ascii_case("Host") || key.eq_ignore_ascii_case("Content-Type") {
                continue;
            }
            head.push_str(&format!("{key}: {value}\r\n"));
        }
        head.push_str("\r\n");

        let mut out = IoBuffer::new();
        out.append(head.as_bytes());
        out.append(&request.payload);
        Ok(out)
    }

    fn parse_frame(&self, inbuf: &IoBuffer) -> Result<FrameOutcome, ProtoError> {
        let bytes = inbuf.to_vec();
        if bytes.is_empty() {
            return Ok(FrameOutcome::NeedMore);
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        let parse_result = response
            .parse(&bytes)
            .map_err(|_| ProtoError::MalformedHeader)?;

        let header_len = match parse_result {
            httparse::Status::Partial => return Ok(FrameOutcome::NeedMore),
            httparse::Status::Complete(n) => n,
        };

        let content_length: usize = response
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case("content-length"))
            .and_then(|h| std::str::from_utf8(h.value).ok())
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);

        let total = header_len + content_length;
        if bytes.len() < total {
            return Ok(FrameOutcome::NeedMore);
        }

        // Content-Length known exactly: this frame is definitively
        // complete, not merely "try again" (see the HTTP accumulation
        // open question in SPEC_FULL.md).
        Ok(FrameOutcome::Done {
            size: total,
            request_id: None,
            parser_state: None,
        })
    }

    fn parse_response(
        &self,
        framebytes: &[u8],
        _parser_state: Option<ParserState>,
    ) -> Result<Response, ProtoError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        let header_len = match response
            .parse(framebytes)
            .map_err(|_| ProtoError::MalformedHeader)?
        {
            httparse::Status::Partial => return Err(ProtoError::MalformedHeader),
            httparse::Status::Complete(n) => n,
        };

        let status = response.code.unwrap_or(0) as i32;
        let payload = framebytes[header_len..].to_vec();

        Ok(Response {
            request_id: 0,
            status,
            payload,
        })
    }

    fn normalize_request_id(&self, id: RequestId) -> RequestId {
        // Identity: the source's `converseHttpRequest` performs no
        // narrowing, matching that HTTP conveys the id via a plain
        // decimal header rather than a fixed-width wire field.
        id
    }

    fn supports_heartbeat(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assemble_request_has_expected_lines() {
        let proto = HttpProtocol::new();
        let req = Request {
            service: "ping".to_string(),
            method: "POST".to_string(),
            headers: vec![("Host".to_string(), "example.com:80".to_string())],
            payload: b"body".to_vec(),
        };
        let buf = proto.assemble_request(&req, 55).unwrap();
        let text = String::from_utf8(buf.to_vec()).unwrap();
        assert!(text.starts_with("POST /ping HTTP/1.1\r\n"));
        assert!(text.contains("Content-Length: 4\r\n"));
        assert!(text.contains("Host: example.com:80\r\n"));
        assert!(text.contains("log-id: 55\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.ends_with("body"));
    }

    #[test]
    fn parse_frame_needs_more_on_empty_buffer() {
        let proto = HttpProtocol::new();
        let buf = IoBuffer::new();
        assert_eq!(proto.parse_frame(&buf).unwrap(), FrameOutcome::NeedMore);
    }

    #[test]
    fn parse_frame_accumulates_until_body_complete() {
        let proto = HttpProtocol::new();
        let full = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let mut buf = IoBuffer::new();
        buf.append(&full[..full.len() - 3]);
        assert_eq!(proto.parse_frame(&buf).unwrap(), FrameOutcome::NeedMore);
        buf.append(&full[full.len() - 3..]);
        match proto.parse_frame(&buf).unwrap() {
            FrameOutcome::Done { size, .. } => assert_eq!(size, full.len()),
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[test]
    fn parse_response_extracts_status_and_body() {
        let proto = HttpProtocol::new();
        let frame = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
        let response = proto.parse_response(frame, None).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.payload, b"ok");
    }

    #[test]
    fn request_id_is_identity() {
        let proto = HttpProtocol::new();
        assert_eq!(proto.normalize_request_id(123456789), 123456789);
    }
}
