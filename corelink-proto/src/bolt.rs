//! Bolt: a fixed 22-byte-header binary RPC framing.
//!
//! All multi-byte wire integers are big-endian. Request and response
//! headers share the first nine bytes (proto/direction/cmdcode/ver2/
//! request_id/codec) and diverge afterward (timeout+lengths for a
//! request, status+lengths for a response). See the module-level
//! constants for the exact layout.

use crate::{FrameOutcome, ParserState, Protocol, ProtocolKind, ProtoError, Request, RequestId, Response};
use corelink_core::buffer::IoBuffer;

const PROTOCOL_TYPE: u8 = 1;
const VERSION2: u8 = 1;
const CODEC_PROTOBUF: u8 = 11;

const DIRECTION_RESPONSE: u8 = 0;
const DIRECTION_REQUEST: u8 = 1;

const CMD_HEARTBEAT: u16 = 0;
const CMD_REQUEST: u16 = 1;
const CMD_RESPONSE: u16 = 2;

const HEADER_LEN: usize = 22;
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

const CLASS_NAME: &str = "com.alipay.sofa.rpc.core.request.SofaRequest";

/// Bolt response status codes, as carried on the wire (§6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum BoltStatus {
    Success = 0,
    Error = 1,
    ServerException = 2,
    Unknown = 3,
    ServerThreadpoolBusy = 4,
    ErrorComm = 5,
    NoProcessor = 6,
    Timeout = 7,
    ClientSendError = 8,
    CodecException = 9,
    ConnectionClosed = 16,
    ServerSerialException = 17,
    ServerDeserialException = 18,
}

impl BoltStatus {
    pub fn from_wire(value: u16) -> Option<Self> {
        use BoltStatus::*;
        Some(match value {
            0 => Success,
            1 => Error,
            2 => ServerException,
            3 => Unknown,
            4 => ServerThreadpoolBusy,
            5 => ErrorComm,
            6 => NoProcessor,
            7 => Timeout,
            8 => ClientSendError,
            9 => CodecException,
            16 => ConnectionClosed,
            17 => ServerSerialException,
            18 => ServerDeserialException,
            _ => return None,
        })
    }
}

struct BoltFrameState {
    request_id: u32,
    is_heartbeat: bool,
}

fn append_kv(buf: &mut IoBuffer, key: &str, value: &[u8]) {
    buf.append(&(key.len() as u32).to_be_bytes());
    buf.append(key.as_bytes());
    buf.append(&(value.len() as u32).to_be_bytes());
    buf.append(value);
}

#[derive(Debug, Default)]
pub struct BoltProtocol;

impl BoltProtocol {
    pub fn new() -> Self {
        Self
    }
}

impl Protocol for BoltProtocol {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Bolt
    }

    fn assemble_request(&self, request: &Request, request_id: RequestId) -> Result<IoBuffer, ProtoError> {
        let narrow_id = self.normalize_request_id(request_id) as u32;
        let mut out = IoBuffer::new();
        let mut body = IoBuffer::new();

        body.append(CLASS_NAME.as_bytes());
        let class_len = CLASS_NAME.len() as u16;

        let mut header_len: u32 = 0;
        let trace_id = request
            .headers
            .iter()
            .find(|(k, _)| k == "rpc_trace_context.sofaTraceId")
            .map(|(_, v)| v.as_str())
            .unwrap_or("");

        let before = 0u32;
        append_kv(&mut body, "service", request.service.as_bytes());
        append_kv(&mut body, "sofa_head_target_service", request.service.as_bytes());
        append_kv(&mut body, "sofa_head_method_name", request.method.as_bytes());
        append_kv(&mut body, "rpc_trace_context.sofaTraceId", trace_id.as_bytes());
        header_len += (body.len() as u32) - before - class_len as u32;

        body.append(&request.payload);
        let content_len = request.payload.len() as u32;

        if content_len as usize > MAX_BODY_BYTES {
            return Err(ProtoError::BodyTooLarge {
                size: content_len as usize,
                max: MAX_BODY_BYTES,
            });
        }

        out.append(&[PROTOCOL_TYPE, DIRECTION_REQUEST]);
        out.append(&CMD_REQUEST.to_be_bytes());
        out.append(&[VERSION2]);
        out.append(&narrow_id.to_be_bytes());
        out.append(&[CODEC_PROTOBUF]);
        out.append(&u32::MAX.to_be_bytes()); // timeout: caller-side, not reasserted on wire
        out.append(&class_len.to_be_bytes());
        out.append(&(header_len as u16).to_be_bytes());
        out.append(&content_len.to_be_bytes());
        out.append_buffer_take(&mut body);

        Ok(out)
    }

    fn parse_frame(&self, inbuf: &IoBuffer) -> Result<FrameOutcome, ProtoError> {
        if inbuf.len() < HEADER_LEN {
            return Ok(FrameOutcome::NeedMore);
        }
        let header = inbuf.copy_to_vec(HEADER_LEN);

        if header[0] != PROTOCOL_TYPE {
            return Err(ProtoError::UnsupportedProtocolType(header[0]));
        }
        let direction = header[1];
        if direction != DIRECTION_RESPONSE {
            return Err(ProtoError::UnexpectedFrameShape);
        }
        let cmdcode = u16::from_be_bytes([header[2], header[3]]);
        let request_id = u32::from_be_bytes([header[5], header[6], header[7], header[8]]);

        if cmdcode == CMD_HEARTBEAT {
            if inbuf.len() < HEADER_LEN {
                return Ok(FrameOutcome::NeedMore);
            }
            return Ok(FrameOutcome::Ready {
                size: HEADER_LEN,
                request_id: Some(request_id as u64),
                parser_state: Some(Box::new(BoltFrameState {
                    request_id,
                    is_heartbeat: true,
                })),
            });
        }
        if cmdcode != CMD_RESPONSE {
            return Err(ProtoError::UnexpectedFrameShape);
        }

        let class_len = u16::from_be_bytes([header[10], header[11]]) as usize;
        let header_len = u16::from_be_bytes([header[12], header[13]]) as usize;
        let content_len = u32::from_be_bytes([header[14], header[15], header[16], header[17]]) as usize;

        if content_len > MAX_BODY_BYTES {
            return Err(ProtoError::BodyTooLarge {
                size: content_len,
                max: MAX_BODY_BYTES,
            });
        }

        let total = HEADER_LEN + class_len + header_len + content_len;
        if inbuf.len() < total {
            return Ok(FrameOutcome::NeedMore);
        }

        Ok(FrameOutcome::Ready {
            size: total,
            request_id: Some(request_id as u64),
            parser_state: Some(Box::new(BoltFrameState {
                request_id,
                is_heartbeat: false,
            })),
        })
    }

    fn parse_response(
        &self,
        framebytes: &[u8],
        parser_state: Option<ParserState>,
    ) -> Result<Response, ProtoError> {
        if framebytes.len() < HEADER_LEN {
            return Err(ProtoError::MalformedHeader);
        }
        let state = parser_state
            .and_then(|s| s.downcast::<BoltFrameState>().ok())
            .map(|b| *b);

        let status_raw = u16::from_be_bytes([framebytes[10], framebytes[11]]);
        let request_id = u32::from_be_bytes([framebytes[5], framebytes[6], framebytes[7], framebytes[8]]);

        if state.as_ref().map(|s| s.is_heartbeat).unwrap_or(false) {
            return Ok(Response {
                request_id: request_id as u64,
                status: BoltStatus::Success as i32,
                payload: Vec::new(),
            });
        }

        let status = BoltStatus::from_wire(status_raw).ok_or(ProtoError::MalformedHeader)?;

        if status != BoltStatus::Success {
            // Body is not meaningfully parseable once an error status is
            // present; the caller already has the whole frame accounted
            // for by `parse_frame`'s size, so nothing further to drain.
            return Ok(Response {
                request_id: request_id as u64,
                status: status as i32,
                payload: Vec::new(),
            });
        }

        let class_len = u16::from_be_bytes([framebytes[12], framebytes[13]]) as usize;
        let header_len = u16::from_be_bytes([framebytes[14], framebytes[15]]) as usize;
        let content_len = u32::from_be_bytes([
            framebytes[16],
            framebytes[17],
            framebytes[18],
            framebytes[19],
        ]) as usize;

        let body_start = HEADER_LEN + class_len + header_len;
        let body_end = body_start + content_len;
        if framebytes.len() < body_end {
            return Err(ProtoError::MalformedHeader);
        }

        Ok(Response {
            request_id: request_id as u64,
            status: status as i32,
            payload: framebytes[body_start..body_end].to_vec(),
        })
    }

    fn assemble_heartbeat(&self) -> Result<(IoBuffer, RequestId), ProtoError> {
        let mut out = IoBuffer::new();
        out.append(&[PROTOCOL_TYPE, DIRECTION_REQUEST]);
        out.append(&CMD_HEARTBEAT.to_be_bytes());
        out.append(&[VERSION2]);
        out.append(&0u32.to_be_bytes());
        out.append(&[CODEC_PROTOBUF]);
        out.append(&u32::MAX.to_be_bytes());
        out.append(&0u16.to_be_bytes());
        out.append(&0u16.to_be_bytes());
        out.append(&0u32.to_be_bytes());
        Ok((out, 0))
    }

    fn verify_heartbeat(&self, framebytes: &[u8]) -> Result<bool, ProtoError> {
        if framebytes.len() < HEADER_LEN {
            return Err(ProtoError::MalformedHeader);
        }
        let cmdcode = u16::from_be_bytes([framebytes[2], framebytes[3]]);
        let status = u16::from_be_bytes([framebytes[10], framebytes[11]]);
        Ok(cmdcode == CMD_HEARTBEAT && status == BoltStatus::Success as u16)
    }

    fn normalize_request_id(&self, id: RequestId) -> RequestId {
        // Bolt's wire request_id is a u32; narrow the same way the
        // source's `converseBoltRequest` does, keeping only the low
        // 32 bits of the caller-issued id.
        id as u32 as u64
    }

    fn supports_heartbeat(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> Request {
        Request {
            service: "hello".to_string(),
            method: "ping".to_string(),
            headers: vec![],
            payload: b"payload-bytes".to_vec(),
        }
    }

    #[test]
    fn assemble_request_has_fixed_header_shape() {
        let proto = BoltProtocol::new();
        let buf = proto.assemble_request(&sample_request(), 42).unwrap();
        let bytes = buf.to_vec();
        assert_eq!(bytes[0], PROTOCOL_TYPE);
        assert_eq!(bytes[1], DIRECTION_REQUEST);
        assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]), CMD_REQUEST);
        assert_eq!(bytes[4], VERSION2);
        assert_eq!(u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]), 42);
    }

    #[test]
    fn normalize_request_id_narrows_to_u32() {
        let proto = BoltProtocol::new();
        let wide: u64 = (7u64 << 32) | 99;
        assert_eq!(proto.normalize_request_id(wide), 99);
    }

    fn build_response_frame(request_id: u32, status: u16, payload: &[u8]) -> Vec<u8> {
        let class_name = b"resp.Class";
        let mut out = Vec::new();
        out.push(PROTOCOL_TYPE);
        out.push(DIRECTION_RESPONSE);
        out.extend_from_slice(&CMD_RESPONSE.to_be_bytes());
        out.push(VERSION2);
        out.extend_from_slice(&request_id.to_be_bytes());
        out.push(CODEC_PROTOBUF);
        out.extend_from_slice(&status.to_be_bytes());
        out.extend_from_slice(&(class_name.len() as u16).to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(class_name);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn parse_frame_needs_more_on_empty_buffer() {
        let proto = BoltProtocol::new();
        let buf = IoBuffer::new();
        assert_eq!(proto.parse_frame(&buf).unwrap(), FrameOutcome::NeedMore);
    }

    #[test]
    fn parse_frame_needs_more_until_full_body_buffered() {
        let proto = BoltProtocol::new();
        let frame = build_response_frame(7, 0, b"hello");
        let mut buf = IoBuffer::new();
        buf.append(&frame[..frame.len() - 2]);
        assert_eq!(proto.parse_frame(&buf).unwrap(), FrameOutcome::NeedMore);
    }

    #[test]
    fn parse_frame_and_response_round_trip() {
        let proto = BoltProtocol::new();
        let frame = build_response_frame(7, 0, b"echoed");
        let mut buf = IoBuffer::new();
        buf.append(&frame);
        let outcome = proto.parse_frame(&buf).unwrap();
        let (size, request_id, state) = match outcome {
            FrameOutcome::Ready { size, request_id, parser_state } => (size, request_id, parser_state),
            other => panic!("expected Ready, got {other:?}"),
        };
        assert_eq!(size, frame.len());
        assert_eq!(request_id, Some(7));
        let framebytes = buf.cut_into_vec(size);
        let response = proto.parse_response(&framebytes, state).unwrap();
        assert_eq!(response.status, BoltStatus::Success as i32);
        assert_eq!(response.payload, b"echoed");
    }

    #[test]
    fn parse_frame_rejects_oversized_body() {
        let proto = BoltProtocol::new();
        let mut header = vec![PROTOCOL_TYPE, DIRECTION_RESPONSE];
        header.extend_from_slice(&CMD_RESPONSE.to_be_bytes());
        header.push(VERSION2);
        header.extend_from_slice(&1u32.to_be_bytes());
        header.push(CODEC_PROTOBUF);
        header.extend_from_slice(&0u16.to_be_bytes());
        header.extend_from_slice(&0u16.to_be_bytes());
        header.extend_from_slice(&0u16.to_be_bytes());
        header.extend_from_slice(&((MAX_BODY_BYTES as u32) + 1).to_be_bytes());
        let mut buf = IoBuffer::new();
        buf.append(&header);
        assert!(matches!(
            proto.parse_frame(&buf),
            Err(ProtoError::BodyTooLarge { .. })
        ));
    }

    #[test]
    fn error_status_discards_body_without_failing() {
        let proto = BoltProtocol::new();
        let frame = build_response_frame(3, BoltStatus::ServerException as u16, b"unparseable");
        let framebytes = frame.clone();
        let response = proto.parse_response(&framebytes, None).unwrap();
        assert_eq!(response.status, BoltStatus::ServerException as i32);
        assert!(response.payload.is_empty());
    }

    #[test]
    fn heartbeat_assembly_and_verification() {
        let proto = BoltProtocol::new();
        let (buf, _id) = proto.assemble_heartbeat().unwrap();
        let bytes = buf.to_vec();
        assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]), CMD_HEARTBEAT);

        // A real heartbeat response follows the response header shape
        // (status at offset 10), not the request's timeout field.
        let mut response = build_response_frame(0, BoltStatus::Success as u16, &[]);
        response[1] = DIRECTION_RESPONSE;
        response[2..4].copy_from_slice(&CMD_HEARTBEAT.to_be_bytes());
        assert!(proto.verify_heartbeat(&response).unwrap());
    }
}
