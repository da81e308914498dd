//! Wire protocol vtables: pure functions of their inputs that the
//! runtime calls out to for request assembly, frame detection,
//! response parsing, heartbeats and request-id normalization.

pub mod bolt;
pub mod http;

use corelink_core::buffer::IoBuffer;
use thiserror::Error;

/// A process-unique request id, as generated by a `Session`. Some
/// protocols narrow this before it goes on the wire (see
/// [`Protocol::normalize_request_id`]).
pub type RequestId = u64;

/// The outcome of a non-destructive header inspection over a socket's
/// receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Not enough bytes buffered yet to determine a frame boundary.
    NeedMore,
    /// A complete frame of `size` bytes is available, carrying
    /// `request_id` (protocols without per-frame ids report `None`,
    /// in which case the caller matches FIFO-style). `parser_state`
    /// carries protocol-specific state across `parse_frame` calls,
    /// such as HTTP's incremental header accumulator.
    Ready {
        size: usize,
        request_id: Option<RequestId>,
        parser_state: Option<ParserState>,
    },
    /// Additive over the source system: some protocols (HTTP, see the
    /// Open Questions) may definitively know a frame is complete with
    /// no further bytes to hand back. Callers that only distinguish
    /// `Error` from non-`Error` can treat this exactly like `Ready`.
    Done {
        size: usize,
        request_id: Option<RequestId>,
        parser_state: Option<ParserState>,
    },
}

/// Protocol-specific parser accumulator handed from `parse_frame` to
/// `parse_response`. Boxed so the vtable stays object-safe across
/// protocols with unrelated accumulator shapes.
pub type ParserState = Box<dyn std::any::Any + Send>;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("malformed frame header")]
    MalformedHeader,
    #[error("frame body length {size} exceeds the {max} byte limit")]
    BodyTooLarge { size: usize, max: usize },
    #[error("unsupported protocol type byte {0}")]
    UnsupportedProtocolType(u8),
    #[error("unexpected direction/cmdcode combination")]
    UnexpectedFrameShape,
    #[error("response deserialization failed: {0}")]
    Deserialize(String),
    #[error("heartbeat not supported by this protocol")]
    HeartbeatUnsupported,
}

/// A fully assembled response handed back to the caller. Payload is
/// opaque bytes; application-level (de)serialization is out of scope.
#[derive(Debug, Clone)]
pub struct Response {
    pub request_id: RequestId,
    pub status: i32,
    pub payload: Vec<u8>,
}

/// A request to be assembled. Payload is opaque bytes supplied by the
/// caller; protocol metadata (service/method/headers) is carried
/// alongside for protocols that frame it (Bolt's header KV pairs,
/// HTTP's request line and headers).
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub service: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub payload: Vec<u8>,
}

/// Which wire protocol a Channel speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolKind {
    Bolt,
    Http,
}

/// Per-protocol function table. Every method is a pure function of
/// its inputs (no shared mutable state), so a single `Protocol` value
/// may be shared across every Channel that speaks that protocol.
pub trait Protocol: Send + Sync {
    fn kind(&self) -> ProtocolKind;

    /// Serialize `request`, tagged with `request_id`, into wire bytes.
    fn assemble_request(&self, request: &Request, request_id: RequestId) -> Result<IoBuffer, ProtoError>;

    /// Non-destructively inspect `inbuf` for a complete frame.
    fn parse_frame(&self, inbuf: &IoBuffer) -> Result<FrameOutcome, ProtoError>;

    /// Parse a response out of exactly the bytes `parse_frame` sized.
    fn parse_response(
        &self,
        framebytes: &[u8],
        parser_state: Option<ParserState>,
    ) -> Result<Response, ProtoError>;

    /// Build a heartbeat (request, expected response matcher). Not
    /// every protocol supports heartbeats.
    fn assemble_heartbeat(&self) -> Result<(IoBuffer, RequestId), ProtoError> {
        Err(ProtoError::HeartbeatUnsupported)
    }

    /// Verify that `framebytes` is a valid heartbeat response.
    fn verify_heartbeat(&self, _framebytes: &[u8]) -> Result<bool, ProtoError> {
        Err(ProtoError::HeartbeatUnsupported)
    }

    /// Narrow or otherwise adapt a caller-issued id to whatever the
    /// wire actually carries back (Bolt narrows 64 bits to 32).
    fn normalize_request_id(&self, id: RequestId) -> RequestId {
        id
    }

    fn supports_heartbeat(&self) -> bool {
        false
    }
}

pub fn protocol_for(kind: ProtocolKind) -> std::sync::Arc<dyn Protocol> {
    match kind {
        ProtocolKind::Bolt => std::sync::Arc::new(bolt::BoltProtocol::new()),
        ProtocolKind::Http => std::sync::Arc::new(http::HttpProtocol::new()),
    }
}
