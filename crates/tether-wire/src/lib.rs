//! Frame codec for carrying tether pipes between processes.
//!
//! Every frame is a big-endian `u32` length followed by a JSON payload. The
//! payload is one [`Packet`]: a message for a remote peer, a peer closure, or
//! an exported endpoint token. [`FrameTransport`] plugs the codec into a
//! [`Runtime`] as its [`Transport`], and [`apply_frame`] feeds inbound frames
//! back in.

use std::fmt;
use std::sync::Arc;

use facet::Facet;
use tether_core::{Message, Runtime, Transport};
use tether_types::{EndpointToken, Error, PeerToken};
use tracing::{trace, warn};

// ── Frames ─────────────────────────────────────────────────────

pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Bytes taken by the length prefix of every frame.
pub const FRAME_HEADER_BYTES: usize = 4;

/// Why a frame could not be built or taken apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameCodecError {
    /// The payload is over the frame limit, or over what a `u32` prefix can describe.
    Oversized { len: usize, limit: usize },
    /// Fewer bytes than the length prefix itself.
    MissingHeader { len: usize },
    /// The prefix announces more than the receiver accepts.
    DeclaredOverLimit { declared: usize, limit: usize },
    /// The prefix and the bytes that follow it disagree.
    LengthMismatch { declared: usize, actual: usize },
}

impl fmt::Display for FrameCodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Oversized { len, limit } => {
                write!(f, "{len} byte payload exceeds the {limit} byte frame limit")
            }
            Self::MissingHeader { len } => {
                write!(f, "{len} byte frame has no length prefix")
            }
            Self::DeclaredOverLimit { declared, limit } => {
                write!(f, "frame declares {declared} bytes, limit is {limit}")
            }
            Self::LengthMismatch { declared, actual } => {
                write!(f, "frame declares {declared} bytes but carries {actual}")
            }
        }
    }
}

impl std::error::Error for FrameCodecError {}

impl From<FrameCodecError> for Error {
    fn from(value: FrameCodecError) -> Self {
        match value {
            FrameCodecError::Oversized { .. } => {
                Error::resource_exhausted("message does not fit in a frame")
            }
            _ => Error::invalid_argument("malformed frame"),
        }
    }
}

/// Prefixes `payload` with its length.
pub fn encode_frame(payload: &[u8], max_payload_bytes: usize) -> Result<Vec<u8>, FrameCodecError> {
    let limit = max_payload_bytes.min(u32::MAX as usize);
    let Ok(len) = u32::try_from(payload.len()) else {
        return Err(FrameCodecError::Oversized { len: payload.len(), limit });
    };
    if payload.len() > limit {
        return Err(FrameCodecError::Oversized { len: payload.len(), limit });
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_BYTES + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Checks the length prefix of a whole frame and returns its payload.
pub fn decode_frame(frame: &[u8], max_payload_bytes: usize) -> Result<&[u8], FrameCodecError> {
    let (header, payload) = frame
        .split_first_chunk::<FRAME_HEADER_BYTES>()
        .ok_or(FrameCodecError::MissingHeader { len: frame.len() })?;
    let declared = u32::from_be_bytes(*header) as usize;
    if declared > max_payload_bytes {
        return Err(FrameCodecError::DeclaredOverLimit {
            declared,
            limit: max_payload_bytes,
        });
    }
    if declared != payload.len() {
        return Err(FrameCodecError::LengthMismatch {
            declared,
            actual: payload.len(),
        });
    }
    Ok(payload)
}

// ── Errors ─────────────────────────────────────────────────────

#[derive(Debug)]
pub enum WireError {
    Frame(FrameCodecError),
    Json(String),
    /// Only payloads cross the wire; handles have to be exported one by one.
    Handles { count: usize },
    UnexpectedPacket {
        expected: &'static str,
        actual: &'static str,
    },
    Runtime(Error),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Frame(err) => write!(f, "{err}"),
            Self::Json(err) => write!(f, "{err}"),
            Self::Handles { count } => {
                write!(f, "message carries {count} handle(s), which cannot be framed")
            }
            Self::UnexpectedPacket { expected, actual } => {
                write!(f, "unexpected packet: expected {expected}, got {actual}")
            }
            Self::Runtime(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for WireError {}

impl From<FrameCodecError> for WireError {
    fn from(value: FrameCodecError) -> Self {
        Self::Frame(value)
    }
}

impl From<Error> for WireError {
    fn from(value: Error) -> Self {
        Self::Runtime(value)
    }
}

impl From<WireError> for Error {
    fn from(value: WireError) -> Self {
        match value {
            WireError::Frame(err) => err.into(),
            WireError::Json(_) => Error::invalid_argument("malformed packet"),
            WireError::Handles { .. } => {
                Error::invalid_argument("messages with handles cannot cross the wire")
            }
            WireError::UnexpectedPacket { .. } => Error::invalid_argument("unexpected packet"),
            WireError::Runtime(err) => err,
        }
    }
}

// ── Packets ────────────────────────────────────────────────────

#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct Deliver {
    pub peer: PeerToken,
    pub payload: Vec<u8>,
}

#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct PeerClosed {
    pub peer: PeerToken,
}

#[derive(Facet, Debug, Clone, PartialEq, Eq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum Packet {
    Deliver(Deliver),
    PeerClosed(PeerClosed),
    Endpoint(EndpointToken),
}

impl Packet {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Deliver(_) => "deliver",
            Self::PeerClosed(_) => "peer_closed",
            Self::Endpoint(_) => "endpoint",
        }
    }
}

pub fn encode_packet(packet: &Packet, max_payload_bytes: usize) -> Result<Vec<u8>, WireError> {
    let payload = facet_json::to_vec(packet).map_err(|e| WireError::Json(e.to_string()))?;
    Ok(encode_frame(&payload, max_payload_bytes)?)
}

pub fn decode_packet(frame: &[u8], max_payload_bytes: usize) -> Result<Packet, WireError> {
    let payload = decode_frame(frame, max_payload_bytes)?;
    facet_json::from_slice(payload).map_err(|e| WireError::Json(e.to_string()))
}

pub fn encode_token(token: &EndpointToken) -> Result<Vec<u8>, WireError> {
    encode_packet(&Packet::Endpoint(token.clone()), DEFAULT_MAX_FRAME_BYTES)
}

pub fn decode_token(frame: &[u8]) -> Result<EndpointToken, WireError> {
    match decode_packet(frame, DEFAULT_MAX_FRAME_BYTES)? {
        Packet::Endpoint(token) => Ok(token),
        other => Err(WireError::UnexpectedPacket {
            expected: "endpoint",
            actual: other.name(),
        }),
    }
}

pub fn encode_message(
    peer: PeerToken,
    message: &Message,
    max_payload_bytes: usize,
) -> Result<Vec<u8>, WireError> {
    if !message.handles.is_empty() {
        return Err(WireError::Handles {
            count: message.handles.len(),
        });
    }
    encode_packet(
        &Packet::Deliver(Deliver {
            peer,
            payload: message.payload.clone(),
        }),
        max_payload_bytes,
    )
}

pub fn decode_message(
    frame: &[u8],
    max_payload_bytes: usize,
) -> Result<(PeerToken, Message), WireError> {
    match decode_packet(frame, max_payload_bytes)? {
        Packet::Deliver(Deliver { peer, payload }) => Ok((peer, Message::new(payload))),
        other => Err(WireError::UnexpectedPacket {
            expected: "deliver",
            actual: other.name(),
        }),
    }
}

// ── Transport ──────────────────────────────────────────────────

/// Where encoded frames go: a socket writer, a channel, a test queue.
pub trait FrameSink: Send + Sync {
    fn send_frame(&self, frame: Vec<u8>) -> Result<(), Error>;
}

/// A [`Transport`] that frames every outgoing packet into a [`FrameSink`].
pub struct FrameTransport<S> {
    sink: S,
    max_frame_bytes: usize,
}

impl<S: FrameSink + 'static> FrameTransport<S> {
    pub fn new(sink: S) -> Arc<Self> {
        Self::with_max_frame_bytes(sink, DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(sink: S, max_frame_bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            sink,
            max_frame_bytes,
        })
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}

impl<S: FrameSink> Transport for FrameTransport<S> {
    fn send(&self, peer: PeerToken, message: Message) -> Result<(), Error> {
        let frame = encode_message(peer, &message, self.max_frame_bytes)?;
        trace!(%peer, bytes = frame.len(), "framed message");
        self.sink.send_frame(frame)
    }

    fn peer_closed(&self, peer: PeerToken) {
        let sent = encode_packet(&Packet::PeerClosed(PeerClosed { peer }), self.max_frame_bytes)
            .map_err(Error::from)
            .and_then(|frame| self.sink.send_frame(frame));
        if let Err(err) = sent {
            warn!(%peer, %err, "failed to send peer closure");
        }
    }
}

/// What [`apply_frame`] did with an inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Delivered(PeerToken),
    PeerClosed(PeerToken),
    /// Endpoint tokens are handed back so the caller picks the transport
    /// the imported endpoint answers through.
    Endpoint(EndpointToken),
}

/// Decodes one inbound frame and applies it to `runtime`.
pub fn apply_frame(
    runtime: &Runtime,
    frame: &[u8],
    max_payload_bytes: usize,
) -> Result<Inbound, WireError> {
    match decode_packet(frame, max_payload_bytes)? {
        Packet::Deliver(Deliver { peer, payload }) => {
            runtime.deliver_remote(peer, Message::new(payload))?;
            Ok(Inbound::Delivered(peer))
        }
        Packet::PeerClosed(PeerClosed { peer }) => {
            runtime.remote_peer_closed(peer);
            Ok(Inbound::PeerClosed(peer))
        }
        Packet::Endpoint(token) => Ok(Inbound::Endpoint(token)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tether_core::{Endpoint, RuntimeOptions};
    use tether_types::{ErrorKind, Signals};

    #[derive(Default)]
    struct Queue(Mutex<VecDeque<Vec<u8>>>);

    impl FrameSink for Arc<Queue> {
        fn send_frame(&self, frame: Vec<u8>) -> Result<(), Error> {
            self.0.lock().unwrap().push_back(frame);
            Ok(())
        }
    }

    impl Queue {
        fn pump(&self, runtime: &Runtime) -> Vec<Inbound> {
            let frames: Vec<_> = self.0.lock().unwrap().drain(..).collect();
            frames
                .iter()
                .map(|frame| apply_frame(runtime, frame, DEFAULT_MAX_FRAME_BYTES).unwrap())
                .collect()
        }
    }

    fn payload_json(packet: &Packet) -> String {
        let frame = encode_packet(packet, DEFAULT_MAX_FRAME_BYTES).expect("packet should encode");
        let payload = decode_frame(&frame, DEFAULT_MAX_FRAME_BYTES).expect("frame should decode");
        std::str::from_utf8(payload)
            .expect("payload should be utf8 json")
            .to_string()
    }

    #[test]
    fn frame_prefix_is_big_endian_length() {
        let frame = encode_frame(b"abc", 16).unwrap();
        assert_eq!(frame, vec![0, 0, 0, 3, b'a', b'b', b'c']);
        assert_eq!(decode_frame(&frame, 16).unwrap(), b"abc");
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert_eq!(
            encode_frame(&[0; 9], 8),
            Err(FrameCodecError::Oversized { len: 9, limit: 8 })
        );
        assert_eq!(
            decode_frame(&[0, 0], 8),
            Err(FrameCodecError::MissingHeader { len: 2 })
        );
        assert_eq!(
            decode_frame(&[0, 0, 0, 9], 8),
            Err(FrameCodecError::DeclaredOverLimit { declared: 9, limit: 8 })
        );
        assert_eq!(
            decode_frame(&[0, 0, 0, 3, 1], 8),
            Err(FrameCodecError::LengthMismatch {
                declared: 3,
                actual: 1
            })
        );
        assert_eq!(
            Error::from(FrameCodecError::MissingHeader { len: 0 }).kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn peer_closed_wire_shape() {
        let json = payload_json(&Packet::PeerClosed(PeerClosed {
            peer: PeerToken { node: 7, link: 3 },
        }));
        assert_eq!(json, r#"{"peer_closed":{"peer":{"node":7,"link":3}}}"#);
    }

    #[test]
    fn token_survives_the_wire() {
        let token = EndpointToken {
            peer: PeerToken { node: 1, link: 2 },
            peer_closed: true,
            queued: vec![b"first".to_vec(), Vec::new(), b"third".to_vec()],
        };
        let frame = encode_token(&token).unwrap();
        assert_eq!(decode_token(&frame).unwrap(), token);

        let err = decode_message(&frame, DEFAULT_MAX_FRAME_BYTES).unwrap_err();
        assert!(matches!(
            err,
            WireError::UnexpectedPacket {
                expected: "deliver",
                actual: "endpoint"
            }
        ));
    }

    #[test]
    fn messages_with_handles_stay_local() {
        let runtime = Runtime::new(RuntimeOptions::default());
        let (a, _b) = runtime.create_message_pipe();
        let message = Message::with_handles("x", vec![a.into()]);
        let err = encode_message(PeerToken { node: 1, link: 1 }, &message, 64).unwrap_err();
        assert!(matches!(err, WireError::Handles { count: 1 }));
        assert_eq!(Error::from(err).kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn oversized_messages_are_resource_exhausted() {
        let runtime = Runtime::new(RuntimeOptions::default());
        let queue = Arc::new(Queue::default());
        let (a, b) = runtime.create_message_pipe();
        let transport = FrameTransport::with_max_frame_bytes(queue.clone(), 64);
        let _token = runtime.export_endpoint(b, transport).unwrap();

        let err = a.write(vec![0u8; 128]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert!(queue.0.lock().unwrap().is_empty());
    }

    #[test]
    fn pipes_span_runtimes_through_frames() {
        let left = Runtime::new(RuntimeOptions::default().node_name("left"));
        let right = Runtime::new(RuntimeOptions::default().node_name("right"));
        let left_to_right = Arc::new(Queue::default());
        let right_to_left = Arc::new(Queue::default());

        let (a, b) = left.create_message_pipe();
        a.write("early").unwrap();
        let token = left
            .export_endpoint(b, FrameTransport::new(left_to_right.clone()))
            .unwrap();
        left_to_right.send_frame(encode_token(&token).unwrap()).unwrap();

        let inbound = left_to_right.pump(&right);
        let [Inbound::Endpoint(token)] = inbound.as_slice() else {
            panic!("expected a single endpoint token, got {inbound:?}");
        };
        let remote = right
            .import_endpoint(token.clone(), FrameTransport::new(right_to_left.clone()))
            .unwrap();
        assert_eq!(remote.read().unwrap().payload, b"early");

        a.write("ping").unwrap();
        assert_eq!(
            left_to_right.pump(&right),
            vec![Inbound::Delivered(token.peer)]
        );
        assert_eq!(remote.read().unwrap().payload, b"ping");

        remote.write("pong").unwrap();
        right_to_left.pump(&left);
        assert_eq!(a.read().unwrap().payload, b"pong");

        remote.close().unwrap();
        let inbound = right_to_left.pump(&left);
        assert!(matches!(inbound.as_slice(), [Inbound::PeerClosed(_)]));
        let state = a.signal_state().unwrap();
        assert!(state.satisfied().contains(Signals::PEER_CLOSED));
    }
}
