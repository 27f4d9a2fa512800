use std::fmt;
use std::io;

use trellis_proto::{DecodeError, StreamErrorCode};

/// Errors from the transport layer: dialing, listening, and moving frames.
#[derive(Debug)]
pub enum TransportError {
    Io(io::Error),
    Tls(rustls::Error),
    /// QUIC connection-level failure.
    Quic(String),
    WebSocket(String),
    H2(String),
    /// The link was closed, locally or by the peer.
    Closed,
    Timeout,
    /// The peer broke the frame protocol; the connection must die.
    Decode(DecodeError),
    /// PEER_HELLO exchange failed.
    Handshake(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Io(e) => write!(f, "i/o error: {}", e),
            TransportError::Tls(e) => write!(f, "tls error: {}", e),
            TransportError::Quic(e) => write!(f, "quic error: {}", e),
            TransportError::WebSocket(e) => write!(f, "websocket error: {}", e),
            TransportError::H2(e) => write!(f, "http/2 error: {}", e),
            TransportError::Closed => write!(f, "connection closed"),
            TransportError::Timeout => write!(f, "operation timed out"),
            TransportError::Decode(e) => write!(f, "protocol violation: {}", e),
            TransportError::Handshake(e) => write!(f, "handshake failed: {}", e),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io(e) => Some(e),
            TransportError::Tls(e) => Some(e),
            TransportError::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        TransportError::Io(e)
    }
}

impl From<rustls::Error> for TransportError {
    fn from(e: rustls::Error) -> Self {
        TransportError::Tls(e)
    }
}

impl From<DecodeError> for TransportError {
    fn from(e: DecodeError) -> Self {
        TransportError::Decode(e)
    }
}

impl From<h2::Error> for TransportError {
    fn from(e: h2::Error) -> Self {
        TransportError::H2(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        TransportError::WebSocket(e.to_string())
    }
}

/// Errors surfaced on a virtual stream at an endpoint.
#[derive(Debug)]
pub enum StreamError {
    /// The remote (or a transit hop) reset the stream.
    Reset(StreamErrorCode),
    /// The stream or its peer connection is gone.
    Closed,
    /// STREAM_OPEN round-trip exceeded the configured timeout.
    OpenTimeout,
    /// E2E record failed authentication or replay checks.
    Crypto(CryptoError),
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::Reset(code) => write!(f, "stream reset: {}", code),
            StreamError::Closed => write!(f, "stream closed"),
            StreamError::OpenTimeout => write!(f, "stream open timed out"),
            StreamError::Crypto(e) => write!(f, "stream crypto failure: {}", e),
        }
    }
}

impl std::error::Error for StreamError {}

impl From<CryptoError> for StreamError {
    fn from(e: CryptoError) -> Self {
        StreamError::Crypto(e)
    }
}

/// End-to-end record layer failures. All of them abort the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// Record shorter than nonce plus tag.
    ShortRecord,
    /// Nonce bytes 8..12 were not zero.
    MalformedNonce,
    /// Sequence not strictly greater than the highest seen.
    Replay { sequence: u64 },
    /// AEAD open failed; never logged with key material.
    BadTag,
    /// Outgoing sequence space exhausted.
    Exhausted,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoError::ShortRecord => write!(f, "sealed record too short"),
            CryptoError::MalformedNonce => write!(f, "malformed record nonce"),
            CryptoError::Replay { sequence } => {
                write!(f, "record sequence {} replayed or reordered", sequence)
            }
            CryptoError::BadTag => write!(f, "record failed authentication"),
            CryptoError::Exhausted => write!(f, "record sequence space exhausted"),
        }
    }
}

impl std::error::Error for CryptoError {}

/// Fatal errors during agent startup or configuration.
#[derive(Debug)]
pub enum AgentError {
    Config(String),
    Identity(io::Error),
    Bind { addr: String, source: io::Error },
    Tls(String),
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::Config(msg) => write!(f, "invalid configuration: {}", msg),
            AgentError::Identity(e) => write!(f, "identity store failure: {}", e),
            AgentError::Bind { addr, source } => write!(f, "failed to bind {}: {}", addr, source),
            AgentError::Tls(msg) => write!(f, "tls setup failure: {}", msg),
        }
    }
}

impl std::error::Error for AgentError {}
