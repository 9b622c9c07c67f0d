use crate::types::SessionState;
use thiserror::Error;

/// Errors surfaced by a stream session to its caller.
///
/// `SessionStart` and `RetryExhausted` are the only user-visible failures; both
/// are recoverable with a manual `reconnect()`. The remaining transient kinds are
/// recorded as the session's last error while the controller retries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("Session start error: {0}")]
    SessionStart(String),
    #[error("Negotiation error: {0}")]
    Negotiation(String),
    #[error("Signaling transport closed: {0}")]
    TransportClosed(String),
    #[error("Peer connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Retry limit reached after {attempts} attempts")]
    RetryExhausted { attempts: u32 },
    #[error("Operation not valid while session is {0}")]
    InvalidState(SessionState),
    #[error("Session start cancelled")]
    Cancelled,
    #[error("Configuration error: {0}")]
    Config(String),
}

impl StreamError {
    /// True for failures the controller retries on its own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StreamError::Negotiation(_)
                | StreamError::TransportClosed(_)
                | StreamError::ConnectionFailed(_)
        )
    }
}

/// Failures opening or using the relay signaling channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("invalid signaling url: {0}")]
    InvalidUrl(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("handshake rejected: {0}")]
    Handshake(String),
    #[error("handshake timed out after {0} ms")]
    HandshakeTimeout(u64),
}

/// Failures driving the peer connection through offer/answer/ICE.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    #[error("failed to create peer connection: {0}")]
    Setup(String),
    #[error("malformed offer: {0}")]
    MalformedOffer(String),
    #[error("offer from {remote_id} arrived while negotiation is {phase}")]
    Reentrant { remote_id: String, phase: String },
    #[error("failed to create answer: {0}")]
    Answer(String),
    #[error("failed to apply ICE candidate: {0}")]
    Candidate(String),
    #[error("negotiator is closed")]
    Closed,
}

/// Failures talking to the session registry REST API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("registry request failed: {0}")]
    Request(String),
    #[error("registry rejected request with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("registry response malformed: {0}")]
    Decode(String),
}

impl From<TransportError> for StreamError {
    fn from(err: TransportError) -> Self {
        StreamError::SessionStart(err.to_string())
    }
}

impl From<RegistryError> for StreamError {
    fn from(err: RegistryError) -> Self {
        StreamError::SessionStart(err.to_string())
    }
}

impl From<NegotiationError> for StreamError {
    fn from(err: NegotiationError) -> Self {
        StreamError::Negotiation(err.to_string())
    }
}
