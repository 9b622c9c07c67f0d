/// WebRTC viewer sessions
///
/// Receive-only peer connections to remote camera workers, negotiated over a
/// WebSocket relay after the backend registry issues a session.
pub mod controller;
pub mod peer;
pub mod registry;
pub mod retry;
pub mod session;
pub mod signaling;

pub use controller::{ControllerOptions, StreamDependencies, StreamSessionController};
pub use peer::{
    IceCandidate, NegotiatorFactory, PeerConnectionState, PeerNegotiator, RTCConfiguration,
    RtcNegotiatorFactory, RtcPeerNegotiator,
};
pub use registry::{HttpSessionRegistry, SessionRegistry};
pub use retry::{RetryPolicy, MAX_RETRIES};
pub use session::{Session, SessionMachine};
pub use signaling::{SignalingConnector, SignalingMessage, WsSignalingConnector};
