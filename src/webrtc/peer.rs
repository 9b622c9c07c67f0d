use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_remote::TrackRemote;

use crate::errors::NegotiationError;
pub use crate::webrtc::signaling::IceCandidate;

/// WebRTC peer connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RTCConfiguration {
    pub ice_servers: Vec<IceServer>,
    pub ice_transport_policy: IceTransportPolicy,
    pub bundle_policy: BundlePolicy,
}

impl Default for RTCConfiguration {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer {
                urls: vec!["stun:stun.l.google.com:19302".to_string()],
                username: None,
                credential: None,
            }],
            ice_transport_policy: IceTransportPolicy::All,
            bundle_policy: BundlePolicy::MaxBundle,
        }
    }
}

impl From<RTCConfiguration> for webrtc::peer_connection::configuration::RTCConfiguration {
    fn from(config: RTCConfiguration) -> Self {
        use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
        use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;

        webrtc::peer_connection::configuration::RTCConfiguration {
            ice_servers: config.ice_servers.into_iter().map(|s| s.into()).collect(),
            ice_transport_policy: match config.ice_transport_policy {
                IceTransportPolicy::Relay => RTCIceTransportPolicy::Relay,
                IceTransportPolicy::All => RTCIceTransportPolicy::All,
            },
            bundle_policy: match config.bundle_policy {
                BundlePolicy::Balanced => RTCBundlePolicy::Balanced,
                BundlePolicy::MaxCompat => RTCBundlePolicy::MaxCompat,
                BundlePolicy::MaxBundle => RTCBundlePolicy::MaxBundle,
            },
            ..Default::default()
        }
    }
}

/// ICE server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl From<IceServer> for webrtc::ice_transport::ice_server::RTCIceServer {
    fn from(server: IceServer) -> Self {
        webrtc::ice_transport::ice_server::RTCIceServer {
            urls: server.urls,
            username: server.username.unwrap_or_default(),
            credential: server.credential.unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// ICE transport policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceTransportPolicy {
    Relay,
    All,
}

/// Bundle policy for RTC connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BundlePolicy {
    Balanced,
    MaxCompat,
    MaxBundle,
}

/// Transport-level (ICE/DTLS) state of the peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    /// States that end a media session that was in progress.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            PeerConnectionState::Disconnected
                | PeerConnectionState::Failed
                | PeerConnectionState::Closed
        )
    }
}

impl From<RTCPeerConnectionState> for PeerConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::New => PeerConnectionState::New,
            RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
            RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
            RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
            RTCPeerConnectionState::Unspecified => PeerConnectionState::New,
        }
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        IceCandidate {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        }
    }
}

/// Events a negotiator reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiatorEvent {
    LocalCandidate(IceCandidate),
    StateChanged(PeerConnectionState),
}

pub type NegotiatorHandler = Arc<dyn Fn(NegotiatorEvent) + Send + Sync>;

/// Where a negotiator is in its single offer/answer round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NegotiationPhase {
    Idle,
    Negotiating,
    Answered,
    Failed,
    Closed,
}

impl std::fmt::Display for NegotiationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NegotiationPhase::Idle => "idle",
            NegotiationPhase::Negotiating => "negotiating",
            NegotiationPhase::Answered => "answered",
            NegotiationPhase::Failed => "failed",
            NegotiationPhase::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Remote candidates that arrive before the remote description is applied.
///
/// They are held here and released in arrival order once the offer has been
/// set; afterwards every candidate passes straight through.
#[derive(Debug, Default)]
pub struct PendingCandidates {
    remote_description_set: bool,
    buffered: Vec<IceCandidate>,
}

impl PendingCandidates {
    /// Returns the candidate if it can be applied now, otherwise buffers it.
    pub fn admit(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.remote_description_set {
            Some(candidate)
        } else {
            self.buffered.push(candidate);
            None
        }
    }

    /// Marks the remote description as applied and drains the buffer.
    pub fn release(&mut self) -> Vec<IceCandidate> {
        self.remote_description_set = true;
        std::mem::take(&mut self.buffered)
    }

    pub fn len(&self) -> usize {
        self.buffered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffered.is_empty()
    }
}

/// One peer connection driven through a single offer/answer/ICE exchange.
#[async_trait]
pub trait PeerNegotiator: Send {
    /// Apply a remote offer and return the local answer SDP.
    async fn handle_offer(&mut self, sdp: &str, remote_id: &str)
        -> Result<String, NegotiationError>;

    async fn add_remote_ice_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<(), NegotiationError>;

    fn phase(&self) -> NegotiationPhase;

    /// Idempotent.
    async fn close(&mut self);
}

/// Creates negotiators with a receive-only video transceiver already declared.
#[async_trait]
pub trait NegotiatorFactory: Send + Sync {
    async fn create(
        &self,
        id: &str,
        handler: NegotiatorHandler,
    ) -> Result<Box<dyn PeerNegotiator>, NegotiationError>;
}

/// webrtc-rs backed negotiator factory
pub struct RtcNegotiatorFactory {
    config: RTCConfiguration,
}

impl RtcNegotiatorFactory {
    pub fn new(config: RTCConfiguration) -> Self {
        Self { config }
    }
}

#[async_trait]
impl NegotiatorFactory for RtcNegotiatorFactory {
    async fn create(
        &self,
        id: &str,
        handler: NegotiatorHandler,
    ) -> Result<Box<dyn PeerNegotiator>, NegotiationError> {
        let negotiator = RtcPeerNegotiator::new(id.to_string(), self.config.clone(), handler).await?;
        Ok(Box::new(negotiator))
    }
}

/// Receive-only peer connection for one camera stream
pub struct RtcPeerNegotiator {
    id: String,
    peer_connection: Arc<RTCPeerConnection>,
    phase: NegotiationPhase,
    pending: PendingCandidates,
    remote_id: Option<String>,
}

impl RtcPeerNegotiator {
    pub async fn new(
        id: String,
        config: RTCConfiguration,
        handler: NegotiatorHandler,
    ) -> Result<Self, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| NegotiationError::Setup(format!("codec registration: {}", e)))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| NegotiationError::Setup(format!("interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let peer_connection = Arc::new(
            api.new_peer_connection(config.into())
                .await
                .map_err(|e| NegotiationError::Setup(e.to_string()))?,
        );

        // Declared up front so a late offer still finds a receiving transceiver.
        peer_connection
            .add_transceiver_from_kind(
                RTPCodecType::Video,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| NegotiationError::Setup(format!("video transceiver: {}", e)))?;

        let candidate_handler = handler.clone();
        let peer_id = id.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => {
                        log::debug!("Local ICE candidate for {}: {}", peer_id, init.candidate);
                        candidate_handler(NegotiatorEvent::LocalCandidate(init.into()));
                    }
                    Err(e) => log::warn!("Unusable local ICE candidate for {}: {}", peer_id, e),
                }
            }
            Box::pin(async {})
        }));

        let state_handler = handler;
        let peer_id = id.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                log::info!("Peer connection {} state: {}", peer_id, state);
                state_handler(NegotiatorEvent::StateChanged(state.into()));
                Box::pin(async {})
            },
        ));

        let peer_id = id.clone();
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                log::info!("Remote {} track arrived on {}", track.kind(), peer_id);
                Box::pin(async {})
            },
        ));

        Ok(Self {
            id,
            peer_connection,
            phase: NegotiationPhase::Idle,
            pending: PendingCandidates::default(),
            remote_id: None,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn remote_id(&self) -> Option<&str> {
        self.remote_id.as_deref()
    }

    pub fn connection_state(&self) -> PeerConnectionState {
        self.peer_connection.connection_state().into()
    }

    async fn apply_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        log::debug!("Adding remote ICE candidate for {}: {}", self.id, candidate.candidate);
        self.peer_connection
            .add_ice_candidate(candidate.into())
            .await
            .map_err(|e| NegotiationError::Candidate(e.to_string()))
    }
}

#[async_trait]
impl PeerNegotiator for RtcPeerNegotiator {
    async fn handle_offer(
        &mut self,
        sdp: &str,
        remote_id: &str,
    ) -> Result<String, NegotiationError> {
        if self.phase != NegotiationPhase::Idle {
            log::warn!(
                "Discarding unexpected offer from {} on {} ({})",
                remote_id,
                self.id,
                self.phase
            );
            return Err(NegotiationError::Reentrant {
                remote_id: remote_id.to_string(),
                phase: self.phase.to_string(),
            });
        }

        log::info!("Applying offer from {} on {}", remote_id, self.id);
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| NegotiationError::MalformedOffer(e.to_string()))?;

        self.phase = NegotiationPhase::Negotiating;
        self.remote_id = Some(remote_id.to_string());

        if let Err(e) = self.peer_connection.set_remote_description(offer).await {
            self.phase = NegotiationPhase::Failed;
            return Err(NegotiationError::MalformedOffer(e.to_string()));
        }

        for candidate in self.pending.release() {
            if let Err(e) = self.apply_candidate(candidate).await {
                log::warn!("Buffered candidate rejected on {}: {}", self.id, e);
            }
        }

        let answer = match self.peer_connection.create_answer(None).await {
            Ok(answer) => answer,
            Err(e) => {
                self.phase = NegotiationPhase::Failed;
                return Err(NegotiationError::Answer(e.to_string()));
            }
        };
        if let Err(e) = self
            .peer_connection
            .set_local_description(answer.clone())
            .await
        {
            self.phase = NegotiationPhase::Failed;
            return Err(NegotiationError::Answer(e.to_string()));
        }

        self.phase = NegotiationPhase::Answered;
        Ok(answer.sdp)
    }

    async fn add_remote_ice_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<(), NegotiationError> {
        if self.phase == NegotiationPhase::Closed {
            return Err(NegotiationError::Closed);
        }
        match self.pending.admit(candidate) {
            Some(candidate) => self.apply_candidate(candidate).await,
            None => {
                log::debug!(
                    "Buffered early ICE candidate on {} ({} pending)",
                    self.id,
                    self.pending.len()
                );
                Ok(())
            }
        }
    }

    fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    async fn close(&mut self) {
        if self.phase == NegotiationPhase::Closed {
            return;
        }
        self.phase = NegotiationPhase::Closed;
        log::info!("Closing peer connection {}", self.id);
        if let Err(e) = self.peer_connection.close().await {
            log::warn!("Failed to close peer connection {}: {}", self.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording_handler() -> (NegotiatorHandler, Arc<Mutex<Vec<NegotiatorEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let handler: NegotiatorHandler = Arc::new(move |event| {
            sink.lock().expect("lock poisoned").push(event);
        });
        (handler, events)
    }

    fn candidate(n: u16) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{} 1 UDP 2122260223 192.168.1.{} 5000 typ host", n, n),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }

    #[test]
    fn test_pending_candidates_buffer_until_release() {
        let mut pending = PendingCandidates::default();
        assert!(pending.admit(candidate(1)).is_none());
        assert!(pending.admit(candidate(2)).is_none());
        assert_eq!(pending.len(), 2);

        let released = pending.release();
        assert_eq!(released, vec![candidate(1), candidate(2)]);
        assert!(pending.is_empty());

        assert_eq!(pending.admit(candidate(3)), Some(candidate(3)));
    }

    #[test]
    fn test_state_failure_classification() {
        assert!(PeerConnectionState::Failed.is_failure());
        assert!(PeerConnectionState::Disconnected.is_failure());
        assert!(!PeerConnectionState::Connecting.is_failure());
        assert!(!PeerConnectionState::Connected.is_failure());
    }

    #[tokio::test]
    async fn test_negotiator_creation() {
        let (handler, _events) = recording_handler();
        let negotiator = RtcPeerNegotiator::new("viewer".to_string(), RTCConfiguration::default(), handler)
            .await
            .unwrap();

        assert_eq!(negotiator.id(), "viewer");
        assert_eq!(negotiator.phase(), NegotiationPhase::Idle);
        assert_eq!(negotiator.connection_state(), PeerConnectionState::New);
    }

    #[tokio::test]
    async fn test_malformed_offer_rejected() {
        let (handler, _events) = recording_handler();
        let mut negotiator =
            RtcPeerNegotiator::new("viewer".to_string(), RTCConfiguration::default(), handler)
                .await
                .unwrap();

        let result = negotiator.handle_offer("not an sdp", "worker-1").await;
        assert!(matches!(result, Err(NegotiationError::MalformedOffer(_))));
    }

    #[tokio::test]
    async fn test_early_candidate_is_buffered() {
        let (handler, _events) = recording_handler();
        let mut negotiator =
            RtcPeerNegotiator::new("viewer".to_string(), RTCConfiguration::default(), handler)
                .await
                .unwrap();

        assert!(negotiator.add_remote_ice_candidate(candidate(1)).await.is_ok());
        assert_eq!(negotiator.pending.len(), 1);
    }

    #[tokio::test]
    async fn test_offer_answer_against_real_offerer() {
        let (offerer_handler, _) = recording_handler();
        let offerer =
            RtcPeerNegotiator::new("worker".to_string(), RTCConfiguration::default(), offerer_handler)
                .await
                .unwrap();
        let offer = offerer.peer_connection.create_offer(None).await.unwrap();

        let (handler, _events) = recording_handler();
        let mut viewer =
            RtcPeerNegotiator::new("viewer".to_string(), RTCConfiguration::default(), handler)
                .await
                .unwrap();

        let answer = viewer.handle_offer(&offer.sdp, "worker").await.unwrap();
        assert!(answer.starts_with("v=0"));
        assert_eq!(viewer.phase(), NegotiationPhase::Answered);
        assert_eq!(viewer.remote_id(), Some("worker"));

        let again = viewer.handle_offer(&offer.sdp, "worker").await;
        assert!(matches!(again, Err(NegotiationError::Reentrant { .. })));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (handler, _events) = recording_handler();
        let mut negotiator =
            RtcPeerNegotiator::new("viewer".to_string(), RTCConfiguration::default(), handler)
                .await
                .unwrap();

        negotiator.close().await;
        negotiator.close().await;
        assert_eq!(negotiator.phase(), NegotiationPhase::Closed);
        assert_eq!(negotiator.connection_state(), PeerConnectionState::Closed);
        assert!(matches!(
            negotiator.add_remote_ice_candidate(candidate(1)).await,
            Err(NegotiationError::Closed)
        ));
    }
}
