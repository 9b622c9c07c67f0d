use crate::errors::{NegotiationError, RegistryError, TransportError};
use crate::webrtc::controller::StreamDependencies;
use crate::webrtc::peer::{
    IceCandidate, NegotiationPhase, NegotiatorEvent, NegotiatorFactory, NegotiatorHandler,
    PeerConnectionState, PeerNegotiator, PendingCandidates,
};
use crate::webrtc::registry::SessionRegistry;
use crate::webrtc::signaling::{
    SignalingChannel, SignalingConnector, SignalingMessage, TransportEvent, TransportHandler,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Counts resources handed out and released by the mocks.
#[derive(Debug, Default)]
pub struct LifecycleCounters {
    transports_opened: AtomicUsize,
    transports_closed: AtomicUsize,
    negotiators_created: AtomicUsize,
    negotiators_closed: AtomicUsize,
}

impl LifecycleCounters {
    pub fn transports_opened(&self) -> usize {
        self.transports_opened.load(Ordering::SeqCst)
    }

    pub fn negotiators_created(&self) -> usize {
        self.negotiators_created.load(Ordering::SeqCst)
    }

    pub fn open_transports(&self) -> usize {
        self.transports_opened() - self.transports_closed.load(Ordering::SeqCst)
    }

    pub fn live_negotiators(&self) -> usize {
        self.negotiators_created() - self.negotiators_closed.load(Ordering::SeqCst)
    }

    /// True when every transport and negotiator handed out has been closed.
    pub fn all_released(&self) -> bool {
        self.open_transports() == 0 && self.live_negotiators() == 0
    }
}

/// Registry that issues `sess1`, `sess2`, ... in order.
#[derive(Debug, Default)]
pub struct MockRegistry {
    start_delay_ms: AtomicU64,
    issued: AtomicU32,
    start_calls: AtomicU32,
    fail_starts: AtomicBool,
    stopped: Mutex<Vec<String>>,
}

impl MockRegistry {
    /// Make `start_session` take this long before answering.
    pub fn delay_starts(&self, delay: Duration) {
        self.start_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn fail_starts(&self, fail: bool) {
        self.fail_starts.store(fail, Ordering::SeqCst);
    }

    /// Every `start_session` call, including refused ones.
    pub fn start_calls(&self) -> u32 {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> Vec<String> {
        self.stopped.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SessionRegistry for MockRegistry {
    async fn start_session(
        &self,
        _client_id: &str,
        _camera_id: &str,
        _site_id: &str,
    ) -> Result<String, RegistryError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.start_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_starts.load(Ordering::SeqCst) {
            return Err(RegistryError::Status {
                status: 503,
                body: "camera offline".to_string(),
            });
        }
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("sess{}", n))
    }

    async fn stop_session(&self, session_id: &str) -> Result<(), RegistryError> {
        if let Ok(mut stopped) = self.stopped.lock() {
            stopped.push(session_id.to_string());
        }
        Ok(())
    }
}

struct MockLink {
    handler: TransportHandler,
    up: Arc<AtomicBool>,
}

/// In-memory relay. Tests play the worker side through `deliver`.
#[derive(Default)]
pub struct MockConnector {
    counters: Arc<LifecycleCounters>,
    open_calls: AtomicU32,
    failing_opens: AtomicU32,
    open_delay_ms: AtomicU64,
    links: Mutex<Vec<MockLink>>,
    sent: Arc<Mutex<Vec<SignalingMessage>>>,
}

impl MockConnector {
    pub fn new(counters: Arc<LifecycleCounters>) -> Self {
        Self {
            counters,
            ..Default::default()
        }
    }

    /// Refuse the next `count` opens.
    pub fn fail_next_opens(&self, count: u32) {
        self.failing_opens.store(count, Ordering::SeqCst);
    }

    /// Make every `open` take this long before the relay answers.
    pub fn delay_opens(&self, delay: Duration) {
        self.open_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn open_calls(&self) -> u32 {
        self.open_calls.load(Ordering::SeqCst)
    }

    pub fn link_count(&self) -> usize {
        self.links.lock().map(|l| l.len()).unwrap_or(0)
    }

    /// Deliver a relay message on the most recent channel.
    pub fn deliver(&self, message: SignalingMessage) {
        let handler = self.links.lock().ok().and_then(|links| {
            links
                .last()
                .filter(|link| link.up.load(Ordering::SeqCst))
                .map(|link| link.handler.clone())
        });
        if let Some(handler) = handler {
            handler(TransportEvent::Message(message));
        }
    }

    /// Deliver on a specific channel, in open order. Closed channels still
    /// deliver, like frames already in flight when the socket went away.
    pub fn deliver_on(&self, index: usize, message: SignalingMessage) {
        let handler = self
            .links
            .lock()
            .ok()
            .and_then(|links| links.get(index).map(|link| link.handler.clone()));
        if let Some(handler) = handler {
            handler(TransportEvent::Message(message));
        }
    }

    /// Simulate the relay dropping the most recent channel.
    pub fn drop_connection(&self, reason: &str) {
        let handler = self.links.lock().ok().and_then(|links| {
            links
                .last()
                .filter(|link| link.up.swap(false, Ordering::SeqCst))
                .map(|link| link.handler.clone())
        });
        if let Some(handler) = handler {
            handler(TransportEvent::Closed {
                reason: reason.to_string(),
            });
        }
    }

    /// Everything the controller sent, across all channels.
    pub fn sent(&self) -> Vec<SignalingMessage> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SignalingConnector for MockConnector {
    async fn open(
        &self,
        client_id: &str,
        _auth_token: Option<&str>,
        handler: TransportHandler,
    ) -> Result<Box<dyn SignalingChannel>, TransportError> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.open_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let refuse = self
            .failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refuse {
            return Err(TransportError::Connect("relay unreachable".to_string()));
        }

        log::debug!("Mock relay accepted {}", client_id);
        let up = Arc::new(AtomicBool::new(true));
        if let Ok(mut links) = self.links.lock() {
            links.push(MockLink {
                handler,
                up: up.clone(),
            });
        }
        self.counters.transports_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockChannel {
            up,
            closed: false,
            sent: self.sent.clone(),
            counters: self.counters.clone(),
        }))
    }
}

struct MockChannel {
    up: Arc<AtomicBool>,
    closed: bool,
    sent: Arc<Mutex<Vec<SignalingMessage>>>,
    counters: Arc<LifecycleCounters>,
}

impl SignalingChannel for MockChannel {
    fn send(&self, message: SignalingMessage) {
        if !self.is_open() {
            return;
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(message);
        }
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.up.store(false, Ordering::SeqCst);
            self.counters.transports_closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_open(&self) -> bool {
        !self.closed && self.up.load(Ordering::SeqCst)
    }
}

/// Negotiators that answer any non-empty offer with `answer:<offer>`.
#[derive(Default)]
pub struct MockNegotiatorFactory {
    counters: Arc<LifecycleCounters>,
    handlers: Mutex<Vec<NegotiatorHandler>>,
    reject_offers: Arc<AtomicBool>,
    offers: Arc<Mutex<Vec<(String, String)>>>,
    remote_candidates: Arc<Mutex<Vec<IceCandidate>>>,
}

impl MockNegotiatorFactory {
    pub fn new(counters: Arc<LifecycleCounters>) -> Self {
        Self {
            counters,
            ..Default::default()
        }
    }

    /// Treat every following offer as malformed.
    pub fn reject_offers(&self, reject: bool) {
        self.reject_offers.store(reject, Ordering::SeqCst);
    }

    /// `(remote_id, sdp)` of every offer applied.
    pub fn offers(&self) -> Vec<(String, String)> {
        self.offers.lock().map(|o| o.clone()).unwrap_or_default()
    }

    /// Remote candidates applied to a remote description.
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.remote_candidates
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub fn emit_state(&self, state: PeerConnectionState) {
        self.emit(NegotiatorEvent::StateChanged(state));
    }

    pub fn emit_local_candidate(&self, candidate: IceCandidate) {
        self.emit(NegotiatorEvent::LocalCandidate(candidate));
    }

    fn emit(&self, event: NegotiatorEvent) {
        let handler = self
            .handlers
            .lock()
            .ok()
            .and_then(|handlers| handlers.last().cloned());
        if let Some(handler) = handler {
            handler(event);
        }
    }
}

#[async_trait]
impl NegotiatorFactory for MockNegotiatorFactory {
    async fn create(
        &self,
        _id: &str,
        handler: NegotiatorHandler,
    ) -> Result<Box<dyn PeerNegotiator>, NegotiationError> {
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers.push(handler);
        }
        self.counters.negotiators_created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockNegotiator {
            phase: NegotiationPhase::Idle,
            pending: PendingCandidates::default(),
            reject_offers: self.reject_offers.clone(),
            offers: self.offers.clone(),
            remote_candidates: self.remote_candidates.clone(),
            counters: self.counters.clone(),
        }))
    }
}

struct MockNegotiator {
    phase: NegotiationPhase,
    pending: PendingCandidates,
    reject_offers: Arc<AtomicBool>,
    offers: Arc<Mutex<Vec<(String, String)>>>,
    remote_candidates: Arc<Mutex<Vec<IceCandidate>>>,
    counters: Arc<LifecycleCounters>,
}

impl MockNegotiator {
    fn apply(&self, candidates: Vec<IceCandidate>) {
        if let Ok(mut applied) = self.remote_candidates.lock() {
            applied.extend(candidates);
        }
    }
}

#[async_trait]
impl PeerNegotiator for MockNegotiator {
    async fn handle_offer(&mut self, sdp: &str, remote_id: &str) -> Result<String, NegotiationError> {
        match self.phase {
            NegotiationPhase::Idle => {}
            NegotiationPhase::Closed => return Err(NegotiationError::Closed),
            phase => {
                return Err(NegotiationError::Reentrant {
                    remote_id: remote_id.to_string(),
                    phase: phase.to_string(),
                })
            }
        }
        if sdp.is_empty() || self.reject_offers.load(Ordering::SeqCst) {
            self.phase = NegotiationPhase::Failed;
            return Err(NegotiationError::MalformedOffer(sdp.to_string()));
        }

        if let Ok(mut offers) = self.offers.lock() {
            offers.push((remote_id.to_string(), sdp.to_string()));
        }
        self.phase = NegotiationPhase::Answered;
        let buffered = self.pending.release();
        self.apply(buffered);
        Ok(format!("answer:{}", sdp))
    }

    async fn add_remote_ice_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<(), NegotiationError> {
        if self.phase == NegotiationPhase::Closed {
            return Err(NegotiationError::Closed);
        }
        if let Some(candidate) = self.pending.admit(candidate) {
            self.apply(vec![candidate]);
        }
        Ok(())
    }

    fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    async fn close(&mut self) {
        if self.phase != NegotiationPhase::Closed {
            self.phase = NegotiationPhase::Closed;
            self.counters.negotiators_closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// A registry, relay and negotiator factory sharing one set of counters.
#[derive(Clone)]
pub struct MockStack {
    pub counters: Arc<LifecycleCounters>,
    pub registry: Arc<MockRegistry>,
    pub connector: Arc<MockConnector>,
    pub negotiators: Arc<MockNegotiatorFactory>,
}

impl Default for MockStack {
    fn default() -> Self {
        Self::new()
    }
}

impl MockStack {
    pub fn new() -> Self {
        let counters = Arc::new(LifecycleCounters::default());
        Self {
            registry: Arc::new(MockRegistry::default()),
            connector: Arc::new(MockConnector::new(counters.clone())),
            negotiators: Arc::new(MockNegotiatorFactory::new(counters.clone())),
            counters,
        }
    }

    pub fn dependencies(&self) -> StreamDependencies {
        StreamDependencies {
            registry: self.registry.clone(),
            connector: self.connector.clone(),
            negotiators: self.negotiators.clone(),
        }
    }

    /// Play the worker's offer for `session_id`.
    pub fn offer(&self, session_id: &str, worker_id: &str) {
        self.connector.deliver(SignalingMessage::Offer {
            session_id: session_id.to_string(),
            sdp: format!("v=0 offer from {}", worker_id),
            from_id: worker_id.to_string(),
        });
    }
}
