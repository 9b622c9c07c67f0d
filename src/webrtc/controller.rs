//! Stream session controller.
//!
//! Each controller is one tokio task that owns the state machine, the signaling
//! channel and the negotiator. Handles talk to it over a command channel and
//! watch its `SessionStatus`. Every connect attempt gets a new epoch; transport,
//! negotiator and timer callbacks carry the epoch they were created under and
//! anything older than the current one is dropped.

use crate::assert_invariant;
use crate::errors::StreamError;
use crate::types::{ConnectionState, SessionState, SessionStatus, StreamTarget};
use crate::webrtc::peer::{NegotiatorEvent, NegotiatorFactory, NegotiatorHandler, PeerNegotiator};
use crate::webrtc::registry::SessionRegistry;
use crate::webrtc::retry::RetryPolicy;
use crate::webrtc::session::{Effect, Event, Session, SessionMachine};
use crate::webrtc::signaling::{
    SignalingChannel, SignalingConnector, SignalingMessage, TransportEvent, TransportHandler,
};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

const INVARIANT_CONTEXT: &str = "stream_controller";

/// External collaborators a controller drives.
#[derive(Clone)]
pub struct StreamDependencies {
    pub registry: Arc<dyn SessionRegistry>,
    pub connector: Arc<dyn SignalingConnector>,
    pub negotiators: Arc<dyn NegotiatorFactory>,
}

#[derive(Debug, Clone, Default)]
pub struct ControllerOptions {
    pub retry: RetryPolicy,
    /// Bearer token presented to the signaling relay.
    pub auth_token: Option<String>,
}

enum Command {
    Start(oneshot::Sender<Result<(), StreamError>>),
    Reconnect(oneshot::Sender<Result<(), StreamError>>),
    Stop(oneshot::Sender<()>),
}

enum Input {
    Transport { epoch: u64, event: TransportEvent },
    Negotiator { epoch: u64, event: NegotiatorEvent },
    AttemptFinished { epoch: u64, outcome: AttemptOutcome },
    RetryElapsed { epoch: u64 },
}

struct Attachment {
    transport: Box<dyn SignalingChannel>,
    negotiator: Box<dyn PeerNegotiator>,
}

struct AttemptOutcome {
    session_id: Option<String>,
    created_session: bool,
    issued_at: Option<DateTime<Utc>>,
    result: Result<Attachment, String>,
}

/// Handle to one camera's streaming session.
///
/// Cloning shares the same session. When the last handle is dropped the
/// session is stopped and fully torn down.
#[derive(Clone)]
pub struct StreamSessionController {
    client_id: Arc<str>,
    target: StreamTarget,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SessionStatus>,
}

impl StreamSessionController {
    /// Spawn the controller task. Must be called within a tokio runtime.
    pub fn new(target: StreamTarget, deps: StreamDependencies, options: ControllerOptions) -> Self {
        let client_id = uuid::Uuid::new_v4().simple().to_string();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (inputs, input_rx) = mpsc::unbounded_channel();
        let (status_tx, status) =
            watch::channel(SessionStatus::idle(client_id.clone(), target.clone()));

        log::info!(
            "Creating stream controller {} for camera {} at site {}",
            client_id,
            target.camera_id,
            target.site_id
        );

        let actor = SessionActor {
            client_id: client_id.clone(),
            target: target.clone(),
            machine: SessionMachine::new(options.retry),
            options,
            deps,
            session: None,
            transport: None,
            negotiator: None,
            epoch: 0,
            early: Vec::new(),
            replay: VecDeque::new(),
            retry_timer: None,
            pending_start: None,
            inputs,
            status: status_tx,
        };
        tokio::spawn(actor.run(command_rx, input_rx));

        Self {
            client_id: client_id.into(),
            target,
            commands,
            status,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn target(&self) -> &StreamTarget {
        &self.target
    }

    /// Request a session and open signaling. Resolves once the controller is
    /// waiting for the camera's offer, or with `SessionStart` if the registry
    /// or relay refused. Failures here are not retried automatically.
    pub async fn start(&self) -> Result<(), StreamError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Start(reply))
            .map_err(|_| StreamError::Cancelled)?;
        rx.await.unwrap_or(Err(StreamError::Cancelled))
    }

    /// Manual reconnect; resets the retry counter. Valid from any state.
    pub async fn reconnect(&self) -> Result<(), StreamError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Reconnect(reply))
            .map_err(|_| StreamError::Cancelled)?;
        rx.await.unwrap_or(Err(StreamError::Cancelled))
    }

    /// Stop and tear everything down. Idempotent; returns after teardown.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Stop(reply)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.status.borrow().connection_state
    }

    pub fn stream_active(&self) -> bool {
        self.status.borrow().stream_active
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }
}

struct SessionActor {
    client_id: String,
    target: StreamTarget,
    options: ControllerOptions,
    deps: StreamDependencies,
    machine: SessionMachine,
    session: Option<Session>,
    transport: Option<Box<dyn SignalingChannel>>,
    negotiator: Option<Box<dyn PeerNegotiator>>,
    epoch: u64,
    /// Current-epoch events that raced ahead of their attempt's result.
    early: Vec<Input>,
    replay: VecDeque<Input>,
    retry_timer: Option<JoinHandle<()>>,
    pending_start: Option<oneshot::Sender<Result<(), StreamError>>>,
    inputs: mpsc::UnboundedSender<Input>,
    status: watch::Sender<SessionStatus>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inputs: mpsc::UnboundedReceiver<Input>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        log::debug!("All handles for {} dropped, stopping", self.client_id);
                        self.dispatch(Event::Stop { remote: false }).await;
                        break;
                    }
                },
                Some(input) = inputs.recv() => self.handle_input(input).await,
            }
            while let Some(input) = self.replay.pop_front() {
                self.handle_input(input).await;
            }
            self.publish();
        }
        self.publish();
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start(reply) => self.begin(Event::Start, reply).await,
            Command::Reconnect(reply) => self.begin(Event::Reconnect, reply).await,
            Command::Stop(reply) => {
                log::info!("Stopping stream session for {}", self.client_id);
                self.dispatch(Event::Stop { remote: false }).await;
                self.publish();
                let _ = reply.send(());
            }
        }
    }

    async fn begin(&mut self, event: Event, reply: oneshot::Sender<Result<(), StreamError>>) {
        let before = self.machine.state();
        let effects = self.machine.step(event);
        if !effects.contains(&Effect::OpenAttempt) {
            log::warn!("Rejecting start for {}: session is {}", self.client_id, before);
            let _ = reply.send(Err(StreamError::InvalidState(before)));
            return;
        }
        if let Some(previous) = self.pending_start.replace(reply) {
            let _ = previous.send(Err(StreamError::Cancelled));
        }
        self.apply(effects).await;
    }

    async fn handle_input(&mut self, input: Input) {
        match input {
            Input::AttemptFinished { epoch, outcome } => {
                if epoch != self.epoch || self.machine.state() != SessionState::Connecting {
                    self.discard_attempt(outcome).await;
                    return;
                }
                self.finish_attempt(outcome).await;
            }
            Input::RetryElapsed { epoch } => {
                if epoch != self.epoch {
                    log::debug!("Ignoring stale retry timer (epoch {})", epoch);
                    return;
                }
                self.retry_timer = None;
                self.dispatch(Event::RetryTimerFired).await;
            }
            Input::Transport { epoch, .. } | Input::Negotiator { epoch, .. }
                if epoch != self.epoch =>
            {
                log::debug!("Dropping event from stale attempt (epoch {})", epoch);
            }
            input if self.machine.state() == SessionState::Connecting => {
                self.early.push(input);
            }
            Input::Transport { event, .. } => match event {
                TransportEvent::Message(message) => self.route_message(message).await,
                TransportEvent::Closed { reason } => {
                    self.dispatch(Event::TransportClosed(reason)).await
                }
            },
            Input::Negotiator { event, .. } => match event {
                NegotiatorEvent::LocalCandidate(candidate) => {
                    self.dispatch(Event::LocalCandidate(candidate)).await
                }
                NegotiatorEvent::StateChanged(state) => {
                    self.dispatch(Event::PeerState(state)).await
                }
            },
        }
    }

    async fn finish_attempt(&mut self, outcome: AttemptOutcome) {
        if let Some(session_id) = outcome.session_id {
            if self.session.is_none() {
                self.session = Some(Session::new(
                    session_id,
                    self.client_id.clone(),
                    self.target.clone(),
                    outcome.issued_at.unwrap_or_else(Utc::now),
                ));
            }
        }

        match outcome.result {
            Ok(attachment) => {
                assert_invariant!(
                    self.transport.is_none() && self.negotiator.is_none(),
                    "A connect attempt never lands on live resources",
                    INVARIANT_CONTEXT
                );
                self.transport = Some(attachment.transport);
                self.negotiator = Some(attachment.negotiator);
                self.dispatch(Event::AttemptReady).await;

                // Replay anything the relay sent while the attempt was settling.
                self.replay.extend(self.early.drain(..));
            }
            Err(reason) => {
                self.early.clear();
                self.dispatch(Event::AttemptFailed(reason)).await;
            }
        }
    }

    async fn discard_attempt(&mut self, outcome: AttemptOutcome) {
        log::debug!("Discarding superseded connect attempt for {}", self.client_id);
        if let Ok(mut attachment) = outcome.result {
            attachment.negotiator.close().await;
            attachment.transport.close();
        }
        if let (true, Some(session_id)) = (outcome.created_session, outcome.session_id) {
            let current = self.session.as_ref().map(|s| s.session_id.as_str());
            if current != Some(session_id.as_str()) {
                if let Err(e) = self.deps.registry.stop_session(&session_id).await {
                    log::warn!("Failed to end orphaned session {}: {}", session_id, e);
                }
            }
        }
    }

    async fn route_message(&mut self, message: SignalingMessage) {
        if let SignalingMessage::Connected { .. } = message {
            log::debug!("Ignoring late relay handshake");
            return;
        }

        let Some(session) = self.session.as_mut() else {
            log::debug!("Dropping {} with no active session", message.kind());
            return;
        };
        if !session.owns(message.session_id()) {
            log::debug!(
                "Dropping {} for session {:?} (current {})",
                message.kind(),
                message.session_id(),
                session.session_id
            );
            return;
        }

        match message {
            SignalingMessage::Offer { sdp, from_id, .. } => {
                session.observe_offer_from(&from_id);
                self.dispatch(Event::OfferReceived { sdp, from_id }).await;
            }
            SignalingMessage::IceCandidate { .. } => {
                if let Some(candidate) = message.candidate() {
                    self.dispatch(Event::RemoteCandidate(candidate)).await;
                }
            }
            SignalingMessage::StreamStop { .. } => {
                self.dispatch(Event::Stop { remote: true }).await;
            }
            SignalingMessage::Answer { .. } => {
                log::warn!("Viewer received an answer; viewers never offer");
            }
            SignalingMessage::Connected { .. } => {}
        }
    }

    async fn dispatch(&mut self, event: Event) {
        let effects = self.machine.step(event);
        self.apply(effects).await;
    }

    async fn apply(&mut self, effects: Vec<Effect>) {
        let mut queue: VecDeque<Effect> = effects.into();
        while let Some(effect) = queue.pop_front() {
            if let Some(follow_up) = self.execute(effect).await {
                queue.extend(self.machine.step(follow_up));
            }
        }
    }

    async fn execute(&mut self, effect: Effect) -> Option<Event> {
        match effect {
            Effect::OpenAttempt => {
                self.close_attachment().await;
                self.begin_epoch();
                self.spawn_attempt();
                None
            }
            Effect::ApplyOffer { sdp, from_id } => self.apply_offer(&sdp, from_id).await,
            Effect::ApplyRemoteCandidate(candidate) => {
                if let Some(negotiator) = self.negotiator.as_mut() {
                    if let Err(e) = negotiator.add_remote_ice_candidate(candidate).await {
                        log::warn!("Remote ICE candidate rejected: {}", e);
                    }
                }
                None
            }
            Effect::ForwardLocalCandidate(candidate) => {
                if let (Some(transport), Some(session)) = (&self.transport, &self.session) {
                    transport.send(SignalingMessage::ice_candidate(
                        session.session_id.clone(),
                        candidate,
                        Some(self.client_id.clone()),
                        session.remote_peer_id.clone(),
                    ));
                }
                None
            }
            Effect::ReleaseNegotiator => {
                if let Some(mut negotiator) = self.negotiator.take() {
                    negotiator.close().await;
                }
                self.begin_epoch();
                None
            }
            Effect::ScheduleRetry(delay) => {
                self.cancel_retry();
                let epoch = self.epoch;
                let inputs = self.inputs.clone();
                self.retry_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = inputs.send(Input::RetryElapsed { epoch });
                }));
                None
            }
            Effect::CancelRetry => {
                self.cancel_retry();
                None
            }
            Effect::Teardown { notify_worker } => {
                self.teardown(notify_worker).await;
                None
            }
            Effect::ResolveStart(result) => {
                if let Some(reply) = self.pending_start.take() {
                    self.publish();
                    let _ = reply.send(result);
                }
                None
            }
        }
    }

    async fn apply_offer(&mut self, sdp: &str, from_id: String) -> Option<Event> {
        let Some(negotiator) = self.negotiator.as_mut() else {
            return Some(Event::NegotiationFailed("no negotiator".to_string()));
        };
        match negotiator.handle_offer(sdp, &from_id).await {
            Ok(answer) => {
                if let (Some(transport), Some(session)) = (&self.transport, &self.session) {
                    log::info!("Sending answer to {} for session {}", from_id, session.session_id);
                    transport.send(SignalingMessage::Answer {
                        session_id: session.session_id.clone(),
                        sdp: answer,
                        to_id: from_id,
                    });
                }
                None
            }
            Err(e) => {
                log::warn!("Negotiation failed: {}", e);
                Some(Event::NegotiationFailed(e.to_string()))
            }
        }
    }

    fn begin_epoch(&mut self) {
        self.epoch += 1;
        self.early.clear();
        self.replay.clear();
        if let Some(session) = self.session.as_mut() {
            session.remote_peer_id = None;
        }
    }

    fn cancel_retry(&mut self) {
        if let Some(timer) = self.retry_timer.take() {
            log::debug!("Cancelling pending retry for {}", self.client_id);
            timer.abort();
        }
    }

    async fn close_attachment(&mut self) {
        if let Some(mut negotiator) = self.negotiator.take() {
            negotiator.close().await;
        }
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
    }

    async fn teardown(&mut self, notify_worker: bool) {
        self.cancel_retry();
        self.begin_epoch();

        if let Some(mut negotiator) = self.negotiator.take() {
            negotiator.close().await;
        }
        if let Some(mut transport) = self.transport.take() {
            if notify_worker {
                if let Some(session) = &self.session {
                    transport.send(SignalingMessage::StreamStop {
                        session_id: session.session_id.clone(),
                    });
                }
            }
            transport.close();
        }
        if let Some(session) = self.session.take() {
            if let Err(e) = self.deps.registry.stop_session(&session.session_id).await {
                log::warn!("Registry did not acknowledge end of {}: {}", session.session_id, e);
            }
        }

        assert_invariant!(
            self.negotiator.is_none() && self.transport.is_none() && self.retry_timer.is_none(),
            "Teardown leaves no live session resources",
            INVARIANT_CONTEXT
        );
    }

    fn spawn_attempt(&self) {
        let attempt = ConnectAttempt {
            epoch: self.epoch,
            client_id: self.client_id.clone(),
            target: self.target.clone(),
            session_id: self.session.as_ref().map(|s| s.session_id.clone()),
            auth_token: self.options.auth_token.clone(),
            deps: self.deps.clone(),
            inputs: self.inputs.clone(),
        };
        log::info!(
            "Connect attempt {} for {} ({})",
            attempt.epoch,
            self.client_id,
            match &attempt.session_id {
                Some(id) => format!("reusing session {}", id),
                None => "new session".to_string(),
            }
        );
        tokio::spawn(attempt.run());
    }

    fn publish(&self) {
        let state = self.machine.state();
        let next = SessionStatus {
            client_id: self.client_id.clone(),
            target: self.target.clone(),
            state,
            connection_state: state.into(),
            stream_active: state == SessionState::Connected,
            session_id: self.session.as_ref().map(|s| s.session_id.clone()),
            session_started_at: self.session.as_ref().map(|s| s.started_at),
            retry_attempt: self.machine.retry_attempts(),
            last_error: self.machine.last_error().map(|e| e.to_string()),
            updated_at: Utc::now(),
        };
        self.status.send_if_modified(|current| {
            let changed = current.state != next.state
                || current.session_id != next.session_id
                || current.retry_attempt != next.retry_attempt
                || current.last_error != next.last_error;
            if changed {
                *current = next;
            }
            changed
        });
    }
}

/// One registry + relay + negotiator setup, run off the actor so `stop()`
/// is never stuck behind a slow network round trip.
struct ConnectAttempt {
    epoch: u64,
    client_id: String,
    target: StreamTarget,
    session_id: Option<String>,
    auth_token: Option<String>,
    deps: StreamDependencies,
    inputs: mpsc::UnboundedSender<Input>,
}

impl ConnectAttempt {
    async fn run(self) {
        let mut outcome = AttemptOutcome {
            session_id: self.session_id.clone(),
            created_session: false,
            issued_at: None,
            result: Err(String::new()),
        };
        let result = self.connect(&mut outcome).await;
        outcome.result = result;

        if let Err(mpsc::error::SendError(Input::AttemptFinished { outcome, .. })) =
            self.inputs.send(Input::AttemptFinished {
                epoch: self.epoch,
                outcome,
            })
        {
            // Controller is gone; nothing will ever adopt these.
            if let Ok(mut attachment) = outcome.result {
                attachment.negotiator.close().await;
                attachment.transport.close();
            }
        }
    }

    async fn connect(&self, outcome: &mut AttemptOutcome) -> Result<Attachment, String> {
        if outcome.session_id.is_none() {
            let session_id = self
                .deps
                .registry
                .start_session(&self.client_id, &self.target.camera_id, &self.target.site_id)
                .await
                .map_err(|e| e.to_string())?;
            outcome.issued_at = Some(Utc::now());
            outcome.session_id = Some(session_id);
            outcome.created_session = true;
        }

        let epoch = self.epoch;
        let inputs = self.inputs.clone();
        let transport_handler: TransportHandler = Arc::new(move |event| {
            let _ = inputs.send(Input::Transport { epoch, event });
        });
        let mut transport = self
            .deps
            .connector
            .open(&self.client_id, self.auth_token.as_deref(), transport_handler)
            .await
            .map_err(|e| e.to_string())?;

        let inputs = self.inputs.clone();
        let negotiator_handler: NegotiatorHandler = Arc::new(move |event| {
            let _ = inputs.send(Input::Negotiator { epoch, event });
        });
        let negotiator = match self
            .deps
            .negotiators
            .create(&self.client_id, negotiator_handler)
            .await
        {
            Ok(negotiator) => negotiator,
            Err(e) => {
                transport.close();
                return Err(e.to_string());
            }
        };

        Ok(Attachment {
            transport,
            negotiator,
        })
    }
}
