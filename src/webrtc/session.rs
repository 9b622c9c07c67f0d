//! Session entity and the controller's transition function.
//!
//! `SessionMachine::step` is pure: it takes one event, moves the state and
//! returns the effects the controller must carry out. All I/O lives in
//! `controller`.

use crate::errors::StreamError;
use crate::types::{SessionState, StreamTarget};
use crate::webrtc::peer::{IceCandidate, PeerConnectionState};
use crate::webrtc::retry::{RetryPolicy, RetryState};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// One streaming attempt issued by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub session_id: String,
    pub client_id: String,
    pub target: StreamTarget,
    /// Camera worker that sent the current negotiation round's offer.
    pub remote_peer_id: Option<String>,
    /// When the registry issued the session.
    pub started_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        session_id: String,
        client_id: String,
        target: StreamTarget,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id,
            client_id,
            target,
            remote_peer_id: None,
            started_at,
        }
    }

    /// Records the offering worker. Only the first offer of a round sets it.
    pub fn observe_offer_from(&mut self, from_id: &str) {
        match &self.remote_peer_id {
            None => self.remote_peer_id = Some(from_id.to_string()),
            Some(known) if known != from_id => {
                log::warn!(
                    "Session {} already bound to worker {}, ignoring {}",
                    self.session_id,
                    known,
                    from_id
                );
            }
            Some(_) => {}
        }
    }

    /// Whether an inbound message for `session_id` belongs to this session.
    pub fn owns(&self, session_id: Option<&str>) -> bool {
        session_id == Some(self.session_id.as_str())
    }
}

/// Who asked for the connect attempt in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOrigin {
    Caller,
    Retry,
}

/// Inputs to the state machine, already filtered for staleness.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Start,
    Reconnect,
    Stop { remote: bool },
    AttemptReady,
    AttemptFailed(String),
    OfferReceived { sdp: String, from_id: String },
    NegotiationFailed(String),
    RemoteCandidate(IceCandidate),
    LocalCandidate(IceCandidate),
    PeerState(PeerConnectionState),
    TransportClosed(String),
    RetryTimerFired,
}

/// Work the controller performs after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Close any held negotiator/transport, then start a new connect attempt.
    OpenAttempt,
    ApplyOffer { sdp: String, from_id: String },
    ApplyRemoteCandidate(IceCandidate),
    ForwardLocalCandidate(IceCandidate),
    /// Close the negotiator only; the session id and transport are kept.
    ReleaseNegotiator,
    ScheduleRetry(Duration),
    CancelRetry,
    /// Close everything, end the registry session and forget it.
    Teardown { notify_worker: bool },
    ResolveStart(Result<(), StreamError>),
}

/// Explicit controller state plus the retry bookkeeping it depends on.
#[derive(Debug, Clone)]
pub struct SessionMachine {
    state: SessionState,
    retry: RetryState,
    policy: RetryPolicy,
    origin: AttemptOrigin,
    last_error: Option<StreamError>,
}

impl SessionMachine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: SessionState::Idle,
            retry: RetryState::default(),
            policy,
            origin: AttemptOrigin::Caller,
            last_error: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn retry_attempts(&self) -> u32 {
        self.retry.attempts()
    }

    pub fn last_error(&self) -> Option<&StreamError> {
        self.last_error.as_ref()
    }

    pub fn origin(&self) -> AttemptOrigin {
        self.origin
    }

    pub fn step(&mut self, event: Event) -> Vec<Effect> {
        use SessionState::*;

        match (self.state, event) {
            (_, Event::Stop { remote }) => {
                if remote {
                    log::info!("Camera worker ended the stream");
                }
                self.state = Stopped;
                vec![
                    Effect::CancelRetry,
                    Effect::Teardown {
                        notify_worker: !remote,
                    },
                    Effect::ResolveStart(Err(StreamError::Cancelled)),
                ]
            }

            (Idle | Stopped | Error, Event::Start | Event::Reconnect) => self.begin_manual(),
            (Connecting | AwaitingOffer | Negotiating | Connected | Reconnecting, Event::Reconnect) => {
                let mut effects = vec![Effect::CancelRetry];
                effects.extend(self.begin_manual());
                effects
            }
            // start() while active is rejected by the controller
            (_, Event::Start) => Vec::new(),

            (Connecting, Event::AttemptReady) => {
                self.state = AwaitingOffer;
                vec![Effect::ResolveStart(Ok(()))]
            }
            (Connecting, Event::AttemptFailed(reason)) => match self.origin {
                AttemptOrigin::Caller => {
                    let err = StreamError::SessionStart(reason);
                    self.state = Error;
                    self.last_error = Some(err.clone());
                    vec![
                        Effect::Teardown {
                            notify_worker: false,
                        },
                        Effect::ResolveStart(Err(err)),
                    ]
                }
                AttemptOrigin::Retry => self.fail(StreamError::TransportClosed(reason)),
            },

            (AwaitingOffer, Event::OfferReceived { sdp, from_id }) => {
                self.state = Negotiating;
                vec![Effect::ApplyOffer { sdp, from_id }]
            }
            (Negotiating | Connected, Event::OfferReceived { from_id, .. }) => {
                log::warn!(
                    "Discarding unexpected offer from {} while {}",
                    from_id,
                    self.state
                );
                Vec::new()
            }
            (Negotiating, Event::NegotiationFailed(reason)) => {
                self.fail(StreamError::Negotiation(reason))
            }

            (Negotiating, Event::PeerState(PeerConnectionState::Connected)) => {
                self.state = Connected;
                self.retry.reset();
                self.last_error = None;
                Vec::new()
            }
            (Negotiating | Connected, Event::PeerState(state)) if state.is_failure() => self.fail(
                StreamError::ConnectionFailed(format!("peer connection {:?}", state)),
            ),

            (AwaitingOffer | Negotiating | Connected, Event::RemoteCandidate(candidate)) => {
                vec![Effect::ApplyRemoteCandidate(candidate)]
            }
            (Negotiating | Connected, Event::LocalCandidate(candidate)) => {
                vec![Effect::ForwardLocalCandidate(candidate)]
            }

            (Connecting | AwaitingOffer | Negotiating | Connected, Event::TransportClosed(reason)) => {
                self.fail(StreamError::TransportClosed(reason))
            }

            (Reconnecting, Event::RetryTimerFired) => {
                self.state = Connecting;
                self.origin = AttemptOrigin::Retry;
                vec![Effect::OpenAttempt]
            }

            (state, event) => {
                log::debug!("Ignoring {:?} while {}", event, state);
                Vec::new()
            }
        }
    }

    fn begin_manual(&mut self) -> Vec<Effect> {
        self.retry.reset();
        self.last_error = None;
        self.origin = AttemptOrigin::Caller;
        self.state = SessionState::Connecting;
        vec![Effect::OpenAttempt]
    }

    fn fail(&mut self, err: StreamError) -> Vec<Effect> {
        log::warn!("Stream session failure while {}: {}", self.state, err);
        match self.retry.record_failure(&self.policy) {
            Some(delay) => {
                log::info!(
                    "Reconnecting in {:?} (attempt {}/{})",
                    delay,
                    self.retry.attempts(),
                    self.policy.max_retries
                );
                self.state = SessionState::Reconnecting;
                self.last_error = Some(err);
                vec![Effect::ReleaseNegotiator, Effect::ScheduleRetry(delay)]
            }
            None => {
                let exhausted = StreamError::RetryExhausted {
                    attempts: self.retry.attempts(),
                };
                log::error!("Giving up on stream session: {} (last: {})", exhausted, err);
                self.state = SessionState::Error;
                self.last_error = Some(exhausted);
                vec![Effect::Teardown {
                    notify_worker: true,
                }]
            }
        }
    }
}
