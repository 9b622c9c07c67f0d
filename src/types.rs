//! Caller-facing session types shared by the controller, commands and CLI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Camera a session streams from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamTarget {
    pub camera_id: String,
    pub site_id: String,
}

impl StreamTarget {
    pub fn new(camera_id: impl Into<String>, site_id: impl Into<String>) -> Self {
        Self {
            camera_id: camera_id.into(),
            site_id: site_id.into(),
        }
    }
}

/// Controller state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    Idle,
    Connecting,
    AwaitingOffer,
    Negotiating,
    Connected,
    Reconnecting,
    Error,
    Stopped,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::AwaitingOffer => "awaiting-offer",
            SessionState::Negotiating => "negotiating",
            SessionState::Connected => "connected",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Error => "error",
            SessionState::Stopped => "stopped",
        }
    }

    /// States in which no transport, negotiator or timer may be held.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            SessionState::Idle | SessionState::Stopped | SessionState::Error
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse connection state reported to views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl From<SessionState> for ConnectionState {
    fn from(state: SessionState) -> Self {
        match state {
            SessionState::Idle | SessionState::Stopped => ConnectionState::Disconnected,
            SessionState::Connecting
            | SessionState::AwaitingOffer
            | SessionState::Negotiating
            | SessionState::Reconnecting => ConnectionState::Connecting,
            SessionState::Connected => ConnectionState::Connected,
            SessionState::Error => ConnectionState::Error,
        }
    }
}

/// Snapshot published by a controller whenever its observable status changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub client_id: String,
    pub target: StreamTarget,
    pub state: SessionState,
    pub connection_state: ConnectionState,
    pub stream_active: bool,
    pub session_id: Option<String>,
    /// Registry issuance time of the held session
    pub session_started_at: Option<DateTime<Utc>>,
    pub retry_attempt: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SessionStatus {
    pub fn idle(client_id: impl Into<String>, target: StreamTarget) -> Self {
        Self {
            client_id: client_id.into(),
            target,
            state: SessionState::Idle,
            connection_state: ConnectionState::Disconnected,
            stream_active: false,
            session_id: None,
            session_started_at: None,
            retry_attempt: 0,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}
