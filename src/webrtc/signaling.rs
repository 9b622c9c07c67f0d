//! Relay signaling: the message union and the duplex channel that carries it.
//!
//! The channel only delivers and dispatches. It never reconnects; an unexpected
//! close is reported once through the handler and the owning controller decides
//! what happens next.

use crate::errors::TransportError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// ICE candidate as exchanged over the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

/// Messages relayed between a viewer and a camera worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    #[serde(rename_all = "camelCase")]
    Offer {
        session_id: String,
        sdp: String,
        from_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        session_id: String,
        sdp: String,
        to_id: String,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        session_id: String,
        candidate: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp_mid: Option<String>,
        #[serde(
            rename = "sdpMLineIndex",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        sdp_mline_index: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    StreamStop { session_id: String },
    #[serde(rename_all = "camelCase")]
    Connected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },
}

impl SignalingMessage {
    /// Session this message belongs to; `None` only for the handshake.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            SignalingMessage::Offer { session_id, .. }
            | SignalingMessage::Answer { session_id, .. }
            | SignalingMessage::IceCandidate { session_id, .. }
            | SignalingMessage::StreamStop { session_id } => Some(session_id),
            SignalingMessage::Connected { .. } => None,
        }
    }

    /// Wrap a candidate for the relay, addressed from this viewer.
    pub fn ice_candidate(
        session_id: impl Into<String>,
        candidate: IceCandidate,
        from_id: Option<String>,
        to_id: Option<String>,
    ) -> Self {
        SignalingMessage::IceCandidate {
            session_id: session_id.into(),
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            from_id,
            to_id,
        }
    }

    /// The candidate carried by an `ice-candidate` message.
    pub fn candidate(&self) -> Option<IceCandidate> {
        match self {
            SignalingMessage::IceCandidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
                ..
            } => Some(IceCandidate {
                candidate: candidate.clone(),
                sdp_mid: sdp_mid.clone(),
                sdp_mline_index: *sdp_mline_index,
            }),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::IceCandidate { .. } => "ice-candidate",
            SignalingMessage::StreamStop { .. } => "stream-stop",
            SignalingMessage::Connected { .. } => "connected",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Events a signaling channel reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(SignalingMessage),
    /// The channel went away without `close()` being called.
    Closed { reason: String },
}

/// Single consumer of a channel's events, invoked in receive order.
pub type TransportHandler = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// An open duplex channel to the relay.
pub trait SignalingChannel: Send {
    /// Fire-and-forget. Dropped silently when the channel is not open.
    fn send(&self, message: SignalingMessage);

    /// Idempotent.
    fn close(&mut self);

    fn is_open(&self) -> bool;
}

/// Opens signaling channels. Open failures are never retried here.
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn open(
        &self,
        client_id: &str,
        auth_token: Option<&str>,
        handler: TransportHandler,
    ) -> Result<Box<dyn SignalingChannel>, TransportError>;
}

/// WebSocket relay connector
pub struct WsSignalingConnector {
    url: String,
    handshake_timeout: Duration,
}

impl WsSignalingConnector {
    pub fn new(url: impl Into<String>, handshake_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            handshake_timeout,
        }
    }

    fn endpoint(&self, client_id: &str) -> Result<Url, TransportError> {
        let mut url = Url::parse(&self.url)
            .map_err(|e| TransportError::InvalidUrl(format!("{}: {}", self.url, e)))?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(TransportError::InvalidUrl(format!(
                    "unsupported scheme '{}'",
                    other
                )))
            }
        }
        url.query_pairs_mut().append_pair("clientId", client_id);
        Ok(url)
    }

    async fn await_ack(&self, ws: &mut WsStream) -> Result<(), TransportError> {
        let timeout_ms = self.handshake_timeout.as_millis() as u64;
        let ack = tokio::time::timeout(self.handshake_timeout, async {
            while let Some(frame) = ws.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        return match SignalingMessage::from_json(&text) {
                            Ok(SignalingMessage::Connected { .. }) => Ok(()),
                            Ok(other) => Err(TransportError::Handshake(format!(
                                "expected connected, got {}",
                                other.kind()
                            ))),
                            Err(e) => Err(TransportError::Handshake(format!(
                                "unparseable handshake frame: {}",
                                e
                            ))),
                        };
                    }
                    Ok(Message::Close(frame)) => {
                        let reason = frame
                            .map(|f| format!("{} {}", u16::from(f.code), f.reason))
                            .unwrap_or_else(|| "closed".to_string());
                        return Err(TransportError::Handshake(reason));
                    }
                    Ok(_) => continue,
                    Err(e) => return Err(TransportError::Handshake(e.to_string())),
                }
            }
            Err(TransportError::Handshake(
                "connection ended before acknowledgement".to_string(),
            ))
        })
        .await;

        ack.unwrap_or(Err(TransportError::HandshakeTimeout(timeout_ms)))
    }
}

#[async_trait]
impl SignalingConnector for WsSignalingConnector {
    async fn open(
        &self,
        client_id: &str,
        auth_token: Option<&str>,
        handler: TransportHandler,
    ) -> Result<Box<dyn SignalingChannel>, TransportError> {
        let url = self.endpoint(client_id)?;
        log::info!("Opening signaling channel to {} for client {}", self.url, client_id);

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        if let Some(token) = auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| TransportError::Connect(format!("invalid auth token: {}", e)))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (mut ws, _) = connect_async(request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let hello = SignalingMessage::Connected {
            client_id: Some(client_id.to_string()),
        };
        let hello = hello
            .to_json()
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        ws.send(Message::Text(hello))
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        if let Err(e) = self.await_ack(&mut ws).await {
            let _ = ws.close(None).await;
            return Err(e);
        }
        log::debug!("Signaling handshake complete for client {}", client_id);

        Ok(Box::new(WsSignalingChannel::spawn(ws, handler)))
    }
}

struct WsSignalingChannel {
    outbound: mpsc::UnboundedSender<Message>,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl WsSignalingChannel {
    fn spawn(ws: WsStream, handler: TransportHandler) -> Self {
        let (write, read) = ws.split();
        let (outbound, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(Self::writer_task(write, rx));
        let reader = tokio::spawn(Self::reader_task(read, handler, closed.clone()));

        Self {
            outbound,
            closed,
            reader,
        }
    }

    async fn writer_task(
        mut write: futures_util::stream::SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<Message>,
    ) {
        while let Some(msg) = rx.recv().await {
            let is_close = matches!(msg, Message::Close(_));
            if let Err(e) = write.send(msg).await {
                log::debug!("Signaling write failed: {}", e);
                break;
            }
            if is_close {
                break;
            }
        }
        let _ = write.close().await;
    }

    async fn reader_task(
        mut read: futures_util::stream::SplitStream<WsStream>,
        handler: TransportHandler,
        closed: Arc<AtomicBool>,
    ) {
        let reason = loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => match SignalingMessage::from_json(&text) {
                    Ok(message) => handler(TransportEvent::Message(message)),
                    Err(e) => log::warn!("Skipping unparseable signaling frame: {}", e),
                },
                Some(Ok(Message::Close(frame))) => {
                    break frame
                        .map(|f| format!("relay closed: {} {}", u16::from(f.code), f.reason))
                        .unwrap_or_else(|| "relay closed".to_string());
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => break e.to_string(),
                None => break "connection ended".to_string(),
            }
        };

        // An explicit close() already owns the teardown; stay quiet then.
        if !closed.swap(true, Ordering::SeqCst) {
            log::warn!("Signaling channel dropped: {}", reason);
            handler(TransportEvent::Closed { reason });
        }
    }
}

impl SignalingChannel for WsSignalingChannel {
    fn send(&self, message: SignalingMessage) {
        if self.closed.load(Ordering::SeqCst) {
            log::debug!("Dropping {} on closed signaling channel", message.kind());
            return;
        }
        match message.to_json() {
            Ok(text) => {
                if self.outbound.send(Message::Text(text)).is_err() {
                    log::debug!("Dropping {}: writer gone", message.kind());
                }
            }
            Err(e) => log::error!("Failed to encode {}: {}", message.kind(), e),
        }
    }

    fn close(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("Closing signaling channel");
        let _ = self.outbound.send(Message::Close(None));
        self.reader.abort();
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for WsSignalingChannel {
    fn drop(&mut self) {
        self.close();
    }
}
