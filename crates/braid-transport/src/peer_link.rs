//! Outbound websocket link to a remote peer.
//!
//! A link is dialed with [`PeerLink::connect`], authenticated with
//! [`PeerLink::send_credentials`] and promoted with
//! [`PeerLink::send_peer_request`]. Afterwards [`PeerLink::into_parts`]
//! hands the socket and its inbound events to the engine.

use braid_protocol::{codec, Message, PeerId, SocketId};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame, WebSocketConfig},
        Message as WsMessage,
    },
};
use tracing::{debug, trace, warn};

use crate::error::{codes, HandshakeError, TransportError};
use crate::socket::{OutboundFrame, SocketHandle, SocketLimits};

/// Peer link configuration.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Payload and backpressure limits.
    pub limits: SocketLimits,
    /// Time allowed for credentials and peer responses.
    pub handshake_timeout: Duration,
    /// Interval between heartbeat pings.
    pub heartbeat_interval: Duration,
    /// Silence after which the link is considered dead.
    pub heartbeat_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            limits: SocketLimits::default(),
            handshake_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
        }
    }
}

/// Inbound activity on a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A binary frame arrived.
    Message(Bytes),
    /// The link closed. Always the last event.
    Closed { code: u16, reason: String },
}

enum Wait<T> {
    Response(T),
    Closed(u16, String),
    TimedOut,
}

/// An outbound connection to one peer.
#[derive(Debug)]
pub struct PeerLink {
    address: String,
    handle: SocketHandle,
    events: mpsc::UnboundedReceiver<LinkEvent>,
    config: LinkConfig,
}

impl PeerLink {
    /// Dial a peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the websocket handshake fails.
    pub async fn connect(address: &str, config: LinkConfig) -> Result<Self, TransportError> {
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(config.limits.max_payload + 1024);
        ws_config.max_frame_size = Some(config.limits.max_payload + 1024);

        let dial = connect_async_with_config(address, Some(ws_config), true);
        let (stream, _) = tokio::time::timeout(config.handshake_timeout, dial)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectFailed(format!("{address}: {e}")))?;

        debug!(address = %address, "Peer link connected");

        let (mut sink, mut source) = stream.split();
        let (handle, mut frames) = SocketHandle::channel(SocketId::generate(), None, config.limits);
        let (events_tx, events) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                let result = match &frame {
                    OutboundFrame::Binary(data) => sink.send(WsMessage::Binary(data.to_vec())).await,
                    OutboundFrame::Ping => sink.send(WsMessage::Ping(Vec::new())).await,
                    OutboundFrame::Close { .. } if frame.is_terminal_only() => break,
                    OutboundFrame::Close { code, reason } => {
                        let close = CloseFrame {
                            code: CloseCode::from(*code),
                            reason: reason.clone().into(),
                        };
                        let _ = sink.send(WsMessage::Close(Some(close))).await;
                        break;
                    }
                };
                frames.sent(&frame);
                if let Err(e) = result {
                    debug!(error = %e, "Peer link write failed");
                    break;
                }
            }
        });

        let reader_handle = handle.clone();
        let heartbeat_interval = config.heartbeat_interval;
        let heartbeat_timeout = config.heartbeat_timeout;
        tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(heartbeat_interval);
            heartbeat.tick().await;
            let mut last_seen = Instant::now();

            let (code, reason) = loop {
                tokio::select! {
                    msg = source.next() => match msg {
                        Some(Ok(WsMessage::Binary(data))) => {
                            last_seen = Instant::now();
                            if events_tx.send(LinkEvent::Message(Bytes::from(data))).is_err() {
                                break (codes::EXPLICIT_DISCONNECT, "Link dropped".to_string());
                            }
                        }
                        Some(Ok(WsMessage::Text(_))) => {
                            last_seen = Instant::now();
                            warn!("Dropping non-binary frame from peer");
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            break frame
                                .map(|f| (u16::from(f.code), f.reason.into_owned()))
                                .unwrap_or((codes::ABNORMAL, String::new()));
                        }
                        Some(Ok(_)) => {
                            last_seen = Instant::now();
                        }
                        Some(Err(e)) => break (codes::ABNORMAL, e.to_string()),
                        None => break (codes::ABNORMAL, "Stream ended".to_string()),
                    },
                    _ = heartbeat.tick() => {
                        if last_seen.elapsed() > heartbeat_timeout {
                            break (codes::ABNORMAL, "Heartbeat timeout".to_string());
                        }
                        reader_handle.ping();
                    }
                }
            };

            trace!(code, reason = %reason, "Peer link reader finished");
            reader_handle.close(codes::ABNORMAL, reason.clone());
            let _ = events_tx.send(LinkEvent::Closed { code, reason });
        });

        Ok(Self {
            address: address.to_string(),
            handle,
            events,
            config,
        })
    }

    /// Address the link was dialed at.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Sending side of the link.
    #[must_use]
    pub fn handle(&self) -> &SocketHandle {
        &self.handle
    }

    async fn wait_for<T>(&mut self, mut pick: impl FnMut(Message) -> Option<T>) -> Wait<T> {
        let deadline = tokio::time::Instant::now() + self.config.handshake_timeout;
        loop {
            let event = match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Err(_) => return Wait::TimedOut,
                Ok(None) => return Wait::Closed(codes::CLOSED, "Link dropped".to_string()),
                Ok(Some(event)) => event,
            };
            match event {
                LinkEvent::Closed { code, reason } => return Wait::Closed(code, reason),
                LinkEvent::Message(data) => match codec::decode(&data) {
                    Ok(message) => {
                        if let Some(response) = pick(message) {
                            return Wait::Response(response);
                        }
                    }
                    Err(e) => warn!(address = %self.address, error = %e, "Undecodable handshake frame"),
                },
            }
        }
    }

    /// Submit credentials and wait for the response.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::Credentials`] on rejection or timeout (504)
    /// and [`HandshakeError::Close`] if the link closes first.
    pub async fn send_credentials(&mut self, credentials: Value) -> Result<(), HandshakeError> {
        self.handle.send(&Message::credentials(credentials))?;
        let waited = self
            .wait_for(|message| match message {
                Message::CredentialsResponse { outcome } => Some(outcome),
                _ => None,
            })
            .await;
        match waited {
            Wait::Response(outcome) if outcome.success => Ok(()),
            Wait::Response(outcome) => Err(HandshakeError::Credentials {
                code: outcome.code,
                message: outcome.message,
            }),
            Wait::TimedOut => Err(HandshakeError::Credentials {
                code: codes::TIMEOUT,
                message: "Credentials response timeout".to_string(),
            }),
            Wait::Closed(code, reason) => Err(closed_error(code, reason)),
        }
    }

    /// Ask the remote side to treat this link as a peer link.
    ///
    /// Returns the remote peer id.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::Peer`] on rejection or timeout (504);
    /// duplicate-peer rejections (801, 802) carry the remote id.
    pub async fn send_peer_request(&mut self, id: PeerId) -> Result<PeerId, HandshakeError> {
        self.handle.send(&Message::peer_request(id))?;
        let waited = self
            .wait_for(|message| match message {
                Message::PeerResponse { id, outcome } => Some((id, outcome)),
                _ => None,
            })
            .await;
        match waited {
            Wait::Response((remote, outcome)) if outcome.success => Ok(remote),
            Wait::Response((remote, outcome)) => Err(HandshakeError::Peer {
                code: outcome.code,
                message: outcome.message,
                peer_id: Some(remote),
            }),
            Wait::TimedOut => Err(HandshakeError::Peer {
                code: codes::TIMEOUT,
                message: "Peer response timeout".to_string(),
                peer_id: None,
            }),
            Wait::Closed(code, reason) => Err(closed_error(code, reason)),
        }
    }

    /// Close the link.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        self.handle.close(code, reason);
    }

    /// Split into the sending handle and the inbound event stream.
    #[must_use]
    pub fn into_parts(self) -> (SocketHandle, mpsc::UnboundedReceiver<LinkEvent>) {
        (self.handle, self.events)
    }
}

fn closed_error(code: u16, reason: String) -> HandshakeError {
    debug!(code, reason = %reason, "Link closed during handshake");
    HandshakeError::Close {
        code: codes::CLOSED,
        message: if reason.is_empty() {
            format!("Closed with code {code}")
        } else {
            reason
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_protocol::Outcome;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// Accept one websocket and answer handshake messages with `respond`.
    async fn serve_once<F>(respond: F) -> String
    where
        F: Fn(Message) -> Option<Message> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if let WsMessage::Binary(data) = msg {
                    let request = codec::decode(&data).unwrap();
                    if let Some(reply) = respond(request) {
                        let bytes = codec::encode(&reply).unwrap();
                        ws.send(WsMessage::Binary(bytes.to_vec())).await.unwrap();
                    }
                }
            }
        });
        format!("ws://{addr}")
    }

    fn fast_config() -> LinkConfig {
        LinkConfig {
            handshake_timeout: Duration::from_millis(200),
            ..LinkConfig::default()
        }
    }

    #[tokio::test]
    async fn test_handshake_success() {
        let address = serve_once(|message| match message {
            Message::Credentials { .. } => Some(Message::CredentialsResponse {
                outcome: Outcome::ok(),
            }),
            Message::PeerRequest { .. } => Some(Message::PeerResponse {
                id: PeerId(99),
                outcome: Outcome::ok(),
            }),
            _ => None,
        })
        .await;

        let mut link = PeerLink::connect(&address, fast_config()).await.unwrap();
        link.send_credentials(serde_json::json!({"token": "t"}))
            .await
            .unwrap();
        assert_eq!(link.send_peer_request(PeerId(1)).await.unwrap(), PeerId(99));
    }

    #[tokio::test]
    async fn test_handshake_rejection_and_duplicate() {
        let address = serve_once(|message| match message {
            Message::Credentials { .. } => Some(Message::CredentialsResponse {
                outcome: Outcome::failed(403, "Forbidden"),
            }),
            Message::PeerRequest { .. } => Some(Message::PeerResponse {
                id: PeerId(5),
                outcome: Outcome::failed(codes::DUPLICATE_PEER_SOCKET, "Already connected"),
            }),
            _ => None,
        })
        .await;

        let mut link = PeerLink::connect(&address, fast_config()).await.unwrap();
        let err = link.send_credentials(Value::Null).await.unwrap_err();
        assert_eq!(err.code(), 403);

        let err = link.send_peer_request(PeerId(1)).await.unwrap_err();
        assert_eq!(err.duplicate_peer(), Some(PeerId(5)));
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let address = serve_once(|_| None).await;
        let mut link = PeerLink::connect(&address, fast_config()).await.unwrap();
        let err = link.send_credentials(Value::Null).await.unwrap_err();
        assert_eq!(err.code(), codes::TIMEOUT);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let result = PeerLink::connect(&format!("ws://{addr}"), fast_config()).await;
        assert!(matches!(result, Err(TransportError::ConnectFailed(_))));
    }
}
