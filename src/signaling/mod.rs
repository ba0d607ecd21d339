//! WebSocket signaling channel.
//!
//! A persistent connection to the rendezvous server carrying
//! JSON-encoded negotiation and application messages. Incoming messages
//! are dispatched to a registered handler; lifecycle events (open,
//! close, error) are logged and published as notifications but never
//! tear down the peer connection by themselves.
//!
//! `send` on a channel that is not open reconnects and retries inside a
//! bounded loop; once the attempt cap is exhausted the message is
//! dropped with a warning. Sending never returns an error to callers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::BridgeError;
use crate::event::{ChannelEvent, EventBus};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Signaling envelope: `{"type": <kind>, "data": <object>}`.
///
/// One offer/answer pair plus any number of ice-candidate messages make
/// up a negotiation round.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum SignalingMessage {
    /// Session offer carrying the remote description.
    Offer { sdp: String },
    /// Session answer carrying the local description.
    Answer { sdp: String },
    /// A single ICE candidate.
    IceCandidate {
        candidate: String,
        #[serde(rename = "sdpMid")]
        sdp_mid: Option<String>,
        #[serde(
            rename = "sdpMLineIndex",
            skip_serializing_if = "Option::is_none",
            default
        )]
        sdp_mline_index: Option<u16>,
    },
    /// Application-level message relayed through signaling; opaque to
    /// the transport.
    ApplicationEvent(serde_json::Value),
}

impl SignalingMessage {
    /// Wire name of this message kind.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::IceCandidate { .. } => "ice-candidate",
            SignalingMessage::ApplicationEvent(_) => "application-event",
        }
    }
}

/// Handler invoked for every well-formed incoming message.
pub type MessageHandler = Arc<dyn Fn(SignalingMessage) + Send + Sync>;

/// Persistent signaling connection with bounded send retries.
pub struct SignalingChannel {
    url: String,
    bearer_token: Option<String>,
    retry_cap: u32,
    sink: Arc<tokio::sync::Mutex<Option<WsSink>>>,
    open: Arc<AtomicBool>,
    handler: Arc<parking_lot::Mutex<Option<MessageHandler>>>,
    bus: Arc<EventBus>,
}

impl SignalingChannel {
    /// Create a channel for a fixed endpoint. The bearer token, when
    /// present, is attached as an `Authorization` header on connect.
    pub fn new(
        url: String,
        bearer_token: Option<String>,
        retry_cap: u32,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            url,
            bearer_token,
            retry_cap,
            sink: Arc::new(tokio::sync::Mutex::new(None)),
            open: Arc::new(AtomicBool::new(false)),
            handler: Arc::new(parking_lot::Mutex::new(None)),
            bus,
        }
    }

    /// Register the handler for incoming messages. Replaces any
    /// previous handler.
    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(SignalingMessage) + Send + Sync + 'static,
    {
        *self.handler.lock() = Some(Arc::new(handler));
    }

    /// Whether the underlying socket is currently open.
    pub fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Open the connection and start the reader task.
    pub async fn connect(&self) -> Result<(), BridgeError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| BridgeError::SignalingConnect(e.to_string()))?;

        if let Some(token) = &self.bearer_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| BridgeError::SignalingConnect(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        info!("connecting to signaling server at {}", self.url);
        let (stream, _response) = connect_async(request)
            .await
            .map_err(|e| BridgeError::SignalingConnect(e.to_string()))?;

        let (ws_sink, mut ws_stream) = stream.split();
        *self.sink.lock().await = Some(ws_sink);
        self.open.store(true, Ordering::SeqCst);
        self.bus.publish_channel(ChannelEvent::Opened);
        info!("signaling connection open");

        let open = self.open.clone();
        let handler = self.handler.clone();
        let bus = self.bus.clone();

        tokio::spawn(async move {
            while let Some(result) = ws_stream.next().await {
                match result {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<SignalingMessage>(&text) {
                            Ok(message) => {
                                debug!("signaling message received: {}", message.kind());
                                bus.publish_message(&message);
                                let handler = handler.lock().clone();
                                if let Some(handler) = handler {
                                    handler(message);
                                }
                            }
                            Err(e) => warn!("ignoring malformed signaling message: {}", e),
                        }
                    }
                    Ok(Message::Close(_)) => {
                        info!("signaling connection closed by server");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("signaling socket error: {}", e);
                        bus.publish_channel(ChannelEvent::Error(e.to_string()));
                        break;
                    }
                }
            }
            open.store(false, Ordering::SeqCst);
            bus.publish_channel(ChannelEvent::Closed);
        });

        Ok(())
    }

    /// Transmit a message.
    ///
    /// When the channel is not open this reconnects and retries up to
    /// the configured cap, then drops the message with a warning. The
    /// retry counter is local state in an explicit loop.
    pub async fn send(&self, message: &SignalingMessage) {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                warn!("failed to serialize {} message: {}", message.kind(), e);
                return;
            }
        };

        let mut attempts = 0u32;
        loop {
            if self.open.load(Ordering::SeqCst) {
                let mut guard = self.sink.lock().await;
                if let Some(sink) = guard.as_mut() {
                    match sink.send(Message::Text(text.clone())).await {
                        Ok(()) => {
                            debug!("sent {} message", message.kind());
                            return;
                        }
                        Err(e) => {
                            warn!("signaling send failed: {}", e);
                            self.open.store(false, Ordering::SeqCst);
                        }
                    }
                }
            }

            if attempts >= self.retry_cap {
                warn!(
                    "signaling send retries exhausted, dropping {} message",
                    message.kind()
                );
                return;
            }
            attempts += 1;
            debug!(
                "signaling channel not open, reconnect attempt {}/{}",
                attempts, self.retry_cap
            );
            if let Err(e) = self.connect().await {
                warn!("signaling reconnect failed: {}", e);
            }
        }
    }

    /// Close the connection.
    pub async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let mut guard = self.sink.lock().await;
        if let Some(sink) = guard.as_mut() {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        }
        *guard = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_offer_serializes_with_envelope() {
        let offer = SignalingMessage::Offer {
            sdp: "v=0\r\n".to_string(),
        };
        let json = serde_json::to_string(&offer).unwrap();
        assert!(json.contains("\"type\":\"offer\""));
        assert!(json.contains("\"sdp\":\"v=0\\r\\n\""));
    }

    #[test]
    fn test_ice_candidate_deserializes() {
        let json = r#"{"type":"ice-candidate","data":{"candidate":"candidate:1 1 UDP 2130706431 192.168.1.1 8189 typ host","sdpMid":"0"}}"#;
        let message: SignalingMessage = serde_json::from_str(json).unwrap();
        match message {
            SignalingMessage::IceCandidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => {
                assert!(candidate.starts_with("candidate:"));
                assert_eq!(sdp_mid.as_deref(), Some("0"));
                assert_eq!(sdp_mline_index, None);
            }
            other => panic!("expected ice-candidate, got {}", other.kind()),
        }
    }

    #[test]
    fn test_application_event_roundtrip() {
        let json = r#"{"type":"application-event","data":{"name":"session-ended","detail":7}}"#;
        let message: SignalingMessage = serde_json::from_str(json).unwrap();
        assert_eq!(message.kind(), "application-event");
        let back = serde_json::to_string(&message).unwrap();
        assert!(back.contains("session-ended"));
    }

    #[tokio::test]
    async fn test_send_drops_after_bounded_retries() {
        let _ = env_logger::builder().is_test(true).try_init();
        let bus = Arc::new(EventBus::new());
        // Nothing listens here; every reconnect attempt fails fast.
        let channel = SignalingChannel::new("ws://127.0.0.1:9".to_string(), None, 3, bus);

        channel
            .send(&SignalingMessage::Answer {
                sdp: "v=0".to_string(),
            })
            .await;
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn test_receive_dispatches_to_handler() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text(
                r#"{"type":"offer","data":{"sdp":"v=0"}}"#.to_string(),
            ))
            .await
            .unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;
        });

        let bus = Arc::new(EventBus::new());
        let channel = SignalingChannel::new(format!("ws://{}", addr), None, 3, bus);

        let (tx, rx) = std::sync::mpsc::channel();
        channel.set_handler(move |message| {
            let _ = tx.send(message);
        });
        channel.connect().await.unwrap();

        let received = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(2)))
            .await
            .unwrap()
            .unwrap();
        match received {
            SignalingMessage::Offer { sdp } => assert_eq!(sdp, "v=0"),
            other => panic!("expected offer, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_send_succeeds_when_open() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (server_tx, server_rx) = std::sync::mpsc::channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                let _ = server_tx.send(text);
            }
        });

        let bus = Arc::new(EventBus::new());
        let channel = SignalingChannel::new(format!("ws://{}", addr), None, 3, bus);
        channel.connect().await.unwrap();
        channel
            .send(&SignalingMessage::IceCandidate {
                candidate: "candidate:1".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            })
            .await;

        let text = tokio::task::spawn_blocking(move || {
            server_rx.recv_timeout(Duration::from_secs(2))
        })
        .await
        .unwrap()
        .unwrap();
        assert!(text.contains("\"type\":\"ice-candidate\""));
        assert!(text.contains("sdpMid"));
    }
}
