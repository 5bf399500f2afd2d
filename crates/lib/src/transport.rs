//! Realtime wire frames and the transport capability.
//!
//! Frames are JSON text over a WebSocket. The `TransportFactory` /
//! `FrameSink` / `FrameStream` traits are the seam the connection supervisor
//! is tested through; `WsTransportFactory` is the production implementation.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::identity::Identity;

/// Client → server frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Sent once per successful connect so the backend routes pushes here.
    #[serde(rename_all = "camelCase")]
    Register { user_id: Identity },
    /// A driver message to dispatch.
    #[serde(rename_all = "camelCase")]
    ChatMessage { user_id: Identity, content: String },
}

/// Server → client frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// A dispatcher reply pushed to the registered client. `currentTime` is a
    /// server-formatted naive datetime (UTC).
    #[serde(rename_all = "camelCase")]
    Reply { reply: String, current_time: String },
    /// Acknowledgement of a chat_message send.
    #[serde(rename_all = "camelCase")]
    Ack {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// What the receive half yields: a parsed frame, or the end of the connection.
#[derive(Debug)]
pub enum TransportEvent {
    Frame(ServerFrame),
    /// The connection ended. `server_initiated` is true when the peer sent a
    /// close frame (as opposed to a local error or a dropped stream).
    Closed {
        server_initiated: bool,
        reason: Option<String>,
    },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
}

/// Send half of a connected transport.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: ClientFrame) -> Result<(), TransportError>;
    async fn close(&mut self);
}

/// Receive half of a connected transport. Yields events until `Closed`.
#[async_trait]
pub trait FrameStream: Send {
    async fn next_event(&mut self) -> TransportEvent;
}

/// Capability that opens the persistent connection. Injected into the
/// supervisor so tests can substitute an in-memory transport.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>), TransportError>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Production WebSocket transport.
pub struct WsTransportFactory;

#[async_trait]
impl TransportFactory for WsTransportFactory {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>), TransportError> {
        let (stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (sink, stream) = stream.split();
        Ok((
            Box::new(WsFrameSink { inner: sink }),
            Box::new(WsFrameStream { inner: stream }),
        ))
    }
}

struct WsFrameSink {
    inner: SplitSink<WsStream, WsMessage>,
}

#[async_trait]
impl FrameSink for WsFrameSink {
    async fn send(&mut self, frame: ClientFrame) -> Result<(), TransportError> {
        let text =
            serde_json::to_string(&frame).map_err(|e| TransportError::Send(e.to_string()))?;
        self.inner
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.inner.send(WsMessage::Close(None)).await;
        let _ = self.inner.close().await;
    }
}

struct WsFrameStream {
    inner: SplitStream<WsStream>,
}

#[async_trait]
impl FrameStream for WsFrameStream {
    async fn next_event(&mut self) -> TransportEvent {
        while let Some(msg) = self.inner.next().await {
            match msg {
                Ok(WsMessage::Text(text)) => match serde_json::from_str::<ServerFrame>(&text) {
                    Ok(frame) => return TransportEvent::Frame(frame),
                    Err(e) => {
                        log::debug!("transport: ignoring unrecognized frame: {}", e);
                    }
                },
                Ok(WsMessage::Close(frame)) => {
                    return TransportEvent::Closed {
                        server_initiated: true,
                        reason: frame.map(|f| f.reason.to_string()),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    return TransportEvent::Closed {
                        server_initiated: false,
                        reason: Some(e.to_string()),
                    }
                }
            }
        }
        TransportEvent::Closed {
            server_initiated: false,
            reason: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frames_use_wire_field_names() {
        let register = serde_json::to_value(ClientFrame::Register { user_id: 42 }).unwrap();
        assert_eq!(
            register,
            serde_json::json!({ "type": "register", "userId": 42 })
        );
        let chat = serde_json::to_value(ClientFrame::ChatMessage {
            user_id: 42,
            content: "30min Break Time".to_string(),
        })
        .unwrap();
        assert_eq!(
            chat,
            serde_json::json!({
                "type": "chat_message",
                "userId": 42,
                "content": "30min Break Time"
            })
        );
    }

    #[test]
    fn reply_frame_parses_current_time() {
        let frame: ServerFrame = serde_json::from_str(
            r#"{"type":"reply","reply":"10-4","currentTime":"2024-01-01 10:00:05"}"#,
        )
        .unwrap();
        assert_eq!(
            frame,
            ServerFrame::Reply {
                reply: "10-4".to_string(),
                current_time: "2024-01-01 10:00:05".to_string(),
            }
        );
    }

    #[test]
    fn ack_frame_parses_both_outcomes() {
        let ok: ServerFrame = serde_json::from_str(
            r#"{"type":"ack","success":true,"request":"Hour Reset","timestamp":"2024-01-01 10:00:00"}"#,
        )
        .unwrap();
        assert!(matches!(ok, ServerFrame::Ack { success: true, .. }));

        let failed: ServerFrame =
            serde_json::from_str(r#"{"type":"ack","success":false,"error":"not registered"}"#)
                .unwrap();
        match failed {
            ServerFrame::Ack { success, error, .. } => {
                assert!(!success);
                assert_eq!(error.as_deref(), Some("not registered"));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}
