//! Transport seam between the connection manager and the wire.
//!
//! The realtime channel is a collaborator: the core only needs a way to
//! open a bidirectional typed event link. Production uses a WebSocket
//! with JSON frames; tests substitute an in-memory link.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tracing::{debug, warn};

use crate::error::ChatError;
use crate::protocol::{ClientEvent, ServerEvent};

/// One open link. Dropping either side (or the remote closing) ends it:
/// `inbound` yields `None` and `outbound` sends start failing, which the
/// connection manager treats as transport loss.
pub struct TransportLink {
    pub outbound: mpsc::Sender<ClientEvent>,
    pub inbound: mpsc::Receiver<ServerEvent>,
}

/// Factory for transport links. One logical session re-opens through the
/// same factory on every reconnect attempt.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self) -> Result<TransportLink, ChatError>;
}

/// WebSocket transport with JSON-framed events.
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self) -> Result<TransportLink, ChatError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.url)
            .await
            .map_err(|e| ChatError::Transport(e.to_string()))?;
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<ClientEvent>(64);
        let (in_tx, in_rx) = mpsc::channel::<ServerEvent>(256);

        // Writer: serialize outbound events onto the socket. A send error
        // means the socket is gone; stop and let the reader side report it.
        tokio::spawn(async move {
            while let Some(event) = out_rx.recv().await {
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to serialize outbound event: {}", e);
                        continue;
                    }
                };
                if ws_write
                    .send(tungstenite::Message::Text(json.into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        // Reader: parse inbound frames into typed events. Unparsable frames
        // are logged and skipped; close or error ends the link.
        tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                match msg {
                    Ok(tungstenite::Message::Text(text)) => {
                        match serde_json::from_str::<ServerEvent>(&text) {
                            Ok(event) => {
                                if in_tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!("Skipping unparsable server event: {}", e),
                        }
                    }
                    Ok(tungstenite::Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            debug!("WebSocket link closed");
            // in_tx drops here; the receiver sees end-of-stream.
        });

        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
