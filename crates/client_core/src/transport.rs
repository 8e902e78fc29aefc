use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::protocol::RelayFrame;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

/// One physical relay connection as a pair of frame queues.
///
/// The connection is considered dropped once `inbound` yields `None`; dropping
/// `outbound` closes it from this side.
pub struct RelayLink {
    pub outbound: mpsc::UnboundedSender<RelayFrame>,
    pub inbound: mpsc::UnboundedReceiver<RelayFrame>,
}

#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<RelayLink>;
}

/// JSON-over-websocket relay transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

#[async_trait]
impl RelayConnector for WebSocketConnector {
    async fn connect(&self, endpoint: &str) -> Result<RelayLink> {
        let ws_url = websocket_url(endpoint)?;
        let (ws_stream, _) = connect_async(&ws_url)
            .await
            .with_context(|| format!("failed to connect websocket: {ws_url}"))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<RelayFrame>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<RelayFrame>();

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(event = %frame.event, error = %err, "relay: failed to encode frame");
                        continue;
                    }
                };
                if let Err(err) = ws_writer.send(Message::Text(text)).await {
                    // Later sends now fail with NotConnected. Frames already
                    // queued were accepted by the channel and are lost.
                    outbound_rx.close();
                    let mut dropped = 1_usize;
                    while outbound_rx.try_recv().is_ok() {
                        dropped += 1;
                    }
                    warn!(error = %err, dropped, "relay: websocket write failed");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<RelayFrame>(&text) {
                        Ok(frame) => {
                            if inbound_tx.send(frame).is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!(error = %err, "relay: dropping malformed frame"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "relay: websocket read failed");
                        break;
                    }
                }
            }
            debug!("relay: websocket reader finished");
        });

        Ok(RelayLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

/// Accepts `ws://`/`wss://` as-is and maps `http(s)://` onto them.
pub fn websocket_url(endpoint: &str) -> Result<String> {
    let endpoint = endpoint.trim();
    if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
        Ok(endpoint.to_string())
    } else if endpoint.starts_with("https://") {
        Ok(endpoint.replacen("https://", "wss://", 1))
    } else if endpoint.starts_with("http://") {
        Ok(endpoint.replacen("http://", "ws://", 1))
    } else {
        Err(anyhow!(
            "relay url must start with ws://, wss://, http:// or https://"
        ))
    }
}
