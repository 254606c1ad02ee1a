//! Relay socket abstraction and its tokio-tungstenite implementation.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

const EVENT_CHANNEL_CAPACITY: usize = 100;

/// An event produced by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The transport has successfully connected.
    Connected,
    /// A text frame has been received from the relay.
    TextReceived(String),
    /// The connection was lost.
    Disconnected,
}

/// Represents an active relay connection.
/// The transport is a dumb pipe for text frames with no knowledge of the message schema.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one text frame.
    async fn send(&self, text: &str) -> Result<(), anyhow::Error>;

    /// Closes the connection.
    async fn disconnect(&self);
}

/// A factory responsible for creating new transport instances.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Dials `url` and returns the transport along with a stream of its events.
    async fn create_transport(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error>;
}

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

pub struct TokioWebSocketTransport {
    ws_sink: Mutex<Option<WsSink>>,
}

#[async_trait]
impl Transport for TokioWebSocketTransport {
    async fn send(&self, text: &str) -> Result<(), anyhow::Error> {
        let mut sink_guard = self.ws_sink.lock().await;
        let sink = sink_guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Socket is closed"))?;

        trace!("--> {text}");
        sink.send(Message::text(text.to_string()))
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket send error: {}", e))?;
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(mut sink) = self.ws_sink.lock().await.take() {
            if let Err(e) = sink.close().await {
                debug!("Error closing websocket: {e}");
            }
        }
    }
}

/// Factory for creating Tokio WebSocket transports
#[derive(Debug, Clone, Default)]
pub struct TokioWebSocketTransportFactory;

impl TokioWebSocketTransportFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportFactory for TokioWebSocketTransportFactory {
    async fn create_transport(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        info!("Dialing {}", redact_query(url));
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket connect failed: {}", e))?;

        let (sink, stream) = ws.split();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let transport = Arc::new(TokioWebSocketTransport {
            ws_sink: Mutex::new(Some(sink)),
        });

        let _ = event_tx.send(TransportEvent::Connected).await;
        tokio::spawn(read_pump(stream, event_tx));

        Ok((transport, event_rx))
    }
}

async fn read_pump(mut stream: WsStream, event_tx: mpsc::Sender<TransportEvent>) {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                trace!("<-- {}", text.as_str());
                if event_tx
                    .send(TransportEvent::TextReceived(text.as_str().to_string()))
                    .await
                    .is_err()
                {
                    warn!("Event receiver dropped, closing read pump");
                    break;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                trace!("Received close frame: {frame:?}");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!("Error reading from websocket: {e}");
                break;
            }
            None => {
                trace!("Websocket stream ended");
                break;
            }
        }
    }

    let _ = event_tx.send(TransportEvent::Disconnected).await;
}

/// Strips the query string so tokens never end up in logs.
pub(crate) fn redact_query(url: &str) -> &str {
    url.split_once('?').map_or(url, |(base, _)| base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_query() {
        assert_eq!(
            redact_query("wss://0.peerjs.com:443/peerjs?key=peerjs&id=a&token=b"),
            "wss://0.peerjs.com:443/peerjs"
        );
        assert_eq!(redact_query("wss://host/path"), "wss://host/path");
    }
}
