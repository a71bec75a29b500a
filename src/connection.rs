//! Duplex, framed-message transport over a single WebSocket connection.
//!
//! `Connection` is the lowest layer of the stack: it knows nothing about commands,
//! ids, or events, only that it ships text frames to a peer in order and hands back
//! whatever text frames the peer sends in return. The [`crate::transport::Transport`]
//! layer owns one `Connection` and interprets the frames it produces.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::{Error, Result};

type WsSink = futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsStream = futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// A duplex WebSocket connection that speaks text frames only.
///
/// `Connection` is constructed in a disconnected state; call [`Connection::connect`]
/// to perform the handshake and begin receiving. Received frames are delivered on the
/// `mpsc::UnboundedReceiver<String>` returned by `connect`; the caller (normally
/// `Transport::connect`, which spawns a task to drain it) is expected to consume it.
pub struct Connection {
    sink: TokioMutex<Option<WsSink>>,
}

impl Connection {
    /// Create a disconnected `Connection`.
    pub fn new() -> Self {
        Self {
            sink: TokioMutex::new(None),
        }
    }

    /// Establish the WebSocket handshake against `uri` and spawn the receive loop.
    ///
    /// Returns a channel of text frames as they arrive. The receive loop runs until
    /// the socket closes or errors; at that point the channel is closed, which is the
    /// signal the task spawned in `Transport::connect` uses to drive its own teardown.
    pub async fn connect(&self, uri: &str) -> Result<mpsc::UnboundedReceiver<String>> {
        tracing::debug!(%uri, "connecting");

        url::Url::parse(uri).map_err(|e| Error::TransportStartFailed(format!("invalid URL: {e}")))?;

        let (ws_stream, _response) = tokio_tungstenite::connect_async(uri)
            .await
            .map_err(|e| Error::TransportStartFailed(e.to_string()))?;

        let (sink, mut stream) = ws_stream.split();
        *self.sink.lock().await = Some(sink);

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            Self::receive_loop(&mut stream, &frame_tx).await;
        });

        tracing::info!(%uri, "connected");
        Ok(frame_rx)
    }

    async fn receive_loop(stream: &mut WsStream, frame_tx: &mpsc::UnboundedSender<String>) {
        while let Some(message) = stream.next().await {
            match message {
                Ok(WsMessage::Text(text)) => {
                    if frame_tx.send(text.to_string()).is_err() {
                        break;
                    }
                }
                Ok(WsMessage::Binary(_)) => {
                    tracing::trace!("ignoring binary frame");
                }
                Ok(WsMessage::Close(_)) => {
                    tracing::debug!("peer closed the connection");
                    break;
                }
                Ok(_) => {
                    // Ping/Pong/Frame variants are handled by tokio-tungstenite itself.
                }
                Err(e) => {
                    tracing::warn!(error = %e, "websocket read error");
                    break;
                }
            }
        }
        tracing::debug!("receive loop ended");
    }

    /// Send one text frame. Concurrent calls are serialized so frames are written in
    /// the order `send` was called.
    pub async fn send(&self, text: String) -> Result<()> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(Error::NotConnected)?;
        sink.send(WsMessage::Text(text.into()))
            .await
            .map_err(|e| Error::TransportError(e.to_string()))
    }

    /// Gracefully close the connection. Idempotent after the first successful call.
    pub async fn disconnect(&self) -> Result<()> {
        let mut guard = self.sink.lock().await;
        if let Some(mut sink) = guard.take() {
            if let Err(e) = sink.close().await {
                tracing::debug!(error = %e, "error closing websocket sink");
            }
            tracing::info!("disconnected");
        }
        Ok(())
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}
