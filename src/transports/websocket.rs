//! WebSocket transport over `tokio-tungstenite`.
//!
//! `ws://` and `wss://` are both supported; TLS is negotiated by
//! [`MaybeTlsStream`](tokio_tungstenite::MaybeTlsStream).
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), huddle_client::HuddleError> {
//! use huddle_client::{Connector, WebSocketConnector};
//!
//! let connector = WebSocketConnector::new("wss://chat.example.com/realtime");
//! let mut transport = connector.connect().await?;
//! transport.close().await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use crate::error::HuddleError;
use crate::transport::{Connector, Transport};

/// Default deadline for the WebSocket handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The underlying stream type.
pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// A [`Transport`] over one WebSocket connection.
///
/// `recv` is cancel-safe: `StreamExt::next` on a tungstenite stream does not
/// drop buffered frames when its future is dropped.
#[derive(Debug)]
pub struct WebSocketTransport {
    stream: WsStream,
    closed: bool,
}

impl WebSocketTransport {
    /// Open a connection to `url`.
    ///
    /// # Errors
    ///
    /// [`HuddleError::Io`] if the URL is invalid or the handshake fails. The
    /// I/O error kind is preserved when tungstenite reports one.
    pub async fn connect(url: &str) -> Result<Self, HuddleError> {
        debug!(url, "opening websocket");
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| {
                let kind = match &e {
                    tokio_tungstenite::tungstenite::Error::Io(io) => io.kind(),
                    _ => std::io::ErrorKind::Other,
                };
                HuddleError::Io(std::io::Error::new(kind, e))
            })?;
        info!(url, "websocket open");
        Ok(Self::from_stream(stream))
    }

    /// Like [`connect`](Self::connect) but gives up after `timeout`.
    ///
    /// # Errors
    ///
    /// [`HuddleError::Timeout`] when the deadline passes first.
    pub async fn connect_with_timeout(url: &str, timeout: Duration) -> Result<Self, HuddleError> {
        tokio::time::timeout(timeout, Self::connect(url))
            .await
            .map_err(|_| HuddleError::Timeout)?
    }

    /// Wrap a stream the caller opened with its own TLS or header setup.
    pub fn from_stream(stream: WsStream) -> Self {
        Self {
            stream,
            closed: false,
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, frame: String) -> Result<(), HuddleError> {
        if self.closed {
            return Err(HuddleError::TransportClosed);
        }
        self.stream
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| HuddleError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, HuddleError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(HuddleError::TransportReceive(e.to_string()))),
            };
            match message {
                Message::Text(text) => return Some(Ok(text.to_string())),
                Message::Close(frame) => {
                    debug!(?frame, "server closed websocket");
                    return None;
                }
                // tungstenite answers pings on its own.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                Message::Binary(bytes) => {
                    warn!(len = bytes.len(), "ignoring binary frame");
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), HuddleError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream
            .close(None)
            .await
            .map_err(|e| HuddleError::TransportSend(e.to_string()))
    }
}

/// A [`Connector`] that dials the same WebSocket URL on every attempt.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Set the handshake deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, HuddleError> {
        let transport = WebSocketTransport::connect_with_timeout(&self.url, self.timeout).await?;
        Ok(Box::new(transport))
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Accept one websocket on a local port and hand it to `handler`.
    async fn serve_once<F, Fut>(handler: F) -> String
    where
        F: FnOnce(tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) -> Fut
            + Send
            + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            handler(ws).await;
        });
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn unreachable_server_is_io_error() {
        let err = WebSocketTransport::connect("ws://127.0.0.1:1")
            .await
            .unwrap_err();
        assert!(matches!(err, HuddleError::Io(_)));
    }

    #[tokio::test]
    async fn connector_times_out() {
        let connector =
            WebSocketConnector::new("ws://192.0.2.1:1").with_timeout(Duration::from_millis(50));
        let err = connector.connect().await.err().unwrap();
        assert!(matches!(err, HuddleError::Timeout));
    }

    #[tokio::test]
    async fn connector_opens_fresh_transports() {
        let url = serve_once(|mut ws| async move {
            ws.send(Message::Text(r#"{"type":"disconnect","data":{}}"#.into()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let connector = WebSocketConnector::new(url);
        let mut transport = connector.connect().await.unwrap();
        let frame = transport.recv().await.unwrap().unwrap();
        assert!(frame.contains("disconnect"));
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn binary_frames_are_skipped() {
        let url = serve_once(|mut ws| async move {
            ws.send(Message::Binary(vec![1, 2, 3].into()))
                .await
                .unwrap();
            ws.send(Message::Text("text".into())).await.unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        assert_eq!(transport.recv().await.unwrap().unwrap(), "text");
    }

    #[tokio::test]
    async fn frames_reach_the_server() {
        let url = serve_once(|mut ws| async move {
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                ws.send(Message::Text(text)).await.unwrap();
            }
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        transport
            .send(r#"{"message":{"type":"join_group","data":{"groupId":"g1"}}}"#.into())
            .await
            .unwrap();
        let echoed = transport.recv().await.unwrap().unwrap();
        assert!(echoed.contains("join_group"));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_sends() {
        let url = serve_once(|mut ws| async move { while let Some(Ok(_)) = ws.next().await {} })
            .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();
        let err = transport.send("late".into()).await.unwrap_err();
        assert!(matches!(err, HuddleError::TransportClosed));
    }
}
