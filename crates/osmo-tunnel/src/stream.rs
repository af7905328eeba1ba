//! Message-oriented byte streams and the dialer for remote session streams.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt, channel::mpsc, future};
use osmo_transport::SessionRequest;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::{
    WebSocketStream, connect_async,
    tungstenite::{self, Message, client::IntoClientRequest, http::HeaderValue},
};
use url::Url;

use crate::TunnelError;

pub type ByteSink = Pin<Box<dyn Sink<Bytes, Error = TunnelError> + Send>>;
pub type ByteSource = Pin<Box<dyn Stream<Item = Result<Bytes, TunnelError>> + Send>>;

/// Duplex stream of byte frames.
pub struct ByteStream {
    pub sink: ByteSink,
    pub source: ByteSource,
}

impl ByteStream {
    pub fn new<K, S>(sink: K, source: S) -> Self
    where
        K: Sink<Bytes, Error = TunnelError> + Send + 'static,
        S: Stream<Item = Result<Bytes, TunnelError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            source: Box::pin(source),
        }
    }

    /// Binary frames over a WebSocket; the stream ends at the close frame.
    pub fn from_websocket<T>(ws: WebSocketStream<T>) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, source) = ws.split();
        let sink = sink
            .with(|data: Bytes| future::ready(Ok::<_, tungstenite::Error>(Message::Binary(data.to_vec()))))
            .sink_map_err(TunnelError::from);
        let source = source
            .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
            .filter_map(|msg| {
                future::ready(match msg {
                    Ok(Message::Binary(data)) => Some(Ok(Bytes::from(data))),
                    Ok(Message::Text(text)) => Some(Ok(Bytes::from(text))),
                    Ok(_) => None,
                    Err(e) => Some(Err(TunnelError::from(e))),
                })
            });
        Self::new(sink, source)
    }

    /// Two in-memory streams wired to each other.
    #[must_use]
    pub fn pair(capacity: usize) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel::<Bytes>(capacity);
        let (b_tx, b_rx) = mpsc::channel::<Bytes>(capacity);
        (
            Self::new(a_tx.sink_map_err(|_| TunnelError::Closed), b_rx.map(Ok)),
            Self::new(b_tx.sink_map_err(|_| TunnelError::Closed), a_rx.map(Ok)),
        )
    }
}

/// Opens the remote end of a session.
#[async_trait]
pub trait SessionDialer: Send + Sync {
    async fn dial(&self, request: &SessionRequest) -> Result<ByteStream, TunnelError>;
}

/// Dials session streams on the router, authenticated by the session cookie.
pub struct RouterDialer {
    base: Url,
}

impl RouterDialer {
    /// `base` is the router's agent-facing prefix, e.g. `wss://router/api/router/`.
    #[must_use]
    pub const fn new(base: Url) -> Self {
        Self { base }
    }

    /// URL of the backend stream for `request`.
    ///
    /// # Errors
    /// Returns error if the key cannot form a valid URL.
    pub fn session_url(&self, request: &SessionRequest) -> Result<Url, TunnelError> {
        self.base
            .join(&format!("{}/{}/backend", request.kind.route(), request.key))
            .map_err(|e| TunnelError::WebSocket(e.to_string()))
    }
}

#[async_trait]
impl SessionDialer for RouterDialer {
    async fn dial(&self, request: &SessionRequest) -> Result<ByteStream, TunnelError> {
        let mut ws_request = self.session_url(request)?.as_str().into_client_request()?;
        let cookie = HeaderValue::from_str(&request.cookie)
            .map_err(|e| TunnelError::WebSocket(e.to_string()))?;
        ws_request.headers_mut().insert("Cookie", cookie);

        let (ws, _response) = connect_async(ws_request).await?;
        Ok(ByteStream::from_websocket(ws))
    }
}

/// Connect to a WebSocket endpoint served inside the task.
///
/// # Errors
/// Returns error if the handshake fails.
pub async fn dial_local_websocket(port: u16, path: &str) -> Result<ByteStream, TunnelError> {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    let (ws, _response) = connect_async(format!("ws://127.0.0.1:{port}{path}")).await?;
    Ok(ByteStream::from_websocket(ws))
}
