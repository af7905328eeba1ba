//! WebSocket link to the remote service.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Message, client::IntoClientRequest, http::HeaderValue},
};
use url::Url;

use crate::{ChannelError, ControlMessage, Dialer, Frame, Link};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dials the service's agent endpoint with a bearer token.
pub struct WebSocketDialer {
    url: Url,
}

impl WebSocketDialer {
    #[must_use]
    pub const fn new(url: Url) -> Self {
        Self { url }
    }
}

#[async_trait]
impl Dialer for WebSocketDialer {
    async fn dial(&self, token: &str) -> Result<Box<dyn Link>, ChannelError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ChannelError::Dial(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| ChannelError::InvalidCredential(e.to_string()))?;
        request.headers_mut().insert("Authorization", bearer);

        let (ws, _response) = connect_async(request)
            .await
            .map_err(|e| ChannelError::Dial(e.to_string()))?;
        Ok(Box::new(WebSocketLink { ws }))
    }
}

/// Link over an established WebSocket.
pub struct WebSocketLink {
    ws: WsStream,
}

#[async_trait]
impl Link for WebSocketLink {
    async fn send(&mut self, msg: &ControlMessage) -> Result<(), ChannelError> {
        let json = serde_json::to_string(msg)?;
        self.ws
            .send(Message::Text(json))
            .await
            .map_err(|e| ChannelError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<Frame>, ChannelError> {
        loop {
            let text = match self.ws.next().await {
                None | Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Err(e)) => return Err(ChannelError::Recv(e.to_string())),
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => text,
                    Err(_) => continue,
                },
                Some(Ok(Message::Pong(_) | Message::Ping(_))) => return Ok(Some(Frame::Pong)),
                Some(Ok(_)) => continue,
            };

            match serde_json::from_str::<ControlMessage>(&text) {
                Ok(msg) => return Ok(Some(Frame::Message(msg))),
                Err(e) => tracing::warn!("Ignoring unrecognised control message: {e}"),
            }
        }
    }

    async fn probe(&mut self) -> Result<(), ChannelError> {
        self.ws
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| ChannelError::Send(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(e) = self.ws.close(None).await {
            tracing::debug!("Control socket close failed: {e}");
        }
    }
}
