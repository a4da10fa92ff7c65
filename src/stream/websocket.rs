//! WebSocket transport over `tokio-tungstenite`

use super::transport::{Connection, Frame, Transport};
use crate::USER_AGENT;
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: String,
    bearer_token: Option<String>,
}

impl WebSocketTransport {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            bearer_token: None,
        }
    }

    /// Sends `Authorization: Bearer <token>` with the handshake
    #[must_use]
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let mut request = self.url.as_str().into_client_request()?;

        let headers = request.headers_mut();
        headers.insert("User-Agent", HeaderValue::from_static(USER_AGENT));
        if let Some(token) = &self.bearer_token {
            // Do not log the token
            match HeaderValue::from_str(&format!("Bearer {token}")) {
                Ok(value) => {
                    headers.insert("Authorization", value);
                }
                Err(_) => warn!("Bearer token is not a valid header value, connecting without it"),
            }
        }

        debug!("Connecting to {}", self.url);
        let (stream, response) = connect_async(request).await?;
        info!("✅ WebSocket connected (status: {})", response.status());

        Ok(Box::new(WebSocketConnection { stream }))
    }
}

/// The server sends `{}` as its heartbeat
fn text_frame(text: String) -> Frame {
    if text.trim() == "{}" {
        Frame::KeepAlive
    } else {
        Frame::Data(Bytes::from(text))
    }
}

struct WebSocketConnection {
    stream: WsStream,
}

#[async_trait]
impl Connection for WebSocketConnection {
    async fn send(&mut self, payload: Bytes) -> Result<()> {
        let message = match String::from_utf8(payload.to_vec()) {
            Ok(text) => Message::Text(text),
            Err(e) => Message::Binary(e.into_bytes()),
        };
        self.stream.send(message).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<Frame>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(e.into())),
            };

            let frame = match message {
                Message::Text(text) => text_frame(text),
                Message::Binary(data) => Frame::Data(Bytes::from(data)),
                Message::Ping(_) | Message::Pong(_) => Frame::KeepAlive,
                Message::Close(reason) => {
                    debug!("Close frame received: {:?}", reason);
                    return None;
                }
                // Raw frames are never yielded while reading
                Message::Frame(_) => continue,
            };
            return Some(Ok(frame));
        }
    }

    async fn ping(&mut self) -> Result<()> {
        self.stream.send(Message::Ping(Vec::new())).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.stream.close(None).await?;
        Ok(())
    }
}
