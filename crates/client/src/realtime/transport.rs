// Channel transport: the seam between the connection manager and the
// network. Production uses tokio-tungstenite; tests script their own.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsFrame;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};
use url::Url;

/// Opens one logical channel to the push endpoint.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self, endpoint: &Url) -> Result<Box<dyn FrameStream>>;
}

/// An open channel delivering inbound text frames.
#[async_trait]
pub trait FrameStream: Send {
    /// Next inbound text frame. `None` once the peer has closed the channel.
    async fn recv(&mut self) -> Option<Result<String>>;

    /// Close with a normal-closure status. Used only for explicit teardown.
    async fn close(&mut self);
}

/// WebSocket transport over tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, endpoint: &Url) -> Result<Box<dyn FrameStream>> {
        let (socket, response) = connect_async(endpoint.as_str())
            .await
            .with_context(|| format!("failed to open websocket to `{}`", redact(endpoint)))?;
        debug!(status = %response.status(), "websocket handshake complete");
        Ok(Box::new(WsFrameStream { socket }))
    }
}

struct WsFrameStream {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl FrameStream for WsFrameStream {
    async fn recv(&mut self) -> Option<Result<String>> {
        loop {
            let frame = match self.socket.next().await? {
                Ok(frame) => frame,
                Err(error) => {
                    return Some(Err(anyhow::Error::new(error).context("websocket read failed")))
                }
            };
            match frame {
                WsFrame::Text(text) => return Some(Ok(text.to_string())),
                WsFrame::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => trace!(len = bytes.len(), "dropping non-utf8 binary frame"),
                },
                WsFrame::Close(frame) => {
                    debug!(?frame, "websocket closed by peer");
                    return None;
                }
                WsFrame::Ping(_) | WsFrame::Pong(_) | WsFrame::Frame(_) => {}
            }
        }
    }

    async fn close(&mut self) {
        let frame = CloseFrame { code: CloseCode::Normal, reason: "client teardown".into() };
        if let Err(error) = self.socket.close(Some(frame)).await {
            debug!(?error, "websocket close handshake failed");
        }
    }
}

/// Endpoint with the bearer token query parameter masked, for logs.
pub fn redact(endpoint: &Url) -> String {
    let mut masked = endpoint.clone();
    let pairs: Vec<(String, String)> = endpoint
        .query_pairs()
        .map(|(key, value)| {
            let value = if key == "token" { "***".to_string() } else { value.into_owned() };
            (key.into_owned(), value)
        })
        .collect();
    if pairs.is_empty() {
        return masked.to_string();
    }
    masked.query_pairs_mut().clear().extend_pairs(pairs);
    masked.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_masks_token_only() {
        let url = Url::parse("wss://feed.test/ws/notifications/?token=secret&v=2").unwrap();
        let redacted = redact(&url);
        assert!(!redacted.contains("secret"));
        assert!(redacted.contains("token=***") || redacted.contains("token=%2A%2A%2A"));
        assert!(redacted.contains("v=2"));
    }

    #[test]
    fn redact_leaves_plain_urls_untouched() {
        let url = Url::parse("ws://localhost:8000/ws/notifications/").unwrap();
        assert_eq!(redact(&url), "ws://localhost:8000/ws/notifications/");
    }
}
