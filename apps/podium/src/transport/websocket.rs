use super::{Conn, Connector, TransportError};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

/// Production connector: one WebSocket per connection attempt, JSON text
/// frames in both directions.
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Conn>, TransportError> {
        let (stream, response) =
            connect_async(url.as_str())
                .await
                .map_err(|err| TransportError::ConnectFailed {
                    url: url.to_string(),
                    reason: err.to_string(),
                })?;
        debug!(
            target: "podium::transport",
            %url,
            status = %response.status(),
            "websocket established"
        );
        Ok(Box::new(WebSocketConn { stream }))
    }
}

struct WebSocketConn {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Conn for WebSocketConn {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(frame))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Option<String> {
        while let Some(message) = self.stream.next().await {
            match message {
                Ok(Message::Text(text)) => return Some(text),
                Ok(Message::Close(_)) | Err(_) => return None,
                // Ping/pong are answered by tungstenite; binary frames are
                // not part of this protocol.
                Ok(_) => {}
            }
        }
        None
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
