//! WebSocket transport (tokio-tungstenite)
//!
//! Both directions run without a message or frame size ceiling; OneBot
//! endpoints happily push multi-megabyte forwarded-message payloads.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::CONTENT_TYPE;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::WebSocketStream;

use super::{Connection, Connector, Inlet, Outlet, Received, TransportError};
use crate::protocol::Frame;

/// Response header carrying the bot identity on consumer handshakes
pub const SELF_ID_HEADER: &str = "x-self-id";

/// WebSocket settings with size limits lifted
pub fn unbounded_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = None;
    config.max_frame_size = None;
    config
}

/// Send half of a WebSocket
pub struct WsOutlet<S> {
    sink: Mutex<SplitSink<WebSocketStream<S>, Message>>,
}

#[async_trait]
impl<S> Outlet for WsOutlet<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.sink.lock().await.send(into_message(frame)).await?;
        Ok(())
    }

    async fn close(&self) {
        // Sends a close frame if the socket is still writable
        let _ = self.sink.lock().await.close().await;
    }
}

/// Receive half of a WebSocket
pub struct WsInlet<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S> Inlet for WsInlet<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn recv(&mut self) -> Received {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Received::Frame(Frame::Text(Bytes::from(text))),
                Some(Ok(Message::Binary(data))) => return Received::Frame(Frame::Binary(data)),
                // Pings are answered by tungstenite itself
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return Received::Closed(None),
                Some(Err(e)) => return Received::Closed(Some(e.into())),
            }
        }
    }
}

/// Split an established WebSocket into relay halves
pub fn split<S>(stream: WebSocketStream<S>, peer: String) -> Connection
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = stream.split();

    Connection {
        outlet: Arc::new(WsOutlet {
            sink: Mutex::new(sink),
        }),
        inlet: Box::new(WsInlet { stream }),
        peer,
    }
}

/// Perform the server side of the handshake for a consumer socket
///
/// The `101 Switching Protocols` response carries the current bot id in
/// `X-Self-ID`, which OneBot frameworks read to bind the connection.
pub async fn accept(
    socket: TcpStream,
    peer_addr: SocketAddr,
    bot_id: i64,
) -> Result<Connection, TransportError> {
    let tag_response = move |_request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        let headers = response.headers_mut();
        headers.insert(HeaderName::from_static(SELF_ID_HEADER), HeaderValue::from(bot_id));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(response)
    };

    let stream =
        tokio_tungstenite::accept_hdr_async_with_config(socket, tag_response, Some(unbounded_config()))
            .await?;

    Ok(split(stream, peer_addr.to_string()))
}

/// Dials the OneBot endpoint at a fixed `ws://` URL
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    /// Create a connector for the given URL
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Connection, TransportError> {
        let (stream, _response) =
            tokio_tungstenite::connect_async_with_config(self.url.as_str(), Some(unbounded_config()), true)
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;

        Ok(split(stream, self.url.clone()))
    }

    fn target(&self) -> String {
        self.url.clone()
    }
}

fn into_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(data) => match Utf8Bytes::try_from(data.clone()) {
            Ok(text) => Message::Text(text),
            Err(_) => Message::Binary(data),
        },
        Frame::Binary(data) => Message::Binary(data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbounded_config() {
        let config = unbounded_config();

        assert!(config.max_message_size.is_none());
        assert!(config.max_frame_size.is_none());
    }

    #[test]
    fn test_text_frame_becomes_text_message() {
        let message = into_message(Frame::text("{}"));
        assert!(matches!(message, Message::Text(ref t) if t.as_str() == "{}"));
    }

    #[test]
    fn test_invalid_utf8_text_falls_back_to_binary() {
        let message = into_message(Frame::Text(Bytes::from_static(&[0xff, 0xfe])));
        assert!(matches!(message, Message::Binary(_)));
    }

    #[test]
    fn test_closed_errors_map_to_closed() {
        let err: TransportError = tokio_tungstenite::tungstenite::Error::AlreadyClosed.into();
        assert!(matches!(err, TransportError::Closed));
    }
}
