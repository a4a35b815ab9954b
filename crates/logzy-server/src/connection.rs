//! Client transport seam.
//!
//! The dispatcher talks to a split connection: a [`ConnectionReader`] owned
//! by the read loop and a [`ConnectionWriter`] owned by the relay. The axum
//! WebSocket implementations live here; tests substitute in-process channels.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tracing::debug;

use crate::errors::ConnectionError;

/// An inbound frame, reduced to what the dispatcher cares about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// A text message (binary frames holding UTF-8 are folded in here).
    Text(String),
    /// Liveness traffic: ping or pong.
    Keepalive,
}

/// Receiving half of a client connection.
#[async_trait]
pub trait ConnectionReader: Send {
    /// Next inbound frame. `None` once the peer has closed.
    async fn receive(&mut self) -> Option<Result<Frame, ConnectionError>>;
}

/// Sending half of a client connection.
#[async_trait]
pub trait ConnectionWriter: Send {
    /// Write one text frame.
    async fn send_text(&mut self, text: String) -> Result<(), ConnectionError>;

    /// Write a liveness probe.
    async fn ping(&mut self) -> Result<(), ConnectionError>;

    /// Close the connection. Errors are ignored; the peer may already be gone.
    async fn close(&mut self);
}

/// Read half of an axum WebSocket.
pub struct WsReader {
    stream: SplitStream<WebSocket>,
}

/// Write half of an axum WebSocket.
pub struct WsWriter {
    sink: SplitSink<WebSocket, Message>,
}

/// Split an upgraded socket into dispatcher halves.
pub fn split_websocket(socket: WebSocket) -> (WsReader, WsWriter) {
    let (sink, stream) = socket.split();
    (WsReader { stream }, WsWriter { sink })
}

#[async_trait]
impl ConnectionReader for WsReader {
    async fn receive(&mut self) -> Option<Result<Frame, ConnectionError>> {
        loop {
            let msg = match self.stream.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(ConnectionError::Transport(e.to_string()))),
            };
            match msg {
                Message::Text(text) => return Some(Ok(Frame::Text(text.to_string()))),
                Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => return Some(Ok(Frame::Text(text))),
                    Err(_) => debug!(len = data.len(), "ignoring non-UTF8 binary frame"),
                },
                Message::Ping(_) | Message::Pong(_) => return Some(Ok(Frame::Keepalive)),
                Message::Close(_) => return None,
            }
        }
    }
}

#[async_trait]
impl ConnectionWriter for WsWriter {
    async fn send_text(&mut self, text: String) -> Result<(), ConnectionError> {
        self.sink
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))
    }

    async fn ping(&mut self) -> Result<(), ConnectionError> {
        self.sink
            .send(Message::Ping(Vec::new().into()))
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.sink.close().await;
    }
}
