//! WASM websocket transport, backed by `gloo-net`.

use futures::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use gloo_net::websocket::{Message as WsMessage, futures::WebSocket};

use super::{Closed, Frame};

/// The writable half of a connected socket.
pub(crate) struct SocketWriter(SplitSink<WebSocket, WsMessage>);

/// The readable half of a connected socket.
pub(crate) struct SocketReader(SplitStream<WebSocket>);

/// Connects to `url`, returning a split writer/reader pair.
pub(crate) async fn connect(url: &str) -> Result<(SocketWriter, SocketReader), String> {
    let socket = WebSocket::open(url).map_err(|err| err.to_string())?;
    let (sink, stream) = socket.split();
    Ok((SocketWriter(sink), SocketReader(stream)))
}

impl SocketWriter {
    pub(crate) async fn send_text(&mut self, text: String) -> Result<(), String> {
        self.0.send(WsMessage::Text(text)).await.map_err(|err| err.to_string())
    }

    pub(crate) async fn send_binary(&mut self, bytes: Vec<u8>) -> Result<(), String> {
        self.0.send(WsMessage::Bytes(bytes)).await.map_err(|err| err.to_string())
    }

    /// Best-effort close; errors are not actionable once we are giving up
    /// on the socket anyway.
    pub(crate) async fn close(&mut self) {
        let _ = self.0.close().await;
    }
}

impl SocketReader {
    /// Reads the next frame. Returns `Ok(None)` when the stream ends without
    /// an explicit close frame (the underlying connection simply dropped).
    pub(crate) async fn recv(&mut self) -> Option<Result<Frame, Closed>> {
        match self.0.next().await? {
            Ok(WsMessage::Text(text)) => Some(Ok(Frame::Text(text))),
            Ok(WsMessage::Bytes(bytes)) => Some(Ok(Frame::Binary(bytes))),
            Err(err) => Some(Err(Closed::Error(err.to_string()))),
        }
    }
}
