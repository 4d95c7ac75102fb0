//! Native websocket transport, backed by `tokio-tungstenite`.

use futures::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message as WsMessage};

use super::{Closed, Frame};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// The writable half of a connected socket.
pub(crate) struct SocketWriter(SplitSink<Socket, WsMessage>);

/// The readable half of a connected socket.
pub(crate) struct SocketReader(SplitStream<Socket>);

/// Connects to `url`, returning a split writer/reader pair.
pub(crate) async fn connect(url: &str) -> Result<(SocketWriter, SocketReader), String> {
    let (stream, _response) = tokio_tungstenite::connect_async(url).await.map_err(|err| err.to_string())?;
    let (sink, stream) = stream.split();
    Ok((SocketWriter(sink), SocketReader(stream)))
}

impl SocketWriter {
    pub(crate) async fn send_text(&mut self, text: String) -> Result<(), String> {
        self.0.send(WsMessage::Text(text.into())).await.map_err(|err| err.to_string())
    }

    pub(crate) async fn send_binary(&mut self, bytes: Vec<u8>) -> Result<(), String> {
        self.0.send(WsMessage::Binary(bytes.into())).await.map_err(|err| err.to_string())
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
            Ok(WsMessage::Text(text)) => Some(Ok(Frame::Text(text.to_string()))),
            Ok(WsMessage::Binary(bytes)) => Some(Ok(Frame::Binary(bytes.to_vec()))),
            Ok(WsMessage::Close(frame)) => Some(Err(Closed::ByPeer {
                code: frame.as_ref().map(|f| f.code.into()),
                reason: frame.map(|f| f.reason.to_string()).unwrap_or_default(),
            })),
            Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_)) => {
                // Handled transparently by tokio-tungstenite; surface nothing.
                Box::pin(self.recv()).await
            }
            Err(err) => Some(Err(Closed::Error(err.to_string()))),
        }
    }
}
