use std::io;
use std::net::TcpStream;
use std::time::Duration;

use tracing::{debug, info};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

use crate::error::TransportError;

/// One inbound payload frame. Control frames never reach the session.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Binary(Vec<u8>),
    Text(String),
}

/// The socket seam of the session loop.
pub trait Transport {
    /// Wait up to `timeout` for the next payload frame. `Ok(None)` means the
    /// wait timed out; `Err(TransportError::Closed)` means the peer closed.
    fn recv(&mut self, timeout: Duration) -> Result<Option<Frame>, TransportError>;

    fn send(&mut self, payload: Vec<u8>) -> Result<(), TransportError>;

    fn close(&mut self);
}

pub struct WsTransport {
    socket: WebSocket<MaybeTlsStream<TcpStream>>,
    read_timeout: Option<Duration>,
}

impl WsTransport {
    pub fn connect(url: &str) -> Result<Self, TransportError> {
        let (socket, response) = tungstenite::connect(url)?;
        info!(url, status = %response.status(), "websocket connected");
        Ok(Self {
            socket,
            read_timeout: None,
        })
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        if self.read_timeout == Some(timeout) {
            return Ok(());
        }
        // A zero timeout means "block forever" to the OS.
        let timeout_arg = Some(timeout.max(Duration::from_millis(1)));
        match self.socket.get_mut() {
            MaybeTlsStream::Plain(stream) => stream.set_read_timeout(timeout_arg)?,
            _ => debug!("read timeout not supported on this stream"),
        }
        self.read_timeout = Some(timeout);
        Ok(())
    }
}

impl Transport for WsTransport {
    fn recv(&mut self, timeout: Duration) -> Result<Option<Frame>, TransportError> {
        self.set_read_timeout(timeout)?;

        match self.socket.read() {
            Ok(Message::Binary(payload)) => Ok(Some(Frame::Binary(payload.to_vec()))),
            Ok(Message::Text(text)) => Ok(Some(Frame::Text(text.as_str().to_owned()))),
            Ok(Message::Close(frame)) => {
                info!(?frame, "server closed the websocket");
                Err(TransportError::Closed)
            }
            // Pings are answered by tungstenite on the next read or flush.
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => Ok(None),
            Err(tungstenite::Error::Io(err))
                if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn send(&mut self, payload: Vec<u8>) -> Result<(), TransportError> {
        self.socket.send(Message::binary(payload))?;
        Ok(())
    }

    fn close(&mut self) {
        if let Err(err) = self.socket.close(None) {
            debug!(%err, "websocket close handshake failed");
        }
        // Drive the close handshake; errors here only mean the peer is gone.
        let _ = self.socket.flush();
    }
}
