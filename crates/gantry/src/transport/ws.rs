use std::{io, net::SocketAddr, time::Duration};

use bytes::{Buf, Bytes};
use tungstenite::{Error as WsError, Message as WsMessage, WebSocket};

use crate::transport::stream::{RawStream, Stream};

/// Adapts a server-side WebSocket into the byte-stream [`Stream`]
/// interface.
///
/// Binary (and text) message payloads are served through `read` in
/// buffer-sized pieces; control frames are handled inside the loop and a
/// Close frame reads as EOF. Outbound writes become one binary message
/// per call, which preserves message boundaries for peers that frame at
/// the WebSocket layer.
pub(crate) struct WsStream<S: RawStream> {
    ws: WebSocket<S>,
    pending: Bytes,
}

impl<S: RawStream> WsStream<S> {
    pub(crate) fn new(ws: WebSocket<S>) -> Self {
        Self { ws, pending: Bytes::new() }
    }
}

impl<S: RawStream> Stream for WsStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if !self.pending.is_empty() {
                let n = self.pending.len().min(buf.len());
                buf[..n].copy_from_slice(&self.pending[..n]);
                self.pending.advance(n);
                return Ok(n);
            }

            match self.ws.read() {
                Ok(WsMessage::Binary(payload)) => self.pending = payload,
                Ok(WsMessage::Text(payload)) => {
                    self.pending = Bytes::copy_from_slice(payload.as_bytes());
                }
                // tungstenite queues the pong reply itself.
                Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_)) => {}
                Ok(WsMessage::Close(_)) => return Ok(0),
                Err(WsError::Io(err)) => return Err(err),
                Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => return Ok(0),
                Err(err) => return Err(io::Error::new(io::ErrorKind::InvalidData, err)),
            }
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.ws
            .send(WsMessage::Binary(Bytes::copy_from_slice(buf)))
            .map_err(|err| match err {
                WsError::Io(err) => err,
                WsError::ConnectionClosed | WsError::AlreadyClosed => {
                    io::Error::new(io::ErrorKind::BrokenPipe, err)
                }
                other => io::Error::new(io::ErrorKind::InvalidData, other),
            })
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.ws.get_ref().raw_set_read_timeout(timeout)
    }

    fn shutdown(&mut self) {
        let _ = self.ws.close(None);
        let _ = self.ws.flush();
        self.ws.get_ref().raw_shutdown();
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.ws.get_ref().raw_local_addr()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.ws.get_ref().raw_peer_addr()
    }
}
