use std::{
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream},
    time::Duration,
};

use rustls::{ServerConnection, StreamOwned};

/// Byte-stream transport a [`Connection`](crate::Connection) runs over.
///
/// Implementations carry a read timeout so the reader thread can observe
/// cancellation between blocking reads.
pub trait Stream: Send {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;
    fn shutdown(&mut self);
    fn local_addr(&self) -> Option<SocketAddr>;
    fn peer_addr(&self) -> Option<SocketAddr>;
}

/// Plain socket-backed transports: TCP and TLS-over-TCP. The WebSocket
/// adapter wraps one of these.
pub trait RawStream: Read + Write + Send {
    fn raw_set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
    fn raw_shutdown(&self);
    fn raw_local_addr(&self) -> Option<SocketAddr>;
    fn raw_peer_addr(&self) -> Option<SocketAddr>;
}

impl RawStream for TcpStream {
    fn raw_set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)
    }

    fn raw_shutdown(&self) {
        let _ = self.shutdown(Shutdown::Both);
    }

    fn raw_local_addr(&self) -> Option<SocketAddr> {
        self.local_addr().ok()
    }

    fn raw_peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr().ok()
    }
}

impl RawStream for StreamOwned<ServerConnection, TcpStream> {
    fn raw_set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.sock.set_read_timeout(timeout)
    }

    fn raw_shutdown(&self) {
        let _ = self.sock.shutdown(Shutdown::Both);
    }

    fn raw_local_addr(&self) -> Option<SocketAddr> {
        self.sock.local_addr().ok()
    }

    fn raw_peer_addr(&self) -> Option<SocketAddr> {
        self.sock.peer_addr().ok()
    }
}

impl<T: RawStream> Stream for T {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        Write::write_all(self, buf)
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.raw_set_read_timeout(timeout)
    }

    fn shutdown(&mut self) {
        self.raw_shutdown();
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.raw_local_addr()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.raw_peer_addr()
    }
}
