use std::{
    collections::HashMap,
    io::{self, Write},
    net::{SocketAddr, UdpSocket},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use kcp::Kcp;
use tracing::{debug, error, info, warn};

use crate::{config::ServerConfig, transport::stream::Stream};

/// Smallest datagram that can carry a KCP segment header.
const KCP_MIN_SEGMENT: usize = 24;
/// Datagram receive buffer; larger than any sane MTU.
const RECV_BUF: usize = 64 * 1024;

/// KCP protocol knobs, lifted from the server configuration.
#[derive(Clone, Copy, Debug)]
pub(crate) struct KcpTuning {
    pub(crate) ack_no_delay: bool,
    pub(crate) stream_mode: bool,
    pub(crate) no_delay: i32,
    pub(crate) interval: i32,
    pub(crate) resend: i32,
    pub(crate) nc: i32,
    pub(crate) send_window: u16,
    pub(crate) recv_window: u16,
    pub(crate) mtu: usize,
}

impl KcpTuning {
    pub(crate) fn from_config(config: &ServerConfig) -> Self {
        Self {
            ack_no_delay: config.kcp_ack_no_delay,
            stream_mode: config.kcp_stream_mode,
            no_delay: config.kcp_no_delay,
            interval: config.kcp_interval.max(1),
            resend: config.kcp_resend,
            nc: config.kcp_nc,
            send_window: config.kcp_send_window,
            recv_window: config.kcp_recv_window,
            mtu: config.kcp_mtu,
        }
    }
}

/// KCP emits segments through this sink straight onto the UDP socket.
struct UdpOutput {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl Write for UdpOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.socket.send_to(buf, self.peer)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn kcp_err(err: kcp::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err.to_string())
}

struct Session {
    kcp: Arc<Mutex<Kcp<UdpOutput>>>,
    data_tx: Sender<Vec<u8>>,
    closed: Arc<AtomicBool>,
}

/// Session acceptor multiplexing KCP conversations over one UDP socket.
///
/// A driver thread demultiplexes inbound datagrams by peer address,
/// creates a session per new peer (conversation id taken from the first
/// segment), pumps application bytes out of the KCP state machines, and
/// ticks their retransmission clocks. Sessions end when the connection
/// shuts down or the state machine errors out.
pub(crate) struct KcpListener {
    accept_rx: Receiver<KcpConn>,
    run: Arc<AtomicBool>,
    driver: Option<JoinHandle<()>>,
}

impl KcpListener {
    pub(crate) fn bind(addr: SocketAddr, tuning: KcpTuning) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr)?);
        socket.set_read_timeout(Some(Duration::from_millis(tuning.interval as u64)))?;

        let (accept_tx, accept_rx) = unbounded();
        let run = Arc::new(AtomicBool::new(true));
        let driver = {
            let run = Arc::clone(&run);
            thread::Builder::new()
                .name("gantry-kcp-driver".into())
                .spawn(move || drive(&socket, tuning, &accept_tx, &run))?
        };

        info!(%addr, "kcp listener started");
        Ok(Self { accept_rx, run, driver: Some(driver) })
    }

    /// Waits up to `timeout` for a newly established session.
    pub(crate) fn accept_timeout(&self, timeout: Duration) -> Option<KcpConn> {
        match self.accept_rx.recv_timeout(timeout) {
            Ok(conn) => Some(conn),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    pub(crate) fn shutdown(mut self) {
        self.run.store(false, Ordering::Release);
        if let Some(driver) = self.driver.take() {
            let _ = driver.join();
        }
        debug!("kcp listener stopped");
    }
}

fn drive(
    socket: &Arc<UdpSocket>,
    tuning: KcpTuning,
    accept_tx: &Sender<KcpConn>,
    run: &Arc<AtomicBool>,
) {
    let epoch = Instant::now();
    let mut sessions: HashMap<SocketAddr, Session> = HashMap::new();
    let mut buf = vec![0u8; RECV_BUF];

    while run.load(Ordering::Acquire) {
        match socket.recv_from(&mut buf) {
            Ok((n, peer)) => {
                if n < KCP_MIN_SEGMENT {
                    debug!(%peer, n, "runt datagram ignored");
                    continue;
                }
                if !sessions.contains_key(&peer) {
                    match new_session(socket, peer, &buf[..n], tuning, epoch) {
                        Some((session, conn)) => {
                            if accept_tx.send(conn).is_err() {
                                // Listener gone; stop admitting peers.
                                continue;
                            }
                            sessions.insert(peer, session);
                        }
                        None => continue,
                    }
                }
                let session = sessions.get_mut(&peer).expect("session just ensured");
                if let Err(err) = feed_session(session, &buf[..n], tuning, epoch) {
                    warn!(%peer, %err, "kcp session dropped");
                    sessions.remove(&peer);
                }
            }
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut => {}
            Err(err) => {
                error!(%err, "kcp socket receive failed");
                thread::sleep(Duration::from_millis(tuning.interval as u64));
            }
        }

        let now = now_ms(epoch);
        sessions.retain(|peer, session| {
            if session.closed.load(Ordering::Acquire) {
                debug!(%peer, "kcp session closed");
                return false;
            }
            if let Err(err) = session.kcp.lock().unwrap().update(now) {
                warn!(%peer, %err, "kcp update failed");
                return false;
            }
            true
        });
    }
}

fn new_session(
    socket: &Arc<UdpSocket>,
    peer: SocketAddr,
    first_datagram: &[u8],
    tuning: KcpTuning,
    epoch: Instant,
) -> Option<(Session, KcpConn)> {
    // The conversation id sits in the first four bytes of every segment,
    // little-endian; the server side adopts the client's.
    let conv = u32::from_le_bytes(first_datagram[..4].try_into().ok()?);

    let output = UdpOutput { socket: Arc::clone(socket), peer };
    let mut kcp =
        if tuning.stream_mode { Kcp::new_stream(conv, output) } else { Kcp::new(conv, output) };
    kcp.set_nodelay(tuning.no_delay != 0, tuning.interval, tuning.resend, tuning.nc != 0);
    kcp.set_wndsize(tuning.send_window, tuning.recv_window);
    if let Err(err) = kcp.set_mtu(tuning.mtu) {
        warn!(%peer, mtu = tuning.mtu, %err, "kcp mtu rejected, keeping default");
    }

    let kcp = Arc::new(Mutex::new(kcp));
    let (data_tx, data_rx) = unbounded();
    let closed = Arc::new(AtomicBool::new(false));

    info!(%peer, conv, "kcp session accepted");
    let session =
        Session { kcp: Arc::clone(&kcp), data_tx, closed: Arc::clone(&closed) };
    let conn = KcpConn {
        kcp,
        data_rx,
        closed,
        pending: Vec::new(),
        read_timeout: Duration::from_millis(100),
        local: socket.local_addr().ok(),
        peer,
        epoch,
    };
    Some((session, conn))
}

/// Feeds one datagram into the session and pumps out any application
/// bytes that became available.
fn feed_session(
    session: &mut Session,
    datagram: &[u8],
    tuning: KcpTuning,
    epoch: Instant,
) -> io::Result<()> {
    let mut kcp = session.kcp.lock().unwrap();
    kcp.input(datagram).map_err(kcp_err)?;
    if tuning.ack_no_delay {
        // Push pending acks out now instead of on the next tick.
        kcp.update(now_ms(epoch)).map_err(kcp_err)?;
    }

    loop {
        let size = match kcp.peeksize() {
            Ok(size) if size > 0 => size,
            _ => return Ok(()),
        };
        let mut data = vec![0u8; size];
        match kcp.recv(&mut data) {
            Ok(n) => {
                data.truncate(n);
                if session.data_tx.send(data).is_err() {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "receiver gone"));
                }
            }
            Err(err) => return Err(kcp_err(err)),
        }
    }
}

fn now_ms(epoch: Instant) -> u32 {
    epoch.elapsed().as_millis() as u32
}

/// Connection endpoint of one KCP session, byte-stream flavored.
pub(crate) struct KcpConn {
    kcp: Arc<Mutex<Kcp<UdpOutput>>>,
    data_rx: Receiver<Vec<u8>>,
    closed: Arc<AtomicBool>,
    pending: Vec<u8>,
    read_timeout: Duration,
    local: Option<SocketAddr>,
    peer: SocketAddr,
    epoch: Instant,
}

impl Stream for KcpConn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.pending.is_empty() {
            let n = self.pending.len().min(buf.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            return Ok(n);
        }
        if self.closed.load(Ordering::Acquire) {
            return Ok(0);
        }

        match self.data_rx.recv_timeout(self.read_timeout) {
            Ok(data) => {
                self.pending = data;
                self.read(buf)
            }
            Err(RecvTimeoutError::Timeout) => {
                Err(io::Error::new(io::ErrorKind::WouldBlock, "kcp read timeout"))
            }
            Err(RecvTimeoutError::Disconnected) => Ok(0),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "kcp session closed"));
        }

        let mut kcp = self.kcp.lock().unwrap();
        kcp.send(buf).map_err(kcp_err)?;
        // Get the segments onto the wire without waiting for the driver
        // tick.
        kcp.update(now_ms(self.epoch)).map_err(kcp_err)?;
        kcp.flush().map_err(kcp_err)?;
        Ok(())
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.read_timeout = timeout.unwrap_or(Duration::from_secs(3600));
        Ok(())
    }

    fn shutdown(&mut self) {
        self.closed.store(true, Ordering::Release);
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }
}
