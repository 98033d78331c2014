use std::{
    net::{SocketAddr, TcpListener},
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use gantry_codec::{PackKind, Packet, new_packet};
use rustls::{ServerConnection, StreamOwned};
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::{debug, error, info, warn};
use tungstenite::{
    handshake::server::{ErrorResponse, Response as WsUpgradeResponse},
    http::{HeaderValue, StatusCode},
};

use crate::{
    config::{ServerConfig, ServerMode},
    conn::{ConnContext, ConnHook, ConnManager, Connection},
    decoder::{Decoder, TlvDecoder},
    dispatch::MsgHandler,
    error::{RouterError, ServerError},
    heartbeat::{HeartBeatOption, HeartbeatChecker},
    interceptor::{Chain, IcResp, Interceptor},
    request::RouterHandler,
    router::{GroupRouter, Router},
    transport::{KcpListener, KcpTuning, RawStream, Stream, WsStream, build_server_config},
};

pub use tungstenite::handshake::server::Request as WsUpgradeRequest;

/// WebSocket upgrade gate: inspect the HTTP request, reject with an error
/// to answer 401.
pub type WebsocketAuth = Arc<dyn Fn(&WsUpgradeRequest) -> Result<(), String> + Send + Sync>;

/// How often idle accept loops observe the exit flag.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Backoff applied on listener errors and max-conn saturation, reset on a
/// successful accept.
#[derive(Default)]
struct AcceptDelay {
    current: Duration,
}

impl AcceptDelay {
    const INITIAL: Duration = Duration::from_millis(5);
    const MAX: Duration = Duration::from_secs(1);

    fn delay(&mut self) {
        self.current =
            if self.current.is_zero() { Self::INITIAL } else { (self.current * 2).min(Self::MAX) };
        thread::sleep(self.current);
    }

    fn reset(&mut self) {
        self.current = Duration::ZERO;
    }
}

/// Adapter installing a pluggable [`Decoder`] as the chain head.
struct HeadDecoder(Arc<dyn Decoder>);

impl Interceptor for HeadDecoder {
    fn intercept(&self, chain: Chain<'_>, request: crate::request::Request) -> IcResp {
        self.0.intercept(chain, request)
    }
}

/// The server: binds the configured listeners, accepts connections and
/// wires them to the message handler, connection manager, codec, frame
/// decoder and heartbeat template.
///
/// ```no_run
/// use std::sync::Arc;
/// use gantry::{Request, Router, Server, ServerConfig};
///
/// struct Echo;
///
/// impl Router for Echo {
///     fn handle(&self, req: &mut Request) {
///         let data = req.data().to_vec();
///         if let Some(conn) = req.connection() {
///             let _ = conn.send_msg(req.msg_id(), &data);
///         }
///     }
/// }
///
/// let server = Server::new(ServerConfig::default());
/// server.add_router(1, Arc::new(Echo)).unwrap();
/// server.serve().unwrap();
/// ```
pub struct Server {
    config: Arc<ServerConfig>,
    handler: Arc<MsgHandler>,
    conn_mgr: Arc<ConnManager>,
    packet: Mutex<Arc<dyn Packet>>,
    decoder: Mutex<Option<Arc<dyn Decoder>>>,
    heartbeat: Mutex<Option<Arc<HeartbeatChecker>>>,
    on_conn_start: Mutex<Option<ConnHook>>,
    on_conn_stop: Mutex<Option<ConnHook>>,
    ws_auth: Mutex<Option<WebsocketAuth>>,

    next_conn_id: AtomicU64,
    started: AtomicBool,
    exit: AtomicBool,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let handler = MsgHandler::new(&config);
        let packet = new_packet(PackKind::default(), config.max_packet_size);

        Arc::new(Self {
            config: Arc::new(config),
            handler,
            conn_mgr: ConnManager::new(),
            packet: Mutex::new(packet),
            decoder: Mutex::new(Some(Arc::new(TlvDecoder))),
            heartbeat: Mutex::new(None),
            on_conn_start: Mutex::new(None),
            on_conn_stop: Mutex::new(None),
            ws_auth: Mutex::new(None),
            next_conn_id: AtomicU64::new(0),
            started: AtomicBool::new(false),
            exit: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn conn_mgr(&self) -> &Arc<ConnManager> {
        &self.conn_mgr
    }

    pub fn msg_handler(&self) -> &Arc<MsgHandler> {
        &self.handler
    }

    /// Swaps the packet codec. Connections capture the codec at accept
    /// time, so call this before `start`.
    pub fn set_packet(&self, packet: Arc<dyn Packet>) {
        *self.packet.lock().unwrap() = packet;
    }

    /// Swaps the inbound decoder (chain head + frame geometry); `None`
    /// disables framing and dispatches raw read chunks.
    pub fn set_decoder(&self, decoder: Option<Arc<dyn Decoder>>) {
        *self.decoder.lock().unwrap() = decoder;
    }

    pub fn add_interceptor(&self, interceptor: Arc<dyn Interceptor>) {
        self.handler.add_interceptor(interceptor);
    }

    pub fn set_on_conn_start(&self, hook: ConnHook) {
        *self.on_conn_start.lock().unwrap() = Some(hook);
    }

    pub fn set_on_conn_stop(&self, hook: ConnHook) {
        *self.on_conn_stop.lock().unwrap() = Some(hook);
    }

    pub fn set_websocket_auth(&self, auth: WebsocketAuth) {
        *self.ws_auth.lock().unwrap() = Some(auth);
    }

    /// Registers a legacy router. Errors when the server runs the slices
    /// model.
    pub fn add_router(&self, msg_id: u32, router: Arc<dyn Router>) -> Result<(), RouterError> {
        if self.config.router_slices_mode {
            return Err(RouterError::SlicesMode);
        }
        self.handler.add_router(msg_id, router)
    }

    /// Registers a handler chain. Errors when the server runs the legacy
    /// model.
    pub fn add_router_slices(
        &self,
        msg_id: u32,
        handlers: impl IntoIterator<Item = RouterHandler>,
    ) -> Result<(), RouterError> {
        self.require_slices_mode()?;
        self.handler.router_slices().add_handler(msg_id, handlers)
    }

    /// Opens a msg-id group on the slices registry.
    pub fn group(
        &self,
        start: u32,
        end: u32,
        handlers: impl IntoIterator<Item = RouterHandler>,
    ) -> Result<GroupRouter, RouterError> {
        self.require_slices_mode()?;
        Ok(self.handler.router_slices().group(start, end, handlers))
    }

    /// Appends global middleware on the slices registry.
    pub fn use_middleware(
        &self,
        handlers: impl IntoIterator<Item = RouterHandler>,
    ) -> Result<(), RouterError> {
        self.require_slices_mode()?;
        self.handler.router_slices().use_middleware(handlers);
        Ok(())
    }

    fn require_slices_mode(&self) -> Result<(), RouterError> {
        if self.config.router_slices_mode { Ok(()) } else { Err(RouterError::NotSlicesMode) }
    }

    /// Installs heartbeat probing with the default message and not-alive
    /// action; the checker template is cloned per accepted connection.
    pub fn start_heartbeat(&self, interval: Duration) -> Result<(), RouterError> {
        self.install_heartbeat(HeartbeatChecker::new(interval))
    }

    pub fn start_heartbeat_with_option(
        &self,
        interval: Duration,
        option: HeartBeatOption,
    ) -> Result<(), RouterError> {
        self.install_heartbeat(HeartbeatChecker::with_option(interval, option))
    }

    fn install_heartbeat(&self, checker: Arc<HeartbeatChecker>) -> Result<(), RouterError> {
        if self.config.router_slices_mode {
            self.handler.router_slices().add_handler(checker.msg_id(), checker.handlers())?;
        } else if let Some(router) = checker.router() {
            self.handler.add_router(checker.msg_id(), router)?;
        }
        *self.heartbeat.lock().unwrap() = Some(checker);
        Ok(())
    }

    pub fn heartbeat(&self) -> Option<Arc<HeartbeatChecker>> {
        self.heartbeat.lock().unwrap().clone()
    }

    /// Starts the worker pool and the listener(s) selected by the config
    /// mode. Non-blocking; pair with [`stop`](Self::stop) or use
    /// [`serve`](Self::serve).
    pub fn start(self: &Arc<Self>) -> Result<(), ServerError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(name = %self.config.name, mode = ?self.config.mode, "server starting");

        let decoder = self.decoder.lock().unwrap().clone();
        if let Some(decoder) = decoder {
            self.handler.set_head_interceptor(Arc::new(HeadDecoder(decoder)));
        }

        self.handler.start_worker_pool();

        match self.config.mode {
            ServerMode::Tcp => self.listen_tcp()?,
            ServerMode::Websocket => self.listen_websocket()?,
            ServerMode::Kcp => self.listen_kcp()?,
            ServerMode::TcpAndWebsocket => {
                self.listen_tcp()?;
                self.listen_websocket()?;
            }
        }
        Ok(())
    }

    /// Stops every connection, the listeners and the worker pool.
    pub fn stop(&self) {
        info!(name = %self.config.name, "server stopping");
        self.conn_mgr.clear();
        self.exit.store(true, Ordering::Release);
        let handles = std::mem::take(&mut *self.listeners.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
        self.handler.stop_worker_pool();
    }

    /// `start`, then block until SIGINT or SIGTERM, then `stop`.
    pub fn serve(self: &Arc<Self>) -> Result<(), ServerError> {
        self.start()?;

        let term = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(SIGINT, Arc::clone(&term))?;
        signal_hook::flag::register(SIGTERM, Arc::clone(&term))?;

        while !term.load(Ordering::Acquire) && !self.exit.load(Ordering::Acquire) {
            thread::sleep(ACCEPT_POLL);
        }
        info!("shutdown signal received");
        self.stop();
        Ok(())
    }

    fn bind_addr(&self, port: u16) -> Result<SocketAddr, ServerError> {
        Ok(format!("{}:{}", self.config.host, port).parse()?)
    }

    fn tls_config(&self) -> Result<Option<Arc<rustls::ServerConfig>>, ServerError> {
        if !self.config.tls_enabled() {
            return Ok(None);
        }
        build_server_config(
            Path::new(&self.config.cert_file),
            Path::new(&self.config.private_key_file),
        )
        .map(Some)
    }

    fn listen_tcp(self: &Arc<Self>) -> Result<(), ServerError> {
        let addr = self.bind_addr(self.config.tcp_port)?;
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let tls = self.tls_config()?;
        info!(%addr, tls = tls.is_some(), "tcp listener started");

        let server = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("gantry-tcp-accept".into())
            .spawn(move || server.tcp_accept_loop(&listener, tls.as_ref()))
            .expect("spawn tcp accept thread");
        self.listeners.lock().unwrap().push(handle);
        Ok(())
    }

    fn tcp_accept_loop(
        self: &Arc<Self>,
        listener: &TcpListener,
        tls: Option<&Arc<rustls::ServerConfig>>,
    ) {
        let mut delay = AcceptDelay::default();
        while !self.exit.load(Ordering::Acquire) {
            if self.at_capacity(&mut delay) {
                continue;
            }
            match listener.accept() {
                Ok((stream, peer)) => {
                    delay.reset();
                    if let Err(err) = stream.set_nonblocking(false) {
                        error!(%peer, %err, "couldn't restore blocking mode");
                        continue;
                    }
                    info!(%peer, "client connected");
                    match tls {
                        Some(config) => match ServerConnection::new(Arc::clone(config)) {
                            Ok(session) => {
                                self.start_conn(Box::new(StreamOwned::new(session, stream)));
                            }
                            Err(err) => error!(%peer, %err, "tls session init failed"),
                        },
                        None => self.start_conn(Box::new(stream)),
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(err) => {
                    error!(%err, "accept failed");
                    delay.delay();
                }
            }
        }
        debug!("tcp accept loop exit");
    }

    fn listen_websocket(self: &Arc<Self>) -> Result<(), ServerError> {
        let addr = self.bind_addr(self.config.ws_port)?;
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let tls = self.tls_config()?;
        info!(%addr, tls = tls.is_some(), "websocket listener started");

        let server = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("gantry-ws-accept".into())
            .spawn(move || server.ws_accept_loop(&listener, tls.as_ref()))
            .expect("spawn websocket accept thread");
        self.listeners.lock().unwrap().push(handle);
        Ok(())
    }

    fn ws_accept_loop(
        self: &Arc<Self>,
        listener: &TcpListener,
        tls: Option<&Arc<rustls::ServerConfig>>,
    ) {
        let mut delay = AcceptDelay::default();
        while !self.exit.load(Ordering::Acquire) {
            if self.at_capacity(&mut delay) {
                continue;
            }
            match listener.accept() {
                Ok((stream, peer)) => {
                    delay.reset();
                    if let Err(err) = stream.set_nonblocking(false) {
                        error!(%peer, %err, "couldn't restore blocking mode");
                        continue;
                    }
                    debug!(%peer, "websocket client connected");

                    // The HTTP upgrade happens off the accept thread so a
                    // stalled handshake can't block further accepts.
                    let server = Arc::clone(self);
                    let tls = tls.cloned();
                    thread::spawn(move || match tls {
                        Some(config) => match ServerConnection::new(config) {
                            Ok(session) => {
                                server.ws_upgrade(StreamOwned::new(session, stream));
                            }
                            Err(err) => error!(%peer, %err, "tls session init failed"),
                        },
                        None => server.ws_upgrade(stream),
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(err) => {
                    error!(%err, "websocket accept failed");
                    delay.delay();
                }
            }
        }
        debug!("websocket accept loop exit");
    }

    fn ws_upgrade<S: RawStream + 'static>(self: &Arc<Self>, raw: S) {
        let auth = self.ws_auth.lock().unwrap().clone();
        let callback = |request: &WsUpgradeRequest,
                        mut response: WsUpgradeResponse|
         -> Result<WsUpgradeResponse, ErrorResponse> {
            if let Some(auth) = &auth {
                if let Err(reason) = auth(request) {
                    warn!(%reason, "websocket auth rejected");
                    let mut denied = ErrorResponse::new(Some(reason));
                    *denied.status_mut() = StatusCode::UNAUTHORIZED;
                    return Err(denied);
                }
            }
            // Accept the first subprotocol the client offers.
            if let Some(protocols) = request.headers().get("Sec-WebSocket-Protocol") {
                if let Ok(protocols) = protocols.to_str() {
                    let first = protocols.split(',').map(str::trim).find(|p| !p.is_empty());
                    if let Some(value) = first.and_then(|p| HeaderValue::from_str(p).ok()) {
                        response.headers_mut().insert("Sec-WebSocket-Protocol", value);
                    }
                }
            }
            Ok(response)
        };

        match tungstenite::accept_hdr(raw, callback) {
            Ok(ws) => self.start_conn(Box::new(WsStream::new(ws))),
            Err(err) => warn!(%err, "websocket upgrade failed"),
        }
    }

    fn listen_kcp(self: &Arc<Self>) -> Result<(), ServerError> {
        let addr = self.bind_addr(self.config.kcp_port)?;
        let listener = KcpListener::bind(addr, KcpTuning::from_config(&self.config))?;

        let server = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("gantry-kcp-accept".into())
            .spawn(move || {
                let mut delay = AcceptDelay::default();
                while !server.exit.load(Ordering::Acquire) {
                    if server.at_capacity(&mut delay) {
                        continue;
                    }
                    if let Some(conn) = listener.accept_timeout(ACCEPT_POLL) {
                        delay.reset();
                        server.start_conn(Box::new(conn));
                    }
                }
                listener.shutdown();
                debug!("kcp accept loop exit");
            })
            .expect("spawn kcp accept thread");
        self.listeners.lock().unwrap().push(handle);
        Ok(())
    }

    fn at_capacity(&self, delay: &mut AcceptDelay) -> bool {
        if self.conn_mgr.len() >= self.config.max_conn {
            warn!(max_conn = self.config.max_conn, "connection limit reached, delaying accept");
            delay.delay();
            return true;
        }
        false
    }

    fn conn_context(&self) -> ConnContext {
        ConnContext {
            config: Arc::clone(&self.config),
            handler: Arc::clone(&self.handler),
            packet: Arc::clone(&self.packet.lock().unwrap()),
            length_field: self.decoder.lock().unwrap().as_ref().and_then(|d| d.length_field()),
            manager: Arc::downgrade(&self.conn_mgr),
            on_conn_start: self.on_conn_start.lock().unwrap().clone(),
            on_conn_stop: self.on_conn_stop.lock().unwrap().clone(),
            name: self.config.name.clone(),
        }
    }

    /// Wires an accepted stream into a connection and runs it on its own
    /// thread.
    fn start_conn(self: &Arc<Self>, stream: Box<dyn Stream>) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        let conn = Connection::new(&self.conn_context(), stream, conn_id);
        self.conn_mgr.add(&conn);

        if let Some(template) = self.heartbeat.lock().unwrap().clone() {
            template.clone_template().bind_conn(&conn);
        }

        thread::Builder::new()
            .name(format!("gantry-conn-{conn_id}"))
            .spawn(move || conn.start())
            .expect("spawn connection thread");
    }
}
