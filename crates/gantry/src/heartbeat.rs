use std::{
    sync::{Arc, Mutex, Weak},
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{Sender, bounded, select, tick};
use tracing::{debug, error, info};

use crate::{
    conn::Connection,
    error::SendError,
    request::{Request, RouterHandler},
    router::Router,
};

/// Reserved msg id for the built-in heartbeat probe.
pub const HEARTBEAT_DEFAULT_MSG_ID: u32 = 99_999;

/// Builds the heartbeat payload for a connection.
pub type HeartbeatMsgFn = Arc<dyn Fn(&Arc<Connection>) -> Vec<u8> + Send + Sync>;
/// Runs when a connection missed its liveness window.
pub type OnRemoteNotAlive = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;
/// Replaces the default probe entirely.
pub type HeartbeatFn = Arc<dyn Fn(&Arc<Connection>) -> Result<(), SendError> + Send + Sync>;

/// Customization hooks for [`Server::start_heartbeat_with_option`].
///
/// [`Server::start_heartbeat_with_option`]: crate::Server::start_heartbeat_with_option
#[derive(Default)]
pub struct HeartBeatOption {
    pub make_msg: Option<HeartbeatMsgFn>,
    pub on_remote_not_alive: Option<OnRemoteNotAlive>,
    pub beat: Option<HeartbeatFn>,
    /// Custom heartbeat msg id; `None` keeps the reserved default.
    pub msg_id: Option<u32>,
    /// Router for inbound heartbeats (legacy model).
    pub router: Option<Arc<dyn Router>>,
    /// Handlers for inbound heartbeats (slices model).
    pub handlers: Vec<RouterHandler>,
}

/// Per-connection liveness monitor.
///
/// The server holds an unbound template; every accepted connection gets a
/// clone with a fresh quit channel. Each tick the checker either runs the
/// not-alive action (default: stop the connection) or sends a probe.
pub struct HeartbeatChecker {
    interval: Duration,
    make_msg: HeartbeatMsgFn,
    on_remote_not_alive: OnRemoteNotAlive,
    beat: Option<HeartbeatFn>,
    msg_id: u32,
    router: Option<Arc<dyn Router>>,
    handlers: Vec<RouterHandler>,

    conn: Mutex<Option<Weak<Connection>>>,
    quit: Mutex<Option<Sender<()>>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

/// Default router: log the probe, nothing else.
struct HeartBeatDefaultRouter;

impl Router for HeartBeatDefaultRouter {
    fn handle(&self, req: &mut Request) {
        log_heartbeat(req);
    }
}

fn log_heartbeat(req: &mut Request) {
    let remote = req.connection().map(|c| c.remote_addr().to_owned()).unwrap_or_default();
    debug!(%remote, msg_id = req.msg_id(), "heartbeat received");
}

fn default_msg(conn: &Arc<Connection>) -> Vec<u8> {
    format!("heartbeat [{}->{}]", conn.local_addr(), conn.remote_addr()).into_bytes()
}

fn default_not_alive(conn: &Arc<Connection>) {
    info!(remote = %conn.remote_addr(), "remote not alive, stopping connection");
    conn.stop();
}

impl HeartbeatChecker {
    pub fn new(interval: Duration) -> Arc<Self> {
        Self::with_option(interval, HeartBeatOption::default())
    }

    pub fn with_option(interval: Duration, option: HeartBeatOption) -> Arc<Self> {
        Arc::new(Self {
            interval,
            make_msg: option.make_msg.unwrap_or_else(|| Arc::new(default_msg)),
            on_remote_not_alive: option
                .on_remote_not_alive
                .unwrap_or_else(|| Arc::new(default_not_alive)),
            beat: option.beat,
            msg_id: option.msg_id.unwrap_or(HEARTBEAT_DEFAULT_MSG_ID),
            router: Some(option.router.unwrap_or_else(|| Arc::new(HeartBeatDefaultRouter))),
            handlers: if option.handlers.is_empty() {
                vec![Arc::new(log_heartbeat) as RouterHandler]
            } else {
                option.handlers
            },
            conn: Mutex::new(None),
            quit: Mutex::new(None),
            ticker: Mutex::new(None),
        })
    }

    /// Fresh checker with this one's configuration, no bound connection
    /// and its own quit channel.
    pub fn clone_template(&self) -> Arc<Self> {
        Arc::new(Self {
            interval: self.interval,
            make_msg: Arc::clone(&self.make_msg),
            on_remote_not_alive: Arc::clone(&self.on_remote_not_alive),
            beat: self.beat.clone(),
            msg_id: self.msg_id,
            router: self.router.clone(),
            handlers: self.handlers.clone(),
            conn: Mutex::new(None),
            quit: Mutex::new(None),
            ticker: Mutex::new(None),
        })
    }

    pub fn msg_id(&self) -> u32 {
        self.msg_id
    }

    pub(crate) fn router(&self) -> Option<Arc<dyn Router>> {
        self.router.clone()
    }

    pub(crate) fn handlers(&self) -> Vec<RouterHandler> {
        self.handlers.clone()
    }

    /// Binds this checker and the connection to each other. The checker
    /// holds the connection weakly; the connection owns the checker.
    pub fn bind_conn(self: &Arc<Self>, conn: &Arc<Connection>) {
        *self.conn.lock().unwrap() = Some(Arc::downgrade(conn));
        conn.set_heartbeat(Arc::clone(self));
    }

    pub fn start(self: &Arc<Self>) {
        let (quit_tx, quit_rx) = bounded::<()>(0);
        *self.quit.lock().unwrap() = Some(quit_tx);

        let checker = Arc::clone(self);
        let ticks = tick(self.interval);
        let handle = thread::Builder::new()
            .name("gantry-heartbeat".into())
            .spawn(move || {
                loop {
                    select! {
                        recv(ticks) -> _ => checker.check(),
                        recv(quit_rx) -> _ => return,
                    }
                }
            })
            .expect("spawn heartbeat thread");
        *self.ticker.lock().unwrap() = Some(handle);
    }

    pub fn stop(&self) {
        debug!("heartbeat checker stop");
        self.quit.lock().unwrap().take();
        if let Some(handle) = self.ticker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn check(&self) {
        let conn = self.conn.lock().unwrap().as_ref().and_then(Weak::upgrade);
        let Some(conn) = conn else { return };

        if !conn.is_alive() {
            (self.on_remote_not_alive)(&conn);
        } else if let Some(beat) = &self.beat {
            if let Err(err) = beat(&conn) {
                error!(conn_id = conn.conn_id(), %err, "heartbeat beat fn failed");
            }
        } else if let Err(err) = self.send_heartbeat(&conn) {
            error!(conn_id = conn.conn_id(), %err, "send heartbeat failed");
        }
    }

    fn send_heartbeat(&self, conn: &Arc<Connection>) -> Result<(), SendError> {
        let msg = (self.make_msg)(conn);
        conn.send_msg(self.msg_id, &msg)
    }
}
