use std::{
    collections::HashMap,
    io,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex, OnceLock, RwLock, Weak,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, bounded, select};
use gantry_codec::{FrameDecoder, FrameError, LengthField, Message, Packet};
use tracing::{debug, error, info, warn};

use crate::{
    config::ServerConfig,
    conn::{
        callbacks::{CloseCallback, CloseCallbacks},
        manager::ConnManager,
    },
    dispatch::MsgHandler,
    error::{ConnError, SendError},
    heartbeat::HeartbeatChecker,
    request::PropertyValue,
    transport::Stream,
};

/// Hook run when a connection starts or stops.
pub type ConnHook = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

/// How often a blocked reader wakes to observe cancellation.
const READ_POLL: Duration = Duration::from_millis(100);
/// Idle timeout of `send_to_queue`: fail fast instead of blocking the
/// producer on a full queue.
const SEND_QUEUE_IDLE: Duration = Duration::from_millis(5);

/// Cancellation handle: a zero-capacity channel whose sender is dropped on
/// cancel, so `done()` receivers observe disconnection in `select!`.
pub(crate) struct CancelToken {
    cancelled: AtomicBool,
    guard: Mutex<Option<Sender<()>>>,
    done: Receiver<()>,
}

impl CancelToken {
    fn new() -> Self {
        let (guard, done) = bounded(0);
        Self { cancelled: AtomicBool::new(false), guard: Mutex::new(Some(guard)), done }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.guard.lock().unwrap().take();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn done(&self) -> &Receiver<()> {
        &self.done
    }
}

/// Server-owned capabilities a connection captures at construction.
pub(crate) struct ConnContext {
    pub(crate) config: Arc<ServerConfig>,
    pub(crate) handler: Arc<MsgHandler>,
    pub(crate) packet: Arc<dyn Packet>,
    pub(crate) length_field: Option<LengthField>,
    pub(crate) manager: Weak<ConnManager>,
    pub(crate) on_conn_start: Option<ConnHook>,
    pub(crate) on_conn_stop: Option<ConnHook>,
    pub(crate) name: String,
}

/// One accepted socket.
///
/// A dedicated reader thread feeds inbound bytes through the frame
/// decoder into the message handler; an optional writer thread, started
/// lazily by the first [`send_to_queue`](Self::send_to_queue), drains the
/// bounded send queue. `send` and `send_to_queue` use different paths and
/// are unordered with respect to each other; applications needing strict
/// outbound ordering must use one of them consistently.
pub struct Connection {
    stream: Mutex<Box<dyn Stream>>,
    conn_id: u64,
    conn_id_str: String,
    name: String,
    local_addr: String,
    remote_addr: String,

    config: Arc<ServerConfig>,
    handler: Arc<MsgHandler>,
    packet: Arc<dyn Packet>,
    frame_decoder: Option<FrameDecoder>,
    manager: Weak<ConnManager>,
    on_conn_start: Option<ConnHook>,
    on_conn_stop: Option<ConnHook>,

    worker_id: AtomicU32,
    cancel: CancelToken,

    writer_started: AtomicBool,
    send_tx: OnceLock<Sender<Vec<u8>>>,

    heartbeat: Mutex<Option<Arc<HeartbeatChecker>>>,
    last_activity: Mutex<Instant>,

    properties: Mutex<HashMap<String, PropertyValue>>,
    close_callbacks: RwLock<CloseCallbacks>,
}

impl Connection {
    pub(crate) fn new(ctx: &ConnContext, mut stream: Box<dyn Stream>, conn_id: u64) -> Arc<Self> {
        if let Err(err) = stream.set_read_timeout(Some(READ_POLL)) {
            warn!(conn_id, %err, "couldn't set read timeout");
        }
        let local_addr = stream.local_addr().map(|a| a.to_string()).unwrap_or_default();
        let remote_addr = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();

        Arc::new(Self {
            stream: Mutex::new(stream),
            conn_id,
            conn_id_str: conn_id.to_string(),
            name: ctx.name.clone(),
            local_addr,
            remote_addr,
            config: Arc::clone(&ctx.config),
            handler: Arc::clone(&ctx.handler),
            packet: Arc::clone(&ctx.packet),
            frame_decoder: ctx.length_field.map(FrameDecoder::new),
            manager: Weak::clone(&ctx.manager),
            on_conn_start: ctx.on_conn_start.clone(),
            on_conn_stop: ctx.on_conn_stop.clone(),
            worker_id: AtomicU32::new(0),
            cancel: CancelToken::new(),
            writer_started: AtomicBool::new(false),
            send_tx: OnceLock::new(),
            heartbeat: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
            properties: Mutex::new(HashMap::new()),
            close_callbacks: RwLock::new(CloseCallbacks::default()),
        })
    }

    /// Runs the connection: hooks, heartbeat, worker reservation, the
    /// reader thread, then blocks until cancellation and finalizes.
    pub fn start(self: &Arc<Self>) {
        self.call_on_conn_start();

        let heartbeat = self.heartbeat.lock().unwrap().clone();
        if let Some(checker) = heartbeat {
            checker.start();
            self.update_activity();
        }

        match self.handler.reserve_worker(self.conn_id) {
            Ok(worker_id) => self.worker_id.store(worker_id, Ordering::Release),
            Err(err) => {
                // Bind-mode exhaustion: refuse the connection instead of
                // silently sharing worker zero.
                error!(conn_id = self.conn_id, %err, "refusing connection");
                self.cancel.cancel();
                self.finalize();
                return;
            }
        }

        let reader = {
            let conn = Arc::clone(self);
            thread::Builder::new()
                .name(format!("gantry-reader-{}", self.conn_id))
                .spawn(move || conn.reader_loop())
                .expect("spawn reader thread")
        };

        let _ = self.cancel.done().recv();

        self.finalize();
        self.handler.release_worker(self.worker_id.load(Ordering::Acquire));
        let _ = reader.join();
    }

    /// Cancels the connection; `start` observes this and finalizes.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    fn reader_loop(self: Arc<Self>) {
        debug!(conn_id = self.conn_id, remote = %self.remote_addr, "reader started");
        let outcome = catch_unwind(AssertUnwindSafe(|| self.read_until_closed()));
        if let Err(panic) = outcome {
            error!(
                conn_id = self.conn_id,
                reason = crate::dispatch::panic_message(&*panic),
                "reader panicked"
            );
        }
        self.stop();
        debug!(conn_id = self.conn_id, "reader exit");
    }

    fn read_until_closed(self: &Arc<Self>) {
        let mut buffer = vec![0u8; self.config.io_read_buff_size];

        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            let n = {
                let mut stream = self.stream.lock().unwrap();
                match stream.read(&mut buffer) {
                    Ok(0) => {
                        debug!(conn_id = self.conn_id, "peer closed");
                        return;
                    }
                    Ok(n) => n,
                    Err(err)
                        if err.kind() == io::ErrorKind::WouldBlock
                            || err.kind() == io::ErrorKind::TimedOut =>
                    {
                        continue;
                    }
                    Err(err) => {
                        if !self.cancel.is_cancelled() {
                            error!(conn_id = self.conn_id, %err, "read failed");
                        }
                        return;
                    }
                }
            };

            if self.has_heartbeat() {
                self.update_activity();
            }

            match &self.frame_decoder {
                Some(decoder) => {
                    let fed =
                        decoder.decode_with(&buffer[..n], |frame| self.handle_frame(frame));
                    match fed {
                        Ok(()) => {}
                        // The decoder absorbs the oversized bytes itself;
                        // the connection lives on.
                        Err(FrameError::FrameTooLong { .. }) => {}
                        Err(err) => {
                            error!(conn_id = self.conn_id, %err, "protocol violation");
                            return;
                        }
                    }
                }
                None => self.handle_frame(buffer[..n].to_vec()),
            }
        }
    }

    fn handle_frame(self: &Arc<Self>, frame: Vec<u8>) {
        let request = self.handler.request(Arc::clone(self), Message::from_frame(frame));
        self.handler.execute(request);
    }

    /// Synchronous direct write, bypassing the send queue.
    pub fn send(&self, data: &[u8]) -> Result<(), SendError> {
        if self.cancel.is_cancelled() {
            return Err(SendError::Closed);
        }
        let mut stream = self.stream.lock().unwrap();
        stream.write_all(data)?;
        Ok(())
    }

    /// Packs `(msg_id, data)` with the connection's codec and writes it
    /// directly.
    pub fn send_msg(&self, msg_id: u32, data: &[u8]) -> Result<(), SendError> {
        if self.cancel.is_cancelled() {
            return Err(SendError::Closed);
        }
        let bytes = self.packet.pack(&Message::with_id(msg_id, data.to_vec()))?;
        self.send(&bytes)
    }

    /// Queues bytes for the writer thread, starting it on first use.
    ///
    /// Fails with [`SendError::Timeout`] when the queue stays full past
    /// the idle timeout rather than blocking the producer.
    pub fn send_to_queue(self: &Arc<Self>, data: Vec<u8>) -> Result<(), SendError> {
        if data.is_empty() {
            return Err(SendError::EmptyPayload);
        }
        if self.cancel.is_cancelled() {
            return Err(SendError::Closed);
        }

        let tx = self.ensure_writer();
        select! {
            send(tx, data) -> sent => sent.map_err(|_| SendError::Closed),
            recv(self.cancel.done()) -> _ => Err(SendError::Closed),
            default(SEND_QUEUE_IDLE) => Err(SendError::Timeout),
        }
    }

    /// Packs `(msg_id, data)` and queues it for the writer thread.
    pub fn send_buff_msg(self: &Arc<Self>, msg_id: u32, data: &[u8]) -> Result<(), SendError> {
        let bytes = self.packet.pack(&Message::with_id(msg_id, data.to_vec()))?;
        self.send_to_queue(bytes)
    }

    /// One-shot writer start. A connection that only ever calls `send`
    /// never allocates the queue or the thread.
    fn ensure_writer(self: &Arc<Self>) -> &Sender<Vec<u8>> {
        if self
            .writer_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let (tx, rx) = bounded(self.config.max_msg_chan_len);
            let conn = Arc::clone(self);
            thread::Builder::new()
                .name(format!("gantry-writer-{}", self.conn_id))
                .spawn(move || conn.writer_loop(&rx))
                .expect("spawn writer thread");
            let _ = self.send_tx.set(tx);
        }

        // A racing caller may observe the flag set a moment before the
        // sender is published.
        loop {
            if let Some(tx) = self.send_tx.get() {
                return tx;
            }
            std::hint::spin_loop();
        }
    }

    fn writer_loop(&self, queue: &Receiver<Vec<u8>>) {
        debug!(conn_id = self.conn_id, "writer started");
        loop {
            select! {
                recv(queue) -> data => match data {
                    Ok(data) => {
                        if let Err(err) = self.send(&data) {
                            error!(conn_id = self.conn_id, %err, "send from queue failed");
                            return;
                        }
                    }
                    Err(_) => return,
                },
                recv(self.cancel.done()) -> _ => {
                    debug!(conn_id = self.conn_id, "writer exit");
                    return;
                }
            }
        }
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn conn_id_str(&self) -> &str {
        &self.conn_id_str
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn worker_id(&self) -> u32 {
        self.worker_id.load(Ordering::Acquire)
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn msg_handler(&self) -> &Arc<MsgHandler> {
        &self.handler
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Liveness for the heartbeat checker: open and active within the
    /// configured window.
    pub fn is_alive(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.last_activity.lock().unwrap().elapsed() < self.config.heartbeat_max_duration()
    }

    pub(crate) fn update_activity(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    pub(crate) fn set_heartbeat(&self, checker: Arc<HeartbeatChecker>) {
        *self.heartbeat.lock().unwrap() = Some(checker);
    }

    fn has_heartbeat(&self) -> bool {
        self.heartbeat.lock().unwrap().is_some()
    }

    pub fn set_property(&self, key: impl Into<String>, value: PropertyValue) {
        self.properties.lock().unwrap().insert(key.into(), value);
    }

    pub fn get_property(&self, key: &str) -> Result<PropertyValue, ConnError> {
        self.properties.lock().unwrap().get(key).cloned().ok_or(ConnError::PropertyNotFound)
    }

    pub fn remove_property(&self, key: &str) {
        self.properties.lock().unwrap().remove(key);
    }

    /// Registers a close callback. Rejected once the connection is
    /// cancelled.
    pub fn add_close_callback(&self, handler: &str, key: &str, callback: CloseCallback) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.close_callbacks.write().unwrap().add(handler, key, callback);
    }

    pub fn remove_close_callback(&self, handler: &str, key: &str) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.close_callbacks.write().unwrap().remove(handler, key);
    }

    fn invoke_close_callbacks(&self) {
        self.close_callbacks.read().unwrap().invoke();
    }

    fn call_on_conn_start(self: &Arc<Self>) {
        if let Some(hook) = &self.on_conn_start {
            debug!(conn_id = self.conn_id, "on_conn_start");
            hook(self);
        }
    }

    fn call_on_conn_stop(self: &Arc<Self>) {
        if let Some(hook) = &self.on_conn_stop {
            debug!(conn_id = self.conn_id, "on_conn_stop");
            hook(self);
        }
    }

    fn finalize(self: &Arc<Self>) {
        self.call_on_conn_stop();

        if let Some(checker) = self.heartbeat.lock().unwrap().take() {
            checker.stop();
        }

        self.stream.lock().unwrap().shutdown();

        if let Some(manager) = self.manager.upgrade() {
            manager.remove(self);
        }

        // Close callbacks run detached so a slow callback can't stall the
        // finalizer; registration stays gated by the cancelled flag.
        let conn = Arc::clone(self);
        thread::spawn(move || {
            if catch_unwind(AssertUnwindSafe(|| conn.invoke_close_callbacks())).is_err() {
                error!(conn_id = conn.conn_id, "close callback panicked");
            }
        });

        info!(conn_id = self.conn_id, remote = %self.remote_addr, "connection stopped");
    }
}
