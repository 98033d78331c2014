use std::{
    collections::{HashMap, HashSet},
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Mutex, RwLock, Weak},
    thread::{self, JoinHandle},
};

use crossbeam_channel::{Receiver, Sender, bounded};
use gantry_codec::Message;
use tracing::{debug, error, info};

use crate::{
    config::{ServerConfig, WorkerMode},
    conn::Connection,
    error::{RouterError, WorkerError},
    interceptor::{ChainBuilder, Interceptor, execute},
    request::{Request, RequestPool},
    router::{Router, RouterSlices},
};

/// Message handler: router registries, the interceptor chain, and the
/// worker pool that drains dispatched requests.
///
/// Every inbound request enters through [`execute`](Self::execute), flows
/// through the interceptor chain, and reaches the dispatcher installed as
/// the chain tail. The dispatcher either hands it to the connection's
/// assigned worker queue or, with a pool size of zero, runs it on a
/// detached thread.
pub struct MsgHandler {
    apis: RwLock<HashMap<u32, Arc<dyn Router>>>,
    slices: Arc<RouterSlices>,
    builder: Mutex<ChainBuilder>,

    slices_mode: bool,
    worker_mode: WorkerMode,
    pool_size: u32,
    queue_len: usize,

    senders: Mutex<Vec<Sender<Request>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Bind mode only: worker ids not currently reserved by a connection.
    free_workers: Mutex<HashSet<u32>>,

    request_pool: RequestPool,
}

impl MsgHandler {
    pub(crate) fn new(config: &ServerConfig) -> Arc<Self> {
        // Bind mode gives every connection its own worker, so the pool
        // covers the connection limit.
        let pool_size = match config.worker_mode {
            WorkerMode::Bind => config.max_conn as u32,
            WorkerMode::Hash => config.worker_pool_size,
        };
        let free_workers = match config.worker_mode {
            WorkerMode::Bind => (0..pool_size).collect(),
            WorkerMode::Hash => HashSet::new(),
        };

        let handler = Arc::new(Self {
            apis: RwLock::new(HashMap::new()),
            slices: Arc::new(RouterSlices::new()),
            builder: Mutex::new(ChainBuilder::default()),
            slices_mode: config.router_slices_mode,
            worker_mode: config.worker_mode,
            pool_size,
            queue_len: config.max_worker_task_len,
            senders: Mutex::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
            free_workers: Mutex::new(free_workers),
            request_pool: RequestPool::new(config.request_pool_mode, config.router_slices_mode),
        });

        // The dispatcher is the mandatory last link of the chain.
        handler
            .builder
            .lock()
            .unwrap()
            .set_tail(Arc::new(Dispatch { handler: Arc::downgrade(&handler) }));
        handler
    }

    pub fn slices_mode(&self) -> bool {
        self.slices_mode
    }

    pub fn pool_size(&self) -> u32 {
        self.pool_size
    }

    /// Registers a legacy router for `msg_id`.
    pub fn add_router(&self, msg_id: u32, router: Arc<dyn Router>) -> Result<(), RouterError> {
        let mut apis = self.apis.write().unwrap();
        if apis.contains_key(&msg_id) {
            return Err(RouterError::DuplicateMsgId(msg_id));
        }
        apis.insert(msg_id, router);
        info!(msg_id, "router added");
        Ok(())
    }

    pub fn router_slices(&self) -> &Arc<RouterSlices> {
        &self.slices
    }

    pub(crate) fn set_head_interceptor(&self, interceptor: Arc<dyn Interceptor>) {
        self.builder.lock().unwrap().set_head(interceptor);
    }

    pub fn add_interceptor(&self, interceptor: Arc<dyn Interceptor>) {
        self.builder.lock().unwrap().add(interceptor);
    }

    pub(crate) fn request(&self, conn: Arc<Connection>, msg: Message) -> Request {
        self.request_pool.get(conn, msg)
    }

    /// Feeds a request into the interceptor chain.
    pub fn execute(&self, request: Request) {
        let interceptors = self.builder.lock().unwrap().assemble();
        execute(&interceptors, request);
    }

    /// Spawns the fixed worker pool, one bounded queue per worker.
    pub(crate) fn start_worker_pool(self: &Arc<Self>) {
        let mut senders = self.senders.lock().unwrap();
        if !senders.is_empty() {
            return;
        }

        let mut workers = self.workers.lock().unwrap();
        for worker_id in 0..self.pool_size as usize {
            let (tx, rx) = bounded::<Request>(self.queue_len);
            senders.push(tx);

            let handler = Arc::clone(self);
            let handle = thread::Builder::new()
                .name(format!("gantry-worker-{worker_id}"))
                .spawn(move || handler.worker_loop(worker_id, &rx))
                .expect("spawn worker thread");
            workers.push(handle);
        }
        info!(pool_size = self.pool_size, "worker pool started");
    }

    /// Closes every worker queue and waits for the workers to drain.
    pub(crate) fn stop_worker_pool(&self) {
        self.senders.lock().unwrap().clear();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in workers {
            let _ = handle.join();
        }
        debug!("worker pool stopped");
    }

    fn worker_loop(self: &Arc<Self>, worker_id: usize, queue: &Receiver<Request>) {
        debug!(worker_id, "worker started");
        while let Ok(request) = queue.recv() {
            self.run_request(request, worker_id);
        }
        debug!(worker_id, "worker exit");
    }

    /// Reserves the worker that will serve `conn_id` for its lifetime.
    pub(crate) fn reserve_worker(&self, conn_id: u64) -> Result<u32, WorkerError> {
        match self.worker_mode {
            WorkerMode::Bind => {
                let mut free = self.free_workers.lock().unwrap();
                let id = free.iter().next().copied().ok_or(WorkerError::Exhausted)?;
                free.remove(&id);
                Ok(id)
            }
            WorkerMode::Hash => {
                if self.pool_size == 0 {
                    Ok(0)
                } else {
                    Ok((conn_id % u64::from(self.pool_size)) as u32)
                }
            }
        }
    }

    pub(crate) fn release_worker(&self, worker_id: u32) {
        if self.worker_mode == WorkerMode::Bind {
            self.free_workers.lock().unwrap().insert(worker_id);
        }
    }

    /// Tail-of-chain behavior: queue to the assigned worker, or run
    /// detached when no pool is configured.
    fn dispatch(self: &Arc<Self>, request: Request) {
        if self.pool_size == 0 {
            let handler = Arc::clone(self);
            thread::spawn(move || handler.run_request(request, 0));
            return;
        }

        let worker_id = request
            .connection()
            .map_or(0, |conn| conn.worker_id() as usize % self.pool_size as usize);
        let sender = { self.senders.lock().unwrap().get(worker_id).cloned() };
        match sender {
            // Blocking send: a full queue backpressures the reader.
            Some(sender) => {
                if sender.send(request).is_err() {
                    debug!(worker_id, "worker queue closed, request dropped");
                }
            }
            None => error!(worker_id, "worker pool not started, request dropped"),
        }
    }

    fn run_request(&self, mut request: Request, worker_id: usize) {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            if self.slices_mode {
                self.do_handle_slices(&mut request);
            } else {
                self.do_handle(&mut request);
            }
        }));
        if let Err(panic) = outcome {
            error!(worker_id, reason = panic_message(&*panic), "handler panicked");
        }
        self.request_pool.put(request);
    }

    fn do_handle(&self, request: &mut Request) {
        let msg_id = request.msg_id();
        let Some(router) = self.apis.read().unwrap().get(&msg_id).cloned() else {
            error!(msg_id, "no router registered");
            return;
        };
        request.bind_router(router);
        request.call();
    }

    fn do_handle_slices(&self, request: &mut Request) {
        let msg_id = request.msg_id();
        let Some(handlers) = self.slices.handlers(msg_id) else {
            error!(msg_id, "no handlers registered");
            return;
        };
        request.bind_handlers(handlers);
        request.router_slices_next();
    }
}

/// Best-effort text of a recovered panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("opaque panic payload")
}

/// The chain tail. Holds the handler weakly: the handler owns the chain
/// builder that owns this interceptor.
struct Dispatch {
    handler: Weak<MsgHandler>,
}

impl Interceptor for Dispatch {
    fn intercept(&self, _chain: crate::interceptor::Chain<'_>, request: Request) -> crate::interceptor::IcResp {
        if let Some(handler) = self.handler.upgrade() {
            handler.dispatch(request);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(mode: WorkerMode, pool: u32, max_conn: usize) -> ServerConfig {
        ServerConfig {
            worker_mode: mode,
            worker_pool_size: pool,
            max_conn,
            ..ServerConfig::default()
        }
    }

    #[test]
    fn hash_mode_is_stable_modulo_pool_size() {
        let handler = MsgHandler::new(&config(WorkerMode::Hash, 4, 100));

        for conn_id in [5u64, 9, 13] {
            assert_eq!(handler.reserve_worker(conn_id).unwrap(), 1);
        }
        assert_eq!(handler.reserve_worker(8).unwrap(), 0);
        // Releasing is a no-op in hash mode; assignment stays stable.
        handler.release_worker(1);
        assert_eq!(handler.reserve_worker(5).unwrap(), 1);
    }

    #[test]
    fn bind_mode_reserves_distinct_workers_until_exhausted() {
        let handler = MsgHandler::new(&config(WorkerMode::Bind, 10, 3));
        assert_eq!(handler.pool_size(), 3);

        let mut seen = HashSet::new();
        for conn_id in 0..3u64 {
            seen.insert(handler.reserve_worker(conn_id).unwrap());
        }
        assert_eq!(seen.len(), 3);

        assert_eq!(handler.reserve_worker(99), Err(WorkerError::Exhausted));

        // Finalize returns the id to the free set.
        let returned = *seen.iter().next().unwrap();
        handler.release_worker(returned);
        assert_eq!(handler.reserve_worker(100).unwrap(), returned);
    }

    #[test]
    fn worker_pool_starts_and_drains_on_stop() {
        let handler = MsgHandler::new(&config(WorkerMode::Hash, 2, 100));
        handler.start_worker_pool();
        assert_eq!(handler.senders.lock().unwrap().len(), 2);
        handler.stop_worker_pool();
        assert!(handler.workers.lock().unwrap().is_empty());
    }
}
