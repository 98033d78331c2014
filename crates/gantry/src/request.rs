use std::{any::Any, collections::HashMap, sync::Arc};

use gantry_codec::Message;

use crate::{conn::Connection, interceptor::IcResp, router::Router};

/// Handler element of the slices router model.
pub type RouterHandler = Arc<dyn Fn(&mut Request) + Send + Sync>;

/// Values stored in request context and connection property bags.
pub type PropertyValue = Arc<dyn Any + Send + Sync>;

/// Steps of the legacy three-phase router pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum HandleStep {
    PreHandle,
    Handle,
    PostHandle,
    HandleOver,
}

impl HandleStep {
    fn advance(self) -> Self {
        match self {
            Self::PreHandle => Self::Handle,
            Self::Handle => Self::PostHandle,
            Self::PostHandle | Self::HandleOver => Self::HandleOver,
        }
    }
}

/// One inbound frame on its way to application code.
///
/// Carries the originating connection, the message, the response slot the
/// decoder interceptors fill, and the handler-progress state of whichever
/// router model is active. Created per frame (or drawn from the request
/// pool when pooling is enabled) and dropped when handling completes.
pub struct Request {
    conn: Option<Arc<Connection>>,
    msg: Message,
    response: IcResp,

    // Legacy router state.
    router: Option<Arc<dyn Router>>,
    step: HandleStep,
    need_next: bool,

    // Slices router state.
    slices_mode: bool,
    handlers: Option<Arc<[RouterHandler]>>,
    index: i64,

    keys: Option<HashMap<String, PropertyValue>>,
}

impl Request {
    pub(crate) fn new(conn: Arc<Connection>, msg: Message, slices_mode: bool) -> Self {
        Self {
            conn: Some(conn),
            msg,
            response: None,
            router: None,
            step: HandleStep::PreHandle,
            need_next: true,
            slices_mode,
            handlers: None,
            index: -1,
            keys: None,
        }
    }

    /// Request without a connection, for pipelines driven outside a socket
    /// (tests, internal replays).
    pub fn detached(msg: Message) -> Self {
        Self {
            conn: None,
            msg,
            response: None,
            router: None,
            step: HandleStep::PreHandle,
            need_next: true,
            slices_mode: false,
            handlers: None,
            index: -1,
            keys: None,
        }
    }

    /// Reset-for-reuse contract of the request pool: every piece of
    /// per-frame state is cleared before hand-back.
    pub(crate) fn reset(&mut self, conn: Arc<Connection>, msg: Message, slices_mode: bool) {
        self.conn = Some(conn);
        self.msg = msg;
        self.response = None;
        self.router = None;
        self.step = HandleStep::PreHandle;
        self.need_next = true;
        self.slices_mode = slices_mode;
        self.handlers = None;
        self.index = -1;
        self.keys = None;
    }

    pub(crate) fn clear(&mut self) {
        self.conn = None;
        self.msg = Message::default();
        self.response = None;
        self.router = None;
        self.handlers = None;
        self.keys = None;
    }

    pub fn connection(&self) -> Option<&Arc<Connection>> {
        self.conn.as_ref()
    }

    pub fn message(&self) -> &Message {
        &self.msg
    }

    pub fn message_mut(&mut self) -> &mut Message {
        &mut self.msg
    }

    pub fn msg_id(&self) -> u32 {
        self.msg.id()
    }

    pub fn data(&self) -> &[u8] {
        self.msg.data()
    }

    pub fn response(&self) -> IcResp {
        self.response.clone()
    }

    pub fn set_response(&mut self, response: IcResp) {
        self.response = response;
    }

    pub fn bind_router(&mut self, router: Arc<dyn Router>) {
        self.router = Some(router);
    }

    pub fn bind_handlers(&mut self, handlers: Arc<[RouterHandler]>) {
        self.handlers = Some(handlers);
    }

    /// Walks the legacy pipeline: PreHandle, Handle, PostHandle.
    pub fn call(&mut self) {
        let Some(router) = self.router.clone() else { return };

        while self.step < HandleStep::HandleOver {
            match self.step {
                HandleStep::PreHandle => router.pre_handle(self),
                HandleStep::Handle => router.handle(self),
                HandleStep::PostHandle => router.post_handle(self),
                HandleStep::HandleOver => {}
            }
            self.next();
        }
        self.step = HandleStep::PreHandle;
    }

    fn next(&mut self) {
        // A goto has positioned the step already; don't advance twice.
        if !self.need_next {
            self.need_next = true;
            return;
        }
        self.step = self.step.advance();
    }

    /// Replays the legacy pipeline from `step`.
    pub fn goto_step(&mut self, step: HandleStep) {
        self.step = step;
        self.need_next = false;
    }

    /// Skips every remaining handler of the active router model.
    pub fn abort(&mut self) {
        if self.slices_mode {
            self.index = self.handlers.as_ref().map_or(0, |h| h.len() as i64);
        } else {
            self.step = HandleStep::HandleOver;
        }
    }

    /// Advances through the bound handler slice, invoking each handler in
    /// order. A handler may call [`abort`](Self::abort) to stop the walk.
    pub fn router_slices_next(&mut self) {
        let Some(handlers) = self.handlers.clone() else { return };

        self.index += 1;
        while self.index >= 0 && (self.index as usize) < handlers.len() {
            handlers[self.index as usize](self);
            self.index += 1;
        }
    }

    /// Stores a context value scoped to this request.
    pub fn set_ctx(&mut self, key: impl Into<String>, value: PropertyValue) {
        self.keys.get_or_insert_with(HashMap::new).insert(key.into(), value);
    }

    pub fn get_ctx(&self, key: &str) -> Option<PropertyValue> {
        self.keys.as_ref().and_then(|keys| keys.get(key)).cloned()
    }

    /// Detached copy for inspection off the handling thread: no
    /// connection, no handlers, context and message duplicated, handler
    /// progress pinned past the end.
    pub fn copy(&self) -> Self {
        Self {
            conn: None,
            msg: self.msg.clone(),
            response: self.response.clone(),
            router: None,
            step: self.step,
            need_next: false,
            slices_mode: self.slices_mode,
            handlers: None,
            index: i64::MAX,
            keys: self.keys.clone(),
        }
    }
}

/// Object pool for [`Request`], active when `request_pool_mode` is set.
pub(crate) struct RequestPool {
    enabled: bool,
    slices_mode: bool,
    pool: std::sync::Mutex<Vec<Request>>,
}

impl RequestPool {
    pub(crate) fn new(enabled: bool, slices_mode: bool) -> Self {
        Self { enabled, slices_mode, pool: std::sync::Mutex::new(Vec::new()) }
    }

    pub(crate) fn get(&self, conn: Arc<Connection>, msg: Message) -> Request {
        if self.enabled {
            if let Some(mut request) = self.pool.lock().unwrap().pop() {
                request.reset(conn, msg, self.slices_mode);
                return request;
            }
        }
        Request::new(conn, msg, self.slices_mode)
    }

    pub(crate) fn put(&self, mut request: Request) {
        if self.enabled {
            request.clear();
            self.pool.lock().unwrap().push(request);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::router::Router;

    #[derive(Default)]
    struct Recorder {
        pre: AtomicUsize,
        handle: AtomicUsize,
        post: AtomicUsize,
    }

    struct Counting(Arc<Recorder>);

    impl Router for Counting {
        fn pre_handle(&self, _req: &mut Request) {
            self.0.pre.fetch_add(1, Ordering::SeqCst);
        }
        fn handle(&self, _req: &mut Request) {
            self.0.handle.fetch_add(1, Ordering::SeqCst);
        }
        fn post_handle(&self, _req: &mut Request) {
            self.0.post.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Aborting(Arc<Recorder>);

    impl Router for Aborting {
        fn pre_handle(&self, req: &mut Request) {
            self.0.pre.fetch_add(1, Ordering::SeqCst);
            req.abort();
        }
        fn handle(&self, _req: &mut Request) {
            self.0.handle.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn call_walks_all_three_steps() {
        let rec = Arc::new(Recorder::default());
        let mut req = Request::detached(Message::default());
        req.bind_router(Arc::new(Counting(Arc::clone(&rec))));
        req.call();

        assert_eq!(rec.pre.load(Ordering::SeqCst), 1);
        assert_eq!(rec.handle.load(Ordering::SeqCst), 1);
        assert_eq!(rec.post.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn abort_jumps_to_handle_over() {
        let rec = Arc::new(Recorder::default());
        let mut req = Request::detached(Message::default());
        req.bind_router(Arc::new(Aborting(Arc::clone(&rec))));
        req.call();

        assert_eq!(rec.pre.load(Ordering::SeqCst), 1);
        assert_eq!(rec.handle.load(Ordering::SeqCst), 0);
        assert_eq!(rec.post.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn goto_replays_without_double_advance() {
        struct GotoOnce(Arc<Recorder>);

        impl Router for GotoOnce {
            fn pre_handle(&self, _req: &mut Request) {
                self.0.pre.fetch_add(1, Ordering::SeqCst);
            }
            fn handle(&self, req: &mut Request) {
                let n = self.0.handle.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    // Re-run the pre step once; execution must then pass
                    // through handle again.
                    req.goto_step(HandleStep::PreHandle);
                }
            }
            fn post_handle(&self, _req: &mut Request) {
                self.0.post.fetch_add(1, Ordering::SeqCst);
            }
        }

        let rec = Arc::new(Recorder::default());
        let mut req = Request::detached(Message::default());
        req.bind_router(Arc::new(GotoOnce(Arc::clone(&rec))));
        req.call();

        assert_eq!(rec.pre.load(Ordering::SeqCst), 2);
        assert_eq!(rec.handle.load(Ordering::SeqCst), 2);
        assert_eq!(rec.post.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn slices_walk_runs_handlers_in_order_and_abort_stops() {
        let order: Arc<std::sync::Mutex<Vec<u32>>> = Arc::default();

        let mk = |n: u32, order: Arc<std::sync::Mutex<Vec<u32>>>, stop: bool| -> RouterHandler {
            Arc::new(move |req: &mut Request| {
                order.lock().unwrap().push(n);
                if stop {
                    req.abort();
                }
            })
        };

        let handlers: Arc<[RouterHandler]> = vec![
            mk(1, Arc::clone(&order), false),
            mk(2, Arc::clone(&order), true),
            mk(3, Arc::clone(&order), false),
        ]
        .into();

        let mut req = Request::detached(Message::default());
        req.slices_mode = true;
        req.bind_handlers(handlers);
        req.router_slices_next();

        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn context_round_trips() {
        let mut req = Request::detached(Message::default());
        req.set_ctx("user", Arc::new(42u64));

        let value = req.get_ctx("user").unwrap();
        assert_eq!(value.downcast_ref::<u64>(), Some(&42));
        assert!(req.get_ctx("missing").is_none());

        let copy = req.copy();
        assert!(copy.connection().is_none());
        assert!(copy.get_ctx("user").is_some());
    }
}
