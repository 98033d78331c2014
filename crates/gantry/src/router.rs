use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use crate::{
    error::RouterError,
    request::{Request, RouterHandler},
};

/// Legacy router model: three-phase handling of one msg id.
///
/// Implement only the phases you need; the defaults do nothing.
pub trait Router: Send + Sync {
    fn pre_handle(&self, _req: &mut Request) {}
    fn handle(&self, _req: &mut Request) {}
    fn post_handle(&self, _req: &mut Request) {}
}

/// Handler-slice router model: global middleware plus per-msg-id handler
/// chains, assembled at registration time.
#[derive(Default)]
pub struct RouterSlices {
    apis: RwLock<HashMap<u32, Arc<[RouterHandler]>>>,
    global: RwLock<Vec<RouterHandler>>,
}

impl RouterSlices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends middleware that runs ahead of every handler chain
    /// registered afterwards.
    pub fn use_middleware(&self, handlers: impl IntoIterator<Item = RouterHandler>) {
        self.global.write().unwrap().extend(handlers);
    }

    /// Registers the handler chain for `msg_id` as
    /// `global middleware ++ handlers`.
    pub fn add_handler(
        &self,
        msg_id: u32,
        handlers: impl IntoIterator<Item = RouterHandler>,
    ) -> Result<(), RouterError> {
        let mut apis = self.apis.write().unwrap();
        if apis.contains_key(&msg_id) {
            return Err(RouterError::DuplicateMsgId(msg_id));
        }

        let mut merged: Vec<RouterHandler> = self.global.read().unwrap().clone();
        merged.extend(handlers);
        apis.insert(msg_id, merged.into());
        Ok(())
    }

    pub fn handlers(&self, msg_id: u32) -> Option<Arc<[RouterHandler]>> {
        self.apis.read().unwrap().get(&msg_id).cloned()
    }

    /// Opens a group restricted to msg ids in `start..=end`, with
    /// `handlers` as group middleware.
    pub fn group(
        self: &Arc<Self>,
        start: u32,
        end: u32,
        handlers: impl IntoIterator<Item = RouterHandler>,
    ) -> GroupRouter {
        GroupRouter {
            start,
            end,
            handlers: std::sync::Mutex::new(handlers.into_iter().collect()),
            registry: Arc::clone(self),
        }
    }
}

/// Range-restricted registration view over a [`RouterSlices`].
pub struct GroupRouter {
    start: u32,
    end: u32,
    handlers: std::sync::Mutex<Vec<RouterHandler>>,
    registry: Arc<RouterSlices>,
}

impl GroupRouter {
    /// Appends group middleware, prepended to every chain this group
    /// registers afterwards.
    pub fn use_middleware(&self, handlers: impl IntoIterator<Item = RouterHandler>) {
        self.handlers.lock().unwrap().extend(handlers);
    }

    pub fn add_handler(
        &self,
        msg_id: u32,
        handlers: impl IntoIterator<Item = RouterHandler>,
    ) -> Result<(), RouterError> {
        if msg_id < self.start || msg_id > self.end {
            return Err(RouterError::OutOfGroupRange {
                id: msg_id,
                start: self.start,
                end: self.end,
            });
        }

        let mut merged: Vec<RouterHandler> = self.handlers.lock().unwrap().clone();
        merged.extend(handlers);
        self.registry.add_handler(msg_id, merged)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use gantry_codec::Message;

    use super::*;

    fn tag(n: u32, log: &Arc<Mutex<Vec<u32>>>) -> RouterHandler {
        let log = Arc::clone(log);
        Arc::new(move |_req: &mut Request| log.lock().unwrap().push(n))
    }

    fn run(slices: &RouterSlices, msg_id: u32) {
        let mut req = Request::detached(Message::default());
        let handlers = slices.handlers(msg_id).unwrap();
        req.bind_handlers(handlers);
        req.router_slices_next();
    }

    #[test]
    fn global_middleware_prefixes_registered_chains() {
        let log = Arc::default();
        let slices = RouterSlices::new();

        slices.use_middleware([tag(100, &log)]);
        slices.add_handler(1, [tag(1, &log)]).unwrap();

        // Middleware added later only applies to later registrations.
        slices.use_middleware([tag(200, &log)]);
        slices.add_handler(2, [tag(2, &log)]).unwrap();

        run(&slices, 1);
        run(&slices, 2);
        assert_eq!(*log.lock().unwrap(), vec![100, 1, 100, 200, 2]);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let log = Arc::default();
        let slices = RouterSlices::new();
        slices.add_handler(7, [tag(1, &log)]).unwrap();
        assert_eq!(
            slices.add_handler(7, [tag(2, &log)]),
            Err(RouterError::DuplicateMsgId(7))
        );
    }

    #[test]
    fn group_restricts_range_and_prepends_middleware() {
        let log = Arc::default();
        let slices = Arc::new(RouterSlices::new());

        let group = slices.group(10, 20, [tag(500, &log)]);
        group.add_handler(15, [tag(15, &log)]).unwrap();

        assert_eq!(
            group.add_handler(30, [tag(30, &log)]),
            Err(RouterError::OutOfGroupRange { id: 30, start: 10, end: 20 })
        );

        run(&slices, 15);
        assert_eq!(*log.lock().unwrap(), vec![500, 15]);
    }
}
