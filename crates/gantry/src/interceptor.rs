use std::{any::Any, sync::Arc};

use crate::request::Request;

/// Value an interceptor hands to the layers below it, typically a decoded
/// view of the message (e.g. a parsed TLV or HTLV structure).
pub type IcResp = Option<Arc<dyn Any + Send + Sync>>;

/// One element of the per-message pipeline.
///
/// An interceptor owns the request for the duration of its hop. It may
/// inspect or rewrite the message and then either short-circuit (drop the
/// request and return) or pass it on with [`Chain::proceed`] /
/// [`Chain::proceed_with_message`].
pub trait Interceptor: Send + Sync {
    fn intercept(&self, chain: Chain<'_>, request: Request) -> IcResp;
}

/// Position cursor over the assembled interceptor list.
///
/// Every `proceed` constructs a fresh chain at `position + 1` instead of
/// mutating in place, so an interceptor may call `proceed` from nested
/// logic and compose recursively.
pub struct Chain<'a> {
    interceptors: &'a [Arc<dyn Interceptor>],
    position: usize,
}

impl<'a> Chain<'a> {
    pub(crate) fn new(interceptors: &'a [Arc<dyn Interceptor>]) -> Self {
        Self { interceptors, position: 0 }
    }

    /// Hands the request to the next interceptor. Past the end of the
    /// chain the request's response slot is the final result.
    pub fn proceed(self, request: Request) -> IcResp {
        match self.interceptors.get(self.position) {
            Some(next) => {
                let chain =
                    Chain { interceptors: self.interceptors, position: self.position + 1 };
                next.intercept(chain, request)
            }
            None => request.response(),
        }
    }

    /// Attaches `decoded` to the request's response slot, then proceeds.
    /// `None` proceeds without mutation.
    pub fn proceed_with_message(self, mut request: Request, decoded: IcResp) -> IcResp {
        if let Some(decoded) = decoded {
            request.set_response(Some(decoded));
        }
        self.proceed(request)
    }
}

/// Assembles the pipeline: an optional head (reserved for the inbound
/// decoder), the ordered user-added body, and the mandatory tail (the
/// dispatcher).
#[derive(Default)]
pub struct ChainBuilder {
    head: Option<Arc<dyn Interceptor>>,
    body: Vec<Arc<dyn Interceptor>>,
    tail: Option<Arc<dyn Interceptor>>,
}

impl ChainBuilder {
    pub fn set_head(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.head = Some(interceptor);
    }

    pub fn set_tail(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.tail = Some(interceptor);
    }

    pub fn add(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.body.push(interceptor);
    }

    /// Snapshot of head ++ body ++ tail, runnable without holding any lock
    /// on the builder.
    pub(crate) fn assemble(&self) -> Vec<Arc<dyn Interceptor>> {
        let mut list = Vec::with_capacity(self.body.len() + 2);
        if let Some(head) = &self.head {
            list.push(Arc::clone(head));
        }
        list.extend(self.body.iter().cloned());
        if let Some(tail) = &self.tail {
            list.push(Arc::clone(tail));
        }
        list
    }
}

/// Runs `request` through an assembled interceptor list.
pub(crate) fn execute(interceptors: &[Arc<dyn Interceptor>], request: Request) -> IcResp {
    Chain::new(interceptors).proceed(request)
}
