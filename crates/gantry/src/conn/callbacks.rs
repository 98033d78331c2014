/// Close-time callback, invoked once after the connection finalizes.
pub type CloseCallback = Box<dyn Fn() + Send + Sync>;

struct Entry {
    handler: String,
    key: String,
    callback: CloseCallback,
}

/// `(handler, key)`-addressed registry of close callbacks.
#[derive(Default)]
pub(crate) struct CloseCallbacks {
    entries: Vec<Entry>,
}

impl CloseCallbacks {
    pub(crate) fn add(&mut self, handler: &str, key: &str, callback: CloseCallback) {
        self.entries.push(Entry { handler: handler.to_owned(), key: key.to_owned(), callback });
    }

    pub(crate) fn remove(&mut self, handler: &str, key: &str) {
        self.entries.retain(|e| !(e.handler == handler && e.key == key));
    }

    pub(crate) fn invoke(&self) {
        for entry in &self.entries {
            (entry.callback)();
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
