use std::sync::Arc;

use gantry_utils::ShardMap;
use tracing::{debug, info};

use crate::{conn::Connection, error::ConnError};

/// Registry of live connections, keyed by the decimal conn-id string over
/// a sharded concurrent map.
///
/// Connections insert themselves on accept and remove themselves from
/// their finalizer; [`clear`](Self::clear) only asks each connection to
/// stop and lets the finalizers do the bookkeeping.
#[derive(Default)]
pub struct ConnManager {
    conns: ShardMap<Arc<Connection>>,
}

impl ConnManager {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, conn: &Arc<Connection>) {
        self.conns.insert(conn.conn_id_str().to_owned(), Arc::clone(conn));
        debug!(conn_id = conn.conn_id(), total = self.len(), "connection added");
    }

    pub fn remove(&self, conn: &Connection) {
        self.conns.remove(conn.conn_id_str());
        debug!(conn_id = conn.conn_id(), total = self.len(), "connection removed");
    }

    pub fn get(&self, conn_id: u64) -> Result<Arc<Connection>, ConnError> {
        self.get_by_str(&conn_id.to_string())
    }

    pub fn get_by_str(&self, conn_id: &str) -> Result<Arc<Connection>, ConnError> {
        self.conns.get(conn_id).ok_or(ConnError::NotFound)
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Stops every connection in a snapshot. Removal happens in each
    /// connection's own finalizer.
    pub fn clear(&self) {
        let snapshot = self.conns.snapshot();
        info!(count = snapshot.len(), "stopping all connections");
        for (_, conn) in snapshot {
            conn.stop();
        }
    }

    pub fn all_conn_ids(&self) -> Vec<u64> {
        self.conns.keys().iter().filter_map(|k| k.parse().ok()).collect()
    }

    pub fn all_conn_id_strs(&self) -> Vec<String> {
        self.conns.keys()
    }

    /// Visits every live connection under the owning shard's read lock.
    pub fn range<F>(&self, mut f: F)
    where
        F: FnMut(u64, &Arc<Connection>),
    {
        self.conns.for_each(|key, conn| {
            if let Ok(id) = key.parse() {
                f(id, conn);
            }
        });
    }
}
