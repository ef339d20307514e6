use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::conn::Conn;

/// Concurrency-safe map of live connections keyed by raw fd.
///
/// Mutations are mutually exclusive; lookups run concurrently with each
/// other. At most one live connection exists per fd at any time.
pub struct ConnRegistry {
    conns: RwLock<HashMap<RawFd, Arc<Conn>>>,
}

impl ConnRegistry {
    pub fn new() -> Self {
        ConnRegistry {
            conns: RwLock::new(HashMap::new()),
        }
    }

    /// Inserts `conn` under `fd`. A displaced occupant is closed first, so an
    /// fd recycled by the OS between accept and bookkeeping cannot leak.
    pub fn add(&self, fd: RawFd, conn: Arc<Conn>) {
        let mut conns = self.conns.write().unwrap();
        if let Some(old) = conns.insert(fd, conn) {
            old.close();
        }
    }

    /// Closes and evicts the entry, returning it. `None` when absent; removal
    /// is the exactly-once gate every teardown path goes through, so a stale
    /// event for an already-evicted fd simply finds nothing here.
    pub fn remove(&self, fd: RawFd) -> Option<Arc<Conn>> {
        let conn = self.conns.write().unwrap().remove(&fd)?;
        conn.close();
        Some(conn)
    }

    /// Shared-lock lookup. Absence is a benign race with teardown, not an
    /// error.
    pub fn get(&self, fd: RawFd) -> Option<Arc<Conn>> {
        self.conns.read().unwrap().get(&fd).cloned()
    }

    pub fn len(&self) -> usize {
        self.conns.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Collects the fds whose inactivity has reached `idle_limit` as of
    /// `now`. The owning multiplexer turns them into synthetic close events,
    /// so timeouts share the normal teardown path. Takes only the shared
    /// lock and therefore cannot deadlock against live-traffic mutation.
    pub fn sweep_idle(&self, now: i64, idle_limit: Duration) -> Vec<RawFd> {
        let limit = idle_limit.as_secs() as i64;
        let conns = self.conns.read().unwrap();
        conns
            .iter()
            .filter(|(_, conn)| now - conn.last_active() >= limit)
            .map(|(&fd, _)| fd)
            .collect()
    }
}

impl Default for ConnRegistry {
    fn default() -> Self {
        Self::new()
    }
}
