//! Session registry
//!
//! Two concurrent directories over the live connections: by session id
//! (the server-minted handle control calls use) and by numeric
//! connection id. Both live under one lock, so the pair insert and pair
//! remove are atomic by construction.

use crate::webrtc::connection::Connection;
use crate::webrtc::WebRtcError;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Default)]
struct Directories {
    by_conn_id: HashMap<u32, Arc<Connection>>,
    by_session_id: HashMap<String, Arc<Connection>>,
    last_conn_id: u32,
}

#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<Directories>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next connection id: 32-bit wrap-around that skips any id still
    /// live in the registry.
    pub fn allocate_id(&self) -> u32 {
        let mut inner = self.inner.write().unwrap();
        let mut id = inner.last_conn_id.wrapping_add(1);
        while inner.by_conn_id.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        inner.last_conn_id = id;
        id
    }

    /// Insert into both directories. A session-id collision (possible
    /// only by astronomical accident) fails the registration; the caller
    /// must close and discard the connection.
    pub fn register(&self, conn: &Arc<Connection>) -> Result<(), WebRtcError> {
        let mut inner = self.inner.write().unwrap();
        if inner.by_session_id.contains_key(&conn.session_id) {
            return Err(WebRtcError::EngineInternal(format!(
                "session id collision: {}",
                conn.session_id
            )));
        }
        inner.by_conn_id.insert(conn.id, Arc::clone(conn));
        inner.by_session_id.insert(conn.session_id.clone(), Arc::clone(conn));
        Ok(())
    }

    pub fn lookup(&self, session_id: &str) -> Option<Arc<Connection>> {
        self.inner.read().unwrap().by_session_id.get(session_id).cloned()
    }

    /// Point-in-time view, ordered by ascending connection id so list
    /// output is deterministic.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        let inner = self.inner.read().unwrap();
        let mut conns: Vec<Arc<Connection>> = inner.by_conn_id.values().cloned().collect();
        conns.sort_by_key(|c| c.id);
        conns
    }

    /// Remove from both directories.
    pub fn unregister(&self, conn: &Connection) {
        let mut inner = self.inner.write().unwrap();
        inner.by_conn_id.remove(&conn.id);
        inner.by_session_id.remove(&conn.session_id);
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().by_conn_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
