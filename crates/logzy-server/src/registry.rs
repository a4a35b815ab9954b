//! Process-wide session registry.
//!
//! Assigns session ids from a single counter and keeps the live sessions
//! addressable by id. The map lock is never held across an await; closing
//! sessions happens after they have been taken out of the map.

use std::collections::HashMap;
use std::sync::Arc;

use logzy_core::{DataSource, SessionId};
use metrics::gauge;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::errors::RegistryError;
use crate::metrics::SESSIONS_ACTIVE;
use crate::relay::OutboundSender;
use crate::session::{ClientSession, SessionConfig};

#[derive(Default)]
struct Inner {
    next_id: u64,
    sessions: HashMap<SessionId, Arc<ClientSession>>,
}

/// Creates, tracks and removes [`ClientSession`]s.
pub struct SessionRegistry {
    inner: Mutex<Inner>,
    source: Arc<dyn DataSource>,
    config: SessionConfig,
    max_sessions: usize,
}

impl SessionRegistry {
    /// Empty registry handing `source` to every session it creates.
    pub fn new(source: Arc<dyn DataSource>, config: SessionConfig, max_sessions: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            source,
            config,
            max_sessions,
        }
    }

    /// Register a new session whose output goes to `emit`.
    ///
    /// Ids start at 1 and increase by one per successful creation. A
    /// rejected creation does not consume an id.
    pub fn create_session(&self, emit: OutboundSender) -> Result<Arc<ClientSession>, RegistryError> {
        let mut inner = self.inner.lock();
        if inner.sessions.len() >= self.max_sessions {
            return Err(RegistryError::CapacityReached {
                limit: self.max_sessions,
            });
        }

        inner.next_id += 1;
        let id = SessionId::from_raw(inner.next_id);
        let session = Arc::new(ClientSession::new(id, self.source.clone(), emit, self.config));
        let _ = inner.sessions.insert(id, session.clone());
        gauge!(SESSIONS_ACTIVE).set(inner.sessions.len() as f64);
        debug!(session_id = %id, active = inner.sessions.len(), "session registered");
        Ok(session)
    }

    /// Look up a live session.
    pub fn get(&self, id: SessionId) -> Option<Arc<ClientSession>> {
        self.inner.lock().sessions.get(&id).cloned()
    }

    /// Forget a session. Does not close it.
    pub fn remove(&self, id: SessionId) -> Option<Arc<ClientSession>> {
        let mut inner = self.inner.lock();
        let removed = inner.sessions.remove(&id);
        if removed.is_some() {
            gauge!(SESSIONS_ACTIVE).set(inner.sessions.len() as f64);
            debug!(session_id = %id, active = inner.sessions.len(), "session removed");
        }
        removed
    }

    /// Number of live sessions.
    pub fn count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// Ids of live sessions, ascending.
    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.inner.lock().sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Remove and close every session. Returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let sessions: Vec<_> = {
            let mut inner = self.inner.lock();
            inner.sessions.drain().map(|(_, s)| s).collect()
        };
        gauge!(SESSIONS_ACTIVE).set(0.0);

        let closed = futures::future::join_all(sessions.iter().map(|s| s.close())).await;
        let count = closed.into_iter().filter(|c| *c).count();
        info!(count, "closed all sessions");
        count
    }
}
