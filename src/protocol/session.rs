//! Sessions negotiated per connection.

use std::sync::Arc;

use dashmap::DashMap;

/// Negotiated connection parameters addressed by a session id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub session_id: u32,
    pub serialization: u8,
    pub compression: u8,
}

/// Sessions known to one channel.
#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: DashMap<u32, Arc<Session>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, session: Session) -> Arc<Session> {
        let session = Arc::new(session);
        self.sessions.insert(session.session_id, session.clone());
        session
    }

    pub fn get(&self, session_id: u32) -> Option<Arc<Session>> {
        self.sessions.get(&session_id).map(|s| s.value().clone())
    }

    pub fn remove(&self, session_id: u32) -> Option<Arc<Session>> {
        self.sessions.remove(&session_id).map(|(_, s)| s)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
