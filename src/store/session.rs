use std::sync::{Arc, Mutex};

use lru_time_cache::LruCache;
use tracing::debug;

use crate::rtc::RecordingSession;

// Well above any realistic session concurrency; eviction of a live session
// is a misconfiguration, not a code path.
const REGISTRY_CAPACITY: usize = 2000;

/// Bounded map of active recording sessions, shared between the HTTP
/// handlers and the session close hook.
pub struct SessionRegistry {
    sessions: Mutex<LruCache<String, Arc<dyn RecordingSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(LruCache::with_capacity(REGISTRY_CAPACITY)),
        }
    }

    pub fn add(&self, id: String, session: Arc<dyn RecordingSession>) {
        debug!(session = %id, "adding session to registry");
        self.sessions.lock().unwrap().insert(id, session);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn RecordingSession>> {
        self.sessions.lock().unwrap().get(id).cloned()
    }

    /// Removes the session. The returned bool doubles as the "I closed it"
    /// token: it is true at most once per id.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self.sessions.lock().unwrap().remove(id).is_some();
        if !removed {
            debug!(session = %id, "session not in registry");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
