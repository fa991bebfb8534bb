//! Process-local session store.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::connector::Key;
use crate::error::{ReconcileError, Result};
use crate::session::Session;
use crate::state::backend::SessionStore;

/// Keeps sessions in memory for the lifetime of the store.
pub struct MemorySessionStore<K> {
    sessions: Mutex<HashMap<String, Session<K>>>,
}

impl<K> MemorySessionStore<K> {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Session<K>>>> {
        self.sessions
            .lock()
            .map_err(|_| ReconcileError::State("session store lock poisoned".to_string()))
    }
}

impl<K> Default for MemorySessionStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K: Key> SessionStore<K> for MemorySessionStore<K> {
    async fn load(&self, job_id: &str) -> Result<Option<Session<K>>> {
        Ok(self.lock()?.get(job_id).cloned())
    }

    async fn save(&self, session: &Session<K>) -> Result<()> {
        self.lock()?.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn remove(&self, job_id: &str) -> Result<bool> {
        Ok(self.lock()?.remove(job_id).is_some())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
