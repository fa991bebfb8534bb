//! Session store that keeps nothing.
//!
//! Every run starts fresh and cannot be resumed if interrupted.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::warn;

use crate::connector::Key;
use crate::error::Result;
use crate::session::Session;
use crate::state::backend::SessionStore;

/// No-op session store. Logs a warning on first save.
pub struct NoOpSessionStore<K> {
    warned: AtomicBool,
    _key: PhantomData<fn() -> K>,
}

impl<K> NoOpSessionStore<K> {
    pub fn new() -> Self {
        Self {
            warned: AtomicBool::new(false),
            _key: PhantomData,
        }
    }

    fn warn_once(&self) {
        if !self.warned.swap(true, Ordering::SeqCst) {
            warn!(
                "Using no-op session store: progress will not be persisted \
                 and the job cannot be resumed."
            );
        }
    }
}

impl<K> Default for NoOpSessionStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K: Key> SessionStore<K> for NoOpSessionStore<K> {
    async fn load(&self, _job_id: &str) -> Result<Option<Session<K>>> {
        Ok(None)
    }

    async fn save(&self, _session: &Session<K>) -> Result<()> {
        self.warn_once();
        Ok(())
    }

    async fn remove(&self, _job_id: &str) -> Result<bool> {
        Ok(false)
    }

    fn backend_type(&self) -> &'static str {
        "noop"
    }
}
