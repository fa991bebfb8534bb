//! Session store trait.
//!
//! The [`SessionStore`] trait defines the interface for persisting sessions.
//! The reconciler works with `Arc<dyn SessionStore<K>>` without knowing the
//! concrete type:
//!
//! - **File**: one signed JSON file per job, in `file.rs`
//! - **Memory**: process-local map, in `memory.rs`
//! - **No-op**: nothing is kept, in `noop.rs`

use async_trait::async_trait;

use crate::connector::Key;
use crate::error::{ReconcileError, Result};
use crate::session::Session;

/// Persistence backend for [`Session`]s, keyed by job id.
///
/// Implementations must be `Send + Sync` to allow sharing across async tasks.
#[async_trait]
pub trait SessionStore<K: Key>: Send + Sync {
    /// Load the session of `job_id`, if one was saved.
    async fn load(&self, job_id: &str) -> Result<Option<Session<K>>>;

    /// Save a session, replacing any previous one for the same job.
    async fn save(&self, session: &Session<K>) -> Result<()>;

    /// Discard the session of `job_id`. Returns whether one existed.
    async fn remove(&self, job_id: &str) -> Result<bool>;

    /// Get the backend type name for logging/debugging.
    fn backend_type(&self) -> &'static str;
}

/// Reject job ids that cannot be used as a storage key.
pub fn validate_job_id(job_id: &str) -> Result<()> {
    let valid = !job_id.is_empty()
        && job_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !job_id.starts_with('.');
    if !valid {
        return Err(ReconcileError::State(format!(
            "Invalid job id '{}': use letters, digits, '-', '_' or '.'",
            job_id
        )));
    }
    Ok(())
}
