//! File-based session store for resume capability.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::connector::Key;
use crate::error::{ReconcileError, Result};
use crate::session::Session;
use crate::state::backend::{validate_job_id, SessionStore};

/// One pretty-printed JSON file per job, named `<job_id>.json`.
///
/// Files are signed with HMAC-SHA256 on save and verified on load. Writes go
/// to a temp file that is renamed over the previous one.
pub struct FileSessionStore<K> {
    dir: PathBuf,
    _key: PhantomData<fn() -> K>,
}

impl<K> FileSessionStore<K> {
    /// Store sessions under `dir`, created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            _key: PhantomData,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the session file for `job_id`.
    pub fn path_for(&self, job_id: &str) -> Result<PathBuf> {
        validate_job_id(job_id)?;
        Ok(self.dir.join(format!("{}.json", job_id)))
    }
}

#[async_trait]
impl<K: Key> SessionStore<K> for FileSessionStore<K> {
    async fn load(&self, job_id: &str) -> Result<Option<Session<K>>> {
        let path = self.path_for(job_id)?;
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path)?;
        let session: Session<K> = serde_json::from_str(&content)
            .map_err(|e| ReconcileError::State(format!("Invalid session file {:?}: {}", path, e)))?;
        if session.id != job_id {
            return Err(ReconcileError::State(format!(
                "Session file {:?} belongs to job '{}'",
                path, session.id
            )));
        }
        session.verify()?;

        debug!("Loaded session {} from {:?}", job_id, path);
        Ok(Some(session))
    }

    async fn save(&self, session: &Session<K>) -> Result<()> {
        let path = self.path_for(&session.id)?;
        std::fs::create_dir_all(&self.dir)?;

        let mut signed = session.clone();
        signed.sign()?;
        let content = serde_json::to_string_pretty(&signed)
            .map_err(|e| ReconcileError::State(format!("Failed to serialize session: {}", e)))?;

        // Atomic write: write to temp file, then rename
        let temp_path = path.with_extension("json.tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, &path)?;

        Ok(())
    }

    async fn remove(&self, job_id: &str) -> Result<bool> {
        let path = self.path_for(job_id)?;
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path)?;
        Ok(true)
    }

    fn backend_type(&self) -> &'static str {
        "file"
    }
}
