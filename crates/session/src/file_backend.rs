//! File-based session log: persistent JSON-lines storage.
//!
//! Each session gets its own `<session_id>.jsonl` file under the log
//! directory. Every line is one JSON-encoded `SessionEvent`, appended and
//! flushed before `append` returns, so a crash mid-turn loses at most the
//! event being written.
//!
//! Storage location: `~/.blade/sessions/` unless configured otherwise.

use async_trait::async_trait;
use blade_core::error::StoreError;
use blade_core::event::{SessionEvent, SessionEventDraft, SessionLog};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// A file-backed session log using one JSONL file per session.
///
/// Event ids are monotonic per session file. The next id is recovered from
/// the file the first time a session is touched.
pub struct JsonlSessionLog {
    dir: PathBuf,
    next_ids: Mutex<HashMap<String, u64>>,
}

impl JsonlSessionLog {
    /// Create a log rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        debug!(dir = %dir.display(), "JSONL session log opened");
        Self {
            dir,
            next_ids: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a session's log file.
    pub fn session_path(&self, session_id: &str) -> Result<PathBuf, StoreError> {
        let valid = !session_id.is_empty()
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::Storage(format!(
                "invalid session id '{session_id}'"
            )));
        }
        Ok(self.dir.join(format!("{session_id}.jsonl")))
    }

    /// Load events from a JSONL file, skipping corrupted lines.
    async fn load_from_disk(path: &Path) -> Vec<SessionEvent> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(_) => return Vec::new(), // File doesn't exist yet
        };

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<SessionEvent>(line) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping corrupted session event");
                    None
                }
            })
            .collect()
    }

    /// Append one line to the session file.
    async fn write_line(path: &Path, event: &SessionEvent) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                StoreError::Storage(format!("Failed to create session directory: {e}"))
            })?;
        }

        let mut line = serde_json::to_string(event)
            .map_err(|e| StoreError::Storage(format!("Failed to serialize session event: {e}")))?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to open session file: {e}")))?;

        file.write_all(line.as_bytes())
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to write session file: {e}")))?;
        file.flush()
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to write session file: {e}")))
    }
}

#[async_trait]
impl SessionLog for JsonlSessionLog {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn append(&self, draft: SessionEventDraft) -> Result<SessionEvent, StoreError> {
        let path = self.session_path(&draft.session_id)?;

        // The lock also serializes writers so lines never interleave
        let mut next_ids = self.next_ids.lock().await;
        let next = match next_ids.get(&draft.session_id) {
            Some(id) => *id,
            None => {
                Self::load_from_disk(&path)
                    .await
                    .iter()
                    .map(|e| e.id)
                    .max()
                    .unwrap_or(0)
                    + 1
            }
        };

        let event = draft.stamp(next);
        Self::write_line(&path, &event).await?;
        next_ids.insert(event.session_id.clone(), next + 1);
        Ok(event)
    }

    async fn events(&self, session_id: &str) -> Result<Vec<SessionEvent>, StoreError> {
        let path = self.session_path(session_id)?;
        let _guard = self.next_ids.lock().await;
        Ok(Self::load_from_disk(&path).await)
    }
}
