//! No-op session log that disables persistence entirely.

use async_trait::async_trait;
use blade_core::error::StoreError;
use blade_core::event::{SessionEvent, SessionEventDraft, SessionLog};
use std::sync::atomic::{AtomicU64, Ordering};

/// Stamps events and drops them.
#[derive(Default)]
pub struct NoopSessionLog {
    next_id: AtomicU64,
}

#[async_trait]
impl SessionLog for NoopSessionLog {
    fn name(&self) -> &str {
        "none"
    }

    async fn append(&self, draft: SessionEventDraft) -> Result<SessionEvent, StoreError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(draft.stamp(id))
    }

    async fn events(&self, _session_id: &str) -> Result<Vec<SessionEvent>, StoreError> {
        Ok(Vec::new())
    }
}
