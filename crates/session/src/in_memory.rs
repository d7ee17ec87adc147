//! In-memory session log, useful for testing and ephemeral sessions.

use async_trait::async_trait;
use blade_core::error::StoreError;
use blade_core::event::{SessionEvent, SessionEventDraft, SessionLog};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Keeps every event of every session in a Vec.
pub struct InMemorySessionLog {
    events: Arc<RwLock<Vec<SessionEvent>>>,
}

impl InMemorySessionLog {
    pub fn new() -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Every event recorded so far, across sessions.
    pub async fn all(&self) -> Vec<SessionEvent> {
        self.events.read().await.clone()
    }
}

impl Default for InMemorySessionLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionLog for InMemorySessionLog {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn append(&self, draft: SessionEventDraft) -> Result<SessionEvent, StoreError> {
        let mut events = self.events.write().await;
        let id = events.len() as u64 + 1;
        let event = draft.stamp(id);
        events.push(event.clone());
        Ok(event)
    }

    async fn events(&self, session_id: &str) -> Result<Vec<SessionEvent>, StoreError> {
        let events = self.events.read().await;
        Ok(events
            .iter()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blade_core::event::SessionEventKind;

    fn created(session: &str) -> SessionEventDraft {
        SessionEventDraft {
            session_id: session.into(),
            cwd: "/work".into(),
            git_branch: None,
            kind: SessionEventKind::SessionCreated {
                user_id: None,
                parent_session_id: None,
                subagent_type: None,
                is_sidechain: false,
            },
        }
    }

    #[tokio::test]
    async fn ids_are_monotonic() {
        let log = InMemorySessionLog::new();
        let a = log.append(created("s1")).await.unwrap();
        let b = log.append(created("s2")).await.unwrap();
        let c = log.append(created("s1")).await.unwrap();
        assert!(a.id < b.id && b.id < c.id);
    }

    #[tokio::test]
    async fn events_filter_by_session() {
        let log = InMemorySessionLog::new();
        log.append(created("s1")).await.unwrap();
        log.append(created("s2")).await.unwrap();
        log.append(created("s1")).await.unwrap();

        let s1 = log.events("s1").await.unwrap();
        assert_eq!(s1.len(), 2);
        assert!(s1.iter().all(|e| e.session_id == "s1"));
        assert_eq!(log.all().await.len(), 3);
        assert!(log.events("missing").await.unwrap().is_empty());
    }
}
