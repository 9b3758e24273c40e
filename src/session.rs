//! Session registry
//!
//! Owns session identity and the lifecycle state machine. Every
//! committed change is persisted through the store first, then
//! announced on the bus.

use crate::bus::{Event, EventBus, EventType};
use crate::error::{HitlError, Result};
use crate::store::Store;
use crate::types::{ConversationEvent, Session, SessionStatus};
use std::sync::Arc;

/// Session lifecycle front end over the store
#[derive(Clone)]
pub struct SessionRegistry {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn Store>, bus: Arc<EventBus>) -> Self {
        Self { store, bus }
    }

    /// Create a session in `Starting` when `start` is set, `Draft` otherwise
    pub async fn create_session(
        &self,
        query: impl Into<String>,
        working_dir: impl Into<String>,
        start: bool,
    ) -> Result<Session> {
        let status = if start {
            SessionStatus::Starting
        } else {
            SessionStatus::Draft
        };
        let session = Session::new(query, working_dir, status);
        self.store.create_session(&session).await?;

        tracing::info!(session_id = %session.id, status = %status, "Session created");

        self.bus.publish(
            Event::new(EventType::SessionCreated)
                .with("session_id", session.id.clone())
                .with("status", status.as_str())
                .with("working_dir", session.working_dir.clone()),
        );

        Ok(session)
    }

    /// Move a session to `new_status`
    ///
    /// Re-reads and retries when a concurrent writer changed the status
    /// between the read and the compare-and-set. Setting the current
    /// status again is a no-op and publishes nothing.
    pub async fn update_status(&self, id: &str, new_status: SessionStatus) -> Result<Session> {
        loop {
            let current = self.store.get_session(id).await?;
            if current.status == new_status {
                return Ok(current);
            }
            if !current.status.can_transition_to(new_status) {
                return Err(HitlError::InvalidTransition {
                    from: current.status,
                    to: new_status,
                });
            }

            match self
                .store
                .update_session_status(id, current.status, new_status)
                .await?
            {
                Some(updated) => {
                    tracing::info!(
                        session_id = %id,
                        from = %current.status,
                        to = %new_status,
                        "Session status changed"
                    );
                    self.bus.publish(
                        Event::new(EventType::SessionStatusChanged)
                            .with("session_id", id)
                            .with("old_status", current.status.as_str())
                            .with("new_status", new_status.as_str()),
                    );
                    return Ok(updated);
                }
                None => {
                    tracing::debug!(
                        session_id = %id,
                        "Session status changed concurrently, retrying"
                    );
                }
            }
        }
    }

    /// Move to `new_status` only if the session is currently in `expected`
    ///
    /// Returns `Ok(None)` without error when the session is elsewhere.
    /// Used for best-effort couplings that must not clobber a newer state.
    pub async fn transition_if(
        &self,
        id: &str,
        expected: SessionStatus,
        new_status: SessionStatus,
    ) -> Result<Option<Session>> {
        if !expected.can_transition_to(new_status) {
            return Err(HitlError::InvalidTransition {
                from: expected,
                to: new_status,
            });
        }

        let updated = self
            .store
            .update_session_status(id, expected, new_status)
            .await?;

        if updated.is_some() {
            tracing::debug!(
                session_id = %id,
                from = %expected,
                to = %new_status,
                "Session status changed"
            );
            self.bus.publish(
                Event::new(EventType::SessionStatusChanged)
                    .with("session_id", id)
                    .with("old_status", expected.as_str())
                    .with("new_status", new_status.as_str()),
            );
        }
        Ok(updated)
    }

    pub async fn get(&self, id: &str) -> Result<Session> {
        self.store.get_session(id).await
    }

    pub async fn list(&self) -> Result<Vec<Session>> {
        self.store.list_sessions().await
    }

    /// Replace the session summary
    pub async fn set_summary(&self, id: &str, summary: &str) -> Result<Session> {
        let session = self.store.update_session_summary(id, summary).await?;
        self.bus.publish(
            Event::new(EventType::SessionUpdated)
                .with("session_id", id)
                .with("summary", summary),
        );
        Ok(session)
    }

    /// Append to the session's conversation log
    pub async fn record_conversation(&self, event: ConversationEvent) -> Result<()> {
        let session_id = event.session_id.clone();
        let kind = serde_json::to_value(event.kind)?;
        self.store.append_conversation_event(event).await?;
        self.bus.publish(
            Event::new(EventType::ConversationUpdated)
                .with("session_id", session_id)
                .with("kind", kind),
        );
        Ok(())
    }

    pub async fn conversation(&self, id: &str) -> Result<Vec<ConversationEvent>> {
        self.store.conversation(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventFilter;
    use crate::store::MemoryStore;
    use tokio_util::sync::CancellationToken;

    fn registry() -> (SessionRegistry, Arc<EventBus>) {
        let bus = Arc::new(EventBus::default());
        let registry = SessionRegistry::new(Arc::new(MemoryStore::new()), bus.clone());
        (registry, bus)
    }

    #[tokio::test]
    async fn test_create_draft_or_starting() {
        let (registry, _) = registry();

        let draft = registry.create_session("q", "/tmp", false).await.unwrap();
        assert_eq!(draft.status, SessionStatus::Draft);

        let started = registry.create_session("q", "/tmp", true).await.unwrap();
        assert_eq!(started.status, SessionStatus::Starting);
        assert!(started.id.starts_with("sess-"));

        assert_eq!(registry.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_update_status_publishes_event() {
        let (registry, bus) = registry();
        let session = registry.create_session("q", "", true).await.unwrap();

        let cancel = CancellationToken::new();
        let mut sub = bus.subscribe(
            cancel.clone(),
            EventFilter::types([EventType::SessionStatusChanged]),
        );

        let updated = registry
            .update_status(&session.id, SessionStatus::Running)
            .await
            .unwrap();
        assert_eq!(updated.status, SessionStatus::Running);

        let event = sub.try_recv().unwrap();
        assert_eq!(event.session_id(), Some(session.id.as_str()));
        assert_eq!(event.str_field("old_status"), Some("starting"));
        assert_eq!(event.str_field("new_status"), Some("running"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_completed_to_running_rejected() {
        let (registry, _) = registry();
        let session = registry.create_session("q", "", true).await.unwrap();
        registry
            .update_status(&session.id, SessionStatus::Completed)
            .await
            .unwrap();

        let err = registry
            .update_status(&session.id, SessionStatus::Running)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HitlError::InvalidTransition {
                from: SessionStatus::Completed,
                to: SessionStatus::Running
            }
        ));
        assert_eq!(
            registry.get(&session.id).await.unwrap().status,
            SessionStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_same_status_is_noop() {
        let (registry, bus) = registry();
        let session = registry.create_session("q", "", false).await.unwrap();

        let cancel = CancellationToken::new();
        let mut sub = bus.subscribe(cancel.clone(), EventFilter::all());

        registry
            .update_status(&session.id, SessionStatus::Draft)
            .await
            .unwrap();
        assert!(sub.try_recv().is_none());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_resume_and_discard() {
        let (registry, _) = registry();
        let session = registry.create_session("q", "", true).await.unwrap();

        for status in [
            SessionStatus::Running,
            SessionStatus::Interrupting,
            SessionStatus::Interrupted,
            SessionStatus::Running,
            SessionStatus::Discarded,
        ] {
            registry.update_status(&session.id, status).await.unwrap();
        }

        let err = registry
            .update_status(&session.id, SessionStatus::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, HitlError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_transition_if_skips_when_elsewhere() {
        let (registry, _) = registry();
        let session = registry.create_session("q", "", true).await.unwrap();

        let skipped = registry
            .transition_if(&session.id, SessionStatus::Running, SessionStatus::WaitingInput)
            .await
            .unwrap();
        assert!(skipped.is_none());
        assert_eq!(
            registry.get(&session.id).await.unwrap().status,
            SessionStatus::Starting
        );
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let (registry, _) = registry();
        let err = registry
            .update_status("sess-missing", SessionStatus::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, HitlError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_summary_and_conversation() {
        let (registry, _) = registry();
        let session = registry.create_session("q", "", true).await.unwrap();

        let updated = registry.set_summary(&session.id, "Fix flaky test").await.unwrap();
        assert_eq!(updated.summary.as_deref(), Some("Fix flaky test"));

        registry
            .record_conversation(ConversationEvent::message(&session.id, "user", "go"))
            .await
            .unwrap();
        assert_eq!(registry.conversation(&session.id).await.unwrap().len(), 1);
    }
}
