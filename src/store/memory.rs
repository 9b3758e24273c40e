//! In-memory store
//!
//! `StoreState` holds the maps and implements every store operation as a
//! plain synchronous method; `MemoryStore` and `FileStore` both run
//! those methods under their own lock.

use super::{ApprovalQuery, Store};
use crate::error::{HitlError, Result};
use crate::types::{
    Approval, ApprovalKey, ConversationEvent, Resolution, Session, SessionStatus,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StoreState {
    #[serde(default)]
    sessions: HashMap<String, Session>,

    #[serde(default)]
    approvals: HashMap<String, Approval>,

    #[serde(default)]
    conversations: HashMap<String, Vec<ConversationEvent>>,

    /// tool_use_id → approval id
    #[serde(skip)]
    tool_use_index: HashMap<String, String>,
}

impl StoreState {
    /// Rebuild derived indexes after deserialization
    pub(crate) fn reindex(&mut self) {
        self.tool_use_index = self
            .approvals
            .values()
            .map(|a| (a.tool_use_id.clone(), a.id.clone()))
            .collect();
    }

    pub(crate) fn create_session(&mut self, session: &Session) -> Result<()> {
        if self.sessions.contains_key(&session.id) {
            return Err(HitlError::InvalidRequest(format!(
                "Session already exists: {}",
                session.id
            )));
        }
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    pub(crate) fn get_session(&self, id: &str) -> Result<Session> {
        self.sessions
            .get(id)
            .cloned()
            .ok_or_else(|| HitlError::SessionNotFound(id.to_string()))
    }

    pub(crate) fn list_sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    pub(crate) fn update_session_status(
        &mut self,
        id: &str,
        expected: SessionStatus,
        next: SessionStatus,
    ) -> Result<Option<Session>> {
        let session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| HitlError::SessionNotFound(id.to_string()))?;

        if session.status != expected {
            return Ok(None);
        }
        session.status = next;
        session.updated_at = Utc::now();
        Ok(Some(session.clone()))
    }

    pub(crate) fn update_session_summary(&mut self, id: &str, summary: &str) -> Result<Session> {
        let session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| HitlError::SessionNotFound(id.to_string()))?;
        session.summary = Some(summary.to_string());
        session.updated_at = Utc::now();
        Ok(session.clone())
    }

    pub(crate) fn create_approval(&mut self, approval: Approval) -> Result<Approval> {
        if let Some(existing_id) = self.tool_use_index.get(&approval.tool_use_id) {
            if let Some(existing) = self.approvals.get(existing_id) {
                return Ok(existing.clone());
            }
        }
        if !self.sessions.contains_key(&approval.session_id) {
            return Err(HitlError::SessionNotFound(approval.session_id.clone()));
        }
        self.tool_use_index
            .insert(approval.tool_use_id.clone(), approval.id.clone());
        self.approvals.insert(approval.id.clone(), approval.clone());
        Ok(approval)
    }

    fn approval_id(&self, key: &ApprovalKey) -> Result<String> {
        let found = match key {
            ApprovalKey::Id(id) => self.approvals.contains_key(id).then(|| id.clone()),
            ApprovalKey::ToolUseId(tool_use_id) => self.tool_use_index.get(tool_use_id).cloned(),
            ApprovalKey::Any(raw) if self.approvals.contains_key(raw) => Some(raw.clone()),
            ApprovalKey::Any(raw) => self.tool_use_index.get(raw).cloned(),
        };
        found.ok_or_else(|| HitlError::ApprovalNotFound(key.as_str().to_string()))
    }

    pub(crate) fn get_approval(&self, key: &ApprovalKey) -> Result<Approval> {
        let id = self.approval_id(key)?;
        self.approvals
            .get(&id)
            .cloned()
            .ok_or_else(|| HitlError::ApprovalNotFound(key.as_str().to_string()))
    }

    pub(crate) fn list_approvals(&self, query: &ApprovalQuery) -> Vec<Approval> {
        let mut approvals: Vec<Approval> = self
            .approvals
            .values()
            .filter(|a| query.matches(a))
            .cloned()
            .collect();
        approvals.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        approvals
    }

    pub(crate) fn resolve_approval(
        &mut self,
        key: &ApprovalKey,
        resolution: &Resolution,
    ) -> Result<Approval> {
        let id = self.approval_id(key)?;
        let approval = self
            .approvals
            .get_mut(&id)
            .ok_or_else(|| HitlError::ApprovalNotFound(key.as_str().to_string()))?;

        if !approval.is_pending() {
            return Err(HitlError::AlreadyResolved(approval.tool_use_id.clone()));
        }
        approval.resolve(resolution);
        Ok(approval.clone())
    }

    pub(crate) fn append_conversation_event(&mut self, event: ConversationEvent) -> Result<()> {
        if !self.sessions.contains_key(&event.session_id) {
            return Err(HitlError::SessionNotFound(event.session_id.clone()));
        }
        self.conversations
            .entry(event.session_id.clone())
            .or_default()
            .push(event);
        Ok(())
    }

    pub(crate) fn conversation(&self, session_id: &str) -> Result<Vec<ConversationEvent>> {
        if !self.sessions.contains_key(session_id) {
            return Err(HitlError::SessionNotFound(session_id.to_string()));
        }
        Ok(self
            .conversations
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Process-local store
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_session(&self, session: &Session) -> Result<()> {
        self.state.write().await.create_session(session)
    }

    async fn get_session(&self, id: &str) -> Result<Session> {
        self.state.read().await.get_session(id)
    }

    async fn list_sessions(&self) -> Result<Vec<Session>> {
        Ok(self.state.read().await.list_sessions())
    }

    async fn update_session_status(
        &self,
        id: &str,
        expected: SessionStatus,
        next: SessionStatus,
    ) -> Result<Option<Session>> {
        self.state
            .write()
            .await
            .update_session_status(id, expected, next)
    }

    async fn update_session_summary(&self, id: &str, summary: &str) -> Result<Session> {
        self.state.write().await.update_session_summary(id, summary)
    }

    async fn create_approval(&self, approval: Approval) -> Result<Approval> {
        self.state.write().await.create_approval(approval)
    }

    async fn get_approval(&self, id: &str) -> Result<Approval> {
        self.state
            .read()
            .await
            .get_approval(&ApprovalKey::Id(id.to_string()))
    }

    async fn get_approval_by_tool_use_id(&self, tool_use_id: &str) -> Result<Approval> {
        self.state
            .read()
            .await
            .get_approval(&ApprovalKey::ToolUseId(tool_use_id.to_string()))
    }

    async fn list_approvals(&self, query: &ApprovalQuery) -> Result<Vec<Approval>> {
        Ok(self.state.read().await.list_approvals(query))
    }

    async fn resolve_approval(
        &self,
        key: &ApprovalKey,
        resolution: &Resolution,
    ) -> Result<Approval> {
        self.state.write().await.resolve_approval(key, resolution)
    }

    async fn append_conversation_event(&self, event: ConversationEvent) -> Result<()> {
        self.state.write().await.append_conversation_event(event)
    }

    async fn conversation(&self, session_id: &str) -> Result<Vec<ConversationEvent>> {
        self.state.read().await.conversation(session_id)
    }

    fn backend_name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ApprovalStatus;
    use std::sync::Arc;

    async fn store_with_session() -> (MemoryStore, Session) {
        let store = MemoryStore::new();
        let session = Session::new("refactor parser", "/tmp/repo", SessionStatus::Running);
        store.create_session(&session).await.unwrap();
        (store, session)
    }

    #[tokio::test]
    async fn test_session_crud() {
        let (store, session) = store_with_session().await;

        let loaded = store.get_session(&session.id).await.unwrap();
        assert_eq!(loaded, session);
        assert_eq!(store.list_sessions().await.unwrap().len(), 1);

        let updated = store
            .update_session_summary(&session.id, "Parser refactor")
            .await
            .unwrap();
        assert_eq!(updated.summary.as_deref(), Some("Parser refactor"));

        let err = store.get_session("sess-missing").await.unwrap_err();
        assert!(matches!(err, HitlError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_status_compare_and_set() {
        let (store, session) = store_with_session().await;

        let stale = store
            .update_session_status(&session.id, SessionStatus::Starting, SessionStatus::Completed)
            .await
            .unwrap();
        assert!(stale.is_none());

        let updated = store
            .update_session_status(&session.id, SessionStatus::Running, SessionStatus::Completed)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_create_approval_is_insert_if_absent() {
        let (store, session) = store_with_session().await;

        let first = store
            .create_approval(Approval::pending(&session.id, "t1", "Bash", serde_json::json!({})))
            .await
            .unwrap();
        let second = store
            .create_approval(Approval::pending(&session.id, "t1", "Bash", serde_json::json!({})))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(store.list_approvals(&ApprovalQuery::default()).await.unwrap().len(), 1);
        assert_eq!(
            store.get_approval_by_tool_use_id("t1").await.unwrap().id,
            first.id
        );
    }

    #[tokio::test]
    async fn test_create_approval_unknown_session() {
        let store = MemoryStore::new();
        let err = store
            .create_approval(Approval::pending("sess-nope", "t1", "Bash", serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, HitlError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_resolve_only_once() {
        let (store, session) = store_with_session().await;
        let approval = store
            .create_approval(Approval::pending(&session.id, "t1", "Bash", serde_json::json!({})))
            .await
            .unwrap();

        let resolved = store
            .resolve_approval(&ApprovalKey::Id(approval.id.clone()), &Resolution::approve())
            .await
            .unwrap();
        assert_eq!(resolved.status, ApprovalStatus::Approved);

        let err = store
            .resolve_approval(&ApprovalKey::ToolUseId("t1".into()), &Resolution::deny("no"))
            .await
            .unwrap_err();
        assert!(err.is_already_resolved());
        assert_eq!(
            store.get_approval(&approval.id).await.unwrap().status,
            ApprovalStatus::Approved
        );
    }

    #[tokio::test]
    async fn test_any_key_prefers_approval_id() {
        let (store, session) = store_with_session().await;
        // agent-chosen id that looks like an approval id
        let approval = store
            .create_approval(Approval::pending(
                &session.id,
                "appr-agent-1",
                "Bash",
                serde_json::json!({}),
            ))
            .await
            .unwrap();

        let resolved = store
            .resolve_approval(&ApprovalKey::parse("appr-agent-1"), &Resolution::approve())
            .await
            .unwrap();
        assert_eq!(resolved.id, approval.id);

        let other = store
            .create_approval(Approval::pending(&session.id, "t2", "Bash", serde_json::json!({})))
            .await
            .unwrap();
        let resolved = store
            .resolve_approval(&ApprovalKey::parse(&other.id), &Resolution::deny("no"))
            .await
            .unwrap();
        assert_eq!(resolved.tool_use_id, "t2");

        let err = store
            .resolve_approval(&ApprovalKey::parse("appr-missing"), &Resolution::approve())
            .await
            .unwrap_err();
        assert!(matches!(err, HitlError::ApprovalNotFound(_)));
    }

    #[tokio::test]
    async fn test_concurrent_resolve_single_winner() {
        let (store, session) = store_with_session().await;
        let store = Arc::new(store);
        store
            .create_approval(Approval::pending(&session.id, "t1", "Bash", serde_json::json!({})))
            .await
            .unwrap();

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    let resolution = if i % 2 == 0 {
                        Resolution::approve()
                    } else {
                        Resolution::deny("no")
                    };
                    store
                        .resolve_approval(&ApprovalKey::ToolUseId("t1".into()), &resolution)
                        .await
                })
            })
            .collect();

        let mut wins = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => wins += 1,
                Err(e) => assert!(e.is_already_resolved()),
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_list_approvals_filters() {
        let (store, session) = store_with_session().await;
        let other = Session::new("other", "", SessionStatus::Running);
        store.create_session(&other).await.unwrap();

        for (sid, tid) in [(&session.id, "a"), (&session.id, "b"), (&other.id, "c")] {
            store
                .create_approval(Approval::pending(sid, tid, "Bash", serde_json::json!({})))
                .await
                .unwrap();
        }
        store
            .resolve_approval(&ApprovalKey::ToolUseId("a".into()), &Resolution::approve())
            .await
            .unwrap();

        let pending = store.list_approvals(&ApprovalQuery::pending()).await.unwrap();
        assert_eq!(pending.len(), 2);

        let mine = store
            .list_approvals(&ApprovalQuery::pending().for_session(&session.id))
            .await
            .unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].tool_use_id, "b");
    }

    #[tokio::test]
    async fn test_conversation_log() {
        let (store, session) = store_with_session().await;
        store
            .append_conversation_event(ConversationEvent::message(&session.id, "user", "hi"))
            .await
            .unwrap();
        store
            .append_conversation_event(ConversationEvent::tool_call(&session.id, "Bash"))
            .await
            .unwrap();

        let log = store.conversation(&session.id).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].tool_name.as_deref(), Some("Bash"));

        let err = store
            .append_conversation_event(ConversationEvent::message("sess-x", "user", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, HitlError::SessionNotFound(_)));
    }
}
