//! JSON snapshot store
//!
//! Keeps the full state in memory and rewrites a single JSON snapshot
//! after every mutation. Writes go to a temp file that is renamed over
//! the snapshot, so a crash never leaves a torn file. A mutation whose
//! snapshot cannot be written is rolled back and reported as
//! `StoreUnavailable`: callers never observe a state that is not on disk.

use super::memory::StoreState;
use super::{ApprovalQuery, Store};
use crate::error::{HitlError, Result};
use crate::types::{
    Approval, ApprovalKey, ConversationEvent, Resolution, Session, SessionStatus,
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// File-backed store
pub struct FileStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl FileStore {
    /// Open (or create) the snapshot at `path`
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                HitlError::StoreUnavailable(format!(
                    "Failed to create store directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let mut state = if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let json = tokio::fs::read_to_string(&path).await.map_err(|e| {
                HitlError::StoreUnavailable(format!(
                    "Failed to read store snapshot {}: {}",
                    path.display(),
                    e
                ))
            })?;
            serde_json::from_str::<StoreState>(&json).map_err(|e| {
                HitlError::StoreUnavailable(format!(
                    "Failed to parse store snapshot {}: {}",
                    path.display(),
                    e
                ))
            })?
        } else {
            StoreState::default()
        };
        state.reindex();

        tracing::info!(path = %path.display(), "File store opened");

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, state: &StoreState) -> Result<()> {
        let json = serde_json::to_vec_pretty(state)?;
        let tmp_path = self.path.with_extension("json.tmp");

        let write = async {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            file.write_all(&json).await?;
            file.sync_all().await?;
            tokio::fs::rename(&tmp_path, &self.path).await
        };

        write.await.map_err(|e| {
            HitlError::StoreUnavailable(format!(
                "Failed to write store snapshot {}: {}",
                self.path.display(),
                e
            ))
        })?;

        tracing::trace!(path = %self.path.display(), "Store snapshot written");
        Ok(())
    }

    /// Apply `f` and persist; roll back if either step fails
    async fn mutate<T>(&self, f: impl FnOnce(&mut StoreState) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock().await;
        let before = state.clone();

        let out = match f(&mut state) {
            Ok(out) => out,
            Err(e) => {
                *state = before;
                return Err(e);
            }
        };

        if let Err(e) = self.persist(&state).await {
            *state = before;
            tracing::error!(error = %e, "Store mutation rolled back");
            return Err(e);
        }
        Ok(out)
    }
}

#[async_trait]
impl Store for FileStore {
    async fn create_session(&self, session: &Session) -> Result<()> {
        self.mutate(|s| s.create_session(session)).await
    }

    async fn get_session(&self, id: &str) -> Result<Session> {
        self.state.lock().await.get_session(id)
    }

    async fn list_sessions(&self) -> Result<Vec<Session>> {
        Ok(self.state.lock().await.list_sessions())
    }

    async fn update_session_status(
        &self,
        id: &str,
        expected: SessionStatus,
        next: SessionStatus,
    ) -> Result<Option<Session>> {
        self.mutate(|s| s.update_session_status(id, expected, next))
            .await
    }

    async fn update_session_summary(&self, id: &str, summary: &str) -> Result<Session> {
        self.mutate(|s| s.update_session_summary(id, summary)).await
    }

    async fn create_approval(&self, approval: Approval) -> Result<Approval> {
        self.mutate(|s| s.create_approval(approval)).await
    }

    async fn get_approval(&self, id: &str) -> Result<Approval> {
        self.state
            .lock()
            .await
            .get_approval(&ApprovalKey::Id(id.to_string()))
    }

    async fn get_approval_by_tool_use_id(&self, tool_use_id: &str) -> Result<Approval> {
        self.state
            .lock()
            .await
            .get_approval(&ApprovalKey::ToolUseId(tool_use_id.to_string()))
    }

    async fn list_approvals(&self, query: &ApprovalQuery) -> Result<Vec<Approval>> {
        Ok(self.state.lock().await.list_approvals(query))
    }

    async fn resolve_approval(
        &self,
        key: &ApprovalKey,
        resolution: &Resolution,
    ) -> Result<Approval> {
        self.mutate(|s| s.resolve_approval(key, resolution)).await
    }

    async fn append_conversation_event(&self, event: ConversationEvent) -> Result<()> {
        self.mutate(|s| s.append_conversation_event(event)).await
    }

    async fn conversation(&self, session_id: &str) -> Result<Vec<ConversationEvent>> {
        self.state.lock().await.conversation(session_id)
    }

    async fn health(&self) -> Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        tokio::fs::metadata(dir).await.map_err(|e| {
            HitlError::StoreUnavailable(format!("{}: {}", dir.display(), e))
        })?;
        Ok(())
    }

    fn backend_name(&self) -> &str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ApprovalStatus;

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let session = Session::new("add tests", "/tmp/repo", SessionStatus::Running);
        {
            let store = FileStore::open(&path).await.unwrap();
            store.create_session(&session).await.unwrap();
            store
                .create_approval(Approval::pending(
                    &session.id,
                    "t1",
                    "Bash",
                    serde_json::json!({"command": "ls"}),
                ))
                .await
                .unwrap();
            store
                .resolve_approval(
                    &ApprovalKey::ToolUseId("t1".into()),
                    &Resolution::deny("not now"),
                )
                .await
                .unwrap();
        }

        let reopened = FileStore::open(&path).await.unwrap();
        assert_eq!(reopened.get_session(&session.id).await.unwrap().query, "add tests");

        // tool-use index is rebuilt on load
        let approval = reopened.get_approval_by_tool_use_id("t1").await.unwrap();
        assert_eq!(approval.status, ApprovalStatus::Denied);
        assert_eq!(approval.comment.as_deref(), Some("not now"));
    }

    #[tokio::test]
    async fn test_no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = FileStore::open(&path).await.unwrap();

        store
            .create_session(&Session::new("q", "", SessionStatus::Draft))
            .await
            .unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deep/store.json");
        let store = FileStore::open(&path).await.unwrap();
        store
            .create_session(&Session::new("q", "", SessionStatus::Draft))
            .await
            .unwrap();
        assert!(path.exists());
        store.health().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_write_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = FileStore::open(&path).await.unwrap();
        let session = Session::new("q", "", SessionStatus::Running);
        store.create_session(&session).await.unwrap();

        // a directory where the temp file should go makes the write fail
        std::fs::create_dir(path.with_extension("json.tmp")).unwrap();

        let err = store
            .create_approval(Approval::pending(&session.id, "t1", "Bash", serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, HitlError::StoreUnavailable(_)));

        let missing = store.get_approval_by_tool_use_id("t1").await.unwrap_err();
        assert!(matches!(missing, HitlError::ApprovalNotFound(_)));
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = FileStore::open(&path).await.err().unwrap();
        assert!(matches!(err, HitlError::StoreUnavailable(_)));
    }
}
