//! Persistence contract for sessions, approvals, and conversation events
//!
//! The coordination core only depends on the narrow `Store` trait.
//! Two backends ship with the crate:
//!
//! - **memory**: process-local maps, used by tests and `--memory` mode
//! - **file**: the same semantics, persisted as a JSON snapshot with
//!   atomic temp-file + rename writes
//!
//! Implementations must make the single-resolution invariant durable:
//! `resolve_approval` is a compare-and-set from `pending`, and
//! `update_session_status` is a compare-and-set on the expected status.

use crate::error::Result;
use crate::types::{
    Approval, ApprovalKey, ConversationEvent, Resolution, Session, SessionStatus,
};
use async_trait::async_trait;

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Approval listing filter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApprovalQuery {
    pub session_id: Option<String>,
    pub pending_only: bool,
}

impl ApprovalQuery {
    pub fn pending() -> Self {
        Self {
            session_id: None,
            pending_only: true,
        }
    }

    pub fn for_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn matches(&self, approval: &Approval) -> bool {
        if self.pending_only && !approval.is_pending() {
            return false;
        }
        match &self.session_id {
            Some(id) => &approval.session_id == id,
            None => true,
        }
    }
}

/// Storage backend for the coordination core
///
/// All methods must be safe to call concurrently.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a new session
    async fn create_session(&self, session: &Session) -> Result<()>;

    /// Fetch a session, `SessionNotFound` if absent
    async fn get_session(&self, id: &str) -> Result<Session>;

    /// All sessions, oldest first
    async fn list_sessions(&self) -> Result<Vec<Session>>;

    /// Set the status to `next` only if it currently equals `expected`
    ///
    /// Returns `None` when the current status differs from `expected`.
    async fn update_session_status(
        &self,
        id: &str,
        expected: SessionStatus,
        next: SessionStatus,
    ) -> Result<Option<Session>>;

    /// Replace the AI-generated summary
    async fn update_session_summary(&self, id: &str, summary: &str) -> Result<Session>;

    /// Insert an approval unless its tool-use id is already recorded
    ///
    /// Returns the canonical record: the new one, or the existing one
    /// with the same tool-use id.
    async fn create_approval(&self, approval: Approval) -> Result<Approval>;

    /// Fetch by approval id, `ApprovalNotFound` if absent
    async fn get_approval(&self, id: &str) -> Result<Approval>;

    /// Fetch by tool-use id, `ApprovalNotFound` if absent
    async fn get_approval_by_tool_use_id(&self, tool_use_id: &str) -> Result<Approval>;

    /// Approvals matching `query`, oldest first
    async fn list_approvals(&self, query: &ApprovalQuery) -> Result<Vec<Approval>>;

    /// Move a pending approval to its resolved state
    ///
    /// Fails with `AlreadyResolved` if the approval is no longer pending;
    /// exactly one concurrent caller succeeds.
    async fn resolve_approval(
        &self,
        key: &ApprovalKey,
        resolution: &Resolution,
    ) -> Result<Approval>;

    /// Append to a session's conversation log
    async fn append_conversation_event(&self, event: ConversationEvent) -> Result<()>;

    /// A session's conversation log, oldest first
    async fn conversation(&self, session_id: &str) -> Result<Vec<ConversationEvent>>;

    /// Verify the backend is operational
    async fn health(&self) -> Result<()> {
        Ok(())
    }

    /// Backend name for diagnostics
    fn backend_name(&self) -> &str;
}
