//! Core record types for a3s-hitl
//!
//! All types use camelCase JSON serialization for wire compatibility
//! with the desktop and terminal front ends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of an agent session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Draft,
    Starting,
    Running,
    WaitingInput,
    Interrupting,
    Interrupted,
    Completed,
    Failed,
    Discarded,
}

impl SessionStatus {
    /// Position along the forward lifecycle. `Failed` and `Discarded`
    /// are reachable from anywhere and have no rank.
    fn rank(self) -> Option<u8> {
        match self {
            SessionStatus::Draft => Some(0),
            SessionStatus::Starting => Some(1),
            SessionStatus::Running => Some(2),
            SessionStatus::WaitingInput => Some(3),
            SessionStatus::Interrupting => Some(4),
            SessionStatus::Interrupted => Some(5),
            SessionStatus::Completed => Some(6),
            SessionStatus::Failed | SessionStatus::Discarded => None,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        const ALL: [SessionStatus; 9] = [
            SessionStatus::Draft,
            SessionStatus::Starting,
            SessionStatus::Running,
            SessionStatus::WaitingInput,
            SessionStatus::Interrupting,
            SessionStatus::Interrupted,
            SessionStatus::Completed,
            SessionStatus::Failed,
            SessionStatus::Discarded,
        ];
        ALL.into_iter().find(|status| status.as_str() == raw)
    }

    /// Terminal states accept no forward move
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Discarded
        )
    }

    /// Whether the lifecycle state machine permits `self -> next`
    ///
    /// Forward moves are allowed; the only backward moves are
    /// `Interrupted -> Running` (resume) and `WaitingInput -> Running`
    /// (input arrived). Any state may move to `Failed` or `Discarded`,
    /// except out of `Discarded` and `Failed -> Failed`.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;

        if self == next || self == Discarded {
            return false;
        }

        match (self, next) {
            (_, Discarded) => true,
            (Failed, _) => false,
            (_, Failed) => true,
            (Interrupted, Running) | (WaitingInput, Running) => true,
            (Completed, _) => false,
            (from, to) => match (from.rank(), to.rank()) {
                (Some(a), Some(b)) => b > a,
                _ => false,
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Draft => "draft",
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::WaitingInput => "waiting_input",
            SessionStatus::Interrupting => "interrupting",
            SessionStatus::Interrupted => "interrupted",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Discarded => "discarded",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of agent work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Session identifier (sess-<uuid>)
    pub id: String,

    /// Working directory the agent runs in (may be empty)
    #[serde(default)]
    pub working_dir: String,

    /// Query the session was started with
    pub query: String,

    /// AI-generated summary, filled in later
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,

    pub status: SessionStatus,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Create a new session record with a generated id
    pub fn new(
        query: impl Into<String>,
        working_dir: impl Into<String>,
        status: SessionStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: format!("sess-{}", uuid::Uuid::new_v4()),
            working_dir: working_dir.into(),
            query: query.into(),
            summary: None,
            status,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Resolution state of an approval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
}

impl ApprovalStatus {
    pub fn is_pending(self) -> bool {
        self == ApprovalStatus::Pending
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Denied => "denied",
        })
    }
}

/// Human (or policy) verdict on a tool invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Deny,
}

impl Decision {
    pub fn is_approve(self) -> bool {
        self == Decision::Approve
    }

    /// Status an approval ends up in after this decision
    pub fn status(self) -> ApprovalStatus {
        match self {
            Decision::Approve => ApprovalStatus::Approved,
            Decision::Deny => ApprovalStatus::Denied,
        }
    }
}

/// Authorization record for one tool invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Approval {
    /// Approval identifier (appr-<uuid>)
    pub id: String,

    /// Owning session
    pub session_id: String,

    /// Correlation key assigned by the agent
    pub tool_use_id: String,

    pub tool_name: String,

    /// Opaque tool input as sent by the agent
    pub tool_input: serde_json::Value,

    pub status: ApprovalStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    /// Attachment references (image file paths)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,

    /// Edited input supplied with an approve decision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_input: Option<serde_json::Value>,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Approval {
    /// Create a pending approval with a generated id
    pub fn pending(
        session_id: impl Into<String>,
        tool_use_id: impl Into<String>,
        tool_name: impl Into<String>,
        tool_input: serde_json::Value,
    ) -> Self {
        Self {
            id: format!("appr-{}", uuid::Uuid::new_v4()),
            session_id: session_id.into(),
            tool_use_id: tool_use_id.into(),
            tool_name: tool_name.into(),
            tool_input,
            status: ApprovalStatus::Pending,
            comment: None,
            attachments: Vec::new(),
            updated_input: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    /// Mark this approval resolved in place (used for auto-policy results)
    pub fn resolve(&mut self, resolution: &Resolution) {
        self.status = resolution.decision.status();
        self.comment = resolution.comment.clone();
        self.attachments = resolution.attachments.clone();
        self.updated_input = resolution.updated_input.clone();
        self.resolved_at = Some(Utc::now());
    }

    pub fn is_pending(&self) -> bool {
        self.status.is_pending()
    }

    /// Input the agent should run with: the edited input if one was given
    pub fn effective_input(&self) -> &serde_json::Value {
        self.updated_input.as_ref().unwrap_or(&self.tool_input)
    }
}

/// Everything a decision carries besides the approval key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub decision: Decision,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_input: Option<serde_json::Value>,
}

impl Resolution {
    pub fn approve() -> Self {
        Self {
            decision: Decision::Approve,
            comment: None,
            attachments: Vec::new(),
            updated_input: None,
        }
    }

    pub fn deny(comment: impl Into<String>) -> Self {
        Self {
            decision: Decision::Deny,
            comment: Some(comment.into()),
            attachments: Vec::new(),
            updated_input: None,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_attachments(mut self, attachments: impl IntoIterator<Item = String>) -> Self {
        self.attachments = attachments.into_iter().collect();
        self
    }

    pub fn with_updated_input(mut self, input: serde_json::Value) -> Self {
        self.updated_input = Some(input);
        self
    }
}

/// Key accepted by the decision API
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalKey {
    Id(String),
    ToolUseId(String),
    /// Approval id if one matches, otherwise tool-use id
    Any(String),
}

impl ApprovalKey {
    /// Interpret a client-supplied key
    ///
    /// Tool-use ids are opaque, so the string may be either kind;
    /// lookups try the approval id first.
    pub fn parse(raw: &str) -> Self {
        ApprovalKey::Any(raw.to_string())
    }

    pub fn as_str(&self) -> &str {
        match self {
            ApprovalKey::Id(id) | ApprovalKey::ToolUseId(id) | ApprovalKey::Any(id) => id,
        }
    }
}

/// Kind of a persisted conversation entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationEventKind {
    Message,
    ToolCall,
    ToolResult,
    System,
}

/// One entry in a session's conversation log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationEvent {
    pub session_id: String,

    pub kind: ConversationEventKind,

    /// "user" or "assistant" for messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    #[serde(default)]
    pub content: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl ConversationEvent {
    pub fn message(
        session_id: impl Into<String>,
        role: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            kind: ConversationEventKind::Message,
            role: Some(role.into()),
            content: content.into(),
            tool_name: None,
            created_at: Utc::now(),
        }
    }

    pub fn tool_call(session_id: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            kind: ConversationEventKind::ToolCall,
            role: Some("assistant".to_string()),
            content: String::new(),
            tool_name: Some(tool_name.into()),
            created_at: Utc::now(),
        }
    }
}
