//! Auto-resolution policy
//!
//! Decides whether a tool request can be resolved without a human.
//! Order of evaluation:
//!
//! 1. global deny list
//! 2. session bypass mode
//! 3. session allow-list
//! 4. session auto-accept for edit tools
//! 5. global auto-approve list
//!
//! Anything left over goes to a human as a pending approval.

use crate::types::Resolution;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Tools that modify files in the working tree
pub const DEFAULT_EDIT_TOOLS: &[&str] = &["Edit", "Write", "MultiEdit", "NotebookEdit"];

/// Daemon-wide policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalPolicy {
    /// Tools approved for every session
    #[serde(default)]
    pub auto_approve_tools: HashSet<String>,

    /// Tools denied for every session (wins over everything else)
    #[serde(default)]
    pub deny_tools: HashSet<String>,

    /// Tools covered by a session's auto-accept-edits mode
    #[serde(default = "default_edit_tools")]
    pub edit_tools: HashSet<String>,
}

fn default_edit_tools() -> HashSet<String> {
    DEFAULT_EDIT_TOOLS.iter().map(|s| s.to_string()).collect()
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self {
            auto_approve_tools: HashSet::new(),
            deny_tools: HashSet::new(),
            edit_tools: default_edit_tools(),
        }
    }
}

impl ApprovalPolicy {
    pub fn with_auto_approve_tools(mut self, tools: impl IntoIterator<Item = String>) -> Self {
        self.auto_approve_tools = tools.into_iter().collect();
        self
    }

    pub fn with_deny_tools(mut self, tools: impl IntoIterator<Item = String>) -> Self {
        self.deny_tools = tools.into_iter().collect();
        self
    }

    pub fn with_edit_tools(mut self, tools: impl IntoIterator<Item = String>) -> Self {
        self.edit_tools = tools.into_iter().collect();
        self
    }

    pub fn is_edit_tool(&self, tool_name: &str) -> bool {
        self.edit_tools.contains(tool_name)
    }

    /// Resolution to apply without a human, or `None` if one is needed
    pub fn evaluate(&self, session: &SessionPolicy, tool_name: &str) -> Option<Resolution> {
        if self.deny_tools.contains(tool_name) {
            return Some(Resolution::deny(format!(
                "Tool '{}' is denied by policy",
                tool_name
            )));
        }

        if session.bypass_permissions {
            return Some(Resolution::approve().with_comment("Auto-approved: permissions bypassed"));
        }

        if session.allowed_tools.contains(tool_name) {
            return Some(Resolution::approve().with_comment("Auto-approved: allowed for session"));
        }

        if session.auto_accept_edits && self.is_edit_tool(tool_name) {
            return Some(Resolution::approve().with_comment("Auto-approved: edits accepted"));
        }

        if self.auto_approve_tools.contains(tool_name) {
            return Some(Resolution::approve().with_comment("Auto-approved by policy"));
        }

        None
    }
}

/// Per-session overrides, changeable while the session runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPolicy {
    #[serde(default)]
    pub allowed_tools: HashSet<String>,

    #[serde(default)]
    pub auto_accept_edits: bool,

    #[serde(default)]
    pub bypass_permissions: bool,
}

impl SessionPolicy {
    pub fn with_allowed_tools(mut self, tools: impl IntoIterator<Item = String>) -> Self {
        self.allowed_tools = tools.into_iter().collect();
        self
    }

    pub fn with_auto_accept_edits(mut self, enabled: bool) -> Self {
        self.auto_accept_edits = enabled;
        self
    }

    pub fn with_bypass_permissions(mut self, enabled: bool) -> Self {
        self.bypass_permissions = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Decision;

    #[test]
    fn test_default_requires_human() {
        let policy = ApprovalPolicy::default();
        assert!(policy.evaluate(&SessionPolicy::default(), "Bash").is_none());
        assert!(policy.is_edit_tool("MultiEdit"));
    }

    #[test]
    fn test_auto_approve_list() {
        let policy = ApprovalPolicy::default().with_auto_approve_tools(["Read".to_string()]);
        let resolution = policy.evaluate(&SessionPolicy::default(), "Read").unwrap();
        assert_eq!(resolution.decision, Decision::Approve);
        assert!(policy.evaluate(&SessionPolicy::default(), "Bash").is_none());
    }

    #[test]
    fn test_deny_wins_over_bypass() {
        let policy = ApprovalPolicy::default().with_deny_tools(["Bash".to_string()]);
        let session = SessionPolicy::default().with_bypass_permissions(true);

        let resolution = policy.evaluate(&session, "Bash").unwrap();
        assert_eq!(resolution.decision, Decision::Deny);
        assert_eq!(resolution.comment.as_deref(), Some("Tool 'Bash' is denied by policy"));

        let other = policy.evaluate(&session, "Edit").unwrap();
        assert_eq!(other.decision, Decision::Approve);
    }

    #[test]
    fn test_auto_accept_edits_only_covers_edit_tools() {
        let policy = ApprovalPolicy::default();
        let session = SessionPolicy::default().with_auto_accept_edits(true);

        assert!(policy.evaluate(&session, "Write").is_some());
        assert!(policy.evaluate(&session, "Bash").is_none());
    }

    #[test]
    fn test_session_allow_list() {
        let policy = ApprovalPolicy::default();
        let session = SessionPolicy::default().with_allowed_tools(["WebFetch".to_string()]);
        assert!(policy.evaluate(&session, "WebFetch").is_some());
        assert!(policy
            .evaluate(&SessionPolicy::default(), "WebFetch")
            .is_none());
    }

    #[test]
    fn test_policy_deserializes_with_defaults() {
        let policy: ApprovalPolicy =
            serde_json::from_str(r#"{"autoApproveTools":["Read"]}"#).unwrap();
        assert!(policy.auto_approve_tools.contains("Read"));
        assert_eq!(policy.edit_tools.len(), DEFAULT_EDIT_TOOLS.len());
    }
}
