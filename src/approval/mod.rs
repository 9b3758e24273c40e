//! Approval manager
//!
//! Creates approval records, applies auto-resolution policy, commits
//! human decisions, and publishes exactly one resolution event per
//! approval.
//!
//! A decision's commit and its event publication run together on a
//! detached task: once `decide` reports success the `ApprovalResolved`
//! event is already on the bus, and a caller dropping the `decide`
//! future cannot separate the two.
//!
//! Per-session policy overrides live in memory only and do not survive
//! a restart. `start` runs a listener that drops a session's overrides
//! once the session reaches a terminal status.

pub mod policy;

pub use policy::{ApprovalPolicy, SessionPolicy, DEFAULT_EDIT_TOOLS};

use crate::bus::{Event, EventBus, EventFilter, EventType};
use crate::error::{HitlError, Result};
use crate::session::SessionRegistry;
use crate::store::{ApprovalQuery, Store};
use crate::types::{Approval, ApprovalKey, Resolution, SessionStatus};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Build the `ApprovalResolved` event for a resolved approval
pub fn resolution_event(approval: &Approval) -> Event {
    let mut event = Event::new(EventType::ApprovalResolved)
        .with("approval_id", approval.id.clone())
        .with("session_id", approval.session_id.clone())
        .with("tool_use_id", approval.tool_use_id.clone())
        .with("tool_name", approval.tool_name.clone())
        .with("approved", approval.status == crate::types::ApprovalStatus::Approved)
        .with("response_text", approval.comment.clone().unwrap_or_default())
        .with("image_paths", approval.attachments.clone());

    if let Some(input) = &approval.updated_input {
        event = event.with("updated_input", input.clone());
    }
    event
}

struct Inner {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    sessions: SessionRegistry,
    policy: ApprovalPolicy,
    session_policies: DashMap<String, SessionPolicy>,
}

/// Approval lifecycle front end over the store
#[derive(Clone)]
pub struct ApprovalManager {
    inner: Arc<Inner>,
}

impl ApprovalManager {
    pub fn new(store: Arc<dyn Store>, bus: Arc<EventBus>) -> Self {
        Self::with_policy(store, bus, ApprovalPolicy::default())
    }

    pub fn with_policy(store: Arc<dyn Store>, bus: Arc<EventBus>, policy: ApprovalPolicy) -> Self {
        let sessions = SessionRegistry::new(store.clone(), bus.clone());
        Self {
            inner: Arc::new(Inner {
                store,
                bus,
                sessions,
                policy,
                session_policies: DashMap::new(),
            }),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.inner.sessions
    }

    pub fn policy(&self) -> &ApprovalPolicy {
        &self.inner.policy
    }

    /// Replace a session's policy overrides
    pub fn set_session_policy(&self, session_id: impl Into<String>, policy: SessionPolicy) {
        self.inner.session_policies.insert(session_id.into(), policy);
    }

    pub fn session_policy(&self, session_id: &str) -> SessionPolicy {
        self.inner
            .session_policies
            .get(session_id)
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    /// Number of sessions with policy overrides
    pub fn session_policy_count(&self) -> usize {
        self.inner.session_policies.len()
    }

    /// Run the session-policy cleanup listener until `cancel` fires
    pub fn start(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let mut subscription = self
            .inner
            .bus
            .subscribe(cancel, EventFilter::types([EventType::SessionStatusChanged]));
        let inner = self.inner.clone();

        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                let terminal = event
                    .str_field("new_status")
                    .and_then(SessionStatus::parse)
                    .is_some_and(SessionStatus::is_terminal);
                if !terminal {
                    continue;
                }
                if let Some(session_id) = event.session_id() {
                    if inner.session_policies.remove(session_id).is_some() {
                        tracing::debug!(session_id = %session_id, "Session policy dropped");
                    }
                }
            }
        })
    }

    /// Record a tool request
    ///
    /// Returns the approval already resolved when policy applies,
    /// otherwise a persisted pending approval. Re-submitting a known
    /// tool-use id for the same session returns the existing record
    /// unchanged.
    pub async fn create_approval(
        &self,
        session_id: &str,
        tool_name: &str,
        tool_input: serde_json::Value,
        tool_use_id: &str,
    ) -> Result<Approval> {
        let inner = &self.inner;
        let session = inner.store.get_session(session_id).await?;

        match inner.store.get_approval_by_tool_use_id(tool_use_id).await {
            Ok(existing) => return check_owner(existing, session_id),
            Err(HitlError::ApprovalNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let mut approval = Approval::pending(session_id, tool_use_id, tool_name, tool_input);
        let auto = inner
            .policy
            .evaluate(&self.session_policy(session_id), tool_name);
        if let Some(resolution) = &auto {
            approval.resolve(resolution);
        }

        let canonical = inner.store.create_approval(approval.clone()).await?;
        if canonical.id != approval.id {
            // lost an insert race on the same tool-use id
            return check_owner(canonical, session_id);
        }

        if canonical.is_pending() {
            tracing::info!(
                approval_id = %canonical.id,
                session_id = %session_id,
                tool_use_id = %tool_use_id,
                tool_name = %tool_name,
                "Approval pending"
            );
            inner.bus.publish(
                Event::new(EventType::NewApproval)
                    .with("approval_id", canonical.id.clone())
                    .with("session_id", session_id)
                    .with("tool_use_id", tool_use_id)
                    .with("tool_name", tool_name),
            );

            if session.status == SessionStatus::Running {
                if let Err(e) = inner
                    .sessions
                    .transition_if(session_id, SessionStatus::Running, SessionStatus::WaitingInput)
                    .await
                {
                    tracing::warn!(
                        session_id = %session_id,
                        error = %e,
                        "Failed to mark session waiting for input"
                    );
                }
            }
        } else {
            tracing::info!(
                approval_id = %canonical.id,
                tool_use_id = %tool_use_id,
                tool_name = %tool_name,
                status = %canonical.status,
                "Approval auto-resolved"
            );
            inner
                .bus
                .publish(resolution_event(&canonical).with("auto", true));
        }

        Ok(canonical)
    }

    /// Apply a human decision
    ///
    /// Exactly one concurrent caller per approval succeeds; the others
    /// get `AlreadyResolved`.
    pub async fn decide(&self, key: ApprovalKey, resolution: Resolution) -> Result<Approval> {
        let inner = self.inner.clone();
        let raw_key = key.as_str().to_string();
        let task = tokio::spawn(async move { inner.commit_decision(key, resolution).await });

        match task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(HitlError::Cancelled(raw_key)),
        }
    }

    pub async fn get(&self, key: &ApprovalKey) -> Result<Approval> {
        let store = &self.inner.store;
        match key {
            ApprovalKey::Id(id) => store.get_approval(id).await,
            ApprovalKey::ToolUseId(id) => store.get_approval_by_tool_use_id(id).await,
            ApprovalKey::Any(raw) => match store.get_approval(raw).await {
                Err(HitlError::ApprovalNotFound(_)) => {
                    store.get_approval_by_tool_use_id(raw).await
                }
                other => other,
            },
        }
    }

    pub async fn list(&self, query: &ApprovalQuery) -> Result<Vec<Approval>> {
        self.inner.store.list_approvals(query).await
    }
}

fn check_owner(approval: Approval, session_id: &str) -> Result<Approval> {
    if approval.session_id != session_id {
        return Err(HitlError::DuplicateToolUse {
            tool_use_id: approval.tool_use_id,
            session_id: approval.session_id,
        });
    }
    tracing::debug!(
        tool_use_id = %approval.tool_use_id,
        "Tool use already recorded, returning existing approval"
    );
    Ok(approval)
}

impl Inner {
    async fn commit_decision(&self, key: ApprovalKey, resolution: Resolution) -> Result<Approval> {
        let approval = match self.store.resolve_approval(&key, &resolution).await {
            Ok(approval) => approval,
            Err(e) => {
                if e.is_already_resolved() {
                    tracing::debug!(
                        key = %key.as_str(),
                        "Decision ignored, approval already resolved"
                    );
                }
                return Err(e);
            }
        };

        let delivered = self.bus.publish(resolution_event(&approval));
        tracing::info!(
            approval_id = %approval.id,
            tool_use_id = %approval.tool_use_id,
            status = %approval.status,
            subscribers = delivered,
            "Approval resolved"
        );

        self.resume_if_idle(&approval.session_id).await;
        Ok(approval)
    }

    /// Move a waiting session back to running once nothing is pending
    async fn resume_if_idle(&self, session_id: &str) {
        let query = ApprovalQuery::pending().for_session(session_id);
        let remaining = match self.store.list_approvals(&query).await {
            Ok(pending) => pending.len(),
            Err(e) => {
                tracing::warn!(
                    session_id = %session_id,
                    error = %e,
                    "Failed to count pending approvals"
                );
                return;
            }
        };
        if remaining > 0 {
            return;
        }
        if let Err(e) = self
            .sessions
            .transition_if(session_id, SessionStatus::WaitingInput, SessionStatus::Running)
            .await
        {
            tracing::warn!(session_id = %session_id, error = %e, "Failed to resume session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventFilter;
    use crate::store::MemoryStore;
    use crate::types::{ApprovalStatus, Session};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    async fn setup(policy: ApprovalPolicy) -> (ApprovalManager, Session) {
        let manager = ApprovalManager::with_policy(
            Arc::new(MemoryStore::new()),
            Arc::new(EventBus::default()),
            policy,
        );
        let session = manager
            .sessions()
            .create_session("fix bug", "/tmp/repo", true)
            .await
            .unwrap();
        let session = manager
            .sessions()
            .update_status(&session.id, SessionStatus::Running)
            .await
            .unwrap();
        (manager, session)
    }

    #[tokio::test]
    async fn test_create_pending() {
        let (manager, session) = setup(ApprovalPolicy::default()).await;
        let cancel = CancellationToken::new();
        let mut sub = manager
            .bus()
            .subscribe(cancel.clone(), EventFilter::types([EventType::NewApproval]));

        let approval = manager
            .create_approval(&session.id, "Bash", json!({"command": "ls"}), "t1")
            .await
            .unwrap();
        assert!(approval.is_pending());

        let event = sub.try_recv().unwrap();
        assert_eq!(event.str_field("tool_use_id"), Some("t1"));
        assert_eq!(
            manager.sessions().get(&session.id).await.unwrap().status,
            SessionStatus::WaitingInput
        );
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let (manager, _) = setup(ApprovalPolicy::default()).await;
        let err = manager
            .create_approval("sess-missing", "Bash", json!({}), "t1")
            .await
            .unwrap_err();
        assert!(matches!(err, HitlError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_auto_approved_publishes_once() {
        let policy = ApprovalPolicy::default().with_auto_approve_tools(["Read".to_string()]);
        let (manager, session) = setup(policy).await;
        let cancel = CancellationToken::new();
        let mut sub = manager.bus().subscribe(
            cancel.clone(),
            EventFilter::types([EventType::ApprovalResolved, EventType::NewApproval]),
        );

        let approval = manager
            .create_approval(&session.id, "Read", json!({"path": "a.rs"}), "t1")
            .await
            .unwrap();
        assert_eq!(approval.status, ApprovalStatus::Approved);
        assert!(approval.resolved_at.is_some());

        let event = sub.try_recv().unwrap();
        assert_eq!(event.event_type, EventType::ApprovalResolved);
        assert_eq!(event.bool_field("auto"), Some(true));
        assert!(sub.try_recv().is_none());

        // session is not parked for an auto-resolved request
        assert_eq!(
            manager.sessions().get(&session.id).await.unwrap().status,
            SessionStatus::Running
        );
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_session_policy_bypass() {
        let (manager, session) = setup(ApprovalPolicy::default()).await;
        manager.set_session_policy(
            &session.id,
            SessionPolicy::default().with_bypass_permissions(true),
        );

        let approval = manager
            .create_approval(&session.id, "Bash", json!({}), "t1")
            .await
            .unwrap();
        assert_eq!(approval.status, ApprovalStatus::Approved);
    }

    #[tokio::test]
    async fn test_decide_publishes_resolution() {
        let (manager, session) = setup(ApprovalPolicy::default()).await;
        manager
            .create_approval(&session.id, "Bash", json!({"command": "rm -rf target"}), "t2")
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let mut sub = manager
            .bus()
            .subscribe(cancel.clone(), EventFilter::types([EventType::ApprovalResolved]));

        let resolution = Resolution::approve()
            .with_comment("looks fine")
            .with_attachments(["/tmp/shot.png".to_string()]);
        let approval = manager
            .decide(ApprovalKey::ToolUseId("t2".into()), resolution)
            .await
            .unwrap();
        assert_eq!(approval.status, ApprovalStatus::Approved);

        // enqueued before decide returned
        let event = sub.try_recv().unwrap();
        assert_eq!(event.str_field("tool_use_id"), Some("t2"));
        assert_eq!(event.bool_field("approved"), Some(true));
        assert_eq!(event.str_field("response_text"), Some("looks fine"));
        assert_eq!(event.string_list("image_paths"), vec!["/tmp/shot.png".to_string()]);

        let err = manager
            .decide(ApprovalKey::Id(approval.id.clone()), Resolution::deny("no"))
            .await
            .unwrap_err();
        assert!(err.is_already_resolved());
        assert!(sub.try_recv().is_none());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_terminal_session_drops_policy() {
        let (manager, session) = setup(ApprovalPolicy::default()).await;
        let other = manager
            .sessions()
            .create_session("other", "", true)
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        let listener = manager.start(cancel.clone());

        let bypass = SessionPolicy::default().with_bypass_permissions(true);
        manager.set_session_policy(&session.id, bypass.clone());
        manager.set_session_policy(&other.id, bypass);

        manager
            .sessions()
            .update_status(&session.id, SessionStatus::Discarded)
            .await
            .unwrap();
        manager
            .sessions()
            .update_status(&other.id, SessionStatus::Running)
            .await
            .unwrap();

        for _ in 0..200 {
            if manager.session_policy_count() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(manager.session_policy_count(), 1);
        assert_eq!(manager.session_policy(&session.id), SessionPolicy::default());
        assert!(manager.session_policy(&other.id).bypass_permissions);

        cancel.cancel();
        listener.await.unwrap();
    }

    #[tokio::test]
    async fn test_decide_prefixed_tool_use_id() {
        let (manager, session) = setup(ApprovalPolicy::default()).await;
        let approval = manager
            .create_approval(&session.id, "Bash", json!({}), "appr-agent-1")
            .await
            .unwrap();

        let fetched = manager.get(&ApprovalKey::parse("appr-agent-1")).await.unwrap();
        assert_eq!(fetched.id, approval.id);

        let decided = manager
            .decide(ApprovalKey::parse("appr-agent-1"), Resolution::approve())
            .await
            .unwrap();
        assert_eq!(decided.status, ApprovalStatus::Approved);

        // the generated approval id still works
        let fetched = manager.get(&ApprovalKey::parse(&approval.id)).await.unwrap();
        assert_eq!(fetched.tool_use_id, "appr-agent-1");
    }

    #[tokio::test]
    async fn test_decide_unknown() {
        let (manager, _) = setup(ApprovalPolicy::default()).await;
        let err = manager
            .decide(ApprovalKey::ToolUseId("nope".into()), Resolution::approve())
            .await
            .unwrap_err();
        assert!(matches!(err, HitlError::ApprovalNotFound(_)));
    }

    #[tokio::test]
    async fn test_session_resumes_after_last_decision() {
        let (manager, session) = setup(ApprovalPolicy::default()).await;
        for id in ["a", "b"] {
            manager
                .create_approval(&session.id, "Bash", json!({}), id)
                .await
                .unwrap();
        }

        manager
            .decide(ApprovalKey::ToolUseId("a".into()), Resolution::approve())
            .await
            .unwrap();
        assert_eq!(
            manager.sessions().get(&session.id).await.unwrap().status,
            SessionStatus::WaitingInput
        );

        manager
            .decide(ApprovalKey::ToolUseId("b".into()), Resolution::deny("no"))
            .await
            .unwrap();
        assert_eq!(
            manager.sessions().get(&session.id).await.unwrap().status,
            SessionStatus::Running
        );
    }

    #[tokio::test]
    async fn test_duplicate_tool_use() {
        let (manager, session) = setup(ApprovalPolicy::default()).await;
        let first = manager
            .create_approval(&session.id, "Bash", json!({}), "t1")
            .await
            .unwrap();
        let again = manager
            .create_approval(&session.id, "Bash", json!({}), "t1")
            .await
            .unwrap();
        assert_eq!(first.id, again.id);

        let other = manager
            .sessions()
            .create_session("other", "", true)
            .await
            .unwrap();
        let err = manager
            .create_approval(&other.id, "Bash", json!({}), "t1")
            .await
            .unwrap_err();
        assert!(matches!(err, HitlError::DuplicateToolUse { .. }));
    }

    #[tokio::test]
    async fn test_updated_input_carried_on_event() {
        let (manager, session) = setup(ApprovalPolicy::default()).await;
        manager
            .create_approval(&session.id, "Bash", json!({"command": "ls"}), "t1")
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let mut sub = manager.bus().subscribe(cancel.clone(), EventFilter::all());

        let approval = manager
            .decide(
                ApprovalKey::ToolUseId("t1".into()),
                Resolution::approve().with_updated_input(json!({"command": "ls -la"})),
            )
            .await
            .unwrap();
        assert_eq!(approval.effective_input(), &json!({"command": "ls -la"}));

        let event = sub.try_recv().unwrap();
        assert_eq!(event.data.get("updated_input"), Some(&json!({"command": "ls -la"})));
        cancel.cancel();
    }
}
