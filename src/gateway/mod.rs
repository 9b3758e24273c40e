//! Protocol gateway
//!
//! The object an agent calls once per tool use. A call records the
//! request through the approval manager and, unless policy already
//! resolved it, parks on a wait handle until a decision arrives or the
//! caller cancels.
//!
//! A single listener task per gateway turns `ApprovalResolved` events
//! into wake-ups. Before parking, the call re-reads the approval after
//! registering its handle, so a decision committed between creation and
//! registration is never missed. Parked calls also re-read the store on
//! a slow interval, which recovers a wake-up lost to a saturated
//! listener queue.

pub mod images;
pub mod waiters;

pub use images::{encode_images, ImageContent};
pub use waiters::{Verdict, WaitHandle, WaitRegistry};

use crate::approval::ApprovalManager;
use crate::bus::{EventFilter, EventType};
use crate::error::{HitlError, Result};
use crate::types::{Approval, ApprovalKey};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Message returned to every request in auto-deny-all mode
pub const AUTO_DENY_MESSAGE: &str = "Auto-denied for testing";

/// Default interval between store re-reads while parked
pub const DEFAULT_RECHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Gateway behaviour switches
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Deny every request without persisting or waiting
    pub auto_deny_all: bool,

    /// Give up waiting after this long; `None` waits indefinitely
    pub approval_timeout: Option<Duration>,

    /// How often a parked call re-reads its approval
    pub recheck_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            auto_deny_all: false,
            approval_timeout: None,
            recheck_interval: DEFAULT_RECHECK_INTERVAL,
        }
    }
}

impl GatewayConfig {
    pub fn with_auto_deny_all(mut self, enabled: bool) -> Self {
        self.auto_deny_all = enabled;
        self
    }

    pub fn with_approval_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.approval_timeout = timeout;
        self
    }

    pub fn with_recheck_interval(mut self, interval: Duration) -> Self {
        self.recheck_interval = interval;
        self
    }
}

/// Per-call transport context
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// Session id carried by the transport
    pub session_id: Option<String>,

    /// Fires when the caller gives up
    pub cancel: CancellationToken,
}

impl CallContext {
    pub fn new(session_id: Option<String>) -> Self {
        Self {
            session_id,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// `request_approval` arguments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    pub tool_name: String,

    #[serde(default)]
    pub input: serde_json::Value,

    pub tool_use_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Behavior {
    Allow,
    Deny,
}

/// `request_approval` result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub behavior: Behavior,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_input: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageContent>,
}

impl ToolResponse {
    pub fn allow(input: serde_json::Value) -> Self {
        Self {
            behavior: Behavior::Allow,
            updated_input: Some(input),
            message: None,
            images: Vec::new(),
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self {
            behavior: Behavior::Deny,
            updated_input: None,
            message: Some(message.into()),
            images: Vec::new(),
        }
    }

    pub fn is_allow(&self) -> bool {
        self.behavior == Behavior::Allow
    }
}

/// Blocking request/response boundary for agent tool calls
#[derive(Clone)]
pub struct ProtocolGateway {
    manager: ApprovalManager,
    waiters: WaitRegistry,
    config: GatewayConfig,
}

impl ProtocolGateway {
    pub fn new(manager: ApprovalManager, config: GatewayConfig) -> Self {
        Self {
            manager,
            waiters: WaitRegistry::new(),
            config,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn waiters(&self) -> &WaitRegistry {
        &self.waiters
    }

    pub fn manager(&self) -> &ApprovalManager {
        &self.manager
    }

    /// Start the resolution listener
    ///
    /// The subscription is in place when this returns; the task ends
    /// when `cancel` fires.
    pub fn start(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let mut subscription = self
            .manager
            .bus()
            .subscribe(cancel, EventFilter::types([EventType::ApprovalResolved]));
        let waiters = self.waiters.clone();

        tracing::info!("Approval listener started");

        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                let Some(tool_use_id) = event.str_field("tool_use_id") else {
                    tracing::warn!(event_id = %event.id, "Resolution event without tool_use_id");
                    continue;
                };
                let Some(verdict) = Verdict::from_event(&event) else {
                    tracing::warn!(tool_use_id = %tool_use_id, "Resolution event without outcome");
                    continue;
                };

                if waiters.notify(tool_use_id, verdict) {
                    tracing::debug!(tool_use_id = %tool_use_id, "Waiter notified");
                }
            }
            tracing::info!("Approval listener stopped");
        })
    }

    /// Handle one `request_approval` call
    ///
    /// Auto-deny-all answers before the session is even looked at;
    /// nothing is recorded in that mode.
    pub async fn request_approval(
        &self,
        ctx: &CallContext,
        request: ToolRequest,
    ) -> Result<ToolResponse> {
        if self.config.auto_deny_all {
            tracing::info!(
                session_id = ?ctx.session_id,
                tool_use_id = %request.tool_use_id,
                tool_name = %request.tool_name,
                "Auto-denying tool request"
            );
            return Ok(ToolResponse::deny(AUTO_DENY_MESSAGE));
        }

        let session_id = ctx.session_id.as_deref().ok_or(HitlError::MissingSession)?;

        let approval = self
            .manager
            .create_approval(session_id, &request.tool_name, request.input, &request.tool_use_id)
            .await?;

        if let Some(verdict) = Verdict::from_approval(&approval) {
            return Ok(respond(&approval, verdict).await);
        }

        let mut handle = self.waiters.register(&approval.tool_use_id)?;

        // a decision may have landed before the handle existed
        let key = ApprovalKey::ToolUseId(approval.tool_use_id.clone());
        let current = self.manager.get(&key).await?;
        if let Some(verdict) = Verdict::from_approval(&current) {
            return Ok(respond(&current, verdict).await);
        }

        tracing::info!(
            session_id = %session_id,
            tool_use_id = %approval.tool_use_id,
            "Waiting for approval decision"
        );

        let wait = self.wait_for_verdict(&mut handle, &key);
        let verdict = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                tracing::info!(tool_use_id = %approval.tool_use_id, "Approval wait cancelled");
                return Err(HitlError::Cancelled(approval.tool_use_id.clone()));
            }
            verdict = with_timeout(self.config.approval_timeout, &approval.tool_use_id, wait) => {
                verdict?
            }
        };

        Ok(respond(&approval, verdict).await)
    }

    async fn wait_for_verdict(
        &self,
        handle: &mut WaitHandle,
        key: &ApprovalKey,
    ) -> Result<Verdict> {
        let mut recheck = tokio::time::interval(self.config.recheck_interval);
        recheck.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        recheck.tick().await;

        loop {
            tokio::select! {
                verdict = handle.recv() => {
                    return verdict.ok_or_else(|| HitlError::Cancelled(key.as_str().to_string()));
                }
                _ = recheck.tick() => {
                    match self.manager.get(key).await {
                        Ok(approval) => {
                            if let Some(verdict) = Verdict::from_approval(&approval) {
                                tracing::debug!(
                                    tool_use_id = %approval.tool_use_id,
                                    "Decision found on recheck"
                                );
                                return Ok(verdict);
                            }
                        }
                        Err(e) => {
                            tracing::warn!(
                                key = %key.as_str(),
                                error = %e,
                                "Approval recheck failed"
                            );
                        }
                    }
                }
            }
        }
    }
}

async fn with_timeout<F>(timeout: Option<Duration>, tool_use_id: &str, fut: F) -> Result<Verdict>
where
    F: std::future::Future<Output = Result<Verdict>>,
{
    match timeout {
        None => fut.await,
        Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
            tracing::warn!(tool_use_id = %tool_use_id, "Approval wait timed out");
            HitlError::ApprovalTimeout {
                tool_use_id: tool_use_id.to_string(),
                secs: limit.as_secs(),
            }
        })?,
    }
}

async fn respond(approval: &Approval, verdict: Verdict) -> ToolResponse {
    let images = encode_images(&verdict.image_paths).await;

    let mut response = if verdict.approved {
        ToolResponse::allow(
            verdict
                .updated_input
                .unwrap_or_else(|| approval.tool_input.clone()),
        )
    } else {
        ToolResponse::deny(verdict.message)
    };
    response.images = images;
    response
}
