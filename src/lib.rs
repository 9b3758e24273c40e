//! # a3s-hitl
//!
//! Human-in-the-loop approval coordination for AI coding agent sessions.
//!
//! ## Overview
//!
//! `a3s-hitl` sits between running agent processes and the people
//! supervising them. An agent asks for permission before each tool call;
//! the call blocks until a human decides through any attached front end
//! (desktop, terminal, CLI), and every front end sees the same state in
//! real time.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use a3s_hitl::{
//!     ApprovalKey, ApprovalManager, CallContext, EventBus, GatewayConfig, MemoryStore,
//!     ProtocolGateway, Resolution, ToolRequest,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> a3s_hitl::Result<()> {
//! let manager = ApprovalManager::new(Arc::new(MemoryStore::new()), Arc::new(EventBus::default()));
//! let session = manager.sessions().create_session("fix the build", "/work/repo", true).await?;
//!
//! let gateway = ProtocolGateway::new(manager.clone(), GatewayConfig::default());
//! let shutdown = CancellationToken::new();
//! gateway.start(shutdown.clone());
//!
//! // The agent side blocks here...
//! let ctx = CallContext::new(Some(session.id.clone()));
//! let call = tokio::spawn({
//!     let gateway = gateway.clone();
//!     async move {
//!         let request = ToolRequest {
//!             tool_name: "Bash".into(),
//!             input: serde_json::json!({"command": "cargo build"}),
//!             tool_use_id: "toolu_01".into(),
//!         };
//!         gateway.request_approval(&ctx, request).await
//!     }
//! });
//!
//! // ...until a human decides from any front end
//! # while !gateway.waiters().is_waiting("toolu_01") { tokio::task::yield_now().await; }
//! manager.decide(ApprovalKey::parse("toolu_01"), Resolution::approve()).await?;
//! let response = call.await.expect("join")?;
//! assert!(response.is_allow());
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **SessionRegistry**: session identity and lifecycle state machine
//! - **Store** trait: persistence contract (memory and JSON-file backends)
//! - **EventBus**: non-blocking fan-out of state-change events
//! - **ApprovalManager**: approval records, auto-policy, single-winner decisions
//! - **ProtocolGateway**: blocking tool-call boundary with cancellation
//! - **AdvisoryService**: one-shot clarifying questions about a session
//! - **Supervisor**: agent subprocess launch and interrupt
//! - **server**: MCP endpoint plus REST/SSE API over axum

pub mod advisory;
pub mod approval;
pub mod bus;
pub mod config;
pub mod error;
pub mod gateway;
pub mod server;
pub mod session;
pub mod store;
pub mod supervisor;
pub mod types;

// Re-export core types
pub use advisory::{
    AdvisoryModel, AdvisoryRequest, AdvisoryResponse, AdvisoryService, ClaudeCliModel,
};
pub use approval::{ApprovalManager, ApprovalPolicy, SessionPolicy};
pub use bus::{Event, EventBus, EventFilter, EventType, Subscription};
pub use config::HitlConfig;
pub use error::{HitlError, Result};
pub use gateway::{
    Behavior, CallContext, GatewayConfig, ImageContent, ProtocolGateway, ToolRequest, ToolResponse,
};
pub use session::SessionRegistry;
pub use store::{ApprovalQuery, FileStore, MemoryStore, Store};
pub use supervisor::Supervisor;
pub use types::{
    Approval, ApprovalKey, ApprovalStatus, ConversationEvent, ConversationEventKind, Decision,
    Resolution, Session, SessionStatus,
};
