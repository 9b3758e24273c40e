//! HTTP daemon
//!
//! | Path                  | Module | Description                         |
//! |-----------------------|--------|-------------------------------------|
//! | `/health`             | api    | Liveness and store health           |
//! | `/mcp`                | mcp    | JSON-RPC endpoint agents call       |
//! | `/api/v1/sessions/*`  | api    | Session lifecycle, launch, advisory |
//! | `/api/v1/approvals/*` | api    | Pending approvals and decisions     |
//! | `/api/v1/events`      | api    | Server-sent event stream            |

pub mod api;
pub mod mcp;

use crate::advisory::{AdvisoryModel, AdvisoryService, ClaudeCliModel};
use crate::approval::ApprovalManager;
use crate::bus::EventBus;
use crate::config::HitlConfig;
use crate::error::Result;
use crate::gateway::ProtocolGateway;
use crate::store::{FileStore, MemoryStore, Store};
use crate::supervisor::Supervisor;
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared state for every handler
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub approvals: ApprovalManager,
    pub gateway: ProtocolGateway,
    pub supervisor: Supervisor,
    pub advisory: AdvisoryService,

    /// Root token; request-scoped tokens are children of it
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Wire the core components together and start the gateway listener
    pub fn assemble(
        config: &HitlConfig,
        store: Arc<dyn Store>,
        model: Arc<dyn AdvisoryModel>,
        shutdown: CancellationToken,
    ) -> Self {
        let bus = Arc::new(EventBus::new(config.bus.subscriber_buffer));
        let approvals = ApprovalManager::with_policy(store.clone(), bus, config.approval_policy());
        approvals.start(shutdown.child_token());
        let gateway = ProtocolGateway::new(approvals.clone(), config.gateway_config());
        gateway.start(shutdown.child_token());

        let sessions = approvals.sessions().clone();
        let supervisor =
            Supervisor::new(sessions.clone(), &config.agent.command, config.gateway_url());
        let advisory = AdvisoryService::new(sessions, model)
            .with_default_max_events(config.advisory.max_events);

        Self {
            store,
            approvals,
            gateway,
            supervisor,
            advisory,
            shutdown,
        }
    }
}

/// Build the router with all routes
pub fn build(state: AppState) -> Router {
    Router::new()
        .merge(api::routes())
        .merge(mcp::routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve on `listener` until `shutdown` fires
pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    let shutdown = state.shutdown.clone();
    axum::serve(listener, build(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

/// Open the store, bind, and run the daemon until `shutdown` fires
pub async fn start(config: HitlConfig, in_memory: bool, shutdown: CancellationToken) -> Result<()> {
    let store: Arc<dyn Store> = if in_memory {
        tracing::info!("Using in-memory store");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(FileStore::open(config.store_path()).await?)
    };

    let model = Arc::new(ClaudeCliModel::new(
        config.advisory.command.clone(),
        config.advisory.model.clone(),
    ));

    let bind_addr = config.bind_address();
    let listener = TcpListener::bind(&bind_addr).await?;

    let state = AppState::assemble(&config, store, model, shutdown);
    if config.gateway.auto_deny_all {
        tracing::warn!("Auto-deny mode enabled: every tool request will be denied");
    }
    tracing::info!(
        address = %bind_addr,
        mcp = %config.gateway_url(),
        "Server listening"
    );

    serve(listener, state).await?;
    tracing::info!("Server stopped");
    Ok(())
}
