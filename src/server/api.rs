//! REST and server-sent event API for front ends

use super::AppState;
use crate::advisory::{AdvisoryRequest, AdvisoryResponse};
use crate::approval::SessionPolicy;
use crate::bus::{EventFilter, EventType};
use crate::error::{HitlError, Result};
use crate::store::ApprovalQuery;
use crate::types::{
    Approval, ApprovalKey, ConversationEvent, ConversationEventKind, Decision, Resolution, Session,
    SessionStatus,
};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chrono::Utc;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/sessions", get(list_sessions).post(create_session))
        .route("/api/v1/sessions/:id", get(get_session))
        .route("/api/v1/sessions/:id/status", patch(update_status))
        .route("/api/v1/sessions/:id/policy", get(get_policy).put(set_policy))
        .route(
            "/api/v1/sessions/:id/conversation",
            get(get_conversation).post(append_conversation),
        )
        .route("/api/v1/sessions/:id/launch", post(launch_session))
        .route("/api/v1/sessions/:id/interrupt", post(interrupt_session))
        .route("/api/v1/sessions/:id/advisory", post(ask_advisory))
        .route("/api/v1/approvals", get(list_approvals))
        .route("/api/v1/approvals/:id", get(get_approval))
        .route("/api/v1/approvals/:id/decide", post(decide))
        .route("/api/v1/events", get(events))
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    store: String,
    subscribers: usize,
    waiting: usize,
}

async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>> {
    state.store.health().await?;
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        store: state.store.backend_name().to_string(),
        subscribers: state.approvals.bus().subscriber_count(),
        waiting: state.gateway.waiters().len(),
    }))
}

// =============================================================================
// Sessions
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest {
    query: String,
    #[serde(default)]
    working_dir: String,
    /// Create in `starting` instead of `draft`
    #[serde(default)]
    start: bool,
    #[serde(default)]
    policy: Option<SessionPolicy>,
}

async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse> {
    if req.query.trim().is_empty() {
        return Err(HitlError::InvalidRequest("query is required".to_string()));
    }
    let session = state
        .approvals
        .sessions()
        .create_session(req.query, req.working_dir, req.start)
        .await?;
    if let Some(policy) = req.policy {
        state.approvals.set_session_policy(&session.id, policy);
    }
    Ok((StatusCode::CREATED, Json(session)))
}

async fn list_sessions(State(state): State<AppState>) -> Result<Json<Vec<Session>>> {
    Ok(Json(state.approvals.sessions().list().await?))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Session>> {
    Ok(Json(state.approvals.sessions().get(&id).await?))
}

#[derive(Debug, Deserialize)]
struct UpdateStatusRequest {
    status: SessionStatus,
}

async fn update_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateStatusRequest>,
) -> Result<Json<Session>> {
    Ok(Json(
        state
            .approvals
            .sessions()
            .update_status(&id, req.status)
            .await?,
    ))
}

async fn get_policy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionPolicy>> {
    state.approvals.sessions().get(&id).await?;
    Ok(Json(state.approvals.session_policy(&id)))
}

async fn set_policy(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(policy): Json<SessionPolicy>,
) -> Result<Json<SessionPolicy>> {
    state.approvals.sessions().get(&id).await?;
    state.approvals.set_session_policy(&id, policy.clone());
    tracing::info!(session_id = %id, "Session policy updated");
    Ok(Json(policy))
}

async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<ConversationEvent>>> {
    Ok(Json(state.approvals.sessions().conversation(&id).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppendConversationRequest {
    kind: ConversationEventKind,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_name: Option<String>,
}

async fn append_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AppendConversationRequest>,
) -> Result<StatusCode> {
    let event = ConversationEvent {
        session_id: id,
        kind: req.kind,
        role: req.role,
        content: req.content,
        tool_name: req.tool_name,
        created_at: Utc::now(),
    };
    state.approvals.sessions().record_conversation(event).await?;
    Ok(StatusCode::CREATED)
}

#[derive(Serialize)]
struct LaunchResponse {
    pid: u32,
}

async fn launch_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let pid = state.supervisor.launch(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(LaunchResponse { pid })))
}

async fn interrupt_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.supervisor.interrupt(&id).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn ask_advisory(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AdvisoryRequest>,
) -> Result<Json<AdvisoryResponse>> {
    Ok(Json(state.advisory.ask(&id, req).await?))
}

// =============================================================================
// Approvals
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct ApprovalListParams {
    session_id: Option<String>,
    #[serde(default)]
    pending: bool,
}

async fn list_approvals(
    State(state): State<AppState>,
    Query(params): Query<ApprovalListParams>,
) -> Result<Json<Vec<Approval>>> {
    let query = ApprovalQuery {
        session_id: params.session_id,
        pending_only: params.pending,
    };
    Ok(Json(state.approvals.list(&query).await?))
}

async fn get_approval(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Approval>> {
    Ok(Json(state.approvals.get(&ApprovalKey::parse(&id)).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DecideRequest {
    decision: Decision,
    #[serde(default)]
    comment: Option<String>,
    #[serde(default)]
    attachments: Vec<String>,
    #[serde(default)]
    updated_input: Option<serde_json::Value>,
}

/// Accepts an approval id or a tool-use id
async fn decide(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<DecideRequest>,
) -> Result<Json<Approval>> {
    let resolution = Resolution {
        decision: req.decision,
        comment: req.comment,
        attachments: req.attachments,
        updated_input: req.updated_input.filter(|_| req.decision.is_approve()),
    };
    Ok(Json(state.approvals.decide(ApprovalKey::parse(&id), resolution).await?))
}

// =============================================================================
// Events
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct EventParams {
    /// Comma-separated event types; empty means all
    types: Option<String>,
    session_id: Option<String>,
}

fn parse_filter(params: EventParams) -> Result<EventFilter> {
    let mut types = Vec::new();
    for raw in params
        .types
        .as_deref()
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        let event_type = EventType::parse(raw)
            .ok_or_else(|| HitlError::InvalidRequest(format!("Unknown event type: {}", raw)))?;
        types.push(event_type);
    }

    let filter = EventFilter::types(types);
    Ok(match params.session_id {
        Some(session_id) => filter.for_session(session_id),
        None => filter,
    })
}

async fn events(
    State(state): State<AppState>,
    Query(params): Query<EventParams>,
) -> Result<Sse<impl Stream<Item = std::result::Result<SseEvent, axum::Error>>>> {
    let filter = parse_filter(params)?;
    let subscription = state
        .approvals
        .bus()
        .subscribe(state.shutdown.child_token(), filter);

    tracing::debug!(subscription = subscription.id(), "Event stream opened");

    let stream = subscription
        .into_stream()
        .map(|event| SseEvent::default().event(event.event_type.as_str()).json_data(&event));

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
