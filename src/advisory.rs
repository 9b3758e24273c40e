//! Ephemeral advisory queries
//!
//! Answers a reviewer's clarifying question about a session with a
//! single model turn. Builds a context summary from the session and
//! (optionally) its recent conversation, asks the model, and returns
//! the answer. Nothing is persisted and no event is published.

use crate::error::{HitlError, Result};
use crate::session::SessionRegistry;
use crate::types::{ConversationEvent, ConversationEventKind, Session};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::process::Command;

/// Conversation entries included when the request does not say
pub const DEFAULT_MAX_EVENTS: usize = 20;

/// Messages longer than this are cut in the context summary
pub const MAX_MESSAGE_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvisoryRequest {
    pub message: String,

    #[serde(default)]
    pub include_recent_events: bool,

    /// Falls back to the service default when unset or zero
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_events: Option<usize>,
}

impl AdvisoryRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            include_recent_events: false,
            max_events: None,
        }
    }

    pub fn with_recent_events(mut self, max_events: usize) -> Self {
        self.include_recent_events = true;
        self.max_events = Some(max_events);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvisoryResponse {
    pub content: String,
}

/// Single-turn language model backend
#[async_trait]
pub trait AdvisoryModel: Send + Sync {
    /// Answer `prompt`, running in `working_dir` when it is non-empty
    async fn complete(&self, prompt: &str, working_dir: &str) -> Result<String>;
}

/// Runs the agent CLI in print mode for one turn
#[derive(Debug, Clone)]
pub struct ClaudeCliModel {
    command: String,
    model: String,
}

#[derive(Deserialize)]
struct CliResult {
    #[serde(default)]
    is_error: bool,

    #[serde(default)]
    result: String,
}

impl ClaudeCliModel {
    pub fn new(command: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl AdvisoryModel for ClaudeCliModel {
    async fn complete(&self, prompt: &str, working_dir: &str) -> Result<String> {
        let parts = shell_words::split(&self.command)
            .map_err(|e| HitlError::Advisory(format!("Invalid advisory command: {}", e)))?;
        let Some((program, args)) = parts.split_first() else {
            return Err(HitlError::Advisory("Advisory command is empty".to_string()));
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg("--print")
            .arg(prompt)
            .args(["--output-format", "json", "--max-turns", "1"])
            .args(["--model", &self.model])
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);

        if !working_dir.is_empty() && Path::new(working_dir).is_dir() {
            cmd.current_dir(working_dir);
        }

        let output = cmd
            .output()
            .await
            .map_err(|e| HitlError::Advisory(format!("Failed to run {}: {}", program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HitlError::Advisory(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                stderr.trim()
            )));
        }

        let parsed: CliResult = serde_json::from_slice(&output.stdout)?;
        if parsed.is_error {
            return Err(HitlError::Advisory(format!("Model returned error: {}", parsed.result)));
        }
        Ok(parsed.result)
    }
}

/// Summarise a session for the prompt
pub fn build_context(session: &Session, recent: &[ConversationEvent]) -> String {
    let mut parts = vec![format!("Session Query: {}", session.query)];
    if let Some(summary) = session.summary.as_deref().filter(|s| !s.is_empty()) {
        parts.push(format!("Session Summary: {}", summary));
    }
    if !session.working_dir.is_empty() {
        parts.push(format!("Working Directory: {}", session.working_dir));
    }
    parts.push(format!("Session Status: {}", session.status));

    let lines: Vec<String> = recent.iter().filter_map(describe_event).collect();
    if !lines.is_empty() {
        parts.push(format!("\nRecent Conversation:\n{}", lines.join("\n")));
    }

    parts.join("\n")
}

fn describe_event(event: &ConversationEvent) -> Option<String> {
    match event.kind {
        ConversationEventKind::Message if !event.content.is_empty() => {
            let role = match event.role.as_deref() {
                Some("assistant") => "Assistant",
                _ => "User",
            };
            Some(format!("{}: {}", role, truncate(&event.content, MAX_MESSAGE_CHARS)))
        }
        ConversationEventKind::ToolCall => event
            .tool_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .map(|name| format!("Tool Call: {}", name)),
        _ => None,
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Wrap the context and question into the model prompt
pub fn build_prompt(context: &str, question: &str) -> String {
    format!(
        "You are answering a clarifying question about a coding session.\n\
         The user is reviewing a session and wants to understand what's happening before making a decision.\n\
         Provide concise, helpful answers based on the context below.\n\
         \n\
         Session Context:\n\
         {context}\n\
         \n\
         User's Question: {question}\n\
         \n\
         Important: Keep your response focused and concise. This is an ephemeral chat."
    )
}

/// Advisory query front end
#[derive(Clone)]
pub struct AdvisoryService {
    sessions: SessionRegistry,
    model: Arc<dyn AdvisoryModel>,
    default_max_events: usize,
}

impl AdvisoryService {
    pub fn new(sessions: SessionRegistry, model: Arc<dyn AdvisoryModel>) -> Self {
        Self {
            sessions,
            model,
            default_max_events: DEFAULT_MAX_EVENTS,
        }
    }

    pub fn with_default_max_events(mut self, max_events: usize) -> Self {
        self.default_max_events = max_events;
        self
    }

    pub async fn ask(
        &self,
        session_id: &str,
        request: AdvisoryRequest,
    ) -> Result<AdvisoryResponse> {
        let started = Instant::now();

        if request.message.trim().is_empty() {
            return Err(HitlError::InvalidRequest("Message is required".to_string()));
        }
        let max_events = request
            .max_events
            .filter(|n| *n > 0)
            .unwrap_or(self.default_max_events);

        let session = self.sessions.get(session_id).await?;

        let recent = if request.include_recent_events {
            match self.sessions.conversation(session_id).await {
                Ok(events) => {
                    let skip = events.len().saturating_sub(max_events);
                    events.into_iter().skip(skip).collect()
                }
                Err(e) => {
                    tracing::warn!(
                        session_id = %session_id,
                        error = %e,
                        "Conversation unavailable for advisory context"
                    );
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let prompt = build_prompt(&build_context(&session, &recent), &request.message);
        let content = self.model.complete(&prompt, &session.working_dir).await?;

        tracing::info!(
            session_id = %session_id,
            duration_ms = started.elapsed().as_millis() as u64,
            "Advisory query completed"
        );

        Ok(AdvisoryResponse { content })
    }
}
