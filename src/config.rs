//! Daemon configuration
//!
//! Loaded from `<home>/config.toml`, where home is `$A3S_HITL_HOME` or
//! `~/.a3s/hitl`. Every field has a default, so a missing file or a
//! partial file is fine. Nothing here reads the process environment;
//! the binary resolves the home directory and passes env lookups in.

use crate::advisory::DEFAULT_MAX_EVENTS;
use crate::approval::ApprovalPolicy;
use crate::bus::DEFAULT_SUBSCRIBER_BUFFER;
use crate::error::{HitlError, Result};
use crate::gateway::GatewayConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Overrides the base directory for daemon state
pub const HOME_ENV: &str = "A3S_HITL_HOME";

const AUTO_DENY_ENV: &[&str] = &["A3S_HITL_AUTO_DENY_ALL", "MCP_AUTO_DENY_ALL"];

/// Default base directory for daemon state (`~/.a3s/hitl`)
pub fn hitl_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".a3s")
        .join("hitl")
}

/// Configuration file inside a home directory
pub fn config_path(home: &Path) -> PathBuf {
    home.join("config.toml")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusSection {
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

fn default_subscriber_buffer() -> usize {
    DEFAULT_SUBSCRIBER_BUFFER
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewaySection {
    /// Deny every tool request without recording it
    #[serde(default)]
    pub auto_deny_all: bool,

    /// Unset waits for a decision indefinitely
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicySection {
    #[serde(default)]
    pub auto_approve_tools: Vec<String>,

    #[serde(default)]
    pub deny_tools: Vec<String>,

    /// Overrides the built-in edit tool list when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit_tools: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvisorySection {
    #[serde(default = "default_agent_command")]
    pub command: String,

    #[serde(default = "default_advisory_model")]
    pub model: String,

    #[serde(default = "default_max_events")]
    pub max_events: usize,
}

fn default_agent_command() -> String {
    "claude".to_string()
}

fn default_advisory_model() -> String {
    "sonnet".to_string()
}

fn default_max_events() -> usize {
    DEFAULT_MAX_EVENTS
}

impl Default for AdvisorySection {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            model: default_advisory_model(),
            max_events: default_max_events(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSection {
    /// Command line used to launch session agents
    #[serde(default = "default_agent_command")]
    pub command: String,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
        }
    }
}

/// User-configurable settings for the daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitlConfig {
    /// Host address for the HTTP server (default: 127.0.0.1)
    #[serde(default = "default_host")]
    pub host: String,

    /// Port for the HTTP server (default: 7777)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory holding the store snapshot
    #[serde(default = "hitl_home")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub bus: BusSection,

    #[serde(default)]
    pub gateway: GatewaySection,

    #[serde(default)]
    pub policy: PolicySection,

    #[serde(default)]
    pub advisory: AdvisorySection,

    #[serde(default)]
    pub agent: AgentSection,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7777
}

impl Default for HitlConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            data_dir: hitl_home(),
            bus: BusSection::default(),
            gateway: GatewaySection::default(),
            policy: PolicySection::default(),
            advisory: AdvisorySection::default(),
            agent: AgentSection::default(),
        }
    }
}

impl HitlConfig {
    /// Load from `path`, or defaults if the file does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            HitlError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        toml::from_str(&content).map_err(|e| {
            HitlError::Config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Apply environment overrides
    ///
    /// `A3S_HITL_HOME` moves the data directory. `A3S_HITL_AUTO_DENY_ALL=true`
    /// (or the legacy `MCP_AUTO_DENY_ALL`) switches the gateway to
    /// auto-deny mode. Takes a lookup function so callers decide where
    /// values come from.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(home) = lookup(HOME_ENV).filter(|v| !v.is_empty()) {
            self.data_dir = PathBuf::from(home);
        }

        let enabled = AUTO_DENY_ENV
            .iter()
            .filter_map(|key| lookup(key))
            .any(|value| value.eq_ignore_ascii_case("true") || value == "1");
        if enabled {
            self.gateway.auto_deny_all = true;
        }
    }

    /// Server bind address (e.g. "127.0.0.1:7777")
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// URL agents use to reach the MCP endpoint
    pub fn gateway_url(&self) -> String {
        format!("http://{}/mcp", self.bind_address())
    }

    /// Store snapshot path
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("store.json")
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig::default()
            .with_auto_deny_all(self.gateway.auto_deny_all)
            .with_approval_timeout(self.gateway.approval_timeout_secs.map(Duration::from_secs))
    }

    pub fn approval_policy(&self) -> ApprovalPolicy {
        let mut policy = ApprovalPolicy::default()
            .with_auto_approve_tools(self.policy.auto_approve_tools.iter().cloned())
            .with_deny_tools(self.policy.deny_tools.iter().cloned());
        if let Some(edit_tools) = &self.policy.edit_tools {
            policy = policy.with_edit_tools(edit_tools.iter().cloned());
        }
        policy
    }
}
