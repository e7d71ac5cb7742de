//! Session Records
//!
//! Data structures describing pooled remote browser sessions.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

fn default_true() -> bool {
    true
}

fn default_session_timeout() -> u64 {
    30 * 60
}

fn default_viewport_width() -> u32 {
    1920
}

fn default_viewport_height() -> u32 {
    1080
}

/// Options passed to the provider when creating a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_true")]
    pub use_proxy: bool,

    /// Ask the provider for fingerprint evasion
    #[serde(default = "default_true")]
    pub stealth: bool,

    #[serde(default = "default_true")]
    pub keep_alive: bool,

    /// Remote lifetime requested from the provider
    #[serde(default = "default_session_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_viewport_width")]
    pub viewport_width: u32,

    #[serde(default = "default_viewport_height")]
    pub viewport_height: u32,

    #[serde(default)]
    pub user_agent: Option<String>,

    #[serde(default)]
    pub name: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            use_proxy: true,
            stealth: true,
            keep_alive: true,
            timeout_secs: default_session_timeout(),
            viewport_width: default_viewport_width(),
            viewport_height: default_viewport_height(),
            user_agent: None,
            name: None,
        }
    }
}

/// Health state of a pooled session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    /// Scheduled for replacement by the next cleanup pass
    Unhealthy,
    Closed,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Active => "ACTIVE",
            Self::Unhealthy => "UNHEALTHY",
            Self::Closed => "CLOSED",
        };
        f.write_str(label)
    }
}

/// Opaque reference to the remote browser behind a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandle {
    /// Identifier assigned by the provider
    pub remote_id: String,

    /// Endpoint a browser driver connects to
    #[serde(default)]
    pub connect_url: Option<String>,
}

impl SessionHandle {
    pub fn new(remote_id: impl Into<String>) -> Self {
        Self {
            remote_id: remote_id.into(),
            connect_url: None,
        }
    }

    pub fn with_connect_url(mut self, url: impl Into<String>) -> Self {
        self.connect_url = Some(url.into());
        self
    }
}

/// One pooled session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub task_type: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub error_count: u32,

    /// Namespace -> data kept for the session's lifetime
    #[serde(default)]
    pub context: HashMap<String, Value>,

    pub handle: SessionHandle,
}

impl SessionInfo {
    pub fn new(id: impl Into<String>, task_type: impl Into<String>, handle: SessionHandle) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            task_type: task_type.into(),
            status: SessionStatus::Active,
            created_at: now,
            last_used: now,
            error_count: 0,
            context: HashMap::new(),
            handle,
        }
    }
}

/// Session counts for one task type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeStats {
    pub total: usize,
    pub in_use: usize,
    pub available: usize,
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub total_sessions: usize,
    pub in_use: usize,
    /// Idle ACTIVE sessions
    pub available: usize,
    pub unhealthy: usize,
    pub by_type: BTreeMap<String, TypeStats>,
}

impl PoolStats {
    /// Fraction of sessions currently leased.
    pub fn utilization(&self) -> f64 {
        if self.total_sessions == 0 {
            0.0
        } else {
            self.in_use as f64 / self.total_sessions as f64
        }
    }

    /// Total sessions of one task type.
    pub fn total_for(&self, task_type: &str) -> usize {
        self.by_type.get(task_type).map_or(0, |t| t.total)
    }
}

/// Result of a cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Ids of closed sessions
    pub closed: Vec<String>,
    /// Ids of replacement sessions
    pub created: Vec<String>,
}
