//! Bridge runtime state.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::ProxyConfig;

/// Ring-buffer capacity for `/logs`.
const LOG_CAPACITY: usize = 1_000;
/// Entries returned when `?limit=` is absent.
pub const DEFAULT_LOG_LIMIT: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

/// Mutable control-plane state behind the authenticated endpoints.
#[derive(Default)]
pub struct ControlState {
    /// Whether traffic interception is currently switched on.
    pub proxy_enabled: bool,
    /// Proxy configuration as pushed by the host UI.
    pub config: ProxyConfig,
    /// Credential bag supplied on `proxy/enable`, layered over the
    /// environment when the proxy resolves providers.
    pub credentials: HashMap<String, String>,
}

/// Shared state for one bridge process.
pub struct BridgeState {
    /// Hex-encoded SHA-256 digest of the announced bearer token.
    pub token_hash: String,
    pub started_at: DateTime<Utc>,
    pub control: Mutex<ControlState>,
    logs: Mutex<VecDeque<LogEntry>>,
}

impl BridgeState {
    pub fn new(token_hash: String) -> Self {
        Self {
            token_hash,
            started_at: Utc::now(),
            control: Mutex::new(ControlState::default()),
            logs: Mutex::new(VecDeque::new()),
        }
    }

    /// Append a log entry, evicting the oldest beyond capacity.
    pub fn push_log(&self, level: &str, message: impl Into<String>) {
        let Ok(mut logs) = self.logs.lock() else {
            return;
        };
        if logs.len() == LOG_CAPACITY {
            logs.pop_front();
        }
        logs.push_back(LogEntry {
            at: Utc::now(),
            level: level.to_string(),
            message: message.into(),
        });
    }

    /// Most recent `limit` entries, oldest first.
    pub fn recent_logs(&self, limit: usize) -> Vec<LogEntry> {
        let Ok(logs) = self.logs.lock() else {
            return Vec::new();
        };
        logs.iter()
            .rev()
            .take(limit)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    }
}
