//! Execution Audit Log
//!
//! Append-only record of every dispatch attempt, success or failure. Feeds
//! billing views and operator debugging; rows are never mutated.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use wisp_common::{ExecutionMode, ModuleId, UserId};

/// Terminal status of one dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Failed,
}

/// One dispatch attempt, written exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub id: Uuid,
    pub user_id: UserId,
    pub module_id: ModuleId,
    pub license_id: Uuid,
    pub execution_mode: ExecutionMode,
    pub status: ExecutionStatus,
    /// Serialized input size in bytes.
    pub input_size: u64,
    /// Serialized output size in bytes.
    pub output_size: u64,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Per-user usage rollup over the log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageStats {
    pub total_executions: u64,
    pub total_duration_ms: u64,
    pub total_input_bytes: u64,
}

/// Append-only log store.
#[derive(Default)]
pub struct ExecutionLogStore {
    entries: RwLock<Vec<ExecutionLog>>,
}

impl ExecutionLogStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one row. There is no update or delete path.
    pub fn append(&self, entry: ExecutionLog) {
        self.entries.write().push(entry);
    }

    /// Number of rows ever written.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when nothing has been logged yet.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Rows for one user, oldest first.
    pub fn for_user(&self, user: UserId) -> Vec<ExecutionLog> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.user_id == user)
            .cloned()
            .collect()
    }

    /// Rows for one module, oldest first.
    pub fn for_module(&self, module: &str) -> Vec<ExecutionLog> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.module_id == module)
            .cloned()
            .collect()
    }

    /// Usage rollup for one user's billing view.
    pub fn stats_for_user(&self, user: UserId) -> UsageStats {
        let entries = self.entries.read();
        let mut stats = UsageStats::default();
        for entry in entries.iter().filter(|e| e.user_id == user) {
            stats.total_executions += 1;
            stats.total_duration_ms += entry.duration_ms;
            stats.total_input_bytes += entry.input_size;
        }
        stats
    }
}
