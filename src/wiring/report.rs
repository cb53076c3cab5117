use std::collections::BTreeSet;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Serialize, Serializer};

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum NodeOutcome {
    Completed,
    Failed { error: String },
    /// Not run because a predecessor failed or was skipped, or the run was cancelled.
    Skipped { blocked_by: Vec<String> },
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeRecord {
    pub node_id: String,
    pub level: usize,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub outcome: NodeOutcome,
}

impl NodeRecord {
    pub fn skipped(node_id: &str, level: usize, blocked_by: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            node_id: node_id.to_string(),
            level,
            started: now,
            finished: now,
            outcome: NodeOutcome::Skipped { blocked_by },
        }
    }
}

/// Result of one wiring execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub configuration: String,
    pub records: Vec<NodeRecord>,
    pub failed: BTreeSet<String>,
    pub skipped: BTreeSet<String>,
    #[serde(serialize_with = "as_millis")]
    pub total: TimeDelta,
    pub cancelled: bool,
}

impl ExecutionReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty() && !self.cancelled
    }

    pub fn record(&self, node_id: &str) -> Option<&NodeRecord> {
        self.records.iter().find(|r| r.node_id == node_id)
    }

    pub fn completed(&self) -> Vec<&str> {
        self.records
            .iter()
            .filter(|r| r.outcome == NodeOutcome::Completed)
            .map(|r| r.node_id.as_str())
            .collect()
    }
}

fn as_millis<S: Serializer>(d: &TimeDelta, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_i64(d.num_milliseconds())
}
