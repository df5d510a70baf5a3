use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// One search hit, kept as the `_id`/`_source` pair it was read as.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_source", default)]
    pub source: Value,
}

#[cfg(test)]
impl Document {
    pub fn new(id: impl Into<String>, source: Value) -> Self {
        Self {
            id: id.into(),
            source,
        }
    }
}

/// One page of a scroll cursor.
#[derive(Debug, Clone)]
pub struct Batch {
    pub documents: Vec<Document>,
    pub cursor: Option<String>,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexTemplate {
    pub settings: Value,
    pub mappings: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkFailure {
    pub id: Option<String>,
    pub status: u16,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteOutcome {
    pub written: usize,
    pub failures: Vec<BulkFailure>,
}

#[derive(Debug, Clone)]
pub struct TransferReport {
    pub source_index: String,
    pub destination: String,
    pub expected_total: u64,
    pub documents_read: u64,
    pub documents_written: u64,
    pub batches: u64,
    pub failures: Vec<BulkFailure>,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
}

impl TransferReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.documents_written == self.documents_read
    }
}
