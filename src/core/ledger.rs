//! In-memory record of completed proxy calls.
//!
//! The ledger is a bounded FIFO: every finished attempt (success or failure)
//! appends one immutable record, and the oldest record is evicted once the
//! ring is full. Nothing here is persisted; a restart starts empty.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use utoipa::ToSchema;

/// Default ring capacity.
pub const DEFAULT_LEDGER_CAPACITY: usize = 10_000;

/// Terminal state of a proxied call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum UsageStatus {
    /// Response relayed to completion.
    Ok,
    /// Upstream failed before any byte reached the caller.
    UpstreamError,
    /// Stream broke after bytes were already downstream.
    StreamAborted,
    /// Caller went away mid-response.
    ClientDisconnect,
}

/// One completed call.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UsageRecord {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub model: String,
    pub provider: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub status: UsageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Rolling totals for one provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ProviderUsageSummary {
    pub requests: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Bounded FIFO of usage records with thread-safe append and snapshot.
pub struct UsageLedger {
    records: Mutex<VecDeque<UsageRecord>>,
    capacity: usize,
}

impl UsageLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    /// Append a record, evicting the oldest entry on overflow.
    pub fn append(&self, record: UsageRecord) {
        let mut records = self.records.lock().expect("ledger lock poisoned");
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// The most recent `n` records, newest first.
    pub fn recent(&self, n: usize) -> Vec<UsageRecord> {
        let records = self.records.lock().expect("ledger lock poisoned");
        records.iter().rev().take(n).cloned().collect()
    }

    /// Rolling totals grouped by provider.
    pub fn summary_by_provider(&self) -> BTreeMap<String, ProviderUsageSummary> {
        let records = self.records.lock().expect("ledger lock poisoned");
        let mut summary: BTreeMap<String, ProviderUsageSummary> = BTreeMap::new();
        for record in records.iter() {
            let entry = summary.entry(record.provider.clone()).or_default();
            entry.requests += 1;
            if record.status == UsageStatus::Ok {
                entry.succeeded += 1;
            } else {
                entry.failed += 1;
            }
            entry.prompt_tokens += record.prompt_tokens;
            entry.completion_tokens += record.completion_tokens;
            entry.total_tokens += record.total_tokens;
        }
        summary
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("ledger lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.records.lock().expect("ledger lock poisoned").clear();
    }
}

impl Default for UsageLedger {
    fn default() -> Self {
        Self::new(DEFAULT_LEDGER_CAPACITY)
    }
}
