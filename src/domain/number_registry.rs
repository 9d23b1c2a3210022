//! Number registry: the dialable pool and per-number call statistics

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use super::shared::NumberEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LastCallStatus {
    Calling,
    Connected,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NumberStats {
    pub total_calls: u64,
    pub connected_calls: u64,
    pub failed_calls: u64,
    pub total_seconds: u64,
    pub last_call_time: Option<DateTime<Utc>>,
    pub last_call_status: Option<LastCallStatus>,
    pub last_sip_error: Option<String>,
}

impl NumberStats {
    pub fn total_minutes(&self) -> f64 {
        self.total_seconds as f64 / 60.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NumberRecord {
    #[serde(flatten)]
    pub entry: NumberEntry,
    pub stats: NumberStats,
}

/// Source of candidates and sink of attempt statistics
#[async_trait]
pub trait NumberRegistry: Send + Sync {
    async fn get_candidates(&self) -> Vec<NumberRecord>;

    /// Historical attempt count for a number, 0 when unknown
    async fn attempt_count(&self, number: &str) -> u64;

    async fn record_attempt_started(&self, number: &str);

    async fn record_attempt_connected(&self, number: &str, duration_seconds: u64);

    async fn record_attempt_failed(&self, number: &str, error_detail: &str);
}

/// In-memory number registry
#[derive(Default)]
pub struct InMemoryNumberRegistry {
    records: RwLock<Vec<NumberRecord>>,
}

impl InMemoryNumberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_numbers(entries: impl IntoIterator<Item = NumberEntry>) -> Self {
        Self {
            records: RwLock::new(
                entries
                    .into_iter()
                    .map(|entry| NumberRecord {
                        entry,
                        stats: NumberStats::default(),
                    })
                    .collect(),
            ),
        }
    }

    /// Add a number, or replace the entry (keeping stats) if it exists
    pub async fn upsert(&self, entry: NumberEntry) {
        let mut records = self.records.write().await;
        match records.iter_mut().find(|r| r.entry.number == entry.number) {
            Some(record) => record.entry = entry,
            None => records.push(NumberRecord {
                entry,
                stats: NumberStats::default(),
            }),
        }
    }

    pub async fn stats(&self, number: &str) -> Option<NumberStats> {
        self.records
            .read()
            .await
            .iter()
            .find(|r| r.entry.number == number)
            .map(|r| r.stats.clone())
    }

    async fn update(&self, number: &str, f: impl FnOnce(&mut NumberStats)) {
        let mut records = self.records.write().await;
        let index = match records.iter().position(|r| r.entry.number == number) {
            Some(index) => index,
            None => {
                records.push(NumberRecord {
                    entry: NumberEntry::new(number),
                    stats: NumberStats::default(),
                });
                records.len() - 1
            }
        };
        f(&mut records[index].stats);
    }
}

#[async_trait]
impl NumberRegistry for InMemoryNumberRegistry {
    async fn get_candidates(&self) -> Vec<NumberRecord> {
        self.records.read().await.clone()
    }

    async fn attempt_count(&self, number: &str) -> u64 {
        self.records
            .read()
            .await
            .iter()
            .find(|r| r.entry.number == number)
            .map(|r| r.stats.total_calls)
            .unwrap_or(0)
    }

    async fn record_attempt_started(&self, number: &str) {
        debug!("Call attempt started for {}", number);
        self.update(number, |stats| {
            stats.total_calls += 1;
            stats.last_call_time = Some(Utc::now());
            stats.last_call_status = Some(LastCallStatus::Calling);
        })
        .await;
    }

    async fn record_attempt_connected(&self, number: &str, duration_seconds: u64) {
        debug!("Call to {} connected for {}s", number, duration_seconds);
        self.update(number, |stats| {
            stats.connected_calls += 1;
            stats.total_seconds += duration_seconds;
            stats.last_call_status = Some(LastCallStatus::Connected);
            stats.last_sip_error = None;
        })
        .await;
    }

    async fn record_attempt_failed(&self, number: &str, error_detail: &str) {
        debug!("Call to {} failed: {}", number, error_detail);
        self.update(number, |stats| {
            stats.failed_calls += 1;
            stats.last_call_status = Some(LastCallStatus::Failed);
            stats.last_sip_error = Some(error_detail.to_string());
        })
        .await;
    }
}
