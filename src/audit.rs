use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::database::Database;
use crate::error::StoreResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEvent {
    GuildCreate,
    GuildDelete,
    InviteCheckStart,
    InviteCheckFinish,
    InviteRecycle,
    SettingUpdate,
}

/// Append-only lifecycle record. Entries are never updated or deleted here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub event: AuditEvent,
    #[serde(default)]
    pub metadata: Value,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(event: AuditEvent, metadata: Value) -> Self {
        Self {
            event,
            metadata,
            timestamp: Utc::now(),
        }
    }
}

impl Database {
    pub async fn create_audit_entry(&self, event: AuditEvent, metadata: Value) -> StoreResult<()> {
        self.create_audit_entries(vec![AuditEntry::new(event, metadata)])
            .await
    }

    pub async fn create_audit_entries(&self, entries: Vec<AuditEntry>) -> StoreResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        debug!(count = entries.len(), "writing audit entries");

        self.db
            .query("INSERT INTO audit $entries")
            .bind(("entries", entries))
            .await?
            .check()?;
        Ok(())
    }

    /// Entries with `start <= timestamp <= end`, oldest first.
    pub async fn read_audit_entries(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<AuditEntry>> {
        let mut response = self
            .db
            .query(
                "SELECT * FROM audit WHERE timestamp >= $start AND timestamp <= $end ORDER BY timestamp ASC",
            )
            .bind(("start", start.timestamp_millis()))
            .bind(("end", end.timestamp_millis()))
            .await?;
        Ok(response.take(0)?)
    }
}
