//! Audit history of administrative changes.

use sapi_core::{Attributes, Bucket, ChangeAction, HistoryEntry};
use sapi_store::{Filters, ReadOptions};
use tracing::debug;

use crate::error::ModelResult;
use crate::model::{Model, decode, ensure_uuid};

impl Model {
    /// Record a change. `started` defaults to now.
    pub async fn create_history(&self, mut entry: HistoryEntry) -> ModelResult<HistoryEntry> {
        ensure_uuid(&mut entry);
        if entry.started == 0 {
            entry.started = now_millis();
        }
        let stored = self.put_entity(&entry).await?;
        debug!(uuid = %stored.uuid, started = stored.started, "history entry recorded");
        Ok(stored)
    }

    pub async fn get_history(&self, uuid: &str) -> ModelResult<HistoryEntry> {
        self.locate_entity(uuid).await
    }

    /// Entries whose `started` falls within `[since, until]`.
    pub async fn list_history(
        &self,
        since: Option<i64>,
        until: Option<i64>,
    ) -> ModelResult<Vec<HistoryEntry>> {
        let mut filters = Filters::new();
        if let Some(since) = since {
            filters = filters.since(since);
        }
        if let Some(until) = until {
            filters = filters.until(until);
        }
        let mut entries: Vec<HistoryEntry> =
            self.list_entities(&filters, &ReadOptions::default()).await?;
        entries.sort_by_key(|e| e.started);
        Ok(entries)
    }

    /// Entries are reset wholesale: keys absent from `change` keep their
    /// stored values.
    pub async fn update_history(&self, uuid: &str, change: &Attributes) -> ModelResult<HistoryEntry> {
        let value = self
            .update_object(Bucket::History, uuid, change, ChangeAction::Set, self.config.update_retries)
            .await?;
        decode(value)
    }

    pub async fn delete_history(&self, uuid: &str) -> ModelResult<()> {
        self.delete_entity(Bucket::History, uuid).await
    }
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
