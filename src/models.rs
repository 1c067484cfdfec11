// src/models.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{OfflineError, Result};

/// Current layout version of both persisted snapshots.
pub const SNAPSHOT_VERSION: u32 = 1;

/// The status of a queued unit download.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Downloading,
    Paused,
    Completed,
    Failed,
}

/// One row of work: all segments of a unit for one variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadItem {
    pub id: String,
    pub unit_id: u32,
    pub variant_id: String,
    pub status: ItemStatus,
    pub progress_percent: u8,
    /// Display only.
    pub downloaded_bytes: u64,
    /// Display only.
    pub total_bytes_estimate: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl DownloadItem {
    pub fn new(unit_id: u32, variant_id: &str, total_bytes_estimate: u64) -> Self {
        Self {
            id: Self::id_for(unit_id, variant_id),
            unit_id,
            variant_id: variant_id.to_string(),
            status: ItemStatus::Pending,
            progress_percent: 0,
            downloaded_bytes: 0,
            total_bytes_estimate,
            created_at: Utc::now(),
            completed_at: None,
            last_error: None,
        }
    }

    /// The de-duplication key for a unit/variant pair.
    pub fn id_for(unit_id: u32, variant_id: &str) -> String {
        format!("{}:{:03}", variant_id, unit_id)
    }

    /// Puts the item back at the start of the pipeline, as a fresh admission would.
    pub fn readmit(&mut self) {
        self.status = ItemStatus::Pending;
        self.progress_percent = 0;
        self.downloaded_bytes = 0;
        self.completed_at = None;
        self.last_error = None;
    }
}

/// What is durably on disk for one variant.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CompletionMetadata {
    pub completed_unit_ids: BTreeSet<u32>,
    pub total_bytes: u64,
    /// Bytes recorded per unit, so deleting one unit can give its share back.
    #[serde(default)]
    pub unit_bytes: BTreeMap<u32, u64>,
}

impl CompletionMetadata {
    pub fn insert(&mut self, unit_id: u32, bytes: u64) {
        if let Some(previous) = self.unit_bytes.insert(unit_id, bytes) {
            self.total_bytes = self.total_bytes.saturating_sub(previous);
        }
        self.completed_unit_ids.insert(unit_id);
        self.total_bytes += bytes;
    }

    /// Returns whether the unit was recorded.
    pub fn remove(&mut self, unit_id: u32) -> bool {
        if !self.completed_unit_ids.remove(&unit_id) {
            return false;
        }
        let bytes = match self.unit_bytes.remove(&unit_id) {
            Some(bytes) => bytes,
            // Older snapshots only kept the aggregate.
            None => self.total_bytes / (self.completed_unit_ids.len() as u64 + 1),
        };
        self.total_bytes = self.total_bytes.saturating_sub(bytes);
        if self.completed_unit_ids.is_empty() {
            self.total_bytes = 0;
        }
        true
    }

    pub fn is_empty(&self) -> bool {
        self.completed_unit_ids.is_empty()
    }
}

/// Persisted form of the live queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub version: u32,
    pub items: Vec<DownloadItem>,
}

impl QueueSnapshot {
    pub const KEY: &'static str = "offline_downloads.queue";

    pub fn new(items: Vec<DownloadItem>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            items,
        }
    }

    /// Decodes a stored blob, upgrading older layouts.
    ///
    /// Version 0 stored the bare item array with no envelope.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)?;
        match value {
            Value::Array(_) => Ok(Self::new(serde_json::from_value(value)?)),
            Value::Object(_) => {
                let version = snapshot_version(&value);
                if version > SNAPSHOT_VERSION {
                    return Err(OfflineError::UnsupportedVersion {
                        key: Self::KEY,
                        found: version,
                    });
                }
                let mut snapshot: QueueSnapshot = serde_json::from_value(value)?;
                snapshot.version = SNAPSHOT_VERSION;
                Ok(snapshot)
            }
            _ => Err(unexpected_shape(Self::KEY)),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Persisted form of the completion ledger, keyed by variant id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataSnapshot {
    pub version: u32,
    pub variants: BTreeMap<String, CompletionMetadata>,
}

impl MetadataSnapshot {
    pub const KEY: &'static str = "offline_downloads.completed";

    pub fn new(variants: BTreeMap<String, CompletionMetadata>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            variants,
        }
    }

    /// Version 0 was the bare `variant -> metadata` map, so a variant may
    /// itself be called "version"; only the full envelope counts as v1.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)?;
        let Value::Object(ref fields) = value else {
            return Err(unexpected_shape(Self::KEY));
        };
        let enveloped = fields.get("version").is_some_and(Value::is_u64)
            && fields.get("variants").is_some_and(Value::is_object);
        if !enveloped {
            return Ok(Self::new(serde_json::from_value(value)?));
        }
        let version = snapshot_version(&value);
        if version > SNAPSHOT_VERSION {
            return Err(OfflineError::UnsupportedVersion {
                key: Self::KEY,
                found: version,
            });
        }
        let mut snapshot: MetadataSnapshot = serde_json::from_value(value)?;
        snapshot.version = SNAPSHOT_VERSION;
        Ok(snapshot)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

fn snapshot_version(value: &Value) -> u32 {
    value
        .get("version")
        .and_then(Value::as_u64)
        .map(|v| v.min(u32::MAX as u64) as u32)
        .unwrap_or(0)
}

fn unexpected_shape(key: &'static str) -> OfflineError {
    use serde::de::Error;
    OfflineError::Snapshot(serde_json::Error::custom(format!(
        "unexpected JSON shape for {key}"
    )))
}
