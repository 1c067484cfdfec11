// src/error.rs

use crate::config::ConfigError;
use crate::store::StoreError;
use crate::transport::TransportError;
use thiserror::Error;

/// Errors surfaced by the offline download subsystem.
///
/// Transient transfer failures never show up here: they are retried inside
/// the worker and, once retries run out, recorded on the item itself.
#[derive(Debug, Error)]
pub enum OfflineError {
    #[error("unknown unit {0}")]
    UnknownUnit(u32),
    #[error("unknown variant {0:?}")]
    UnknownVariant(String),
    #[error("segment {segment} is out of range for unit {unit_id}")]
    SegmentOutOfRange { unit_id: u32, segment: u32 },
    #[error("download item {0} not found")]
    ItemNotFound(String),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),
    #[error("unsupported snapshot version {found} for {key}")]
    UnsupportedVersion { key: &'static str, found: u32 },
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("download manager has shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, OfflineError>;
