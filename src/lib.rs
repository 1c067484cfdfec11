//! Offline download manager for per-verse recitation audio.
//!
//! Units (surahs) are downloaded segment by segment (verse by verse) into a
//! per-variant (per-reciter) directory. The queue and the ledger of finished
//! units are persisted through a key-value store after every change, so work
//! survives restarts and picks up where it left off.

pub mod catalog;
pub mod config;
pub mod error;
pub mod events;
pub mod locator;
pub mod manager;
pub mod metadata;
pub mod models;
pub mod network;
mod queue;
pub mod store;
pub mod transport;

pub use error::{OfflineError, Result};
pub use manager::{DownloadManager, Dependencies};
pub use queue::Admission;

/// Convenient type alias exposing common structs.
pub mod prelude {
    pub use crate::catalog::{ContentCatalog, SurahCatalog};
    pub use crate::config::{ManagerConfig, VariantConfig};
    pub use crate::events::{CompletionEvent, ErrorEvent, ListenerId, ProgressEvent};
    pub use crate::manager::{Dependencies, DownloadManager};
    pub use crate::models::{DownloadItem, ItemStatus};
    pub use crate::network::{ManualNetworkMonitor, NetworkMonitor, NetworkStatus};
    pub use crate::queue::Admission;
    pub use crate::store::{KeyValueStore, MemoryStore, SqliteStore};
    pub use crate::transport::{FileTransport, HttpTransport, TransferOutcome};
    pub use crate::OfflineError;
}
