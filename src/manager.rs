// src/manager.rs

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::catalog::ContentCatalog;
use crate::config::ManagerConfig;
use crate::error::{OfflineError, Result};
use crate::events::{CompletionEvent, ErrorEvent, EventHub, ListenerId, ProgressEvent};
use crate::locator::SegmentLocator;
use crate::metadata::MetadataStore;
use crate::models::{DownloadItem, ItemStatus};
use crate::network::{NetworkGate, NetworkMonitor};
use crate::queue::{Admission, QueueManager, QueueParts};
use crate::store::KeyValueStore;
use crate::transport::FileTransport;

/// The collaborators a `DownloadManager` is built from.
#[derive(Clone)]
pub struct Dependencies {
    pub catalog: Arc<dyn ContentCatalog>,
    pub network: Arc<dyn NetworkMonitor>,
    pub store: Arc<dyn KeyValueStore>,
    pub transport: Arc<dyn FileTransport>,
}

/// Entry point for offline downloads.
///
/// Each instance owns its own queue and ledger; nothing is global. Usage
/// errors (unknown unit, variant or item) are returned as `Err` right away,
/// while transfer failures end up on the item and as error events.
pub struct DownloadManager {
    queue: Arc<QueueManager>,
    metadata: Arc<MetadataStore>,
    events: Arc<EventHub>,
    gate: Arc<NetworkGate>,
    locator: SegmentLocator,
    catalog: Arc<dyn ContentCatalog>,
    transport: Arc<dyn FileTransport>,
}

impl DownloadManager {
    /// Loads persisted state. Processing does not begin until `start`.
    pub async fn new(config: ManagerConfig, deps: Dependencies) -> Result<Self> {
        config.validate()?;

        let metadata = Arc::new(MetadataStore::load(deps.store.clone()).await?);
        let events = Arc::new(EventHub::new());
        let gate = Arc::new(NetworkGate::new(deps.network.clone(), config.require_unmetered));
        let locator = SegmentLocator::new(&config);

        let queue = QueueManager::load(QueueParts {
            config,
            locator: locator.clone(),
            catalog: deps.catalog.clone(),
            transport: deps.transport.clone(),
            gate: gate.clone(),
            events: events.clone(),
            metadata: metadata.clone(),
            store: deps.store,
        })
        .await?;

        Ok(Self {
            queue,
            metadata,
            events,
            gate,
            locator,
            catalog: deps.catalog,
            transport: deps.transport,
        })
    }

    /// Resumes pending work and starts listening for network changes.
    pub fn start(&self) {
        info!("starting offline download manager");
        self.queue.start();
    }

    /// Stops all workers; in-flight items stay pending for the next start.
    pub async fn shutdown(&self) {
        info!("shutting down offline download manager");
        self.queue.shutdown().await;
    }

    /// Resolves once the queue has nothing left it is allowed to work on.
    pub async fn wait_until_idle(&self) {
        self.queue.wait_until_idle().await;
    }

    pub async fn enqueue_unit(&self, unit_id: u32, variant_id: &str) -> Result<Admission> {
        self.check_unit(unit_id)?;
        self.locator.variant(variant_id)?;
        self.queue.enqueue(unit_id, variant_id).await
    }

    /// Queues every unit of the catalog that is not downloaded yet, one
    /// admission at a time.
    pub async fn enqueue_all_units(&self, variant_id: &str) -> Result<Vec<Admission>> {
        self.locator.variant(variant_id)?;
        let mut admissions = Vec::new();
        for unit_id in self.catalog.unit_ids() {
            if self.metadata.is_unit_complete(unit_id, variant_id).await {
                continue;
            }
            admissions.push(self.queue.enqueue(unit_id, variant_id).await?);
        }
        Ok(admissions)
    }

    pub async fn pause(&self, item_id: &str) -> Result<ItemStatus> {
        self.queue.pause(item_id).await
    }

    pub async fn resume(&self, item_id: &str) -> Result<ItemStatus> {
        self.queue.resume(item_id).await
    }

    pub async fn retry(&self, item_id: &str) -> Result<ItemStatus> {
        self.queue.retry(item_id).await
    }

    /// Removes the item and every local file of its unit.
    pub async fn cancel(&self, item_id: &str) -> Result<()> {
        self.queue.cancel(item_id).await.map(|_| ())
    }

    /// Stops and removes everything belonging to the variant, including
    /// units that already finished. Returns how many queued items were dropped.
    pub async fn cancel_all_for_variant(&self, variant_id: &str) -> Result<usize> {
        self.locator.variant(variant_id)?;
        self.queue.cancel_variant(variant_id).await
    }

    pub async fn is_unit_downloaded(&self, unit_id: u32, variant_id: &str) -> Result<bool> {
        self.check_unit(unit_id)?;
        self.locator.variant(variant_id)?;
        Ok(self.metadata.is_unit_complete(unit_id, variant_id).await)
    }

    /// The local file of one segment, if it is actually on disk.
    pub async fn local_segment_path(
        &self,
        unit_id: u32,
        segment: u32,
        variant_id: &str,
    ) -> Result<Option<PathBuf>> {
        self.check_unit(unit_id)?;
        if segment == 0 || segment > self.catalog.segment_count(unit_id) {
            return Err(OfflineError::SegmentOutOfRange { unit_id, segment });
        }
        let path = self.locator.local_path(unit_id, segment, variant_id)?;
        Ok(self.transport.exists(&path).await.then_some(path))
    }

    pub async fn completed_units(&self, variant_id: &str) -> Result<BTreeSet<u32>> {
        self.locator.variant(variant_id)?;
        Ok(self.metadata.completed_units(variant_id).await)
    }

    pub async fn storage_used_for_variant(&self, variant_id: &str) -> Result<u64> {
        self.locator.variant(variant_id)?;
        Ok(self.metadata.storage_used(variant_id).await)
    }

    pub async fn variants_with_downloads(&self) -> Vec<String> {
        self.metadata.variants_with_downloads().await
    }

    /// Deletes one unit's files and completion record, cancelling any queued
    /// download of it first.
    pub async fn delete_unit(&self, unit_id: u32, variant_id: &str) -> Result<()> {
        self.check_unit(unit_id)?;
        self.locator.variant(variant_id)?;

        let id = DownloadItem::id_for(unit_id, variant_id);
        match self.queue.cancel(&id).await {
            Ok(_) | Err(OfflineError::ItemNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.queue.delete_unit_files(unit_id, variant_id).await?;
        self.metadata.remove_unit(unit_id, variant_id).await?;
        info!(unit = unit_id, variant = variant_id, "deleted unit");
        Ok(())
    }

    /// Same purge as `cancel_all_for_variant`.
    pub async fn delete_all_for_variant(&self, variant_id: &str) -> Result<()> {
        self.cancel_all_for_variant(variant_id).await.map(|_| ())
    }

    /// Snapshot of the live queue in admission order.
    pub async fn items(&self) -> Vec<DownloadItem> {
        self.queue.items().await
    }

    pub async fn item(&self, item_id: &str) -> Option<DownloadItem> {
        self.queue.item(item_id).await
    }

    pub fn may_transfer(&self) -> bool {
        self.gate.may_transfer()
    }

    /// Changes the unmetered-only policy and re-checks the queue.
    pub fn set_require_unmetered(&self, required: bool) {
        self.gate.set_require_unmetered(required);
        self.queue.trigger();
    }

    pub fn on_progress(&self, listener: impl Fn(&ProgressEvent) + Send + Sync + 'static) -> ListenerId {
        self.events.on_progress(listener)
    }

    pub fn on_completion(&self, listener: impl Fn(&CompletionEvent) + Send + Sync + 'static) -> ListenerId {
        self.events.on_completion(listener)
    }

    pub fn on_error(&self, listener: impl Fn(&ErrorEvent) + Send + Sync + 'static) -> ListenerId {
        self.events.on_error(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.events.remove(id)
    }

    fn check_unit(&self, unit_id: u32) -> Result<()> {
        if self.catalog.exists(unit_id) {
            Ok(())
        } else {
            Err(OfflineError::UnknownUnit(unit_id))
        }
    }
}
