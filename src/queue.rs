// src/queue.rs

use chrono::Utc;
use futures_util::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::catalog::ContentCatalog;
use crate::config::ManagerConfig;
use crate::error::{OfflineError, Result};
use crate::events::{CompletionEvent, ErrorEvent, EventHub, ProgressEvent};
use crate::locator::SegmentLocator;
use crate::metadata::MetadataStore;
use crate::models::{DownloadItem, ItemStatus, QueueSnapshot};
use crate::network::{NetworkGate, NetworkStatus, Subscription};
use crate::store::KeyValueStore;
use crate::transport::FileTransport;

/// What `enqueue` did with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The unit is already recorded as downloaded; nothing was queued.
    AlreadyComplete,
    /// An item for the unit was already pending, downloading or paused.
    AlreadyQueued(String),
    Queued(String),
    /// A failed item was put back to pending.
    Requeued(String),
}

impl Admission {
    pub fn item_id(&self) -> Option<&str> {
        match self {
            Admission::AlreadyComplete => None,
            Admission::AlreadyQueued(id) | Admission::Queued(id) | Admission::Requeued(id) => {
                Some(id)
            }
        }
    }
}

/// Everything the queue needs from outside.
pub(crate) struct QueueParts {
    pub config: ManagerConfig,
    pub locator: SegmentLocator,
    pub catalog: Arc<dyn ContentCatalog>,
    pub transport: Arc<dyn FileTransport>,
    pub gate: Arc<NetworkGate>,
    pub events: Arc<EventHub>,
    pub metadata: Arc<MetadataStore>,
    pub store: Arc<dyn KeyValueStore>,
}

/// Control handles of a running worker.
#[derive(Clone)]
struct ActiveWorker {
    variant_id: String,
    cancel: CancellationToken,
    /// Cancelled once the worker has written its final state.
    finished: CancellationToken,
}

struct Job {
    id: String,
    unit_id: u32,
    variant_id: String,
    cancel: CancellationToken,
    finished: CancellationToken,
}

enum UnitOutcome {
    Completed { bytes: u64 },
    Failed(String),
    Interrupted,
}

enum SegmentOutcome {
    Done(u64),
    Cancelled,
    Exhausted(String),
}

#[derive(Default)]
struct DriverState {
    running: bool,
    rerun: bool,
}

/// Owns the download queue and the workers that drain it.
///
/// At most one driver task runs at a time. `trigger` either starts it or, if
/// it is already running, asks it for another pass, so admissions, resumes and
/// network changes can all call it freely.
pub struct QueueManager {
    config: ManagerConfig,
    locator: SegmentLocator,
    catalog: Arc<dyn ContentCatalog>,
    transport: Arc<dyn FileTransport>,
    gate: Arc<NetworkGate>,
    events: Arc<EventHub>,
    metadata: Arc<MetadataStore>,
    store: Arc<dyn KeyValueStore>,
    items: Mutex<Vec<DownloadItem>>,
    active: StdMutex<HashMap<String, ActiveWorker>>,
    variant_tokens: StdMutex<HashMap<String, CancellationToken>>,
    shutdown: CancellationToken,
    driver: StdMutex<DriverState>,
    idle: watch::Sender<bool>,
    runtime: Handle,
    network_subscription: StdMutex<Option<Subscription>>,
}

fn lock<T>(mutex: &StdMutex<T>) -> StdMutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl QueueManager {
    /// Restores the persisted queue. Must be called from within a tokio runtime.
    ///
    /// Items left `Downloading` by a previous process go back to `Pending`:
    /// there is no telling how far their transfer got.
    pub(crate) async fn load(parts: QueueParts) -> Result<Arc<Self>> {
        let mut items = match parts.store.get(QueueSnapshot::KEY).await? {
            Some(bytes) => QueueSnapshot::decode(&bytes)?.items,
            None => Vec::new(),
        };

        let mut reset = 0;
        for item in items.iter_mut().filter(|i| i.status == ItemStatus::Downloading) {
            item.status = ItemStatus::Pending;
            reset += 1;
        }
        if reset > 0 {
            let bytes = QueueSnapshot::new(items.clone()).encode()?;
            parts.store.set(QueueSnapshot::KEY, bytes).await?;
        }
        info!(items = items.len(), reset, "restored download queue");

        let (idle, _) = watch::channel(true);
        Ok(Arc::new(Self {
            config: parts.config,
            locator: parts.locator,
            catalog: parts.catalog,
            transport: parts.transport,
            gate: parts.gate,
            events: parts.events,
            metadata: parts.metadata,
            store: parts.store,
            items: Mutex::new(items),
            active: StdMutex::new(HashMap::new()),
            variant_tokens: StdMutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            driver: StdMutex::new(DriverState::default()),
            idle,
            runtime: Handle::current(),
            network_subscription: StdMutex::new(None),
        }))
    }

    /// Subscribes to connectivity changes (once) and starts processing.
    pub fn start(self: &Arc<Self>) {
        {
            let mut subscription = lock(&self.network_subscription);
            if subscription.is_none() {
                let queue = Arc::downgrade(self);
                *subscription = Some(self.gate.on_change(Arc::new(move |status: NetworkStatus| {
                    if let Some(queue) = queue.upgrade() {
                        debug!(online = status.online, "network changed, re-checking queue");
                        queue.trigger();
                    }
                })));
            }
        }
        self.trigger();
    }

    pub async fn enqueue(self: &Arc<Self>, unit_id: u32, variant_id: &str) -> Result<Admission> {
        if self.shutdown.is_cancelled() {
            return Err(OfflineError::Shutdown);
        }
        let admission = {
            let mut items = self.items.lock().await;
            // Checked under the queue lock so a worker cannot complete the
            // unit between this check and the insert below.
            if self.metadata.is_unit_complete(unit_id, variant_id).await {
                return Ok(Admission::AlreadyComplete);
            }

            let id = DownloadItem::id_for(unit_id, variant_id);
            match items.iter().position(|item| item.id == id) {
                Some(index) if items[index].status == ItemStatus::Failed => {
                    let mut next = items.clone();
                    next[index].readmit();
                    self.persist(&next).await?;
                    *items = next;
                    Admission::Requeued(id)
                }
                Some(_) => return Ok(Admission::AlreadyQueued(id)),
                None => {
                    let estimate = u64::from(self.catalog.segment_count(unit_id))
                        * self.config.segment_size_estimate;
                    let mut next = items.clone();
                    next.push(DownloadItem::new(unit_id, variant_id, estimate));
                    self.persist(&next).await?;
                    *items = next;
                    Admission::Queued(id)
                }
            }
        };
        info!(unit = unit_id, variant = variant_id, ?admission, "admitted download");
        self.trigger();
        Ok(admission)
    }

    /// Stops a pending or downloading item. Other states are left alone.
    pub async fn pause(&self, id: &str) -> Result<ItemStatus> {
        let status = self
            .transition(id, |item| match item.status {
                ItemStatus::Pending | ItemStatus::Downloading => Some(ItemStatus::Paused),
                _ => None,
            })
            .await?;
        if let Some(worker) = lock(&self.active).get(id) {
            worker.cancel.cancel();
        }
        Ok(status)
    }

    pub async fn resume(self: &Arc<Self>, id: &str) -> Result<ItemStatus> {
        let status = self
            .transition(id, |item| (item.status == ItemStatus::Paused).then_some(ItemStatus::Pending))
            .await?;
        self.trigger();
        Ok(status)
    }

    /// Explicit retry of a failed item.
    pub async fn retry(self: &Arc<Self>, id: &str) -> Result<ItemStatus> {
        let status = {
            let mut items = self.items.lock().await;
            let index = position(&items, id)?;
            if items[index].status == ItemStatus::Failed {
                let mut next = items.clone();
                next[index].readmit();
                self.persist(&next).await?;
                *items = next;
            }
            items[index].status
        };
        self.trigger();
        Ok(status)
    }

    /// Removes the item and every local segment of its unit.
    ///
    /// Returns only after a worker running the item has stopped, so it cannot
    /// write a segment back after the delete.
    pub async fn cancel(&self, id: &str) -> Result<DownloadItem> {
        let item = {
            let mut items = self.items.lock().await;
            let index = position(&items, id)?;
            let mut next = items.clone();
            let item = next.remove(index);
            self.persist(&next).await?;
            *items = next;
            item
        };

        let worker = lock(&self.active).get(id).cloned();
        if let Some(worker) = worker {
            worker.cancel.cancel();
            worker.finished.cancelled().await;
        }

        self.delete_unit_files(item.unit_id, &item.variant_id).await?;
        info!(item = id, "cancelled download");
        Ok(item)
    }

    /// Stops every worker of the variant, drops its queued items and purges
    /// all of its local content, completed units included.
    pub async fn cancel_variant(&self, variant_id: &str) -> Result<usize> {
        let removed = {
            let mut items = self.items.lock().await;
            let next: Vec<DownloadItem> = items
                .iter()
                .filter(|item| item.variant_id != variant_id)
                .cloned()
                .collect();
            let removed = items.len() - next.len();
            self.persist(&next).await?;
            *items = next;
            removed
        };

        if let Some(token) = lock(&self.variant_tokens).remove(variant_id) {
            token.cancel();
        }
        let workers: Vec<ActiveWorker> = lock(&self.active)
            .values()
            .filter(|worker| worker.variant_id == variant_id)
            .cloned()
            .collect();
        for worker in workers {
            worker.cancel.cancel();
            worker.finished.cancelled().await;
        }

        self.transport
            .delete_dir(&self.locator.variant_dir(variant_id)?)
            .await?;
        self.metadata.clear_variant(variant_id).await?;
        info!(variant = variant_id, removed, "purged variant");
        Ok(removed)
    }

    pub async fn delete_unit_files(&self, unit_id: u32, variant_id: &str) -> Result<()> {
        for segment in 1..=self.catalog.segment_count(unit_id) {
            let path = self.locator.local_path(unit_id, segment, variant_id)?;
            self.transport.delete(&path).await?;
        }
        debug!(unit = unit_id, variant = variant_id, "deleted unit files");
        Ok(())
    }

    pub async fn items(&self) -> Vec<DownloadItem> {
        self.items.lock().await.clone()
    }

    pub async fn item(&self, id: &str) -> Option<DownloadItem> {
        self.items.lock().await.iter().find(|item| item.id == id).cloned()
    }

    /// Stops all workers, leaving their items `Pending` for the next start.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        lock(&self.network_subscription).take();
        let workers: Vec<ActiveWorker> = lock(&self.active).values().cloned().collect();
        for worker in workers {
            worker.finished.cancelled().await;
        }
        self.wait_until_idle().await;
    }

    /// Resolves once no driver is running.
    pub async fn wait_until_idle(&self) {
        let mut idle = self.idle.subscribe();
        let _ = idle.wait_for(|idle| *idle).await;
    }

    /// Starts the driver, or asks the running one for another pass.
    pub fn trigger(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() {
            return;
        }
        {
            let mut driver = lock(&self.driver);
            if driver.running {
                driver.rerun = true;
                return;
            }
            driver.running = true;
            driver.rerun = false;
            self.idle.send_replace(false);
        }
        let queue = self.clone();
        self.runtime.spawn(async move { queue.drive().await });
    }

    async fn drive(self: Arc<Self>) {
        loop {
            self.drive_once().await;

            let again = {
                let mut driver = lock(&self.driver);
                if driver.rerun && !self.shutdown.is_cancelled() {
                    driver.rerun = false;
                    true
                } else {
                    driver.running = false;
                    self.idle.send_replace(true);
                    false
                }
            };
            if !again {
                break;
            }
        }
        debug!("queue driver idle");
    }

    /// Keeps up to `max_concurrent` workers busy until nothing is claimable.
    async fn drive_once(self: &Arc<Self>) {
        let mut workers = JoinSet::new();
        loop {
            while workers.len() < self.config.max_concurrent && !self.shutdown.is_cancelled() {
                if !self.gate.may_transfer() {
                    debug!("transfers not allowed on current network");
                    break;
                }
                match self.claim_next().await {
                    Some(job) => {
                        let queue = self.clone();
                        workers.spawn(async move { queue.run_worker(job).await });
                    }
                    None => break,
                }
            }

            match workers.join_next().await {
                Some(Ok(())) => {}
                Some(Err(e)) => error!(error = %e, "download worker aborted"),
                None => break,
            }
        }
    }

    /// Flips the first idle `Pending` item to `Downloading` and registers its
    /// worker handles, all under the queue lock.
    async fn claim_next(&self) -> Option<Job> {
        let mut items = self.items.lock().await;
        let index = {
            let active = lock(&self.active);
            items
                .iter()
                .position(|item| item.status == ItemStatus::Pending && !active.contains_key(&item.id))?
        };

        let mut next = items.clone();
        next[index].status = ItemStatus::Downloading;
        if let Err(e) = self.persist(&next).await {
            error!(item = %next[index].id, error = %e, "could not persist download start");
            return None;
        }
        *items = next;

        let item = &items[index];
        let cancel = self.variant_token(&item.variant_id).child_token();
        let finished = CancellationToken::new();
        lock(&self.active).insert(
            item.id.clone(),
            ActiveWorker {
                variant_id: item.variant_id.clone(),
                cancel: cancel.clone(),
                finished: finished.clone(),
            },
        );
        Some(Job {
            id: item.id.clone(),
            unit_id: item.unit_id,
            variant_id: item.variant_id.clone(),
            cancel,
            finished,
        })
    }

    fn variant_token(&self, variant_id: &str) -> CancellationToken {
        let mut tokens = lock(&self.variant_tokens);
        let token = tokens
            .entry(variant_id.to_string())
            .or_insert_with(|| self.shutdown.child_token());
        if token.is_cancelled() {
            *token = self.shutdown.child_token();
        }
        token.clone()
    }

    async fn run_worker(self: Arc<Self>, job: Job) {
        // Fires last, after the worker has left the active set.
        let _finished = job.finished.clone().drop_guard();
        info!(item = %job.id, "worker started");
        let outcome = AssertUnwindSafe(self.download_unit(&job))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                UnitOutcome::Failed(format!("download worker panicked: {}", panic_message(&*panic)))
            });
        self.finish(&job, outcome).await;
        lock(&self.active).remove(&job.id);
    }

    async fn download_unit(&self, job: &Job) -> UnitOutcome {
        let total = self.catalog.segment_count(job.unit_id);
        let prepared = match self.locator.variant_dir(&job.variant_id) {
            Ok(dir) => self.transport.make_directory(&dir).await.map_err(OfflineError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = prepared {
            return UnitOutcome::Failed(e.to_string());
        }

        let mut bytes = 0u64;
        for segment in 1..=total {
            if job.cancel.is_cancelled() {
                return UnitOutcome::Interrupted;
            }
            let (url, path) = match (
                self.locator.remote_url(job.unit_id, segment, &job.variant_id),
                self.locator.local_path(job.unit_id, segment, &job.variant_id),
            ) {
                (Ok(url), Ok(path)) => (url, path),
                (Err(e), _) | (_, Err(e)) => return UnitOutcome::Failed(e.to_string()),
            };

            if self.transport.exists(&path).await {
                bytes += self.transport.file_size(&path).await.unwrap_or(0);
                self.record_progress(job, segment, total, bytes, false).await;
                continue;
            }

            match self.fetch_segment(job, segment, &url, &path).await {
                SegmentOutcome::Done(written) => {
                    bytes += written;
                    self.record_progress(job, segment, total, bytes, true).await;
                }
                SegmentOutcome::Cancelled => return UnitOutcome::Interrupted,
                SegmentOutcome::Exhausted(reason) => {
                    return UnitOutcome::Failed(format!("segment {segment} failed: {reason}"));
                }
            }
        }
        UnitOutcome::Completed { bytes }
    }

    /// Up to `retry_attempts` tries with a fixed pause in between. Cancellation
    /// is checked before and after every attempt, never during one.
    async fn fetch_segment(
        &self,
        job: &Job,
        segment: u32,
        url: &str,
        path: &std::path::Path,
    ) -> SegmentOutcome {
        let attempts = self.config.retry_attempts;
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            if job.cancel.is_cancelled() {
                return SegmentOutcome::Cancelled;
            }
            let result = self.transport.download(url, path).await;
            if job.cancel.is_cancelled() {
                return SegmentOutcome::Cancelled;
            }
            match result {
                Ok(outcome) if outcome.success => return SegmentOutcome::Done(outcome.bytes),
                Ok(outcome) => last_error = format!("server responded with status {}", outcome.status_code),
                Err(e) => last_error = e.to_string(),
            }
            warn!(item = %job.id, segment, attempt, error = %last_error, "segment attempt failed");

            if attempt < attempts {
                tokio::select! {
                    _ = job.cancel.cancelled() => return SegmentOutcome::Cancelled,
                    _ = tokio::time::sleep(self.config.retry_delay()) => {}
                }
            }
        }
        SegmentOutcome::Exhausted(last_error)
    }

    async fn record_progress(&self, job: &Job, completed: u32, total: u32, bytes: u64, emit: bool) {
        let percent = if total == 0 {
            100
        } else {
            (f64::from(completed) / f64::from(total) * 100.0).round() as u8
        };

        let event = {
            let mut items = self.items.lock().await;
            let Ok(index) = position(&items, &job.id) else {
                return;
            };
            if items[index].status != ItemStatus::Downloading {
                return;
            }
            let mut next = items.clone();
            let item = &mut next[index];
            item.progress_percent = item.progress_percent.max(percent);
            item.downloaded_bytes = bytes;
            let event = ProgressEvent {
                item_id: item.id.clone(),
                unit_id: item.unit_id,
                variant_id: item.variant_id.clone(),
                progress_percent: item.progress_percent,
                completed_segments: completed,
                total_segments: total,
                downloaded_bytes: bytes,
            };
            if let Err(e) = self.persist(&next).await {
                warn!(item = %job.id, error = %e, "could not persist progress");
            }
            *items = next;
            event
        };
        if emit {
            self.events.emit_progress(event);
        }
    }

    async fn finish(&self, job: &Job, outcome: UnitOutcome) {
        let mut items = self.items.lock().await;
        let Ok(index) = position(&items, &job.id) else {
            debug!(item = %job.id, "item left the queue while downloading");
            return;
        };
        let mut next = items.clone();

        match outcome {
            UnitOutcome::Completed { bytes } if !job.cancel.is_cancelled() => {
                if let Err(e) = self
                    .metadata
                    .mark_unit_complete(job.unit_id, &job.variant_id, bytes)
                    .await
                {
                    drop(next);
                    self.fail(items, index, format!("could not record completion: {e}")).await;
                    return;
                }
                let mut item = next.remove(index);
                item.status = ItemStatus::Completed;
                item.progress_percent = 100;
                item.completed_at = Some(Utc::now());
                if let Err(e) = self.persist(&next).await {
                    error!(item = %item.id, error = %e, "could not persist completion");
                }
                *items = next;
                drop(items);

                info!(item = %item.id, bytes, "unit downloaded");
                self.events.emit_completion(CompletionEvent {
                    item_id: item.id,
                    unit_id: item.unit_id,
                    variant_id: item.variant_id,
                    total_bytes: bytes,
                });
            }
            UnitOutcome::Completed { .. } | UnitOutcome::Interrupted => {
                // A paused item stays paused; anything else goes back to pending.
                if next[index].status == ItemStatus::Downloading {
                    next[index].status = ItemStatus::Pending;
                }
                if let Err(e) = self.persist(&next).await {
                    error!(item = %job.id, error = %e, "could not persist interruption");
                }
                debug!(item = %job.id, status = ?next[index].status, "worker interrupted");
                *items = next;
            }
            UnitOutcome::Failed(reason) => {
                drop(next);
                self.fail(items, index, reason).await;
            }
        }
    }

    async fn fail(
        &self,
        mut items: tokio::sync::MutexGuard<'_, Vec<DownloadItem>>,
        index: usize,
        reason: String,
    ) {
        let mut next = items.clone();
        let item = &mut next[index];
        item.status = ItemStatus::Failed;
        item.last_error = Some(reason.clone());
        let event = ErrorEvent {
            item_id: item.id.clone(),
            unit_id: item.unit_id,
            variant_id: item.variant_id.clone(),
            message: reason,
        };
        if let Err(e) = self.persist(&next).await {
            error!(item = %event.item_id, error = %e, "could not persist failure");
        }
        *items = next;
        drop(items);

        error!(item = %event.item_id, error = %event.message, "unit download failed");
        self.events.emit_error(event);
    }

    /// Applies a status change to one item and persists it. Returns the
    /// resulting status; `change` returning `None` leaves the item as is.
    async fn transition<F>(&self, id: &str, change: F) -> Result<ItemStatus>
    where
        F: FnOnce(&DownloadItem) -> Option<ItemStatus>,
    {
        let mut items = self.items.lock().await;
        let index = position(&items, id)?;
        let Some(status) = change(&items[index]) else {
            return Ok(items[index].status);
        };
        let mut next = items.clone();
        next[index].status = status;
        self.persist(&next).await?;
        *items = next;
        debug!(item = id, ?status, "item status changed");
        Ok(status)
    }

    async fn persist(&self, items: &[DownloadItem]) -> Result<()> {
        let bytes = QueueSnapshot::new(items.to_vec()).encode()?;
        self.store.set(QueueSnapshot::KEY, bytes).await?;
        Ok(())
    }
}

fn position(items: &[DownloadItem], id: &str) -> Result<usize> {
    items
        .iter()
        .position(|item| item.id == id)
        .ok_or_else(|| OfflineError::ItemNotFound(id.to_string()))
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
