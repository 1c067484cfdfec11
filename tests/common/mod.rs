#![allow(dead_code)]

use async_trait::async_trait;
use quran_offline::prelude::*;
use quran_offline::transport::TransportError;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const ALAFASY: &str = "alafasy";
pub const HUSARY: &str = "husary";
pub const DEFAULT_SIZE: u64 = 1_000;

/// Units 1, 2, 3 and 7 with small segment counts.
pub struct TestCatalog {
    units: Vec<(u32, u32)>,
}

impl Default for TestCatalog {
    fn default() -> Self {
        Self {
            units: vec![(1, 3), (2, 5), (3, 4), (7, 20)],
        }
    }
}

impl ContentCatalog for TestCatalog {
    fn exists(&self, unit_id: u32) -> bool {
        self.units.iter().any(|(u, _)| *u == unit_id)
    }

    fn segment_count(&self, unit_id: u32) -> u32 {
        self.units
            .iter()
            .find(|(u, _)| *u == unit_id)
            .map_or(0, |(_, count)| *count)
    }

    fn unit_ids(&self) -> Vec<u32> {
        self.units.iter().map(|(u, _)| *u).collect()
    }
}

enum Failure {
    Always,
    Times(u32),
}

/// In-memory "filesystem" plus scripted HTTP answers.
#[derive(Default)]
pub struct MockTransport {
    files: Mutex<HashMap<PathBuf, u64>>,
    sizes: Mutex<HashMap<String, u64>>,
    failures: Mutex<HashMap<String, Failure>>,
    panics: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
    latency: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockTransport {
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    pub fn set_size(&self, url: &str, bytes: u64) {
        self.sizes.lock().unwrap().insert(url.to_string(), bytes);
    }

    pub fn fail_always(&self, url: &str) {
        self.failures.lock().unwrap().insert(url.to_string(), Failure::Always);
    }

    pub fn fail_times(&self, url: &str, times: u32) {
        self.failures.lock().unwrap().insert(url.to_string(), Failure::Times(times));
    }

    /// Makes `download` of `url` panic, like a buggy transport would.
    pub fn panic_on(&self, url: &str) {
        self.panics.lock().unwrap().insert(url.to_string());
    }

    pub fn clear_panics(&self) {
        self.panics.lock().unwrap().clear();
    }

    pub fn clear_failures(&self) {
        self.failures.lock().unwrap().clear();
    }

    pub fn put_file(&self, path: PathBuf, bytes: u64) {
        self.files.lock().unwrap().insert(path, bytes);
    }

    pub fn has_file(&self, path: &Path) -> bool {
        self.files.lock().unwrap().contains_key(path)
    }

    pub fn files_under(&self, dir: &Path) -> usize {
        self.files.lock().unwrap().keys().filter(|p| p.starts_with(dir)).count()
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for(&self, url: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == url).count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn should_fail(&self, url: &str) -> bool {
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(url) {
            Some(Failure::Always) => true,
            Some(Failure::Times(left)) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl FileTransport for MockTransport {
    async fn download(&self, url: &str, dest: &Path) -> Result<TransferOutcome, TransportError> {
        self.calls.lock().unwrap().push(url.to_string());
        let panics = self.panics.lock().unwrap().contains(url);
        if panics {
            panic!("transport exploded on {url}");
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.should_fail(url) {
            return Ok(TransferOutcome::rejected(503));
        }
        let size = self.sizes.lock().unwrap().get(url).copied().unwrap_or(DEFAULT_SIZE);
        self.files.lock().unwrap().insert(dest.to_path_buf(), size);
        Ok(TransferOutcome::ok(200, size))
    }

    async fn exists(&self, path: &Path) -> bool {
        self.has_file(path)
    }

    async fn file_size(&self, path: &Path) -> Option<u64> {
        self.files.lock().unwrap().get(path).copied()
    }

    async fn delete(&self, path: &Path) -> Result<(), TransportError> {
        self.files.lock().unwrap().remove(path);
        Ok(())
    }

    async fn delete_dir(&self, path: &Path) -> Result<(), TransportError> {
        self.files.lock().unwrap().retain(|p, _| !p.starts_with(path));
        Ok(())
    }

    async fn make_directory(&self, _path: &Path) -> Result<(), TransportError> {
        Ok(())
    }
}

pub fn config() -> ManagerConfig {
    ManagerConfig {
        base_url: "https://cdn.test/data".into(),
        download_root: PathBuf::from("/offline"),
        max_concurrent: 2,
        retry_delay_ms: 10,
        variants: vec![
            VariantConfig::new(ALAFASY, "Alafasy_128kbps"),
            VariantConfig::new(HUSARY, "Husary_64kbps"),
        ],
        ..ManagerConfig::default()
    }
}

pub fn variant_dir(variant: &str) -> PathBuf {
    match variant {
        ALAFASY => PathBuf::from("/offline/Alafasy_128kbps"),
        _ => PathBuf::from("/offline/Husary_64kbps"),
    }
}

pub fn url(unit: u32, segment: u32) -> String {
    format!("https://cdn.test/data/Alafasy_128kbps/{:03}{:03}.mp3", unit, segment)
}

pub fn path(variant: &str, unit: u32, segment: u32) -> PathBuf {
    variant_dir(variant).join(format!("{:03}{:03}.mp3", unit, segment))
}

pub struct Harness {
    pub manager: DownloadManager,
    pub transport: Arc<MockTransport>,
    pub network: Arc<ManualNetworkMonitor>,
    pub store: Arc<MemoryStore>,
}

impl Harness {
    pub async fn new(status: NetworkStatus) -> Self {
        Self::with_config(config(), status).await
    }

    pub async fn with_config(config: ManagerConfig, status: NetworkStatus) -> Self {
        Self::build(
            config,
            Arc::new(MockTransport::default()),
            Arc::new(ManualNetworkMonitor::new(status)),
            Arc::new(MemoryStore::new()),
        )
        .await
    }

    /// A fresh manager over the same store and files, as after a restart.
    pub async fn reopen(&self) -> Self {
        Self::build(
            config(),
            self.transport.clone(),
            self.network.clone(),
            self.store.clone(),
        )
        .await
    }

    pub async fn build(
        config: ManagerConfig,
        transport: Arc<MockTransport>,
        network: Arc<ManualNetworkMonitor>,
        store: Arc<MemoryStore>,
    ) -> Self {
        let deps = Dependencies {
            catalog: Arc::new(TestCatalog::default()),
            network: network.clone(),
            store: store.clone(),
            transport: transport.clone(),
        };
        let manager = DownloadManager::new(config, deps).await.unwrap();
        manager.start();
        Self {
            manager,
            transport,
            network,
            store,
        }
    }

    pub async fn idle(&self) {
        within(self.manager.wait_until_idle()).await;
    }
}

pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), future)
        .await
        .expect("timed out")
}

/// Polls until the item has reached `at_least` percent.
pub async fn wait_for_progress(manager: &DownloadManager, item_id: &str, at_least: u8) {
    within(async {
        loop {
            let reached = manager
                .item(item_id)
                .await
                .is_some_and(|item| item.progress_percent >= at_least);
            if reached {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
}
