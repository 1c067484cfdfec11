// src/metadata.rs

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::models::{CompletionMetadata, MetadataSnapshot};
use crate::store::KeyValueStore;

/// The ledger of units that are fully on disk, per variant.
///
/// Loaded once, kept in memory, and written through to the key-value store
/// on every change. A mutation is only applied in memory after its snapshot
/// was stored, so memory never runs ahead of what a restart would see.
pub struct MetadataStore {
    store: Arc<dyn KeyValueStore>,
    variants: Mutex<BTreeMap<String, CompletionMetadata>>,
}

impl MetadataStore {
    pub async fn load(store: Arc<dyn KeyValueStore>) -> Result<Self> {
        let variants = match store.get(MetadataSnapshot::KEY).await? {
            Some(bytes) => MetadataSnapshot::decode(&bytes)?.variants,
            None => BTreeMap::new(),
        };
        debug!(variants = variants.len(), "loaded completion metadata");
        Ok(Self {
            store,
            variants: Mutex::new(variants),
        })
    }

    pub async fn is_unit_complete(&self, unit_id: u32, variant_id: &str) -> bool {
        self.variants
            .lock()
            .await
            .get(variant_id)
            .is_some_and(|meta| meta.completed_unit_ids.contains(&unit_id))
    }

    pub async fn mark_unit_complete(&self, unit_id: u32, variant_id: &str, total_bytes: u64) -> Result<()> {
        self.update(|variants| {
            variants
                .entry(variant_id.to_string())
                .or_default()
                .insert(unit_id, total_bytes);
            true
        })
        .await
    }

    /// Forgets a completed unit; the variant record goes away with its last unit.
    pub async fn remove_unit(&self, unit_id: u32, variant_id: &str) -> Result<bool> {
        let mut removed = false;
        self.update(|variants| {
            if let Some(meta) = variants.get_mut(variant_id) {
                removed = meta.remove(unit_id);
                if meta.is_empty() {
                    variants.remove(variant_id);
                }
            }
            removed
        })
        .await?;
        Ok(removed)
    }

    pub async fn clear_variant(&self, variant_id: &str) -> Result<()> {
        self.update(|variants| variants.remove(variant_id).is_some()).await
    }

    pub async fn completed_units(&self, variant_id: &str) -> BTreeSet<u32> {
        self.variants
            .lock()
            .await
            .get(variant_id)
            .map(|meta| meta.completed_unit_ids.clone())
            .unwrap_or_default()
    }

    /// Bytes recorded at completion time; not a filesystem scan.
    pub async fn storage_used(&self, variant_id: &str) -> u64 {
        self.variants
            .lock()
            .await
            .get(variant_id)
            .map_or(0, |meta| meta.total_bytes)
    }

    pub async fn variants_with_downloads(&self) -> Vec<String> {
        self.variants
            .lock()
            .await
            .iter()
            .filter(|(_, meta)| !meta.is_empty())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Applies `change` to a copy, persists it if `change` reports a
    /// modification, then swaps it in.
    async fn update<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut BTreeMap<String, CompletionMetadata>) -> bool,
    {
        let mut variants = self.variants.lock().await;
        let mut next = variants.clone();
        if !change(&mut next) {
            return Ok(());
        }
        let bytes = MetadataSnapshot::new(next.clone()).encode()?;
        self.store.set(MetadataSnapshot::KEY, bytes).await?;
        *variants = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn completion_is_persisted_and_reloaded() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let meta = MetadataStore::load(kv.clone()).await.unwrap();

        meta.mark_unit_complete(2, "alafasy", 500).await.unwrap();
        meta.mark_unit_complete(3, "alafasy", 300).await.unwrap();
        assert!(meta.is_unit_complete(2, "alafasy").await);
        assert!(!meta.is_unit_complete(2, "husary").await);

        let reloaded = MetadataStore::load(kv).await.unwrap();
        assert_eq!(reloaded.completed_units("alafasy").await, BTreeSet::from([2, 3]));
        assert_eq!(reloaded.storage_used("alafasy").await, 800);
    }

    #[tokio::test]
    async fn removing_last_unit_prunes_variant() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let meta = MetadataStore::load(kv).await.unwrap();

        meta.mark_unit_complete(1, "alafasy", 10).await.unwrap();
        assert_eq!(meta.variants_with_downloads().await, vec!["alafasy".to_string()]);

        assert!(meta.remove_unit(1, "alafasy").await.unwrap());
        assert!(!meta.remove_unit(1, "alafasy").await.unwrap());
        assert!(meta.variants_with_downloads().await.is_empty());
        assert_eq!(meta.storage_used("alafasy").await, 0);
    }

    #[tokio::test]
    async fn clear_variant_leaves_others() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let meta = MetadataStore::load(kv).await.unwrap();

        meta.mark_unit_complete(1, "alafasy", 10).await.unwrap();
        meta.mark_unit_complete(1, "husary", 20).await.unwrap();
        meta.clear_variant("alafasy").await.unwrap();

        assert!(!meta.is_unit_complete(1, "alafasy").await);
        assert!(meta.is_unit_complete(1, "husary").await);
    }
}
