// src/locator.rs

use std::collections::HashMap;
use std::path::PathBuf;

use crate::config::{ManagerConfig, VariantConfig};
use crate::error::{OfflineError, Result};

/// Largest id that still fits the three-digit file naming.
const MAX_COMPONENT: u32 = 999;
const SEGMENT_EXTENSION: &str = "mp3";

/// Maps (unit, segment, variant) to where a segment lives remotely and locally.
///
/// Both mappings are pure: the same inputs always give the same output, which
/// is what lets a restarted download recognise the segments it already has.
#[derive(Debug, Clone)]
pub struct SegmentLocator {
    base_url: String,
    root: PathBuf,
    variants: HashMap<String, VariantConfig>,
}

impl SegmentLocator {
    pub fn new(config: &ManagerConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            root: config.download_root.clone(),
            variants: config
                .variants
                .iter()
                .map(|v| (v.id.clone(), v.clone()))
                .collect(),
        }
    }

    pub fn variant(&self, variant_id: &str) -> Result<&VariantConfig> {
        self.variants
            .get(variant_id)
            .ok_or_else(|| OfflineError::UnknownVariant(variant_id.to_string()))
    }

    /// e.g. `https://everyayah.com/data/Alafasy_128kbps/002255.mp3`
    pub fn remote_url(&self, unit_id: u32, segment: u32, variant_id: &str) -> Result<String> {
        let variant = self.variant(variant_id)?;
        Ok(format!(
            "{}/{}/{}",
            self.base_url,
            variant.directory,
            file_name(unit_id, segment)?
        ))
    }

    pub fn local_path(&self, unit_id: u32, segment: u32, variant_id: &str) -> Result<PathBuf> {
        Ok(self.variant_dir(variant_id)?.join(file_name(unit_id, segment)?))
    }

    /// Directory holding every segment of a variant.
    pub fn variant_dir(&self, variant_id: &str) -> Result<PathBuf> {
        let variant = self.variant(variant_id)?;
        Ok(self.root.join(&variant.directory))
    }
}

fn file_name(unit_id: u32, segment: u32) -> Result<String> {
    if unit_id == 0 || unit_id > MAX_COMPONENT {
        return Err(OfflineError::UnknownUnit(unit_id));
    }
    if segment == 0 || segment > MAX_COMPONENT {
        return Err(OfflineError::SegmentOutOfRange { unit_id, segment });
    }
    Ok(format!("{:03}{:03}.{}", unit_id, segment, SEGMENT_EXTENSION))
}
