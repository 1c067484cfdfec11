// src/catalog.rs

/// Lookup of the units that can be downloaded and how many segments each has.
pub trait ContentCatalog: Send + Sync {
    fn exists(&self, unit_id: u32) -> bool;

    /// Number of segments in `unit_id`. Only meaningful when `exists` holds.
    fn segment_count(&self, unit_id: u32) -> u32;

    /// Every unit in catalog order.
    fn unit_ids(&self) -> Vec<u32>;
}

/// Verse counts of the 114 surahs, indexed by surah number - 1.
const VERSE_COUNTS: [u32; 114] = [
    7, 286, 200, 176, 120, 165, 206, 75, 129, 109, 123, 111, 43, 52, 99, 128, 111, 110, 98, 135,
    112, 78, 118, 64, 77, 227, 93, 88, 69, 60, 34, 30, 73, 54, 45, 83, 182, 88, 75, 85, 54, 53, 89,
    59, 37, 35, 38, 29, 18, 45, 60, 49, 62, 55, 78, 96, 29, 22, 24, 13, 14, 11, 11, 18, 12, 12, 30,
    52, 52, 44, 28, 28, 20, 56, 40, 31, 50, 40, 46, 42, 29, 19, 36, 25, 22, 17, 19, 26, 30, 20, 15,
    21, 11, 8, 8, 19, 5, 8, 8, 11, 11, 8, 3, 9, 5, 4, 7, 3, 6, 3, 5, 4, 5, 6,
];

/// The Quran as a catalog: surahs are units, verses are segments.
#[derive(Debug, Clone, Copy, Default)]
pub struct SurahCatalog;

impl ContentCatalog for SurahCatalog {
    fn exists(&self, unit_id: u32) -> bool {
        (1..=VERSE_COUNTS.len() as u32).contains(&unit_id)
    }

    fn segment_count(&self, unit_id: u32) -> u32 {
        if self.exists(unit_id) {
            VERSE_COUNTS[unit_id as usize - 1]
        } else {
            0
        }
    }

    fn unit_ids(&self) -> Vec<u32> {
        (1..=VERSE_COUNTS.len() as u32).collect()
    }
}
