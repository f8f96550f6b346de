//! Cache eviction: protect fillers and recently-useful entries, remove cold
//! and never-hit entries, cap total entry count.

use std::sync::Arc;

use tracing::{info, warn};

use crate::cache::catalog::{Catalog, CatalogError};
use crate::cache::hot::HotIndex;

/// Removes stale catalog rows, unlinks their artifact files, and notifies
/// the hot index.
///
/// The hot index is passed in as a one-way handle at construction; the index
/// itself knows nothing about eviction.
pub struct Evictor {
    catalog: Arc<Catalog>,
    hot: Option<Arc<HotIndex>>,
    max_entries: u64,
    min_age_days: u64,
}

impl Evictor {
    pub fn new(
        catalog: Arc<Catalog>,
        hot: Option<Arc<HotIndex>>,
        max_entries: u64,
        min_age_days: u64,
    ) -> Self {
        Self {
            catalog,
            hot,
            max_entries,
            min_age_days,
        }
    }

    /// Run one eviction pass. Returns the number of removed entries.
    pub fn run(&self) -> Result<usize, CatalogError> {
        let candidates = self
            .catalog
            .get_eviction_candidates(self.max_entries, self.min_age_days)?;

        let mut removed = 0;
        for candidate in candidates {
            let Some(audio_path) = self.catalog.delete_entry(candidate.id)? else {
                // Already gone: lost a race with clear or another pass.
                continue;
            };
            if let Err(e) = std::fs::remove_file(&audio_path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %audio_path.display(), error = %e, "failed to unlink evicted artifact");
                }
            }
            if let Some(hot) = &self.hot {
                hot.remove(&candidate.text_normalized, &candidate.voice_id);
            }
            removed += 1;
        }

        if removed > 0 {
            info!(removed, "evicted cache entries");
        }
        Ok(removed)
    }
}
