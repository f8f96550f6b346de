//! Startup reconciliation between the catalog and the artifact directory.
//!
//! Runs once, after the hot index loads and before traffic is served, to
//! restore the invariant that every live row has a file and every audio file
//! has a row.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::cache::catalog::{Catalog, CatalogError};
use crate::cache::hot::HotIndex;

/// Audio suffixes considered during the orphan-file scan.
const AUDIO_EXTENSIONS: [&str; 4] = ["mp3", "ogg", "wav", "opus"];

/// Subdirectory that is never scanned; its contents are preserved.
pub const FILLERS_DIR: &str = "fillers";

/// What one reconciliation pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    /// Catalog rows whose artifact file was missing.
    pub orphan_rows: usize,
    /// Audio files no surviving row referenced.
    pub orphan_files: usize,
}

/// Reconcile catalog rows with the files on disk.
///
/// Phase 1 deletes rows pointing at missing files (and drops their hot index
/// entries). Phase 2 unlinks unreferenced audio files in a non-recursive
/// scan of `audio_dir`; subdirectories (including `fillers/`) and non-audio
/// files are left alone. Both phases are idempotent and tolerate files
/// vanishing mid-pass.
pub fn reconcile(
    catalog: &Catalog,
    hot: &HotIndex,
    audio_dir: &Path,
) -> Result<IntegrityReport, CatalogError> {
    let entries = catalog.get_all_entries_with_ids()?;

    // Phase 1: rows whose artifact no longer exists.
    let mut orphan_ids = Vec::new();
    let mut orphan_id_set = HashSet::new();
    for entry in &entries {
        if !entry.audio_path.exists() {
            orphan_ids.push(entry.id);
            orphan_id_set.insert(entry.id);
            hot.remove(&entry.text_normalized, &entry.voice_id);
        }
    }
    catalog.delete_entries_by_ids(&orphan_ids)?;

    // Phase 2: audio files no surviving row references.
    let referenced: HashSet<PathBuf> = entries
        .iter()
        .filter(|e| !orphan_id_set.contains(&e.id))
        .map(|e| resolve(&e.audio_path))
        .collect();

    let mut orphan_files = 0;
    if let Ok(dir) = std::fs::read_dir(audio_dir) {
        for dir_entry in dir.flatten() {
            let path = dir_entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            if !AUDIO_EXTENSIONS.contains(&ext) {
                continue;
            }
            if referenced.contains(&resolve(&path)) {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => orphan_files += 1,
                // Someone else unlinked it first.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(_) => {}
            }
        }
    }

    let report = IntegrityReport {
        orphan_rows: orphan_ids.len(),
        orphan_files,
    };
    info!(
        orphan_rows = report.orphan_rows,
        orphan_files = report.orphan_files,
        "startup integrity pass complete"
    );
    Ok(report)
}

/// Canonicalize when possible, fall back to the path as given.
fn resolve(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_owned())
}
