//! Durable SQLite metadata catalog over the artifact directory.
//!
//! One row per stored artifact. The unique index on
//! `(text_normalized, voice_id, version_num)` is the authority that
//! serializes concurrent writes; the in-memory index and the artifact files
//! are reconciled against this table at startup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use rusqlite::{Connection, params};
use serde::Serialize;

use crate::format::AudioFormat;

/// Current catalog schema version.
pub const CURRENT_SCHEMA_VERSION: i64 = 2;

/// v2 DDL. `IF NOT EXISTS` throughout so creation is idempotent.
const SCHEMA_V2_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    text_original   TEXT NOT NULL,
    text_normalized TEXT NOT NULL,
    voice_id        TEXT NOT NULL,
    model           TEXT NOT NULL DEFAULT '',
    audio_path      TEXT NOT NULL,
    audio_format    TEXT NOT NULL DEFAULT 'mp3',
    file_size       INTEGER NOT NULL DEFAULT 0,
    duration_ms     INTEGER NOT NULL DEFAULT 0,
    hit_count       INTEGER NOT NULL DEFAULT 0,
    is_filler       INTEGER NOT NULL DEFAULT 0,
    version_num     INTEGER NOT NULL DEFAULT 1,
    created_at      INTEGER NOT NULL DEFAULT 0,
    last_hit_at     INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_voice_model ON cache_entries(voice_id, model);
CREATE INDEX IF NOT EXISTS idx_last_hit   ON cache_entries(last_hit_at);
CREATE INDEX IF NOT EXISTS idx_normalized ON cache_entries(text_normalized);
CREATE UNIQUE INDEX IF NOT EXISTS idx_normalized_voice_version
    ON cache_entries(text_normalized, voice_id, version_num);
"#;

/// Errors from the catalog layer.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("duplicate entry: ({fingerprint}, {voice}, v{version}) already cached")]
    Duplicate {
        fingerprint: String,
        voice: String,
        version: i64,
    },

    #[error("lock poisoned: {0}")]
    Lock(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl CatalogError {
    /// True for the unique-index violation the pipeline converts to a hit.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}

/// Parameters for inserting one catalog row.
#[derive(Debug, Clone)]
pub struct NewEntry<'a> {
    pub text_original: &'a str,
    pub text_normalized: &'a str,
    pub voice_id: &'a str,
    pub model: &'a str,
    pub audio_path: &'a Path,
    pub audio_format: AudioFormat,
    pub file_size: u64,
    pub duration_ms: u64,
    pub is_filler: bool,
    pub version_num: i64,
}

/// Row subset used to populate the hot index at startup.
#[derive(Debug, Clone)]
pub struct HotEntry {
    pub text_normalized: String,
    pub voice_id: String,
    pub audio_path: PathBuf,
    pub is_filler: bool,
    pub version_num: i64,
}

/// Row subset used by the startup integrity pass.
#[derive(Debug, Clone)]
pub struct EntryRow {
    pub id: i64,
    pub text_normalized: String,
    pub voice_id: String,
    pub audio_path: PathBuf,
}

/// Row subset used by the evictor.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub id: i64,
    pub text_normalized: String,
    pub voice_id: String,
    pub audio_path: PathBuf,
}

/// Aggregate counters for the stats endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CatalogStats {
    pub total_entries: u64,
    pub total_size_bytes: u64,
    pub total_hits: u64,
    pub total_misses: u64,
    pub filler_count: u64,
    pub cache_age_seconds: u64,
    pub per_voice: HashMap<String, u64>,
}

impl CatalogStats {
    /// Fraction of lookups served from cache, in `[0, 1]`.
    pub fn hit_rate(&self) -> f64 {
        let total = self.total_hits + self.total_misses;
        if total == 0 {
            0.0
        } else {
            self.total_hits as f64 / total as f64
        }
    }
}

/// Durable key→artifact metadata catalog.
///
/// Thread-safe via an internal `Mutex<Connection>`; WAL mode keeps readers
/// from blocking the single writer. Every mutation commits before returning.
pub struct Catalog {
    conn: Mutex<Connection>,
    /// Observability-only counter; not persisted.
    misses: AtomicU64,
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog").finish_non_exhaustive()
    }
}

impl Catalog {
    /// Open (or create) the catalog at `db_path`, migrating old schemas.
    pub fn open(db_path: &Path) -> Result<Self, CatalogError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CatalogError::Io(e.to_string()))?;
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);",
        )?;
        let recorded: Option<i64> = conn
            .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        let current = recorded.unwrap_or(0);

        if current < CURRENT_SCHEMA_VERSION {
            let table_exists: bool = conn
                .query_row(
                    "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = 'cache_entries'",
                    [],
                    |row| row.get::<_, i64>(0),
                )
                .map(|n| n > 0)?;

            if table_exists {
                migrate_to_v2(&conn)?;
            } else {
                conn.execute_batch(SCHEMA_V2_SQL)?;
            }

            if recorded.is_none() {
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    params![CURRENT_SCHEMA_VERSION],
                )?;
            } else {
                conn.execute(
                    "UPDATE schema_version SET version = ?1",
                    params![CURRENT_SCHEMA_VERSION],
                )?;
            }
        }

        Ok(Self {
            conn: Mutex::new(conn),
            misses: AtomicU64::new(0),
        })
    }

    /// Recorded schema version.
    pub fn schema_version(&self) -> Result<i64, CatalogError> {
        let conn = self.lock()?;
        let version = conn
            .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(0),
                other => Err(other),
            })?;
        Ok(version)
    }

    /// Insert one row.
    ///
    /// Fails with [`CatalogError::Duplicate`] when
    /// `(text_normalized, voice_id, version_num)` is already present.
    pub fn add_entry(&self, entry: &NewEntry<'_>) -> Result<i64, CatalogError> {
        let conn = self.lock()?;
        let now = now_epoch_secs();
        let result = conn.execute(
            "INSERT INTO cache_entries
             (text_original, text_normalized, voice_id, model, audio_path, audio_format,
              file_size, duration_ms, is_filler, version_num, created_at, last_hit_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                entry.text_original,
                entry.text_normalized,
                entry.voice_id,
                entry.model,
                path_str(entry.audio_path),
                entry.audio_format.extension(),
                entry.file_size as i64,
                entry.duration_ms as i64,
                entry.is_filler as i64,
                entry.version_num,
                now,
                now,
            ],
        );

        match result {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(e) if is_unique_violation(&e) => Err(CatalogError::Duplicate {
                fingerprint: entry.text_normalized.to_owned(),
                voice: entry.voice_id.to_owned(),
                version: entry.version_num,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Increment `hit_count` and refresh `last_hit_at`.
    ///
    /// With `version` omitted every matching row is updated; pass a version
    /// (or use [`record_hit_for_path`](Self::record_hit_for_path)) to touch a
    /// single rendition.
    pub fn record_hit(
        &self,
        fingerprint: &str,
        voice: &str,
        version: Option<i64>,
    ) -> Result<(), CatalogError> {
        let conn = self.lock()?;
        let now = now_epoch_secs();
        match version {
            Some(version) => conn.execute(
                "UPDATE cache_entries SET hit_count = hit_count + 1, last_hit_at = ?1
                 WHERE text_normalized = ?2 AND voice_id = ?3 AND version_num = ?4",
                params![now, fingerprint, voice, version],
            )?,
            None => conn.execute(
                "UPDATE cache_entries SET hit_count = hit_count + 1, last_hit_at = ?1
                 WHERE text_normalized = ?2 AND voice_id = ?3",
                params![now, fingerprint, voice],
            )?,
        };
        Ok(())
    }

    /// Record a hit against exactly the rendition that was served.
    pub fn record_hit_for_path(
        &self,
        fingerprint: &str,
        voice: &str,
        audio_path: &Path,
    ) -> Result<(), CatalogError> {
        let conn = self.lock()?;
        let now = now_epoch_secs();
        conn.execute(
            "UPDATE cache_entries SET hit_count = hit_count + 1, last_hit_at = ?1
             WHERE text_normalized = ?2 AND voice_id = ?3 AND audio_path = ?4",
            params![now, fingerprint, voice, path_str(audio_path)],
        )?;
        Ok(())
    }

    /// Count stored renditions for a key. The store uses this to pick the
    /// next version number.
    pub fn get_version_count(&self, fingerprint: &str, voice: &str) -> Result<i64, CatalogError> {
        let conn = self.lock()?;
        let count = conn.query_row(
            "SELECT count(*) FROM cache_entries WHERE text_normalized = ?1 AND voice_id = ?2",
            params![fingerprint, voice],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Rows needed to populate the hot index at startup.
    pub fn get_all_entries(&self) -> Result<Vec<HotEntry>, CatalogError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT text_normalized, voice_id, audio_path, is_filler, version_num
             FROM cache_entries",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(HotEntry {
                text_normalized: row.get(0)?,
                voice_id: row.get(1)?,
                audio_path: PathBuf::from(row.get::<_, String>(2)?),
                is_filler: row.get::<_, i64>(3)? != 0,
                version_num: row.get(4)?,
            })
        })?;
        collect_rows(rows)
    }

    /// Same as [`get_all_entries`](Self::get_all_entries) plus row ids, for
    /// the integrity pass.
    pub fn get_all_entries_with_ids(&self) -> Result<Vec<EntryRow>, CatalogError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, text_normalized, voice_id, audio_path FROM cache_entries",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(EntryRow {
                id: row.get(0)?,
                text_normalized: row.get(1)?,
                voice_id: row.get(2)?,
                audio_path: PathBuf::from(row.get::<_, String>(3)?),
            })
        })?;
        collect_rows(rows)
    }

    /// Remove one row, returning its artifact path for file unlink.
    pub fn delete_entry(&self, id: i64) -> Result<Option<PathBuf>, CatalogError> {
        let conn = self.lock()?;
        let path: Option<String> = conn
            .query_row(
                "SELECT audio_path FROM cache_entries WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        if path.is_some() {
            conn.execute("DELETE FROM cache_entries WHERE id = ?1", params![id])?;
        }
        Ok(path.map(PathBuf::from))
    }

    /// Batch delete by row id.
    pub fn delete_entries_by_ids(&self, ids: &[i64]) -> Result<(), CatalogError> {
        if ids.is_empty() {
            return Ok(());
        }
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;
        for id in ids {
            tx.execute("DELETE FROM cache_entries WHERE id = ?1", params![id])?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Full purge. Returns every artifact path so the caller can unlink.
    pub fn delete_all(&self) -> Result<Vec<PathBuf>, CatalogError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT audio_path FROM cache_entries")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let paths: Vec<PathBuf> = collect_rows(rows)?.into_iter().map(PathBuf::from).collect();
        drop(stmt);
        conn.execute("DELETE FROM cache_entries", [])?;
        Ok(paths)
    }

    /// Eviction selection.
    ///
    /// Primary set: non-filler, never-hit entries older than `min_age_days`,
    /// oldest first. When the remaining count would still exceed
    /// `max_entries`, extends with additional non-filler entries by
    /// `last_hit_at` ascending, taking exactly the overflow.
    pub fn get_eviction_candidates(
        &self,
        max_entries: u64,
        min_age_days: u64,
    ) -> Result<Vec<EvictionCandidate>, CatalogError> {
        let conn = self.lock()?;
        let cutoff = now_epoch_secs() - (min_age_days as i64) * 86_400;

        let mut stmt = conn.prepare(
            "SELECT id, text_normalized, voice_id, audio_path FROM cache_entries
             WHERE is_filler = 0 AND hit_count = 0 AND created_at < ?1
             ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![cutoff], row_to_candidate)?;
        let mut candidates = collect_rows(rows)?;
        drop(stmt);

        let total: i64 =
            conn.query_row("SELECT count(*) FROM cache_entries", [], |row| row.get(0))?;
        let remaining = total - candidates.len() as i64;
        if remaining > max_entries as i64 {
            let overflow = remaining - max_entries as i64;
            let mut stmt = conn.prepare(
                "SELECT id, text_normalized, voice_id, audio_path FROM cache_entries
                 WHERE is_filler = 0 AND NOT (hit_count = 0 AND created_at < ?1)
                 ORDER BY last_hit_at ASC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![cutoff, overflow], row_to_candidate)?;
            candidates.extend(collect_rows(rows)?);
        }

        Ok(candidates)
    }

    /// Aggregate counters for observability.
    pub fn get_stats(&self) -> Result<CatalogStats, CatalogError> {
        let conn = self.lock()?;
        let (total_entries, total_size_bytes, total_hits, filler_count, oldest): (
            i64,
            i64,
            i64,
            i64,
            Option<i64>,
        ) = conn.query_row(
            "SELECT count(*),
                    COALESCE(SUM(file_size), 0),
                    COALESCE(SUM(hit_count), 0),
                    COALESCE(SUM(CASE WHEN is_filler = 1 THEN 1 ELSE 0 END), 0),
                    MIN(created_at)
             FROM cache_entries",
            [],
            |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            },
        )?;

        let mut per_voice = HashMap::new();
        let mut stmt =
            conn.prepare("SELECT voice_id, count(*) FROM cache_entries GROUP BY voice_id")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (voice, count) = row?;
            per_voice.insert(voice, count as u64);
        }

        let cache_age_seconds = oldest
            .map(|created| (now_epoch_secs() - created).max(0) as u64)
            .unwrap_or(0);

        Ok(CatalogStats {
            total_entries: total_entries as u64,
            total_size_bytes: total_size_bytes as u64,
            total_hits: total_hits as u64,
            total_misses: self.misses.load(Ordering::Relaxed),
            filler_count: filler_count as u64,
            cache_age_seconds,
            per_voice,
        })
    }

    /// Bump the miss counter. Observability only.
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, CatalogError> {
        self.conn.lock().map_err(|e| CatalogError::Lock(e.to_string()))
    }

    /// Raw connection access for test fixtures (backdating rows).
    #[cfg(test)]
    pub(crate) fn lock_for_tests(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("catalog lock")
    }
}

/// v1 → v2 migration: add `version_num`, deduplicate, add the unique index.
///
/// Column presence is checked first so a previously interrupted migration
/// can resume.
fn migrate_to_v2(conn: &Connection) -> Result<(), CatalogError> {
    let mut stmt = conn.prepare("PRAGMA table_info(cache_entries)")?;
    let columns: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<_, _>>()?;
    drop(stmt);

    if !columns.iter().any(|c| c == "version_num") {
        conn.execute(
            "ALTER TABLE cache_entries ADD COLUMN version_num INTEGER NOT NULL DEFAULT 1",
            [],
        )?;
    }
    if !columns.iter().any(|c| c == "duration_ms") {
        conn.execute(
            "ALTER TABLE cache_entries ADD COLUMN duration_ms INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }

    // Deduplicate before the unique index exists: keep the row with the
    // highest hit_count per (text_normalized, voice_id), ties to smallest id.
    conn.execute(
        "DELETE FROM cache_entries WHERE id NOT IN (
             SELECT id FROM (
                 SELECT id, ROW_NUMBER() OVER (
                     PARTITION BY text_normalized, voice_id
                     ORDER BY hit_count DESC, id ASC
                 ) AS rn
                 FROM cache_entries
             ) WHERE rn = 1
         )",
        [],
    )?;

    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_voice_model ON cache_entries(voice_id, model);
         CREATE INDEX IF NOT EXISTS idx_last_hit   ON cache_entries(last_hit_at);
         CREATE INDEX IF NOT EXISTS idx_normalized ON cache_entries(text_normalized);
         CREATE UNIQUE INDEX IF NOT EXISTS idx_normalized_voice_version
             ON cache_entries(text_normalized, voice_id, version_num);",
    )?;
    Ok(())
}

fn row_to_candidate(row: &rusqlite::Row<'_>) -> rusqlite::Result<EvictionCandidate> {
    Ok(EvictionCandidate {
        id: row.get(0)?,
        text_normalized: row.get(1)?,
        voice_id: row.get(2)?,
        audio_path: PathBuf::from(row.get::<_, String>(3)?),
    })
}

fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
) -> Result<Vec<T>, CatalogError> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Current wall-clock time as epoch seconds.
pub(crate) fn now_epoch_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_catalog() -> (tempfile::TempDir, Catalog) {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let catalog = Catalog::open(&dir.path().join("cache.db")).expect("open catalog");
        (dir, catalog)
    }

    fn entry<'a>(fingerprint: &'a str, voice: &'a str, version: i64, path: &'a Path) -> NewEntry<'a> {
        NewEntry {
            text_original: fingerprint,
            text_normalized: fingerprint,
            voice_id: voice,
            model: "",
            audio_path: path,
            audio_format: AudioFormat::Mp3,
            file_size: 64,
            duration_ms: 0,
            is_filler: false,
            version_num: version,
        }
    }

    #[test]
    fn open_seeds_current_schema_version() {
        let (_dir, catalog) = test_catalog();
        assert_eq!(catalog.schema_version().expect("version"), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn reopen_is_idempotent() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let db = dir.path().join("cache.db");
        {
            let catalog = Catalog::open(&db).expect("first open");
            catalog
                .add_entry(&entry("merhaba", "v", 1, Path::new("/audio/a.mp3")))
                .expect("insert");
        }
        let catalog = Catalog::open(&db).expect("second open");
        assert_eq!(catalog.get_all_entries().expect("entries").len(), 1);
        assert_eq!(catalog.schema_version().expect("version"), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn duplicate_version_is_rejected() {
        let (_dir, catalog) = test_catalog();
        catalog
            .add_entry(&entry("merhaba", "v", 1, Path::new("/audio/a.mp3")))
            .expect("first insert");

        let err = catalog
            .add_entry(&entry("merhaba", "v", 1, Path::new("/audio/b.mp3")))
            .expect_err("duplicate must fail");
        assert!(err.is_duplicate());

        // A different version of the same key is fine.
        catalog
            .add_entry(&entry("merhaba", "v", 2, Path::new("/audio/b.mp3")))
            .expect("second version");
        assert_eq!(catalog.get_version_count("merhaba", "v").expect("count"), 2);
    }

    #[test]
    fn record_hit_without_version_touches_all_rows() {
        let (_dir, catalog) = test_catalog();
        catalog
            .add_entry(&entry("tekrar", "v", 1, Path::new("/audio/a.mp3")))
            .expect("v1");
        catalog
            .add_entry(&entry("tekrar", "v", 2, Path::new("/audio/b.mp3")))
            .expect("v2");

        catalog.record_hit("tekrar", "v", None).expect("hit");
        let stats = catalog.get_stats().expect("stats");
        assert_eq!(stats.total_hits, 2);
    }

    #[test]
    fn record_hit_with_version_touches_one_row() {
        let (_dir, catalog) = test_catalog();
        catalog
            .add_entry(&entry("tekrar", "v", 1, Path::new("/audio/a.mp3")))
            .expect("v1");
        catalog
            .add_entry(&entry("tekrar", "v", 2, Path::new("/audio/b.mp3")))
            .expect("v2");

        catalog.record_hit("tekrar", "v", Some(2)).expect("hit");
        assert_eq!(catalog.get_stats().expect("stats").total_hits, 1);
    }

    #[test]
    fn record_hit_for_path_touches_served_row_only() {
        let (_dir, catalog) = test_catalog();
        catalog
            .add_entry(&entry("tekrar", "v", 1, Path::new("/audio/a.mp3")))
            .expect("v1");
        catalog
            .add_entry(&entry("tekrar", "v", 2, Path::new("/audio/b.mp3")))
            .expect("v2");

        catalog
            .record_hit_for_path("tekrar", "v", Path::new("/audio/b.mp3"))
            .expect("hit");
        assert_eq!(catalog.get_stats().expect("stats").total_hits, 1);
    }

    #[test]
    fn delete_entry_returns_artifact_path() {
        let (_dir, catalog) = test_catalog();
        let id = catalog
            .add_entry(&entry("merhaba", "v", 1, Path::new("/audio/a.mp3")))
            .expect("insert");

        let path = catalog.delete_entry(id).expect("delete");
        assert_eq!(path, Some(PathBuf::from("/audio/a.mp3")));
        assert_eq!(catalog.delete_entry(id).expect("second delete"), None);
    }

    #[test]
    fn delete_all_returns_every_path() {
        let (_dir, catalog) = test_catalog();
        catalog
            .add_entry(&entry("bir", "v", 1, Path::new("/audio/1.mp3")))
            .expect("insert");
        catalog
            .add_entry(&entry("iki", "v", 1, Path::new("/audio/2.mp3")))
            .expect("insert");

        let paths = catalog.delete_all().expect("purge");
        assert_eq!(paths.len(), 2);
        assert_eq!(catalog.get_stats().expect("stats").total_entries, 0);
    }

    #[test]
    fn eviction_candidates_prefer_old_never_hit_entries() {
        let (_dir, catalog) = test_catalog();
        catalog
            .add_entry(&entry("eski", "v", 1, Path::new("/audio/old.mp3")))
            .expect("old");
        catalog
            .add_entry(&entry("yeni", "v", 1, Path::new("/audio/new.mp3")))
            .expect("new");
        catalog
            .add_entry(&NewEntry {
                is_filler: true,
                ..entry("dolgu", "v", 1, Path::new("/audio/filler.mp3"))
            })
            .expect("filler");

        // Backdate one entry past the age floor.
        {
            let conn = catalog.lock().expect("lock");
            conn.execute(
                "UPDATE cache_entries SET created_at = ?1 WHERE text_normalized = 'eski'",
                params![now_epoch_secs() - 30 * 86_400],
            )
            .expect("backdate");
        }

        let candidates = catalog.get_eviction_candidates(50_000, 7).expect("candidates");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].text_normalized, "eski");
    }

    #[test]
    fn eviction_overflow_extends_by_last_hit() {
        let (_dir, catalog) = test_catalog();
        for i in 0..5 {
            let fingerprint = format!("cumle {i}");
            let path = PathBuf::from(format!("/audio/{i}.mp3"));
            catalog
                .add_entry(&entry(&fingerprint, "v", 1, &path))
                .expect("insert");
            catalog.record_hit(&fingerprint, "v", None).expect("hit");
        }

        // No primary candidates (all were hit recently), cap of 2 → 3 overflow.
        let candidates = catalog.get_eviction_candidates(2, 7).expect("candidates");
        assert_eq!(candidates.len(), 3);
    }

    #[test]
    fn eviction_never_selects_fillers() {
        let (_dir, catalog) = test_catalog();
        for i in 0..4 {
            let fingerprint = format!("dolgu {i}");
            let path = PathBuf::from(format!("/audio/f{i}.mp3"));
            catalog
                .add_entry(&NewEntry {
                    is_filler: true,
                    ..entry(&fingerprint, "v", 1, &path)
                })
                .expect("insert filler");
        }

        let candidates = catalog.get_eviction_candidates(1, 0).expect("candidates");
        assert!(candidates.is_empty());
    }

    #[test]
    fn stats_aggregate_counters() {
        let (_dir, catalog) = test_catalog();
        catalog
            .add_entry(&entry("bir", "voice-a", 1, Path::new("/audio/1.mp3")))
            .expect("insert");
        catalog
            .add_entry(&NewEntry {
                is_filler: true,
                ..entry("dolgu", "voice-b", 1, Path::new("/audio/2.mp3"))
            })
            .expect("insert filler");
        catalog.record_hit("bir", "voice-a", None).expect("hit");
        catalog.record_miss();

        let stats = catalog.get_stats().expect("stats");
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.total_size_bytes, 128);
        assert_eq!(stats.total_hits, 1);
        assert_eq!(stats.total_misses, 1);
        assert_eq!(stats.filler_count, 1);
        assert_eq!(stats.per_voice["voice-a"], 1);
        assert_eq!(stats.per_voice["voice-b"], 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn hit_rate_is_zero_without_traffic() {
        let (_dir, catalog) = test_catalog();
        assert_eq!(catalog.get_stats().expect("stats").hit_rate(), 0.0);
    }

    #[test]
    fn v1_schema_migrates_with_dedup() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let db = dir.path().join("cache.db");

        // Build a v1 database by hand: no version_num, no unique index.
        {
            let conn = Connection::open(&db).expect("open raw");
            conn.execute_batch(
                "CREATE TABLE cache_entries (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     text_original TEXT NOT NULL,
                     text_normalized TEXT NOT NULL,
                     voice_id TEXT NOT NULL,
                     model TEXT NOT NULL DEFAULT '',
                     audio_path TEXT NOT NULL,
                     audio_format TEXT NOT NULL DEFAULT 'mp3',
                     file_size INTEGER NOT NULL DEFAULT 0,
                     hit_count INTEGER NOT NULL DEFAULT 0,
                     is_filler INTEGER NOT NULL DEFAULT 0,
                     created_at INTEGER NOT NULL DEFAULT 0,
                     last_hit_at INTEGER NOT NULL DEFAULT 0
                 );
                 CREATE TABLE schema_version (version INTEGER NOT NULL);
                 INSERT INTO schema_version (version) VALUES (1);",
            )
            .expect("v1 schema");
            conn.execute(
                "INSERT INTO cache_entries (text_original, text_normalized, voice_id, audio_path, hit_count)
                 VALUES ('merhaba', 'merhaba', 'v', '/audio/low.mp3', 1),
                        ('merhaba', 'merhaba', 'v', '/audio/high.mp3', 9),
                        ('selam', 'selam', 'v', '/audio/other.mp3', 0)",
                [],
            )
            .expect("v1 rows");
        }

        let catalog = Catalog::open(&db).expect("migrating open");
        assert_eq!(catalog.schema_version().expect("version"), CURRENT_SCHEMA_VERSION);

        // The duplicate pair collapsed to the row with the higher hit_count.
        let entries = catalog.get_all_entries().expect("entries");
        assert_eq!(entries.len(), 2);
        let survivor = entries
            .iter()
            .find(|e| e.text_normalized == "merhaba")
            .expect("merhaba survives");
        assert_eq!(survivor.audio_path, PathBuf::from("/audio/high.mp3"));
        assert_eq!(survivor.version_num, 1);

        // The unique index is live.
        let err = catalog
            .add_entry(&entry("selam", "v", 1, Path::new("/audio/dup.mp3")))
            .expect_err("unique index enforced");
        assert!(err.is_duplicate());
    }

    #[test]
    fn partial_migration_recovers() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let db = dir.path().join("cache.db");

        // Simulate a migration that added version_num then crashed before
        // stamping the version.
        {
            let conn = Connection::open(&db).expect("open raw");
            conn.execute_batch(
                "CREATE TABLE cache_entries (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     text_original TEXT NOT NULL,
                     text_normalized TEXT NOT NULL,
                     voice_id TEXT NOT NULL,
                     model TEXT NOT NULL DEFAULT '',
                     audio_path TEXT NOT NULL,
                     audio_format TEXT NOT NULL DEFAULT 'mp3',
                     file_size INTEGER NOT NULL DEFAULT 0,
                     hit_count INTEGER NOT NULL DEFAULT 0,
                     is_filler INTEGER NOT NULL DEFAULT 0,
                     version_num INTEGER NOT NULL DEFAULT 1,
                     created_at INTEGER NOT NULL DEFAULT 0,
                     last_hit_at INTEGER NOT NULL DEFAULT 0
                 );
                 CREATE TABLE schema_version (version INTEGER NOT NULL);
                 INSERT INTO schema_version (version) VALUES (1);",
            )
            .expect("partial schema");
        }

        let catalog = Catalog::open(&db).expect("recovering open");
        assert_eq!(catalog.schema_version().expect("version"), CURRENT_SCHEMA_VERSION);
        catalog
            .add_entry(&entry("merhaba", "v", 1, Path::new("/audio/a.mp3")))
            .expect("insert after recovery");
    }

    #[test]
    fn concurrent_inserts_are_serialized() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let catalog =
            std::sync::Arc::new(Catalog::open(&dir.path().join("cache.db")).expect("open"));

        let mut handles = Vec::new();
        for i in 0..8 {
            let c = std::sync::Arc::clone(&catalog);
            handles.push(std::thread::spawn(move || {
                let fingerprint = format!("cumle {i}");
                let path = PathBuf::from(format!("/audio/{i}.mp3"));
                c.add_entry(&NewEntry {
                    text_original: &fingerprint,
                    text_normalized: &fingerprint,
                    voice_id: "v",
                    model: "",
                    audio_path: &path,
                    audio_format: AudioFormat::Mp3,
                    file_size: 0,
                    duration_ms: 0,
                    is_filler: false,
                    version_num: 1,
                })
                .expect("insert");
            }));
        }
        for handle in handles {
            handle.join().expect("join");
        }

        assert_eq!(catalog.get_stats().expect("stats").total_entries, 8);
    }
}
