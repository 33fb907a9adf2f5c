//! Persistent index of discovered images, backed by SQLite.
//!
//! Upserts run inside an open transaction that is committed every
//! `batch_size` writes. A crash between commits loses only the open batch.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use tracing::{debug, info, warn};

use crate::error::{StoreCommitError, StoreError};

/// SQLite's default bound on host parameters is far above this; keep lookups chunked.
const LOOKUP_CHUNK: usize = 500;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS roots (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    path            TEXT NOT NULL UNIQUE,
    active          INTEGER NOT NULL DEFAULT 1,
    last_crawled    INTEGER
);
CREATE TABLE IF NOT EXISTS image_records (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    path            TEXT NOT NULL UNIQUE,
    root_id         INTEGER NOT NULL REFERENCES roots(id) ON DELETE CASCADE,
    last_seen       INTEGER NOT NULL,
    modified        INTEGER,
    thumbnail       TEXT
);
CREATE INDEX IF NOT EXISTS idx_image_records_root ON image_records(root_id);
";

const RECORD_COLUMNS: &str = "i.id, i.path, i.root_id, i.last_seen, i.modified, i.thumbnail";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RootId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(pub i64);

impl fmt::Display for RootId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A directory selected for inclusion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Root {
    pub id: RootId,
    pub path: PathBuf,
    pub active: bool,
    pub last_crawled: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    pub id: RecordId,
    pub path: PathBuf,
    pub root_id: RootId,
    pub last_seen: DateTime<Utc>,
    /// File modification time observed by the last crawl.
    pub modified: Option<DateTime<Utc>>,
    /// Cached thumbnail file, when one has been generated.
    pub thumbnail: Option<PathBuf>,
}

/// Outcome of [`IndexStore::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Upsert {
    pub id: RecordId,
    /// `false` when the path was already indexed and only `last_seen` moved.
    pub created: bool,
}

pub struct IndexStore {
    conn: Connection,
    batch_size: usize,
    pending: usize,
}

impl IndexStore {
    /// Open (or create) the index at `path`.
    pub fn open(path: impl AsRef<Path>, batch_size: usize) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        info!(path = %path.display(), journal = %mode, "index store opened");
        Self::init(conn, batch_size)
    }

    /// A private in-memory index, mainly for tests.
    pub fn open_in_memory(batch_size: usize) -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, batch_size)
    }

    fn init(conn: Connection, batch_size: usize) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn,
            batch_size: batch_size.max(1),
            pending: 0,
        })
    }

    #[must_use]
    pub const fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Upserts written but not yet committed.
    #[must_use]
    pub const fn pending(&self) -> usize {
        self.pending
    }

    /// Register a root directory. Idempotent on the absolute path.
    pub fn add_root(&mut self, path: impl AsRef<Path>) -> Result<Root, StoreError> {
        self.flush()?;
        let path = std::path::absolute(path.as_ref())?;
        let text = path_text(&path)?;
        self.conn.execute(
            "INSERT OR IGNORE INTO roots (path, active) VALUES (?1, 1)",
            [text],
        )?;
        let root = self.conn.query_row(
            "SELECT id, path, active, last_crawled FROM roots WHERE path = ?1",
            [text],
            root_from_row,
        )?;
        debug!(root = %root.id, path = %root.path.display(), "root registered");
        Ok(root)
    }

    pub fn roots(&self) -> Result<Vec<Root>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, path, active, last_crawled FROM roots ORDER BY id")?;
        let roots = stmt
            .query_map([], root_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(roots)
    }

    pub fn root(&self, id: RootId) -> Result<Option<Root>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, path, active, last_crawled FROM roots WHERE id = ?1",
                [id.0],
                root_from_row,
            )
            .optional()?)
    }

    /// Gate whether a root's records take part in future sessions. Never triggers a crawl.
    pub fn set_root_active(&mut self, id: RootId, active: bool) -> Result<(), StoreError> {
        self.flush()?;
        let changed = self.conn.execute(
            "UPDATE roots SET active = ?1 WHERE id = ?2",
            params![active, id.0],
        )?;
        if changed == 0 {
            return Err(StoreError::UnknownRoot(id));
        }
        info!(root = %id, active, "root toggled");
        Ok(())
    }

    pub fn mark_crawled(&mut self, id: RootId, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.flush()?;
        self.conn.execute(
            "UPDATE roots SET last_crawled = ?1 WHERE id = ?2",
            params![at.timestamp_millis(), id.0],
        )?;
        Ok(())
    }

    /// Insert `path` or refresh its `last_seen`. Commits when the batch fills up.
    ///
    /// # Errors
    /// A write or commit failure rolls back the open batch and returns
    /// [`StoreError::Commit`]; earlier batches stay committed.
    pub fn upsert(
        &mut self,
        root: RootId,
        path: &Path,
        modified: Option<DateTime<Utc>>,
        seen_at: DateTime<Utc>,
    ) -> Result<Upsert, StoreError> {
        let text = path_text(path)?;
        if self.conn.is_autocommit() {
            self.conn.execute_batch("BEGIN")?;
        }
        let outcome = match self.write_record(root, text, modified, seen_at) {
            Ok(outcome) => outcome,
            Err(source) => {
                let pending = self.pending + 1;
                self.abort_batch();
                return Err(StoreCommitError { pending, source }.into());
            }
        };
        self.pending += 1;
        if self.pending >= self.batch_size {
            self.flush()?;
        }
        Ok(outcome)
    }

    fn write_record(
        &self,
        root: RootId,
        path: &str,
        modified: Option<DateTime<Utc>>,
        seen_at: DateTime<Utc>,
    ) -> rusqlite::Result<Upsert> {
        let modified = modified.map(|m| m.timestamp_millis());
        let existing: Option<i64> = self
            .conn
            .prepare_cached("SELECT id FROM image_records WHERE path = ?1")?
            .query_row([path], |row| row.get(0))
            .optional()?;
        match existing {
            Some(id) => {
                self.conn
                    .prepare_cached(
                        "UPDATE image_records SET root_id = ?1, last_seen = ?2, modified = ?3
                         WHERE id = ?4",
                    )?
                    .execute(params![root.0, seen_at.timestamp_millis(), modified, id])?;
                Ok(Upsert {
                    id: RecordId(id),
                    created: false,
                })
            }
            None => {
                self.conn
                    .prepare_cached(
                        "INSERT INTO image_records (path, root_id, last_seen, modified)
                         VALUES (?1, ?2, ?3, ?4)",
                    )?
                    .execute(params![path, root.0, seen_at.timestamp_millis(), modified])?;
                Ok(Upsert {
                    id: RecordId(self.conn.last_insert_rowid()),
                    created: true,
                })
            }
        }
    }

    /// Commit the open batch, if any.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        if self.conn.is_autocommit() {
            self.pending = 0;
            return Ok(());
        }
        let pending = self.pending;
        match self.conn.execute_batch("COMMIT") {
            Ok(()) => {
                debug!(records = pending, "batch committed");
                self.pending = 0;
                Ok(())
            }
            Err(source) => {
                self.abort_batch();
                Err(StoreCommitError { pending, source }.into())
            }
        }
    }

    fn abort_batch(&mut self) {
        warn!(records = self.pending, "rolling back uncommitted batch");
        // SQLite may already have rolled back on SQLITE_FULL/IOERR.
        if !self.conn.is_autocommit() {
            if let Err(err) = self.conn.execute_batch("ROLLBACK") {
                warn!(error = %err, "rollback failed");
            }
        }
        self.pending = 0;
    }

    /// Records of active roots among `roots`, ordered by id.
    pub fn list_active(&self, roots: &[RootId]) -> Result<Vec<ImageRecord>, StoreError> {
        if roots.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM image_records i
             JOIN roots r ON r.id = i.root_id
             WHERE r.active = 1 AND i.root_id IN ({})
             ORDER BY i.id",
            placeholders(roots.len())
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let records = stmt
            .query_map(params_from_iter(roots.iter().map(|r| r.0)), record_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Ids of active records among `roots`, ordered by id.
    pub fn active_ids(&self, roots: &[RootId]) -> Result<Vec<RecordId>, StoreError> {
        if roots.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT i.id FROM image_records i
             JOIN roots r ON r.id = i.root_id
             WHERE r.active = 1 AND i.root_id IN ({})
             ORDER BY i.id",
            placeholders(roots.len())
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let ids = stmt
            .query_map(params_from_iter(roots.iter().map(|r| r.0)), |row| {
                row.get(0).map(RecordId)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    /// Look up records by id, preserving the order of `ids`. Missing ids are skipped.
    pub fn records(&self, ids: &[RecordId]) -> Result<Vec<ImageRecord>, StoreError> {
        let mut out = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(LOOKUP_CHUNK) {
            let sql = format!(
                "SELECT {RECORD_COLUMNS} FROM image_records i WHERE i.id IN ({})",
                placeholders(chunk.len())
            );
            let mut stmt = self.conn.prepare_cached(&sql)?;
            let mut found = stmt
                .query_map(params_from_iter(chunk.iter().map(|id| id.0)), record_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            found.sort_by_key(|r| r.id);
            for id in chunk {
                if let Ok(pos) = found.binary_search_by_key(id, |r| r.id) {
                    out.push(found[pos].clone());
                }
            }
        }
        Ok(out)
    }

    pub fn record_by_path(&self, path: &Path) -> Result<Option<ImageRecord>, StoreError> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM image_records i WHERE i.path = ?1");
        Ok(self
            .conn
            .query_row(&sql, [path_text(path)?], record_from_row)
            .optional()?)
    }

    pub fn set_thumbnail(&mut self, id: RecordId, thumbnail: Option<&Path>) -> Result<(), StoreError> {
        self.flush()?;
        let text = thumbnail.map(path_text).transpose()?;
        self.conn.execute(
            "UPDATE image_records SET thumbnail = ?1 WHERE id = ?2",
            params![text, id.0],
        )?;
        Ok(())
    }

    /// Delete records of `root` not seen since `before`. Returns the number removed.
    pub fn prune_unseen(&mut self, root: RootId, before: DateTime<Utc>) -> Result<usize, StoreError> {
        self.flush()?;
        let removed = self.conn.execute(
            "DELETE FROM image_records WHERE root_id = ?1 AND last_seen < ?2",
            params![root.0, before.timestamp_millis()],
        )?;
        info!(root = %root, removed, "pruned unseen records");
        Ok(removed)
    }

    /// Total committed and uncommitted records.
    pub fn count(&self) -> Result<u64, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM image_records", [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Cap database growth to `extra_pages` beyond the current size, simulating a full disk.
    #[cfg(test)]
    pub(crate) fn limit_growth(&self, extra_pages: i64) -> rusqlite::Result<()> {
        let current: i64 = self.conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let _: i64 = self.conn.query_row(
            &format!("PRAGMA max_page_count = {}", current + extra_pages),
            [],
            |row| row.get(0),
        )?;
        Ok(())
    }
}

impl Drop for IndexStore {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            warn!(error = %err, "failed to commit final batch");
        }
    }
}

fn path_text(path: &Path) -> Result<&str, StoreError> {
    path.to_str()
        .ok_or_else(|| StoreError::NonUtf8Path(path.to_path_buf()))
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn root_from_row(row: &Row<'_>) -> rusqlite::Result<Root> {
    Ok(Root {
        id: RootId(row.get(0)?),
        path: PathBuf::from(row.get::<_, String>(1)?),
        active: row.get(2)?,
        last_crawled: row.get::<_, Option<i64>>(3)?.map(millis),
    })
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<ImageRecord> {
    Ok(ImageRecord {
        id: RecordId(row.get(0)?),
        path: PathBuf::from(row.get::<_, String>(1)?),
        root_id: RootId(row.get(2)?),
        last_seen: millis(row.get(3)?),
        modified: row.get::<_, Option<i64>>(4)?.map(millis),
        thumbnail: row.get::<_, Option<String>>(5)?.map(PathBuf::from),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn store_with_root() -> (IndexStore, Root) {
        let mut store = IndexStore::open_in_memory(3).unwrap();
        let root = store.add_root("/photos").unwrap();
        (store, root)
    }

    #[test]
    fn upsert_is_idempotent_on_path() {
        let (mut store, root) = store_with_root();
        let t0 = Utc::now();
        let first = store.upsert(root.id, Path::new("/photos/a.jpg"), None, t0).unwrap();
        let t1 = t0 + Duration::seconds(5);
        let second = store.upsert(root.id, Path::new("/photos/a.jpg"), None, t1).unwrap();
        store.flush().unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.id, second.id);
        assert_eq!(store.count().unwrap(), 1);
        let rec = store.record_by_path(Path::new("/photos/a.jpg")).unwrap().unwrap();
        assert_eq!(rec.last_seen.timestamp_millis(), t1.timestamp_millis());
    }

    #[test]
    fn commits_every_batch_size_upserts() {
        let (mut store, root) = store_with_root();
        let now = Utc::now();
        for name in ["a", "b"] {
            store
                .upsert(root.id, &PathBuf::from(format!("/photos/{name}.jpg")), None, now)
                .unwrap();
        }
        assert_eq!(store.pending(), 2);
        store.upsert(root.id, Path::new("/photos/c.jpg"), None, now).unwrap();
        assert_eq!(store.pending(), 0);
        assert!(store.conn.is_autocommit());
    }

    #[test]
    fn add_root_is_idempotent() {
        let (mut store, root) = store_with_root();
        let again = store.add_root("/photos").unwrap();
        assert_eq!(root.id, again.id);
        assert_eq!(store.roots().unwrap().len(), 1);
    }

    #[test]
    fn inactive_roots_are_excluded_but_kept() {
        let mut store = IndexStore::open_in_memory(10).unwrap();
        let a = store.add_root("/a").unwrap();
        let b = store.add_root("/b").unwrap();
        let now = Utc::now();
        store.upsert(a.id, Path::new("/a/1.jpg"), None, now).unwrap();
        store.upsert(b.id, Path::new("/b/1.jpg"), None, now).unwrap();
        store.set_root_active(b.id, false).unwrap();

        let active = store.list_active(&[a.id, b.id]).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].root_id, a.id);
        assert_eq!(store.count().unwrap(), 2);
        assert!(!store.root(b.id).unwrap().unwrap().active);
    }

    #[test]
    fn toggling_unknown_root_fails() {
        let (mut store, _) = store_with_root();
        assert!(matches!(
            store.set_root_active(RootId(99), false),
            Err(StoreError::UnknownRoot(RootId(99)))
        ));
    }

    #[test]
    fn records_preserve_requested_order() {
        let (mut store, root) = store_with_root();
        let now = Utc::now();
        let ids: Vec<RecordId> = ["a", "b", "c"]
            .iter()
            .map(|n| {
                store
                    .upsert(root.id, &PathBuf::from(format!("/photos/{n}.jpg")), None, now)
                    .unwrap()
                    .id
            })
            .collect();
        let wanted = vec![ids[2], RecordId(404), ids[0]];
        let found = store.records(&wanted).unwrap();
        let got: Vec<RecordId> = found.iter().map(|r| r.id).collect();
        assert_eq!(got, vec![ids[2], ids[0]]);
    }

    #[test]
    fn prune_removes_only_stale_records() {
        let (mut store, root) = store_with_root();
        let old = Utc::now() - Duration::days(2);
        let fresh = Utc::now();
        store.upsert(root.id, Path::new("/photos/old.jpg"), None, old).unwrap();
        store.upsert(root.id, Path::new("/photos/new.jpg"), None, fresh).unwrap();
        let removed = store
            .prune_unseen(root.id, fresh - Duration::days(1))
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.record_by_path(Path::new("/photos/new.jpg")).unwrap().is_some());
    }

    #[test]
    fn thumbnail_reference_round_trips() {
        let (mut store, root) = store_with_root();
        let up = store
            .upsert(root.id, Path::new("/photos/big.tiff"), None, Utc::now())
            .unwrap();
        store
            .set_thumbnail(up.id, Some(Path::new("/cache/big.jpg")))
            .unwrap();
        let rec = &store.records(&[up.id]).unwrap()[0];
        assert_eq!(rec.thumbnail.as_deref(), Some(Path::new("/cache/big.jpg")));
    }
}
