//! Walks root directories and feeds discovered images into the index store.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::config::CrawlOptions;
use crate::error::{CrawlError, CrawlSubtreeError, StoreError};
use crate::scan::{has_extension, is_hidden_dir};
use crate::store::{IndexStore, Root, RootId};

/// Outcome of one crawl over a single root.
#[derive(Debug)]
pub struct RootReport {
    pub root: RootId,
    pub path: PathBuf,
    /// Matching image files encountered.
    pub discovered: usize,
    /// Records inserted for the first time.
    pub created: usize,
    /// Records already indexed whose `last_seen` was refreshed.
    pub refreshed: usize,
    /// Directories that could not be read. Traversal continued past them.
    pub soft_failures: Vec<CrawlSubtreeError>,
    /// Symlink loops detected and not followed.
    pub cycles_broken: usize,
    /// Directories reached a second time through another link.
    pub duplicate_dirs: usize,
    /// Store failure that stopped this root. Earlier batches are committed.
    pub halted_by: Option<StoreError>,
}

impl RootReport {
    fn new(root: &Root) -> Self {
        Self {
            root: root.id,
            path: root.path.clone(),
            discovered: 0,
            created: 0,
            refreshed: 0,
            soft_failures: Vec::new(),
            cycles_broken: 0,
            duplicate_dirs: 0,
            halted_by: None,
        }
    }

    #[must_use]
    pub const fn completed(&self) -> bool {
        self.halted_by.is_none()
    }
}

#[derive(Debug, Default)]
pub struct CrawlReport {
    pub roots: Vec<RootReport>,
}

impl CrawlReport {
    #[must_use]
    pub fn created(&self) -> usize {
        self.roots.iter().map(|r| r.created).sum()
    }

    #[must_use]
    pub fn refreshed(&self) -> usize {
        self.roots.iter().map(|r| r.refreshed).sum()
    }

    #[must_use]
    pub fn soft_failures(&self) -> usize {
        self.roots.iter().map(|r| r.soft_failures.len()).sum()
    }

    /// `true` when no root was halted by a store failure.
    #[must_use]
    pub fn completed(&self) -> bool {
        self.roots.iter().all(RootReport::completed)
    }
}

/// Roots currently being crawled. Shared by every crawler of one index.
#[derive(Debug, Clone, Default)]
pub struct CrawlRegistry {
    in_flight: Arc<Mutex<HashSet<RootId>>>,
}

impl CrawlRegistry {
    fn claim(&self, ids: &[RootId]) -> Result<Claim, CrawlError> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        let busy: Vec<RootId> = ids.iter().copied().filter(|id| in_flight.contains(id)).collect();
        if !busy.is_empty() {
            return Err(CrawlError::AlreadyRunning(busy));
        }
        in_flight.extend(ids.iter().copied());
        Ok(Claim {
            registry: self.clone(),
            ids: ids.to_vec(),
        })
    }
}

struct Claim {
    registry: CrawlRegistry,
    ids: Vec<RootId>,
}

impl Drop for Claim {
    fn drop(&mut self) {
        let mut in_flight = self
            .registry
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for id in &self.ids {
            in_flight.remove(id);
        }
    }
}

pub struct Crawler {
    options: CrawlOptions,
    registry: CrawlRegistry,
}

impl Crawler {
    #[must_use]
    pub fn new(options: CrawlOptions) -> Self {
        Self::with_registry(options, CrawlRegistry::default())
    }

    #[must_use]
    pub const fn with_registry(options: CrawlOptions, registry: CrawlRegistry) -> Self {
        Self { options, registry }
    }

    /// Crawl every root in `roots`, upserting matching files into `store`.
    ///
    /// Unreadable subtrees are recorded per root and never abort the crawl. A
    /// store failure halts only the root it happened in.
    ///
    /// # Errors
    /// [`CrawlError::AlreadyRunning`] if another crawl holds one of the roots.
    #[instrument(skip_all, fields(roots = roots.len()))]
    pub fn crawl(&self, store: &mut IndexStore, roots: &[Root]) -> Result<CrawlReport, CrawlError> {
        let ids: Vec<RootId> = roots.iter().map(|r| r.id).collect();
        let _claim = self.registry.claim(&ids)?;
        let started = Utc::now();
        let mut report = CrawlReport::default();

        for root in roots {
            let root_report = self.crawl_root(store, root, started);
            info!(
                root = %root.id,
                path = %root.path.display(),
                discovered = root_report.discovered,
                created = root_report.created,
                refreshed = root_report.refreshed,
                skipped = root_report.soft_failures.len(),
                completed = root_report.completed(),
                "root crawled"
            );
            report.roots.push(root_report);
        }
        Ok(report)
    }

    fn crawl_root(&self, store: &mut IndexStore, root: &Root, started: DateTime<Utc>) -> RootReport {
        let mut report = RootReport::new(root);
        let mut visited: HashSet<PathBuf> = HashSet::new();
        let mut walker = WalkDir::new(&root.path)
            .follow_links(self.options.follow_links)
            .sort_by_file_name()
            .into_iter();

        while let Some(next) = walker.next() {
            let entry = match next {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err
                        .path()
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| root.path.clone());
                    if let Some(ancestor) = err.loop_ancestor() {
                        debug!(
                            path = %path.display(),
                            ancestor = %ancestor.display(),
                            "symlink cycle; not following"
                        );
                        report.cycles_broken += 1;
                    } else {
                        warn!(path = %path.display(), error = %err, "skipping unreadable subtree");
                        report.soft_failures.push(CrawlSubtreeError {
                            path,
                            detail: err.to_string(),
                        });
                    }
                    continue;
                }
            };

            if entry.file_type().is_dir() {
                if self.options.skip_hidden && is_hidden_dir(&entry) {
                    walker.skip_current_dir();
                    continue;
                }
                let canonical = std::fs::canonicalize(entry.path())
                    .unwrap_or_else(|_| entry.path().to_path_buf());
                if !visited.insert(canonical) {
                    debug!(path = %entry.path().display(), "directory already visited");
                    report.duplicate_dirs += 1;
                    walker.skip_current_dir();
                }
                continue;
            }

            if !entry.file_type().is_file() || !has_extension(entry.path(), &self.options.extensions)
            {
                continue;
            }

            report.discovered += 1;
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .map(DateTime::<Utc>::from);
            match store.upsert(root.id, entry.path(), modified, started) {
                Ok(up) if up.created => report.created += 1,
                Ok(_) => report.refreshed += 1,
                Err(StoreError::NonUtf8Path(path)) => {
                    warn!(path = %path.display(), "skipping non UTF-8 path");
                    report.soft_failures.push(CrawlSubtreeError {
                        path,
                        detail: "path is not valid UTF-8".into(),
                    });
                }
                Err(err) => {
                    warn!(root = %root.id, error = %err, "store failure; halting root");
                    report.halted_by = Some(err);
                    return report;
                }
            }
        }

        let finished = store
            .flush()
            .and_then(|()| store.mark_crawled(root.id, started));
        if let Err(err) = finished {
            warn!(root = %root.id, error = %err, "store failure at end of root");
            report.halted_by = Some(err);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn setup(batch: usize) -> (IndexStore, Crawler) {
        (
            IndexStore::open_in_memory(batch).unwrap(),
            Crawler::new(CrawlOptions::default()),
        )
    }

    #[test]
    fn ignores_non_images_and_hidden_dirs() {
        let tmp = tempdir().unwrap();
        fs::create_dir_all(tmp.path().join(".git")).unwrap();
        fs::write(tmp.path().join(".git").join("x.jpg"), b"x").unwrap();
        fs::write(tmp.path().join("a.JPG"), b"x").unwrap();
        fs::write(tmp.path().join("notes.txt"), b"x").unwrap();

        let (mut store, crawler) = setup(10);
        let root = store.add_root(tmp.path()).unwrap();
        let report = crawler.crawl(&mut store, &[root]).unwrap();

        assert_eq!(report.created(), 1);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn second_crawl_only_refreshes() {
        let tmp = tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("sub")).unwrap();
        fs::write(tmp.path().join("a.jpg"), b"x").unwrap();
        fs::write(tmp.path().join("sub").join("b.png"), b"x").unwrap();

        let (mut store, crawler) = setup(1);
        let root = store.add_root(tmp.path()).unwrap();
        let first = crawler.crawl(&mut store, &[root.clone()]).unwrap();
        let before = store.list_active(&[root.id]).unwrap();
        let second = crawler.crawl(&mut store, &[root.clone()]).unwrap();
        let after = store.list_active(&[root.id]).unwrap();

        assert_eq!(first.created(), 2);
        assert_eq!(second.created(), 0);
        assert_eq!(second.refreshed(), 2);
        assert_eq!(before.len(), after.len());
        for (b, a) in before.iter().zip(&after) {
            assert_eq!(b.id, a.id);
            assert_eq!(b.path, a.path);
            assert!(a.last_seen >= b.last_seen);
        }
        assert!(store.root(root.id).unwrap().unwrap().last_crawled.is_some());
    }

    #[cfg(unix)]
    #[test]
    fn broken_link_is_a_soft_failure() {
        let tmp = tempdir().unwrap();
        fs::write(tmp.path().join("a.jpg"), b"x").unwrap();
        std::os::unix::fs::symlink(tmp.path().join("gone"), tmp.path().join("dangling")).unwrap();
        fs::write(tmp.path().join("z.jpg"), b"x").unwrap();

        let (mut store, crawler) = setup(10);
        let root = store.add_root(tmp.path()).unwrap();
        let report = crawler.crawl(&mut store, &[root]).unwrap();

        assert!(report.completed());
        assert_eq!(report.created(), 2);
        assert_eq!(report.soft_failures(), 1);
        assert!(report.roots[0].soft_failures[0].path.ends_with("dangling"));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_cycles_terminate() {
        let tmp = tempdir().unwrap();
        let nested = tmp.path().join("a").join("b");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("p.jpg"), b"x").unwrap();
        std::os::unix::fs::symlink(tmp.path().join("a"), nested.join("back")).unwrap();
        std::os::unix::fs::symlink(tmp.path().join("a"), tmp.path().join("alias")).unwrap();

        let (mut store, crawler) = setup(10);
        let root = store.add_root(tmp.path()).unwrap();
        let report = crawler.crawl(&mut store, &[root]).unwrap();

        let r = &report.roots[0];
        assert_eq!(r.discovered, 1);
        assert!(r.cycles_broken + r.duplicate_dirs >= 2);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn overlapping_crawls_are_rejected() {
        let registry = CrawlRegistry::default();
        let held = registry.claim(&[RootId(1), RootId(2)]).unwrap();
        assert!(matches!(
            registry.claim(&[RootId(2)]),
            Err(CrawlError::AlreadyRunning(ids)) if ids == vec![RootId(2)]
        ));
        assert!(registry.claim(&[RootId(3)]).is_ok());
        drop(held);
        assert!(registry.claim(&[RootId(2)]).is_ok());
    }

    #[test]
    fn commit_failure_keeps_committed_batches() {
        let tmp = tempdir().unwrap();
        let long = "x".repeat(120);
        for i in 0..400 {
            fs::write(tmp.path().join(format!("{i:04}-{long}.jpg")), b"x").unwrap();
        }

        let batch = 10;
        let (mut store, crawler) = setup(batch);
        let root = store.add_root(tmp.path()).unwrap();
        store.limit_growth(4).unwrap();
        let report = crawler.crawl(&mut store, &[root]).unwrap();

        let r = &report.roots[0];
        assert!(!report.completed(), "store growth cap should halt the root");
        assert!(matches!(r.halted_by, Some(StoreError::Commit(_))));
        let kept = store.count().unwrap() as usize;
        assert!(kept < 400);
        assert_eq!(kept % batch, 0, "only whole batches survive");
    }
}
