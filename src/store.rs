//! Capacity-bounded result store.
//!
//! Finished artifacts live as plain files named `<job-id>.<ext>` in one
//! directory; there is no index. Before each commit the store makes room
//! by deleting the oldest entries (by modification time) once the total
//! would exceed the cap, stopping at the lower target so that a store
//! hovering near the cap does not evict on every job.
//!
//! ```text
//!          cap ─────────────────────  total + incoming > cap ⇒ evict
//!       target ─────────────────────  ... oldest first until total ≤ target
//! ```
//!
//! The check-evict-write sequence runs under one async mutex per store, so
//! concurrently finishing jobs can neither race past the size check nor
//! delete the same entry twice.

use crate::config::StoreCapacity;
use crate::error::SpoolConvError;
use crate::job::JobId;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// One committed output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultEntry {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub last_modified: SystemTime,
}

/// Which entries to delete to fit an incoming artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionPlan {
    /// Oldest first.
    pub evict: Vec<PathBuf>,
    /// Stored bytes plus the incoming artifact, before eviction.
    pub bytes_before: u64,
    pub bytes_after: u64,
}

impl EvictionPlan {
    pub fn is_noop(&self) -> bool {
        self.evict.is_empty()
    }
}

/// Decide which entries to evict so `incoming` more bytes fit.
///
/// Nothing is evicted while `stored + incoming <= cap`. Past the cap,
/// entries are taken oldest first (ties broken by path) until the total is
/// at or under the target. If that is impossible, everything is planned for
/// eviction and the remaining overshoot is accepted.
pub fn plan_eviction(entries: &[ResultEntry], incoming: u64, capacity: StoreCapacity) -> EvictionPlan {
    let stored: u64 = entries.iter().map(|e| e.size_bytes).sum();
    let bytes_before = stored.saturating_add(incoming);
    if bytes_before <= capacity.cap_bytes() {
        return EvictionPlan {
            evict: Vec::new(),
            bytes_before,
            bytes_after: bytes_before,
        };
    }

    let mut by_age: Vec<&ResultEntry> = entries.iter().collect();
    by_age.sort_by(|a, b| {
        a.last_modified
            .cmp(&b.last_modified)
            .then_with(|| a.path.cmp(&b.path))
    });

    let mut total = bytes_before;
    let mut evict = Vec::new();
    for entry in by_age {
        if total <= capacity.target_bytes() {
            break;
        }
        total -= entry.size_bytes;
        evict.push(entry.path.clone());
    }
    EvictionPlan {
        evict,
        bytes_before,
        bytes_after: total,
    }
}

/// What a [`ResultStore::make_room`] pass actually did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub evicted: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
    /// Still above the cap after evicting everything it could.
    pub overshoot: bool,
}

/// Directory of committed artifacts with a size cap.
#[derive(Debug)]
pub struct ResultStore {
    root: PathBuf,
    capacity: StoreCapacity,
    commit_lock: Mutex<()>,
}

impl ResultStore {
    /// Open (creating if needed) a store rooted at `root`.
    ///
    /// Leftover `.partial` files from an interrupted commit are removed.
    pub fn open(root: impl Into<PathBuf>, capacity: StoreCapacity) -> Result<Self, SpoolConvError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| SpoolConvError::storage(&root, e))?;
        let listing = std::fs::read_dir(&root).map_err(|e| SpoolConvError::storage(&root, e))?;
        for entry in listing.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') && name.ends_with(".partial") {
                debug!("removing stale partial {}", entry.path().display());
                if let Err(e) = std::fs::remove_file(entry.path()) {
                    warn!("could not remove stale partial {}: {e}", entry.path().display());
                }
            }
        }
        info!(
            "result store at {} (cap {} bytes, target {} bytes)",
            root.display(),
            capacity.cap_bytes(),
            capacity.target_bytes()
        );
        Ok(Self {
            root,
            capacity,
            commit_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn capacity(&self) -> StoreCapacity {
        self.capacity
    }

    /// Current committed entries. Dotfiles (in-flight writes) are ignored.
    pub async fn entries(&self) -> Result<Vec<ResultEntry>, SpoolConvError> {
        let storage = |e: io::Error| SpoolConvError::storage(&self.root, e);
        let mut dir = tokio::fs::read_dir(&self.root).await.map_err(storage)?;
        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(storage)? {
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                // Evicted or deleted externally between listing and stat.
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(SpoolConvError::storage(entry.path(), e)),
            };
            if !meta.is_file() {
                continue;
            }
            let last_modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            entries.push(ResultEntry {
                path: entry.path(),
                size_bytes: meta.len(),
                last_modified,
            });
        }
        Ok(entries)
    }

    pub async fn total_bytes(&self) -> Result<u64, SpoolConvError> {
        Ok(self.entries().await?.iter().map(|e| e.size_bytes).sum())
    }

    /// Evict enough old entries for `incoming` more bytes.
    pub async fn make_room(&self, incoming: u64) -> Result<EvictionReport, SpoolConvError> {
        let _guard = self.commit_lock.lock().await;
        self.evict_locked(incoming).await
    }

    /// Move `src` into the store as `<job>.<ext>`, evicting first if needed.
    ///
    /// The file is copied to a dot-prefixed `.partial` name and renamed into
    /// place, so a listing never sees a half-written artifact.
    pub async fn commit(&self, job: &JobId, src: &Path, ext: &str) -> Result<ResultEntry, SpoolConvError> {
        let incoming = tokio::fs::metadata(src)
            .await
            .map_err(|e| SpoolConvError::storage(src, e))?
            .len();

        let _guard = self.commit_lock.lock().await;
        let report = self.evict_locked(incoming).await?;
        if report.overshoot {
            warn!(
                "{job}: store stays over cap after eviction ({} bytes > {} bytes)",
                report.bytes_after,
                self.capacity.cap_bytes()
            );
        }

        let final_path = self.root.join(format!("{job}.{ext}"));
        let partial = PartialFile::new(self.root.join(format!(".{job}.{ext}.partial")));
        tokio::fs::copy(src, partial.path())
            .await
            .map_err(|e| SpoolConvError::storage(partial.path(), e))?;
        tokio::fs::rename(partial.path(), &final_path)
            .await
            .map_err(|e| SpoolConvError::storage(&final_path, e))?;
        partial.disarm();

        let meta = tokio::fs::metadata(&final_path)
            .await
            .map_err(|e| SpoolConvError::storage(&final_path, e))?;
        debug!("{job}: committed {} ({} bytes)", final_path.display(), meta.len());
        Ok(ResultEntry {
            path: final_path,
            size_bytes: meta.len(),
            last_modified: meta.modified().unwrap_or_else(|_| SystemTime::now()),
        })
    }

    /// Caller must hold `commit_lock`.
    async fn evict_locked(&self, incoming: u64) -> Result<EvictionReport, SpoolConvError> {
        let entries = self.entries().await?;
        let plan = plan_eviction(&entries, incoming, self.capacity);
        if plan.is_noop() {
            return Ok(EvictionReport {
                evicted: 0,
                bytes_before: plan.bytes_before,
                bytes_after: plan.bytes_after,
                overshoot: plan.bytes_after > self.capacity.cap_bytes(),
            });
        }

        let sizes: std::collections::HashMap<&Path, u64> =
            entries.iter().map(|e| (e.path.as_path(), e.size_bytes)).collect();
        let mut evicted = 0;
        let mut bytes_after = plan.bytes_before;
        for path in &plan.evict {
            if !remove_evicted(path).await {
                continue;
            }
            evicted += 1;
            bytes_after -= sizes.get(path.as_path()).copied().unwrap_or(0);
        }
        info!(
            "evicted {evicted} entries: {} -> {} bytes (target {})",
            plan.bytes_before,
            bytes_after,
            self.capacity.target_bytes()
        );
        Ok(EvictionReport {
            evicted,
            bytes_before: plan.bytes_before,
            bytes_after,
            overshoot: bytes_after > self.capacity.cap_bytes(),
        })
    }
}

/// Delete one evicted entry. Already gone counts as freed; any other
/// failure is logged and the entry is left in place.
async fn remove_evicted(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => true,
        Err(e) => {
            warn!("eviction: could not remove {}: {e}", path.display());
            false
        }
    }
}

/// A `.partial` file that is deleted on drop unless disarmed.
///
/// Covers both error returns and a commit future dropped mid-copy.
struct PartialFile {
    path: Option<PathBuf>,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    fn path(&self) -> &Path {
        self.path.as_deref().unwrap_or(Path::new(""))
    }

    /// The file has been renamed into place; leave it alone.
    fn disarm(mut self) {
        self.path = None;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("removed {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("could not remove {}: {e}", path.display()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GIB;
    use std::fs::File;
    use std::sync::Arc;
    use std::time::Duration;

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000 + secs)
    }

    fn entry(name: &str, size: u64, age: u64) -> ResultEntry {
        ResultEntry {
            path: PathBuf::from(name),
            size_bytes: size,
            last_modified: at(age),
        }
    }

    fn gib_store() -> StoreCapacity {
        StoreCapacity::new(5 * GIB, 4 * GIB).unwrap()
    }

    #[test]
    fn evicts_oldest_until_under_target() {
        // Six files totalling about 5.2 GiB; listing order differs from age order.
        let tenth = GIB / 10;
        let entries = vec![
            entry("c", 8 * tenth, 30),
            entry("a", 10 * tenth, 10),
            entry("f", 8 * tenth, 60),
            entry("b", 10 * tenth, 20),
            entry("e", 8 * tenth, 50),
            entry("d", 8 * tenth, 40),
        ];
        let plan = plan_eviction(&entries, 0, gib_store());
        assert_eq!(plan.evict, vec![PathBuf::from("a"), PathBuf::from("b")]);
        assert!(plan.bytes_before > 5 * GIB);
        assert!(plan.bytes_after <= 4 * GIB);
        // One eviction fewer would not have been enough.
        assert!(plan.bytes_after + 10 * tenth > 4 * GIB);
    }

    #[test]
    fn under_cap_is_a_noop() {
        let entries = vec![entry("a", 3 * GIB, 1), entry("b", GIB / 2, 2)];
        assert!(plan_eviction(&entries, 0, gib_store()).is_noop());
        // Between target and cap: hysteresis band, still nothing to do.
        assert!(plan_eviction(&entries, GIB, gib_store()).is_noop());
    }

    #[test]
    fn planning_is_idempotent() {
        let tenth = GIB / 10;
        let mut entries = vec![
            entry("a", 20 * tenth, 1),
            entry("b", 20 * tenth, 2),
            entry("c", 15 * tenth, 3),
        ];
        let plan = plan_eviction(&entries, 0, gib_store());
        entries.retain(|e| !plan.evict.contains(&e.path));
        assert!(plan_eviction(&entries, 0, gib_store()).is_noop());
    }

    #[test]
    fn incoming_bytes_count_toward_the_cap() {
        let entries = vec![entry("old", 2 * GIB, 1), entry("new", 2 * GIB, 2)];
        let plan = plan_eviction(&entries, 2 * GIB, gib_store());
        assert_eq!(plan.evict, vec![PathBuf::from("old")]);
        assert_eq!(plan.bytes_after, 4 * GIB);
    }

    #[test]
    fn oversized_incoming_evicts_everything_and_overshoots() {
        let entries = vec![entry("a", GIB, 1), entry("b", GIB, 2)];
        let plan = plan_eviction(&entries, 6 * GIB, gib_store());
        assert_eq!(plan.evict.len(), 2);
        assert_eq!(plan.bytes_after, 6 * GIB);
    }

    #[test]
    fn equal_ages_break_ties_by_path() {
        let cap = StoreCapacity::new(100, 50).unwrap();
        let entries = vec![entry("z", 40, 5), entry("m", 40, 5), entry("a", 40, 5)];
        let plan = plan_eviction(&entries, 0, cap);
        assert_eq!(plan.evict, vec![PathBuf::from("a"), PathBuf::from("m")]);
    }

    fn write_aged(dir: &Path, name: &str, size: usize, age: u64) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, vec![0u8; size]).unwrap();
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(at(age))
            .unwrap();
        path
    }

    #[tokio::test]
    async fn make_room_deletes_oldest_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::open(dir.path(), StoreCapacity::new(1000, 600).unwrap()).unwrap();
        let oldest = write_aged(dir.path(), "job-1.png", 300, 10);
        let middle = write_aged(dir.path(), "job-2.png", 300, 20);
        let newest = write_aged(dir.path(), "job-3.png", 300, 30);

        // 900 stored + 200 incoming > 1000: evict until at most 600.
        let report = store.make_room(200).await.unwrap();
        assert_eq!(report.evicted, 2);
        assert_eq!(report.bytes_before, 1100);
        assert_eq!(report.bytes_after, 500);
        assert!(!report.overshoot);
        assert!(!oldest.exists() && !middle.exists());
        assert!(newest.exists());
        assert_eq!(store.total_bytes().await.unwrap(), 300);

        // Nothing left to do for the same request.
        let again = store.make_room(200).await.unwrap();
        assert_eq!(again.evicted, 0);
        assert!(newest.exists());
    }

    #[tokio::test]
    async fn listing_ignores_partials_and_dotfiles() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::open(dir.path(), StoreCapacity::new(1000, 600).unwrap()).unwrap();
        std::fs::write(dir.path().join("job-1.png"), b"abc").unwrap();
        std::fs::write(dir.path().join(".job-2.png.partial"), b"in flight").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        let entries = store.entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(store.total_bytes().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn failed_eviction_is_logged_and_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let wedged = dir.path().join("job-1.png");
        std::fs::create_dir(&wedged).unwrap();
        std::fs::write(wedged.join("inner"), b"x").unwrap();

        assert!(!remove_evicted(&wedged).await);
        assert!(wedged.exists());
        assert!(remove_evicted(&dir.path().join("job-gone.png")).await);
    }

    #[test]
    fn partial_file_is_removed_unless_disarmed() {
        let dir = tempfile::tempdir().unwrap();
        let dropped = dir.path().join(".job-1.png.partial");
        std::fs::write(&dropped, b"half").unwrap();
        drop(PartialFile::new(dropped.clone()));
        assert!(!dropped.exists());

        let kept = dir.path().join(".job-2.png.partial");
        std::fs::write(&kept, b"whole").unwrap();
        PartialFile::new(kept.clone()).disarm();
        assert!(kept.exists());
    }

    #[tokio::test]
    async fn open_clears_stale_partials() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join(".job-9.png.partial");
        std::fs::write(&stale, b"half").unwrap();
        ResultStore::open(dir.path(), StoreCapacity::default()).unwrap();
        assert!(!stale.exists());
    }

    #[tokio::test]
    async fn commit_names_file_after_job() {
        let store_dir = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let src = scratch.path().join("merged.png");
        std::fs::write(&src, b"PNGDATA").unwrap();

        let store = ResultStore::open(store_dir.path(), StoreCapacity::default()).unwrap();
        let job = JobId::new();
        let committed = store.commit(&job, &src, "png").await.unwrap();
        assert_eq!(committed.path, store_dir.path().join(format!("{job}.png")));
        assert_eq!(committed.size_bytes, 7);
        assert_eq!(std::fs::read(&committed.path).unwrap(), b"PNGDATA");
        // No partial left behind.
        assert_eq!(std::fs::read_dir(store_dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn commit_of_missing_source_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::open(dir.path(), StoreCapacity::default()).unwrap();
        let err = store
            .commit(&JobId::new(), &dir.path().join("nope.png"), "png")
            .await
            .unwrap_err();
        assert!(matches!(err, SpoolConvError::Storage { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_commits_stay_within_cap() {
        let store_dir = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let store = Arc::new(ResultStore::open(store_dir.path(), StoreCapacity::new(1000, 500).unwrap()).unwrap());

        let mut handles = Vec::new();
        for i in 0..16 {
            let src = scratch.path().join(format!("out-{i}.png"));
            std::fs::write(&src, vec![1u8; 200]).unwrap();
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.commit(&JobId::new(), &src, "png").await.unwrap();
                store.total_bytes().await.unwrap()
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap() <= 1000);
        }
        assert!(store.total_bytes().await.unwrap() <= 1000);
    }
}
