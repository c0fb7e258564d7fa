//! Reconciliation of one storage against the cache.

use async_stream::try_stream;
use exn::ResultExt;
use futures::{Stream, StreamExt, TryStreamExt};
use std::collections::HashSet;
use std::ops::BitOr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tidemark_cache::{Cache, CacheEntry, CacheUpdate};
use tidemark_storage::error::ErrorKind as StorageErrorKind;
use tidemark_storage::{BackendHandle, Depth, EntryInfo, validate_path};

use crate::error::{ErrorKind, Result};
use crate::etag;
use crate::event::ScanEvent;

pub type EventStream<'a> = Pin<Box<dyn Stream<Item = Result<ScanEvent>> + Send + 'a>>;

/// What may be kept from a cached entry whose storage mtime hasn't changed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Reuse {
    /// Keep the cached etag instead of deriving a new one.
    pub etag: bool,
    /// Keep a directory's cached size instead of marking it unknown.
    pub size: bool,
}
impl Reuse {
    pub const NONE: Self = Self { etag: false, size: false };
    pub const ETAG: Self = Self { etag: true, size: false };
    pub const SIZE: Self = Self { etag: false, size: true };
    pub const ALL: Self = Self { etag: true, size: true };
}
impl BitOr for Reuse {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self { etag: self.etag || rhs.etag, size: self.size || rhs.size }
    }
}

fn visit(info: &EntryInfo) -> ScanEvent {
    if info.is_dir() {
        ScanEvent::ScanFolder(info.path.clone())
    } else {
        ScanEvent::ScanFile(info.path.clone())
    }
}

/// Whether the storage still reports what the cache remembers.
///
/// The cache keeps whole seconds, so the storage mtime is compared at that
/// resolution.
fn unchanged(cached: &CacheEntry, info: &EntryInfo) -> bool {
    cached.kind == info.kind
        && cached.storage_mtime.unix_timestamp() == info.modified.unix_timestamp()
        && (info.is_dir() || cached.size == Some(info.size))
}

/// Walks one storage and brings its cache entries up to date.
///
/// Paths in and out (including the paths of emitted events) are relative to
/// the storage root.
pub struct StorageScanner {
    storage: BackendHandle,
    cache: Cache,
    use_transactions: bool,
}

impl StorageScanner {
    pub fn new(storage: BackendHandle, cache: Cache) -> Self {
        Self { storage, cache, use_transactions: true }
    }

    /// Whether each scan runs in a transaction of its own.
    ///
    /// Ignored when the cache handle is already inside a transaction; the
    /// scan then simply joins it.
    pub fn with_transactions(mut self, use_transactions: bool) -> Self {
        self.use_transactions = use_transactions;
        self
    }

    pub fn storage(&self) -> &BackendHandle {
        &self.storage
    }

    async fn begin(&self) -> Result<Option<Cache>> {
        if self.use_transactions && !self.cache.in_transaction() {
            Ok(Some(self.cache.begin().await.or_raise(|| ErrorKind::Cache)?))
        } else {
            Ok(None)
        }
    }

    /// Scan `path` (and, depending on `depth`, what is below it).
    ///
    /// The returned stream does the work as it is polled and yields an event
    /// for every entry visited and every cache change made. An error ends
    /// the stream; if the scan ran in its own transaction, nothing it did is
    /// kept.
    pub fn scan<'a>(&'a self, path: &'a Path, depth: Depth, reuse: Reuse) -> EventStream<'a> {
        Box::pin(self.scan_events(path, depth, reuse))
    }

    fn scan_events<'a>(
        &'a self,
        path: &'a Path,
        depth: Depth,
        reuse: Reuse,
    ) -> impl Stream<Item = Result<ScanEvent>> + Send + 'a {
        try_stream! {
            let path = validate_path(path).or_raise(|| ErrorKind::InvalidPath(path.to_path_buf()))?;
            let id = self.storage.id();
            let own = self.begin().await?;
            let cache = own.as_ref().unwrap_or(&self.cache);
            tracing::debug!(storage = id, path = %path.display(), ?depth, "Scanning storage");

            // 1. The entry itself. Gone means its whole cached subtree goes.
            let info = match self.storage.stat(&path).await {
                Ok(info) => Some(info),
                Err(err) if matches!(&*err, StorageErrorKind::NotFound(_)) => None,
                Err(err) => Err(err).or_raise(|| ErrorKind::Storage)?,
            };
            let Some(info) = info else {
                if cache.remove(id, &path).await.or_raise(|| ErrorKind::Cache)? {
                    yield ScanEvent::RemoveFromCache(path.clone());
                    for ancestor in path.ancestors().skip(1) {
                        cache.calculate_folder_size(id, ancestor).await.or_raise(|| ErrorKind::Cache)?;
                    }
                }
                if let Some(own) = &own {
                    own.commit().await.or_raise(|| ErrorKind::Cache)?;
                }
                return;
            };

            // Ancestors the cache has never heard of are added first.
            let mut missing = Vec::new();
            for ancestor in path.ancestors().skip(1) {
                if cache.in_cache(id, ancestor).await.or_raise(|| ErrorKind::Cache)? {
                    break;
                }
                missing.push(ancestor.to_path_buf());
            }
            for ancestor in missing.iter().rev() {
                let info = self.storage.stat(ancestor).await.or_raise(|| ErrorKind::Storage)?;
                yield visit(&info);
                if let Some(event) = self.reconcile(cache, &info, reuse).await? {
                    yield event;
                }
            }

            // 2. The entry, then everything the listing yields below it.
            yield visit(&info);
            if let Some(event) = self.reconcile(cache, &info, reuse).await? {
                yield event;
            }
            if info.is_dir() {
                let mut seen = HashSet::new();
                let mut directories = vec![path.clone()];
                let mut listing = self.storage.list_stream(&path, depth);
                while let Some(entry) = listing.try_next().await.or_raise(|| ErrorKind::Storage)? {
                    yield visit(&entry);
                    if let Some(event) = self.reconcile(cache, &entry, reuse).await? {
                        yield event;
                    }
                    // Only directories whose contents were listed can be sized.
                    if entry.is_dir() && depth == Depth::Recursive {
                        directories.push(entry.path.clone());
                    }
                    seen.insert(entry.path);
                }

                // 3. Whatever the cache still has that the listing didn't yield.
                let cached = cache.paths_under(id, &path, depth).await.or_raise(|| ErrorKind::Cache)?;
                let mut removed: Vec<PathBuf> = Vec::new();
                for stale in cached {
                    if seen.contains(&stale) || removed.iter().any(|parent| stale.starts_with(parent)) {
                        continue;
                    }
                    cache.remove(id, &stale).await.or_raise(|| ErrorKind::Cache)?;
                    tracing::debug!(storage = id, path = %stale.display(), "Removed vanished entry");
                    yield ScanEvent::RemoveFromCache(stale.clone());
                    removed.push(stale);
                }

                // 4. Sizes, children before their parents.
                directories.sort_by_key(|dir| std::cmp::Reverse(dir.components().count()));
                for dir in &directories {
                    cache.calculate_folder_size(id, dir).await.or_raise(|| ErrorKind::Cache)?;
                }
            }
            // Ancestors added above were never listed, so they stay incomplete.
            for ancestor in path.ancestors().skip(1).filter(|ancestor| !missing.iter().any(|added| added == ancestor)) {
                cache.calculate_folder_size(id, ancestor).await.or_raise(|| ErrorKind::Cache)?;
            }

            if let Some(own) = &own {
                own.commit().await.or_raise(|| ErrorKind::Cache)?;
            }
        }
    }

    /// Bring one entry's cache row in line with `info`.
    ///
    /// Returns the change event, if the cache had to change.
    async fn reconcile(&self, cache: &Cache, info: &EntryInfo, reuse: Reuse) -> Result<Option<ScanEvent>> {
        let id = self.storage.id();
        let cached = cache.get(id, &info.path).await.or_raise(|| ErrorKind::Cache)?;
        let size = if info.is_dir() { None } else { Some(info.size) };
        let update = match cached {
            Some(cached) if unchanged(&cached, info) => {
                let mut update = CacheUpdate::new();
                if !reuse.etag {
                    let etag = etag::derive(id, info);
                    if etag != cached.etag {
                        update = update.etag(etag);
                    }
                }
                if info.is_dir() && !reuse.size && cached.size.is_some() {
                    // Not a change anyone has to hear about: the size gets recalculated.
                    cache.put(id, &info.path, &CacheUpdate::new().size(None)).await.or_raise(|| ErrorKind::Cache)?;
                }
                if update.is_empty() {
                    return Ok(None);
                }
                update
            },
            Some(cached) => {
                if cached.kind != info.kind {
                    tracing::debug!(storage = id, path = %info.path.display(), from = %cached.kind, to = %info.kind, "Entry changed kind");
                    cache.remove(id, &info.path).await.or_raise(|| ErrorKind::Cache)?;
                }
                let size = if info.is_dir() && reuse.size && cached.kind == info.kind { cached.size } else { size };
                CacheUpdate::new()
                    .kind(info.kind)
                    .size(size)
                    .mtime(info.modified)
                    .storage_mtime(info.modified)
                    .etag(etag::derive(id, info))
            },
            None => CacheUpdate::new()
                .kind(info.kind)
                .size(size)
                .mtime(info.modified)
                .storage_mtime(info.modified)
                .etag(etag::derive(id, info)),
        };
        cache.put(id, &info.path, &update).await.or_raise(|| ErrorKind::Cache)?;
        tracing::trace!(storage = id, path = %info.path.display(), "Cache entry written");
        Ok(Some(ScanEvent::AddToCache(info.path.clone())))
    }

    /// Finish what earlier (shallow or interrupted) scans left incomplete.
    ///
    /// If the storage root isn't cached yet, only the root and its direct
    /// children are scanned. Otherwise the most recently added incomplete
    /// directory is scanned recursively, until no incomplete directory is
    /// left, the same one comes back twice in a row, or `limit` directories
    /// have been processed.
    pub fn background_scan(&self, limit: Option<usize>) -> EventStream<'_> {
        Box::pin(self.background_events(limit))
    }

    fn background_events(&self, limit: Option<usize>) -> impl Stream<Item = Result<ScanEvent>> + Send + '_ {
        try_stream! {
            let id = self.storage.id();
            let root = PathBuf::new();
            if !self.cache.in_cache(id, &root).await.or_raise(|| ErrorKind::Cache)? {
                let mut events = self.scan(&root, Depth::Shallow, Reuse::ALL);
                while let Some(event) = events.next().await {
                    yield event?;
                }
                return;
            }

            let mut last: Option<PathBuf> = None;
            let mut processed = 0;
            while let Some(path) = self.cache.get_incomplete(id).await.or_raise(|| ErrorKind::Cache)? {
                if last.as_ref() == Some(&path) {
                    tracing::warn!(storage = id, path = %path.display(), "Directory still incomplete after scanning; giving up");
                    break;
                }
                if limit.is_some_and(|limit| processed >= limit) {
                    tracing::debug!(storage = id, processed, "Background scan limit reached");
                    break;
                }
                {
                    let mut events = self.scan(&path, Depth::Recursive, Reuse::ALL);
                    while let Some(event) = events.next().await {
                        yield event?;
                    }
                }
                processed += 1;
                last = Some(path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::Arc;
    use tidemark_cache::Database;
    use tidemark_storage::backend::MemoryBackend;
    use time::{Duration, OffsetDateTime};

    const ID: &str = "memory::memory";

    async fn setup() -> (Database, Cache, Arc<MemoryBackend>, StorageScanner) {
        let db = Database::connect_in_memory().await.unwrap();
        let cache = Cache::from(&db);
        let backend = Arc::new(MemoryBackend::with_files([
            ("foo.txt", Vec::from(*b"foo")),
            ("folder/bar.txt", Vec::from(*b"qwerty")),
        ]));
        let scanner = StorageScanner::new(backend.clone(), cache.clone());
        (db, cache, backend, scanner)
    }

    async fn run(scanner: &StorageScanner, path: &str, depth: Depth) -> Vec<ScanEvent> {
        scanner.scan(Path::new(path), depth, Reuse::ALL).try_collect().await.unwrap()
    }

    fn changes(events: &[ScanEvent]) -> Vec<ScanEvent> {
        events.iter().filter(|event| event.is_change()).cloned().collect()
    }

    #[rstest]
    #[case(Reuse::ETAG | Reuse::SIZE, Reuse::ALL)]
    #[case(Reuse::NONE | Reuse::ETAG, Reuse::ETAG)]
    #[case(Reuse::default(), Reuse::NONE)]
    fn test_reuse_flags(#[case] combined: Reuse, #[case] expected: Reuse) {
        assert_eq!(combined, expected);
    }

    #[tokio::test]
    async fn test_first_scan_adds_everything() {
        let (_db, cache, _backend, scanner) = setup().await;
        let events = run(&scanner, "", Depth::Recursive).await;
        assert_eq!(
            changes(&events),
            vec![
                ScanEvent::AddToCache(PathBuf::from("")),
                ScanEvent::AddToCache(PathBuf::from("folder")),
                ScanEvent::AddToCache(PathBuf::from("folder/bar.txt")),
                ScanEvent::AddToCache(PathBuf::from("foo.txt")),
            ]
        );
        assert!(events.contains(&ScanEvent::ScanFolder(PathBuf::from("folder"))));
        assert!(events.contains(&ScanEvent::ScanFile(PathBuf::from("foo.txt"))));
        assert_eq!(cache.get(ID, "").await.unwrap().unwrap().size, Some(9));
        assert_eq!(cache.get(ID, "folder").await.unwrap().unwrap().size, Some(6));
    }

    #[tokio::test]
    async fn test_rescan_without_changes_is_silent() {
        let (_db, cache, _backend, scanner) = setup().await;
        run(&scanner, "", Depth::Recursive).await;
        let before = cache.get(ID, "folder/bar.txt").await.unwrap().unwrap();
        let events = run(&scanner, "", Depth::Recursive).await;
        assert!(changes(&events).is_empty());
        assert_eq!(cache.get(ID, "folder/bar.txt").await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn test_modified_file_is_updated() {
        let (_db, cache, backend, scanner) = setup().await;
        run(&scanner, "", Depth::Recursive).await;
        let before = cache.get(ID, "foo.txt").await.unwrap().unwrap();
        let later = OffsetDateTime::now_utc() + Duration::minutes(5);
        backend.write_at(Path::new("foo.txt"), b"foobar", later).await.unwrap();

        let events = run(&scanner, "", Depth::Recursive).await;
        assert_eq!(changes(&events), vec![ScanEvent::AddToCache(PathBuf::from("foo.txt"))]);
        let after = cache.get(ID, "foo.txt").await.unwrap().unwrap();
        assert_ne!(after.etag, before.etag);
        assert_eq!(after.size, Some(6));
        assert_eq!(cache.get(ID, "").await.unwrap().unwrap().size, Some(12));
    }

    #[tokio::test]
    async fn test_vanished_entries_are_removed() {
        let (_db, cache, backend, scanner) = setup().await;
        run(&scanner, "", Depth::Recursive).await;
        backend.delete(Path::new("folder")).await.unwrap();
        let events = run(&scanner, "", Depth::Recursive).await;
        let changes = changes(&events);
        // One removal event for the topmost path only.
        assert!(changes.contains(&ScanEvent::RemoveFromCache(PathBuf::from("folder"))));
        assert!(!changes.contains(&ScanEvent::RemoveFromCache(PathBuf::from("folder/bar.txt"))));
        assert!(!cache.in_cache(ID, "folder/bar.txt").await.unwrap());
        assert_eq!(cache.get(ID, "").await.unwrap().unwrap().size, Some(3));
    }

    #[tokio::test]
    async fn test_subpath_scan_updates_ancestor_sizes() {
        let (_db, cache, backend, scanner) = setup().await;
        run(&scanner, "", Depth::Recursive).await;
        let later = OffsetDateTime::now_utc() + Duration::minutes(5);
        backend.write_at(Path::new("folder/bar.txt"), b"qwertyuiop", later).await.unwrap();
        run(&scanner, "folder", Depth::Recursive).await;
        assert_eq!(cache.get(ID, "folder").await.unwrap().unwrap().size, Some(10));
        assert_eq!(cache.get(ID, "").await.unwrap().unwrap().size, Some(13));
    }

    #[tokio::test]
    async fn test_scanning_a_missing_path_removes_it() {
        let (_db, cache, backend, scanner) = setup().await;
        run(&scanner, "", Depth::Recursive).await;
        backend.delete(Path::new("folder/bar.txt")).await.unwrap();
        let events = run(&scanner, "folder/bar.txt", Depth::Recursive).await;
        assert_eq!(events, vec![ScanEvent::RemoveFromCache(PathBuf::from("folder/bar.txt"))]);
        assert!(!cache.in_cache(ID, "folder/bar.txt").await.unwrap());
        assert_eq!(cache.get(ID, "").await.unwrap().unwrap().size, Some(3));
        assert!(run(&scanner, "never-existed", Depth::Recursive).await.is_empty());
    }

    #[tokio::test]
    async fn test_kind_change_replaces_entry() {
        let (_db, cache, backend, scanner) = setup().await;
        run(&scanner, "", Depth::Recursive).await;
        backend.delete(Path::new("foo.txt")).await.unwrap();
        backend.write(Path::new("foo.txt/inner.txt"), b"x").await.unwrap();
        run(&scanner, "", Depth::Recursive).await;
        let entry = cache.get(ID, "foo.txt").await.unwrap().unwrap();
        assert!(entry.is_dir());
        assert_eq!(entry.size, Some(1));
        assert!(cache.in_cache(ID, "foo.txt/inner.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_shallow_scan_leaves_directories_incomplete() {
        let (_db, cache, _backend, scanner) = setup().await;
        let events = run(&scanner, "", Depth::Shallow).await;
        assert!(!events.contains(&ScanEvent::AddToCache(PathBuf::from("folder/bar.txt"))));
        assert!(cache.get(ID, "folder").await.unwrap().unwrap().is_incomplete());
        assert!(cache.get(ID, "").await.unwrap().unwrap().is_incomplete());
    }

    #[tokio::test]
    async fn test_subpath_scan_adds_missing_ancestors() {
        let (_db, cache, _backend, scanner) = setup().await;
        let events = run(&scanner, "folder/bar.txt", Depth::Recursive).await;
        assert_eq!(
            changes(&events),
            vec![
                ScanEvent::AddToCache(PathBuf::from("")),
                ScanEvent::AddToCache(PathBuf::from("folder")),
                ScanEvent::AddToCache(PathBuf::from("folder/bar.txt")),
            ]
        );
        assert!(!cache.in_cache(ID, "foo.txt").await.unwrap());
        // Only part of their contents is known.
        assert!(cache.get(ID, "folder").await.unwrap().unwrap().is_incomplete());
        assert!(cache.get(ID, "").await.unwrap().unwrap().is_incomplete());
    }

    #[tokio::test]
    async fn test_failed_scan_rolls_back_own_transaction() {
        let (_db, cache, backend, scanner) = setup().await;
        backend.poison(Path::new("folder/bar.txt")).await.unwrap();
        let result: Result<Vec<ScanEvent>> = scanner.scan(Path::new(""), Depth::Recursive, Reuse::ALL).try_collect().await;
        let err = result.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Storage));
        assert!(!cache.in_cache(ID, "").await.unwrap());
    }

    #[tokio::test]
    async fn test_without_reuse_directories_get_new_etags() {
        let (_db, cache, _backend, scanner) = setup().await;
        run(&scanner, "", Depth::Recursive).await;
        cache.put(ID, "folder", &CacheUpdate::new().etag("propagated")).await.unwrap();
        let events: Vec<ScanEvent> =
            scanner.scan(Path::new(""), Depth::Recursive, Reuse::SIZE).try_collect().await.unwrap();
        assert_eq!(changes(&events), vec![ScanEvent::AddToCache(PathBuf::from("folder"))]);
        assert_ne!(cache.get(ID, "folder").await.unwrap().unwrap().etag, "propagated");
    }

    #[tokio::test]
    async fn test_background_scan_completes_tree() {
        let (_db, cache, backend, scanner) = setup().await;
        backend.write(Path::new("folder/sub/deep.txt"), b"deep").await.unwrap();

        // First round: only the root level.
        let events: Vec<ScanEvent> = scanner.background_scan(None).try_collect().await.unwrap();
        assert!(events.contains(&ScanEvent::AddToCache(PathBuf::from("folder"))));
        assert!(!cache.in_cache(ID, "folder/bar.txt").await.unwrap());
        assert_eq!(cache.get_incomplete(ID).await.unwrap(), Some(PathBuf::from("folder")));

        // Second round: everything incomplete gets filled in.
        let events: Vec<ScanEvent> = scanner.background_scan(None).try_collect().await.unwrap();
        assert!(events.contains(&ScanEvent::AddToCache(PathBuf::from("folder/sub/deep.txt"))));
        assert_eq!(cache.get_incomplete(ID).await.unwrap(), None);
        assert_eq!(cache.get(ID, "").await.unwrap().unwrap().size, Some(13));
    }

    #[tokio::test]
    async fn test_background_scan_respects_limit() {
        let (_db, cache, backend, scanner) = setup().await;
        backend.write(Path::new("other/file.txt"), b"x").await.unwrap();
        let _: Vec<ScanEvent> = scanner.background_scan(None).try_collect().await.unwrap();
        let _: Vec<ScanEvent> = scanner.background_scan(Some(1)).try_collect().await.unwrap();
        // "other" was added last, so it was completed first; "folder" waits.
        assert!(cache.in_cache(ID, "other/file.txt").await.unwrap());
        assert!(!cache.in_cache(ID, "folder/bar.txt").await.unwrap());
    }
}
