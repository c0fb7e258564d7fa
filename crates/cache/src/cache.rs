//! Cache handle: entry lookups and updates, optionally inside a transaction.

use crate::Database;
use crate::error::{ErrorKind, Result};
use crate::models::{CacheEntry, CacheUpdate, EntryRow, NewEntryRow, path_to_text, size_to_row};
use exn::{OptionExt, ResultExt};
use sqlx::pool::PoolConnection;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tidemark_storage::{Depth, EntryKind};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::instrument;

type SharedTransaction = Arc<Mutex<Option<Transaction<'static, Sqlite>>>>;

/// A connection borrowed for the duration of one query.
enum Conn<'a> {
    Pooled(PoolConnection<Sqlite>),
    Transaction(MappedMutexGuard<'a, Transaction<'static, Sqlite>>),
}
impl Deref for Conn<'_> {
    type Target = SqliteConnection;
    fn deref(&self) -> &SqliteConnection {
        match self {
            Self::Pooled(conn) => &**conn,
            Self::Transaction(tx) => &***tx,
        }
    }
}
impl DerefMut for Conn<'_> {
    fn deref_mut(&mut self) -> &mut SqliteConnection {
        match self {
            Self::Pooled(conn) => &mut **conn,
            Self::Transaction(tx) => &mut ***tx,
        }
    }
}

/// Prefix shared by every path strictly below `path`.
///
/// Compared with `substr()` rather than `LIKE`, which ignores ASCII case.
fn descendants_prefix(path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }
    format!("{path}/")
}

/// Metadata cache for every storage, keyed by storage identifier and the path
/// relative to that storage's root.
///
/// A plain handle runs every operation on its own pooled connection. A handle
/// returned by [`begin()`](Self::begin) runs every operation inside one
/// transaction until [`commit()`](Self::commit) or
/// [`rollback()`](Self::rollback); clones share that transaction. Dropping
/// the last clone of an open transaction rolls it back.
///
/// > **Note:** While a transaction is open it holds one pooled connection.
/// > With the single-connection in-memory database, plain handles will block
/// > until that transaction ends.
#[derive(Clone)]
pub struct Cache {
    pool: SqlitePool,
    tx: Option<SharedTransaction>,
}
impl From<&Database> for Cache {
    fn from(db: &Database) -> Self {
        Self::new(db.pool().clone())
    }
}
impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache").field("in_transaction", &self.in_transaction()).finish_non_exhaustive()
    }
}
impl Cache {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool, tx: None }
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Start a transaction, returning a handle that runs inside it.
    ///
    /// Returns [`ErrorKind::NestedTransaction`] if this handle is already
    /// transactional.
    pub async fn begin(&self) -> Result<Self> {
        if self.tx.is_some() {
            exn::bail!(ErrorKind::NestedTransaction);
        }
        let tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        Ok(Self { pool: self.pool.clone(), tx: Some(Arc::new(Mutex::new(Some(tx)))) })
    }

    /// Commit the transaction behind this handle.
    pub async fn commit(&self) -> Result<()> {
        self.take_transaction().await?.commit().await.or_raise(|| ErrorKind::Database)
    }

    /// Discard everything written through this handle since [`begin()`](Self::begin).
    pub async fn rollback(&self) -> Result<()> {
        self.take_transaction().await?.rollback().await.or_raise(|| ErrorKind::Database)
    }

    /// Whether operations on this handle run inside a transaction.
    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    async fn take_transaction(&self) -> Result<Transaction<'static, Sqlite>> {
        let Some(shared) = &self.tx else {
            exn::bail!(ErrorKind::TransactionClosed);
        };
        shared.lock().await.take().ok_or_raise(|| ErrorKind::TransactionClosed)
    }

    async fn acquire(&self) -> Result<Conn<'_>> {
        match &self.tx {
            None => Ok(Conn::Pooled(self.pool.acquire().await.or_raise(|| ErrorKind::Database)?)),
            Some(shared) => {
                let guard = shared.lock().await;
                let tx = MutexGuard::try_map(guard, Option::as_mut).ok().ok_or_raise(|| ErrorKind::TransactionClosed)?;
                Ok(Conn::Transaction(tx))
            },
        }
    }

    // =========================================================================
    // Get/Fetch
    // =========================================================================

    /// Whether the cache has an entry at `path` on `storage`.
    pub async fn in_cache(&self, storage: &str, path: impl AsRef<Path>) -> Result<bool> {
        Ok(self.fileid(storage, path).await?.is_some())
    }

    /// Get the entry at `path` on `storage`.
    pub async fn get(&self, storage: &str, path: impl AsRef<Path>) -> Result<Option<CacheEntry>> {
        let path = path_to_text(path.as_ref())?;
        let mut conn = self.acquire().await?;
        let row: Option<EntryRow> = sqlx::query_as(include_str!("../queries/get_entry.sql"))
            .bind(storage)
            .bind(path)
            .fetch_optional(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(CacheEntry::try_from).transpose()
    }

    async fn fileid(&self, storage: &str, path: impl AsRef<Path>) -> Result<Option<i64>> {
        let path = path_to_text(path.as_ref())?;
        let mut conn = self.acquire().await?;
        sqlx::query_scalar(include_str!("../queries/get_fileid.sql"))
            .bind(storage)
            .bind(path)
            .fetch_optional(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)
    }

    /// Direct children of the directory at `path`, ordered by name.
    pub async fn get_folder_contents(&self, storage: &str, path: impl AsRef<Path>) -> Result<Vec<CacheEntry>> {
        let path = path_to_text(path.as_ref())?;
        let mut conn = self.acquire().await?;
        let rows: Vec<EntryRow> = sqlx::query_as(include_str!("../queries/get_folder_contents.sql"))
            .bind(storage)
            .bind(path)
            .fetch_all(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(CacheEntry::try_from).collect()
    }

    /// Paths of the cached entries below `path` (not including `path`), in
    /// lexicographic order. Shallow lists direct children only.
    pub async fn paths_under(&self, storage: &str, path: impl AsRef<Path>, depth: Depth) -> Result<Vec<PathBuf>> {
        let path = path_to_text(path.as_ref())?;
        let mut conn = self.acquire().await?;
        let paths: Vec<String> = match depth {
            Depth::Shallow => sqlx::query_scalar(include_str!("../queries/list_child_paths.sql"))
                .bind(storage)
                .bind(&path)
                .fetch_all(&mut *conn)
                .await
                .or_raise(|| ErrorKind::Database)?,
            Depth::Recursive => sqlx::query_scalar(include_str!("../queries/list_descendant_paths.sql"))
                .bind(storage)
                .bind(&path)
                .bind(descendants_prefix(&path))
                .fetch_all(&mut *conn)
                .await
                .or_raise(|| ErrorKind::Database)?,
        };
        Ok(paths.into_iter().map(PathBuf::from).collect())
    }

    /// The most recently inserted directory whose size is still unknown.
    pub async fn get_incomplete(&self, storage: &str) -> Result<Option<PathBuf>> {
        let mut conn = self.acquire().await?;
        let path: Option<String> = sqlx::query_scalar(include_str!("../queries/get_incomplete.sql"))
            .bind(storage)
            .fetch_optional(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(path.map(PathBuf::from))
    }

    // =========================================================================
    // Insert/Update
    // =========================================================================

    /// Write an entry, returning its file ID.
    ///
    /// An existing entry only has the fields set in `update` overwritten; a
    /// missing entry is created, with defaults for the fields left unset (see
    /// [`CacheUpdate`]).
    #[instrument(level = "trace", skip(self, path, update), fields(path = %path.as_ref().display()))]
    pub async fn put(&self, storage: &str, path: impl AsRef<Path>, update: &CacheUpdate) -> Result<i64> {
        let path = path.as_ref();
        match self.fileid(storage, path).await? {
            None => self.insert(storage, path, update).await,
            Some(fileid) if update.is_empty() => Ok(fileid),
            Some(fileid) => {
                self.update(fileid, update).await?;
                Ok(fileid)
            },
        }
    }

    async fn insert(&self, storage: &str, path: &Path, update: &CacheUpdate) -> Result<i64> {
        let row = NewEntryRow::new(storage, path, update)?;
        let mut conn = self.acquire().await?;
        sqlx::query_scalar(include_str!("../queries/insert_entry.sql"))
            .bind(row.storage)
            .bind(row.path)
            .bind(row.parent)
            .bind(row.name)
            .bind(row.kind)
            .bind(row.size)
            .bind(row.mtime)
            .bind(row.storage_mtime)
            .bind(row.etag)
            .fetch_one(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)
    }

    async fn update(&self, fileid: i64, update: &CacheUpdate) -> Result<()> {
        let mut query = QueryBuilder::<Sqlite>::new("UPDATE filecache SET ");
        let mut columns = query.separated(", ");
        if let Some(kind) = update.kind {
            columns.push("kind = ").push_bind_unseparated(kind.to_string());
        }
        if let Some(size) = update.size {
            columns.push("size = ").push_bind_unseparated(size_to_row(size)?);
        }
        if let Some(mtime) = update.mtime {
            columns.push("mtime = ").push_bind_unseparated(mtime.unix_timestamp());
        }
        if let Some(storage_mtime) = update.storage_mtime {
            columns.push("storage_mtime = ").push_bind_unseparated(storage_mtime.unix_timestamp());
        }
        if let Some(etag) = &update.etag {
            columns.push("etag = ").push_bind_unseparated(etag.clone());
        }
        query.push(" WHERE fileid = ").push_bind(fileid);
        let mut conn = self.acquire().await?;
        query.build().execute(&mut *conn).await.or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Remove the entry at `path` and everything below it.
    ///
    /// Returns `true` if anything was removed.
    #[instrument(level = "trace", skip(self, path), fields(path = %path.as_ref().display()))]
    pub async fn remove(&self, storage: &str, path: impl AsRef<Path>) -> Result<bool> {
        let path = path_to_text(path.as_ref())?;
        let mut conn = self.acquire().await?;
        let result = sqlx::query(include_str!("../queries/remove_subtree.sql"))
            .bind(storage)
            .bind(&path)
            .bind(descendants_prefix(&path))
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Sizes
    // =========================================================================

    /// Recalculate and store the size of the directory at `path` from the
    /// sizes of its direct children.
    ///
    /// The result is `None` if any child is an incomplete directory, or if
    /// nothing is cached at `path`. For a file, the stored size is returned
    /// unchanged.
    pub async fn calculate_folder_size(&self, storage: &str, path: impl AsRef<Path>) -> Result<Option<u64>> {
        let path = path.as_ref();
        let Some(entry) = self.get(storage, path).await? else {
            return Ok(None);
        };
        if entry.kind == EntryKind::File {
            return Ok(entry.size);
        }
        let text = path_to_text(path)?;
        let mut conn = self.acquire().await?;
        let sizes: Vec<Option<i64>> = sqlx::query_scalar(include_str!("../queries/list_child_sizes.sql"))
            .bind(storage)
            .bind(&text)
            .fetch_all(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        let total = sizes
            .into_iter()
            .try_fold(0i64, |total, size| size.map(|size| total.saturating_add(size)))
            .map(|total| u64::try_from(total).or_raise(|| ErrorKind::InvalidData("size")))
            .transpose()?;
        if total != entry.size {
            sqlx::query(include_str!("../queries/set_size.sql"))
                .bind(storage)
                .bind(&text)
                .bind(size_to_row(total)?)
                .execute(&mut *conn)
                .await
                .or_raise(|| ErrorKind::Database)?;
        }
        Ok(total)
    }
}
