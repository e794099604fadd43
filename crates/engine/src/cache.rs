//! Shared-value cache: index → string, bulk-loaded once then read many times.
//!
//! Formats that deduplicate strings (a shared-string table) load it here
//! before the first sheet is walked. Small tables stay in memory; large ones
//! spill to a SQLite file in a private temp directory.

use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;

use rusqlite::{params, Connection};
use tempfile::TempDir;

use crate::error::{ExcelError, Result};

/// Tables above this many bytes go to disk with the default selector.
pub const DEFAULT_MAX_MEMORY_BYTES: u64 = 5 * 1000 * 1000;
pub const DEFAULT_SPILL_BATCH_SIZE: usize = 1000;
const HOT_BATCHES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBacking {
    Memory,
    Spill,
}

/// Two-phase cache: `put` during loading, `put_finished` to seal, then `get`.
pub trait ValueCache: Send {
    fn backing(&self) -> CacheBacking;

    /// Store a value. Each index is written at most once.
    fn put(&mut self, index: usize, value: String) -> Result<()>;

    fn put_finished(&mut self) -> Result<()>;

    /// `None` for an index that was never stored.
    fn get(&mut self, index: usize) -> Result<Option<String>>;

    /// Release backing storage. Safe to call more than once.
    fn destroy(&mut self) -> Result<()>;
}

fn not_sealed() -> ExcelError {
    ExcelError::config("value cache read before loading finished")
}

fn sealed() -> ExcelError {
    ExcelError::config("value cache written after loading finished")
}

#[derive(Debug, Default)]
pub struct MapCache {
    values: Vec<Option<String>>,
    sealed: bool,
}

impl MapCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.iter().filter(|v| v.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ValueCache for MapCache {
    fn backing(&self) -> CacheBacking {
        CacheBacking::Memory
    }

    fn put(&mut self, index: usize, value: String) -> Result<()> {
        if self.sealed {
            return Err(sealed());
        }
        if index >= self.values.len() {
            self.values.resize(index + 1, None);
        }
        let slot = &mut self.values[index];
        if slot.is_some() {
            return Err(ExcelError::config(format!(
                "value cache index {} written twice",
                index
            )));
        }
        *slot = Some(value);
        Ok(())
    }

    fn put_finished(&mut self) -> Result<()> {
        self.sealed = true;
        Ok(())
    }

    fn get(&mut self, index: usize) -> Result<Option<String>> {
        if !self.sealed {
            return Err(not_sealed());
        }
        Ok(self.values.get(index).cloned().flatten())
    }

    fn destroy(&mut self) -> Result<()> {
        self.values = Vec::new();
        Ok(())
    }
}

fn sql_err(context: &str, e: rusqlite::Error) -> ExcelError {
    ExcelError::Io(io::Error::other(format!("{}: {}", context, e)))
}

/// Disk-backed cache. Inserts are batched in transactions; reads load a
/// whole batch and keep the last few batches hot.
pub struct SpillCache {
    dir: Option<TempDir>,
    conn: Option<Connection>,
    batch_size: usize,
    pending: Vec<(usize, String)>,
    hot: VecDeque<(usize, Vec<Option<String>>)>,
    sealed: bool,
}

impl std::fmt::Debug for SpillCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpillCache")
            .field("dir", &self.dir.as_ref().map(|d| d.path().to_path_buf()))
            .field("batch_size", &self.batch_size)
            .field("sealed", &self.sealed)
            .finish()
    }
}

impl SpillCache {
    pub fn new(batch_size: usize, spill_dir: Option<&std::path::Path>) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("sheetstream-cache-");
        let dir = match spill_dir {
            Some(parent) => builder.tempdir_in(parent)?,
            None => builder.tempdir()?,
        };
        let conn = Connection::open(dir.path().join("values.db"))
            .map_err(|e| sql_err("open spill cache", e))?;
        conn.execute_batch(
            "PRAGMA synchronous = OFF;
             CREATE TABLE vals (idx INTEGER PRIMARY KEY, value TEXT NOT NULL);",
        )
        .map_err(|e| sql_err("create spill table", e))?;
        tracing::debug!(path = %dir.path().display(), batch_size, "spill cache created");

        Ok(SpillCache {
            dir: Some(dir),
            conn: Some(conn),
            batch_size: batch_size.max(1),
            pending: Vec::new(),
            hot: VecDeque::new(),
            sealed: false,
        })
    }

    /// Directory holding the database, while it exists.
    pub fn path(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.path().to_path_buf())
    }

    fn conn(&mut self) -> Result<&mut Connection> {
        self.conn
            .as_mut()
            .ok_or_else(|| ExcelError::config("value cache used after destroy"))
    }

    fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.pending);
        let conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| sql_err("begin spill batch", e))?;
        {
            let mut stmt = tx
                .prepare_cached("INSERT INTO vals (idx, value) VALUES (?1, ?2)")
                .map_err(|e| sql_err("prepare spill insert", e))?;
            for (idx, value) in &pending {
                stmt.execute(params![*idx as i64, value])
                    .map_err(|e| sql_err("spill insert", e))?;
            }
        }
        tx.commit().map_err(|e| sql_err("commit spill batch", e))
    }

    fn load_batch(&mut self, batch: usize) -> Result<Vec<Option<String>>> {
        let size = self.batch_size;
        let start = batch * size;
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare_cached("SELECT idx, value FROM vals WHERE idx >= ?1 AND idx < ?2")
            .map_err(|e| sql_err("prepare spill read", e))?;
        let rows = stmt
            .query_map(params![start as i64, (start + size) as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| sql_err("spill read", e))?;

        let mut values = vec![None; size];
        for row in rows {
            let (idx, value) = row.map_err(|e| sql_err("spill row", e))?;
            values[idx as usize - start] = Some(value);
        }
        Ok(values)
    }
}

impl ValueCache for SpillCache {
    fn backing(&self) -> CacheBacking {
        CacheBacking::Spill
    }

    fn put(&mut self, index: usize, value: String) -> Result<()> {
        if self.sealed {
            return Err(sealed());
        }
        self.pending.push((index, value));
        if self.pending.len() >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    fn put_finished(&mut self) -> Result<()> {
        self.flush()?;
        self.sealed = true;
        Ok(())
    }

    fn get(&mut self, index: usize) -> Result<Option<String>> {
        if !self.sealed {
            return Err(not_sealed());
        }
        let batch = index / self.batch_size;
        let offset = index % self.batch_size;
        if let Some((_, values)) = self.hot.iter().find(|(b, _)| *b == batch) {
            return Ok(values[offset].clone());
        }
        let values = self.load_batch(batch)?;
        let out = values[offset].clone();
        if self.hot.len() >= HOT_BATCHES {
            self.hot.pop_front();
        }
        self.hot.push_back((batch, values));
        Ok(out)
    }

    fn destroy(&mut self) -> Result<()> {
        self.pending.clear();
        self.hot.clear();
        let closed = match self.conn.take() {
            Some(conn) => conn
                .close()
                .map_err(|(_, e)| sql_err("close spill cache", e)),
            None => Ok(()),
        };
        // The directory goes even when the connection failed to close
        let removed = match self.dir.take() {
            Some(dir) => dir.close().map_err(ExcelError::from),
            None => Ok(()),
        };
        closed.and(removed)
    }
}

impl Drop for SpillCache {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            tracing::warn!(error = %e, "spill cache cleanup failed");
        }
    }
}

/// Chooses a backing from the size of the table about to be loaded.
pub trait CacheSelector: Send {
    fn select(&self, size_hint: Option<u64>) -> Result<Box<dyn ValueCache>>;
}

/// Memory below `max_memory_bytes` (or when the size is unknown), disk above.
#[derive(Debug, Clone)]
pub struct SimpleCacheSelector {
    pub max_memory_bytes: u64,
    pub batch_size: usize,
    pub spill_dir: Option<PathBuf>,
}

impl Default for SimpleCacheSelector {
    fn default() -> Self {
        Self {
            max_memory_bytes: DEFAULT_MAX_MEMORY_BYTES,
            batch_size: DEFAULT_SPILL_BATCH_SIZE,
            spill_dir: None,
        }
    }
}

impl SimpleCacheSelector {
    pub fn backing_for(&self, size_hint: Option<u64>) -> CacheBacking {
        match size_hint {
            Some(size) if size > self.max_memory_bytes => CacheBacking::Spill,
            _ => CacheBacking::Memory,
        }
    }
}

impl CacheSelector for SimpleCacheSelector {
    fn select(&self, size_hint: Option<u64>) -> Result<Box<dyn ValueCache>> {
        let backing = self.backing_for(size_hint);
        tracing::debug!(?size_hint, ?backing, "value cache selected");
        match backing {
            CacheBacking::Memory => Ok(Box::new(MapCache::new())),
            CacheBacking::Spill => Ok(Box::new(SpillCache::new(
                self.batch_size,
                self.spill_dir.as_deref(),
            )?)),
        }
    }
}

/// Always the same backing, whatever the size.
#[derive(Debug, Clone)]
pub struct FixedCacheSelector {
    pub backing: CacheBacking,
    pub batch_size: usize,
}

impl FixedCacheSelector {
    pub fn memory() -> Self {
        FixedCacheSelector {
            backing: CacheBacking::Memory,
            batch_size: DEFAULT_SPILL_BATCH_SIZE,
        }
    }

    pub fn spill(batch_size: usize) -> Self {
        FixedCacheSelector {
            backing: CacheBacking::Spill,
            batch_size,
        }
    }
}

impl CacheSelector for FixedCacheSelector {
    fn select(&self, _size_hint: Option<u64>) -> Result<Box<dyn ValueCache>> {
        match self.backing {
            CacheBacking::Memory => Ok(Box::new(MapCache::new())),
            CacheBacking::Spill => Ok(Box::new(SpillCache::new(self.batch_size, None)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(cache: &mut dyn ValueCache, n: usize) {
        for i in 0..n {
            cache.put(i, format!("s{}", i)).unwrap();
        }
        cache.put_finished().unwrap();
    }

    #[test]
    fn test_map_cache_two_phase() {
        let mut cache = MapCache::new();
        cache.put(0, "a".into()).unwrap();
        assert!(cache.get(0).is_err());
        cache.put_finished().unwrap();
        assert_eq!(cache.get(0).unwrap().as_deref(), Some("a"));
        assert_eq!(cache.get(9).unwrap(), None);
        assert!(cache.put(1, "b".into()).is_err());
    }

    #[test]
    fn test_map_cache_write_once() {
        let mut cache = MapCache::new();
        cache.put(3, "a".into()).unwrap();
        assert!(cache.put(3, "b".into()).is_err());
    }

    #[test]
    fn test_spill_cache_across_batches() {
        let mut cache = SpillCache::new(7, None).unwrap();
        load(&mut cache, 50);
        assert_eq!(cache.get(0).unwrap().as_deref(), Some("s0"));
        assert_eq!(cache.get(49).unwrap().as_deref(), Some("s49"));
        assert_eq!(cache.get(23).unwrap().as_deref(), Some("s23"));
        assert_eq!(cache.get(50).unwrap(), None);
    }

    #[test]
    fn test_spill_destroy_removes_dir_and_is_idempotent() {
        let mut cache = SpillCache::new(10, None).unwrap();
        let path = cache.path().unwrap();
        load(&mut cache, 5);
        assert!(path.exists());
        cache.destroy().unwrap();
        assert!(!path.exists());
        cache.destroy().unwrap();
        assert!(cache.get(0).is_err());
    }

    #[test]
    fn test_selector_threshold() {
        let sel = SimpleCacheSelector::default();
        assert_eq!(sel.backing_for(None), CacheBacking::Memory);
        assert_eq!(sel.backing_for(Some(5_000_000)), CacheBacking::Memory);
        assert_eq!(sel.backing_for(Some(5_000_001)), CacheBacking::Spill);

        let spilled = sel.select(Some(6_000_000)).unwrap();
        assert_eq!(spilled.backing(), CacheBacking::Spill);
    }

    #[test]
    fn test_spill_dir_respected() {
        let parent = tempfile::tempdir().unwrap();
        let cache = SpillCache::new(10, Some(parent.path())).unwrap();
        assert!(cache.path().unwrap().starts_with(parent.path()));
    }
}
