//! Local snapshot cache
//!
//! One serialized `Snapshot` per dataset key. Storage keys carry a schema
//! version so a change to the cached shape simply stops matching old entries
//! instead of migrating them.

pub mod sqlite;

pub use sqlite::SqliteSnapshotStore;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::models::{DatasetRow, GroupSummary};

/// Bump when `Snapshot` (or any cached row type) changes shape.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// A reconciled copy of one dataset.
///
/// Rows are newest-first and unique by id; `watermark` is the highest id in
/// `rows` (0 when empty). `fetched_at` is the epoch second of the last full
/// load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot<R> {
    pub dataset_key: String,
    pub rows: Vec<R>,
    pub groups: BTreeMap<i64, GroupSummary>,
    pub watermark: i64,
    pub fetched_at: i64,
}

impl<R: DatasetRow> Snapshot<R> {
    /// Build from a full load. Input order does not matter.
    pub fn from_full_load(
        dataset_key: &str,
        mut rows: Vec<R>,
        groups: impl IntoIterator<Item = GroupSummary>,
        fetched_at: i64,
    ) -> Self {
        rows.sort_by(|a, b| b.row_id().cmp(&a.row_id()));
        rows.dedup_by_key(|r| r.row_id());
        let watermark = rows.first().map(|r| r.row_id()).unwrap_or(0);
        Self {
            dataset_key: dataset_key.to_string(),
            rows,
            groups: groups.into_iter().map(|g| (g.group_id, g)).collect(),
            watermark,
            fetched_at,
        }
    }

    /// Prepend rows newer than the watermark and add their groups.
    ///
    /// Rows at or below the watermark are dropped: ids are append-only, so
    /// they can only be duplicates of rows already held.
    pub fn merge_incremental(
        &self,
        new_rows: Vec<R>,
        new_groups: impl IntoIterator<Item = GroupSummary>,
    ) -> Self {
        let mut fresh: Vec<R> = new_rows
            .into_iter()
            .filter(|r| r.row_id() > self.watermark)
            .collect();
        fresh.sort_by(|a, b| b.row_id().cmp(&a.row_id()));
        fresh.dedup_by_key(|r| r.row_id());

        let watermark = fresh
            .first()
            .map(|r| r.row_id().max(self.watermark))
            .unwrap_or(self.watermark);

        let mut rows = fresh;
        rows.extend(self.rows.iter().cloned());

        let mut groups = self.groups.clone();
        for g in new_groups {
            groups.insert(g.group_id, g);
        }

        Self {
            dataset_key: self.dataset_key.clone(),
            rows,
            groups,
            watermark,
            fetched_at: self.fetched_at,
        }
    }

    /// Parent ids referenced by `rows` that have no group yet.
    pub fn missing_group_ids<'a>(&self, rows: impl IntoIterator<Item = &'a R>) -> Vec<i64> {
        let mut seen = HashSet::new();
        rows.into_iter()
            .filter_map(|r| r.parent_id())
            .filter(|id| !self.groups.contains_key(id) && seen.insert(*id))
            .collect()
    }

    pub fn is_fresh(&self, ttl: Duration, now: i64) -> bool {
        is_fresh(self.fetched_at, ttl, now)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// `now - fetched_at <= ttl`, in epoch seconds.
pub fn is_fresh(fetched_at: i64, ttl: Duration, now: i64) -> bool {
    now.saturating_sub(fetched_at) <= ttl.as_secs() as i64
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
    pub payload: String,
    pub fetched_at: i64,
}

/// Key/value persistence underneath the cache.
pub trait SnapshotStore: Send + Sync {
    fn load(&self, storage_key: &str) -> Result<Option<StoredEntry>>;
    fn save(&self, storage_key: &str, payload: &str, fetched_at: i64) -> Result<()>;
    fn remove(&self, storage_key: &str) -> Result<()>;
    fn keys(&self) -> Result<Vec<String>>;
    /// Drop entries whose stored `fetched_at` is before `cutoff`; returns how
    /// many. Snapshots keep the `fetched_at` of their last full load.
    fn purge_older_than(&self, cutoff: i64) -> Result<usize>;
}

/// Process-local store, used in tests and when no cache path is configured.
#[derive(Default)]
pub struct MemorySnapshotStore {
    entries: Mutex<HashMap<String, StoredEntry>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self, storage_key: &str) -> Result<Option<StoredEntry>> {
        Ok(self.entries.lock().get(storage_key).cloned())
    }

    fn save(&self, storage_key: &str, payload: &str, fetched_at: i64) -> Result<()> {
        self.entries.lock().insert(
            storage_key.to_string(),
            StoredEntry {
                payload: payload.to_string(),
                fetched_at,
            },
        );
        Ok(())
    }

    fn remove(&self, storage_key: &str) -> Result<()> {
        self.entries.lock().remove(storage_key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self.entries.lock().keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    fn purge_older_than(&self, cutoff: i64) -> Result<usize> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.fetched_at >= cutoff);
        Ok(before - entries.len())
    }
}

/// Typed, version-keyed view over a `SnapshotStore`.
#[derive(Clone)]
pub struct SnapshotCache {
    store: Arc<dyn SnapshotStore>,
    version: u32,
}

impl SnapshotCache {
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self::with_version(store, SNAPSHOT_SCHEMA_VERSION)
    }

    pub fn with_version(store: Arc<dyn SnapshotStore>, version: u32) -> Self {
        Self { store, version }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemorySnapshotStore::new()))
    }

    fn version_prefix(&self) -> String {
        format!("snapshot:v{}:", self.version)
    }

    pub fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.version_prefix(), key)
    }

    pub fn get<R: DatasetRow>(&self, key: &str) -> Result<Option<Snapshot<R>>> {
        Ok(self.get_value::<Snapshot<R>>(key)?.map(|(snap, _)| snap))
    }

    pub fn put<R: DatasetRow>(&self, key: &str, snapshot: &Snapshot<R>) -> Result<()> {
        self.put_value(key, snapshot, snapshot.fetched_at)
    }

    /// Typed entry plus its stored `fetched_at`. Payloads that no longer
    /// decode are treated as absent.
    pub fn get_value<T: DeserializeOwned>(&self, key: &str) -> Result<Option<(T, i64)>> {
        let storage_key = self.storage_key(key);
        let Some(entry) = self
            .store
            .load(&storage_key)
            .with_context(|| format!("load cache entry {}", storage_key))?
        else {
            return Ok(None);
        };
        match serde_json::from_str::<T>(&entry.payload) {
            Ok(v) => Ok(Some((v, entry.fetched_at))),
            Err(e) => {
                warn!(key = %storage_key, error = %e, "discarding undecodable cache entry");
                Ok(None)
            }
        }
    }

    pub fn put_value<T: Serialize>(&self, key: &str, value: &T, fetched_at: i64) -> Result<()> {
        let storage_key = self.storage_key(key);
        let payload = serde_json::to_string(value).context("serialize cache entry")?;
        self.store
            .save(&storage_key, &payload, fetched_at)
            .with_context(|| format!("save cache entry {}", storage_key))
    }

    /// Raw serialized payload, for byte-level comparisons.
    pub fn raw(&self, key: &str) -> Result<Option<StoredEntry>> {
        self.store.load(&self.storage_key(key))
    }

    pub fn invalidate(&self, key: &str) -> Result<()> {
        self.store.remove(&self.storage_key(key))
    }

    /// Remove entries written under any other schema version.
    pub fn purge_stale_versions(&self) -> Result<usize> {
        let prefix = self.version_prefix();
        let mut removed = 0usize;
        for key in self.store.keys()? {
            if !key.starts_with(&prefix) {
                self.store.remove(&key)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn purge_older_than(&self, cutoff: i64) -> Result<usize> {
        self.store.purge_older_than(cutoff)
    }

    /// Dataset keys present under the current version.
    pub fn keys(&self) -> Result<Vec<String>> {
        let prefix = self.version_prefix();
        Ok(self
            .store
            .keys()?
            .into_iter()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }
}
