//! Snapshot reconciliation
//!
//! Keeps each cached dataset in step with the remote tables. A reconcile
//! either reloads the whole table or fetches only rows above the cached
//! watermark, then writes the merged snapshot back. Concurrent calls for one
//! key share a single in-flight reconciliation, and every key has a `watch`
//! channel carrying its load status and latest snapshot.

pub mod reference;

pub use reference::ReferenceLoader;

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::cache::{Snapshot, SnapshotCache};
use crate::models::{Config, DatasetRow, GroupSummary};
use crate::remote::{FetchError, Filter, Order, RangeRequest, RemoteFetcher};

/// Epoch-seconds clock.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(|| chrono::Utc::now().timestamp())
}

/// A remote table (optionally filtered) cached under one key.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub key: String,
    pub table: String,
    pub select: String,
    pub filters: Vec<Filter>,
}

impl Dataset {
    pub fn of<R: DatasetRow>() -> Self {
        Self {
            key: R::TABLE.to_string(),
            table: R::TABLE.to_string(),
            select: R::COLUMNS.to_string(),
            filters: Vec::new(),
        }
    }

    /// Narrow the dataset; the filter becomes part of the cache key.
    pub fn with_filter(mut self, filter: Filter) -> Self {
        let (column, value) = filter.to_query_pair();
        self.key = format!("{}?{}={}", self.key, column, value);
        self.filters.push(filter);
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcilePolicy {
    /// First reconcile of a key in this process always reloads in full.
    pub full_reload_on_session_start: bool,
    /// Compare the remote row count after an incremental fetch.
    pub verify_row_count: bool,
    pub max_full_pages: usize,
    pub max_incremental_pages: usize,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            full_reload_on_session_start: true,
            verify_row_count: true,
            max_full_pages: 500,
            max_incremental_pages: 20,
        }
    }
}

impl ReconcilePolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            full_reload_on_session_start: config.full_reload_on_start,
            verify_row_count: config.verify_row_count,
            max_full_pages: config.max_full_pages,
            max_incremental_pages: config.max_incremental_pages,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ReconcileError {
    Fetch(FetchError),
    Store(String),
    /// The in-flight task ended without reporting a result.
    Aborted,
}

impl fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileError::Fetch(e) => write!(f, "{}", e),
            ReconcileError::Store(msg) => write!(f, "snapshot store failed: {}", msg),
            ReconcileError::Aborted => write!(f, "reconciliation aborted"),
        }
    }
}

impl std::error::Error for ReconcileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReconcileError::Fetch(e) => Some(e),
            _ => None,
        }
    }
}

impl From<FetchError> for ReconcileError {
    fn from(e: FetchError) -> Self {
        ReconcileError::Fetch(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadKind {
    Full,
    Incremental,
    /// Incremental fetch found nothing new; the cache was not written.
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct Reconciled<R> {
    pub snapshot: Arc<Snapshot<R>>,
    pub kind: LoadKind,
    pub new_rows: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadStatus {
    Idle,
    Loading,
    Ready,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct DatasetState<R> {
    pub status: LoadStatus,
    pub snapshot: Option<Arc<Snapshot<R>>>,
}

impl<R> Default for DatasetState<R> {
    fn default() -> Self {
        Self {
            status: LoadStatus::Idle,
            snapshot: None,
        }
    }
}

type Outcome<R> = Result<Reconciled<R>, ReconcileError>;

struct Inner<R: DatasetRow> {
    fetcher: RemoteFetcher,
    cache: SnapshotCache,
    policy: ReconcilePolicy,
    clock: Clock,
    in_flight: Mutex<HashMap<String, broadcast::Sender<Outcome<R>>>>,
    loaded_this_session: Mutex<HashSet<String>>,
    states: Mutex<HashMap<String, watch::Sender<DatasetState<R>>>>,
}

/// Reconciles datasets of one row type.
pub struct Reconciler<R: DatasetRow> {
    inner: Arc<Inner<R>>,
}

impl<R: DatasetRow> Clone for Reconciler<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R: DatasetRow> Reconciler<R> {
    pub fn new(fetcher: RemoteFetcher, cache: SnapshotCache, policy: ReconcilePolicy) -> Self {
        Self::with_clock(fetcher, cache, policy, system_clock())
    }

    pub fn with_clock(
        fetcher: RemoteFetcher,
        cache: SnapshotCache,
        policy: ReconcilePolicy,
        clock: Clock,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                fetcher,
                cache,
                policy,
                clock,
                in_flight: Mutex::new(HashMap::new()),
                loaded_this_session: Mutex::new(HashSet::new()),
                states: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Bring `dataset` up to date and return the resulting snapshot.
    ///
    /// Joins an already running reconciliation for the same key instead of
    /// starting another. The work runs on its own task, so dropping the
    /// returned future does not cancel it.
    pub async fn reconcile(&self, dataset: &Dataset, ttl: Duration) -> Outcome<R> {
        let mut rx = {
            let mut in_flight = self.inner.in_flight.lock();
            if let Some(tx) = in_flight.get(&dataset.key) {
                debug!(key = %dataset.key, "joining in-flight reconciliation");
                tx.subscribe()
            } else {
                let (tx, rx) = broadcast::channel(1);
                in_flight.insert(dataset.key.clone(), tx);
                let slot = InFlightSlot {
                    inner: self.inner.clone(),
                    key: dataset.key.clone(),
                    finished: false,
                };
                let dataset = dataset.clone();
                tokio::spawn(async move {
                    let outcome = slot.inner.run(&dataset, ttl).await;
                    slot.finish(outcome);
                });
                rx
            }
        };

        rx.recv().await.unwrap_or(Err(ReconcileError::Aborted))
    }

    /// Status channel for `key`. The receiver sees the current state
    /// immediately and every change after it.
    pub fn subscribe(&self, key: &str) -> watch::Receiver<DatasetState<R>> {
        self.inner.with_state(key, |tx| tx.subscribe())
    }

    /// Latest snapshot for `key`: the last published one, else the cache.
    pub fn cached(&self, key: &str) -> Option<Arc<Snapshot<R>>> {
        if let Some(snap) = self.inner.with_state(key, |tx| tx.borrow().snapshot.clone()) {
            return Some(snap);
        }
        self.inner.read_cache(key).map(Arc::new)
    }

    pub fn cache(&self) -> &SnapshotCache {
        &self.inner.cache
    }
}

/// Owns a key's in-flight entry. Dropping it without `finish` (a panicking
/// task) removes the entry, which closes the channel for every waiter.
struct InFlightSlot<R: DatasetRow> {
    inner: Arc<Inner<R>>,
    key: String,
    finished: bool,
}

impl<R: DatasetRow> InFlightSlot<R> {
    fn finish(mut self, outcome: Outcome<R>) {
        self.finished = true;
        // Removal and subscription share the lock, so every joined waiter
        // holds a receiver by the time the result is sent.
        let tx = self.inner.in_flight.lock().remove(&self.key);
        if let Some(tx) = tx {
            let _ = tx.send(outcome);
        }
    }
}

impl<R: DatasetRow> Drop for InFlightSlot<R> {
    fn drop(&mut self) {
        if !self.finished {
            self.inner.in_flight.lock().remove(&self.key);
        }
    }
}

impl<R: DatasetRow> Inner<R> {
    fn now(&self) -> i64 {
        (self.clock)()
    }

    fn with_state<T>(&self, key: &str, f: impl FnOnce(&watch::Sender<DatasetState<R>>) -> T) -> T {
        let mut states = self.states.lock();
        let tx = states
            .entry(key.to_string())
            .or_insert_with(|| watch::channel(DatasetState::default()).0);
        f(tx)
    }

    fn publish(&self, key: &str, status: LoadStatus, snapshot: Option<Arc<Snapshot<R>>>) {
        self.with_state(key, |tx| {
            tx.send_replace(DatasetState { status, snapshot });
        });
    }

    fn read_cache(&self, key: &str) -> Option<Snapshot<R>> {
        match self.cache.get::<R>(key) {
            Ok(snap) => snap,
            Err(e) => {
                warn!(key = %key, error = %e, "snapshot cache read failed");
                None
            }
        }
    }

    async fn run(&self, dataset: &Dataset, ttl: Duration) -> Outcome<R> {
        let key = dataset.key.as_str();
        let now = self.now();
        let cached = self.read_cache(key).map(Arc::new);

        // Show whatever we have while loading, stale or not.
        self.publish(key, LoadStatus::Loading, cached.clone());

        let session_reload = self.policy.full_reload_on_session_start
            && !self.loaded_this_session.lock().contains(key);

        let outcome = match &cached {
            None => {
                info!(key = %key, "no cached snapshot, full load");
                self.full_load(dataset, now).await
            }
            Some(snap) if !snap.is_fresh(ttl, now) => {
                info!(
                    key = %key,
                    age_secs = now - snap.fetched_at,
                    ttl_secs = ttl.as_secs(),
                    "cached snapshot stale, full load"
                );
                self.full_load(dataset, now).await
            }
            Some(_) if session_reload => {
                info!(key = %key, "first load this session, full load");
                self.full_load(dataset, now).await
            }
            Some(snap) => self.incremental_load(dataset, snap, now).await,
        };

        match &outcome {
            Ok(done) => {
                self.publish(key, LoadStatus::Ready, Some(done.snapshot.clone()));
            }
            Err(e) => {
                warn!(key = %key, error = %e, "reconciliation failed, keeping prior snapshot");
                self.publish(key, LoadStatus::Failed(e.to_string()), cached);
            }
        }
        outcome
    }

    fn base_request(&self, dataset: &Dataset) -> RangeRequest {
        let mut req = RangeRequest::new(&dataset.table, &dataset.select).order(Order::asc("id"));
        for f in &dataset.filters {
            req = req.filter(f.clone());
        }
        req
    }

    async fn full_load(&self, dataset: &Dataset, now: i64) -> Outcome<R> {
        let req = self.base_request(dataset);
        let fetched = self
            .fetcher
            .fetch_all_bounded::<R>(&req, self.policy.max_full_pages)
            .await?;
        if fetched.truncated {
            warn!(
                key = %dataset.key,
                rows = fetched.rows.len(),
                "full load truncated at page ceiling, remainder follows incrementally"
            );
        }

        let mut seen = HashSet::new();
        let parent_ids: Vec<i64> = fetched
            .rows
            .iter()
            .filter_map(|r| r.parent_id())
            .filter(|id| seen.insert(*id))
            .collect();
        let groups = self.fetch_groups(&dataset.key, &parent_ids).await?;

        let snapshot = Snapshot::from_full_load(&dataset.key, fetched.rows, groups, now);
        self.store(&snapshot)?;
        self.loaded_this_session.lock().insert(dataset.key.clone());

        info!(
            key = %dataset.key,
            rows = snapshot.len(),
            groups = snapshot.groups.len(),
            watermark = snapshot.watermark,
            "full load complete"
        );
        let new_rows = snapshot.len();
        Ok(Reconciled {
            snapshot: Arc::new(snapshot),
            kind: LoadKind::Full,
            new_rows,
        })
    }

    async fn incremental_load(
        &self,
        dataset: &Dataset,
        cached: &Arc<Snapshot<R>>,
        now: i64,
    ) -> Outcome<R> {
        let req = self
            .base_request(dataset)
            .filter(Filter::gt("id", cached.watermark));
        let fetched = self
            .fetcher
            .fetch_all_bounded::<R>(&req, self.policy.max_incremental_pages)
            .await?;

        if self.policy.verify_row_count && !fetched.truncated {
            let new_watermark = fetched
                .rows
                .iter()
                .map(|r| r.row_id())
                .max()
                .unwrap_or(cached.watermark)
                .max(cached.watermark);
            let mut filters = dataset.filters.clone();
            filters.push(Filter::lte("id", new_watermark));
            let remote = self.fetcher.count(&dataset.table, &filters).await?;
            let expected = (cached.len() + fetched.rows.len()) as u64;
            if remote != expected {
                warn!(
                    key = %dataset.key,
                    remote,
                    expected,
                    "row count mismatch, rows deleted or renumbered; reloading in full"
                );
                return self.full_load(dataset, now).await;
            }
        }

        if fetched.rows.is_empty() {
            debug!(key = %dataset.key, watermark = cached.watermark, "no new rows");
            return Ok(Reconciled {
                snapshot: cached.clone(),
                kind: LoadKind::Unchanged,
                new_rows: 0,
            });
        }

        // groups missing at an earlier load are retried along with the new ones
        let missing = cached.missing_group_ids(cached.rows.iter().chain(&fetched.rows));
        let groups = self.fetch_groups(&dataset.key, &missing).await?;

        let new_rows = fetched.rows.len();
        let merged = cached.merge_incremental(fetched.rows, groups);
        self.store(&merged)?;

        info!(
            key = %dataset.key,
            new_rows,
            watermark = merged.watermark,
            "incremental load complete"
        );
        Ok(Reconciled {
            snapshot: Arc::new(merged),
            kind: LoadKind::Incremental,
            new_rows,
        })
    }

    async fn fetch_groups(
        &self,
        key: &str,
        group_ids: &[i64],
    ) -> Result<Vec<GroupSummary>, FetchError> {
        if group_ids.is_empty() {
            return Ok(Vec::new());
        }
        let req = RangeRequest::new(GroupSummary::TABLE, GroupSummary::COLUMNS)
            .order(Order::asc(GroupSummary::KEY_COLUMN));
        let values: Vec<String> = group_ids.iter().map(|id| id.to_string()).collect();
        let groups: Vec<GroupSummary> = self
            .fetcher
            .fetch_in(&req, GroupSummary::KEY_COLUMN, &values)
            .await?;
        if groups.len() < group_ids.len() {
            debug!(
                key = %key,
                requested = group_ids.len(),
                found = groups.len(),
                "some referenced groups are missing remotely"
            );
        }
        Ok(groups)
    }

    fn store(&self, snapshot: &Snapshot<R>) -> Result<(), ReconcileError> {
        self.cache
            .put(&snapshot.dataset_key, snapshot)
            .map_err(|e| ReconcileError::Store(format!("{:#}", e)))
    }
}
