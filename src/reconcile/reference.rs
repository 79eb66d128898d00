//! Reference table loader
//!
//! Characters, accounts, memberships and raid classifications are small and
//! have no monotonic id, so they are reloaded whole once their cached copy
//! outlives the TTL. A failed reload serves the stale copy when one exists.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{system_clock, Clock};
use crate::cache::{is_fresh, SnapshotCache};
use crate::models::ReferenceRow;
use crate::remote::{FetchError, Order, RangeRequest, RemoteFetcher};

#[derive(Clone)]
pub struct ReferenceLoader {
    fetcher: RemoteFetcher,
    cache: SnapshotCache,
    clock: Clock,
}

fn cache_key(table: &str) -> String {
    format!("ref:{}", table)
}

impl ReferenceLoader {
    pub fn new(fetcher: RemoteFetcher, cache: SnapshotCache) -> Self {
        Self::with_clock(fetcher, cache, system_clock())
    }

    pub fn with_clock(fetcher: RemoteFetcher, cache: SnapshotCache, clock: Clock) -> Self {
        Self {
            fetcher,
            cache,
            clock,
        }
    }

    /// All rows of `T::TABLE`, from cache when younger than `ttl`.
    pub async fn load<T: ReferenceRow>(&self, ttl: Duration) -> Result<Arc<Vec<T>>, FetchError> {
        self.load_inner(ttl, false).await
    }

    /// Reload from the remote regardless of cache age.
    pub async fn refresh<T: ReferenceRow>(&self) -> Result<Arc<Vec<T>>, FetchError> {
        self.load_inner(Duration::ZERO, true).await
    }

    async fn load_inner<T: ReferenceRow>(
        &self,
        ttl: Duration,
        force: bool,
    ) -> Result<Arc<Vec<T>>, FetchError> {
        let key = cache_key(T::TABLE);
        let now = (self.clock)();

        let mut stale_fallback: Option<Vec<T>> = None;
        match self.cache.get_value::<Vec<T>>(&key) {
            Ok(Some((rows, fetched_at))) => {
                if !force && is_fresh(fetched_at, ttl, now) {
                    debug!(table = T::TABLE, rows = rows.len(), "reference table from cache");
                    return Ok(Arc::new(rows));
                }
                stale_fallback = Some(rows);
            }
            Ok(None) => {}
            Err(e) => warn!(table = T::TABLE, error = %e, "reference cache read failed"),
        }

        let req = RangeRequest::new(T::TABLE, T::COLUMNS).order(Order::asc(T::KEY));
        match self.fetcher.fetch_all::<T>(&req).await {
            Ok(fetched) => {
                if let Err(e) = self.cache.put_value(&key, &fetched.rows, now) {
                    warn!(table = T::TABLE, error = %e, "reference cache write failed");
                }
                info!(table = T::TABLE, rows = fetched.rows.len(), "reference table loaded");
                Ok(Arc::new(fetched.rows))
            }
            Err(e) => match stale_fallback {
                Some(stale) => {
                    warn!(
                        "reference load failed for {} - serving stale cache: {}",
                        T::TABLE,
                        e
                    );
                    Ok(Arc::new(stale))
                }
                None => Err(e),
            },
        }
    }
}
