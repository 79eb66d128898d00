//! Paged, chunked, typed reads over a `RemoteSource`.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{FetchError, Filter, RangeRequest, RemoteSource};

/// Service-imposed bounds the fetcher must respect.
#[derive(Debug, Clone, Copy)]
pub struct FetcherLimits {
    /// Rows per request; PostgREST caps responses at 1000 by default.
    pub page_size: usize,
    /// Page ceiling for a single `fetch_all`.
    pub max_pages: usize,
    /// Longest `in.(..)` list sent in one request.
    pub in_chunk_size: usize,
}

impl Default for FetcherLimits {
    fn default() -> Self {
        Self {
            page_size: 1000,
            max_pages: 500,
            in_chunk_size: 200,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPages<T> {
    pub rows: Vec<T>,
    pub pages: usize,
    /// The page ceiling stopped the read while pages were still full.
    pub truncated: bool,
}

#[derive(Clone)]
pub struct RemoteFetcher {
    source: Arc<dyn RemoteSource>,
    limits: FetcherLimits,
}

impl RemoteFetcher {
    pub fn new(source: Arc<dyn RemoteSource>, limits: FetcherLimits) -> Self {
        let limits = FetcherLimits {
            page_size: limits.page_size.max(1),
            max_pages: limits.max_pages.max(1),
            in_chunk_size: limits.in_chunk_size.max(1),
        };
        Self { source, limits }
    }

    pub fn limits(&self) -> FetcherLimits {
        self.limits
    }

    /// One bounded request, decoded into `T`.
    pub async fn fetch_range<T: DeserializeOwned>(
        &self,
        req: &RangeRequest,
    ) -> Result<Vec<T>, FetchError> {
        let raw = self.source.fetch_range(req).await?;
        decode_rows(&req.table, raw)
    }

    /// Page through `req` until a short page or the default page ceiling.
    pub async fn fetch_all<T: DeserializeOwned>(
        &self,
        req: &RangeRequest,
    ) -> Result<FetchedPages<T>, FetchError> {
        self.fetch_all_bounded(req, self.limits.max_pages).await
    }

    pub async fn fetch_all_bounded<T: DeserializeOwned>(
        &self,
        req: &RangeRequest,
        max_pages: usize,
    ) -> Result<FetchedPages<T>, FetchError> {
        let page_size = self.limits.page_size;
        let max_pages = max_pages.max(1);
        let mut rows: Vec<T> = Vec::new();
        let mut offset = req.offset;
        let mut pages = 0usize;

        loop {
            let page: Vec<T> = self.fetch_range(&req.with_range(offset, page_size)).await?;
            pages += 1;
            let count = page.len();
            rows.extend(page);

            if count < page_size {
                break;
            }
            if pages >= max_pages {
                warn!(
                    table = %req.table,
                    pages,
                    rows = rows.len(),
                    "page ceiling reached, read truncated"
                );
                return Ok(FetchedPages {
                    rows,
                    pages,
                    truncated: true,
                });
            }
            offset += page_size;
        }

        debug!(table = %req.table, pages, rows = rows.len(), "fetch_all complete");
        Ok(FetchedPages {
            rows,
            pages,
            truncated: false,
        })
    }

    /// Rows whose `column` is one of `values`, in chunks of at most
    /// `in_chunk_size` ids. Order across chunks is not preserved.
    pub async fn fetch_in<T: DeserializeOwned>(
        &self,
        req: &RangeRequest,
        column: &str,
        values: &[String],
    ) -> Result<Vec<T>, FetchError> {
        let mut out: Vec<T> = Vec::new();
        for chunk in values.chunks(self.limits.in_chunk_size) {
            let chunk_req = req
                .clone()
                .filter(Filter::In(column.to_string(), chunk.to_vec()));
            let fetched = self.fetch_all::<T>(&chunk_req).await?;
            out.extend(fetched.rows);
        }
        debug!(
            table = %req.table,
            ids = values.len(),
            rows = out.len(),
            "fetch_in complete"
        );
        Ok(out)
    }

    pub async fn count(&self, table: &str, filters: &[Filter]) -> Result<u64, FetchError> {
        self.source.count(table, filters).await
    }
}

fn decode_rows<T: DeserializeOwned>(table: &str, raw: Vec<Value>) -> Result<Vec<T>, FetchError> {
    raw.into_iter()
        .map(|v| serde_json::from_value::<T>(v).map_err(|e| FetchError::decode(table, e)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{MemoryRemote, Order};
    use serde_json::json;

    fn remote_with_ids(n: i64) -> Arc<MemoryRemote> {
        let remote = MemoryRemote::new();
        remote.insert_rows("t", (1..=n).map(|i| json!({ "id": i, "k": i % 3 })));
        Arc::new(remote)
    }

    fn fetcher(remote: Arc<MemoryRemote>, page_size: usize, max_pages: usize) -> RemoteFetcher {
        RemoteFetcher::new(
            remote,
            FetcherLimits {
                page_size,
                max_pages,
                in_chunk_size: 4,
            },
        )
    }

    #[derive(Debug, serde::Deserialize)]
    struct IdOnly {
        id: i64,
    }

    #[tokio::test]
    async fn test_fetch_all_stops_on_short_page() {
        let remote = remote_with_ids(25);
        let f = fetcher(remote.clone(), 10, 100);
        let req = RangeRequest::new("t", "id").order(Order::asc("id"));

        let got = f.fetch_all::<IdOnly>(&req).await.unwrap();
        assert_eq!(got.rows.len(), 25);
        assert_eq!(got.pages, 3);
        assert!(!got.truncated);
        assert_eq!(remote.range_requests(), 3);
        let ids: Vec<i64> = got.rows.iter().map(|r| r.id).collect();
        assert_eq!(ids, (1..=25).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_fetch_all_exact_multiple_needs_one_empty_page() {
        let remote = remote_with_ids(20);
        let f = fetcher(remote.clone(), 10, 100);
        let req = RangeRequest::new("t", "id").order(Order::asc("id"));

        let got = f.fetch_all::<IdOnly>(&req).await.unwrap();
        assert_eq!(got.rows.len(), 20);
        assert_eq!(remote.range_requests(), 3);
    }

    #[tokio::test]
    async fn test_fetch_all_respects_page_ceiling() {
        let remote = remote_with_ids(50);
        let f = fetcher(remote.clone(), 10, 2);
        let req = RangeRequest::new("t", "id").order(Order::asc("id"));

        let got = f.fetch_all::<IdOnly>(&req).await.unwrap();
        assert_eq!(got.rows.len(), 20);
        assert!(got.truncated);
        assert_eq!(remote.range_requests(), 2);
    }

    #[tokio::test]
    async fn test_fetch_in_chunks_large_id_sets() {
        let remote = remote_with_ids(30);
        let f = fetcher(remote.clone(), 10, 100);
        let ids: Vec<String> = (1..=10).map(|i| i.to_string()).collect();
        let req = RangeRequest::new("t", "id").order(Order::asc("id"));

        let mut got = f.fetch_in::<IdOnly>(&req, "id", &ids).await.unwrap();
        got.sort_by_key(|r| r.id);
        assert_eq!(got.len(), 10);
        // chunks of 4, 4, 2 -> three short pages
        assert_eq!(remote.range_requests(), 3);
        assert!(remote
            .requests()
            .iter()
            .all(|r| r.filters.iter().all(|f| match f {
                Filter::In(_, v) => v.len() <= 4,
                _ => true,
            })));
    }

    #[tokio::test]
    async fn test_fetch_in_with_no_ids_issues_no_requests() {
        let remote = remote_with_ids(5);
        let f = fetcher(remote.clone(), 10, 100);
        let req = RangeRequest::new("t", "id");
        let got = f.fetch_in::<IdOnly>(&req, "id", &[]).await.unwrap();
        assert!(got.is_empty());
        assert_eq!(remote.range_requests(), 0);
    }

    #[tokio::test]
    async fn test_transport_failure_is_not_retried() {
        let remote = remote_with_ids(5);
        remote.fail_next("t", 1);
        let f = fetcher(remote.clone(), 10, 100);
        let req = RangeRequest::new("t", "id");

        let err = f.fetch_all::<IdOnly>(&req).await.unwrap_err();
        assert_eq!(err.table, "t");
        assert_eq!(remote.range_requests(), 1);
    }

    #[tokio::test]
    async fn test_decode_failure_is_fetch_error() {
        let remote = MemoryRemote::new();
        remote.insert_rows("t", vec![json!({ "id": "not-a-number" })]);
        let f = fetcher(Arc::new(remote), 10, 100);
        let err = f
            .fetch_all::<IdOnly>(&RangeRequest::new("t", "id"))
            .await
            .unwrap_err();
        assert!(matches!(err.kind, crate::remote::FetchErrorKind::Decode));
    }
}
