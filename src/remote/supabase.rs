//! Supabase PostgREST client
//!
//! Read-only: range reads with filters and ordering, plus exact counts.

use anyhow::{Context, Result};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

use super::{FetchError, Filter, RangeRequest, RemoteSource};

#[derive(Clone)]
pub struct SupabaseClient {
    client: Client,
    base_url: String,
}

impl SupabaseClient {
    pub fn new(project_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .default_headers({
                let mut headers = reqwest::header::HeaderMap::new();
                headers.insert(
                    "apikey",
                    api_key.parse().context("Invalid Supabase api key")?,
                );
                headers.insert(
                    reqwest::header::AUTHORIZATION,
                    format!("Bearer {}", api_key)
                        .parse()
                        .context("Invalid Supabase api key")?,
                );
                headers
            })
            .build()
            .context("Failed to build SupabaseClient")?;

        Ok(Self {
            client,
            base_url: format!("{}/rest/v1", project_url.trim_end_matches('/')),
        })
    }

    #[inline]
    fn url(&self, table: &str) -> String {
        format!("{}/{}", self.base_url, table)
    }

    fn range_query(req: &RangeRequest) -> Vec<(String, String)> {
        let mut qp: Vec<(String, String)> = Vec::with_capacity(req.filters.len() + 4);
        qp.push(("select".to_string(), req.select.clone()));
        for f in &req.filters {
            qp.push(f.to_query_pair());
        }
        if let Some(order) = &req.order {
            qp.push(("order".to_string(), order.to_query_value()));
        }
        qp.push(("offset".to_string(), req.offset.to_string()));
        qp.push(("limit".to_string(), req.limit.to_string()));
        qp
    }
}

#[async_trait::async_trait]
impl RemoteSource for SupabaseClient {
    async fn fetch_range(&self, req: &RangeRequest) -> Result<Vec<Value>, FetchError> {
        let resp = self
            .client
            .get(self.url(&req.table))
            .query(&Self::range_query(req))
            .send()
            .await
            .map_err(|e| FetchError::transport(&req.table, e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(FetchError::status(&req.table, status.as_u16(), &text));
        }

        resp.json::<Vec<Value>>()
            .await
            .map_err(|e| FetchError::decode(&req.table, e))
    }

    async fn count(&self, table: &str, filters: &[Filter]) -> Result<u64, FetchError> {
        let mut qp: Vec<(String, String)> = Vec::with_capacity(filters.len() + 2);
        qp.push(("select".to_string(), "*".to_string()));
        for f in filters {
            qp.push(f.to_query_pair());
        }
        qp.push(("limit".to_string(), "0".to_string()));

        let resp = self
            .client
            .get(self.url(table))
            .query(&qp)
            .header("Prefer", "count=exact")
            .send()
            .await
            .map_err(|e| FetchError::transport(table, e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(FetchError::status(table, status.as_u16(), &text));
        }

        let header = resp
            .headers()
            .get(reqwest::header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        header
            .as_deref()
            .and_then(parse_content_range_total)
            .ok_or_else(|| {
                FetchError::decode(
                    table,
                    anyhow::anyhow!("missing or unparsable Content-Range: {:?}", header),
                )
            })
    }
}

/// Total from a PostgREST `Content-Range` header (`0-24/3573`, `*/0`).
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse::<u64>().ok()
}
