//! In-process table service with PostgREST filter semantics.
//!
//! Backs the unit and integration tests, and lets embedders run the ledger
//! against fixture data. Records every request so callers can assert on
//! exactly how much remote traffic an operation caused.

use parking_lot::Mutex;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::time::Duration;

use super::{FetchError, Filter, RangeRequest, RemoteSource};

#[derive(Default)]
pub struct MemoryRemote {
    tables: Mutex<HashMap<String, Vec<Value>>>,
    failures: Mutex<HashMap<String, usize>>,
    requests: Mutex<Vec<RangeRequest>>,
    range_calls: AtomicUsize,
    count_calls: AtomicUsize,
    latency: Mutex<Option<Duration>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_rows(&self, table: &str, rows: impl IntoIterator<Item = Value>) {
        self.tables
            .lock()
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    /// Remove rows whose `column` equals `value`.
    pub fn delete_where(&self, table: &str, column: &str, value: &str) {
        if let Some(rows) = self.tables.lock().get_mut(table) {
            rows.retain(|r| r.get(column).map(value_text).as_deref() != Some(value));
        }
    }

    /// Fail the next `n` requests against `table`.
    pub fn fail_next(&self, table: &str, n: usize) {
        self.failures.lock().insert(table.to_string(), n);
    }

    /// Delay every request, so concurrent callers overlap.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    pub fn range_requests(&self) -> usize {
        self.range_calls.load(AtomicOrdering::SeqCst)
    }

    pub fn count_requests(&self) -> usize {
        self.count_calls.load(AtomicOrdering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RangeRequest> {
        self.requests.lock().clone()
    }

    pub fn requests_for(&self, table: &str) -> Vec<RangeRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.table == table)
            .cloned()
            .collect()
    }

    pub fn reset_counters(&self) {
        self.range_calls.store(0, AtomicOrdering::SeqCst);
        self.count_calls.store(0, AtomicOrdering::SeqCst);
        self.requests.lock().clear();
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock();
        if let Some(d) = latency {
            tokio::time::sleep(d).await;
        }
    }

    fn take_failure(&self, table: &str) -> Option<FetchError> {
        let mut failures = self.failures.lock();
        let remaining = failures.get_mut(table)?;
        if *remaining == 0 {
            return None;
        }
        *remaining -= 1;
        Some(FetchError::transport(
            table,
            anyhow::anyhow!("injected failure"),
        ))
    }

    fn matching(&self, table: &str, filters: &[Filter]) -> Vec<Value> {
        let tables = self.tables.lock();
        tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| filters.iter().all(|f| matches_filter(row, f)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl RemoteSource for MemoryRemote {
    async fn fetch_range(&self, req: &RangeRequest) -> Result<Vec<Value>, FetchError> {
        self.range_calls.fetch_add(1, AtomicOrdering::SeqCst);
        self.requests.lock().push(req.clone());
        self.simulate_latency().await;

        if let Some(err) = self.take_failure(&req.table) {
            return Err(err);
        }

        let mut rows = self.matching(&req.table, &req.filters);
        if let Some(order) = &req.order {
            rows.sort_by(|a, b| {
                let ord = compare_values(a.get(&order.column), b.get(&order.column));
                if order.ascending {
                    ord
                } else {
                    ord.reverse()
                }
            });
        }

        Ok(rows.into_iter().skip(req.offset).take(req.limit).collect())
    }

    async fn count(&self, table: &str, filters: &[Filter]) -> Result<u64, FetchError> {
        self.count_calls.fetch_add(1, AtomicOrdering::SeqCst);
        self.simulate_latency().await;
        if let Some(err) = self.take_failure(table) {
            return Err(err);
        }
        Ok(self.matching(table, filters).len() as u64)
    }
}

fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn matches_filter(row: &Value, filter: &Filter) -> bool {
    let Some(field) = row.get(filter.column()) else {
        return false;
    };
    match filter {
        Filter::Eq(_, v) => value_text(field) == *v,
        Filter::In(_, values) => {
            let text = value_text(field);
            values.iter().any(|v| *v == text)
        }
        Filter::Gt(_, n) => field.as_f64().map(|x| x > *n as f64).unwrap_or(false),
        Filter::Lte(_, n) => field.as_f64().map(|x| x <= *n as f64).unwrap_or(false),
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .unwrap_or(0.0)
            .partial_cmp(&y.as_f64().unwrap_or(0.0))
            .unwrap_or(Ordering::Equal),
        (Some(x), Some(y)) => value_text(x).cmp(&value_text(y)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
