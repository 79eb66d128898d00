//! Read-only access to the remote table service.
//!
//! `RemoteSource` is the transport seam (PostgREST over HTTP in production,
//! in-process tables in tests); `RemoteFetcher` layers paging, `IN`-list
//! chunking and typed decoding on top of it.

pub mod fetcher;
pub mod memory;
pub mod supabase;

pub use fetcher::{FetchedPages, FetcherLimits, RemoteFetcher};
pub use memory::MemoryRemote;
pub use supabase::SupabaseClient;

use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Row filter, rendered as a PostgREST operator.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, String),
    In(String, Vec<String>),
    Gt(String, i64),
    Lte(String, i64),
}

impl Filter {
    pub fn eq(column: &str, value: impl Into<String>) -> Self {
        Self::Eq(column.to_string(), value.into())
    }

    pub fn gt(column: &str, value: i64) -> Self {
        Self::Gt(column.to_string(), value)
    }

    pub fn lte(column: &str, value: i64) -> Self {
        Self::Lte(column.to_string(), value)
    }

    pub fn column(&self) -> &str {
        match self {
            Filter::Eq(c, _) | Filter::In(c, _) | Filter::Gt(c, _) | Filter::Lte(c, _) => c,
        }
    }

    /// `(column, "op.value")` query pair.
    pub fn to_query_pair(&self) -> (String, String) {
        match self {
            Filter::Eq(c, v) => (c.clone(), format!("eq.{}", v)),
            Filter::Gt(c, v) => (c.clone(), format!("gt.{}", v)),
            Filter::Lte(c, v) => (c.clone(), format!("lte.{}", v)),
            Filter::In(c, values) => {
                let quoted: Vec<String> = values.iter().map(|v| quote_in_value(v)).collect();
                (c.clone(), format!("in.({})", quoted.join(",")))
            }
        }
    }
}

// PostgREST reserves `,` `(` `)` and `"` inside in-lists.
fn quote_in_value(v: &str) -> String {
    if v.chars().any(|c| matches!(c, ',' | '(' | ')' | '"' | ' ')) {
        format!("\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        v.to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

impl Order {
    pub fn asc(column: &str) -> Self {
        Self {
            column: column.to_string(),
            ascending: true,
        }
    }

    pub fn desc(column: &str) -> Self {
        Self {
            column: column.to_string(),
            ascending: false,
        }
    }

    pub fn to_query_value(&self) -> String {
        format!(
            "{}.{}",
            self.column,
            if self.ascending { "asc" } else { "desc" }
        )
    }
}

/// One bounded read: `limit` rows starting at `offset`.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeRequest {
    pub table: String,
    pub select: String,
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
    pub offset: usize,
    pub limit: usize,
}

impl RangeRequest {
    pub fn new(table: &str, select: &str) -> Self {
        Self {
            table: table.to_string(),
            select: select.to_string(),
            filters: Vec::new(),
            order: None,
            offset: 0,
            limit: 0,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order(mut self, order: Order) -> Self {
        self.order = Some(order);
        self
    }

    pub fn with_range(&self, offset: usize, limit: usize) -> Self {
        let mut req = self.clone();
        req.offset = offset;
        req.limit = limit;
        req
    }
}

#[async_trait::async_trait]
pub trait RemoteSource: Send + Sync {
    /// Read at most `req.limit` rows starting at `req.offset`.
    async fn fetch_range(&self, req: &RangeRequest) -> Result<Vec<Value>, FetchError>;

    /// Exact number of rows matching `filters`.
    async fn count(&self, table: &str, filters: &[Filter]) -> Result<u64, FetchError>;
}

#[derive(Debug, Clone)]
pub enum FetchErrorKind {
    /// Connection, timeout or body read failure.
    Transport,
    /// Non-success HTTP status.
    Status(u16),
    /// Response did not decode into the expected row shape.
    Decode,
}

/// A failed remote read. Cheap to clone so one failure can be handed to
/// every caller waiting on the same reconciliation.
#[derive(Debug, Clone)]
pub struct FetchError {
    pub table: String,
    pub kind: FetchErrorKind,
    source: Arc<anyhow::Error>,
}

impl FetchError {
    pub fn new(table: &str, kind: FetchErrorKind, source: anyhow::Error) -> Self {
        Self {
            table: table.to_string(),
            kind,
            source: Arc::new(source),
        }
    }

    pub fn transport(table: &str, source: impl Into<anyhow::Error>) -> Self {
        Self::new(table, FetchErrorKind::Transport, source.into())
    }

    pub fn status(table: &str, status: u16, body: &str) -> Self {
        Self::new(
            table,
            FetchErrorKind::Status(status),
            anyhow::anyhow!("HTTP {}: {}", status, body),
        )
    }

    pub fn decode(table: &str, source: impl Into<anyhow::Error>) -> Self {
        Self::new(table, FetchErrorKind::Decode, source.into())
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FetchErrorKind::Transport => {
                write!(f, "fetch {} failed: {}", self.table, self.source)
            }
            FetchErrorKind::Status(code) => {
                write!(f, "fetch {} returned {}: {}", self.table, code, self.source)
            }
            FetchErrorKind::Decode => {
                write!(f, "fetch {} returned undecodable rows: {}", self.table, self.source)
            }
        }
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let inner: &(dyn std::error::Error + Send + Sync + 'static) = (*self.source).as_ref();
        Some(inner)
    }
}
