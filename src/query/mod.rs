//! Chainable query surface. A [`QueryBuilder`] is obtained from
//! [`Client::table`](crate::Client::table), switched into a mode
//! (select / write / search), refined with filter calls, and finished with
//! [`execute`](QueryBuilder::execute) (or `execute_async` on the async
//! surface). Builders are self-consuming: every call appends to an
//! immutable predicate list and returns the builder, and compilation
//! happens once at the terminal call.

pub(crate) mod fusion;
pub(crate) mod planner;

use crate::batch;
use crate::client::ClientInner;
use crate::error::{Error, Result};
use crate::filter::{Filter, Predicate};
use crate::store::Row;
use serde_json::Value;
use std::sync::Arc;

/// Rows plus, for search modes, the parallel score list. Search rows also
/// carry their score inline under the `_score` key.
#[derive(Clone, Debug, Default)]
pub struct QueryResult {
    pub data: Vec<Row>,
    pub scores: Option<Vec<f64>>,
}

impl QueryResult {
    pub fn count(&self) -> usize {
        self.data.len()
    }
}

#[derive(Clone, Debug)]
pub(crate) enum Mode {
    Select {
        columns: Option<Vec<String>>,
    },
    Insert {
        rows: Vec<Row>,
    },
    Upsert {
        rows: Vec<Row>,
        on_conflict: Vec<String>,
        ignore_duplicates: bool,
    },
    Update {
        patch: Row,
    },
    Delete,
    VectorSearch {
        query: String,
        topk: usize,
        column: Option<String>,
    },
    KeywordSearch {
        query: String,
        topk: usize,
        column: Option<String>,
    },
    HybridSearch {
        query: String,
        topk: usize,
        alpha: f64,
        vector_column: Option<String>,
        keyword_column: Option<String>,
        rerank: bool,
    },
    /// A malformed builder call, surfaced at the terminal so misuse cannot
    /// cause side effects.
    Invalid(String),
}

pub struct QueryBuilder {
    pub(crate) client: Arc<ClientInner>,
    pub(crate) target: String,
    pub(crate) mode: Mode,
    pub(crate) filter: Filter,
}

fn parse_rows(rows: Value) -> std::result::Result<Vec<Row>, String> {
    match rows {
        Value::Object(row) => Ok(vec![row]),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(row) => Ok(row),
                other => Err(format!("expected a row object, got {other}")),
            })
            .collect(),
        other => Err(format!("expected a row object or an array, got {other}")),
    }
}

impl QueryBuilder {
    pub(crate) fn new(client: Arc<ClientInner>, target: String) -> Self {
        Self {
            client,
            target,
            mode: Mode::Select { columns: None },
            filter: Filter::default(),
        }
    }

    // Mode selection -----------------------------------------------------

    /// Project specific columns; the default is every column.
    pub fn select<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.mode = Mode::Select {
            columns: Some(columns.into_iter().map(Into::into).collect()),
        };
        self
    }

    /// Insert one row (an object) or several (an array of objects).
    pub fn insert(mut self, rows: Value) -> Self {
        self.mode = match parse_rows(rows) {
            Ok(rows) => Mode::Insert { rows },
            Err(reason) => Mode::Invalid(reason),
        };
        self
    }

    /// Insert-or-update on the named conflict column(s).
    pub fn upsert(self, rows: Value, on_conflict: &[&str]) -> Self {
        self.upsert_mode(rows, on_conflict, false)
    }

    /// Like [`upsert`](Self::upsert) but existing rows are left untouched.
    pub fn upsert_ignore(self, rows: Value, on_conflict: &[&str]) -> Self {
        self.upsert_mode(rows, on_conflict, true)
    }

    fn upsert_mode(mut self, rows: Value, on_conflict: &[&str], ignore_duplicates: bool) -> Self {
        self.mode = match parse_rows(rows) {
            Ok(rows) => Mode::Upsert {
                rows,
                on_conflict: on_conflict.iter().map(|s| s.to_string()).collect(),
                ignore_duplicates,
            },
            Err(reason) => Mode::Invalid(reason),
        };
        self
    }

    /// Update filtered rows with the given patch object.
    pub fn update(mut self, patch: Value) -> Self {
        self.mode = match patch {
            Value::Object(patch) => Mode::Update { patch },
            other => Mode::Invalid(format!("expected a patch object, got {other}")),
        };
        self
    }

    /// Delete filtered rows. Vector slots are tombstoned, not reclaimed.
    pub fn delete(mut self) -> Self {
        self.mode = Mode::Delete;
        self
    }

    /// Cosine similarity over the column's vector file, filtered candidates
    /// only. `column` defaults to the table's single vector column.
    pub fn vector_search(mut self, query: impl Into<String>, topk: usize) -> Self {
        self.mode = Mode::VectorSearch {
            query: query.into(),
            topk,
            column: None,
        };
        self
    }

    /// BM25 over the column's full-text index, filtered candidates only.
    pub fn keyword_search(mut self, query: impl Into<String>, topk: usize) -> Self {
        self.mode = Mode::KeywordSearch {
            query: query.into(),
            topk,
            column: None,
        };
        self
    }

    /// Weighted fusion of vector and keyword hits;
    /// `alpha` = 1.0 is all-vector, 0.0 all-keyword.
    pub fn hybrid_search(mut self, query: impl Into<String>, topk: usize, alpha: f64) -> Self {
        self.mode = if (0.0..=1.0).contains(&alpha) {
            Mode::HybridSearch {
                query: query.into(),
                topk,
                alpha,
                vector_column: None,
                keyword_column: None,
                rerank: false,
            }
        } else {
            Mode::Invalid(format!("alpha must be within [0, 1], got {alpha}"))
        };
        self
    }

    /// Name the column a search runs against (vector or keyword leg; for
    /// hybrid search this sets both).
    pub fn on_column(mut self, column: impl Into<String>) -> Self {
        let column = column.into();
        match &mut self.mode {
            Mode::VectorSearch { column: slot, .. } | Mode::KeywordSearch { column: slot, .. } => {
                *slot = Some(column);
            }
            Mode::HybridSearch {
                vector_column,
                keyword_column,
                ..
            } => {
                *vector_column = Some(column.clone());
                *keyword_column = Some(column);
            }
            _ => self.mode = Mode::Invalid("on_column() only applies to searches".to_string()),
        }
        self
    }

    /// Route the fused hybrid candidates through the embedder's reranker.
    pub fn rerank(mut self) -> Self {
        match &mut self.mode {
            Mode::HybridSearch { rerank, .. } => *rerank = true,
            _ => self.mode = Mode::Invalid("rerank() only applies to hybrid search".to_string()),
        }
        self
    }

    // Filter chain -------------------------------------------------------

    pub fn eq(mut self, column: impl Into<String>, value: Value) -> Self {
        self.filter.push(Predicate::Eq(column.into(), value));
        self
    }

    pub fn neq(mut self, column: impl Into<String>, value: Value) -> Self {
        self.filter.push(Predicate::Neq(column.into(), value));
        self
    }

    pub fn gt(mut self, column: impl Into<String>, value: Value) -> Self {
        self.filter.push(Predicate::Gt(column.into(), value));
        self
    }

    pub fn gte(mut self, column: impl Into<String>, value: Value) -> Self {
        self.filter.push(Predicate::Gte(column.into(), value));
        self
    }

    pub fn lt(mut self, column: impl Into<String>, value: Value) -> Self {
        self.filter.push(Predicate::Lt(column.into(), value));
        self
    }

    pub fn lte(mut self, column: impl Into<String>, value: Value) -> Self {
        self.filter.push(Predicate::Lte(column.into(), value));
        self
    }

    /// Inclusive on both sides; a null bound opens that side.
    pub fn between(mut self, column: impl Into<String>, lo: Value, hi: Value) -> Self {
        self.filter.push(Predicate::Between(column.into(), lo, hi));
        self
    }

    pub fn in_(mut self, column: impl Into<String>, values: Vec<Value>) -> Self {
        self.filter.push(Predicate::In(column.into(), values));
        self
    }

    pub fn not_in(mut self, column: impl Into<String>, values: Vec<Value>) -> Self {
        self.filter.push(Predicate::NotIn(column.into(), values));
        self
    }

    pub fn is_null(mut self, column: impl Into<String>) -> Self {
        self.filter.push(Predicate::IsNull(column.into()));
        self
    }

    pub fn is_not_null(mut self, column: impl Into<String>) -> Self {
        self.filter.push(Predicate::IsNotNull(column.into()));
        self
    }

    /// JSON containment: element membership on arrays, key existence on
    /// objects.
    pub fn contains(mut self, column: impl Into<String>, value: Value) -> Self {
        self.filter.push(Predicate::Contains(column.into(), value));
        self
    }

    /// Case-insensitive LIKE; a pattern without wildcards is wrapped in `%`.
    pub fn ilike(mut self, column: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.filter
            .push(Predicate::Ilike(column.into(), pattern.into()));
        self
    }

    /// Case-insensitive regular expression match.
    pub fn regex(mut self, column: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.filter
            .push(Predicate::Regex(column.into(), pattern.into()));
        self
    }

    pub fn order(mut self, column: impl Into<String>) -> Self {
        self.filter.order = Some((column.into(), false));
        self
    }

    pub fn order_desc(mut self, column: impl Into<String>) -> Self {
        self.filter.order = Some((column.into(), true));
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.filter.limit = Some(n);
        self
    }

    // Terminals ----------------------------------------------------------

    pub fn execute(self) -> Result<QueryResult> {
        self.client.check_cancelled()?;
        match &self.mode {
            Mode::Invalid(reason) => Err(Error::InvalidQuery(reason.clone())),
            Mode::Select { .. }
            | Mode::VectorSearch { .. }
            | Mode::KeywordSearch { .. }
            | Mode::HybridSearch { .. } => planner::execute_read(&self),
            Mode::Insert { .. } | Mode::Upsert { .. } | Mode::Update { .. } | Mode::Delete => {
                batch::execute_write(&self)
            }
        }
    }

    /// Row count without materializing the rows for plain selects; search
    /// modes count their executed hits.
    pub fn count(self) -> Result<usize> {
        self.client.check_cancelled()?;
        match &self.mode {
            Mode::Invalid(reason) => Err(Error::InvalidQuery(reason.clone())),
            Mode::Select { .. } => planner::execute_count(&self),
            Mode::VectorSearch { .. } | Mode::KeywordSearch { .. } | Mode::HybridSearch { .. } => {
                Ok(planner::execute_read(&self)?.data.len())
            }
            _ => Err(Error::InvalidQuery(
                "count() applies to selects and searches".to_string(),
            )),
        }
    }

    /// Terminal for the async surface; identical semantics to
    /// [`execute`](Self::execute), run on the blocking pool.
    pub async fn execute_async(self) -> Result<QueryResult> {
        tokio::task::spawn_blocking(move || self.execute())
            .await
            .map_err(|err| {
                Error::Io(std::io::Error::new(std::io::ErrorKind::Other, err))
            })?
    }

    /// Async twin of [`count`](Self::count).
    pub async fn count_async(self) -> Result<usize> {
        tokio::task::spawn_blocking(move || self.count())
            .await
            .map_err(|err| {
                Error::Io(std::io::Error::new(std::io::ErrorKind::Other, err))
            })?
    }
}
