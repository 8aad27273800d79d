//! Local-first embedded retrieval engine.
//!
//! One directory on disk holds a SQLite database plus one append-only
//! vector file set per vector-enabled column. Tables and views are
//! declared up front; rows are retrieved by chainable filters, cosine
//! similarity over exact vector scans, BM25 keyword ranking through
//! SQLite's FTS5, or a weighted fusion of both legs.
//!
//! ```no_run
//! use std::sync::Arc;
//! use veclite::{Client, ColumnDef, Schema, TableDef, VectorSpec};
//! # use veclite::Result;
//! # fn embedder() -> Arc<dyn veclite::Embedder> { unimplemented!() }
//!
//! # fn main() -> Result<()> {
//! let schema = Schema::new().table(
//!     TableDef::new("documents")
//!         .column(ColumnDef::integer("id").primary_key())
//!         .column(ColumnDef::text("title"))
//!         .column(ColumnDef::text("content").vector(VectorSpec::new("voyage-3", 1024)).fts()),
//! )?;
//! let client = Client::create(schema, "./my.db")?;
//! client.set_embedder(embedder());
//!
//! client
//!     .table("documents")
//!     .insert(serde_json::json!({"title": "Intro", "content": "hello world"}))
//!     .execute()?;
//! let hits = client
//!     .table("documents")
//!     .hybrid_search("greeting", 5, 0.7)
//!     .execute()?;
//! # let _ = hits;
//! # Ok(())
//! # }
//! ```

mod batch;
mod client;
mod config;
mod embedder;
mod error;
mod filter;
mod query;
mod schema;
mod store;
mod vector;

pub use client::{AsyncClient, Client};
pub use config::ClientOptions;
pub use embedder::Embedder;
pub use error::{Error, Remedy, Result, SchemaError, ViewError};
pub use query::{QueryBuilder, QueryResult};
pub use schema::{ColumnDef, ColumnType, Schema, TableDef, VectorSpec, ViewDef, ViewField};

/// A row as it crosses the public surface: column name to JSON value.
pub type Row = serde_json::Map<String, serde_json::Value>;
