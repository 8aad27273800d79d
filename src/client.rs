//! Client handles. All state hangs off one `Arc<ClientInner>`: the
//! relational store, the vector files, the optional embedder and the batch
//! scope. [`Client`] is the blocking surface; [`AsyncClient`] exposes the
//! same semantics with terminals that hop onto the blocking pool.

use crate::batch::{self, BatchState};
use crate::config::ClientOptions;
use crate::embedder::Embedder;
use crate::error::{Error, Result};
use crate::query::QueryBuilder;
use crate::schema::Schema;
use crate::store::RelStore;
use crate::vector::VectorStore;
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub(crate) struct ClientInner {
    pub schema: Schema,
    pub rel: RelStore,
    pub vectors: VectorStore,
    pub options: ClientOptions,
    pub embedder: RwLock<Option<Arc<dyn Embedder>>>,
    pub batch: Mutex<Option<BatchState>>,
    pub cancel: CancellationToken,
    #[allow(dead_code)]
    pub dir: PathBuf,
}

impl ClientInner {
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn require_embedder(&self) -> Result<Arc<dyn Embedder>> {
        self.embedder.read().clone().ok_or(Error::Embedder {
            message: "no embedder configured".to_string(),
            retryable: false,
        })
    }
}

/// Blocking handle to one database directory.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Initialize a fresh database directory for the schema.
    pub fn create(schema: Schema, path: impl AsRef<Path>) -> Result<Self> {
        Self::create_with(schema, path, ClientOptions::default())
    }

    pub fn create_with(
        schema: Schema,
        path: impl AsRef<Path>,
        options: ClientOptions,
    ) -> Result<Self> {
        let dir = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let rel = RelStore::create(&dir, &schema, &options)?;
        let vectors = VectorStore::create(&dir, &schema)?;
        Ok(Self::assemble(schema, rel, vectors, options, dir))
    }

    /// Open an existing directory; validates the stored schema fingerprint
    /// and reconciles vector files against the row set before returning.
    pub fn open(schema: Schema, path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(schema, path, ClientOptions::default())
    }

    pub fn open_with(
        schema: Schema,
        path: impl AsRef<Path>,
        options: ClientOptions,
    ) -> Result<Self> {
        let dir = path.as_ref().to_path_buf();
        let rel = RelStore::open(&dir, &schema, &options)?;
        let vectors = VectorStore::open(&dir, &schema)?;
        vectors.reconcile(&rel, &schema)?;
        Ok(Self::assemble(schema, rel, vectors, options, dir))
    }

    fn assemble(
        schema: Schema,
        rel: RelStore,
        vectors: VectorStore,
        options: ClientOptions,
        dir: PathBuf,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                schema,
                rel,
                vectors,
                options,
                embedder: RwLock::new(None),
                batch: Mutex::new(None),
                cancel: CancellationToken::new(),
                dir,
            }),
        }
    }

    pub fn set_embedder(&self, embedder: Arc<dyn Embedder>) {
        *self.inner.embedder.write() = Some(embedder);
    }

    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    /// Entry point of the chainable query surface.
    pub fn table(&self, name: impl Into<String>) -> QueryBuilder {
        QueryBuilder::new(self.inner.clone(), name.into())
    }

    /// Gather every insert in `f` into one atomic scope: rows, embeddings
    /// and vector appends become visible as a single event, or not at all.
    pub fn batch_embeddings<T>(&self, f: impl FnOnce(&Client) -> Result<T>) -> Result<T> {
        batch::with_scope(&self.inner, true, || f(self))
    }

    /// Non-atomic variant: rows commit one by one and failed embeddings are
    /// parked in the outbox instead of failing the scope.
    pub fn batch_embeddings_non_atomic<T>(
        &self,
        f: impl FnOnce(&Client) -> Result<T>,
    ) -> Result<T> {
        batch::with_scope(&self.inner, false, || f(self))
    }

    /// Re-embed rows parked in a column's outbox. Returns how many vectors
    /// were recovered; a no-op on an empty outbox.
    pub fn retry_outbox(&self, table: &str, column: &str) -> Result<usize> {
        self.inner.check_cancelled()?;
        batch::retry_outbox(&self.inner, table, column)
    }

    /// Rewrite a vector column's files densely, dropping tombstoned and
    /// superseded slots.
    pub fn compact(&self, table: &str, column: &str) -> Result<()> {
        self.inner.check_cancelled()?;
        self.inner.vectors.file(table, column)?.compact()
    }

    /// Token observed at every suspension point; cancelling it makes
    /// in-flight operations fail with [`Error::Cancelled`].
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn close(self) {}
}

/// Async surface over the same storage; terminal operations run on the
/// blocking pool via `spawn_blocking`.
#[derive(Clone)]
pub struct AsyncClient {
    client: Client,
}

impl AsyncClient {
    pub async fn create(schema: Schema, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let client = spawn(move || Client::create(schema, path)).await?;
        Ok(Self { client })
    }

    pub async fn open(schema: Schema, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let client = spawn(move || Client::open(schema, path)).await?;
        Ok(Self { client })
    }

    pub fn set_embedder(&self, embedder: Arc<dyn Embedder>) {
        self.client.set_embedder(embedder);
    }

    /// Builders chain exactly as on [`Client`]; finish with
    /// [`execute_async`](QueryBuilder::execute_async).
    pub fn table(&self, name: impl Into<String>) -> QueryBuilder {
        self.client.table(name)
    }

    pub async fn batch_embeddings<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Client) -> Result<T> + Send + 'static,
    {
        let client = self.client.clone();
        spawn(move || client.batch_embeddings(f)).await
    }

    pub async fn retry_outbox(&self, table: &str, column: &str) -> Result<usize> {
        let client = self.client.clone();
        let (table, column) = (table.to_string(), column.to_string());
        spawn(move || client.retry_outbox(&table, &column)).await
    }

    pub async fn compact(&self, table: &str, column: &str) -> Result<()> {
        let client = self.client.clone();
        let (table, column) = (table.to_string(), column.to_string());
        spawn(move || client.compact(&table, &column)).await
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.client.cancellation_token()
    }

    /// The underlying blocking client, usable from `spawn_blocking` code.
    pub fn blocking(&self) -> &Client {
        &self.client
    }

    pub fn close(self) {}
}

async fn spawn<T: Send + 'static>(f: impl FnOnce() -> Result<T> + Send + 'static) -> Result<T> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))?
}
