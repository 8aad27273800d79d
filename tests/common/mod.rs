#![allow(dead_code)]

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use veclite::{ColumnDef, Embedder, Error, Result, Schema, TableDef, VectorSpec};

/// Embedder returning canned vectors, with switchable failures and a
/// scripted rerank order.
pub struct MockEmbedder {
    dimension: usize,
    mocks: Mutex<HashMap<String, Vec<f32>>>,
    failing: Mutex<HashSet<String>>,
    rerank_order: Mutex<Option<Vec<usize>>>,
}

impl MockEmbedder {
    pub fn new(dimension: usize) -> Arc<Self> {
        Arc::new(Self {
            dimension,
            mocks: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            rerank_order: Mutex::new(None),
        })
    }

    pub fn add_mock(&self, text: &str, vector: Vec<f32>) {
        assert_eq!(vector.len(), self.dimension, "mock vector dimension");
        self.mocks.lock().insert(text.to_string(), vector);
    }

    pub fn fail_on(&self, text: &str) {
        self.failing.lock().insert(text.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing.lock().clear();
    }

    pub fn script_rerank(&self, order: Vec<usize>) {
        *self.rerank_order.lock() = Some(order);
    }
}

impl Embedder for MockEmbedder {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let failing = self.failing.lock();
        let mocks = self.mocks.lock();
        texts
            .iter()
            .map(|text| {
                if failing.contains(text) {
                    return Err(Error::Embedder {
                        message: format!("mock embed failure for {text:?}"),
                        retryable: true,
                    });
                }
                Ok(mocks
                    .get(text)
                    .cloned()
                    .unwrap_or_else(|| vec![0.0; self.dimension]))
            })
            .collect()
    }

    fn rerank(&self, _query: &str, documents: &[String], top_k: usize) -> Result<Vec<usize>> {
        match self.rerank_order.lock().clone() {
            Some(order) => Ok(order
                .into_iter()
                .filter(|i| *i < documents.len())
                .take(top_k)
                .collect()),
            None => Ok((0..documents.len().min(top_k)).collect()),
        }
    }
}

pub fn make_vector(dim: usize, values: &[f32]) -> Vec<f32> {
    let mut vector = vec![0.0; dim];
    for (slot, value) in vector.iter_mut().zip(values) {
        *slot = *value;
    }
    vector
}

/// Deterministic random unit vector.
pub fn make_random_vector(dim: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut vector: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut vector {
            *value /= norm;
        }
    }
    vector
}

/// `users(id, name, email unique, age?)`
pub fn user_schema() -> Schema {
    Schema::new()
        .table(
            TableDef::new("users")
                .column(ColumnDef::integer("id").primary_key())
                .column(ColumnDef::text("name"))
                .column(ColumnDef::text("email").unique())
                .column(ColumnDef::integer("age").nullable()),
        )
        .unwrap()
}

/// `articles(id, title, content fts, category?, views, year?)`
pub fn article_schema() -> Schema {
    Schema::new()
        .table(
            TableDef::new("articles")
                .column(ColumnDef::integer("id").primary_key())
                .column(ColumnDef::text("title"))
                .column(ColumnDef::text("content").fts())
                .column(ColumnDef::text("category").nullable())
                .column(
                    ColumnDef::integer("views").default_value(serde_json::json!(0)),
                )
                .column(ColumnDef::integer("year").nullable().indexed()),
        )
        .unwrap()
}

/// `documents(id, title, content vector+fts, category?)`
pub fn document_schema(dim: usize) -> Schema {
    Schema::new()
        .table(
            TableDef::new("documents")
                .column(ColumnDef::integer("id").primary_key())
                .column(ColumnDef::text("title"))
                .column(
                    ColumnDef::text("content")
                        .vector(VectorSpec::mock(dim))
                        .fts(),
                )
                .column(ColumnDef::text("category").nullable()),
        )
        .unwrap()
}

/// `products(id, name, price, in_stock, metadata json?)`
pub fn product_schema() -> Schema {
    Schema::new()
        .table(
            TableDef::new("products")
                .column(ColumnDef::integer("id").primary_key())
                .column(ColumnDef::text("name"))
                .column(ColumnDef::real("price"))
                .column(
                    ColumnDef::boolean("in_stock").default_value(serde_json::json!(true)),
                )
                .column(ColumnDef::json("metadata").nullable()),
        )
        .unwrap()
}

pub fn ids_of(result: &veclite::QueryResult) -> Vec<i64> {
    result
        .data
        .iter()
        .map(|row| row["id"].as_i64().unwrap())
        .collect()
}
