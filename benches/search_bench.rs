use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use veclite::{Client, ColumnDef, Embedder, Result, Schema, TableDef, VectorSpec};

const DIM: usize = 64;

struct HashEmbedder {
    cache: Mutex<HashMap<String, Vec<f32>>>,
}

impl HashEmbedder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            cache: Mutex::new(HashMap::new()),
        })
    }

    fn vector_for(text: &str) -> Vec<f32> {
        // Deterministic pseudo-embedding from a rolling hash.
        let mut state = 0x9E37_79B9u32;
        for byte in text.bytes() {
            state = state.wrapping_mul(31).wrapping_add(byte as u32);
        }
        let mut vector = Vec::with_capacity(DIM);
        for i in 0..DIM {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223 + i as u32);
            vector.push((state as f32 / u32::MAX as f32) * 2.0 - 1.0);
        }
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        vector.iter().map(|x| x / norm).collect()
    }
}

impl Embedder for HashEmbedder {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut cache = self.cache.lock();
        Ok(texts
            .iter()
            .map(|t| {
                cache
                    .entry(t.clone())
                    .or_insert_with(|| Self::vector_for(t))
                    .clone()
            })
            .collect())
    }
}

fn schema() -> Schema {
    Schema::new()
        .table(
            TableDef::new("documents")
                .column(ColumnDef::integer("id").primary_key())
                .column(ColumnDef::text("title"))
                .column(
                    ColumnDef::text("content")
                        .vector(VectorSpec::new("hash", DIM))
                        .fts(),
                ),
        )
        .unwrap()
}

fn seeded_client(dir: &tempfile::TempDir, rows: usize) -> Client {
    let client = Client::create(schema(), dir.path().join("bench.db")).unwrap();
    client.set_embedder(HashEmbedder::new());
    client
        .batch_embeddings(|c| {
            for chunk_start in (0..rows).step_by(256) {
                let batch: Vec<serde_json::Value> = (chunk_start..(chunk_start + 256).min(rows))
                    .map(|i| {
                        json!({
                            "title": format!("Document {i}"),
                            "content": format!("entry {i} about topic {}", i % 17),
                        })
                    })
                    .collect();
                c.table("documents")
                    .insert(serde_json::Value::Array(batch))
                    .execute()?;
            }
            Ok(())
        })
        .unwrap();
    client
}

fn bench_search(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let client = seeded_client(&dir, 2_048);

    let mut group = c.benchmark_group("search");
    group.bench_function("vector_topk10", |b| {
        b.iter(|| {
            client
                .table("documents")
                .vector_search("topic 3 overview", 10)
                .execute()
                .unwrap()
        })
    });
    group.bench_function("keyword_topk10", |b| {
        b.iter(|| {
            client
                .table("documents")
                .keyword_search("topic", 10)
                .execute()
                .unwrap()
        })
    });
    group.bench_function("hybrid_topk10", |b| {
        b.iter(|| {
            client
                .table("documents")
                .hybrid_search("topic 3 overview", 10, 0.7)
                .execute()
                .unwrap()
        })
    });
    group.finish();
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");
    group.bench_function("single_row", |b| {
        let dir = tempfile::tempdir().unwrap();
        let client = seeded_client(&dir, 0);
        let mut i = 0usize;
        b.iter_batched(
            || {
                i += 1;
                json!({"title": format!("t{i}"), "content": format!("fresh row {i}")})
            },
            |row| client.table("documents").insert(row).execute().unwrap(),
            BatchSize::SmallInput,
        )
    });
    group.finish();
}

criterion_group!(benches, bench_search, bench_insert);
criterion_main!(benches);
