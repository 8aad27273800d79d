mod common;

use common::{document_schema, ids_of, make_random_vector, make_vector, MockEmbedder};
use serde_json::json;
use std::sync::Arc;
use veclite::{Client, Error};

const DIM: usize = 4;

fn client_with_embedder(dir: &tempfile::TempDir) -> (Client, Arc<MockEmbedder>) {
    let client = Client::create(document_schema(DIM), dir.path().join("test.db")).unwrap();
    let embedder = MockEmbedder::new(DIM);
    client.set_embedder(embedder.clone());
    (client, embedder)
}

fn seed_xy(client: &Client, embedder: &MockEmbedder) {
    embedder.add_mock("x", make_vector(DIM, &[1.0, 0.0, 0.0, 0.0]));
    embedder.add_mock("y", make_vector(DIM, &[0.0, 1.0, 0.0, 0.0]));
    client
        .table("documents")
        .insert(json!([
            {"title": "a", "content": "x"},
            {"title": "b", "content": "y"},
        ]))
        .execute()
        .unwrap();
}

#[test]
fn vector_search_ranks_exact_match_first() {
    let dir = tempfile::tempdir().unwrap();
    let (client, embedder) = client_with_embedder(&dir);
    seed_xy(&client, &embedder);

    let result = client
        .table("documents")
        .vector_search("x", 1)
        .execute()
        .unwrap();
    assert_eq!(ids_of(&result), vec![1]);
    let score = result.scores.as_ref().unwrap()[0];
    assert!((score - 1.0).abs() < 1e-6);
    assert_eq!(result.data[0]["_score"].as_f64().unwrap(), score);
}

#[test]
fn deleted_rows_are_masked_and_files_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let (client, embedder) = client_with_embedder(&dir);
    seed_xy(&client, &embedder);

    client
        .table("documents")
        .delete()
        .eq("id", json!(1))
        .execute()
        .unwrap();

    let result = client
        .table("documents")
        .vector_search("x", 2)
        .execute()
        .unwrap();
    assert_eq!(ids_of(&result), vec![2]);
    assert_eq!(result.scores.as_ref().unwrap()[0], 0.0);

    let vectors = dir.path().join("test.db").join("vectors");
    let tomb = std::fs::read_to_string(vectors.join("documents__content.tomb.json")).unwrap();
    assert_eq!(tomb, r#"{"tombstones":[1]}"#);
    let vec_len = std::fs::metadata(vectors.join("documents__content.vec"))
        .unwrap()
        .len();
    assert_eq!(vec_len, (2 * DIM * 4) as u64, "slots stay physically present");
}

#[test]
fn keyword_search_hits_fts_column_and_ilike_matches_title() {
    let dir = tempfile::tempdir().unwrap();
    let (client, embedder) = client_with_embedder(&dir);
    embedder.add_mock("An introduction to Python programming", make_vector(DIM, &[0.0, 0.0, 1.0, 0.0]));
    client
        .table("documents")
        .insert(json!({"title": "Intro to Python", "content": "An introduction to Python programming"}))
        .execute()
        .unwrap();

    let keyword = client
        .table("documents")
        .keyword_search("python", 10)
        .execute()
        .unwrap();
    assert_eq!(ids_of(&keyword), vec![1]);
    assert!(keyword.scores.as_ref().unwrap()[0] >= 0.0);

    let ilike = client
        .table("documents")
        .ilike("title", "python")
        .execute()
        .unwrap();
    assert_eq!(ids_of(&ilike), vec![1]);
}

#[test]
fn keyword_search_respects_filters() {
    let dir = tempfile::tempdir().unwrap();
    let (client, _embedder) = client_with_embedder(&dir);
    client
        .table("documents")
        .insert(json!([
            {"title": "1", "content": "neural networks", "category": "ml"},
            {"title": "2", "content": "neural interfaces", "category": "bio"},
            {"title": "3", "content": "graph databases", "category": "db"},
        ]))
        .execute()
        .unwrap();

    let filtered = client
        .table("documents")
        .keyword_search("neural", 10)
        .eq("category", json!("ml"))
        .execute()
        .unwrap();
    assert_eq!(ids_of(&filtered), vec![1]);

    // Keyword hits under a filter are a subset of the filtered selection.
    let selected: Vec<i64> = ids_of(
        &client
            .table("documents")
            .eq("category", json!("ml"))
            .execute()
            .unwrap(),
    );
    assert!(ids_of(&filtered).iter().all(|id| selected.contains(id)));
}

#[test]
fn keyword_ranking_prefers_term_frequency() {
    let dir = tempfile::tempdir().unwrap();
    let (client, _embedder) = client_with_embedder(&dir);
    client
        .table("documents")
        .insert(json!([
            {"title": "1", "content": "python mentioned once here"},
            {"title": "2", "content": "python python python everywhere python"},
            {"title": "3", "content": "nothing relevant"},
        ]))
        .execute()
        .unwrap();
    let result = client
        .table("documents")
        .keyword_search("python", 10)
        .execute()
        .unwrap();
    assert_eq!(ids_of(&result)[0], 2);
    assert_eq!(result.data.len(), 2);
}

#[test]
fn vector_search_respects_filters() {
    let dir = tempfile::tempdir().unwrap();
    let (client, embedder) = client_with_embedder(&dir);
    for (i, seed) in [(1, 1u64), (2, 2), (3, 3)] {
        embedder.add_mock(&format!("doc{i}"), make_random_vector(DIM, seed));
    }
    embedder.add_mock("query", make_random_vector(DIM, 10));
    client
        .table("documents")
        .insert(json!([
            {"title": "Doc 1", "content": "doc1", "category": "exclude"},
            {"title": "Doc 2", "content": "doc2", "category": "include"},
            {"title": "Doc 3", "content": "doc3", "category": "include"},
        ]))
        .execute()
        .unwrap();

    let result = client
        .table("documents")
        .vector_search("query", 3)
        .eq("category", json!("include"))
        .execute()
        .unwrap();
    let ids = ids_of(&result);
    assert_eq!(ids.len(), 2);
    assert!(!ids.contains(&1));
}

#[test]
fn vector_search_tie_breaks_by_ascending_id() {
    let dir = tempfile::tempdir().unwrap();
    let (client, embedder) = client_with_embedder(&dir);
    let shared = make_vector(DIM, &[0.5, 0.5, 0.0, 0.0]);
    embedder.add_mock("same", shared.clone());
    embedder.add_mock("q", make_vector(DIM, &[1.0, 0.0, 0.0, 0.0]));
    client
        .table("documents")
        .insert(json!([
            {"title": "first", "content": "same"},
            {"title": "second", "content": "same"},
        ]))
        .execute()
        .unwrap();
    let result = client
        .table("documents")
        .vector_search("q", 2)
        .execute()
        .unwrap();
    assert_eq!(ids_of(&result), vec![1, 2]);
}

#[test]
fn search_without_embedder_fails() {
    let dir = tempfile::tempdir().unwrap();
    let client = Client::create(document_schema(DIM), dir.path().join("test.db")).unwrap();
    let err = client
        .table("documents")
        .vector_search("q", 1)
        .execute()
        .unwrap_err();
    assert!(matches!(err, Error::Embedder { retryable: false, .. }));
}

#[test]
fn hybrid_extremes_match_single_leg_ordering() {
    let dir = tempfile::tempdir().unwrap();
    let (client, embedder) = client_with_embedder(&dir);
    for i in 1..=5 {
        embedder.add_mock(&format!("topic number {i}"), make_random_vector(DIM, i as u64));
    }
    embedder.add_mock("query", make_random_vector(DIM, 99));
    let rows: Vec<serde_json::Value> = (1..=5)
        .map(|i| json!({"title": format!("Doc {i}"), "content": format!("topic number {i}")}))
        .collect();
    client
        .table("documents")
        .insert(serde_json::Value::Array(rows))
        .execute()
        .unwrap();

    let vector_only = client
        .table("documents")
        .vector_search("query", 3)
        .execute()
        .unwrap();
    let hybrid_vector = client
        .table("documents")
        .hybrid_search("query", 3, 1.0)
        .execute()
        .unwrap();
    assert_eq!(ids_of(&vector_only), ids_of(&hybrid_vector));

    let keyword_only = client
        .table("documents")
        .keyword_search("topic number", 3)
        .execute()
        .unwrap();
    let hybrid_keyword = client
        .table("documents")
        .hybrid_search("topic number", 3, 0.0)
        .execute()
        .unwrap();
    assert_eq!(ids_of(&keyword_only), ids_of(&hybrid_keyword));
}

#[test]
fn hybrid_scores_are_descending_and_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let (client, embedder) = client_with_embedder(&dir);
    for i in 0..10u64 {
        embedder.add_mock(&format!("doc{i}"), make_random_vector(DIM, i));
    }
    embedder.add_mock("query", make_random_vector(DIM, 100));
    let rows: Vec<serde_json::Value> = (0..10)
        .map(|i| json!({"title": format!("Doc {i}"), "content": format!("doc{i}")}))
        .collect();
    client
        .table("documents")
        .insert(serde_json::Value::Array(rows))
        .execute()
        .unwrap();

    let result = client
        .table("documents")
        .hybrid_search("query", 5, 0.7)
        .execute()
        .unwrap();
    assert_eq!(result.data.len(), 5);
    let scores = result.scores.unwrap();
    for pair in scores.windows(2) {
        assert!(pair[0] >= pair[1]);
    }
    for row in &result.data {
        assert!(row.contains_key("_score"));
    }
}

#[test]
fn hybrid_respects_filters() {
    let dir = tempfile::tempdir().unwrap();
    let (client, embedder) = client_with_embedder(&dir);
    for i in 1..=3u64 {
        embedder.add_mock(&format!("doc{i}"), make_random_vector(DIM, i));
    }
    embedder.add_mock("query", make_random_vector(DIM, 9));
    client
        .table("documents")
        .insert(json!([
            {"title": "Doc 1", "content": "doc1", "category": "exclude"},
            {"title": "Doc 2", "content": "doc2", "category": "include"},
            {"title": "Doc 3", "content": "doc3", "category": "include"},
        ]))
        .execute()
        .unwrap();

    let result = client
        .table("documents")
        .hybrid_search("query", 3, 0.5)
        .eq("category", json!("include"))
        .execute()
        .unwrap();
    let ids = ids_of(&result);
    assert_eq!(ids.len(), 2);
    assert!(!ids.contains(&1));
}

#[test]
fn hybrid_rerank_applies_scripted_order() {
    let dir = tempfile::tempdir().unwrap();
    let (client, embedder) = client_with_embedder(&dir);
    embedder.add_mock("alpha", make_vector(DIM, &[1.0, 0.0, 0.0, 0.0]));
    embedder.add_mock("beta", make_vector(DIM, &[0.9, 0.1, 0.0, 0.0]));
    embedder.add_mock("q", make_vector(DIM, &[1.0, 0.0, 0.0, 0.0]));
    client
        .table("documents")
        .insert(json!([
            {"title": "1", "content": "alpha"},
            {"title": "2", "content": "beta"},
        ]))
        .execute()
        .unwrap();

    let plain = client
        .table("documents")
        .hybrid_search("q", 2, 1.0)
        .execute()
        .unwrap();
    assert_eq!(ids_of(&plain), vec![1, 2]);

    // The reranker swaps the two.
    embedder.script_rerank(vec![1, 0]);
    let reranked = client
        .table("documents")
        .hybrid_search("q", 2, 1.0)
        .rerank()
        .execute()
        .unwrap();
    assert_eq!(ids_of(&reranked), vec![2, 1]);
}

#[test]
fn query_dimension_mismatch_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (client, embedder) = client_with_embedder(&dir);
    seed_xy(&client, &embedder);
    let wrong = MockEmbedder::new(2);
    wrong.add_mock("x", vec![1.0, 0.0]);
    client.set_embedder(wrong);
    let err = client
        .table("documents")
        .vector_search("x", 1)
        .execute()
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Schema(veclite::SchemaError::DimensionMismatch { expected: 4, got: 2, .. })
    ));
}

#[test]
fn updating_text_reembeds_and_masks_old_vector() {
    let dir = tempfile::tempdir().unwrap();
    let (client, embedder) = client_with_embedder(&dir);
    seed_xy(&client, &embedder);
    embedder.add_mock("z", make_vector(DIM, &[0.0, 0.0, 0.0, 1.0]));

    client
        .table("documents")
        .update(json!({"content": "z"}))
        .eq("id", json!(1))
        .execute()
        .unwrap();

    let by_old = client
        .table("documents")
        .vector_search("x", 1)
        .execute()
        .unwrap();
    // The old embedding is superseded; "x" no longer scores 1.0 on row 1.
    let top = &by_old.data[0];
    assert!(top["_score"].as_f64().unwrap() < 0.5 || top["id"] != json!(1));

    let by_new = client
        .table("documents")
        .vector_search("z", 1)
        .execute()
        .unwrap();
    assert_eq!(ids_of(&by_new), vec![1]);
    assert!((by_new.scores.unwrap()[0] - 1.0).abs() < 1e-6);
}

#[test]
fn unchanged_text_skips_reembedding() {
    let dir = tempfile::tempdir().unwrap();
    let (client, embedder) = client_with_embedder(&dir);
    seed_xy(&client, &embedder);

    // Same content again: the upsert must not grow the vector file.
    let vectors = dir.path().join("test.db").join("vectors");
    let before = std::fs::metadata(vectors.join("documents__content.vec"))
        .unwrap()
        .len();
    client
        .table("documents")
        .upsert(json!({"id": 1, "title": "a2", "content": "x"}), &["id"])
        .execute()
        .unwrap();
    let after = std::fs::metadata(vectors.join("documents__content.vec"))
        .unwrap()
        .len();
    assert_eq!(before, after);
}
