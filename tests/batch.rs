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

fn vec_file_len(dir: &tempfile::TempDir) -> u64 {
    std::fs::metadata(
        dir.path()
            .join("test.db")
            .join("vectors")
            .join("documents__content.vec"),
    )
    .unwrap()
    .len()
}

fn outbox_path(dir: &tempfile::TempDir) -> std::path::PathBuf {
    dir.path()
        .join("test.db")
        .join("vectors")
        .join("documents__content.outbox")
}

#[test]
fn atomic_scope_commits_rows_and_vectors_together() {
    let dir = tempfile::tempdir().unwrap();
    let (client, embedder) = client_with_embedder(&dir);
    for i in 0..5u64 {
        embedder.add_mock(&format!("doc{i}"), make_random_vector(DIM, i));
    }
    embedder.add_mock("query", make_random_vector(DIM, 50));

    client
        .batch_embeddings(|c| {
            c.table("documents")
                .insert(json!([
                    {"title": "0", "content": "doc0"},
                    {"title": "1", "content": "doc1"},
                    {"title": "2", "content": "doc2"},
                ]))
                .execute()?;
            c.table("documents")
                .upsert(json!({"content": "doc3", "title": "3"}), &["id"])
                .execute()?;
            c.table("documents")
                .upsert(json!({"content": "doc4", "title": "4"}), &["id"])
                .execute()?;
            Ok(())
        })
        .unwrap();

    assert_eq!(client.table("documents").count().unwrap(), 5);
    let search = client
        .table("documents")
        .vector_search("query", 5)
        .execute()
        .unwrap();
    assert_eq!(search.data.len(), 5);
    assert_eq!(vec_file_len(&dir), (5 * DIM * 4) as u64);
}

#[test]
fn closure_error_rolls_back_rows_and_vectors() {
    let dir = tempfile::tempdir().unwrap();
    let (client, embedder) = client_with_embedder(&dir);
    embedder.add_mock("doc0", make_random_vector(DIM, 0));
    embedder.add_mock("doc1", make_random_vector(DIM, 1));
    client
        .table("documents")
        .insert(json!({"title": "keep", "content": "doc0"}))
        .execute()
        .unwrap();
    let len_before = vec_file_len(&dir);

    let err = client
        .batch_embeddings(|c| {
            c.table("documents")
                .insert(json!([{"title": "a", "content": "doc1"}]))
                .execute()?;
            Err::<(), _>(Error::InvalidQuery("simulated".to_string()))
        })
        .unwrap_err();
    assert!(matches!(err, Error::InvalidQuery(_)));

    let rows = client.table("documents").execute().unwrap();
    assert_eq!(rows.data.len(), 1);
    assert_eq!(rows.data[0]["title"], json!("keep"));
    assert_eq!(vec_file_len(&dir), len_before);
}

#[test]
fn embedder_failure_inside_atomic_scope_restores_pre_state() {
    let dir = tempfile::tempdir().unwrap();
    let (client, embedder) = client_with_embedder(&dir);
    embedder.add_mock("good one", make_random_vector(DIM, 1));
    embedder.add_mock("good two", make_random_vector(DIM, 2));
    embedder.fail_on("poison");

    let rows_before = client.table("documents").count().unwrap();
    let len_before = vec_file_len(&dir);

    let err = client
        .batch_embeddings(|c| {
            c.table("documents")
                .insert(json!([
                    {"title": "1", "content": "good one"},
                    {"title": "2", "content": "poison"},
                    {"title": "3", "content": "good two"},
                ]))
                .execute()?;
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, Error::Embedder { .. }));

    assert_eq!(client.table("documents").count().unwrap(), rows_before);
    assert_eq!(vec_file_len(&dir), len_before);
    assert!(!outbox_path(&dir).exists(), "atomic failure writes no outbox");
}

#[test]
fn non_atomic_scope_parks_failures_in_outbox() {
    let dir = tempfile::tempdir().unwrap();
    let (client, embedder) = client_with_embedder(&dir);
    embedder.add_mock("fine", make_random_vector(DIM, 1));
    embedder.fail_on("broken");
    embedder.add_mock("query", make_random_vector(DIM, 9));

    client
        .batch_embeddings_non_atomic(|c| {
            c.table("documents")
                .insert(json!([
                    {"title": "1", "content": "fine"},
                    {"title": "2", "content": "broken"},
                ]))
                .execute()?;
            Ok(())
        })
        .unwrap();

    // Both rows exist; only one vector landed.
    assert_eq!(client.table("documents").count().unwrap(), 2);
    let hits = client
        .table("documents")
        .vector_search("query", 10)
        .execute()
        .unwrap();
    assert_eq!(ids_of(&hits), vec![1]);

    let raw = std::fs::read_to_string(outbox_path(&dir)).unwrap();
    let entry: serde_json::Value = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
    assert_eq!(entry["row_id"], json!(2));
    assert_eq!(entry["attempts"], json!(1));
}

#[test]
fn retry_outbox_recovers_once_embedder_heals() {
    let dir = tempfile::tempdir().unwrap();
    let (client, embedder) = client_with_embedder(&dir);
    embedder.fail_on("broken");
    embedder.add_mock("query", make_vector(DIM, &[1.0, 0.0, 0.0, 0.0]));

    client
        .batch_embeddings_non_atomic(|c| {
            c.table("documents")
                .insert(json!({"title": "1", "content": "broken"}))
                .execute()?;
            Ok(())
        })
        .unwrap();
    assert!(outbox_path(&dir).exists());

    // Still failing: attempts go up, entry stays.
    assert_eq!(client.retry_outbox("documents", "content").unwrap(), 0);
    let raw = std::fs::read_to_string(outbox_path(&dir)).unwrap();
    let entry: serde_json::Value = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
    assert_eq!(entry["attempts"], json!(2));

    embedder.clear_failures();
    embedder.add_mock("broken", make_vector(DIM, &[1.0, 0.0, 0.0, 0.0]));
    assert_eq!(client.retry_outbox("documents", "content").unwrap(), 1);
    assert!(!outbox_path(&dir).exists(), "settled outbox file is removed");

    let hits = client
        .table("documents")
        .vector_search("query", 1)
        .execute()
        .unwrap();
    assert_eq!(ids_of(&hits), vec![1]);
}

#[test]
fn retry_outbox_on_empty_outbox_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let (client, _embedder) = client_with_embedder(&dir);
    assert_eq!(client.retry_outbox("documents", "content").unwrap(), 0);
    assert!(!outbox_path(&dir).exists());
}

#[test]
fn cancellation_unwinds_like_a_failure() {
    let dir = tempfile::tempdir().unwrap();
    let (client, embedder) = client_with_embedder(&dir);
    embedder.add_mock("doc", make_random_vector(DIM, 1));
    let token = client.cancellation_token();

    let err = client
        .batch_embeddings(|c| {
            c.table("documents")
                .insert(json!({"title": "1", "content": "doc"}))
                .execute()?;
            token.cancel();
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));

    // The cancelled scope left nothing behind; later calls fail fast too.
    assert!(matches!(
        client.table("documents").count().unwrap_err(),
        Error::Cancelled
    ));
}

#[test]
fn nested_scopes_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (client, _embedder) = client_with_embedder(&dir);
    let err = client
        .batch_embeddings(|c| c.batch_embeddings(|_| Ok(())))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidQuery(_)));
}

#[test]
fn plain_insert_with_failing_embedder_leaves_no_row() {
    let dir = tempfile::tempdir().unwrap();
    let (client, embedder) = client_with_embedder(&dir);
    embedder.fail_on("poison");
    let err = client
        .table("documents")
        .insert(json!({"title": "1", "content": "poison"}))
        .execute()
        .unwrap_err();
    assert!(matches!(err, Error::Embedder { .. }));
    assert_eq!(client.table("documents").count().unwrap(), 0);
    assert_eq!(vec_file_len(&dir), 0);
}
