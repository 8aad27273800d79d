//! Inverted index over SQLite's FTS5 virtual tables, one per
//! `(table, column)` pair flagged for full-text search.
//!
//! Scoring delegates to FTS5's built-in `bm25()` (k1=1.2, b=0.75, fixed by
//! the engine). `bm25()` returns smaller-is-better negatives, so scores are
//! negated before they leave this module: non-negative, higher is better,
//! ties broken by ascending row id.

use crate::error::Result;
use rusqlite::Connection;
use std::collections::HashSet;

pub(crate) fn table_name(table: &str, column: &str) -> String {
    format!("{table}__{column}_fts")
}

pub(crate) fn create_table(conn: &Connection, table: &str, column: &str) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS \"{}\" USING fts5(content, tokenize='porter unicode61');",
        table_name(table, column)
    ))?;
    Ok(())
}

/// Additive and idempotent on `(table, column, row_id)`.
pub(crate) fn index_text(
    conn: &Connection,
    table: &str,
    column: &str,
    row_id: i64,
    text: &str,
) -> Result<()> {
    let fts = table_name(table, column);
    conn.prepare_cached(&format!("DELETE FROM \"{fts}\" WHERE rowid = ?1"))?
        .execute([row_id])?;
    conn.prepare_cached(&format!(
        "INSERT INTO \"{fts}\" (rowid, content) VALUES (?1, ?2)"
    ))?
    .execute(rusqlite::params![row_id, text])?;
    Ok(())
}

pub(crate) fn delete_text(conn: &Connection, table: &str, column: &str, row_id: i64) -> Result<()> {
    conn.prepare_cached(&format!(
        "DELETE FROM \"{}\" WHERE rowid = ?1",
        table_name(table, column)
    ))?
    .execute([row_id])?;
    Ok(())
}

/// BM25 over the candidate set (or the whole index when `candidates` is
/// `None`), top `k` by score.
pub(crate) fn bm25_search(
    conn: &Connection,
    table: &str,
    column: &str,
    query: &str,
    candidates: Option<&HashSet<i64>>,
    k: usize,
) -> Result<Vec<(i64, f64)>> {
    let match_query = sanitize_match_query(query);
    if match_query.is_empty() || k == 0 {
        return Ok(Vec::new());
    }
    let fts = table_name(table, column);
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT rowid, bm25(\"{fts}\") FROM \"{fts}\" WHERE \"{fts}\" MATCH ?1 \
         ORDER BY bm25(\"{fts}\"), rowid"
    ))?;
    let mut rows = stmt.query([match_query])?;
    let mut hits = Vec::with_capacity(k);
    while let Some(row) = rows.next()? {
        let row_id: i64 = row.get(0)?;
        if let Some(candidates) = candidates {
            if !candidates.contains(&row_id) {
                continue;
            }
        }
        let rank: f64 = row.get(1)?;
        hits.push((row_id, (-rank).max(0.0)));
        if hits.len() == k {
            break;
        }
    }
    Ok(hits)
}

pub(crate) fn count_entries(conn: &Connection, table: &str, column: &str) -> Result<i64> {
    let count = conn.query_row(
        &format!("SELECT COUNT(*) FROM \"{}\"", table_name(table, column)),
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// FTS5 MATCH has its own query syntax; user input is reduced to quoted
/// tokens joined with OR so punctuation cannot break the query.
fn sanitize_match_query(query: &str) -> String {
    let tokens: Vec<String> = query
        .split_whitespace()
        .map(|t| format!("\"{}\"", t.replace('"', "")))
        .filter(|t| t.len() > 2)
        .collect();
    tokens.join(" OR ")
}
