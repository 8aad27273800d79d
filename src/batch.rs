//! Write coordination across the relational store, the vector files and
//! the full-text index.
//!
//! All writes run inside a batch scope. `batch_embeddings` opens one
//! explicitly; a plain insert/update/delete opens an implicit single-shot
//! atomic scope around itself. In an atomic scope every row lands in one
//! `BEGIN IMMEDIATE` transaction, embeddings are produced in bulk at scope
//! exit, an intent log is fsynced before the vector appends, and any
//! failure rolls back both sides (rows via ROLLBACK, vectors via file
//! truncation). In a non-atomic scope rows autocommit one by one and a row
//! whose embedding fails is parked in the outbox for `retry_outbox`.

use crate::client::ClientInner;
use crate::error::{Error, Result, SchemaError};
use crate::filter::TargetMeta;
use crate::query::planner::{self, TargetKind};
use crate::query::{Mode, QueryBuilder, QueryResult};
use crate::schema::TableDef;
use crate::store::{fts, query_rows_on, to_sql_value, Row, TEXT_HASH_TABLE};
use crate::vector::{intent_log_path_for, outbox, outbox_path_for};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub(crate) struct PendingEmbed {
    table: String,
    column: String,
    row_id: i64,
    text: String,
}

pub(crate) struct BatchState {
    atomic: bool,
    pending_embeds: Vec<PendingEmbed>,
    /// Tombstones deferred to commit so a rollback leaves no trace.
    pending_deletes: Vec<(String, String, i64)>,
    pre_slots: HashMap<(String, String), usize>,
}

pub(crate) fn scope_active(inner: &ClientInner) -> bool {
    inner.batch.lock().is_some()
}

/// Run `f` inside a batch scope: begin, run, then commit on success or
/// unwind on failure (including cancellation, which behaves exactly like a
/// failure).
pub(crate) fn with_scope<T>(
    inner: &Arc<ClientInner>,
    atomic: bool,
    f: impl FnOnce() -> Result<T>,
) -> Result<T> {
    begin_scope(inner, atomic)?;
    match f().and_then(|value| inner.check_cancelled().map(|()| value)) {
        Ok(value) => commit_scope(inner).map(|()| value),
        Err(err) => {
            rollback_scope(inner);
            Err(err)
        }
    }
}

fn begin_scope(inner: &ClientInner, atomic: bool) -> Result<()> {
    let mut batch = inner.batch.lock();
    if batch.is_some() {
        return Err(Error::InvalidQuery(
            "a batch scope is already active".to_string(),
        ));
    }
    let mut pre_slots = HashMap::new();
    for table in inner.schema.tables() {
        for column in table.vector_columns() {
            let file = inner.vectors.file(&table.name, &column.name)?;
            pre_slots.insert((table.name.clone(), column.name.clone()), file.slot_count());
        }
    }
    if atomic {
        inner.rel.begin()?;
    }
    *batch = Some(BatchState {
        atomic,
        pending_embeds: Vec::new(),
        pending_deletes: Vec::new(),
        pre_slots,
    });
    Ok(())
}

fn commit_scope(inner: &ClientInner) -> Result<()> {
    let Some(state) = inner.batch.lock().take() else {
        return Err(Error::InvalidQuery("no active batch scope".to_string()));
    };
    let staged = match prepare_commit(inner, &state) {
        Ok(staged) => staged,
        Err(err) => {
            unwind(inner, &state);
            return Err(err);
        }
    };
    if state.atomic {
        if let Err(err) = inner.rel.commit() {
            unwind(inner, &state);
            return Err(err);
        }
    }
    // Past the commit point there is nothing to unwind: on failure the
    // intent logs stay behind and the next open replays them.
    finalize_commit(inner, &state, &staged)
}

pub(crate) fn rollback_scope(inner: &ClientInner) {
    if let Some(state) = inner.batch.lock().take() {
        unwind(inner, &state);
    }
}

fn unwind(inner: &ClientInner, state: &BatchState) {
    if !state.atomic {
        return; // rows already committed one by one; nothing to undo
    }
    if let Err(err) = inner.rel.rollback() {
        tracing::warn!(%err, "rollback failed");
    }
    for ((table, column), pre) in &state.pre_slots {
        match inner.vectors.file(table, column) {
            Ok(file) => {
                if let Err(err) = file.truncate_to(*pre) {
                    tracing::warn!(%err, %table, %column, "failed to truncate vector file");
                }
            }
            Err(err) => tracing::warn!(%err, "missing vector file during unwind"),
        }
        let _ = crate::vector::intent::clear(&intent_log_path_for(
            inner.vectors.dir(),
            table,
            column,
        ));
    }
}

struct StagedCommit {
    appends: Vec<((String, String), Vec<(i64, Vec<f32>)>)>,
    failures: HashMap<(String, String), HashSet<i64>>,
}

/// Everything up to (not including) the relational COMMIT: bulk embedding,
/// intent logs, vector appends, deferred tombstones.
fn prepare_commit(inner: &ClientInner, state: &BatchState) -> Result<StagedCommit> {
    inner.check_cancelled()?;

    // Bulk-embed per column, preserving row order.
    let mut groups: Vec<((String, String), Vec<&PendingEmbed>)> = Vec::new();
    for pending in &state.pending_embeds {
        let key = (pending.table.clone(), pending.column.clone());
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, list)) => list.push(pending),
            None => groups.push((key, vec![pending])),
        }
    }

    let mut appends: Vec<((String, String), Vec<(i64, Vec<f32>)>)> = Vec::new();
    let mut failures: HashMap<(String, String), HashSet<i64>> = HashMap::new();
    for ((table, column), pending) in &groups {
        let texts: Vec<String> = pending.iter().map(|p| p.text.clone()).collect();
        match embed_all(inner, &texts) {
            Ok(vectors) => {
                if vectors.len() != pending.len() {
                    return Err(Error::Embedder {
                        message: format!(
                            "embedder returned {} vectors for {} texts",
                            vectors.len(),
                            pending.len()
                        ),
                        retryable: false,
                    });
                }
                let entries = pending
                    .iter()
                    .zip(vectors)
                    .map(|(p, v)| (p.row_id, v))
                    .collect();
                appends.push(((table.clone(), column.clone()), entries));
            }
            Err(err) if state.atomic => return Err(err),
            Err(err) => {
                // Bulk call failed; retry row by row so one bad input does
                // not park the whole batch.
                tracing::warn!(%err, %table, %column, "bulk embed failed, retrying per row");
                let mut entries = Vec::new();
                for p in pending {
                    match embed_all(inner, std::slice::from_ref(&p.text)) {
                        Ok(mut vectors) if vectors.len() == 1 => {
                            entries.push((p.row_id, vectors.remove(0)));
                        }
                        _ => {
                            failures
                                .entry((table.clone(), column.clone()))
                                .or_default()
                                .insert(p.row_id);
                        }
                    }
                }
                if !entries.is_empty() {
                    appends.push(((table.clone(), column.clone()), entries));
                }
            }
        }
    }

    for ((table, column), entries) in &appends {
        let file = inner.vectors.file(table, column)?;
        if state.atomic {
            let base = state
                .pre_slots
                .get(&(table.clone(), column.clone()))
                .copied()
                .unwrap_or(0);
            crate::vector::intent::write(
                &intent_log_path_for(inner.vectors.dir(), table, column),
                base as u64,
                entries,
            )?;
        }
        file.append_batch(entries)?;
    }
    for (table, column, row_id) in &state.pending_deletes {
        inner.vectors.file(table, column)?.mark_deleted(*row_id)?;
    }

    Ok(StagedCommit { appends, failures })
}

/// Durability tail after the commit point: fsync the vector artifacts,
/// retire the intent logs, settle outboxes, trigger opportunistic
/// compaction.
fn finalize_commit(inner: &ClientInner, state: &BatchState, staged: &StagedCommit) -> Result<()> {
    for ((table, column), _) in &staged.appends {
        let file = inner.vectors.file(table, column)?;
        file.sync_all()?;
        if state.atomic {
            crate::vector::intent::clear(&intent_log_path_for(
                inner.vectors.dir(),
                table,
                column,
            ))?;
        }
    }

    if !state.atomic {
        settle_outboxes(inner, &staged.appends, &staged.failures)?;
    }

    if let Some(ratio) = inner.options.auto_compact_tombstone_ratio {
        for (table, column, _) in &state.pending_deletes {
            let file = inner.vectors.file(table, column)?;
            if file.tombstone_ratio() >= ratio {
                file.compact()?;
            }
        }
    }
    Ok(())
}

/// Drop successfully appended rows from the outbox and bump attempts on
/// the rows that failed again.
fn settle_outboxes(
    inner: &ClientInner,
    appends: &[((String, String), Vec<(i64, Vec<f32>)>)],
    failures: &HashMap<(String, String), HashSet<i64>>,
) -> Result<()> {
    let mut touched: Vec<(String, String)> = Vec::new();
    for (key, _) in appends {
        if !touched.contains(key) {
            touched.push(key.clone());
        }
    }
    for key in failures.keys() {
        if !touched.contains(key) {
            touched.push(key.clone());
        }
    }
    for (table, column) in touched {
        let appended: HashSet<i64> = appends
            .iter()
            .filter(|(k, _)| k.0 == table && k.1 == column)
            .flat_map(|(_, entries)| entries.iter().map(|(id, _)| *id))
            .collect();
        let failed = failures.get(&(table.clone(), column.clone()));
        let path = outbox_path_for(inner.vectors.dir(), &table, &column);
        let entries: Vec<outbox::OutboxEntry> = outbox::read_all(&path)?
            .into_iter()
            .filter(|entry| !appended.contains(&entry.row_id))
            .map(|mut entry| {
                if failed.is_some_and(|f| f.contains(&entry.row_id)) {
                    entry.attempts += 1;
                }
                entry
            })
            .collect();
        outbox::rewrite(&path, &entries)?;
    }
    Ok(())
}

fn embed_all(inner: &ClientInner, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    inner.check_cancelled()?;
    inner.require_embedder()?.embed(texts)
}

fn text_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

// ---------------------------------------------------------------------------
// Write paths

pub(crate) fn execute_write(builder: &QueryBuilder) -> Result<QueryResult> {
    let inner = &builder.client;
    let table = match planner::resolve_target(&inner.schema, &builder.target)? {
        TargetKind::Table(table) => table.clone(),
        TargetKind::View(_) => {
            return Err(Error::Schema(SchemaError::ViewNotWritable(
                builder.target.clone(),
            )))
        }
    };
    if scope_active(inner) {
        write_core(inner, &table, builder)
    } else {
        with_scope(inner, true, || write_core(inner, &table, builder))
    }
}

fn write_core(inner: &ClientInner, table: &TableDef, builder: &QueryBuilder) -> Result<QueryResult> {
    let meta = planner::table_meta(table);
    match &builder.mode {
        Mode::Insert { rows } => insert_core(inner, table, &meta, rows),
        Mode::Upsert {
            rows,
            on_conflict,
            ignore_duplicates,
        } => upsert_core(inner, table, &meta, rows, on_conflict, *ignore_duplicates),
        Mode::Update { patch } => update_core(inner, table, &meta, patch, builder),
        Mode::Delete => delete_core(inner, table, &meta, builder),
        _ => unreachable!("execute_write only handles write modes"),
    }
}

fn validate_columns(table: &TableDef, row: &Row) -> Result<()> {
    for key in row.keys() {
        if table.get(key).is_none() {
            return Err(Error::Schema(SchemaError::UnknownColumn {
                table: table.name.clone(),
                column: key.clone(),
            }));
        }
    }
    Ok(())
}

fn fetch_row(
    conn: &Connection,
    table: &TableDef,
    meta: &TargetMeta,
    row_id: i64,
) -> Result<Row> {
    let rows = query_rows_on(
        conn,
        &format!(
            "SELECT * FROM \"{}\" WHERE \"{}\" = ?",
            table.name, meta.pk
        ),
        &[SqlValue::Integer(row_id)],
        &meta.types,
    )?;
    rows.into_iter().next().ok_or_else(|| {
        Error::Sqlite(rusqlite::Error::QueryReturnedNoRows)
    })
}

/// Maintain the full-text index and queue embedding work for one stored
/// row. `changed` limits the maintenance to the columns a patch touched.
fn index_row(
    inner: &ClientInner,
    state: &mut BatchState,
    conn: &Connection,
    table: &TableDef,
    row_id: i64,
    stored: &Row,
    changed: Option<&HashSet<String>>,
) -> Result<()> {
    let relevant = |name: &str| changed.map_or(true, |set| set.contains(name));
    for column in table.fts_columns() {
        if !relevant(&column.name) {
            continue;
        }
        match stored.get(&column.name).and_then(Value::as_str) {
            Some(text) => fts::index_text(conn, &table.name, &column.name, row_id, text)?,
            None => fts::delete_text(conn, &table.name, &column.name, row_id)?,
        }
    }
    for column in table.vector_columns() {
        if !relevant(&column.name) {
            continue;
        }
        let Some(text) = stored.get(&column.name).and_then(Value::as_str) else {
            continue; // NOT NULL is enforced by the table definition
        };
        let hash = text_hash(text);
        let prior: Option<String> = conn
            .prepare_cached(&format!(
                "SELECT hash FROM {TEXT_HASH_TABLE} WHERE tbl = ?1 AND col = ?2 AND row_id = ?3"
            ))?
            .query_row(
                rusqlite::params![table.name, column.name, row_id],
                |row| row.get(0),
            )
            .optional()?;
        let file = inner.vectors.file(&table.name, &column.name)?;
        if prior.as_deref() == Some(hash.as_str()) && file.has_slot(row_id) {
            continue; // unchanged text, keep the existing vector
        }
        conn.prepare_cached(&format!(
            "INSERT OR REPLACE INTO {TEXT_HASH_TABLE} (tbl, col, row_id, hash) VALUES (?1, ?2, ?3, ?4)"
        ))?
        .execute(rusqlite::params![table.name, column.name, row_id, hash])?;
        state.pending_embeds.push(PendingEmbed {
            table: table.name.clone(),
            column: column.name.clone(),
            row_id,
            text: text.to_string(),
        });
        if !state.atomic {
            // Park the row up front so a crash before the scope settles
            // still leaves it findable for retry.
            outbox::append(
                &outbox_path_for(inner.vectors.dir(), &table.name, &column.name),
                &outbox::OutboxEntry {
                    row_id,
                    text_hash: hash,
                    attempts: 0,
                },
            )?;
        }
    }
    Ok(())
}

fn insert_core(
    inner: &ClientInner,
    table: &TableDef,
    meta: &TargetMeta,
    rows: &[Row],
) -> Result<QueryResult> {
    let mut batch = inner.batch.lock();
    let state = batch
        .as_mut()
        .ok_or_else(|| Error::InvalidQuery("write outside batch scope".to_string()))?;
    let conn = inner.rel.lock();
    let mut data = Vec::with_capacity(rows.len());
    for row in rows {
        validate_columns(table, row)?;
        let row_id = if row.is_empty() {
            conn.prepare_cached(&format!("INSERT INTO \"{}\" DEFAULT VALUES", table.name))?
                .execute([])?;
            conn.last_insert_rowid()
        } else {
            let columns: Vec<&String> = row.keys().collect();
            let placeholders = vec!["?"; columns.len()].join(", ");
            let column_list = columns
                .iter()
                .map(|c| format!("\"{c}\""))
                .collect::<Vec<_>>()
                .join(", ");
            let mut params = Vec::with_capacity(columns.len());
            for name in &columns {
                let ty = table.get(name).map(|c| c.ty);
                params.push(to_sql_value(&row[name.as_str()], ty)?);
            }
            conn.prepare_cached(&format!(
                "INSERT INTO \"{}\" ({column_list}) VALUES ({placeholders})",
                table.name
            ))?
            .execute(rusqlite::params_from_iter(params))?;
            conn.last_insert_rowid()
        };
        let stored = fetch_row(&conn, table, meta, row_id)?;
        index_row(inner, state, &conn, table, row_id, &stored, None)?;
        data.push(stored);
    }
    Ok(QueryResult { data, scores: None })
}

fn upsert_core(
    inner: &ClientInner,
    table: &TableDef,
    meta: &TargetMeta,
    rows: &[Row],
    on_conflict: &[String],
    ignore_duplicates: bool,
) -> Result<QueryResult> {
    if on_conflict.is_empty() {
        return Err(Error::InvalidQuery(
            "upsert requires at least one conflict column".to_string(),
        ));
    }
    for column in on_conflict {
        if table.get(column).is_none() {
            return Err(Error::Schema(SchemaError::UnknownColumn {
                table: table.name.clone(),
                column: column.clone(),
            }));
        }
    }
    let mut batch = inner.batch.lock();
    let state = batch
        .as_mut()
        .ok_or_else(|| Error::InvalidQuery("write outside batch scope".to_string()))?;
    let conn = inner.rel.lock();
    let conflict_list = on_conflict
        .iter()
        .map(|c| format!("\"{c}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let mut data = Vec::new();
    for row in rows {
        validate_columns(table, row)?;
        let columns: Vec<&String> = row.keys().collect();
        let placeholders = vec!["?"; columns.len()].join(", ");
        let column_list = columns
            .iter()
            .map(|c| format!("\"{c}\""))
            .collect::<Vec<_>>()
            .join(", ");
        let updates: Vec<String> = columns
            .iter()
            .filter(|c| !on_conflict.contains(*c))
            .map(|c| format!("\"{c}\" = excluded.\"{c}\""))
            .collect();
        let action = if ignore_duplicates || updates.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", updates.join(", "))
        };
        let sql = format!(
            "INSERT INTO \"{}\" ({column_list}) VALUES ({placeholders}) \
             ON CONFLICT ({conflict_list}) {action} RETURNING \"{}\"",
            table.name, meta.pk
        );
        let mut params = Vec::with_capacity(columns.len());
        for name in &columns {
            let ty = table.get(name).map(|c| c.ty);
            params.push(to_sql_value(&row[name.as_str()], ty)?);
        }
        let row_id: Option<i64> = conn
            .prepare_cached(&sql)?
            .query_row(rusqlite::params_from_iter(params), |r| r.get(0))
            .optional()?;
        // DO NOTHING on a conflicting row returns nothing; skip it.
        let Some(row_id) = row_id else { continue };
        let stored = fetch_row(&conn, table, meta, row_id)?;
        index_row(inner, state, &conn, table, row_id, &stored, None)?;
        data.push(stored);
    }
    Ok(QueryResult { data, scores: None })
}

fn update_core(
    inner: &ClientInner,
    table: &TableDef,
    meta: &TargetMeta,
    patch: &Row,
    builder: &QueryBuilder,
) -> Result<QueryResult> {
    if patch.is_empty() {
        return Err(Error::InvalidQuery("empty update patch".to_string()));
    }
    validate_columns(table, patch)?;
    let compiled = builder.filter.compile(meta)?;
    let mut batch = inner.batch.lock();
    let state = batch
        .as_mut()
        .ok_or_else(|| Error::InvalidQuery("write outside batch scope".to_string()))?;
    let conn = inner.rel.lock();

    let assignments = patch
        .keys()
        .map(|c| format!("\"{c}\" = ?"))
        .collect::<Vec<_>>()
        .join(", ");
    let mut params = Vec::with_capacity(patch.len() + compiled.params.len());
    for (name, value) in patch {
        params.push(to_sql_value(value, table.get(name).map(|c| c.ty))?);
    }
    params.extend(compiled.params.iter().cloned());
    let sql = format!(
        "UPDATE \"{}\" SET {assignments}{} RETURNING *",
        table.name, compiled.where_sql
    );
    let data = query_rows_on(&conn, &sql, &params, &meta.types)?;

    let changed: HashSet<String> = patch.keys().cloned().collect();
    for row in &data {
        let Some(row_id) = row.get(&meta.pk).and_then(Value::as_i64) else {
            continue;
        };
        index_row(inner, state, &conn, table, row_id, row, Some(&changed))?;
    }
    Ok(QueryResult { data, scores: None })
}

fn delete_core(
    inner: &ClientInner,
    table: &TableDef,
    meta: &TargetMeta,
    builder: &QueryBuilder,
) -> Result<QueryResult> {
    let compiled = builder.filter.compile(meta)?;
    let mut batch = inner.batch.lock();
    let state = batch
        .as_mut()
        .ok_or_else(|| Error::InvalidQuery("write outside batch scope".to_string()))?;
    let conn = inner.rel.lock();
    let sql = format!(
        "DELETE FROM \"{}\"{} RETURNING *",
        table.name, compiled.where_sql
    );
    let data = query_rows_on(&conn, &sql, &compiled.params, &meta.types)?;

    for row in &data {
        let Some(row_id) = row.get(&meta.pk).and_then(Value::as_i64) else {
            continue;
        };
        for column in table.fts_columns() {
            fts::delete_text(&conn, &table.name, &column.name, row_id)?;
        }
        for column in table.vector_columns() {
            if state.atomic {
                state
                    .pending_deletes
                    .push((table.name.clone(), column.name.clone(), row_id));
            } else {
                inner
                    .vectors
                    .file(&table.name, &column.name)?
                    .mark_deleted(row_id)?;
            }
            conn.prepare_cached(&format!(
                "DELETE FROM {TEXT_HASH_TABLE} WHERE tbl = ?1 AND col = ?2 AND row_id = ?3"
            ))?
            .execute(rusqlite::params![table.name, column.name, row_id])?;
            let path = outbox_path_for(inner.vectors.dir(), &table.name, &column.name);
            if path.exists() {
                let entries: Vec<outbox::OutboxEntry> = outbox::read_all(&path)?
                    .into_iter()
                    .filter(|entry| entry.row_id != row_id)
                    .collect();
                outbox::rewrite(&path, &entries)?;
            }
        }
    }
    Ok(QueryResult { data, scores: None })
}

/// Re-embed everything parked in a column's outbox. Rows that vanished are
/// dropped, fresh failures get their attempt count bumped. A no-op on an
/// empty outbox.
pub(crate) fn retry_outbox(inner: &ClientInner, table: &str, column: &str) -> Result<usize> {
    let file = inner.vectors.file(table, column)?;
    let path = outbox_path_for(inner.vectors.dir(), table, column);
    let entries = outbox::read_all(&path)?;
    if entries.is_empty() {
        return Ok(0);
    }
    let table_def = inner
        .schema
        .get_table(table)
        .ok_or_else(|| SchemaError::UnknownTable(table.to_string()))?;
    let pk = &table_def.primary_key().name;

    let mut remaining = Vec::new();
    let mut appended = 0usize;
    for mut entry in entries {
        inner.check_cancelled()?;
        let text: Option<String> = {
            let conn = inner.rel.lock();
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT \"{column}\" FROM \"{table}\" WHERE \"{pk}\" = ?1"
            ))?;
            stmt.query_row([entry.row_id], |row| row.get(0))
                .optional()?
        };
        let Some(text) = text else {
            tracing::debug!(table, column, row_id = entry.row_id, "outbox row gone, dropping");
            continue;
        };
        match embed_all(inner, std::slice::from_ref(&text)) {
            Ok(mut vectors) if vectors.len() == 1 => {
                file.append(entry.row_id, &vectors.remove(0))?;
                let conn = inner.rel.lock();
                conn.prepare_cached(&format!(
                    "INSERT OR REPLACE INTO {TEXT_HASH_TABLE} (tbl, col, row_id, hash) VALUES (?1, ?2, ?3, ?4)"
                ))?
                .execute(rusqlite::params![table, column, entry.row_id, text_hash(&text)])?;
                appended += 1;
            }
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Ok(_) | Err(_) => {
                entry.attempts += 1;
                remaining.push(entry);
            }
        }
    }
    if appended > 0 {
        file.sync_all()?;
    }
    outbox::rewrite(&path, &remaining)?;
    tracing::debug!(table, column, appended, pending = remaining.len(), "outbox retried");
    Ok(appended)
}
