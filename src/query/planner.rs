//! Read-side planning: a query request (mode, filters, topk, fusion
//! weight) becomes an execution over the relational store, the vector
//! files and the full-text index. Views are rewritten onto their base
//! tables, with the `id` alias carrying row identity back to the vector
//! store.

use super::fusion::{self, ScoredId, TopK};
use super::{Mode, QueryBuilder, QueryResult};
use crate::client::ClientInner;
use crate::error::{Error, Result, SchemaError, ViewError};
use crate::filter::{Filter, TargetMeta};
use crate::schema::{ColumnType, Schema, TableDef, ViewDef};
use crate::store::{fts, TypeMap};
use rusqlite::OptionalExtension;
use serde_json::Value;
use std::collections::HashSet;

pub(crate) enum TargetKind<'a> {
    Table(&'a TableDef),
    View(&'a ViewDef),
}

pub(crate) fn resolve_target<'a>(schema: &'a Schema, name: &str) -> Result<TargetKind<'a>> {
    if let Some(table) = schema.get_table(name) {
        return Ok(TargetKind::Table(table));
    }
    if let Some(view) = schema.get_view(name) {
        return Ok(TargetKind::View(view));
    }
    Err(Error::Schema(SchemaError::UnknownTable(name.to_string())))
}

pub(crate) fn table_meta(table: &TableDef) -> TargetMeta {
    let mut types = TypeMap::new();
    for column in &table.columns {
        types.insert(column.name.clone(), column.ty);
    }
    TargetMeta {
        name: table.name.clone(),
        pk: table.primary_key().name.clone(),
        types,
    }
}

fn view_meta(view: &ViewDef, schema: &Schema) -> TargetMeta {
    let mut types = TypeMap::new();
    for field in &view.fields {
        let ty = schema
            .get_table(&field.table)
            .and_then(|t| t.get(&field.column))
            .map(|c| c.ty)
            .unwrap_or(ColumnType::Text);
        types.insert(field.alias.clone(), ty);
    }
    let pk = view
        .get_field("id")
        .map(|_| "id".to_string())
        .unwrap_or_default();
    TargetMeta {
        name: view.name.clone(),
        pk,
        types,
    }
}

pub(crate) fn meta_for(kind: &TargetKind<'_>, schema: &Schema) -> TargetMeta {
    match kind {
        TargetKind::Table(table) => table_meta(table),
        TargetKind::View(view) => view_meta(view, schema),
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum LegKind {
    Vector,
    Keyword,
}

impl LegKind {
    fn label(self) -> &'static str {
        match self {
            LegKind::Vector => "vector",
            LegKind::Keyword => "full-text",
        }
    }

    fn flagged(self, column: &crate::schema::ColumnDef) -> bool {
        match self {
            LegKind::Vector => column.vector.is_some(),
            LegKind::Keyword => column.fts,
        }
    }
}

/// The base table and column a search leg runs against. For a view target
/// this also verifies the view's `id` alias resolves to that table's
/// primary key, so candidate ids line up with the vector store.
fn resolve_leg(
    schema: &Schema,
    kind: &TargetKind<'_>,
    requested: Option<&str>,
    leg: LegKind,
) -> Result<(String, String)> {
    match kind {
        TargetKind::Table(table) => {
            let column = match requested {
                Some(name) => {
                    let column = table.get(name).ok_or_else(|| SchemaError::UnknownColumn {
                        table: table.name.clone(),
                        column: name.to_string(),
                    })?;
                    if !leg.flagged(column) {
                        return Err(Error::Schema(SchemaError::MissingColumnKind {
                            table: table.name.clone(),
                            kind: leg.label(),
                        }));
                    }
                    column
                }
                None => single_flagged(table, leg)?,
            };
            Ok((table.name.clone(), column.name.clone()))
        }
        TargetKind::View(view) => {
            let field = match requested {
                Some(alias) => view.get_field(alias).ok_or_else(|| {
                    Error::Schema(SchemaError::UnknownColumn {
                        table: view.name.clone(),
                        column: alias.to_string(),
                    })
                })?,
                None => {
                    let mut flagged = view.fields.iter().filter(|f| {
                        schema
                            .get_table(&f.table)
                            .and_then(|t| t.get(&f.column))
                            .is_some_and(|c| leg.flagged(c))
                    });
                    let first = flagged.next().ok_or(SchemaError::MissingColumnKind {
                        table: view.name.clone(),
                        kind: leg.label(),
                    })?;
                    if flagged.next().is_some() {
                        return Err(Error::Schema(SchemaError::AmbiguousColumnKind {
                            table: view.name.clone(),
                            kind: leg.label(),
                        }));
                    }
                    first
                }
            };
            let table = schema
                .get_table(&field.table)
                .ok_or_else(|| SchemaError::UnknownTable(field.table.clone()))?;
            let column = table
                .get(&field.column)
                .ok_or_else(|| SchemaError::UnknownColumn {
                    table: field.table.clone(),
                    column: field.column.clone(),
                })?;
            if !leg.flagged(column) {
                return Err(Error::Schema(SchemaError::MissingColumnKind {
                    table: view.name.clone(),
                    kind: leg.label(),
                }));
            }
            // Row identity: the view must alias the leg table's primary key
            // as `id`.
            let id_ok = view.get_field("id").is_some_and(|id| {
                id.table == table.name && id.column == table.primary_key().name
            });
            if !id_ok {
                return Err(Error::Schema(SchemaError::View(
                    ViewError::MissingVectorId {
                        view: view.name.clone(),
                    },
                )));
            }
            Ok((table.name.clone(), column.name.clone()))
        }
    }
}

fn single_flagged(table: &TableDef, leg: LegKind) -> Result<&crate::schema::ColumnDef> {
    let mut flagged = table.columns.iter().filter(|c| leg.flagged(c));
    let first = flagged.next().ok_or(SchemaError::MissingColumnKind {
        table: table.name.clone(),
        kind: leg.label(),
    })?;
    if flagged.next().is_some() {
        return Err(Error::Schema(SchemaError::AmbiguousColumnKind {
            table: table.name.clone(),
            kind: leg.label(),
        }));
    }
    Ok(first)
}

/// Filtered candidate id set, or `None` when no filters are present (every
/// live row is a candidate).
fn candidate_ids(
    inner: &ClientInner,
    meta: &TargetMeta,
    filter: &Filter,
) -> Result<Option<HashSet<i64>>> {
    if filter.is_empty() {
        return Ok(None);
    }
    let compiled = filter.compile(meta)?;
    let sql = format!(
        "SELECT \"{}\" FROM \"{}\"{}",
        meta.pk, meta.name, compiled.where_sql
    );
    let ids = inner.rel.query_ids(&sql, &compiled.params)?;
    Ok(Some(ids.into_iter().collect()))
}

pub(crate) fn execute_read(builder: &QueryBuilder) -> Result<QueryResult> {
    let inner = &builder.client;
    let kind = resolve_target(&inner.schema, &builder.target)?;
    let meta = meta_for(&kind, &inner.schema);

    match &builder.mode {
        Mode::Select { columns } => select(inner, &meta, columns.as_deref(), &builder.filter),
        Mode::KeywordSearch {
            query,
            topk,
            column,
        } => {
            let hits = keyword_hits(
                inner,
                &kind,
                &meta,
                &builder.filter,
                query,
                column.as_deref(),
                *topk,
            )?;
            project_hits(inner, &meta, &hits)
        }
        Mode::VectorSearch {
            query,
            topk,
            column,
        } => {
            let hits = vector_hits(
                inner,
                &kind,
                &meta,
                &builder.filter,
                query,
                column.as_deref(),
                *topk,
            )?;
            project_hits(inner, &meta, &hits)
        }
        Mode::HybridSearch {
            query,
            topk,
            alpha,
            vector_column,
            keyword_column,
            rerank,
        } => hybrid(
            inner,
            &kind,
            &meta,
            &builder.filter,
            query,
            *topk,
            *alpha,
            vector_column.as_deref(),
            keyword_column.as_deref(),
            *rerank,
        ),
        _ => unreachable!("execute_read only handles read modes"),
    }
}

pub(crate) fn execute_count(builder: &QueryBuilder) -> Result<usize> {
    let inner = &builder.client;
    let kind = resolve_target(&inner.schema, &builder.target)?;
    let meta = meta_for(&kind, &inner.schema);
    let compiled = builder.filter.compile(&meta)?;
    let sql = format!(
        "SELECT COUNT(*) FROM \"{}\"{}",
        meta.name, compiled.where_sql
    );
    inner.rel.query_count(&sql, &compiled.params)
}

fn select(
    inner: &ClientInner,
    meta: &TargetMeta,
    columns: Option<&[String]>,
    filter: &Filter,
) -> Result<QueryResult> {
    let projection = match columns {
        Some(columns) => {
            for column in columns {
                if !meta.types.contains_key(column) {
                    return Err(Error::Schema(SchemaError::UnknownColumn {
                        table: meta.name.clone(),
                        column: column.clone(),
                    }));
                }
            }
            columns
                .iter()
                .map(|c| format!("\"{c}\""))
                .collect::<Vec<_>>()
                .join(", ")
        }
        None => "*".to_string(),
    };
    let compiled = filter.compile(meta)?;
    let sql = format!(
        "SELECT {projection} FROM \"{}\"{}{}",
        meta.name, compiled.where_sql, compiled.tail_sql
    );
    let data = inner.rel.query_rows(&sql, &compiled.params, &meta.types)?;
    Ok(QueryResult { data, scores: None })
}

fn keyword_hits(
    inner: &ClientInner,
    kind: &TargetKind<'_>,
    meta: &TargetMeta,
    filter: &Filter,
    query: &str,
    column: Option<&str>,
    topk: usize,
) -> Result<Vec<ScoredId>> {
    let (table, column) = resolve_leg(&inner.schema, kind, column, LegKind::Keyword)?;
    let candidates = candidate_ids(inner, meta, filter)?;
    inner.check_cancelled()?;
    let hits = {
        let conn = inner.rel.lock();
        fts::bm25_search(&conn, &table, &column, query, candidates.as_ref(), topk)?
    };
    Ok(hits
        .into_iter()
        .map(|(id, score)| ScoredId { id, score })
        .collect())
}

fn vector_hits(
    inner: &ClientInner,
    kind: &TargetKind<'_>,
    meta: &TargetMeta,
    filter: &Filter,
    query: &str,
    column: Option<&str>,
    topk: usize,
) -> Result<Vec<ScoredId>> {
    let (table, column) = resolve_leg(&inner.schema, kind, column, LegKind::Vector)?;
    let candidates = candidate_ids(inner, meta, filter)?;
    let query_vector = embed_query(inner, query)?;
    let file = inner.vectors.file(&table, &column)?;
    if query_vector.len() != file.dim() {
        return Err(Error::Schema(SchemaError::DimensionMismatch {
            table,
            column,
            expected: file.dim(),
            got: query_vector.len(),
        }));
    }
    inner.check_cancelled()?;
    let snapshot = file.snapshot()?;
    let mut top = TopK::new(topk);
    for (row_id, _slot, vector) in snapshot.iter_live() {
        if let Some(candidates) = &candidates {
            if !candidates.contains(&row_id) {
                continue;
            }
        }
        top.push(ScoredId {
            id: row_id,
            score: fusion::cosine(&query_vector, vector) as f64,
        });
    }
    Ok(top.into_sorted())
}

#[allow(clippy::too_many_arguments)]
fn hybrid(
    inner: &ClientInner,
    kind: &TargetKind<'_>,
    meta: &TargetMeta,
    filter: &Filter,
    query: &str,
    topk: usize,
    alpha: f64,
    vector_column: Option<&str>,
    keyword_column: Option<&str>,
    rerank: bool,
) -> Result<QueryResult> {
    let pool = (topk * 4).max(inner.options.hybrid_pool_floor);
    let vector = vector_hits(inner, kind, meta, filter, query, vector_column, pool)?;
    let keyword = keyword_hits(inner, kind, meta, filter, query, keyword_column, pool)?;
    let as_pairs = |hits: &[ScoredId]| -> Vec<(i64, f64)> {
        hits.iter().map(|h| (h.id, h.score)).collect()
    };
    let mut fused = fusion::fuse(&as_pairs(&vector), &as_pairs(&keyword), alpha);
    if rerank {
        fused = rerank_hits(inner, kind, meta, query, vector_column, fused, topk)?;
    }
    fused.truncate(topk);
    project_hits(inner, meta, &fused)
}

/// Route the fused candidates through the embedder's reranker; hits keep
/// their fused scores, only the order changes.
fn rerank_hits(
    inner: &ClientInner,
    kind: &TargetKind<'_>,
    meta: &TargetMeta,
    query: &str,
    vector_column: Option<&str>,
    fused: Vec<ScoredId>,
    topk: usize,
) -> Result<Vec<ScoredId>> {
    if fused.is_empty() {
        return Ok(fused);
    }
    let embedder = inner.require_embedder()?;
    let (table, column) = resolve_leg(&inner.schema, kind, vector_column, LegKind::Vector)?;
    let pk = inner
        .schema
        .get_table(&table)
        .ok_or_else(|| SchemaError::UnknownTable(table.clone()))?
        .primary_key()
        .name
        .clone();
    let mut documents = Vec::with_capacity(fused.len());
    for hit in &fused {
        let text: Option<String> = {
            let conn = inner.rel.lock();
            conn.query_row(
                &format!("SELECT \"{column}\" FROM \"{table}\" WHERE \"{pk}\" = ?1"),
                [hit.id],
                |row| row.get(0),
            )
            .optional()
            .map_err(Error::Sqlite)?
        };
        documents.push(text.unwrap_or_default());
    }
    inner.check_cancelled()?;
    let order = embedder.rerank(query, &documents, topk.min(documents.len()))?;
    let mut reordered: Vec<ScoredId> = order
        .into_iter()
        .filter_map(|i| fused.get(i).copied())
        .collect();
    for hit in &fused {
        if !reordered.iter().any(|r| r.id == hit.id) {
            reordered.push(*hit);
        }
    }
    Ok(reordered)
}

fn embed_query(inner: &ClientInner, query: &str) -> Result<Vec<f32>> {
    let embedder = inner.require_embedder()?;
    inner.check_cancelled()?;
    let mut vectors = embedder.embed(&[query.to_string()])?;
    if vectors.len() != 1 {
        return Err(Error::Embedder {
            message: format!("expected 1 query vector, embedder returned {}", vectors.len()),
            retryable: false,
        });
    }
    Ok(vectors.remove(0))
}

/// Fetch the winning rows and lay them out in hit order, with `_score`
/// inlined and the parallel score list attached.
pub(crate) fn project_hits(
    inner: &ClientInner,
    meta: &TargetMeta,
    hits: &[ScoredId],
) -> Result<QueryResult> {
    if hits.is_empty() {
        return Ok(QueryResult {
            data: Vec::new(),
            scores: Some(Vec::new()),
        });
    }
    inner.check_cancelled()?;
    let mut by_id = std::collections::HashMap::with_capacity(hits.len());
    for chunk in hits.chunks(inner.options.max_sql_vars) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!(
            "SELECT * FROM \"{}\" WHERE \"{}\" IN ({placeholders})",
            meta.name, meta.pk
        );
        let params: Vec<rusqlite::types::Value> = chunk
            .iter()
            .map(|h| rusqlite::types::Value::Integer(h.id))
            .collect();
        for row in inner.rel.query_rows(&sql, &params, &meta.types)? {
            if let Some(id) = row.get(&meta.pk).and_then(Value::as_i64) {
                by_id.insert(id, row);
            }
        }
    }
    let mut data = Vec::with_capacity(hits.len());
    let mut scores = Vec::with_capacity(hits.len());
    for hit in hits {
        let Some(mut row) = by_id.remove(&hit.id) else {
            continue;
        };
        row.insert(
            "_score".to_string(),
            serde_json::Number::from_f64(hit.score)
                .map(Value::Number)
                .unwrap_or(Value::Null),
        );
        data.push(row);
        scores.push(hit.score);
    }
    Ok(QueryResult {
        data,
        scores: Some(scores),
    })
}
