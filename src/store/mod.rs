//! Relational store: a single rusqlite connection behind a mutex, with the
//! schema compiled to DDL at create time and fingerprint-checked on open.

pub(crate) mod fts;

use crate::config::ClientOptions;
use crate::error::{Error, Result, SchemaError};
use crate::schema::{ColumnType, Schema, TableDef};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::{Mutex, MutexGuard};
use regex::RegexBuilder;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, OpenFlags};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub(crate) const DB_FILE: &str = "sqlite.db";
const META_TABLE: &str = "_veclite_meta";
pub(crate) const TEXT_HASH_TABLE: &str = "_veclite_text_hash";

/// Column name → declared type, used to coerce SQL values back to JSON.
pub(crate) type TypeMap = HashMap<String, ColumnType>;

pub(crate) type Row = Map<String, Value>;

#[derive(Debug)]
pub(crate) struct RelStore {
    conn: Mutex<Connection>,
    #[allow(dead_code)]
    path: PathBuf,
}

impl RelStore {
    pub fn create(dir: &Path, schema: &Schema, options: &ClientOptions) -> Result<Self> {
        let path = dir.join(DB_FILE);
        if path.exists() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("{} already exists", path.display()),
            )));
        }
        let conn = Self::connect(&path, options)?;
        Self::init_schema(&conn, schema)?;
        tracing::info!(path = %path.display(), tables = schema.tables().len(), "created store");
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn open(dir: &Path, schema: &Schema, options: &ClientOptions) -> Result<Self> {
        let path = dir.join(DB_FILE);
        if !path.exists() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} not found", path.display()),
            )));
        }
        let conn = Self::connect(&path, options)?;
        Self::verify_fingerprint(&conn, schema)?;
        tracing::info!(path = %path.display(), "opened store");
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    fn connect(path: &Path, options: &ClientOptions) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        if options.wal {
            conn.pragma_update(None, "journal_mode", "WAL")?;
        }
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_millis(options.busy_timeout_ms))?;
        register_regexp(&conn)?;
        Ok(conn)
    }

    fn init_schema(conn: &Connection, schema: &Schema) -> Result<()> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {META_TABLE} (key TEXT PRIMARY KEY, value TEXT NOT NULL);
             CREATE TABLE IF NOT EXISTS {TEXT_HASH_TABLE} (
                 tbl TEXT NOT NULL,
                 col TEXT NOT NULL,
                 row_id INTEGER NOT NULL,
                 hash TEXT NOT NULL,
                 PRIMARY KEY (tbl, col, row_id)
             );"
        ))?;
        for table in schema.tables() {
            conn.execute_batch(&table_ddl(table))?;
            for column in table.fts_columns() {
                fts::create_table(conn, &table.name, &column.name)?;
            }
        }
        for view in schema.views() {
            conn.execute_batch(&format!(
                "CREATE VIEW IF NOT EXISTS \"{}\" AS {};",
                view.name,
                view.join_sql(schema.tables())
            ))?;
        }
        conn.execute(
            &format!("INSERT OR REPLACE INTO {META_TABLE} (key, value) VALUES ('schema', ?1)"),
            [schema.fingerprint()],
        )?;
        Ok(())
    }

    fn verify_fingerprint(conn: &Connection, schema: &Schema) -> Result<()> {
        let stored: String = conn
            .query_row(
                &format!("SELECT value FROM {META_TABLE} WHERE key = 'schema'"),
                [],
                |row| row.get(0),
            )
            .map_err(|_| {
                SchemaError::FingerprintMismatch("database has no stored schema".to_string())
            })?;
        if stored != schema.fingerprint() {
            return Err(SchemaError::FingerprintMismatch(
                "supplied schema differs from the one the database was created with".to_string(),
            )
            .into());
        }
        Ok(())
    }

    /// Scoped connection acquisition; callers hold the guard for the whole
    /// multi-statement operation.
    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    pub fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(sql)?;
        Ok(stmt.execute(rusqlite::params_from_iter(params.iter()))?)
    }

    pub fn query_rows(&self, sql: &str, params: &[SqlValue], types: &TypeMap) -> Result<Vec<Row>> {
        query_rows_on(&self.lock(), sql, params, types)
    }

    pub fn query_ids(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<i64>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<i64>>>()?)
    }

    pub fn query_count(&self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        let conn = self.lock();
        let count: i64 = conn.query_row(sql, rusqlite::params_from_iter(params.iter()), |row| {
            row.get(0)
        })?;
        Ok(count as usize)
    }

    pub fn begin(&self) -> Result<()> {
        self.lock().execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        self.lock().execute_batch("COMMIT")?;
        Ok(())
    }

    pub fn rollback(&self) -> Result<()> {
        self.lock().execute_batch("ROLLBACK")?;
        Ok(())
    }
}

pub(crate) fn query_rows_on(
    conn: &Connection,
    sql: &str,
    params: &[SqlValue],
    types: &TypeMap,
) -> Result<Vec<Row>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut map = Map::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            let value = from_sql_ref(row.get_ref(i)?, types.get(name).copied());
            map.insert(name.clone(), value);
        }
        out.push(map);
    }
    Ok(out)
}

/// Convert a JSON value to a SQL binding, honoring the declared column type
/// when one is known (blob columns take base64 strings, json columns take
/// any JSON value).
pub(crate) fn to_sql_value(value: &Value, ty: Option<ColumnType>) -> Result<SqlValue> {
    if ty == Some(ColumnType::Json) && !value.is_null() {
        if let Value::String(s) = value {
            // A pre-serialized JSON string passes through unchanged.
            return Ok(SqlValue::Text(s.clone()));
        }
        return Ok(SqlValue::Text(value.to_string()));
    }
    Ok(match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else {
                SqlValue::Real(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => {
            if ty == Some(ColumnType::Blob) {
                let bytes = BASE64.decode(s.as_bytes()).map_err(|err| {
                    Error::FilterType(format!("blob value is not valid base64: {err}"))
                })?;
                SqlValue::Blob(bytes)
            } else {
                SqlValue::Text(s.clone())
            }
        }
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    })
}

pub(crate) fn from_sql_ref(value: ValueRef<'_>, ty: Option<ColumnType>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => match ty {
            Some(ColumnType::Boolean) => Value::Bool(i != 0),
            _ => Value::Number(i.into()),
        },
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => {
            let text = String::from_utf8_lossy(bytes).into_owned();
            match ty {
                Some(ColumnType::Json) => {
                    serde_json::from_str(&text).unwrap_or(Value::String(text))
                }
                _ => Value::String(text),
            }
        }
        ValueRef::Blob(bytes) => Value::String(BASE64.encode(bytes)),
    }
}

fn table_ddl(table: &TableDef) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(table.columns.len() + 2);
    for column in &table.columns {
        let mut decl = format!("\"{}\" {}", column.name, column.ty.sql_decl());
        if column.primary_key {
            decl.push_str(" PRIMARY KEY");
        } else {
            if !column.nullable {
                decl.push_str(" NOT NULL");
            }
            if column.unique {
                decl.push_str(" UNIQUE");
            }
        }
        if let Some(default) = &column.default {
            decl.push_str(&format!(" DEFAULT {}", sql_literal(default)));
        }
        parts.push(decl);
    }
    for group in &table.uniques {
        let cols: Vec<String> = group.iter().map(|c| format!("\"{c}\"")).collect();
        parts.push(format!("UNIQUE ({})", cols.join(", ")));
    }
    for column in &table.columns {
        if let Some((ref_table, ref_column)) = &column.references {
            parts.push(format!(
                "FOREIGN KEY (\"{}\") REFERENCES \"{ref_table}\" (\"{ref_column}\")",
                column.name
            ));
        }
    }
    let mut ddl = format!(
        "CREATE TABLE IF NOT EXISTS \"{}\" ({});",
        table.name,
        parts.join(", ")
    );
    for column in &table.columns {
        if column.indexed {
            ddl.push_str(&format!(
                "\nCREATE INDEX IF NOT EXISTS \"idx_{0}_{1}\" ON \"{0}\" (\"{1}\");",
                table.name, column.name
            ));
        }
    }
    ddl
}

/// DEFAULT clauses are the only place a value is rendered textually; they
/// come from the schema, never from user input.
fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Value::Number(n) => n.to_string(),
        other => {
            let text = match other {
                Value::String(s) => s.clone(),
                _ => other.to_string(),
            };
            format!("'{}'", text.replace('\'', "''"))
        }
    }
}

fn register_regexp(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "regexp",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        move |ctx| {
            let pattern: std::sync::Arc<regex::Regex> = ctx.get_or_create_aux(
                0,
                |vr| -> std::result::Result<_, Box<dyn std::error::Error + Send + Sync + 'static>> {
                    Ok(RegexBuilder::new(vr.as_str()?)
                        .case_insensitive(true)
                        .build()?)
                },
            )?;
            let matched = match ctx.get_raw(1) {
                ValueRef::Text(bytes) => pattern.is_match(&String::from_utf8_lossy(bytes)),
                _ => false,
            };
            Ok(matched)
        },
    )
}
