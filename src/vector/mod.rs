//! Vector side of the engine: one [`file::VectorFile`] per vector-enabled
//! column, plus the open-time reconciliation that keeps the relational row
//! set and the vector slots agreeing after a crash.

pub(crate) mod file;
pub(crate) mod intent;
pub(crate) mod outbox;

use crate::error::{Error, Remedy, Result, SchemaError};
use crate::schema::Schema;
use crate::store::RelStore;
use file::VectorFile;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub(crate) const VECTORS_DIR: &str = "vectors";

pub(crate) struct VectorStore {
    dir: PathBuf,
    files: HashMap<(String, String), VectorFile>,
}

impl VectorStore {
    pub fn create(db_dir: &Path, schema: &Schema) -> Result<Self> {
        Self::build(db_dir, schema, VectorFile::create)
    }

    pub fn open(db_dir: &Path, schema: &Schema) -> Result<Self> {
        Self::build(db_dir, schema, VectorFile::open)
    }

    fn build(
        db_dir: &Path,
        schema: &Schema,
        init: fn(&Path, &str, &str, usize) -> Result<VectorFile>,
    ) -> Result<Self> {
        let dir = db_dir.join(VECTORS_DIR);
        std::fs::create_dir_all(&dir)?;
        let mut files = HashMap::new();
        for table in schema.tables() {
            for column in table.vector_columns() {
                let spec = column.vector.as_ref().expect("vector column has a spec");
                let file = init(&dir, &table.name, &column.name, spec.dim)?;
                files.insert((table.name.clone(), column.name.clone()), file);
            }
        }
        Ok(Self { dir, files })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file(&self, table: &str, column: &str) -> Result<&VectorFile> {
        self.files
            .get(&(table.to_string(), column.to_string()))
            .ok_or_else(|| {
                Error::Schema(SchemaError::NotVectorColumn {
                    table: table.to_string(),
                    column: column.to_string(),
                })
            })
    }

    /// Replay any surviving intent log, then verify membership agreement
    /// between rows, live slots and FTS entries.
    pub fn reconcile(&self, rel: &RelStore, schema: &Schema) -> Result<()> {
        for ((table, column), file) in &self.files {
            let log_path = intent::log_path(&self.dir, &VectorFile::stem(table, column));
            let Some((base_slots, entries)) = intent::read(&log_path)? else {
                continue;
            };
            let pk = schema
                .get_table(table)
                .ok_or_else(|| SchemaError::UnknownTable(table.clone()))?
                .primary_key()
                .name
                .clone();
            let committed = if entries.is_empty() {
                true
            } else {
                // All rows of the batch shared one transaction; presence of
                // the first decides which side of the commit we died on.
                rel.query_count(
                    &format!("SELECT COUNT(*) FROM \"{table}\" WHERE \"{pk}\" = ?1"),
                    &[rusqlite::types::Value::Integer(entries[0].0)],
                )? > 0
            };
            if committed {
                let applied = file.slot_count().saturating_sub(base_slots as usize);
                if applied < entries.len() {
                    tracing::debug!(
                        %table,
                        %column,
                        missing = entries.len() - applied,
                        "intent replay: re-appending lost vectors"
                    );
                    file.append_batch(&entries[applied..])?;
                }
                file.sync_all()?;
            } else {
                tracing::debug!(%table, %column, base_slots, "intent replay: truncating stray appends");
                file.truncate_to(base_slots as usize)?;
            }
            intent::clear(&log_path)?;
        }
        self.verify(rel, schema)
    }

    fn verify(&self, rel: &RelStore, schema: &Schema) -> Result<()> {
        for table in schema.tables() {
            for column in table.vector_columns() {
                let file = self.file(&table.name, &column.name)?;
                let rows =
                    rel.query_count(&format!("SELECT COUNT(*) FROM \"{}\"", table.name), &[])?;
                let pending = outbox::read_all(&outbox_path_for(
                    &self.dir,
                    &table.name,
                    &column.name,
                ))?
                .len();
                let live = file.live_count();
                if live + pending != rows {
                    return Err(Error::Consistency {
                        detail: format!(
                            "{}.{}: {rows} rows vs {live} live vector slots ({pending} pending in outbox)",
                            table.name, column.name
                        ),
                        hint: Remedy::Reconcile,
                    });
                }
            }
            for column in table.fts_columns() {
                let entries = {
                    let conn = rel.lock();
                    crate::store::fts::count_entries(&conn, &table.name, &column.name)?
                };
                let rows = rel.query_count(
                    &format!(
                        "SELECT COUNT(*) FROM \"{}\" WHERE \"{}\" IS NOT NULL",
                        table.name, column.name
                    ),
                    &[],
                )?;
                if entries as usize != rows {
                    return Err(Error::Consistency {
                        detail: format!(
                            "{}.{}: {rows} rows vs {entries} full-text entries",
                            table.name, column.name
                        ),
                        hint: Remedy::Reconcile,
                    });
                }
            }
        }
        Ok(())
    }
}

pub(crate) fn outbox_path_for(dir: &Path, table: &str, column: &str) -> PathBuf {
    outbox::outbox_path(dir, &VectorFile::stem(table, column))
}

pub(crate) fn intent_log_path_for(dir: &Path, table: &str, column: &str) -> PathBuf {
    intent::log_path(dir, &VectorFile::stem(table, column))
}
