//! Declarative schema: plain descriptor records built by chainable
//! constructor functions, no macros. A [`Schema`] is handed to
//! [`Client::create`](crate::Client::create) and fingerprinted into the
//! database so later opens can detect drift.

mod view;

pub use view::{ViewDef, ViewField};

use crate::error::{SchemaError, ViewError};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Integer,
    Text,
    Real,
    Boolean,
    Blob,
    Json,
}

impl ColumnType {
    pub(crate) fn sql_decl(&self) -> &'static str {
        match self {
            ColumnType::Integer | ColumnType::Boolean => "INTEGER",
            ColumnType::Text | ColumnType::Json => "TEXT",
            ColumnType::Real => "REAL",
            ColumnType::Blob => "BLOB",
        }
    }
}

/// Embedding configuration for a vector-enabled column.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorSpec {
    /// Provider model identifier; informational, the engine only needs `dim`.
    pub model: String,
    /// Fixed embedding dimension. Ingestion of any other size fails.
    pub dim: usize,
}

impl VectorSpec {
    pub fn new(model: impl Into<String>, dim: usize) -> Self {
        Self {
            model: model.into(),
            dim,
        }
    }

    /// Spec for tests and local experiments; pairs with a mock embedder.
    pub fn mock(dim: usize) -> Self {
        Self::new("mock", dim)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub ty: ColumnType,
    pub primary_key: bool,
    pub nullable: bool,
    pub unique: bool,
    pub indexed: bool,
    pub fts: bool,
    pub vector: Option<VectorSpec>,
    pub default: Option<serde_json::Value>,
    /// Foreign key edge as `(table, column)`; drives view join connectivity.
    pub references: Option<(String, String)>,
}

impl ColumnDef {
    fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            primary_key: false,
            nullable: false,
            unique: false,
            indexed: false,
            fts: false,
            vector: None,
            default: None,
            references: None,
        }
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Integer)
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Text)
    }

    pub fn real(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Real)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Boolean)
    }

    pub fn blob(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Blob)
    }

    pub fn json(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Json)
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    /// Tokenize this column into the full-text index.
    pub fn fts(mut self) -> Self {
        self.fts = true;
        self
    }

    /// Back this column with a vector file of fixed dimension.
    pub fn vector(mut self, spec: VectorSpec) -> Self {
        self.vector = Some(spec);
        self
    }

    pub fn default_value(mut self, value: serde_json::Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn references(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.references = Some((table.into(), column.into()));
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    /// Composite UNIQUE constraints, each a list of column names.
    pub uniques: Vec<Vec<String>>,
}

impl TableDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            uniques: Vec::new(),
        }
    }

    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    pub fn unique_together<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.uniques.push(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn get(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// The designated integer primary key. Validated at schema assembly, so
    /// lookups on a registered table cannot miss.
    pub fn primary_key(&self) -> &ColumnDef {
        self.columns
            .iter()
            .find(|c| c.primary_key)
            .expect("validated table has a primary key")
    }

    pub fn vector_columns(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns.iter().filter(|c| c.vector.is_some())
    }

    pub fn fts_columns(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns.iter().filter(|c| c.fts)
    }

    fn validate(&self) -> Result<(), SchemaError> {
        let invalid = |reason: &str| SchemaError::InvalidTable {
            table: self.name.clone(),
            reason: reason.to_string(),
        };
        let pks: Vec<_> = self.columns.iter().filter(|c| c.primary_key).collect();
        match pks.as_slice() {
            [pk] if pk.ty == ColumnType::Integer => {}
            [_] => return Err(invalid("primary key must be an integer column")),
            [] => return Err(invalid("missing primary key")),
            _ => return Err(invalid("more than one primary key")),
        }
        for column in &self.columns {
            if self.columns.iter().filter(|c| c.name == column.name).count() > 1 {
                return Err(invalid(&format!("duplicate column {}", column.name)));
            }
            if (column.fts || column.vector.is_some()) && column.ty != ColumnType::Text {
                return Err(invalid(&format!(
                    "column {} must be text to carry fts or vector flags",
                    column.name
                )));
            }
            if column.vector.is_some() && column.nullable {
                // A NULL text has no embedding, which would leave the row
                // with neither a live slot nor a tombstone.
                return Err(invalid(&format!(
                    "vector column {} cannot be nullable",
                    column.name
                )));
            }
            if let Some(spec) = &column.vector {
                if spec.dim == 0 {
                    return Err(invalid(&format!(
                        "vector column {} has zero dimension",
                        column.name
                    )));
                }
            }
        }
        for group in &self.uniques {
            for name in group {
                if self.get(name).is_none() {
                    return Err(SchemaError::UnknownColumn {
                        table: self.name.clone(),
                        column: name.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    tables: Vec<TableDef>,
    views: Vec<ViewDef>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(mut self, table: TableDef) -> Result<Self, SchemaError> {
        table.validate()?;
        if self.tables.iter().any(|t| t.name == table.name) {
            return Err(SchemaError::InvalidTable {
                table: table.name,
                reason: "duplicate table name".to_string(),
            });
        }
        for column in &table.columns {
            if let Some((ref_table, ref_column)) = &column.references {
                let target = if ref_table == &table.name {
                    Some(&table)
                } else {
                    self.get_table(ref_table)
                };
                let Some(target) = target else {
                    return Err(SchemaError::UnknownTable(ref_table.clone()));
                };
                if target.get(ref_column).is_none() {
                    return Err(SchemaError::UnknownColumn {
                        table: ref_table.clone(),
                        column: ref_column.clone(),
                    });
                }
            }
        }
        self.tables.push(table);
        Ok(self)
    }

    pub fn view(mut self, view: ViewDef) -> Result<Self, ViewError> {
        view.validate(&self.tables)?;
        self.views.push(view);
        Ok(self)
    }

    pub fn get_table(&self, name: &str) -> Option<&TableDef> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn get_view(&self, name: &str) -> Option<&ViewDef> {
        self.views.iter().find(|v| v.name == name)
    }

    pub fn tables(&self) -> &[TableDef] {
        &self.tables
    }

    pub fn views(&self) -> &[ViewDef] {
        &self.views
    }

    /// Canonical serialized form stored in the database and compared on open.
    pub fn fingerprint(&self) -> String {
        serde_json::to_string(self).expect("schema serializes")
    }
}
