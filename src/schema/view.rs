//! Flat views over joined base tables. A view projects aliased columns out
//! of a set of tables connected by declared foreign-key edges, and can serve
//! as a query target; vector search through a view requires an `id` alias
//! onto the vector-bearing table's primary key.

use super::TableDef;
use crate::error::ViewError;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViewField {
    pub alias: String,
    pub table: String,
    pub column: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViewDef {
    pub name: String,
    pub tables: Vec<String>,
    pub fields: Vec<ViewField>,
}

impl ViewDef {
    pub fn new<S: Into<String>>(
        name: impl Into<String>,
        tables: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            name: name.into(),
            tables: tables.into_iter().map(Into::into).collect(),
            fields: Vec::new(),
        }
    }

    pub fn field(
        mut self,
        alias: impl Into<String>,
        table: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        self.fields.push(ViewField {
            alias: alias.into(),
            table: table.into(),
            column: column.into(),
        });
        self
    }

    pub fn get_field(&self, alias: &str) -> Option<&ViewField> {
        self.fields.iter().find(|f| f.alias == alias)
    }

    pub(crate) fn validate(&self, tables: &[TableDef]) -> Result<(), ViewError> {
        if self.tables.is_empty() {
            return Err(ViewError::DisconnectedJoin {
                view: self.name.clone(),
            });
        }
        let resolve = |name: &str| tables.iter().find(|t| t.name == name);
        for table in &self.tables {
            if resolve(table).is_none() {
                return Err(ViewError::UnknownTable {
                    view: self.name.clone(),
                    table: table.clone(),
                });
            }
        }
        for field in &self.fields {
            let Some(table) = self
                .tables
                .iter()
                .find(|t| **t == field.table)
                .and_then(|t| resolve(t))
            else {
                return Err(ViewError::UnknownTable {
                    view: self.name.clone(),
                    table: field.table.clone(),
                });
            };
            if table.get(&field.column).is_none() {
                return Err(ViewError::UnknownField {
                    view: self.name.clone(),
                    table: field.table.clone(),
                    column: field.column.clone(),
                });
            }
        }
        if !self.is_connected(tables) {
            return Err(ViewError::DisconnectedJoin {
                view: self.name.clone(),
            });
        }
        Ok(())
    }

    /// Union-find over the declared foreign-key edges between participating
    /// tables: every table must end up in one component.
    fn is_connected(&self, tables: &[TableDef]) -> bool {
        if self.tables.len() <= 1 {
            return true;
        }
        let index_of = |name: &str| self.tables.iter().position(|t| t == name);
        let mut parent: Vec<usize> = (0..self.tables.len()).collect();
        fn find(parent: &mut Vec<usize>, i: usize) -> usize {
            if parent[i] != i {
                let root = find(parent, parent[i]);
                parent[i] = root;
            }
            parent[i]
        }
        for (edge_a, edge_b) in self.fk_edges(tables) {
            let (Some(a), Some(b)) = (index_of(&edge_a), index_of(&edge_b)) else {
                continue;
            };
            let (ra, rb) = (find(&mut parent, a), find(&mut parent, b));
            parent[ra] = rb;
        }
        let root = find(&mut parent, 0);
        (1..self.tables.len()).all(|i| find(&mut parent, i) == root)
    }

    fn fk_edges(&self, tables: &[TableDef]) -> Vec<(String, String)> {
        let mut edges = Vec::new();
        for name in &self.tables {
            let Some(table) = tables.iter().find(|t| &t.name == name) else {
                continue;
            };
            for column in &table.columns {
                if let Some((target, _)) = &column.references {
                    if self.tables.contains(target) {
                        edges.push((table.name.clone(), target.clone()));
                    }
                }
            }
        }
        edges
    }

    /// SELECT expansion used for `CREATE VIEW`: aliased projections over the
    /// join of the participating tables along their foreign-key edges.
    pub(crate) fn join_sql(&self, tables: &[TableDef]) -> String {
        let projections: Vec<String> = self
            .fields
            .iter()
            .map(|f| format!("\"{}\".\"{}\" AS \"{}\"", f.table, f.column, f.alias))
            .collect();

        // (child, parent, fk_col, pk_col) for every FK edge between participants.
        let mut edges: Vec<(String, String, String, String)> = Vec::new();
        for name in &self.tables {
            let Some(table) = tables.iter().find(|t| &t.name == name) else {
                continue;
            };
            for column in &table.columns {
                if let Some((target, pk_col)) = &column.references {
                    if self.tables.contains(target) {
                        edges.push((
                            table.name.clone(),
                            target.clone(),
                            column.name.clone(),
                            pk_col.clone(),
                        ));
                    }
                }
            }
        }

        let mut joined = vec![self.tables[0].clone()];
        let mut from = format!("\"{}\"", self.tables[0]);
        while joined.len() < self.tables.len() {
            // Next edge with exactly one endpoint already joined; guaranteed
            // to exist for a validated (connected) view.
            let Some((child, parent, fk_col, pk_col)) = edges
                .iter()
                .find(|(a, b, _, _)| joined.contains(a) != joined.contains(b))
                .cloned()
            else {
                break;
            };
            let newcomer = if joined.contains(&child) {
                parent.clone()
            } else {
                child.clone()
            };
            from.push_str(&format!(
                " JOIN \"{newcomer}\" ON \"{child}\".\"{fk_col}\" = \"{parent}\".\"{pk_col}\""
            ));
            joined.push(newcomer);
        }

        format!("SELECT {} FROM {}", projections.join(", "), from)
    }
}
