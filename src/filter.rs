//! Chainable filter algebra: an immutable list of AND-combined predicates
//! compiled into a parameterized WHERE clause. Values are always bound,
//! never rendered into the SQL text.

use crate::error::{Error, Result, SchemaError};
use crate::schema::ColumnType;
use crate::store::{to_sql_value, TypeMap};
use regex::RegexBuilder;
use rusqlite::types::Value as SqlValue;
use serde_json::Value;

/// Compilation target: a table or a view, its primary-key (or `id` alias)
/// column, and the declared type of every addressable column.
#[derive(Clone, Debug)]
pub(crate) struct TargetMeta {
    pub name: String,
    pub pk: String,
    pub types: TypeMap,
}

impl TargetMeta {
    fn type_of(&self, column: &str) -> Result<ColumnType> {
        self.types.get(column).copied().ok_or_else(|| {
            Error::Schema(SchemaError::UnknownColumn {
                table: self.name.clone(),
                column: column.to_string(),
            })
        })
    }
}

#[derive(Clone, Debug)]
pub(crate) enum Predicate {
    Eq(String, Value),
    Neq(String, Value),
    Gt(String, Value),
    Gte(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    Between(String, Value, Value),
    In(String, Vec<Value>),
    NotIn(String, Vec<Value>),
    IsNull(String),
    IsNotNull(String),
    Contains(String, Value),
    Ilike(String, String),
    Regex(String, String),
}

#[derive(Clone, Debug, Default)]
pub(crate) struct Filter {
    pub predicates: Vec<Predicate>,
    pub order: Option<(String, bool)>,
    pub limit: Option<usize>,
}

pub(crate) struct CompiledFilter {
    /// Empty, or a leading `" WHERE ..."` fragment.
    pub where_sql: String,
    pub params: Vec<SqlValue>,
    /// ORDER BY / LIMIT tail, possibly empty.
    pub tail_sql: String,
}

impl Filter {
    pub fn push(&mut self, predicate: Predicate) {
        self.predicates.push(predicate);
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    pub fn compile(&self, target: &TargetMeta) -> Result<CompiledFilter> {
        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<SqlValue> = Vec::new();
        for predicate in &self.predicates {
            compile_predicate(predicate, target, &mut clauses, &mut params)?;
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };

        let mut tail_sql = String::new();
        if let Some((column, desc)) = &self.order {
            target.type_of(column)?;
            let direction = if *desc { "DESC" } else { "ASC" };
            tail_sql.push_str(&format!(" ORDER BY \"{column}\" {direction}"));
            if !target.pk.is_empty() && column != &target.pk {
                // Stable ordering: ties fall back to the primary key.
                tail_sql.push_str(&format!(", \"{}\" ASC", target.pk));
            }
        }
        if let Some(limit) = self.limit {
            tail_sql.push_str(&format!(" LIMIT {limit}"));
        }

        Ok(CompiledFilter {
            where_sql,
            params,
            tail_sql,
        })
    }
}

fn compile_predicate(
    predicate: &Predicate,
    target: &TargetMeta,
    clauses: &mut Vec<String>,
    params: &mut Vec<SqlValue>,
) -> Result<()> {
    match predicate {
        Predicate::Eq(column, value) | Predicate::Neq(column, value) => {
            let ty = target.type_of(column)?;
            let op = if matches!(predicate, Predicate::Eq(..)) {
                "="
            } else {
                "<>"
            };
            clauses.push(format!("\"{column}\" {op} ?"));
            params.push(to_sql_value(value, Some(ty))?);
        }
        Predicate::Gt(column, value)
        | Predicate::Gte(column, value)
        | Predicate::Lt(column, value)
        | Predicate::Lte(column, value) => {
            let ty = target.type_of(column)?;
            if value.is_null() {
                return Ok(()); // unset bound, predicate skipped
            }
            let op = match predicate {
                Predicate::Gt(..) => ">",
                Predicate::Gte(..) => ">=",
                Predicate::Lt(..) => "<",
                _ => "<=",
            };
            clauses.push(format!("\"{column}\" {op} ?"));
            params.push(to_sql_value(value, Some(ty))?);
        }
        Predicate::Between(column, lo, hi) => {
            let ty = target.type_of(column)?;
            match (lo.is_null(), hi.is_null()) {
                (true, true) => {}
                (false, true) => {
                    clauses.push(format!("\"{column}\" >= ?"));
                    params.push(to_sql_value(lo, Some(ty))?);
                }
                (true, false) => {
                    clauses.push(format!("\"{column}\" <= ?"));
                    params.push(to_sql_value(hi, Some(ty))?);
                }
                (false, false) => {
                    clauses.push(format!("\"{column}\" BETWEEN ? AND ?"));
                    params.push(to_sql_value(lo, Some(ty))?);
                    params.push(to_sql_value(hi, Some(ty))?);
                }
            }
        }
        Predicate::In(column, values) | Predicate::NotIn(column, values) => {
            let ty = target.type_of(column)?;
            let negated = matches!(predicate, Predicate::NotIn(..));
            if values.is_empty() {
                // Vacuously false / vacuously true.
                clauses.push(if negated { "1 = 1" } else { "0 = 1" }.to_string());
                return Ok(());
            }
            let placeholders = vec!["?"; values.len()].join(", ");
            let not = if negated { "NOT " } else { "" };
            clauses.push(format!("\"{column}\" {not}IN ({placeholders})"));
            for value in values {
                params.push(to_sql_value(value, Some(ty))?);
            }
        }
        Predicate::IsNull(column) => {
            target.type_of(column)?;
            clauses.push(format!("\"{column}\" IS NULL"));
        }
        Predicate::IsNotNull(column) => {
            target.type_of(column)?;
            clauses.push(format!("\"{column}\" IS NOT NULL"));
        }
        Predicate::Contains(column, value) => {
            if target.type_of(column)? != ColumnType::Json {
                return Err(Error::FilterType(format!(
                    "contains() requires a json column, {}.{column} is not",
                    target.name
                )));
            }
            if let Value::String(key) = value {
                // Element-in-array for arrays, key-exists for objects.
                clauses.push(format!(
                    "(CASE json_type(\"{column}\") \
                       WHEN 'array' THEN EXISTS (SELECT 1 FROM json_each(\"{column}\") WHERE json_each.value = ?) \
                       WHEN 'object' THEN json_type(\"{column}\", ?) IS NOT NULL \
                       ELSE NULL END)"
                ));
                params.push(SqlValue::Text(key.clone()));
                params.push(SqlValue::Text(format!("$.\"{}\"", key.replace('"', ""))));
            } else {
                // Non-string values can only be array elements.
                clauses.push(format!(
                    "(CASE json_type(\"{column}\") \
                       WHEN 'array' THEN EXISTS (SELECT 1 FROM json_each(\"{column}\") WHERE json_each.value = ?) \
                       ELSE NULL END)"
                ));
                params.push(to_sql_value(value, None)?);
            }
        }
        Predicate::Ilike(column, pattern) => {
            if target.type_of(column)? != ColumnType::Text {
                return Err(Error::FilterType(format!(
                    "ilike() requires a text column, {}.{column} is not",
                    target.name
                )));
            }
            let pattern = if pattern.contains('%') || pattern.contains('_') {
                pattern.clone()
            } else {
                format!("%{pattern}%")
            };
            clauses.push(format!("LOWER(\"{column}\") LIKE LOWER(?)"));
            params.push(SqlValue::Text(pattern));
        }
        Predicate::Regex(column, pattern) => {
            if target.type_of(column)? != ColumnType::Text {
                return Err(Error::FilterType(format!(
                    "regex() requires a text column, {}.{column} is not",
                    target.name
                )));
            }
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|err| Error::BadPattern {
                    pattern: pattern.clone(),
                    reason: err.to_string(),
                })?;
            clauses.push(format!("\"{column}\" REGEXP ?"));
            params.push(SqlValue::Text(pattern.clone()));
        }
    }
    Ok(())
}
