//! Named statements with named-parameter binding.
//!
//! A [`QueryBinder`] holds a fixed map of operation names to SQL text for one
//! store. Statements use `:name` placeholders; at execution time these are
//! rewritten to the driver's positional form (`?` for MySQL and SQLite, `$n`
//! for PostgreSQL) and the values are bound in placeholder order. A bound
//! list value expands in place, so `IN (:codes)` works for any list length.
//!
//! Result rows deserialize into typed records through their camelCase
//! projection; a `sys_dict` row with `dict_parent_id` lands in a struct
//! field serialized as `dictParentId` with no per-field mapping.

use crate::config::Driver;
use crate::db::params::QueryParam;
use crate::db::transaction::TxHandle;
use crate::error::{StoreError, StoreResult};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// A value bound to a named placeholder.
#[derive(Debug, Clone)]
pub enum BindValue {
    Value(QueryParam),
    /// Expands into one placeholder per element, for `IN (:name)` clauses.
    List(Vec<QueryParam>),
}

impl BindValue {
    pub fn list<I, T>(values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<QueryParam>,
    {
        BindValue::List(values.into_iter().map(Into::into).collect())
    }
}

impl From<QueryParam> for BindValue {
    fn from(v: QueryParam) -> Self {
        BindValue::Value(v)
    }
}

impl From<i64> for BindValue {
    fn from(v: i64) -> Self {
        BindValue::Value(QueryParam::Int(v))
    }
}

impl From<i32> for BindValue {
    fn from(v: i32) -> Self {
        BindValue::Value(QueryParam::Int(v as i64))
    }
}

impl From<&str> for BindValue {
    fn from(v: &str) -> Self {
        BindValue::Value(QueryParam::String(v.to_string()))
    }
}

impl From<String> for BindValue {
    fn from(v: String) -> Self {
        BindValue::Value(QueryParam::String(v))
    }
}

impl From<bool> for BindValue {
    fn from(v: bool) -> Self {
        BindValue::Value(QueryParam::Bool(v))
    }
}

/// Rewrite `:name` placeholders to the driver's positional form and collect
/// the bound values in placeholder order.
///
/// Single-quoted literals are left untouched, as is the PostgreSQL `::` cast
/// operator. An unbound name or an empty bound list is a configuration error.
pub(crate) fn bind_named(
    driver: Driver,
    sql: &str,
    params: &[(&str, BindValue)],
) -> StoreResult<(String, Vec<QueryParam>)> {
    let mut out = String::with_capacity(sql.len());
    let mut bound: Vec<QueryParam> = Vec::new();
    let mut placeholder_idx = 0usize;
    let mut in_string = false;

    let mut chars = sql.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if in_string {
            out.push(c);
            if c == '\'' {
                in_string = false;
            }
            continue;
        }
        match c {
            '\'' => {
                in_string = true;
                out.push(c);
            }
            ':' => {
                if matches!(chars.peek(), Some((_, ':'))) {
                    chars.next();
                    out.push_str("::");
                    continue;
                }
                let start = i + 1;
                let mut end = start;
                while let Some(&(j, nc)) = chars.peek() {
                    if nc.is_ascii_alphanumeric() || nc == '_' {
                        end = j + nc.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                if end == start {
                    out.push(':');
                    continue;
                }
                let name = &sql[start..end];
                let value = params
                    .iter()
                    .find(|(n, _)| *n == name)
                    .map(|(_, v)| v)
                    .ok_or_else(|| {
                        StoreError::configuration(format!(
                            "No value bound for parameter ':{}'",
                            name
                        ))
                    })?;
                match value {
                    BindValue::Value(param) => {
                        placeholder_idx += 1;
                        push_placeholder(&mut out, driver, placeholder_idx);
                        bound.push(param.clone());
                    }
                    BindValue::List(items) => {
                        if items.is_empty() {
                            return Err(StoreError::configuration(format!(
                                "Parameter ':{}' expands to an empty list",
                                name
                            )));
                        }
                        for (k, item) in items.iter().enumerate() {
                            if k > 0 {
                                out.push_str(", ");
                            }
                            placeholder_idx += 1;
                            push_placeholder(&mut out, driver, placeholder_idx);
                            bound.push(item.clone());
                        }
                    }
                }
            }
            _ => out.push(c),
        }
    }
    Ok((out, bound))
}

fn push_placeholder(out: &mut String, driver: Driver, idx: usize) {
    match driver {
        Driver::Postgres => {
            out.push('$');
            out.push_str(&idx.to_string());
        }
        Driver::MySql | Driver::Sqlite => out.push('?'),
    }
}

/// Builder for a store's statement map.
pub struct QueryBinderBuilder {
    driver: Driver,
    statements: HashMap<String, String>,
}

impl QueryBinderBuilder {
    pub fn statement(mut self, op: impl Into<String>, sql: impl Into<String>) -> Self {
        self.statements.insert(op.into(), sql.into());
        self
    }

    pub fn build(self) -> QueryBinder {
        QueryBinder {
            driver: self.driver,
            statements: self.statements,
        }
    }
}

/// Named-statement executor for one store.
pub struct QueryBinder {
    driver: Driver,
    statements: HashMap<String, String>,
}

impl QueryBinder {
    pub fn builder(driver: Driver) -> QueryBinderBuilder {
        QueryBinderBuilder {
            driver,
            statements: HashMap::new(),
        }
    }

    pub fn driver(&self) -> Driver {
        self.driver
    }

    fn sql(&self, op: &str) -> StoreResult<&str> {
        self.statements.get(op).map(String::as_str).ok_or_else(|| {
            StoreError::configuration(format!("No statement mapped for operation '{}'", op))
        })
    }

    /// Run a mapped query and deserialize every row.
    pub async fn fetch_all<T: DeserializeOwned>(
        &self,
        tx: &TxHandle,
        op: &str,
        params: &[(&str, BindValue)],
    ) -> StoreResult<Vec<T>> {
        let (sql, bound) = bind_named(self.driver, self.sql(op)?, params)?;
        let rows = tx.fetch_all(&sql, &bound).await?;
        rows.into_iter()
            .map(|row| {
                serde_json::from_value(JsonValue::Object(row)).map_err(|e| {
                    StoreError::internal(format!(
                        "Failed to map result row for operation '{}': {}",
                        op, e
                    ))
                })
            })
            .collect()
    }

    /// Run a mapped query expected to produce at most one row.
    ///
    /// No matching row is `Ok(None)`.
    pub async fn fetch_optional<T: DeserializeOwned>(
        &self,
        tx: &TxHandle,
        op: &str,
        params: &[(&str, BindValue)],
    ) -> StoreResult<Option<T>> {
        let mut records: Vec<T> = self.fetch_all(tx, op, params).await?;
        if records.is_empty() {
            Ok(None)
        } else {
            Ok(Some(records.swap_remove(0)))
        }
    }

    /// Run a mapped statement, returning the affected row count.
    pub async fn execute(
        &self,
        tx: &TxHandle,
        op: &str,
        params: &[(&str, BindValue)],
    ) -> StoreResult<u64> {
        let (sql, bound) = bind_named(self.driver, self.sql(op)?, params)?;
        tx.execute(&sql, &bound).await
    }
}
