//! Data source collaborator contract.
//!
//! The engine never talks to a database directly. It compiles
//! [`QueryDefinition`]s and hands them to a host-supplied [`QueryExecutor`],
//! which streams back [`QueryRow`]s.

use std::fmt::Write as _;

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde_json::{Map, Value};
use tree_visibility_core::{CancellationToken, Id64, IdSet, Result, VisibilityError};

/// Value bound to a named query parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingValue {
    /// Passed to `InVirtualSet(:name, …)`.
    IdSet(IdSet),
}

/// A named query parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryBinding {
    pub name: String,
    pub value: BindingValue,
}

impl QueryBinding {
    pub fn id_set(name: impl Into<String>, ids: IdSet) -> Self {
        Self {
            name: name.into(),
            value: BindingValue::IdSet(ids),
        }
    }
}

/// A query: common table expressions plus the main statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryDefinition {
    pub ctes: Vec<String>,
    pub ecsql: String,
    pub bindings: Vec<QueryBinding>,
}

impl QueryDefinition {
    pub fn new(ecsql: impl Into<String>) -> Self {
        Self {
            ecsql: ecsql.into(),
            ..Self::default()
        }
    }

    pub fn with_cte(mut self, cte: impl Into<String>) -> Self {
        self.ctes.push(cte.into());
        self
    }

    pub fn with_binding(mut self, binding: QueryBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    /// Look up a binding by name.
    pub fn binding(&self, name: &str) -> Option<&BindingValue> {
        self.bindings.iter().find(|b| b.name == name).map(|b| &b.value)
    }

    /// Render the full statement text.
    pub fn to_sql(&self) -> String {
        if self.ctes.is_empty() {
            return self.ecsql.clone();
        }
        let mut sql = String::from("WITH RECURSIVE\n");
        for (i, cte) in self.ctes.iter().enumerate() {
            if i > 0 {
                sql.push_str(",\n");
            }
            let _ = write!(sql, "  {cte}");
        }
        sql.push('\n');
        sql.push_str(&self.ecsql);
        sql
    }
}

/// Execution options of one query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Fail if the query yields more rows than this.
    pub row_limit: Option<usize>,
    /// Starting a query with the same token cancels the previous one.
    pub restart_token: Option<String>,
}

impl QueryOptions {
    pub fn with_restart_token(mut self, token: impl Into<String>) -> Self {
        self.restart_token = Some(token.into());
        self
    }

    pub fn with_row_limit(mut self, limit: usize) -> Self {
        self.row_limit = Some(limit);
        self
    }
}

/// One result row with named columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRow {
    columns: Map<String, Value>,
}

impl QueryRow {
    pub fn new(columns: Map<String, Value>) -> Self {
        Self { columns }
    }

    /// Build a row from `(column, value)` pairs.
    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Self {
            columns: pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.get(column)
    }

    /// Read an id column. Ids may be hex strings or numbers.
    pub fn id(&self, column: &str) -> Result<Id64> {
        self.opt_id(column)?
            .ok_or_else(|| VisibilityError::query(format!("column '{column}' is null or missing")))
    }

    /// Read a nullable id column.
    pub fn opt_id(&self, column: &str) -> Result<Option<Id64>> {
        match self.columns.get(column) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => s
                .parse()
                .map(Some)
                .map_err(|_| VisibilityError::query(format!("column '{column}' holds invalid id '{s}'"))),
            Some(Value::Number(n)) => n
                .as_u64()
                .map(|v| Some(Id64::new(v)))
                .ok_or_else(|| VisibilityError::query(format!("column '{column}' holds invalid id {n}"))),
            Some(other) => Err(VisibilityError::query(format!(
                "column '{column}' holds {other} instead of an id"
            ))),
        }
    }

    pub fn u64(&self, column: &str) -> Result<u64> {
        match self.columns.get(column) {
            Some(Value::Number(n)) => n
                .as_u64()
                .ok_or_else(|| VisibilityError::query(format!("column '{column}' is not an unsigned integer"))),
            Some(Value::Null) | None => Ok(0),
            Some(other) => Err(VisibilityError::query(format!(
                "column '{column}' holds {other} instead of a count"
            ))),
        }
    }

    pub fn str(&self, column: &str) -> Result<&str> {
        self.columns
            .get(column)
            .and_then(Value::as_str)
            .ok_or_else(|| VisibilityError::query(format!("column '{column}' is not a string")))
    }
}

/// Executes queries against the host's data source.
pub trait QueryExecutor: Send + Sync {
    /// Start executing `query`. Rows are produced lazily.
    fn create_query_reader(
        &self,
        query: &QueryDefinition,
        options: &QueryOptions,
    ) -> BoxStream<'static, Result<QueryRow>>;
}

/// Drain a query reader into a vector.
///
/// Cancellation is checked between rows; a `row_limit` violation fails the
/// whole query.
pub async fn collect_rows(
    executor: &dyn QueryExecutor,
    query: &QueryDefinition,
    options: &QueryOptions,
    cancel: &CancellationToken,
) -> Result<Vec<QueryRow>> {
    cancel.check()?;
    let mut reader = executor.create_query_reader(query, options);
    let mut rows = Vec::new();
    while let Some(row) = reader.next().await {
        cancel.check()?;
        rows.push(row?);
        if options.row_limit.is_some_and(|limit| rows.len() > limit) {
            return Err(VisibilityError::query("row limit exceeded"));
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use serde_json::json;

    struct StaticRows(Vec<QueryRow>);

    impl QueryExecutor for StaticRows {
        fn create_query_reader(
            &self,
            _query: &QueryDefinition,
            _options: &QueryOptions,
        ) -> BoxStream<'static, Result<QueryRow>> {
            stream::iter(self.0.clone().into_iter().map(Ok)).boxed()
        }
    }

    fn row(id: u64) -> QueryRow {
        QueryRow::from_pairs([("Id", json!(format!("0x{id:x}")))])
    }

    #[test]
    fn test_to_sql_with_ctes() {
        let query = QueryDefinition::new("SELECT * FROM a")
            .with_cte("a(Id) AS (SELECT 1)")
            .with_cte("b(Id) AS (SELECT 2)");
        assert_eq!(
            query.to_sql(),
            "WITH RECURSIVE\n  a(Id) AS (SELECT 1),\n  b(Id) AS (SELECT 2)\nSELECT * FROM a"
        );
        assert_eq!(QueryDefinition::new("SELECT 1").to_sql(), "SELECT 1");
    }

    #[test]
    fn test_row_getters() {
        let row = QueryRow::from_pairs([
            ("A", json!("0x10")),
            ("B", json!(17)),
            ("C", Value::Null),
            ("D", json!("text")),
        ]);
        assert_eq!(row.id("A").unwrap(), Id64::new(16));
        assert_eq!(row.id("B").unwrap(), Id64::new(17));
        assert_eq!(row.opt_id("C").unwrap(), None);
        assert!(row.id("C").is_err());
        assert_eq!(row.u64("B").unwrap(), 17);
        assert_eq!(row.str("D").unwrap(), "text");
        assert!(row.id("D").is_err());
    }

    #[tokio::test]
    async fn test_collect_rows_row_limit() {
        let executor = StaticRows(vec![row(1), row(2), row(3)]);
        let query = QueryDefinition::new("SELECT Id FROM x");
        let cancel = CancellationToken::new();

        let rows = collect_rows(&executor, &query, &QueryOptions::default(), &cancel)
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);

        let limited = QueryOptions::default().with_row_limit(2);
        assert_eq!(
            collect_rows(&executor, &query, &limited, &cancel).await,
            Err(VisibilityError::query("row limit exceeded"))
        );
    }

    #[tokio::test]
    async fn test_collect_rows_cancelled() {
        let executor = StaticRows(vec![row(1)]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(
            collect_rows(&executor, &QueryDefinition::new("x"), &QueryOptions::default(), &cancel).await,
            Err(VisibilityError::Cancelled)
        );
    }
}
