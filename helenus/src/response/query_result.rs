use helenus_cql::frame::response::result::{self, ColumnSpec};
use helenus_cql::row::Row;
use thiserror::Error;
use uuid::Uuid;

/// Result of a single query\
/// Contains all rows returned by the database and some more information
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    /// Rows returned by the database.\
    /// Queries like `SELECT` will have `Some(Vec)`, while queries like `INSERT`
    /// or `CREATE TABLE` will have `None`.\
    /// Can contain an empty Vec.
    pub rows: Option<Vec<Row>>,
    /// Warnings returned by the database
    pub warnings: Vec<String>,
    /// CQL Tracing uuid - can only be Some if tracing is enabled for this query
    pub tracing_id: Option<Uuid>,
    /// Column specifications of the returned rows, empty when there are no rows.
    pub col_specs: Vec<ColumnSpec>,
}

impl QueryResult {
    pub(crate) fn from_result(
        result: result::Result,
        warnings: Vec<String>,
        tracing_id: Option<Uuid>,
    ) -> QueryResult {
        match result {
            result::Result::Rows(rows) => {
                let col_specs = rows.metadata.col_specs.clone();
                QueryResult {
                    rows: Some(rows.into_rows()),
                    warnings,
                    tracing_id,
                    col_specs,
                }
            }
            result::Result::Void
            | result::Result::SetKeyspace(_)
            | result::Result::SchemaChange(_) => QueryResult {
                rows: None,
                warnings,
                tracing_id,
                col_specs: Vec::new(),
            },
        }
    }

    /// Whether the statement produced a projection at all.
    pub fn has_rows(&self) -> bool {
        self.rows.is_some()
    }

    /// Returns the number of received rows.\
    /// Fails when the query isn't of a type that could return rows, same as [`rows()`](QueryResult::rows).
    pub fn rows_num(&self) -> Result<usize, RowsExpectedError> {
        match &self.rows {
            Some(rows) => Ok(rows.len()),
            None => Err(RowsExpectedError),
        }
    }

    /// Returns the received rows when present.\
    /// If `QueryResult.rows` is `None`, which means that this query is not supposed to return rows (e.g `INSERT`), returns an error.\
    /// Can return an empty `Vec`.
    pub fn rows(self) -> Result<Vec<Row>, RowsExpectedError> {
        self.rows.ok_or(RowsExpectedError)
    }

    /// Returns `Ok` for a result of a query that shouldn't contain any rows.\
    /// Will return `Ok` for `INSERT` result, but a `SELECT` result, even an empty one, will cause an error.
    pub fn result_not_rows(&self) -> Result<(), RowsNotExpectedError> {
        match self.rows {
            Some(_) => Err(RowsNotExpectedError),
            None => Ok(()),
        }
    }

    /// Returns rows when `QueryResult.rows` is `Some`, otherwise an empty Vec.
    pub fn rows_or_empty(self) -> Vec<Row> {
        self.rows.unwrap_or_default()
    }

    /// Returns first row from the received rows.\
    /// When the first row is not available, returns an error.
    pub fn first_row(self) -> Result<Row, FirstRowError> {
        match self.rows()?.into_iter().next() {
            Some(row) => Ok(row),
            None => Err(FirstRowError::RowsEmpty),
        }
    }

    /// Returns the only received row.\
    /// Fails if the result is anything else than a single row.
    pub fn single_row(self) -> Result<Row, SingleRowError> {
        let mut rows = self.rows()?.into_iter();
        match (rows.next(), rows.len()) {
            (Some(row), 0) => Ok(row),
            (None, _) => Err(SingleRowError::BadNumberOfRows(0)),
            (Some(_), rest) => Err(SingleRowError::BadNumberOfRows(rest + 1)),
        }
    }

    /// Returns a column specification for a column with given name, or None if not found
    pub fn get_column_spec<'a>(&'a self, name: &str) -> Option<(usize, &'a ColumnSpec)> {
        self.col_specs
            .iter()
            .enumerate()
            .find(|(_id, spec)| spec.name == name)
    }
}

/// [`QueryResult::rows()`](QueryResult::rows) or a similar function called on a result without rows.\
/// `QueryResult.rows` is `Some` for queries that can return rows (e.g `SELECT`).\
/// It is `None` for queries that can't return rows (e.g `INSERT`).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error(
    "QueryResult::rows() or similar function called on a result of a statement \
     that does not return rows (e.g. INSERT or CREATE)"
)]
pub struct RowsExpectedError;

/// [`QueryResult::result_not_rows()`](QueryResult::result_not_rows) called on a result with rows.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("QueryResult::result_not_rows() called on a result of a statement that returns rows (e.g. SELECT)")]
pub struct RowsNotExpectedError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FirstRowError {
    #[error(transparent)]
    RowsExpected(#[from] RowsExpectedError),

    /// Rows in `QueryResult` are empty
    #[error("Rows in QueryResult are empty")]
    RowsEmpty,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SingleRowError {
    #[error(transparent)]
    RowsExpected(#[from] RowsExpectedError),

    /// Expected a single row, found other number of rows
    #[error("Expected a single row, found {0} rows")]
    BadNumberOfRows(usize),
}
