//! Rows handed back to callers.
//!
//! A [`Row`] keeps every column the server sent, in order, including
//! columns whose value is null ("ghost" columns left behind by deletes).
//! Lookups by name are case-sensitive and return the first match.

use crate::frame::response::result::{ColumnSpec, ColumnType, Rows};
use crate::value::CqlValue;

/// Name of the legacy row-key alias that is lifted out of the columns.
pub const KEY_ALIAS: &str = "KEY";

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub typ: ColumnType,
    /// `None` when the cell is null.
    pub value: Option<CqlValue>,
}

impl Column {
    pub fn is_null(&self) -> bool {
        self.value.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    /// Value of the `KEY` column, when the result started with one.
    pub key: Option<CqlValue>,
    pub columns: Vec<Column>,
}

impl Row {
    /// Pairs each cell with its column spec.
    ///
    /// When the first column is named `KEY` its value becomes [`Row::key`]
    /// and it is left out of [`Row::columns`].
    pub fn from_cells(col_specs: &[ColumnSpec], cells: Vec<Option<CqlValue>>) -> Row {
        let mut columns: Vec<Column> = col_specs
            .iter()
            .zip(cells)
            .map(|(spec, value)| Column {
                name: spec.name.clone(),
                typ: spec.typ.clone(),
                value,
            })
            .collect();

        let key = if columns.first().is_some_and(|c| c.name == KEY_ALIAS) {
            columns.remove(0).value
        } else {
            None
        };

        Row { key, columns }
    }

    /// Number of columns present in the row, null ones included.
    pub fn count(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// First column called exactly `name`.
    pub fn get(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Value of the first column called `name`; `None` if absent or null.
    pub fn get_value(&self, name: &str) -> Option<&CqlValue> {
        self.get(name).and_then(|c| c.value.as_ref())
    }

    pub fn get_by_index(&self, index: usize) -> Option<&Column> {
        self.columns.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Column> {
        self.columns.iter()
    }
}

impl<'a> IntoIterator for &'a Row {
    type Item = &'a Column;
    type IntoIter = std::slice::Iter<'a, Column>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl Rows {
    pub fn into_rows(self) -> Vec<Row> {
        let col_specs = self.metadata.col_specs;
        self.rows
            .into_iter()
            .map(|cells| Row::from_cells(&col_specs, cells))
            .collect()
    }
}
