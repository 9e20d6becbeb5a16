//! Row storage for one in-memory table.

use persistctx_core::{
    BackendError, BackendErrorKind, ColumnInfo, DuplicateKeyError, Error, Result, Row, Value,
};
use std::sync::Arc;

/// A table: fixed column list, a key column, and rows in insertion order.
#[derive(Debug, Clone)]
pub struct Table {
    name: String,
    columns: Arc<ColumnInfo>,
    key_index: usize,
    rows: Vec<Vec<Value>>,
}

impl Table {
    /// Create an empty table. The key column must be one of `columns`.
    pub fn new(name: impl Into<String>, columns: Vec<String>, key_column: &str) -> Result<Self> {
        let name = name.into();
        let columns = ColumnInfo::new(columns);
        let key_index = columns
            .index_of(key_column)
            .ok_or_else(|| no_such_column(&name, key_column))?;
        Ok(Self {
            name,
            columns: Arc::new(columns),
            key_index,
            rows: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[String] {
        self.columns.names()
    }

    pub fn key_column(&self) -> &str {
        &self.columns.names()[self.key_index]
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of a column, or a `NoSuchColumn` error.
    pub fn column_index(&self, column: &str) -> Result<usize> {
        self.columns
            .index_of(column)
            .ok_or_else(|| no_such_column(&self.name, column))
    }

    /// All rows, in insertion order.
    pub fn rows(&self) -> impl Iterator<Item = Row> + '_ {
        self.rows
            .iter()
            .map(|values| Row::with_columns(Arc::clone(&self.columns), values.clone()))
    }

    /// The row whose key column matches `key`.
    pub fn find(&self, key: &Value) -> Option<Row> {
        self.position_of(key)
            .map(|i| Row::with_columns(Arc::clone(&self.columns), self.rows[i].clone()))
    }

    fn position_of(&self, key: &Value) -> Option<usize> {
        self.rows
            .iter()
            .position(|values| values[self.key_index].same_key(key))
    }

    /// Insert one row. Columns not mentioned are NULL.
    pub fn insert(&mut self, values: &[(String, Value)]) -> Result<Value> {
        let mut row = vec![Value::Null; self.columns.len()];
        for (column, value) in values {
            row[self.column_index(column)?] = value.clone();
        }
        let key = row[self.key_index].clone();
        if key.is_null() {
            return Err(Error::Backend(BackendError {
                kind: BackendErrorKind::Other,
                message: format!(
                    "NULL value for key column '{}' of table '{}'",
                    self.key_column(),
                    self.name
                ),
                sql: None,
            }));
        }
        if self.position_of(&key).is_some() {
            return Err(Error::DuplicateKey(DuplicateKeyError {
                table: self.name.clone(),
                key,
            }));
        }
        self.rows.push(row);
        Ok(key)
    }

    /// Apply assignments to the row with `key`. Returns rows affected.
    pub fn update(&mut self, key: &Value, assignments: &[(String, Value)]) -> Result<u64> {
        let indexed = assignments
            .iter()
            .map(|(column, value)| Ok((self.column_index(column)?, value)))
            .collect::<Result<Vec<_>>>()?;
        let Some(position) = self.position_of(key) else {
            return Ok(0);
        };
        if let Some((_, new_key)) = indexed.iter().find(|(i, _)| *i == self.key_index) {
            let collides = self
                .position_of(new_key)
                .is_some_and(|other| other != position);
            if collides {
                return Err(Error::DuplicateKey(DuplicateKeyError {
                    table: self.name.clone(),
                    key: (*new_key).clone(),
                }));
            }
        }
        let row = &mut self.rows[position];
        for (index, value) in indexed {
            row[index] = value.clone();
        }
        Ok(1)
    }

    /// Delete the row with `key`. Returns rows affected.
    pub fn delete(&mut self, key: &Value) -> u64 {
        match self.position_of(key) {
            Some(position) => {
                self.rows.remove(position);
                1
            }
            None => 0,
        }
    }
}

pub(crate) fn no_such_column(table: &str, column: &str) -> Error {
    Error::backend(
        BackendErrorKind::NoSuchColumn,
        format!("no column '{column}' in table '{table}'"),
    )
}
