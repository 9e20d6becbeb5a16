//! Storage backend trait.

use crate::Result;
use crate::row::Row;
use crate::statement::Statement;
use crate::value::Value;

/// A store capable of executing structured statements.
///
/// This is the persistence context's only view of the database. Calls are
/// synchronous and statements must be applied in the order they arrive.
/// Transaction hooks default to no-ops for backends without transactions.
///
/// # Example
///
/// ```rust,ignore
/// let rows = backend.execute_query(&Statement::Select(select))?;
/// let affected = backend.execute_mutation(&Statement::Delete(delete))?;
/// ```
pub trait StorageBackend {
    /// Execute a SELECT and return all rows.
    ///
    /// Count selects return one row with a single `count` column.
    fn execute_query(&mut self, statement: &Statement) -> Result<Vec<Row>>;

    /// Execute an INSERT, UPDATE or DELETE and return rows affected.
    ///
    /// An INSERT whose key already exists fails with
    /// [`Error::DuplicateKey`](crate::Error::DuplicateKey).
    fn execute_mutation(&mut self, statement: &Statement) -> Result<u64>;

    /// Draw the next value of the key sequence for `table`.
    fn next_key(&mut self, table: &str) -> Result<Value>;

    /// Begin a transaction.
    fn begin(&mut self) -> Result<()> {
        Ok(())
    }

    /// Commit the current transaction.
    fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    /// Roll back the current transaction.
    fn rollback(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<B: StorageBackend + ?Sized> StorageBackend for &mut B {
    fn execute_query(&mut self, statement: &Statement) -> Result<Vec<Row>> {
        (**self).execute_query(statement)
    }

    fn execute_mutation(&mut self, statement: &Statement) -> Result<u64> {
        (**self).execute_mutation(statement)
    }

    fn next_key(&mut self, table: &str) -> Result<Value> {
        (**self).next_key(table)
    }

    fn begin(&mut self) -> Result<()> {
        (**self).begin()
    }

    fn commit(&mut self) -> Result<()> {
        (**self).commit()
    }

    fn rollback(&mut self) -> Result<()> {
        (**self).rollback()
    }
}

impl<B: StorageBackend + ?Sized> StorageBackend for Box<B> {
    fn execute_query(&mut self, statement: &Statement) -> Result<Vec<Row>> {
        (**self).execute_query(statement)
    }

    fn execute_mutation(&mut self, statement: &Statement) -> Result<u64> {
        (**self).execute_mutation(statement)
    }

    fn next_key(&mut self, table: &str) -> Result<Value> {
        (**self).next_key(table)
    }

    fn begin(&mut self) -> Result<()> {
        (**self).begin()
    }

    fn commit(&mut self) -> Result<()> {
        (**self).commit()
    }

    fn rollback(&mut self) -> Result<()> {
        (**self).rollback()
    }
}
