//! The in-memory storage backend.

use crate::filter::{Filter, sort_rows};
use crate::table::{Table, no_such_column};
use persistctx_core::{
    BackendError, BackendErrorKind, Entity, Error, JoinClause, Result, Row, SelectStatement,
    Statement, StatementKind, StorageBackend, Value,
};
use std::collections::HashMap;

/// Configuration for an in-memory backend.
#[derive(Debug, Clone, Default)]
pub struct MemoryConfig {
    /// Match LIKE patterns without regard to ASCII case.
    pub case_insensitive_like: bool,
}

impl MemoryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set LIKE case sensitivity.
    pub fn case_insensitive_like(mut self, value: bool) -> Self {
        self.case_insensitive_like = value;
        self
    }
}

/// A failure armed with [`MemoryBackend::fail_next`].
#[derive(Debug, Clone, PartialEq, Eq)]
struct InjectedFailure {
    kind: StatementKind,
    table: String,
}

/// Transaction counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionStats {
    pub begun: usize,
    pub committed: usize,
    pub rolled_back: usize,
}

/// Storage backend keeping tables in process memory.
///
/// Every statement it receives is recorded in a log, so tests can assert
/// exactly which reads and writes a persistence context issued:
///
/// ```rust,ignore
/// let mut backend = MemoryBackend::new();
/// backend.create_table::<Person>()?;
/// let mut ctx = PersistenceContext::new(backend);
/// // ...
/// assert_eq!(ctx.backend().count_of(StatementKind::Select), 1);
/// ```
///
/// Transactions copy every table on `begin` and restore the copy on
/// `rollback`. Key sequences are not rolled back.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    config: MemoryConfig,
    tables: HashMap<String, Table>,
    sequences: HashMap<String, i64>,
    saved: Option<HashMap<String, Table>>,
    log: Vec<Statement>,
    failures: Vec<InjectedFailure>,
    stats: TransactionStats,
}

impl MemoryBackend {
    /// Create an empty backend with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty backend with custom configuration.
    pub fn with_config(config: MemoryConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    // ==================== Schema ====================

    /// Create the table for an entity type from its field descriptors.
    ///
    /// Creating a table that already exists is a no-op.
    pub fn create_table<E: Entity>(&mut self) -> Result<()> {
        let columns = E::column_names().into_iter().map(String::from).collect();
        self.create_table_with(E::TABLE_NAME, columns, E::KEY_COLUMN)
    }

    /// Create a table from an explicit column list.
    pub fn create_table_with(
        &mut self,
        name: &str,
        columns: Vec<String>,
        key_column: &str,
    ) -> Result<()> {
        if self.tables.contains_key(name) {
            tracing::trace!(table = name, "Table already exists");
            return Ok(());
        }
        let table = Table::new(name, columns, key_column)?;
        tracing::debug!(table = name, columns = ?table.columns(), "Created table");
        self.tables.insert(name.to_string(), table);
        Ok(())
    }

    /// Drop a table and its sequence. Returns whether it existed.
    pub fn drop_table(&mut self, name: &str) -> bool {
        self.sequences.remove(name);
        self.tables.remove(name).is_some()
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    /// Number of rows in a table (0 if it does not exist).
    pub fn row_count(&self, name: &str) -> usize {
        self.tables.get(name).map_or(0, Table::len)
    }

    /// Store an entity directly, bypassing the statement log.
    ///
    /// Creates the entity's table on first use.
    pub fn seed<E: Entity>(&mut self, entity: &E) -> Result<()> {
        self.create_table::<E>()?;
        let values: Vec<(String, Value)> = entity
            .to_row()
            .into_iter()
            .map(|(c, v)| (c.to_string(), v))
            .collect();
        let key = self.table_mut(E::TABLE_NAME)?.insert(&values)?;
        self.bump_sequence(E::TABLE_NAME, &key);
        Ok(())
    }

    // ==================== Statement log ====================

    /// Every statement received, oldest first.
    pub fn statements(&self) -> &[Statement] {
        &self.log
    }

    /// Rendered SQL of every statement received.
    pub fn sql_log(&self) -> Vec<String> {
        self.log.iter().map(Statement::to_sql).collect()
    }

    /// How many statements of `kind` were received.
    pub fn count_of(&self, kind: StatementKind) -> usize {
        self.log.iter().filter(|s| s.kind() == kind).count()
    }

    /// Number of reads received.
    pub fn query_count(&self) -> usize {
        self.count_of(StatementKind::Select)
    }

    /// Number of writes received.
    pub fn mutation_count(&self) -> usize {
        self.log.len() - self.query_count()
    }

    /// Forget the statement log.
    pub fn clear_log(&mut self) {
        self.log.clear();
    }

    pub fn transaction_stats(&self) -> TransactionStats {
        self.stats
    }

    pub fn in_transaction(&self) -> bool {
        self.saved.is_some()
    }

    /// Make the next `kind` statement against `table` fail once.
    pub fn fail_next(&mut self, kind: StatementKind, table: impl Into<String>) {
        self.failures.push(InjectedFailure {
            kind,
            table: table.into(),
        });
    }

    // ==================== Internals ====================

    fn table_ref(&self, name: &str) -> Result<&Table> {
        self.tables.get(name).ok_or_else(|| no_such_table(name))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut Table> {
        self.tables.get_mut(name).ok_or_else(|| no_such_table(name))
    }

    fn bump_sequence(&mut self, table: &str, key: &Value) {
        if let Some(k) = key.as_i64() {
            let current = self.sequences.entry(table.to_string()).or_insert(0);
            *current = (*current).max(k);
        }
    }

    fn take_failure(&mut self, statement: &Statement) -> Result<()> {
        let armed = self
            .failures
            .iter()
            .position(|f| f.kind == statement.kind() && f.table == statement.table());
        if let Some(index) = armed {
            self.failures.remove(index);
            tracing::debug!(sql = %statement, "Injected failure");
            return Err(Error::Backend(BackendError {
                kind: BackendErrorKind::Other,
                message: "injected failure".to_string(),
                sql: Some(statement.to_sql()),
            }));
        }
        Ok(())
    }

    fn select(&self, select: &SelectStatement) -> Result<Vec<Row>> {
        let table = self.table_ref(&select.table)?;
        let mut rows: Vec<Row> = match &select.join {
            Some(join) => self.join_rows(table, join)?,
            None => table.rows().collect(),
        };

        let filters = select
            .filters
            .iter()
            .map(|c| Filter::compile(c, self.config.case_insensitive_like))
            .collect::<Result<Vec<_>>>()?;
        let mut kept = Vec::with_capacity(rows.len());
        for row in rows.drain(..) {
            let mut keep = true;
            for filter in &filters {
                if !filter.matches(&row)? {
                    keep = false;
                    break;
                }
            }
            if keep {
                kept.push(row);
            }
        }
        let mut rows = kept;

        if select.count {
            let count = i64::try_from(rows.len()).map_err(|_| {
                Error::backend(BackendErrorKind::Other, "row count overflows i64")
            })?;
            return Ok(vec![Row::new(vec!["count".to_string()], vec![Value::BigInt(count)])]);
        }

        sort_rows(&mut rows, &select.order_by)?;

        let offset = usize::try_from(select.offset.unwrap_or(0)).unwrap_or(usize::MAX);
        let limit = select
            .limit
            .map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX));
        let rows = rows.into_iter().skip(offset).take(limit);

        let projection = self.projection(table, select)?;
        rows.map(|row| project(&row, &projection)).collect()
    }

    /// Base rows extended with `alias.column` values of the joined target
    /// (NULLs when the foreign key is NULL or dangling).
    fn join_rows(&self, base: &Table, join: &JoinClause) -> Result<Vec<Row>> {
        let target = self.table_ref(&join.table)?;
        let local = base.column_index(&join.local_column)?;
        if target.key_column() != join.target_column {
            return Err(Error::backend(
                BackendErrorKind::Unsupported,
                format!(
                    "join must target the key column of '{}' ('{}'), not '{}'",
                    target.name(),
                    target.key_column(),
                    join.target_column
                ),
            ));
        }

        let mut names: Vec<String> = base.columns().to_vec();
        names.extend(
            target
                .columns()
                .iter()
                .map(|c| format!("{}.{}", join.alias, c)),
        );

        let rows = base
            .rows()
            .map(|row| {
                let mut values: Vec<Value> = row.values().cloned().collect();
                let fk = row.get(local).cloned().unwrap_or(Value::Null);
                let found = if fk.is_null() { None } else { target.find(&fk) };
                match found {
                    Some(found) => values.extend(found.values().cloned()),
                    None => values.extend(target.columns().iter().map(|_| Value::Null)),
                }
                Row::new(names.clone(), values)
            })
            .collect();
        Ok(rows)
    }

    /// Output column names and the row columns they are read from.
    fn projection(&self, table: &Table, select: &SelectStatement) -> Result<Vec<String>> {
        let mut names: Vec<String> = if select.columns.is_empty() {
            table.columns().to_vec()
        } else {
            for column in &select.columns {
                table.column_index(column)?;
            }
            select.columns.clone()
        };
        if let Some(join) = &select.join {
            let target = self.table_ref(&join.table)?;
            for column in &join.columns {
                target.column_index(column)?;
                names.push(format!("{}.{}", join.alias, column));
            }
        }
        Ok(names)
    }

    fn mutate(&mut self, statement: &Statement) -> Result<u64> {
        match statement {
            Statement::Insert(insert) => {
                let key = self.table_mut(&insert.table)?.insert(&insert.values)?;
                self.bump_sequence(&insert.table, &key);
                Ok(1)
            }
            Statement::Update(update) => {
                let table = self.table_mut(&update.table)?;
                if table.key_column() != update.key_column {
                    return Err(no_such_column(table.name(), &update.key_column));
                }
                table.update(&update.key, &update.assignments)
            }
            Statement::Delete(delete) => {
                let table = self.table_mut(&delete.table)?;
                if table.key_column() != delete.key_column {
                    return Err(no_such_column(table.name(), &delete.key_column));
                }
                Ok(table.delete(&delete.key))
            }
            Statement::Select(_) => Err(Error::backend(
                BackendErrorKind::Unsupported,
                "SELECT passed to execute_mutation",
            )),
        }
    }
}

fn project(row: &Row, columns: &[String]) -> Result<Row> {
    let values = columns
        .iter()
        .map(|c| {
            row.get_by_name(c).cloned().ok_or_else(|| {
                Error::backend(
                    BackendErrorKind::NoSuchColumn,
                    format!("no column '{c}' in result row"),
                )
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Row::new(columns.to_vec(), values))
}

fn no_such_table(name: &str) -> Error {
    Error::backend(
        BackendErrorKind::NoSuchTable,
        format!("no such table '{name}'"),
    )
}

/// Attach the statement's SQL to backend errors that lack it.
fn with_sql(err: Error, statement: &Statement) -> Error {
    match err {
        Error::Backend(mut e) if e.sql.is_none() => {
            e.sql = Some(statement.to_sql());
            Error::Backend(e)
        }
        other => other,
    }
}

impl StorageBackend for MemoryBackend {
    fn execute_query(&mut self, statement: &Statement) -> Result<Vec<Row>> {
        self.log.push(statement.clone());
        self.take_failure(statement)?;
        let Statement::Select(select) = statement else {
            return Err(Error::backend(
                BackendErrorKind::Unsupported,
                format!("{} passed to execute_query", statement.kind().as_str()),
            ));
        };
        let rows = self.select(select).map_err(|e| with_sql(e, statement))?;
        tracing::trace!(sql = %statement, rows = rows.len(), "Query executed");
        Ok(rows)
    }

    fn execute_mutation(&mut self, statement: &Statement) -> Result<u64> {
        self.log.push(statement.clone());
        self.take_failure(statement)?;
        let affected = self.mutate(statement).map_err(|e| with_sql(e, statement))?;
        tracing::trace!(sql = %statement, affected, "Mutation executed");
        Ok(affected)
    }

    fn next_key(&mut self, table: &str) -> Result<Value> {
        let next = self.sequences.entry(table.to_string()).or_insert(0);
        *next += 1;
        Ok(Value::BigInt(*next))
    }

    fn begin(&mut self) -> Result<()> {
        if self.saved.is_some() {
            return Err(Error::backend(
                BackendErrorKind::Transaction,
                "already in a transaction",
            ));
        }
        self.saved = Some(self.tables.clone());
        self.stats.begun += 1;
        tracing::debug!("BEGIN");
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if self.saved.take().is_none() {
            return Err(Error::backend(
                BackendErrorKind::Transaction,
                "not in a transaction",
            ));
        }
        self.stats.committed += 1;
        tracing::debug!("COMMIT");
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        let Some(saved) = self.saved.take() else {
            return Err(Error::backend(
                BackendErrorKind::Transaction,
                "not in a transaction",
            ));
        };
        self.tables = saved;
        self.stats.rolled_back += 1;
        tracing::debug!("ROLLBACK");
        Ok(())
    }
}
