//! Write-behind queue and flush execution.
//!
//! Mutations are not sent to the backend when they are requested. They are
//! appended to a [`WriteBehindQueue`] and executed strictly in queue order
//! when the context flushes.

use crate::identity_map::ObjectKey;
use persistctx_core::{Error, FlushError, Result, Statement, StatementKind, StorageBackend};
use std::collections::VecDeque;

/// A pending mutation together with the entity it was queued for.
#[derive(Debug, Clone)]
pub struct QueuedStatement {
    pub statement: Statement,
    pub entity: &'static str,
    pub key: ObjectKey,
}

impl QueuedStatement {
    pub fn kind(&self) -> StatementKind {
        self.statement.kind()
    }
}

/// Ordered pending mutations of one unit of work.
#[derive(Debug, Default)]
pub struct WriteBehindQueue {
    items: VecDeque<QueuedStatement>,
}

impl WriteBehindQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a statement at the end of the queue.
    pub fn push(&mut self, item: QueuedStatement) {
        tracing::trace!(
            entity = item.entity,
            kind = item.kind().as_str(),
            position = self.items.len(),
            "Queued statement"
        );
        self.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedStatement> {
        self.items.iter()
    }

    /// Whether a delete for `key` is still waiting to be executed.
    pub fn has_pending_delete(&self, key: &ObjectKey) -> bool {
        self.items
            .iter()
            .any(|q| q.kind() == StatementKind::Delete && &q.key == key)
    }

    /// Drop the statements queued for one entity. Returns how many were dropped.
    pub fn discard_for(&mut self, key: &ObjectKey) -> usize {
        let before = self.items.len();
        self.items.retain(|q| &q.key != key);
        before - self.items.len()
    }

    /// Discard every pending statement. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let n = self.items.len();
        self.items.clear();
        n
    }

    /// Send every queued statement to `backend`, front to back.
    ///
    /// Executed statements leave the queue as they succeed. On failure the
    /// failing statement and everything after it stay queued and the error
    /// reports the failing statement's zero-based position in the queue as
    /// it stood when execution started.
    #[tracing::instrument(level = "debug", skip(self, backend), fields(queued = self.items.len()))]
    pub fn execute<B: StorageBackend + ?Sized>(&mut self, backend: &mut B) -> Result<FlushResult> {
        let mut result = FlushResult::new();
        let mut position = 0;
        while let Some(item) = self.items.front() {
            let sql = item.statement.to_sql();
            tracing::debug!(
                position,
                entity = item.entity,
                sql = %sql,
                "Executing queued statement"
            );
            match backend.execute_mutation(&item.statement) {
                Ok(affected) => {
                    if affected == 0 && item.kind() != StatementKind::Insert {
                        tracing::warn!(
                            position,
                            entity = item.entity,
                            sql = %sql,
                            "Statement affected no rows"
                        );
                    }
                    result.record(item.kind());
                    self.items.pop_front();
                    position += 1;
                }
                Err(source) => {
                    tracing::warn!(position, sql = %sql, error = %source, "Flush failed");
                    return Err(Error::Flush(FlushError {
                        position,
                        sql,
                        source: Box::new(source),
                    }));
                }
            }
        }
        Ok(result)
    }
}

/// Result of a flush operation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushResult {
    /// Number of rows inserted.
    pub inserted: usize,
    /// Number of rows updated.
    pub updated: usize,
    /// Number of rows deleted.
    pub deleted: usize,
}

impl FlushResult {
    /// Create a new empty result.
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&mut self, kind: StatementKind) {
        match kind {
            StatementKind::Insert => self.inserted += 1,
            StatementKind::Update => self.updated += 1,
            StatementKind::Delete => self.deleted += 1,
            StatementKind::Select => {}
        }
    }

    /// Total number of statements executed.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }
}
