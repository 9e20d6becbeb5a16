//! Typed query builder.

use crate::entity::Entity;
use crate::statement::{Condition, JoinClause, OrderBy, SelectStatement};
use crate::value::Value;
use std::marker::PhantomData;

/// A query for entities of type `E`.
///
/// Built fluently and executed through the persistence context, which turns
/// it into a [`SelectStatement`] over the entity's table:
///
/// ```ignore
/// let adults = Query::<Person>::new()
///     .filter(Condition::col("age").ge(18))
///     .filter_opt(name.map(|n| Condition::col("name").like(n)))
///     .order_by(OrderBy::asc("name"))
///     .limit(20);
/// let people = ctx.query_list(&adults)?;
/// ```
pub struct Query<E: Entity> {
    filters: Vec<Condition>,
    order_by: Vec<OrderBy>,
    limit: Option<u64>,
    offset: Option<u64>,
    _marker: PhantomData<E>,
}

impl<E: Entity> Query<E> {
    /// Create a query matching every row of the entity's table.
    pub fn new() -> Self {
        Self {
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
            _marker: PhantomData,
        }
    }

    /// Query for the row with the given primary key.
    pub fn by_key(key: impl Into<Value>) -> Self {
        Self::new().filter(Condition::col(E::KEY_COLUMN).eq(key))
    }

    /// Add a WHERE condition (AND-ed with the others).
    pub fn filter(mut self, condition: Condition) -> Self {
        self.filters.push(condition);
        self
    }

    /// Add a condition only when one is given.
    pub fn filter_opt(self, condition: Option<Condition>) -> Self {
        match condition {
            Some(c) => self.filter(c),
            None => self,
        }
    }

    /// Add ORDER BY clause.
    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    /// Set LIMIT.
    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    /// Set OFFSET.
    pub fn offset(mut self, n: u64) -> Self {
        self.offset = Some(n);
        self
    }

    pub fn filters(&self) -> &[Condition] {
        &self.filters
    }

    /// The LIMIT set on this query, if any.
    pub fn limit_value(&self) -> Option<u64> {
        self.limit
    }

    /// Row-returning statement for this query.
    pub fn to_select(&self) -> SelectStatement {
        let mut s = SelectStatement::new(
            E::TABLE_NAME,
            E::column_names().into_iter().map(String::from).collect(),
        );
        s.filters.clone_from(&self.filters);
        s.order_by.clone_from(&self.order_by);
        s.limit = self.limit;
        s.offset = self.offset;
        s
    }

    /// Row-returning statement that also LEFT JOINs an association target.
    pub fn to_join_select(&self, join: JoinClause) -> SelectStatement {
        let mut s = self.to_select();
        s.join = Some(join);
        s
    }

    /// Aggregate statement counting the matching rows.
    ///
    /// Ordering and paging do not apply to the count.
    pub fn to_count(&self) -> SelectStatement {
        let mut s = SelectStatement::new(E::TABLE_NAME, Vec::new());
        s.filters.clone_from(&self.filters);
        s.count = true;
        s
    }
}

impl<E: Entity> Clone for Query<E> {
    fn clone(&self) -> Self {
        Self {
            filters: self.filters.clone(),
            order_by: self.order_by.clone(),
            limit: self.limit,
            offset: self.offset,
            _marker: PhantomData,
        }
    }
}

impl<E: Entity> std::fmt::Debug for Query<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("entity", &E::ENTITY_NAME)
            .field("filters", &self.filters)
            .field("order_by", &self.order_by)
            .field("limit", &self.limit)
            .field("offset", &self.offset)
            .finish()
    }
}

impl<E: Entity> Default for Query<E> {
    fn default() -> Self {
        Self::new()
    }
}
