//! Structured statements exchanged with storage backends.
//!
//! Statements are plain data: backends interpret them directly, and
//! [`Statement::to_sql`] renders a parameterized SQL text used for logging
//! and error reports.

use crate::identifiers::{quote_ident, quote_qualified};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Comparison operators for single-value conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// SQL `LIKE` with `%` and `_` wildcards
    Like,
}

impl CompareOp {
    /// Get the SQL operator text.
    pub const fn as_sql(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Like => "LIKE",
        }
    }
}

/// A filter condition. Conditions in one statement are AND-ed together.
///
/// Column names are either plain (the statement's own table) or qualified
/// with a join alias (`team.name`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    Compare {
        column: String,
        op: CompareOp,
        value: Value,
    },
    IsNull {
        column: String,
        negated: bool,
    },
    In {
        column: String,
        values: Vec<Value>,
    },
}

/// Builder returned by [`Condition::col`].
#[derive(Debug, Clone)]
pub struct ColumnRef {
    column: String,
}

impl Condition {
    /// Start a condition on a column.
    pub fn col(column: impl Into<String>) -> ColumnRef {
        ColumnRef {
            column: column.into(),
        }
    }

    /// The column this condition tests.
    pub fn column(&self) -> &str {
        match self {
            Condition::Compare { column, .. }
            | Condition::IsNull { column, .. }
            | Condition::In { column, .. } => column,
        }
    }

    fn build(&self, params: &mut Vec<Value>) -> String {
        match self {
            Condition::Compare { column, op, value } => {
                params.push(value.clone());
                format!(
                    "{} {} ${}",
                    quote_qualified(column),
                    op.as_sql(),
                    params.len()
                )
            }
            Condition::IsNull { column, negated } => format!(
                "{} IS {}NULL",
                quote_qualified(column),
                if *negated { "NOT " } else { "" }
            ),
            Condition::In { column, values } => {
                if values.is_empty() {
                    return "1 = 0".to_string();
                }
                let placeholders: Vec<String> = values
                    .iter()
                    .map(|v| {
                        params.push(v.clone());
                        format!("${}", params.len())
                    })
                    .collect();
                format!(
                    "{} IN ({})",
                    quote_qualified(column),
                    placeholders.join(", ")
                )
            }
        }
    }
}

impl ColumnRef {
    fn compare(self, op: CompareOp, value: impl Into<Value>) -> Condition {
        Condition::Compare {
            column: self.column,
            op,
            value: value.into(),
        }
    }

    pub fn eq(self, value: impl Into<Value>) -> Condition {
        self.compare(CompareOp::Eq, value)
    }

    pub fn ne(self, value: impl Into<Value>) -> Condition {
        self.compare(CompareOp::Ne, value)
    }

    pub fn lt(self, value: impl Into<Value>) -> Condition {
        self.compare(CompareOp::Lt, value)
    }

    pub fn le(self, value: impl Into<Value>) -> Condition {
        self.compare(CompareOp::Le, value)
    }

    pub fn gt(self, value: impl Into<Value>) -> Condition {
        self.compare(CompareOp::Gt, value)
    }

    pub fn ge(self, value: impl Into<Value>) -> Condition {
        self.compare(CompareOp::Ge, value)
    }

    /// SQL `LIKE` pattern match.
    pub fn like(self, pattern: impl Into<String>) -> Condition {
        self.compare(CompareOp::Like, Value::Text(pattern.into()))
    }

    pub fn is_null(self) -> Condition {
        Condition::IsNull {
            column: self.column,
            negated: false,
        }
    }

    pub fn is_not_null(self) -> Condition {
        Condition::IsNull {
            column: self.column,
            negated: true,
        }
    }

    /// Membership in a list of values. An empty list matches nothing.
    pub fn in_list<I, V>(self, values: I) -> Condition
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Condition::In {
            column: self.column,
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

/// ORDER BY item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: String,
    pub direction: OrderDirection,
}

impl OrderBy {
    /// Create an ascending order by clause.
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: OrderDirection::Asc,
        }
    }

    /// Create a descending order by clause.
    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: OrderDirection::Desc,
        }
    }
}

/// A single LEFT JOIN to an association target.
///
/// Target columns are returned in result rows as `alias.column`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinClause {
    pub table: String,
    pub alias: String,
    /// Foreign key column on the statement's own table
    pub local_column: String,
    /// Key column on the joined table
    pub target_column: String,
    /// Joined table columns to return
    pub columns: Vec<String>,
}

/// SELECT of rows (or of a row count) from one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectStatement {
    pub table: String,
    pub columns: Vec<String>,
    pub filters: Vec<Condition>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub join: Option<JoinClause>,
    /// Return a single `count` column instead of rows
    pub count: bool,
}

impl SelectStatement {
    /// Select `columns` from `table` with no conditions.
    pub fn new(table: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            table: table.into(),
            columns,
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
            join: None,
            count: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertStatement {
    pub table: String,
    pub values: Vec<(String, Value)>,
}

/// UPDATE of one row, addressed by key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateStatement {
    pub table: String,
    pub key_column: String,
    pub key: Value,
    pub assignments: Vec<(String, Value)>,
}

/// DELETE of one row, addressed by key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteStatement {
    pub table: String,
    pub key_column: String,
    pub key: Value,
}

/// Kind of a statement, for counters and log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
}

impl StatementKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            StatementKind::Select => "select",
            StatementKind::Insert => "insert",
            StatementKind::Update => "update",
            StatementKind::Delete => "delete",
        }
    }
}

/// A statement sent to a storage backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    Select(SelectStatement),
    Insert(InsertStatement),
    Update(UpdateStatement),
    Delete(DeleteStatement),
}

impl Statement {
    pub fn kind(&self) -> StatementKind {
        match self {
            Statement::Select(_) => StatementKind::Select,
            Statement::Insert(_) => StatementKind::Insert,
            Statement::Update(_) => StatementKind::Update,
            Statement::Delete(_) => StatementKind::Delete,
        }
    }

    /// The table the statement targets.
    pub fn table(&self) -> &str {
        match self {
            Statement::Select(s) => &s.table,
            Statement::Insert(s) => &s.table,
            Statement::Update(s) => &s.table,
            Statement::Delete(s) => &s.table,
        }
    }

    /// Render SQL text and its positional parameters.
    pub fn build(&self) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let sql = match self {
            Statement::Select(s) => build_select(s, &mut params),
            Statement::Insert(s) => {
                let cols: Vec<String> = s.values.iter().map(|(c, _)| quote_ident(c)).collect();
                let placeholders: Vec<String> = s
                    .values
                    .iter()
                    .map(|(_, v)| {
                        params.push(v.clone());
                        format!("${}", params.len())
                    })
                    .collect();
                format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    quote_ident(&s.table),
                    cols.join(", "),
                    placeholders.join(", ")
                )
            }
            Statement::Update(s) => {
                let sets: Vec<String> = s
                    .assignments
                    .iter()
                    .map(|(c, v)| {
                        params.push(v.clone());
                        format!("{} = ${}", quote_ident(c), params.len())
                    })
                    .collect();
                params.push(s.key.clone());
                format!(
                    "UPDATE {} SET {} WHERE {} = ${}",
                    quote_ident(&s.table),
                    sets.join(", "),
                    quote_ident(&s.key_column),
                    params.len()
                )
            }
            Statement::Delete(s) => {
                params.push(s.key.clone());
                format!(
                    "DELETE FROM {} WHERE {} = ${}",
                    quote_ident(&s.table),
                    quote_ident(&s.key_column),
                    params.len()
                )
            }
        };
        (sql, params)
    }

    /// Render the SQL text alone.
    pub fn to_sql(&self) -> String {
        self.build().0
    }
}

fn build_select(s: &SelectStatement, params: &mut Vec<Value>) -> String {
    let table = quote_ident(&s.table);
    let qualify = s.join.is_some();

    let mut sql = String::from("SELECT ");
    if s.count {
        sql.push_str("COUNT(*) AS \"count\"");
    } else {
        let mut cols: Vec<String> = s
            .columns
            .iter()
            .map(|c| {
                if qualify {
                    format!("{}.{}", table, quote_ident(c))
                } else {
                    quote_ident(c)
                }
            })
            .collect();
        if let Some(join) = &s.join {
            let alias = quote_ident(&join.alias);
            cols.extend(join.columns.iter().map(|c| {
                format!(
                    "{}.{} AS {}",
                    alias,
                    quote_ident(c),
                    quote_ident(&format!("{}.{}", join.alias, c))
                )
            }));
        }
        sql.push_str(&cols.join(", "));
    }

    sql.push_str(" FROM ");
    sql.push_str(&table);

    if let Some(join) = &s.join {
        let alias = quote_ident(&join.alias);
        sql.push_str(&format!(
            " LEFT JOIN {} AS {} ON {}.{} = {}.{}",
            quote_ident(&join.table),
            alias,
            table,
            quote_ident(&join.local_column),
            alias,
            quote_ident(&join.target_column)
        ));
    }

    if !s.filters.is_empty() {
        let conds: Vec<String> = s.filters.iter().map(|c| c.build(params)).collect();
        sql.push_str(" WHERE ");
        sql.push_str(&conds.join(" AND "));
    }

    if !s.order_by.is_empty() {
        let orders: Vec<String> = s
            .order_by
            .iter()
            .map(|o| match o.direction {
                OrderDirection::Asc => format!("{} ASC", quote_qualified(&o.column)),
                OrderDirection::Desc => format!("{} DESC", quote_qualified(&o.column)),
            })
            .collect();
        sql.push_str(" ORDER BY ");
        sql.push_str(&orders.join(", "));
    }

    if let Some(n) = s.limit {
        sql.push_str(&format!(" LIMIT {}", n));
    }
    if let Some(n) = s.offset {
        sql.push_str(&format!(" OFFSET {}", n));
    }
    sql
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sql())
    }
}
