//! Evaluation of WHERE conditions and ORDER BY against materialized rows.
//!
//! Comparisons follow SQL's rule that NULL matches nothing: a comparison
//! with a NULL operand, or between unrelated types, is false.

use persistctx_core::{
    BackendErrorKind, CompareOp, Condition, Error, OrderBy, OrderDirection, Result, Row, Value,
};
use regex::{Regex, RegexBuilder};
use std::cmp::Ordering;

/// A condition prepared for repeated evaluation.
#[derive(Debug)]
pub enum Filter {
    Compare {
        column: String,
        op: CompareOp,
        value: Value,
    },
    Like {
        column: String,
        pattern: Regex,
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

impl Filter {
    /// Prepare a condition. LIKE patterns are compiled once here.
    pub fn compile(condition: &Condition, case_insensitive_like: bool) -> Result<Self> {
        Ok(match condition {
            Condition::Compare {
                column,
                op: CompareOp::Like,
                value,
            } => {
                let pattern = value.as_str().ok_or_else(|| {
                    Error::backend(
                        BackendErrorKind::Unsupported,
                        format!("LIKE pattern must be text, found {}", value.type_name()),
                    )
                })?;
                Filter::Like {
                    column: column.clone(),
                    pattern: like_regex(pattern, case_insensitive_like)?,
                }
            }
            Condition::Compare { column, op, value } => Filter::Compare {
                column: column.clone(),
                op: *op,
                value: value.clone(),
            },
            Condition::IsNull { column, negated } => Filter::IsNull {
                column: column.clone(),
                negated: *negated,
            },
            Condition::In { column, values } => Filter::In {
                column: column.clone(),
                values: values.clone(),
            },
        })
    }

    fn column(&self) -> &str {
        match self {
            Filter::Compare { column, .. }
            | Filter::Like { column, .. }
            | Filter::IsNull { column, .. }
            | Filter::In { column, .. } => column,
        }
    }

    /// Whether `row` satisfies the condition.
    pub fn matches(&self, row: &Row) -> Result<bool> {
        let column = self.column();
        let value = row.get_by_name(column).ok_or_else(|| {
            Error::backend(
                BackendErrorKind::NoSuchColumn,
                format!("no column '{column}' in result row"),
            )
        })?;
        Ok(match self {
            Filter::Compare { op, value: rhs, .. } => compare_op(value, *op, rhs),
            Filter::Like { pattern, .. } => value.as_str().is_some_and(|s| pattern.is_match(s)),
            Filter::IsNull { negated, .. } => value.is_null() != *negated,
            Filter::In { values, .. } => values
                .iter()
                .any(|candidate| value.compare(candidate) == Some(Ordering::Equal)),
        })
    }
}

fn compare_op(lhs: &Value, op: CompareOp, rhs: &Value) -> bool {
    let Some(ordering) = lhs.compare(rhs) else {
        return false;
    };
    match op {
        CompareOp::Eq => ordering == Ordering::Equal,
        CompareOp::Ne => ordering != Ordering::Equal,
        CompareOp::Lt => ordering == Ordering::Less,
        CompareOp::Le => ordering != Ordering::Greater,
        CompareOp::Gt => ordering == Ordering::Greater,
        CompareOp::Ge => ordering != Ordering::Less,
        CompareOp::Like => false,
    }
}

/// Translate a SQL LIKE pattern (`%` any run, `_` one character) to an
/// anchored regex.
pub fn like_regex(pattern: &str, case_insensitive: bool) -> Result<Regex> {
    let mut source = String::with_capacity(pattern.len() + 8);
    source.push('^');
    let mut buf = [0u8; 4];
    for ch in pattern.chars() {
        match ch {
            '%' => source.push_str(".*"),
            '_' => source.push('.'),
            other => source.push_str(&regex::escape(other.encode_utf8(&mut buf))),
        }
    }
    source.push('$');
    RegexBuilder::new(&source)
        .case_insensitive(case_insensitive)
        .dot_matches_new_line(true)
        .build()
        .map_err(|e| {
            Error::backend(
                BackendErrorKind::Unsupported,
                format!("invalid LIKE pattern '{pattern}': {e}"),
            )
        })
}

/// Ordering of two values for ORDER BY. NULL sorts before everything else;
/// unrelated types compare equal so the sort stays stable.
pub fn order_values(a: &Value, b: &Value) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.compare(b).unwrap_or(Ordering::Equal),
    }
}

/// Sort rows in place by the ORDER BY terms, first term most significant.
pub fn sort_rows(rows: &mut [Row], order_by: &[OrderBy]) -> Result<()> {
    for term in order_by {
        if let Some(row) = rows.first() {
            if !row.contains_column(&term.column) {
                return Err(Error::backend(
                    BackendErrorKind::NoSuchColumn,
                    format!("cannot order by unknown column '{}'", term.column),
                ));
            }
        }
    }
    rows.sort_by(|a, b| {
        for term in order_by {
            let (Some(x), Some(y)) = (a.get_by_name(&term.column), b.get_by_name(&term.column))
            else {
                continue;
            };
            let ordering = match term.direction {
                OrderDirection::Asc => order_values(x, y),
                OrderDirection::Desc => order_values(y, x),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
    Ok(())
}
