//! Core types and traits for persistctx.
//!
//! This crate provides the pieces a persistence context is built from:
//!
//! - `Value` and `Row` for dynamically typed column data
//! - `Entity` trait mapping structs to rows
//! - `Statement` and `Query` describing reads and writes
//! - `StorageBackend` trait executing statements
//! - `Lazy` wrapper for lazily resolved associations

pub mod backend;
pub mod entity;
pub mod error;
pub mod field;
pub mod identifiers;
pub mod lazy;
pub mod query;
pub mod row;
pub mod statement;
pub mod value;

pub use backend::StorageBackend;
pub use entity::{AssociationInfo, Entity, EntityRef, KeyStrategy};
pub use error::{
    BackendError, BackendErrorKind, ConfigError, DuplicateKeyError, Error, FlushError,
    MappingError, NonUniqueError, NotFoundError, Result, StateError, TypeError,
};
pub use field::FieldInfo;
pub use identifiers::quote_ident;
pub use lazy::{Lazy, LazyLoader, is_loaded};
pub use query::Query;
pub use row::{ColumnInfo, FromValue, Row};
pub use statement::{
    ColumnRef, CompareOp, Condition, DeleteStatement, InsertStatement, JoinClause, OrderBy,
    OrderDirection, SelectStatement, Statement, StatementKind, UpdateStatement,
};
pub use value::Value;
