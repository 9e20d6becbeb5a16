//! Error types for persistence-context operations.

use crate::value::Value;
use std::fmt;

/// The primary error type for all persistctx operations.
#[derive(Debug)]
pub enum Error {
    /// An operation was applied to an entity in the wrong lifecycle state
    InvalidState(StateError),
    /// A strict lookup found no row
    NotFound(NotFoundError),
    /// A single-result query matched more than one row
    NonUniqueResult(NonUniqueError),
    /// The backend rejected an insert because the key already exists
    DuplicateKey(DuplicateKeyError),
    /// A queued statement failed while flushing
    Flush(FlushError),
    /// Any other storage backend failure
    Backend(BackendError),
    /// Type conversion errors
    Type(TypeError),
    /// Entity/row mapping errors
    Mapping(MappingError),
    /// Configuration errors
    Config(ConfigError),
}

#[derive(Debug)]
pub struct StateError {
    pub entity: &'static str,
    pub key: Option<Value>,
    pub message: String,
}

#[derive(Debug)]
pub struct NotFoundError {
    pub entity: &'static str,
    /// The looked-up key, or `None` for a query that matched nothing
    pub key: Option<Value>,
}

#[derive(Debug)]
pub struct NonUniqueError {
    pub entity: &'static str,
    pub count: usize,
}

#[derive(Debug)]
pub struct DuplicateKeyError {
    pub table: String,
    pub key: Value,
}

/// A write-behind statement failed.
///
/// `position` is the zero-based index of the failing statement in the queue
/// as it stood when the flush started.
#[derive(Debug)]
pub struct FlushError {
    pub position: usize,
    pub sql: String,
    pub source: Box<Error>,
}

#[derive(Debug)]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
    pub sql: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// Referenced table does not exist
    NoSuchTable,
    /// Referenced column does not exist
    NoSuchColumn,
    /// Statement shape not supported by the backend
    Unsupported,
    /// Transaction hook misuse (commit without begin, ...)
    Transaction,
    /// Other backend error
    Other,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct MappingError {
    pub entity: &'static str,
    pub message: String,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl TypeError {
    /// Build a mismatch error from the value that failed to convert.
    pub fn mismatch(expected: &'static str, actual: &Value) -> Self {
        Self {
            expected,
            actual: actual.type_name().to_string(),
            column: None,
        }
    }

    /// Attach the column name the value came from.
    pub fn in_column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }
}

impl Error {
    /// Shorthand for an [`Error::InvalidState`] without a key.
    pub fn invalid_state(entity: &'static str, message: impl Into<String>) -> Self {
        Error::InvalidState(StateError {
            entity,
            key: None,
            message: message.into(),
        })
    }

    /// Shorthand for a generic [`Error::Backend`] failure.
    pub fn backend(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Error::Backend(BackendError {
            kind,
            message: message.into(),
            sql: None,
        })
    }

    /// Is this (or the backend failure it wraps) a duplicate-key violation?
    pub fn is_duplicate_key(&self) -> bool {
        match self {
            Error::DuplicateKey(_) => true,
            Error::Flush(e) => e.source.is_duplicate_key(),
            _ => false,
        }
    }

    /// Queue position of the failing statement, for flush errors.
    pub fn flush_position(&self) -> Option<usize> {
        match self {
            Error::Flush(e) => Some(e.position),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Flush(e) => Some(&e.sql),
            Error::Backend(e) => e.sql.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidState(e) => match &e.key {
                Some(key) => write!(f, "Invalid state for {} {}: {}", e.entity, key, e.message),
                None => write!(f, "Invalid state for {}: {}", e.entity, e.message),
            },
            Error::NotFound(e) => match &e.key {
                Some(key) => write!(f, "{} with key {} not found", e.entity, key),
                None => write!(f, "No {} matched the query", e.entity),
            },
            Error::NonUniqueResult(e) => write!(
                f,
                "Expected one {} but the query returned {} rows",
                e.entity, e.count
            ),
            Error::DuplicateKey(e) => {
                write!(f, "Duplicate key {} in table '{}'", e.key, e.table)
            }
            Error::Flush(e) => write!(
                f,
                "Flush failed at statement {} ({}): {}",
                e.position, e.sql, e.source
            ),
            Error::Backend(e) => match &e.sql {
                Some(sql) => write!(f, "Backend error: {} [{}]", e.message, sql),
                None => write!(f, "Backend error: {}", e.message),
            },
            Error::Type(e) => {
                if let Some(col) = &e.column {
                    write!(
                        f,
                        "Type error in column '{}': expected {}, found {}",
                        col, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
            Error::Mapping(e) => write!(f, "Mapping error for {}: {}", e.entity, e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Flush(e) => Some(e.source.as_ref()),
            _ => None,
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expected {}, found {}", self.expected, self.actual)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<MappingError> for Error {
    fn from(err: MappingError) -> Self {
        Error::Mapping(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<BackendError> for Error {
    fn from(err: BackendError) -> Self {
        Error::Backend(err)
    }
}

/// Result type alias for persistctx operations.
pub type Result<T> = std::result::Result<T, Error>;
