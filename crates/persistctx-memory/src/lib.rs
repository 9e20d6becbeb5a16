//! In-memory storage backend for persistctx.
//!
//! This crate provides [`MemoryBackend`], a [`StorageBackend`] that keeps
//! tables in process memory. It is the reference backend for examples and
//! for the persistence context's integration tests.
//!
//! # Features
//!
//! - Tables created from an entity's field descriptors
//! - Per-table key sequences for `KeyStrategy::Sequence`
//! - Duplicate-key detection on insert
//! - Filtering (`=`, `<>`, `<`, `<=`, `>`, `>=`, `LIKE`, `IS NULL`, `IN`),
//!   ordering, paging and `COUNT(*)`
//! - A single LEFT JOIN per select, exposing target columns as `alias.column`
//! - Transactions by table copy
//! - A log of every statement received, and one-shot failure injection
//!
//! # Example
//!
//! ```rust,ignore
//! use persistctx_memory::MemoryBackend;
//!
//! let mut backend = MemoryBackend::new();
//! backend.create_table::<Person>()?;
//! backend.seed(&Person { id: 1, name: "ann".into() })?;
//!
//! let mut ctx = PersistenceContext::new(backend);
//! let ann = ctx.find::<Person>(1)?;
//! assert_eq!(ctx.backend().query_count(), 1);
//! ```
//!
//! # Value semantics
//!
//! Comparisons use [`Value::compare`](persistctx_core::Value::compare):
//! integers and doubles compare numerically, NULL matches no comparison, and
//! values of unrelated types never match. `ORDER BY` sorts NULL first.

pub mod backend;
pub mod filter;
pub mod table;

pub use backend::{MemoryBackend, MemoryConfig, TransactionStats};
pub use table::Table;

#[doc(no_inline)]
pub use persistctx_core::StorageBackend;
