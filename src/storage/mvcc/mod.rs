//! MVCC (Multi-Version Concurrency Control) subsystem
//!
//! Every write to a row stores a new version keyed by the writing
//! transaction's id instead of overwriting in place:
//! - Readers observe the most recent version committed at or before their
//!   transaction began, and always see their own writes
//! - A version with no element content is a tombstone marking deletion
//! - The engine's maintenance sweep discards versions no transaction can
//!   ever observe again

pub mod row;

pub use row::{Row, RowData, VersionChain, UNCOMMITTED};
