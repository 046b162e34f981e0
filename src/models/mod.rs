//! Data models for the repository layer.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod entity;
pub mod paging;
pub mod query;

// Re-export commonly used types
pub use connection::{ConnectionDescriptor, DatabaseType, UnknownDatabaseType};
pub use entity::{CompareOp, Entity, Field, Filter, Predicate, Projection};
pub use paging::{DEFAULT_PAGE_NUMBER, DEFAULT_PAGE_SIZE, PageRequest, PagedResult};
pub use query::{QueryParam, Statement};
