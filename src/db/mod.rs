//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Connection registry and backing clients (pools)
//! - SQL rendering and statement execution
//! - Type mappings from rows to JSON
//! - The generic repository, its factory and the unit of work

pub(crate) mod executor;
pub mod factory;
pub mod pool;
pub mod registry;
pub mod repository;
pub(crate) mod sql;
pub mod types;
pub mod unit_of_work;

pub use factory::{RepositoryFactory, RepositoryProvider};
pub use pool::{ClientBuilder, DbClient, DbConnection, DbPool, SqlxClientBuilder};
pub use registry::ConnectionRegistry;
pub use repository::Repository;
pub use types::JsonMap;
pub use unit_of_work::{UnitOfWork, UnitOfWorkState};
