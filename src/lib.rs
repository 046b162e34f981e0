//! Multi-database repository library
//!
//! Routes short database codes to cached, typed repositories over SQLite,
//! PostgreSQL and MySQL, with paging, DTO projection, raw SQL and units of
//! work with save-points.

pub mod config;
pub mod db;
pub mod error;
pub mod mapper;
pub mod models;

pub use config::{Config, DEFAULT_DATABASE_CODE};
pub use db::{
    ConnectionRegistry, Repository, RepositoryFactory, RepositoryProvider, UnitOfWork,
    UnitOfWorkState,
};
pub use error::{DbError, DbResult};
pub use mapper::{Mapper, MapperBuilder};
pub use models::{Entity, Field, PageRequest, PagedResult, Predicate, Projection, QueryParam};
