//! Repository factory: database code → shared repository.
//!
//! # Design Decisions
//!
//! - **`OnceCell` per database code**: concurrent first requests for a code
//!   build exactly one client; every caller gets the same `Arc<Repository>`.
//! - **Registry checked first**: an unknown code fails before a cache slot is
//!   created, so the map only ever holds configured codes.
//! - **Failed builds are not cached**: the cell stays empty and the next
//!   request tries again.
//! - **No eviction**: clients live until [`RepositoryFactory::close_all`].

use crate::config::DEFAULT_DATABASE_CODE;
use crate::db::pool::{ClientBuilder, SqlxClientBuilder};
use crate::db::registry::ConnectionRegistry;
use crate::db::repository::Repository;
use crate::error::{DbError, DbResult};
use crate::mapper::Mapper;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock as TokioRwLock};
use tracing::{debug, info};

type RepositoryCell = Arc<OnceCell<Arc<Repository>>>;

/// Builds and caches one repository per database code.
pub struct RepositoryFactory {
    registry: ConnectionRegistry,
    builder: Arc<dyn ClientBuilder>,
    mapper: Arc<Mapper>,
    repositories: TokioRwLock<HashMap<String, RepositoryCell>>,
}

impl std::fmt::Debug for RepositoryFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryFactory")
            .field("codes", &self.registry.codes())
            .field("mapper", &self.mapper)
            .finish()
    }
}

impl RepositoryFactory {
    pub fn new(
        registry: ConnectionRegistry,
        builder: Arc<dyn ClientBuilder>,
        mapper: Arc<Mapper>,
    ) -> Self {
        Self {
            registry,
            builder,
            mapper,
            repositories: TokioRwLock::new(HashMap::new()),
        }
    }

    /// A factory that opens sqlx pools.
    pub fn with_sqlx(registry: ConnectionRegistry, mapper: Arc<Mapper>) -> Self {
        Self::new(registry, Arc::new(SqlxClientBuilder), mapper)
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// The repository for `code`, building its client on first use.
    pub async fn get_repository(&self, code: &str) -> DbResult<Arc<Repository>> {
        let descriptor = self
            .registry
            .get(code)
            .ok_or_else(|| DbError::unknown_code(code))?;

        let cell = {
            let repositories = self.repositories.read().await;
            if let Some(cell) = repositories.get(code) {
                Arc::clone(cell)
            } else {
                drop(repositories);
                let mut repositories = self.repositories.write().await;
                // Double-check after acquiring write lock
                Arc::clone(
                    repositories
                        .entry(code.to_string())
                        .or_insert_with(|| Arc::new(OnceCell::new())),
                )
            }
        };

        let repository = cell
            .get_or_try_init(|| async {
                debug!(code, "Building repository");
                let client = self.builder.build(descriptor).await?;
                info!(
                    code,
                    db_type = %client.db_type(),
                    "Repository ready"
                );
                Ok::<_, DbError>(Arc::new(Repository::new(
                    Arc::new(client),
                    Arc::clone(&self.mapper),
                )))
            })
            .await?;

        Ok(Arc::clone(repository))
    }

    /// The repository for the `"Default"` code.
    pub async fn get_default(&self) -> DbResult<Arc<Repository>> {
        self.get_repository(DEFAULT_DATABASE_CODE).await
    }

    /// Number of codes with a built repository.
    pub async fn cached_count(&self) -> usize {
        self.repositories
            .read()
            .await
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    /// Close every built client. For process teardown.
    pub async fn close_all(&self) {
        let cells: Vec<RepositoryCell> = {
            let mut repositories = self.repositories.write().await;
            repositories.drain().map(|(_, cell)| cell).collect()
        };
        for cell in cells {
            if let Some(repository) = cell.get() {
                repository.client().close().await;
            }
        }
        info!("All repositories closed");
    }
}

/// Cloneable handle that resolves database codes to repositories.
#[derive(Debug, Clone)]
pub struct RepositoryProvider {
    factory: Arc<RepositoryFactory>,
}

impl RepositoryProvider {
    pub fn new(factory: Arc<RepositoryFactory>) -> Self {
        Self { factory }
    }

    pub async fn get(&self, code: &str) -> DbResult<Arc<Repository>> {
        self.factory.get_repository(code).await
    }

    pub async fn get_default(&self) -> DbResult<Arc<Repository>> {
        self.factory.get_default().await
    }

    pub fn factory(&self) -> &Arc<RepositoryFactory> {
        &self.factory
    }
}

impl From<RepositoryFactory> for RepositoryProvider {
    fn from(factory: RepositoryFactory) -> Self {
        Self::new(Arc::new(factory))
    }
}
