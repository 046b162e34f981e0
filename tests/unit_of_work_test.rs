//! Integration tests for units of work on a file-backed SQLite database.

use multidb_repository::models::ConnectionDescriptor;
use multidb_repository::{
    ConnectionRegistry, DbError, Entity, Field, Mapper, Repository, RepositoryFactory,
    UnitOfWorkState,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Order {
    id: i64,
    reference: String,
    amount: f64,
}

impl Entity for Order {
    const TABLE: &'static str = "orders";
}

impl Order {
    const REFERENCE: Field<Order> = Field::new("reference");

    fn new(reference: &str, amount: f64) -> Self {
        Self {
            id: 0,
            reference: reference.to_string(),
            amount,
        }
    }
}

async fn setup() -> (NamedTempFile, Repository) {
    let file = NamedTempFile::new().unwrap();
    let url = format!("sqlite:{}?acquire_timeout=2", file.path().display());
    let registry = ConnectionRegistry::from_descriptors([
        ConnectionDescriptor::new("Default", &url, None).unwrap(),
    ]);
    let factory = RepositoryFactory::with_sqlx(registry, Arc::new(Mapper::empty()));
    let repo = factory.get_default().await.unwrap().as_ref().clone();
    repo.execute_raw(
        "CREATE TABLE orders (id INTEGER PRIMARY KEY AUTOINCREMENT, reference TEXT NOT NULL, amount REAL NOT NULL)",
        vec![],
    )
    .await
    .unwrap();
    (file, repo)
}

async fn references(repo: &Repository) -> Vec<String> {
    let mut refs: Vec<String> = repo
        .query::<Order>(None, None)
        .await
        .unwrap()
        .into_iter()
        .map(|o| o.reference)
        .collect();
    refs.sort();
    refs
}

#[tokio::test]
async fn test_commit_persists_all_writes() {
    let (_file, repo) = setup().await;
    let uow = repo.unit_of_work();
    uow.begin().await.unwrap();

    let scoped = uow.repository();
    let order = scoped.insert(&Order::new("A-1", 10.0)).await.unwrap();
    assert_eq!(order.id, 1);
    scoped
        .insert_many(&[Order::new("A-2", 5.0), Order::new("A-3", 2.5)], true)
        .await
        .unwrap();
    assert_eq!(scoped.count::<Order>(None).await.unwrap(), 3);

    uow.commit().await.unwrap();
    assert_eq!(uow.state().await, UnitOfWorkState::Committed);
    assert_eq!(references(&repo).await, vec!["A-1", "A-2", "A-3"]);
}

#[tokio::test]
async fn test_nested_rollback_undoes_inner_scope_only() {
    let (_file, repo) = setup().await;
    let uow = repo.unit_of_work();
    let scoped = uow.repository();

    uow.begin().await.unwrap();
    scoped.insert(&Order::new("outer", 1.0)).await.unwrap();

    uow.begin().await.unwrap();
    assert_eq!(uow.depth().await, 1);
    scoped.insert(&Order::new("inner", 2.0)).await.unwrap();
    assert!(scoped.exists(&Order::REFERENCE.eq("inner")).await.unwrap());

    uow.rollback().await.unwrap();
    assert_eq!(uow.depth().await, 0);
    assert_eq!(uow.state().await, UnitOfWorkState::Active);
    assert!(!scoped.exists(&Order::REFERENCE.eq("inner")).await.unwrap());

    uow.commit().await.unwrap();
    assert_eq!(uow.state().await, UnitOfWorkState::Committed);
    assert_eq!(references(&repo).await, vec!["outer"]);

    // no transaction is left open
    assert!(matches!(
        uow.commit().await,
        Err(DbError::NoActiveTransaction { .. })
    ));
}

#[tokio::test]
async fn test_outer_rollback_discards_committed_inner_scope() {
    let (_file, repo) = setup().await;
    let uow = repo.unit_of_work();
    let scoped = uow.repository();

    uow.begin().await.unwrap();
    uow.begin().await.unwrap();
    scoped.insert(&Order::new("inner", 2.0)).await.unwrap();
    uow.commit().await.unwrap();
    uow.rollback().await.unwrap();

    assert_eq!(uow.state().await, UnitOfWorkState::RolledBack);
    assert!(references(&repo).await.is_empty());
}

#[tokio::test]
async fn test_drop_while_active_rolls_back() {
    let (_file, repo) = setup().await;
    {
        let uow = repo.unit_of_work();
        uow.begin().await.unwrap();
        uow.repository()
            .insert(&Order::new("dropped", 1.0))
            .await
            .unwrap();
    }

    // The pool has one connection; this waits for the rollback to hand it back.
    assert!(references(&repo).await.is_empty());
}

#[tokio::test]
async fn test_scoped_repository_after_commit() {
    let (_file, repo) = setup().await;
    let uow = repo.unit_of_work();
    let scoped = uow.repository();

    uow.begin().await.unwrap();
    uow.commit().await.unwrap();

    let result = scoped.insert(&Order::new("late", 1.0)).await;
    assert!(matches!(result, Err(DbError::NoActiveTransaction { .. })));

    // a finished unit may begin again
    uow.begin().await.unwrap();
    scoped.insert(&Order::new("second", 1.0)).await.unwrap();
    uow.commit().await.unwrap();
    assert_eq!(references(&repo).await, vec!["second"]);
}

#[tokio::test]
async fn test_cancellation_abandons_unit() {
    let (_file, repo) = setup().await;
    let token = CancellationToken::new();
    let uow = repo.with_cancellation(token.clone()).unit_of_work();
    let scoped = uow.repository();

    uow.begin().await.unwrap();
    scoped.insert(&Order::new("pending", 1.0)).await.unwrap();

    token.cancel();
    let result = scoped.insert(&Order::new("cancelled", 1.0)).await;
    assert!(matches!(result, Err(DbError::Cancelled { .. })));
    assert_eq!(uow.state().await, UnitOfWorkState::RolledBack);

    assert!(references(&repo).await.is_empty());
}

#[tokio::test]
async fn test_unit_from_scoped_repository_joins_transaction() {
    let (_file, repo) = setup().await;
    let outer = repo.unit_of_work();
    let scoped = outer.repository();
    outer.begin().await.unwrap();
    scoped.insert(&Order::new("outer", 1.0)).await.unwrap();

    // a service handed the scoped repository starts its own unit
    let inner = scoped.unit_of_work();
    assert!(inner.is_joined());
    assert_eq!(inner.id(), outer.id());
    inner.begin().await.unwrap();
    assert_eq!(outer.depth().await, 1);
    inner
        .repository()
        .insert(&Order::new("kept", 2.0))
        .await
        .unwrap();
    inner.commit().await.unwrap();
    assert_eq!(inner.state().await, UnitOfWorkState::Committed);
    assert_eq!(outer.depth().await, 0);

    let undone = scoped.unit_of_work();
    undone.begin().await.unwrap();
    undone
        .repository()
        .insert(&Order::new("undone", 3.0))
        .await
        .unwrap();
    undone.rollback().await.unwrap();
    assert_eq!(undone.state().await, UnitOfWorkState::RolledBack);
    assert_eq!(outer.state().await, UnitOfWorkState::Active);

    outer.commit().await.unwrap();
    assert_eq!(references(&repo).await, vec!["kept", "outer"]);
}

#[tokio::test]
async fn test_joined_unit_is_undone_with_outer_rollback() {
    let (_file, repo) = setup().await;
    let outer = repo.unit_of_work();
    outer.begin().await.unwrap();

    let inner = outer.repository().unit_of_work();
    inner.begin().await.unwrap();
    inner
        .repository()
        .insert(&Order::new("inner", 1.0))
        .await
        .unwrap();
    inner.commit().await.unwrap();

    outer.rollback().await.unwrap();
    assert!(references(&repo).await.is_empty());
}

#[tokio::test]
async fn test_disposing_joined_unit_undoes_only_its_work() {
    let (_file, repo) = setup().await;
    let outer = repo.unit_of_work();
    let scoped = outer.repository();
    outer.begin().await.unwrap();
    scoped.insert(&Order::new("outer", 1.0)).await.unwrap();

    let inner = scoped.unit_of_work();
    inner.begin().await.unwrap();
    inner.begin().await.unwrap();
    assert_eq!(inner.depth().await, 1);
    scoped.insert(&Order::new("inner", 2.0)).await.unwrap();
    inner.dispose().await.unwrap();

    assert_eq!(outer.state().await, UnitOfWorkState::Active);
    assert_eq!(outer.depth().await, 0);
    outer.commit().await.unwrap();
    assert_eq!(references(&repo).await, vec!["outer"]);
}

#[tokio::test]
async fn test_dropping_joined_unit_undoes_its_save_point() {
    let (_file, repo) = setup().await;
    let outer = repo.unit_of_work();
    let scoped = outer.repository();
    outer.begin().await.unwrap();
    scoped.insert(&Order::new("outer", 1.0)).await.unwrap();
    {
        let inner = scoped.unit_of_work();
        inner.begin().await.unwrap();
        scoped.insert(&Order::new("dropped", 2.0)).await.unwrap();
    }

    // let the spawned undo take the scope first
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(!scoped.exists(&Order::REFERENCE.eq("dropped")).await.unwrap());
    outer.commit().await.unwrap();
    assert_eq!(references(&repo).await, vec!["outer"]);
}

#[tokio::test]
async fn test_joined_unit_needs_active_outer_unit() {
    let (_file, repo) = setup().await;
    let outer = repo.unit_of_work();
    let inner = outer.repository().unit_of_work();
    assert!(matches!(
        inner.begin().await,
        Err(DbError::NoActiveTransaction { .. })
    ));
    assert_eq!(inner.state().await, UnitOfWorkState::Idle);
}

#[tokio::test]
async fn test_per_call_cancellation() {
    let (_file, repo) = setup().await;
    let uow = repo.unit_of_work();
    let token = CancellationToken::new();
    token.cancel();

    assert!(matches!(
        uow.begin_with(&token).await,
        Err(DbError::Cancelled { .. })
    ));
    assert_eq!(uow.state().await, UnitOfWorkState::Idle);

    uow.begin_with(&CancellationToken::new()).await.unwrap();
    uow.repository()
        .insert(&Order::new("pending", 1.0))
        .await
        .unwrap();
    assert!(matches!(
        uow.commit_with(&token).await,
        Err(DbError::Cancelled { .. })
    ));
    assert_eq!(uow.state().await, UnitOfWorkState::RolledBack);
    assert!(references(&repo).await.is_empty());
}
