//! Unit of work: one transaction, with save-points for nested scopes.
//!
//! A unit checks a connection out of its repository's pool on the outermost
//! `begin` and holds it until the matching `commit` or `rollback`. Inner
//! `begin` calls open save-points named `uow_sp_<n>`; names are never reused
//! within a unit.
//!
//! # Lifecycle
//!
//! ```text
//! Idle ──begin──▶ Active ──commit (depth 0)──▶ Committed
//!                   │  ▲
//!                   │  └─ begin / commit / rollback (depth > 0)
//!                   └────rollback (depth 0)──▶ RolledBack
//! ```
//!
//! A unit in a terminal state may `begin` again. Dropping an active unit
//! rolls the whole transaction back on the current runtime; without a
//! runtime the connection is closed and the server aborts the transaction.
//!
//! # Joined units
//!
//! A unit started from a repository that already runs inside a unit joins
//! that unit's transaction instead of opening its own. Its `begin` opens a
//! save-point on the shared connection, `commit` releases it and `rollback`
//! undoes it. Disposing or dropping a joined unit undoes only the
//! save-points it opened.

use crate::db::executor::{self, Call, Outcome, Target};
use crate::db::pool::DbConnection;
use crate::db::repository::Repository;
use crate::db::sql::{begin_sql, savepoint_name};
use crate::error::{DbError, DbResult};
use serde::Serialize;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle state of a [`UnitOfWork`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitOfWorkState {
    Idle,
    Active,
    Committed,
    RolledBack,
}

impl std::fmt::Display for UnitOfWorkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
        };
        f.write_str(name)
    }
}

/// Shared between a unit, the units that join it and the repositories bound
/// to them.
pub(crate) struct UnitScope {
    id: String,
    state: Mutex<ScopeState>,
}

/// Invariant: `conn` is `Some` exactly when `status` is `Active`.
struct ScopeState {
    conn: Option<DbConnection>,
    /// Open save-points, outermost first.
    savepoints: Vec<String>,
    /// Save-points ever opened on this scope.
    opened: u32,
    status: UnitOfWorkState,
}

impl UnitScope {
    fn new(id: String) -> Self {
        Self {
            id,
            state: Mutex::new(ScopeState {
                conn: None,
                savepoints: Vec::new(),
                opened: 0,
                status: UnitOfWorkState::Idle,
            }),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    /// Run a repository call on the unit's connection.
    pub(crate) async fn run(
        &self,
        repo: &Repository,
        operation: &str,
        entity: &str,
        call: Call<'_>,
    ) -> DbResult<Outcome> {
        let mut state = self.state.lock().await;
        state.execute(&self.id, repo, operation, entity, call).await
    }
}

impl Drop for UnitScope {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(conn) = state.conn.take() {
            state.savepoints.clear();
            state.status = UnitOfWorkState::RolledBack;
            roll_back_detached(&self.id, conn);
        }
    }
}

impl ScopeState {
    async fn execute(
        &mut self,
        id: &str,
        repo: &Repository,
        operation: &str,
        entity: &str,
        call: Call<'_>,
    ) -> DbResult<Outcome> {
        let result = match self.conn.as_mut() {
            Some(conn) => {
                repo.guard(operation, entity, executor::run(Target::Conn(conn), call))
                    .await
            }
            None => return Err(DbError::no_active_transaction(id)),
        };

        // The statement may still be running server-side.
        if let Err(e) = &result {
            if aborts_connection(e) {
                warn!(
                    unit_of_work_id = %id,
                    operation,
                    error = %e,
                    "Unit of work interrupted, discarding its connection"
                );
                self.abandon();
            }
        }
        result
    }

    fn depth(&self) -> u32 {
        u32::try_from(self.savepoints.len()).unwrap_or(u32::MAX)
    }

    fn position(&self, savepoint: &str) -> Option<usize> {
        self.savepoints.iter().position(|s| s == savepoint)
    }

    async fn open_savepoint(&mut self, id: &str, repo: &Repository) -> DbResult<String> {
        self.require_active(id)?;
        let name = savepoint_name(self.opened + 1);
        let sql = format!("SAVEPOINT {}", name);
        self.execute(id, repo, "begin", "-", Call::Control(&sql))
            .await?;
        self.opened += 1;
        self.savepoints.push(name.clone());
        debug!(unit_of_work_id = %id, depth = self.depth(), "Save-point opened");
        Ok(name)
    }

    /// Keep the work done since save-point `index`; the ones above it close
    /// with it.
    async fn release_savepoint(&mut self, id: &str, repo: &Repository, index: usize) -> DbResult<()> {
        let Some(name) = self.savepoints.get(index).cloned() else {
            return Err(DbError::no_active_transaction(id));
        };
        let sql = format!("RELEASE SAVEPOINT {}", name);
        self.execute(id, repo, "commit", "-", Call::Control(&sql))
            .await?;
        self.savepoints.truncate(index);
        debug!(unit_of_work_id = %id, depth = self.depth(), "Save-point released");
        Ok(())
    }

    /// Undo the work done since save-point `index`.
    async fn undo_savepoint(
        &mut self,
        id: &str,
        repo: &Repository,
        operation: &str,
        index: usize,
    ) -> DbResult<()> {
        let Some(name) = self.savepoints.get(index).cloned() else {
            return Err(DbError::no_active_transaction(id));
        };
        let undo = format!("ROLLBACK TO SAVEPOINT {}", name);
        let release = format!("RELEASE SAVEPOINT {}", name);
        self.execute(id, repo, operation, "-", Call::Control(&undo))
            .await?;
        self.execute(id, repo, operation, "-", Call::Control(&release))
            .await?;
        self.savepoints.truncate(index);
        debug!(unit_of_work_id = %id, depth = self.depth(), "Save-point rolled back");
        Ok(())
    }

    /// Return the connection to the pool and enter a terminal state.
    fn release(&mut self, status: UnitOfWorkState) {
        self.conn = None;
        self.savepoints.clear();
        self.status = status;
    }

    /// Close the connection without returning it; the server rolls back.
    fn abandon(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.discard();
        }
        self.savepoints.clear();
        self.status = UnitOfWorkState::RolledBack;
    }

    fn require_active(&self, id: &str) -> DbResult<()> {
        if self.status == UnitOfWorkState::Active && self.conn.is_some() {
            Ok(())
        } else {
            Err(DbError::no_active_transaction(id))
        }
    }
}

fn aborts_connection(err: &DbError) -> bool {
    matches!(err, DbError::Timeout { .. } | DbError::Cancelled { .. })
}

fn roll_back_detached(id: &str, conn: DbConnection) {
    match Handle::try_current() {
        Ok(handle) => {
            warn!(
                unit_of_work_id = %id,
                "Unit of work dropped while active, rolling back"
            );
            let id = id.to_string();
            handle.spawn(async move {
                let mut conn = conn;
                match executor::run(Target::Conn(&mut conn), Call::Control("ROLLBACK")).await {
                    Ok(_) => debug!(unit_of_work_id = %id, "Dropped unit of work rolled back"),
                    Err(e) => {
                        warn!(
                            unit_of_work_id = %id,
                            error = %e,
                            "Rollback of dropped unit of work failed, discarding connection"
                        );
                        conn.discard();
                    }
                }
            });
        }
        Err(_) => {
            warn!(
                unit_of_work_id = %id,
                "Unit of work dropped outside a runtime, discarding its connection"
            );
            conn.discard();
        }
    }
}

/// Undo a dropped joined unit's save-point on the shared connection.
///
/// Without a runtime the save-point cannot be undone on its own, so the
/// whole enclosing transaction is abandoned.
fn undo_savepoint_detached(scope: &Arc<UnitScope>, savepoint: String) {
    match Handle::try_current() {
        Ok(handle) => {
            warn!(
                unit_of_work_id = %scope.id,
                savepoint = %savepoint,
                "Joined unit of work dropped while active, rolling back its save-point"
            );
            let scope = scope.clone();
            handle.spawn(async move {
                let mut state = scope.state.lock().await;
                let Some(index) = state.position(&savepoint) else {
                    return;
                };
                let Some(conn) = state.conn.as_mut() else {
                    return;
                };
                let undo = format!("ROLLBACK TO SAVEPOINT {}", savepoint);
                let release = format!("RELEASE SAVEPOINT {}", savepoint);
                let result = match executor::run(Target::Conn(&mut *conn), Call::Control(&undo)).await {
                    Ok(_) => executor::run(Target::Conn(&mut *conn), Call::Control(&release))
                        .await
                        .map(|_| ()),
                    Err(e) => Err(e),
                };
                match result {
                    Ok(()) => {
                        state.savepoints.truncate(index);
                        debug!(unit_of_work_id = %scope.id, "Dropped save-point rolled back");
                    }
                    Err(e) => {
                        warn!(
                            unit_of_work_id = %scope.id,
                            error = %e,
                            "Rollback of dropped save-point failed, discarding connection"
                        );
                        state.abandon();
                    }
                }
            });
        }
        Err(_) => {
            if let Ok(mut state) = scope.state.try_lock() {
                warn!(
                    unit_of_work_id = %scope.id,
                    "Joined unit of work dropped outside a runtime, discarding the enclosing transaction"
                );
                state.abandon();
            }
        }
    }
}

/// Save-points a joined unit opened on the enclosing transaction.
struct Joined {
    /// Outermost first.
    savepoints: Vec<String>,
    status: UnitOfWorkState,
}

impl Joined {
    /// Forget save-points the enclosing unit already closed.
    fn sync(&mut self, scope: &ScopeState) {
        self.savepoints
            .retain(|name| scope.status == UnitOfWorkState::Active && scope.position(name).is_some());
        if self.savepoints.is_empty() && self.status == UnitOfWorkState::Active {
            self.status = match scope.status {
                UnitOfWorkState::Committed => UnitOfWorkState::Committed,
                _ => UnitOfWorkState::RolledBack,
            };
        }
    }
}

/// A transaction boundary over one database code.
///
/// All methods take `&self`; calls are serialized through the unit's scope.
/// The `*_with` variants observe the given cancellation token for that call
/// in place of the one the unit inherited from its repository.
pub struct UnitOfWork {
    base: Repository,
    scope: Arc<UnitScope>,
    joined: Option<Mutex<Joined>>,
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("id", &self.scope.id)
            .field("code", &self.base.code())
            .field("joined", &self.joined.is_some())
            .finish()
    }
}

impl UnitOfWork {
    pub(crate) fn new(base: Repository) -> Self {
        let id = format!("uow_{}", uuid::Uuid::new_v4().simple());
        Self {
            base,
            scope: Arc::new(UnitScope::new(id)),
            joined: None,
        }
    }

    /// A unit nested in the transaction `scope` belongs to.
    pub(crate) fn join(base: Repository, scope: Arc<UnitScope>) -> Self {
        Self {
            base,
            scope,
            joined: Some(Mutex::new(Joined {
                savepoints: Vec::new(),
                status: UnitOfWorkState::Idle,
            })),
        }
    }

    /// The transaction's id; joined units share the enclosing unit's id.
    pub fn id(&self) -> &str {
        &self.scope.id
    }

    pub fn code(&self) -> &str {
        self.base.code()
    }

    /// Whether this unit runs inside another unit's transaction.
    pub fn is_joined(&self) -> bool {
        self.joined.is_some()
    }

    pub async fn state(&self) -> UnitOfWorkState {
        match &self.joined {
            Some(joined) => {
                let mut joined = joined.lock().await;
                joined.sync(&*self.scope.state.lock().await);
                joined.status
            }
            None => self.scope.state.lock().await.status,
        }
    }

    /// Number of open save-points above this unit's outermost scope.
    pub async fn depth(&self) -> u32 {
        match &self.joined {
            Some(joined) => {
                let mut joined = joined.lock().await;
                joined.sync(&*self.scope.state.lock().await);
                u32::try_from(joined.savepoints.len().saturating_sub(1)).unwrap_or(u32::MAX)
            }
            None => self.scope.state.lock().await.depth(),
        }
    }

    /// A repository whose statements run inside this unit.
    ///
    /// Its operations fail with `NoActiveTransaction` while the unit is not
    /// active.
    pub fn repository(&self) -> Repository {
        self.base.scoped(self.scope.clone())
    }

    /// Open the transaction, or a save-point when one is already open.
    pub async fn begin(&self) -> DbResult<()> {
        self.begin_on(&self.base).await
    }

    pub async fn begin_with(&self, token: &CancellationToken) -> DbResult<()> {
        self.begin_on(&self.base.with_cancellation(token.clone()))
            .await
    }

    /// Release the innermost save-point, or commit at depth 0.
    pub async fn commit(&self) -> DbResult<()> {
        self.commit_on(&self.base).await
    }

    pub async fn commit_with(&self, token: &CancellationToken) -> DbResult<()> {
        self.commit_on(&self.base.with_cancellation(token.clone()))
            .await
    }

    /// Undo to the innermost save-point, or roll back at depth 0.
    pub async fn rollback(&self) -> DbResult<()> {
        self.rollback_on(&self.base).await
    }

    pub async fn rollback_with(&self, token: &CancellationToken) -> DbResult<()> {
        self.rollback_on(&self.base.with_cancellation(token.clone()))
            .await
    }

    /// Roll back whatever this unit still has open and end it.
    pub async fn dispose(self) -> DbResult<()> {
        let id = self.scope.id.as_str();
        if let Some(joined) = &self.joined {
            let mut joined = joined.lock().await;
            let mut state = self.scope.state.lock().await;
            joined.sync(&state);
            let Some(index) = joined.savepoints.first().and_then(|name| state.position(name)) else {
                return Ok(());
            };
            let result = state.undo_savepoint(id, &self.base, "dispose", index).await;
            joined.savepoints.clear();
            joined.status = UnitOfWorkState::RolledBack;
            return result;
        }

        let mut state = self.scope.state.lock().await;
        if state.conn.is_none() {
            return Ok(());
        }
        roll_back_all(id, &self.base, &mut state, "dispose").await
    }

    async fn begin_on(&self, base: &Repository) -> DbResult<()> {
        let id = self.scope.id.as_str();
        if let Some(joined) = &self.joined {
            let mut joined = joined.lock().await;
            let mut state = self.scope.state.lock().await;
            joined.sync(&state);
            let name = state.open_savepoint(id, base).await?;
            joined.savepoints.push(name);
            joined.status = UnitOfWorkState::Active;
            return Ok(());
        }

        let mut state = self.scope.state.lock().await;
        if state.conn.is_some() {
            state.open_savepoint(id, base).await?;
            return Ok(());
        }

        let pool = base.client().pool();
        let mut conn = base.guard("begin", "-", pool.acquire()).await?;
        let begun = base
            .guard(
                "begin",
                "-",
                executor::run(
                    Target::Conn(&mut conn),
                    Call::Control(begin_sql(base.db_type())),
                ),
            )
            .await;
        if let Err(e) = begun {
            if aborts_connection(&e) {
                conn.discard();
            }
            return Err(e);
        }

        state.conn = Some(conn);
        state.savepoints.clear();
        state.status = UnitOfWorkState::Active;
        info!(
            unit_of_work_id = %id,
            code = %base.code(),
            "Transaction started"
        );
        Ok(())
    }

    async fn commit_on(&self, base: &Repository) -> DbResult<()> {
        let id = self.scope.id.as_str();
        if let Some(joined) = &self.joined {
            let mut joined = joined.lock().await;
            let mut state = self.scope.state.lock().await;
            joined.sync(&state);
            let Some(index) = joined.savepoints.last().and_then(|name| state.position(name)) else {
                return Err(DbError::no_active_transaction(id));
            };
            state.release_savepoint(id, base, index).await?;
            joined.savepoints.pop();
            if joined.savepoints.is_empty() {
                joined.status = UnitOfWorkState::Committed;
            }
            return Ok(());
        }

        let mut state = self.scope.state.lock().await;
        state.require_active(id)?;

        if let Some(index) = state.savepoints.len().checked_sub(1) {
            return state.release_savepoint(id, base, index).await;
        }

        match state
            .execute(id, base, "commit", "-", Call::Control("COMMIT"))
            .await
        {
            Ok(_) => {
                state.release(UnitOfWorkState::Committed);
                info!(unit_of_work_id = %id, code = %base.code(), "Transaction committed");
                Ok(())
            }
            Err(e) => {
                state.abandon();
                Err(e)
            }
        }
    }

    async fn rollback_on(&self, base: &Repository) -> DbResult<()> {
        let id = self.scope.id.as_str();
        if let Some(joined) = &self.joined {
            let mut joined = joined.lock().await;
            let mut state = self.scope.state.lock().await;
            joined.sync(&state);
            let Some(index) = joined.savepoints.last().and_then(|name| state.position(name)) else {
                return Err(DbError::no_active_transaction(id));
            };
            state.undo_savepoint(id, base, "rollback", index).await?;
            joined.savepoints.pop();
            if joined.savepoints.is_empty() {
                joined.status = UnitOfWorkState::RolledBack;
            }
            return Ok(());
        }

        let mut state = self.scope.state.lock().await;
        state.require_active(id)?;

        if let Some(index) = state.savepoints.len().checked_sub(1) {
            return state.undo_savepoint(id, base, "rollback", index).await;
        }

        roll_back_all(id, base, &mut state, "rollback").await
    }
}

async fn roll_back_all(
    id: &str,
    base: &Repository,
    state: &mut ScopeState,
    operation: &str,
) -> DbResult<()> {
    match state
        .execute(id, base, operation, "-", Call::Control("ROLLBACK"))
        .await
    {
        Ok(_) => {
            state.release(UnitOfWorkState::RolledBack);
            info!(unit_of_work_id = %id, code = %base.code(), "Transaction rolled back");
            Ok(())
        }
        Err(e) => {
            state.abandon();
            Err(e)
        }
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        if let Some(joined) = self.joined.as_mut() {
            let joined = joined.get_mut();
            if joined.status == UnitOfWorkState::Active {
                if let Some(first) = joined.savepoints.first().cloned() {
                    undo_savepoint_detached(&self.scope, first);
                }
            }
            return;
        }

        // Contended means a scoped call is in flight; the scope's own drop
        // covers that case.
        if let Ok(mut state) = self.scope.state.try_lock() {
            if let Some(conn) = state.conn.take() {
                state.savepoints.clear();
                state.status = UnitOfWorkState::RolledBack;
                roll_back_detached(&self.scope.id, conn);
            }
        }
    }
}
