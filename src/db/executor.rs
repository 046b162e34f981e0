//! Statement execution.
//!
//! This module runs compiled statements against either a pool or a single
//! checked-out connection (the one a unit of work holds).
//!
//! # Architecture
//!
//! The executor uses database-specific implementations organized in submodules:
//! - `mysql`: MySQL-specific fetch and write operations
//! - `postgres`: PostgreSQL-specific fetch, write and COPY operations
//! - `sqlite`: SQLite-specific fetch and write operations
//!
//! Each submodule is generic over `sqlx::Executor`, so the same code serves a
//! pool and a `&mut` connection. Timeouts and cancellation are applied by the
//! caller around [`run`].

use crate::db::pool::{DbConnection, DbPool};
use crate::db::types::{JsonMap, RowToJson};
use crate::models::{QueryParam, Statement};
use tracing::debug;

/// Where a statement runs.
pub(crate) enum Target<'a> {
    Pool(&'a DbPool),
    Conn(&'a mut DbConnection),
}

/// What to run.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Call<'a> {
    /// Row-returning statement.
    Fetch(&'a Statement),
    /// Statement whose affected-row count matters.
    Execute(&'a Statement),
    /// Transaction control, sent unprepared.
    Control(&'a str),
    /// PostgreSQL `COPY … FROM STDIN` with the encoded payload.
    CopyIn { statement: &'a str, data: &'a [u8] },
}

impl Call<'_> {
    fn sql(&self) -> &str {
        match self {
            Call::Fetch(stmt) | Call::Execute(stmt) => &stmt.sql,
            Call::Control(sql) => sql,
            Call::CopyIn { statement, .. } => statement,
        }
    }

    /// Bound parameter types, for logging without values.
    fn param_types(&self) -> Vec<&'static str> {
        match self {
            Call::Fetch(stmt) | Call::Execute(stmt) => {
                stmt.params.iter().map(|p| p.type_name()).collect()
            }
            Call::Control(_) | Call::CopyIn { .. } => Vec::new(),
        }
    }
}

/// Result of one call. Fetches report the row count as `rows_affected`.
#[derive(Debug, Default)]
pub(crate) struct Outcome {
    pub rows: Vec<JsonMap>,
    pub rows_affected: u64,
    pub last_insert_id: Option<i64>,
}

impl Outcome {
    fn from_rows(rows: Vec<JsonMap>) -> Self {
        Self {
            rows_affected: rows.len() as u64,
            rows,
            last_insert_id: None,
        }
    }

    fn affected(rows_affected: u64, last_insert_id: Option<i64>) -> Self {
        Self {
            rows: Vec::new(),
            rows_affected,
            last_insert_id,
        }
    }
}

/// Run one call against the target.
pub(crate) async fn run(target: Target<'_>, call: Call<'_>) -> Result<Outcome, sqlx::Error> {
    debug!(sql = %call.sql(), params = ?call.param_types(), "Executing statement");

    match target {
        Target::Pool(pool) => match pool {
            DbPool::MySql(p) => mysql::run(p, call).await,
            DbPool::Postgres(p) => match call {
                Call::CopyIn { statement, data } => {
                    use sqlx::postgres::PgPoolCopyExt;
                    let mut copy = p.copy_in_raw(statement).await?;
                    copy.send(data).await?;
                    Ok(Outcome::affected(copy.finish().await?, None))
                }
                _ => postgres::run(p, call).await,
            },
            DbPool::SQLite(p) => sqlite::run(p, call).await,
        },
        Target::Conn(conn) => match conn {
            DbConnection::MySql(c) => mysql::run(&mut **c, call).await,
            DbConnection::Postgres(c) => match call {
                Call::CopyIn { statement, data } => {
                    let mut copy = c.copy_in_raw(statement).await?;
                    copy.send(data).await?;
                    Ok(Outcome::affected(copy.finish().await?, None))
                }
                _ => postgres::run(&mut **c, call).await,
            },
            DbConnection::SQLite(c) => sqlite::run(&mut **c, call).await,
        },
    }
}

fn unsupported_copy() -> sqlx::Error {
    sqlx::Error::Protocol("COPY is only supported on PostgreSQL".to_string())
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================
//
// Each module below provides the same interface adapted to its database type.
// The code structure is intentionally parallel to make differences obvious.
// Statements without parameters go through the unprepared path so that raw
// SQL the prepared protocol rejects (procedures, multi-statement scripts)
// still runs.

mod mysql {
    use super::*;
    use sqlx::mysql::MySqlArguments;
    use sqlx::query::Query;
    use sqlx::types::Json;
    use sqlx::{Executor, MySql};

    fn prepare(stmt: &Statement) -> Query<'_, MySql, MySqlArguments> {
        stmt.params
            .iter()
            .fold(sqlx::query(&stmt.sql), |query, param| match param {
                QueryParam::Null => query.bind(None::<String>),
                QueryParam::Bool(v) => query.bind(*v),
                QueryParam::Int(v) => query.bind(*v),
                QueryParam::Float(v) => query.bind(*v),
                QueryParam::String(v) => query.bind(v.as_str()),
                QueryParam::Bytes(v) => query.bind(v.as_slice()),
                QueryParam::Json(v) => query.bind(Json(v)),
            })
    }

    pub async fn run<'c, X>(ex: X, call: Call<'_>) -> Result<Outcome, sqlx::Error>
    where
        X: Executor<'c, Database = MySql>,
    {
        match call {
            Call::Fetch(stmt) => {
                let rows = if stmt.params.is_empty() {
                    ex.fetch_all(stmt.sql.as_str()).await?
                } else {
                    prepare(stmt).fetch_all(ex).await?
                };
                Ok(Outcome::from_rows(rows.iter().map(|r| r.to_json_map()).collect()))
            }
            Call::Execute(stmt) => {
                let result = if stmt.params.is_empty() {
                    ex.execute(stmt.sql.as_str()).await?
                } else {
                    prepare(stmt).execute(ex).await?
                };
                let last_insert_id = i64::try_from(result.last_insert_id()).ok();
                Ok(Outcome::affected(result.rows_affected(), last_insert_id))
            }
            Call::Control(sql) => {
                let result = ex.execute(sql).await?;
                Ok(Outcome::affected(result.rows_affected(), None))
            }
            Call::CopyIn { .. } => Err(unsupported_copy()),
        }
    }
}

mod postgres {
    use super::*;
    use sqlx::postgres::PgArguments;
    use sqlx::query::Query;
    use sqlx::types::Json;
    use sqlx::{Executor, Postgres};

    // Strings bind as `text`; the statement casts them where a column
    // declares another type.
    fn prepare(stmt: &Statement) -> Query<'_, Postgres, PgArguments> {
        stmt.params
            .iter()
            .fold(sqlx::query(&stmt.sql), |query, param| match param {
                QueryParam::Null => query.bind(None::<String>),
                QueryParam::Bool(v) => query.bind(*v),
                QueryParam::Int(v) => query.bind(*v),
                QueryParam::Float(v) => query.bind(*v),
                QueryParam::String(v) => query.bind(v.as_str()),
                QueryParam::Bytes(v) => query.bind(v.as_slice()),
                QueryParam::Json(v) => query.bind(Json(v)),
            })
    }

    pub async fn run<'c, X>(ex: X, call: Call<'_>) -> Result<Outcome, sqlx::Error>
    where
        X: Executor<'c, Database = Postgres>,
    {
        match call {
            Call::Fetch(stmt) => {
                let rows = if stmt.params.is_empty() {
                    ex.fetch_all(stmt.sql.as_str()).await?
                } else {
                    prepare(stmt).fetch_all(ex).await?
                };
                Ok(Outcome::from_rows(rows.iter().map(|r| r.to_json_map()).collect()))
            }
            Call::Execute(stmt) => {
                let result = if stmt.params.is_empty() {
                    ex.execute(stmt.sql.as_str()).await?
                } else {
                    prepare(stmt).execute(ex).await?
                };
                Ok(Outcome::affected(result.rows_affected(), None))
            }
            Call::Control(sql) => {
                let result = ex.execute(sql).await?;
                Ok(Outcome::affected(result.rows_affected(), None))
            }
            // Handled by the caller, which owns the concrete connection type.
            Call::CopyIn { .. } => Err(unsupported_copy()),
        }
    }
}

mod sqlite {
    use super::*;
    use sqlx::query::Query;
    use sqlx::sqlite::SqliteArguments;
    use sqlx::{Executor, Sqlite};

    fn prepare(stmt: &Statement) -> Query<'_, Sqlite, SqliteArguments<'_>> {
        stmt.params
            .iter()
            .fold(sqlx::query(&stmt.sql), |query, param| match param {
                QueryParam::Null => query.bind(None::<String>),
                QueryParam::Bool(v) => query.bind(*v),
                QueryParam::Int(v) => query.bind(*v),
                QueryParam::Float(v) => query.bind(*v),
                QueryParam::String(v) => query.bind(v.as_str()),
                QueryParam::Bytes(v) => query.bind(v.as_slice()),
                // no JSON type; stored as text
                QueryParam::Json(v) => query.bind(v.to_string()),
            })
    }

    pub async fn run<'c, X>(ex: X, call: Call<'_>) -> Result<Outcome, sqlx::Error>
    where
        X: Executor<'c, Database = Sqlite>,
    {
        match call {
            Call::Fetch(stmt) => {
                let rows = if stmt.params.is_empty() {
                    ex.fetch_all(stmt.sql.as_str()).await?
                } else {
                    prepare(stmt).fetch_all(ex).await?
                };
                Ok(Outcome::from_rows(rows.iter().map(|r| r.to_json_map()).collect()))
            }
            Call::Execute(stmt) => {
                let result = if stmt.params.is_empty() {
                    ex.execute(stmt.sql.as_str()).await?
                } else {
                    prepare(stmt).execute(ex).await?
                };
                Ok(Outcome::affected(
                    result.rows_affected(),
                    Some(result.last_insert_rowid()),
                ))
            }
            Call::Control(sql) => {
                let result = ex.execute(sql).await?;
                Ok(Outcome::affected(result.rows_affected(), None))
            }
            Call::CopyIn { .. } => Err(unsupported_copy()),
        }
    }
}
