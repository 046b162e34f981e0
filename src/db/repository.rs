//! The generic repository.
//!
//! A [`Repository`] is bound to one backing client (one database code). It
//! compiles typed predicates, projections and ordering into dialect SQL,
//! runs them with a per-client timeout and an optional cancellation token,
//! and decodes rows into entities.
//!
//! A repository obtained from [`UnitOfWork::repository`] runs every statement
//! on the unit's connection instead of the pool.

use crate::db::executor::{self, Call, Outcome, Target};
use crate::db::pool::{ColumnTypes, DbClient};
use crate::db::sql::{self, SelectSpec};
use crate::db::types::JsonMap;
use crate::db::unit_of_work::{UnitOfWork, UnitScope};
use crate::error::{DbError, DbResult};
use crate::mapper::Mapper;
use crate::models::entity::{column_names, to_columns};
use crate::models::{
    CompareOp, DatabaseType, Entity, Field, Filter, PageRequest, PagedResult, Predicate, Projection,
    QueryParam, Statement,
};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::any::type_name;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Upper bound on rows per multi-row `INSERT`.
const MAX_ROWS_PER_INSERT: usize = 1000;

/// Typed data access for one database code.
#[derive(Clone)]
pub struct Repository {
    client: Arc<DbClient>,
    mapper: Arc<Mapper>,
    scope: Option<Arc<UnitScope>>,
    cancel: Option<CancellationToken>,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("code", &self.client.code())
            .field("db_type", &self.client.db_type())
            .field("unit_of_work", &self.scope.as_ref().map(|s| s.id()))
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}

impl Repository {
    pub fn new(client: Arc<DbClient>, mapper: Arc<Mapper>) -> Self {
        Self {
            client,
            mapper,
            scope: None,
            cancel: None,
        }
    }

    /// A copy of this repository that observes `token` on every round-trip.
    pub fn with_cancellation(&self, token: CancellationToken) -> Self {
        Self {
            cancel: Some(token),
            ..self.clone()
        }
    }

    pub(crate) fn scoped(&self, scope: Arc<UnitScope>) -> Self {
        Self {
            scope: Some(scope),
            ..self.clone()
        }
    }

    /// Start a unit of work on this repository's client.
    ///
    /// The unit inherits the cancellation token; it is `Idle` until
    /// [`UnitOfWork::begin`] is called. On a repository bound to a unit of
    /// work, the new unit joins that unit's transaction and nests through
    /// save-points.
    pub fn unit_of_work(&self) -> UnitOfWork {
        match &self.scope {
            Some(scope) => UnitOfWork::join(self.clone(), scope.clone()),
            None => UnitOfWork::new(self.clone()),
        }
    }

    pub fn code(&self) -> &str {
        self.client.code()
    }

    pub fn db_type(&self) -> DatabaseType {
        self.client.db_type()
    }

    pub fn client(&self) -> &Arc<DbClient> {
        &self.client
    }

    pub fn mapper(&self) -> &Arc<Mapper> {
        &self.mapper
    }

    /// Whether statements run inside a unit of work.
    pub fn is_scoped(&self) -> bool {
        self.scope.is_some()
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Insert one row and return the entity with its generated key filled in.
    pub async fn insert<E: Entity>(&self, entity: &E) -> DbResult<E> {
        let name = E::entity_name();
        let db_type = self.db_type();
        let columns = insert_columns::<E>()?;
        let mut values = to_columns(entity)?;
        let row = row_params(&columns, &mut values.clone());

        let returning = (E::GENERATED_KEY && db_type == DatabaseType::PostgreSQL).then_some(E::KEY);
        let casts = self.column_casts::<E>().await?;
        let statement = sql::insert(
            db_type,
            name,
            E::TABLE,
            &columns,
            vec![row],
            returning,
            casts.as_deref(),
        )?;

        let call = if returning.is_some() {
            Call::Fetch(&statement)
        } else {
            Call::Execute(&statement)
        };
        let outcome = self.dispatch("insert", name, call).await?;
        if outcome.rows_affected == 0 {
            return Err(DbError::write_failed("insert", name));
        }

        if E::GENERATED_KEY {
            let key = match db_type {
                DatabaseType::PostgreSQL => outcome
                    .rows
                    .into_iter()
                    .next()
                    .and_then(|mut row| row.remove(E::KEY)),
                DatabaseType::MySQL | DatabaseType::SQLite => outcome
                    .last_insert_id
                    .filter(|id| *id != 0)
                    .map(JsonValue::from),
            };
            if let Some(key) = key {
                values.insert(E::KEY.to_string(), key);
            }
        }

        debug!(code = %self.code(), entity = name, "Inserted row");
        decode_entity::<E>(values, &default_columns::<E>()?)
    }

    /// Insert many rows.
    ///
    /// With `fast`, PostgreSQL streams the rows through `COPY … FROM STDIN`
    /// and the other dialects write every chunk inside one transaction.
    /// Otherwise each chunk commits on its own. Returns whether any row was
    /// written.
    pub async fn insert_many<E: Entity>(&self, entities: &[E], fast: bool) -> DbResult<bool> {
        if entities.is_empty() {
            return Ok(false);
        }
        let name = E::entity_name();
        let db_type = self.db_type();
        let columns = insert_columns::<E>()?;

        let mut rows = Vec::with_capacity(entities.len());
        for entity in entities {
            rows.push(row_params(&columns, &mut to_columns(entity)?));
        }

        let written = if fast && db_type == DatabaseType::PostgreSQL && !columns.is_empty() {
            let statement = sql::copy_from_stdin(name, E::TABLE, &columns)?;
            let data = sql::encode_copy_csv(&rows);
            let call = Call::CopyIn {
                statement: &statement,
                data: &data,
            };
            self.dispatch("insert_many", name, call).await?.rows_affected
        } else {
            let casts = self.column_casts::<E>().await?;
            let statements =
                chunked_inserts(db_type, name, E::TABLE, &columns, rows, casts.as_deref())?;
            if fast && self.scope.is_none() {
                self.execute_in_transaction("insert_many", name, &statements)
                    .await?
            } else {
                let mut total = 0;
                for statement in &statements {
                    total += self
                        .dispatch("insert_many", name, Call::Execute(statement))
                        .await?
                        .rows_affected;
                }
                total
            }
        };

        debug!(
            code = %self.code(),
            entity = name,
            rows_affected = written,
            fast,
            "Bulk insert finished"
        );
        Ok(written > 0)
    }

    /// Delete the row with the entity's key. A null key deletes nothing.
    pub async fn delete_one<E: Entity>(&self, entity: &E) -> DbResult<bool> {
        let name = E::entity_name();
        let key = key_value(entity)?;
        if key.is_null() {
            return Ok(false);
        }
        let filter = Filter::Compare {
            column: E::KEY.to_string(),
            op: CompareOp::Eq,
            value: key,
        };
        let casts = self.column_casts::<E>().await?;
        let statement = sql::delete(self.db_type(), name, E::TABLE, Some(&filter), casts.as_deref())?;
        let outcome = self.dispatch("delete", name, Call::Execute(&statement)).await?;
        Ok(outcome.rows_affected > 0)
    }

    /// Delete every row matching `predicate`.
    pub async fn delete_where<E: Entity>(&self, predicate: &Predicate<E>) -> DbResult<bool> {
        let name = E::entity_name();
        check_filter::<E>(predicate.filter())?;
        let casts = self.column_casts::<E>().await?;
        let statement = sql::delete(
            self.db_type(),
            name,
            E::TABLE,
            Some(predicate.filter()),
            casts.as_deref(),
        )?;
        let outcome = self.dispatch("delete", name, Call::Execute(&statement)).await?;
        Ok(outcome.rows_affected > 0)
    }

    /// Write every column except the key and `ignore` back to the row with
    /// the entity's key.
    pub async fn update<E: Entity>(&self, entity: &E, ignore: &[Field<E>]) -> DbResult<bool> {
        let name = E::entity_name();
        let known = column_names::<E>()?;
        for field in ignore {
            if field.name() == E::KEY || !known.iter().any(|c| c == field.name()) {
                return Err(DbError::invalid_field(field.name(), name));
            }
        }

        let mut values = to_columns(entity)?;
        let key = values
            .remove(E::KEY)
            .map(QueryParam::from_json)
            .ok_or_else(|| DbError::invalid_field(E::KEY, name))?;

        let assignments: Vec<(String, QueryParam)> = known
            .into_iter()
            .filter(|column| column != E::KEY && !ignore.iter().any(|f| f.name() == column))
            .map(|column| {
                let value = QueryParam::from_json(values.remove(&column).unwrap_or(JsonValue::Null));
                (column, value)
            })
            .collect();
        if assignments.is_empty() {
            return Ok(false);
        }

        let casts = self.column_casts::<E>().await?;
        let statement = sql::update(
            self.db_type(),
            name,
            E::TABLE,
            assignments,
            E::KEY,
            key,
            casts.as_deref(),
        )?;
        let outcome = self.dispatch("update", name, Call::Execute(&statement)).await?;
        Ok(outcome.rows_affected > 0)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Rows matching `predicate` (all rows when `None`). With a projection,
    /// only those columns are loaded.
    pub async fn query<E: Entity>(
        &self,
        predicate: Option<&Predicate<E>>,
        projection: Option<&Projection<E>>,
    ) -> DbResult<Vec<E>> {
        let name = E::entity_name();
        let defaults = default_columns::<E>()?;
        let columns = select_columns::<E>(&defaults, projection)?;
        let filter = predicate.map(Predicate::filter);
        if let Some(filter) = filter {
            check_filter::<E>(filter)?;
        }

        let casts = self.column_casts::<E>().await?;
        let statement = sql::select(
            self.db_type(),
            name,
            &SelectSpec {
                table: E::TABLE,
                columns: &columns,
                filter,
                casts: casts.as_deref(),
                order_by: &[],
                limit: None,
                offset: None,
            },
        )?;
        let outcome = self.dispatch("query", name, Call::Fetch(&statement)).await?;
        decode_rows(outcome.rows, &defaults)
    }

    /// One page of rows, ordered by `order_by` (the key when `None`).
    ///
    /// Pages past the end return no items with the correct total.
    pub async fn query_paged<E: Entity>(
        &self,
        page: PageRequest,
        predicate: Option<&Predicate<E>>,
        order_by: Option<Field<E>>,
        descending: bool,
    ) -> DbResult<PagedResult<E>> {
        let name = E::entity_name();
        let defaults = default_columns::<E>()?;
        let columns: Vec<String> = defaults.keys().cloned().collect();
        let filter = predicate.map(Predicate::filter);
        if let Some(filter) = filter {
            check_filter::<E>(filter)?;
        }
        let sort = sort_keys::<E>(&defaults, order_by, descending)?;

        let total = self.count_where::<E>(filter).await?;
        let casts = self.column_casts::<E>().await?;
        let statement = sql::select(
            self.db_type(),
            name,
            &SelectSpec {
                table: E::TABLE,
                columns: &columns,
                filter,
                casts: casts.as_deref(),
                order_by: &sort,
                limit: Some(page.limit()),
                offset: Some(page.offset()),
            },
        )?;
        let outcome = self
            .dispatch("query_paged", name, Call::Fetch(&statement))
            .await?;
        let items = decode_rows(outcome.rows, &defaults)?;
        Ok(PagedResult::new(page, items, total))
    }

    /// [`query_paged`](Self::query_paged), then map each item to `D`.
    pub async fn query_paged_as<E: Entity, D: Send + 'static>(
        &self,
        page: PageRequest,
        predicate: Option<&Predicate<E>>,
        order_by: Option<Field<E>>,
        descending: bool,
    ) -> DbResult<PagedResult<D>> {
        self.require_mapping::<E, D>()?;
        let paged = self
            .query_paged(page, predicate, order_by, descending)
            .await?;
        let items = self.mapper.map_all::<E, D>(&paged.items)?;
        Ok(PagedResult::new(page, items, paged.total_count))
    }

    /// Every matching row, ordered by `order_by` (the key when `None`) and
    /// mapped to `D`.
    pub async fn query_all_as<E: Entity, D: Send + 'static>(
        &self,
        predicate: Option<&Predicate<E>>,
        order_by: Option<Field<E>>,
        descending: bool,
    ) -> DbResult<Vec<D>> {
        self.require_mapping::<E, D>()?;
        let name = E::entity_name();
        let defaults = default_columns::<E>()?;
        let columns: Vec<String> = defaults.keys().cloned().collect();
        let filter = predicate.map(Predicate::filter);
        if let Some(filter) = filter {
            check_filter::<E>(filter)?;
        }
        let sort = sort_keys::<E>(&defaults, order_by, descending)?;

        let casts = self.column_casts::<E>().await?;
        let statement = sql::select(
            self.db_type(),
            name,
            &SelectSpec {
                table: E::TABLE,
                columns: &columns,
                filter,
                casts: casts.as_deref(),
                order_by: &sort,
                limit: None,
                offset: None,
            },
        )?;
        let outcome = self.dispatch("query", name, Call::Fetch(&statement)).await?;
        let entities: Vec<E> = decode_rows(outcome.rows, &defaults)?;
        self.mapper.map_all::<E, D>(&entities)
    }

    /// The first matching row in key order.
    pub async fn first<E: Entity>(&self, predicate: &Predicate<E>) -> DbResult<Option<E>> {
        let name = E::entity_name();
        let defaults = default_columns::<E>()?;
        let columns: Vec<String> = defaults.keys().cloned().collect();
        check_filter::<E>(predicate.filter())?;

        let casts = self.column_casts::<E>().await?;
        let statement = sql::select(
            self.db_type(),
            name,
            &SelectSpec {
                table: E::TABLE,
                columns: &columns,
                filter: Some(predicate.filter()),
                casts: casts.as_deref(),
                order_by: &[(E::KEY, false)],
                limit: Some(1),
                offset: None,
            },
        )?;
        let outcome = self.dispatch("first", name, Call::Fetch(&statement)).await?;
        outcome
            .rows
            .into_iter()
            .next()
            .map(|row| decode_entity::<E>(row, &defaults))
            .transpose()
    }

    /// Whether any row matches. Loads no row data.
    pub async fn exists<E: Entity>(&self, predicate: &Predicate<E>) -> DbResult<bool> {
        let name = E::entity_name();
        check_filter::<E>(predicate.filter())?;
        let casts = self.column_casts::<E>().await?;
        let statement = sql::exists(
            self.db_type(),
            name,
            E::TABLE,
            Some(predicate.filter()),
            casts.as_deref(),
        )?;
        let outcome = self.dispatch("exists", name, Call::Fetch(&statement)).await?;
        Ok(!outcome.rows.is_empty())
    }

    /// Number of rows matching `predicate` (all rows when `None`).
    pub async fn count<E: Entity>(&self, predicate: Option<&Predicate<E>>) -> DbResult<u64> {
        let filter = predicate.map(Predicate::filter);
        if let Some(filter) = filter {
            check_filter::<E>(filter)?;
        }
        self.count_where::<E>(filter).await
    }

    async fn count_where<E: Entity>(&self, filter: Option<&Filter>) -> DbResult<u64> {
        let name = E::entity_name();
        let casts = self.column_casts::<E>().await?;
        let statement = sql::count(self.db_type(), name, E::TABLE, filter, casts.as_deref())?;
        let outcome = self.dispatch("count", name, Call::Fetch(&statement)).await?;
        Ok(read_total(&outcome.rows))
    }

    // =========================================================================
    // Raw SQL
    // =========================================================================

    /// Run a row-returning statement and deserialize each row into `T`.
    ///
    /// Placeholders use the dialect's own syntax (`$1` or `?`).
    pub async fn query_raw<T: DeserializeOwned>(
        &self,
        sql: &str,
        params: Vec<QueryParam>,
    ) -> DbResult<Vec<T>> {
        let name = short_type_name::<T>();
        let statement = Statement::new(sql, params);
        let outcome = self
            .dispatch("query_raw", name, Call::Fetch(&statement))
            .await?;
        outcome
            .rows
            .into_iter()
            .map(|row| {
                serde_json::from_value(JsonValue::Object(row))
                    .map_err(|e| DbError::decode(name, e.to_string()))
            })
            .collect()
    }

    /// Run a statement and return the affected row count.
    pub async fn execute_raw(&self, sql: &str, params: Vec<QueryParam>) -> DbResult<u64> {
        let statement = Statement::new(sql, params);
        let outcome = self
            .dispatch("execute_raw", "-", Call::Execute(&statement))
            .await?;
        Ok(outcome.rows_affected)
    }

    /// Run a row-returning statement and return the rows as JSON objects.
    pub async fn query_table(&self, sql: &str, params: Vec<QueryParam>) -> DbResult<Vec<JsonMap>> {
        let statement = Statement::new(sql, params);
        let outcome = self
            .dispatch("query_table", "-", Call::Fetch(&statement))
            .await?;
        Ok(outcome.rows)
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Apply the client's timeout and the cancellation token to one
    /// round-trip, and attach context to its failure.
    pub(crate) async fn guard<T, F>(&self, operation: &str, entity: &str, fut: F) -> DbResult<T>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        let limit = self.client.query_timeout();
        let timed = tokio::time::timeout(limit, fut);

        let result = match &self.cancel {
            Some(token) => {
                if token.is_cancelled() {
                    return Err(DbError::cancelled(operation));
                }
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(DbError::cancelled(operation)),
                    result = timed => result,
                }
            }
            None => timed.await,
        };

        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(DbError::store(operation, entity, self.client.code(), e)),
            Err(_) => Err(DbError::timeout(
                operation,
                u32::try_from(limit.as_secs()).unwrap_or(u32::MAX),
            )),
        }
    }

    async fn dispatch(&self, operation: &str, entity: &str, call: Call<'_>) -> DbResult<Outcome> {
        match &self.scope {
            Some(scope) => scope.run(self, operation, entity, call).await,
            None => {
                self.guard(
                    operation,
                    entity,
                    executor::run(Target::Pool(self.client.pool()), call),
                )
                .await
            }
        }
    }

    /// Run statements on one connection inside a transaction of their own.
    async fn execute_in_transaction(
        &self,
        operation: &str,
        entity: &str,
        statements: &[Statement],
    ) -> DbResult<u64> {
        let db_type = self.db_type();
        let mut conn = self
            .guard(operation, entity, self.client.pool().acquire())
            .await?;

        let result: DbResult<u64> = async {
            self.guard(
                operation,
                entity,
                executor::run(Target::Conn(&mut conn), Call::Control(sql::begin_sql(db_type))),
            )
            .await?;
            let mut total = 0;
            for statement in statements {
                total += self
                    .guard(
                        operation,
                        entity,
                        executor::run(Target::Conn(&mut conn), Call::Execute(statement)),
                    )
                    .await?
                    .rows_affected;
            }
            self.guard(
                operation,
                entity,
                executor::run(Target::Conn(&mut conn), Call::Control("COMMIT")),
            )
            .await?;
            Ok(total)
        }
        .await;

        if let Err(e) = &result {
            let rolled_back = !matches!(e, DbError::Timeout { .. } | DbError::Cancelled { .. })
                && matches!(
                    tokio::time::timeout(
                        self.client.query_timeout(),
                        executor::run(Target::Conn(&mut conn), Call::Control("ROLLBACK")),
                    )
                    .await,
                    Ok(Ok(_))
                );
            if !rolled_back {
                warn!(
                    code = %self.code(),
                    entity,
                    "Discarding connection after failed bulk insert"
                );
                conn.discard();
            }
        }
        result
    }

    /// Declared types of `E`'s columns that text binds must be cast to.
    ///
    /// PostgreSQL only; loaded once per table and client.
    async fn column_casts<E: Entity>(&self) -> DbResult<Option<Arc<ColumnTypes>>> {
        if self.db_type() != DatabaseType::PostgreSQL {
            return Ok(None);
        }
        if let Some(types) = self.client.cached_column_types(E::TABLE).await {
            return Ok(Some(types));
        }

        let name = E::entity_name();
        let statement = sql::column_types_query(name, E::TABLE)?;
        let rows = self
            .dispatch("describe", name, Call::Fetch(&statement))
            .await?
            .rows;
        // Missing table: nothing to cache, the statement reports the error.
        if rows.is_empty() {
            return Ok(None);
        }

        let types: ColumnTypes = rows
            .into_iter()
            .filter_map(|mut row| {
                let column = row.remove("name")?.as_str()?.to_string();
                let data_type = row.remove("data_type")?.as_str()?.to_string();
                sql::needs_text_cast(&data_type).then_some((column, data_type))
            })
            .collect();
        debug!(
            code = %self.code(),
            entity = name,
            casts = types.len(),
            "Loaded column types"
        );
        Ok(Some(self.client.cache_column_types(E::TABLE, types).await))
    }

    fn require_mapping<S: 'static, D: 'static>(&self) -> DbResult<()> {
        if self.mapper.supports::<S, D>() {
            Ok(())
        } else {
            Err(DbError::mapping_not_registered(
                type_name::<S>(),
                type_name::<D>(),
            ))
        }
    }
}

// =============================================================================
// Entity helpers
// =============================================================================

fn default_columns<E: Entity>() -> DbResult<JsonMap> {
    to_columns(&E::default())
}

/// Columns written on insert: generated keys are left to the store.
fn insert_columns<E: Entity>() -> DbResult<Vec<String>> {
    Ok(column_names::<E>()?
        .into_iter()
        .filter(|c| !(E::GENERATED_KEY && c == E::KEY))
        .collect())
}

fn row_params(columns: &[String], values: &mut JsonMap) -> Vec<QueryParam> {
    columns
        .iter()
        .map(|c| QueryParam::from_json(values.remove(c).unwrap_or(JsonValue::Null)))
        .collect()
}

fn key_value<E: Entity>(entity: &E) -> DbResult<QueryParam> {
    to_columns(entity)?
        .remove(E::KEY)
        .map(QueryParam::from_json)
        .ok_or_else(|| DbError::invalid_field(E::KEY, E::entity_name()))
}

fn select_columns<E: Entity>(
    defaults: &JsonMap,
    projection: Option<&Projection<E>>,
) -> DbResult<Vec<String>> {
    match projection {
        Some(projection) if !projection.is_empty() => projection
            .columns()
            .iter()
            .map(|c| {
                if defaults.contains_key(*c) {
                    Ok(c.to_string())
                } else {
                    Err(DbError::invalid_field(*c, E::entity_name()))
                }
            })
            .collect(),
        _ => Ok(defaults.keys().cloned().collect()),
    }
}

/// Sort keys for `order_by`, with the key column appended so that rows tied
/// on `order_by` keep one order across page windows.
fn sort_keys<E: Entity>(
    defaults: &JsonMap,
    order_by: Option<Field<E>>,
    descending: bool,
) -> DbResult<Vec<(&'static str, bool)>> {
    let column = order_by.map_or(E::KEY, |f| f.name());
    if !defaults.contains_key(column) {
        return Err(DbError::invalid_field(column, E::entity_name()));
    }
    let mut keys = vec![(column, descending)];
    if column != E::KEY {
        keys.push((E::KEY, descending));
    }
    Ok(keys)
}

/// Every column a filter names must be a column of `E`.
fn check_filter<E: Entity>(filter: &Filter) -> DbResult<()> {
    let known = column_names::<E>()?;
    match filter
        .columns()
        .into_iter()
        .find(|c| !known.iter().any(|k| k == c))
    {
        Some(unknown) => Err(DbError::invalid_field(unknown, E::entity_name())),
        None => Ok(()),
    }
}

fn chunked_inserts(
    db_type: DatabaseType,
    entity: &str,
    table: &str,
    columns: &[String],
    rows: Vec<Vec<QueryParam>>,
    casts: Option<&ColumnTypes>,
) -> DbResult<Vec<Statement>> {
    let per_chunk = if columns.is_empty() {
        1
    } else {
        (db_type.max_bind_params() / columns.len()).clamp(1, MAX_ROWS_PER_INSERT)
    };

    let mut statements = Vec::with_capacity(rows.len().div_ceil(per_chunk));
    let mut rows = rows.into_iter().peekable();
    while rows.peek().is_some() {
        let chunk: Vec<Vec<QueryParam>> = rows.by_ref().take(per_chunk).collect();
        statements.push(sql::insert(db_type, entity, table, columns, chunk, None, casts)?);
    }
    Ok(statements)
}

// =============================================================================
// Row decoding
// =============================================================================

fn decode_rows<E: Entity>(rows: Vec<JsonMap>, defaults: &JsonMap) -> DbResult<Vec<E>> {
    rows.into_iter()
        .map(|row| decode_entity::<E>(row, defaults))
        .collect()
}

/// Overlay a row on the entity's default column map and deserialize.
///
/// Columns missing from the row keep their default values.
fn decode_entity<E: Entity>(row: JsonMap, defaults: &JsonMap) -> DbResult<E> {
    let mut merged = defaults.clone();
    for (column, value) in row {
        let value = match merged.get(&column) {
            Some(default) => coerce(default, value),
            None => value,
        };
        merged.insert(column, value);
    }
    serde_json::from_value(JsonValue::Object(merged))
        .map_err(|e| DbError::decode(E::entity_name(), e.to_string()))
}

/// Adjust store representations to the shape the entity field expects.
fn coerce(default: &JsonValue, value: JsonValue) -> JsonValue {
    match (default, value) {
        // integer-backed booleans
        (JsonValue::Bool(_), JsonValue::Number(n)) => {
            JsonValue::Bool(n.as_f64().is_some_and(|v| v != 0.0))
        }
        // JSON stored as text
        (JsonValue::Object(_) | JsonValue::Array(_), JsonValue::String(s)) => {
            serde_json::from_str(&s).unwrap_or(JsonValue::String(s))
        }
        (_, value) => value,
    }
}

/// Read `COUNT(*) AS total` leniently: drivers report it as a number or text.
fn read_total(rows: &[JsonMap]) -> u64 {
    let Some(value) = rows.first().and_then(|row| row.get("total")) else {
        return 0;
    };
    match value {
        JsonValue::Number(n) => n
            .as_u64()
            .or_else(|| n.as_i64().map(|v| v.max(0) as u64))
            .or_else(|| n.as_f64().map(|v| v.max(0.0) as u64))
            .unwrap_or(0),
        JsonValue::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

fn short_type_name<T>() -> &'static str {
    let full = type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
