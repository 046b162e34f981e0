//! Dialect SQL rendering.
//!
//! Every statement the repository issues is produced here from typed
//! inputs. Identifiers are validated and quoted per dialect, values always go
//! through bind parameters except NULL, which is rendered as a literal so that
//! PostgreSQL never has to infer a type for an untyped bind.
//!
//! PostgreSQL binds strings as `text`. Where a column declares another type
//! (timestamps, uuids, enums) the placeholder is wrapped in a `CAST` to the
//! declared type, looked up once per table with [`column_types_query`].

use crate::db::pool::ColumnTypes;
use crate::error::{DbError, DbResult};
use crate::models::{CompareOp, DatabaseType, Filter, QueryParam, Statement};
use std::fmt::Write as _;

/// Validate a column or table identifier: `[A-Za-z_][A-Za-z0-9_]*`.
pub(crate) fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Quote a single identifier for the dialect.
pub(crate) fn quote_ident(db_type: DatabaseType, name: &str, entity: &str) -> DbResult<String> {
    if !is_valid_identifier(name) {
        return Err(DbError::invalid_field(name, entity));
    }
    Ok(match db_type {
        DatabaseType::MySQL => format!("`{}`", name),
        DatabaseType::PostgreSQL | DatabaseType::SQLite => format!("\"{}\"", name),
    })
}

/// Quote a possibly schema-qualified table name.
pub(crate) fn quote_table(db_type: DatabaseType, table: &str, entity: &str) -> DbResult<String> {
    let parts = table
        .split('.')
        .map(|part| quote_ident(db_type, part, entity))
        .collect::<DbResult<Vec<_>>>()?;
    Ok(parts.join("."))
}

/// Transaction control statements.
pub(crate) fn begin_sql(db_type: DatabaseType) -> &'static str {
    match db_type {
        DatabaseType::MySQL => "START TRANSACTION",
        DatabaseType::PostgreSQL | DatabaseType::SQLite => "BEGIN",
    }
}

pub(crate) fn savepoint_name(depth: u32) -> String {
    format!("uow_sp_{}", depth)
}

/// PostgreSQL: `(name, data_type)` of every live column of `table`.
pub(crate) fn column_types_query(entity: &str, table: &str) -> DbResult<Statement> {
    let regclass = quote_table(DatabaseType::PostgreSQL, table, entity)?;
    Ok(Statement::new(
        "SELECT a.attname::text AS name, format_type(a.atttypid, a.atttypmod) AS data_type \
         FROM pg_attribute a \
         WHERE a.attrelid = to_regclass($1) AND a.attnum > 0 AND NOT a.attisdropped",
        vec![QueryParam::String(regclass)],
    ))
}

/// Whether a text bind needs a cast to land in a column of this type.
pub(crate) fn needs_text_cast(data_type: &str) -> bool {
    let base = data_type.split('(').next().unwrap_or(data_type).trim();
    !matches!(
        base,
        "text" | "character varying" | "character" | "citext" | "name" | "\"char\""
    )
}

/// Incremental statement builder for one dialect.
pub(crate) struct SqlBuilder<'a> {
    db_type: DatabaseType,
    entity: &'a str,
    casts: Option<&'a ColumnTypes>,
    sql: String,
    params: Vec<QueryParam>,
}

impl<'a> SqlBuilder<'a> {
    pub(crate) fn new(db_type: DatabaseType, entity: &'a str) -> Self {
        Self {
            db_type,
            entity,
            casts: None,
            sql: String::new(),
            params: Vec::new(),
        }
    }

    pub(crate) fn with_casts(mut self, casts: Option<&'a ColumnTypes>) -> Self {
        self.casts = casts;
        self
    }

    pub(crate) fn push(&mut self, text: &str) -> &mut Self {
        self.sql.push_str(text);
        self
    }

    pub(crate) fn push_ident(&mut self, name: &str) -> DbResult<&mut Self> {
        let quoted = quote_ident(self.db_type, name, self.entity)?;
        self.sql.push_str(&quoted);
        Ok(self)
    }

    pub(crate) fn push_table(&mut self, table: &str) -> DbResult<&mut Self> {
        let quoted = quote_table(self.db_type, table, self.entity)?;
        self.sql.push_str(&quoted);
        Ok(self)
    }

    /// Append a value: NULL inline, anything else as the next placeholder.
    pub(crate) fn push_value(&mut self, value: QueryParam) -> &mut Self {
        if value.is_null() {
            self.sql.push_str("NULL");
            return self;
        }
        self.params.push(value);
        match self.db_type {
            DatabaseType::PostgreSQL => {
                let _ = write!(self.sql, "${}", self.params.len());
            }
            DatabaseType::MySQL | DatabaseType::SQLite => self.sql.push('?'),
        }
        self
    }

    /// Append a value destined for `column`.
    pub(crate) fn push_column_value(&mut self, column: &str, value: QueryParam) -> &mut Self {
        let cast = match (&value, self.casts) {
            (QueryParam::String(_), Some(casts)) => casts.get(column),
            _ => None,
        };
        match cast {
            Some(declared) => {
                self.push("CAST(");
                self.push_value(value);
                self.push(" AS ").push(declared).push(")")
            }
            None => self.push_value(value),
        }
    }

    pub(crate) fn push_column_list(&mut self, columns: &[String]) -> DbResult<&mut Self> {
        for (i, column) in columns.iter().enumerate() {
            if i > 0 {
                self.sql.push_str(", ");
            }
            self.push_ident(column)?;
        }
        Ok(self)
    }

    pub(crate) fn push_where(&mut self, filter: Option<&Filter>) -> DbResult<&mut Self> {
        if let Some(filter) = filter {
            self.sql.push_str(" WHERE ");
            self.push_filter(filter)?;
        }
        Ok(self)
    }

    pub(crate) fn push_order_by(&mut self, keys: &[(&str, bool)]) -> DbResult<&mut Self> {
        for (i, (column, descending)) in keys.iter().enumerate() {
            self.sql.push_str(if i == 0 { " ORDER BY " } else { ", " });
            self.push_ident(column)?;
            self.sql.push_str(if *descending { " DESC" } else { " ASC" });
        }
        Ok(self)
    }

    /// Window literals are integers we produced, so they are inlined.
    pub(crate) fn push_limit(&mut self, limit: u64, offset: Option<u64>) -> &mut Self {
        let _ = write!(self.sql, " LIMIT {}", limit);
        if let Some(offset) = offset {
            let _ = write!(self.sql, " OFFSET {}", offset);
        }
        self
    }

    pub(crate) fn push_filter(&mut self, filter: &Filter) -> DbResult<()> {
        match filter {
            Filter::Compare { column, op, value } => {
                self.push_ident(column)?;
                match (op, value.is_null()) {
                    (CompareOp::Eq, true) => self.push(" IS NULL"),
                    (CompareOp::Ne, true) => self.push(" IS NOT NULL"),
                    _ => {
                        self.push(" ").push(op.as_sql()).push(" ");
                        self.push_column_value(column, value.clone())
                    }
                };
            }
            Filter::Like { column, pattern } => {
                self.push_ident(column)?;
                self.push(" LIKE ");
                self.push_value(QueryParam::String(pattern.clone()));
            }
            Filter::In { column, values } => {
                if values.is_empty() {
                    self.push("1 = 0");
                    return Ok(());
                }
                self.push_ident(column)?;
                self.push(" IN (");
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        self.push(", ");
                    }
                    self.push_column_value(column, value.clone());
                }
                self.push(")");
            }
            Filter::IsNull(column) => {
                self.push_ident(column)?;
                self.push(" IS NULL");
            }
            Filter::IsNotNull(column) => {
                self.push_ident(column)?;
                self.push(" IS NOT NULL");
            }
            Filter::And(items) => self.push_group(items, " AND ", "1 = 1")?,
            Filter::Or(items) => self.push_group(items, " OR ", "1 = 0")?,
            Filter::Not(inner) => {
                self.push("NOT (");
                self.push_filter(inner)?;
                self.push(")");
            }
        }
        Ok(())
    }

    fn push_group(&mut self, items: &[Filter], separator: &str, empty: &str) -> DbResult<()> {
        if items.is_empty() {
            self.push(empty);
            return Ok(());
        }
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                self.push(separator);
            }
            self.push("(");
            self.push_filter(item)?;
            self.push(")");
        }
        Ok(())
    }

    pub(crate) fn finish(self) -> Statement {
        Statement::new(self.sql, self.params)
    }
}

/// `SELECT cols FROM t [WHERE …] [ORDER BY …] [LIMIT … OFFSET …]`
pub(crate) struct SelectSpec<'a> {
    pub table: &'a str,
    pub columns: &'a [String],
    pub filter: Option<&'a Filter>,
    pub casts: Option<&'a ColumnTypes>,
    /// Sort keys, most significant first; empty leaves the order unspecified.
    pub order_by: &'a [(&'a str, bool)],
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

pub(crate) fn select(db_type: DatabaseType, entity: &str, spec: &SelectSpec<'_>) -> DbResult<Statement> {
    let mut b = SqlBuilder::new(db_type, entity).with_casts(spec.casts);
    b.push("SELECT ");
    b.push_column_list(spec.columns)?;
    b.push(" FROM ");
    b.push_table(spec.table)?;
    b.push_where(spec.filter)?;
    b.push_order_by(spec.order_by)?;
    if let Some(limit) = spec.limit {
        b.push_limit(limit, spec.offset);
    }
    Ok(b.finish())
}

pub(crate) fn count(
    db_type: DatabaseType,
    entity: &str,
    table: &str,
    filter: Option<&Filter>,
    casts: Option<&ColumnTypes>,
) -> DbResult<Statement> {
    let mut b = SqlBuilder::new(db_type, entity).with_casts(casts);
    b.push("SELECT COUNT(*) AS total FROM ");
    b.push_table(table)?;
    b.push_where(filter)?;
    Ok(b.finish())
}

pub(crate) fn exists(
    db_type: DatabaseType,
    entity: &str,
    table: &str,
    filter: Option<&Filter>,
    casts: Option<&ColumnTypes>,
) -> DbResult<Statement> {
    let mut b = SqlBuilder::new(db_type, entity).with_casts(casts);
    b.push("SELECT 1 AS present FROM ");
    b.push_table(table)?;
    b.push_where(filter)?;
    b.push_limit(1, None);
    Ok(b.finish())
}

/// Multi-row insert. An empty column list inserts default rows.
pub(crate) fn insert(
    db_type: DatabaseType,
    entity: &str,
    table: &str,
    columns: &[String],
    rows: Vec<Vec<QueryParam>>,
    returning: Option<&str>,
    casts: Option<&ColumnTypes>,
) -> DbResult<Statement> {
    let mut b = SqlBuilder::new(db_type, entity).with_casts(casts);
    b.push("INSERT INTO ");
    b.push_table(table)?;

    if columns.is_empty() {
        match db_type {
            DatabaseType::MySQL => b.push(" () VALUES ()"),
            DatabaseType::PostgreSQL | DatabaseType::SQLite => b.push(" DEFAULT VALUES"),
        };
    } else {
        b.push(" (");
        b.push_column_list(columns)?;
        b.push(") VALUES ");
        for (i, row) in rows.into_iter().enumerate() {
            if i > 0 {
                b.push(", ");
            }
            b.push("(");
            for (j, (column, value)) in columns.iter().zip(row).enumerate() {
                if j > 0 {
                    b.push(", ");
                }
                b.push_column_value(column, value);
            }
            b.push(")");
        }
    }

    if let Some(key) = returning {
        b.push(" RETURNING ");
        b.push_ident(key)?;
    }
    Ok(b.finish())
}

pub(crate) fn update(
    db_type: DatabaseType,
    entity: &str,
    table: &str,
    assignments: Vec<(String, QueryParam)>,
    key: &str,
    key_value: QueryParam,
    casts: Option<&ColumnTypes>,
) -> DbResult<Statement> {
    let mut b = SqlBuilder::new(db_type, entity).with_casts(casts);
    b.push("UPDATE ");
    b.push_table(table)?;
    b.push(" SET ");
    for (i, (column, value)) in assignments.into_iter().enumerate() {
        if i > 0 {
            b.push(", ");
        }
        b.push_ident(&column)?;
        b.push(" = ");
        b.push_column_value(&column, value);
    }
    b.push(" WHERE ");
    b.push_filter(&Filter::Compare {
        column: key.to_string(),
        op: CompareOp::Eq,
        value: key_value,
    })?;
    Ok(b.finish())
}

pub(crate) fn delete(
    db_type: DatabaseType,
    entity: &str,
    table: &str,
    filter: Option<&Filter>,
    casts: Option<&ColumnTypes>,
) -> DbResult<Statement> {
    let mut b = SqlBuilder::new(db_type, entity).with_casts(casts);
    b.push("DELETE FROM ");
    b.push_table(table)?;
    b.push_where(filter)?;
    Ok(b.finish())
}

/// `COPY t (cols) FROM STDIN` for the PostgreSQL bulk path.
pub(crate) fn copy_from_stdin(entity: &str, table: &str, columns: &[String]) -> DbResult<String> {
    let mut b = SqlBuilder::new(DatabaseType::PostgreSQL, entity);
    b.push("COPY ");
    b.push_table(table)?;
    b.push(" (");
    b.push_column_list(columns)?;
    b.push(") FROM STDIN WITH (FORMAT csv)");
    Ok(b.finish().sql)
}

/// Encode rows as PostgreSQL COPY CSV.
///
/// NULL is an unquoted empty field; every string is quoted so an empty string
/// stays distinct from NULL.
pub(crate) fn encode_copy_csv(rows: &[Vec<QueryParam>]) -> Vec<u8> {
    let mut out = String::new();
    for row in rows {
        for (i, value) in row.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            match value {
                QueryParam::Null => {}
                QueryParam::Bool(v) => out.push_str(if *v { "true" } else { "false" }),
                QueryParam::Int(v) => {
                    let _ = write!(out, "{}", v);
                }
                QueryParam::Float(v) => {
                    if v.is_nan() {
                        out.push_str("NaN");
                    } else if v.is_infinite() {
                        out.push_str(if *v > 0.0 { "Infinity" } else { "-Infinity" });
                    } else {
                        let _ = write!(out, "{}", v);
                    }
                }
                QueryParam::String(v) => push_csv_quoted(&mut out, v),
                QueryParam::Bytes(v) => {
                    let mut hex = String::with_capacity(2 + v.len() * 2);
                    hex.push_str("\\x");
                    for byte in v {
                        let _ = write!(hex, "{:02x}", byte);
                    }
                    push_csv_quoted(&mut out, &hex);
                }
                QueryParam::Json(v) => push_csv_quoted(&mut out, &v.to_string()),
            }
        }
        out.push('\n');
    }
    out.into_bytes()
}

fn push_csv_quoted(out: &mut String, value: &str) {
    out.push('"');
    for c in value.chars() {
        if c == '"' {
            out.push('"');
        }
        out.push(c);
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_identifier_validation() {
        assert!(is_valid_identifier("user_id"));
        assert!(is_valid_identifier("_hidden"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("1abc"));
        assert!(!is_valid_identifier("name; DROP TABLE x"));
        assert!(!is_valid_identifier("a\"b"));
    }

    #[test]
    fn test_quote_per_dialect() {
        assert_eq!(
            quote_ident(DatabaseType::MySQL, "name", "User").unwrap(),
            "`name`"
        );
        assert_eq!(
            quote_ident(DatabaseType::PostgreSQL, "name", "User").unwrap(),
            "\"name\""
        );
        assert_eq!(
            quote_table(DatabaseType::PostgreSQL, "sales.orders", "Order").unwrap(),
            "\"sales\".\"orders\""
        );
        assert!(matches!(
            quote_ident(DatabaseType::SQLite, "bad name", "User"),
            Err(DbError::InvalidFieldSelector { .. })
        ));
    }

    #[test]
    fn test_postgres_placeholders_are_numbered() {
        let filter = Filter::And(vec![
            Filter::Compare {
                column: "age".into(),
                op: CompareOp::Ge,
                value: QueryParam::Int(18),
            },
            Filter::Like {
                column: "name".into(),
                pattern: "A%".into(),
            },
        ]);
        let stmt = select(
            DatabaseType::PostgreSQL,
            "User",
            &SelectSpec {
                table: "users",
                columns: &columns(&["id", "name"]),
                filter: Some(&filter),
                casts: None,
                order_by: &[("id", true)],
                limit: Some(20),
                offset: Some(40),
            },
        )
        .unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT \"id\", \"name\" FROM \"users\" WHERE (\"age\" >= $1) AND (\"name\" LIKE $2) ORDER BY \"id\" DESC LIMIT 20 OFFSET 40"
        );
        assert_eq!(stmt.params.len(), 2);
    }

    #[test]
    fn test_order_by_renders_every_key() {
        let stmt = select(
            DatabaseType::MySQL,
            "User",
            &SelectSpec {
                table: "users",
                columns: &columns(&["id"]),
                filter: None,
                casts: None,
                order_by: &[("score", true), ("id", true)],
                limit: Some(5),
                offset: None,
            },
        )
        .unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT `id` FROM `users` ORDER BY `score` DESC, `id` DESC LIMIT 5"
        );

        let stmt = select(
            DatabaseType::SQLite,
            "User",
            &SelectSpec {
                table: "users",
                columns: &columns(&["id"]),
                filter: None,
                casts: None,
                order_by: &[],
                limit: None,
                offset: None,
            },
        )
        .unwrap();
        assert_eq!(stmt.sql, "SELECT \"id\" FROM \"users\"");
    }

    #[test]
    fn test_null_comparisons_render_as_literals() {
        let filter = Filter::Or(vec![
            Filter::Compare {
                column: "email".into(),
                op: CompareOp::Eq,
                value: QueryParam::Null,
            },
            Filter::Compare {
                column: "phone".into(),
                op: CompareOp::Ne,
                value: QueryParam::Null,
            },
        ]);
        let stmt = count(DatabaseType::SQLite, "User", "users", Some(&filter), None).unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT COUNT(*) AS total FROM \"users\" WHERE (\"email\" IS NULL) OR (\"phone\" IS NOT NULL)"
        );
        assert!(stmt.params.is_empty());
    }

    #[test]
    fn test_empty_in_matches_nothing() {
        let filter = Filter::In {
            column: "id".into(),
            values: vec![],
        };
        let stmt = delete(DatabaseType::MySQL, "User", "users", Some(&filter), None).unwrap();
        assert_eq!(stmt.sql, "DELETE FROM `users` WHERE 1 = 0");
    }

    #[test]
    fn test_not_and_empty_groups() {
        let filter = Filter::Not(Box::new(Filter::And(vec![])));
        let stmt = exists(DatabaseType::SQLite, "User", "users", Some(&filter), None).unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT 1 AS present FROM \"users\" WHERE NOT (1 = 1) LIMIT 1"
        );
    }

    #[test]
    fn test_insert_multi_row_with_null_and_returning() {
        let stmt = insert(
            DatabaseType::PostgreSQL,
            "User",
            "users",
            &columns(&["name", "email"]),
            vec![
                vec![QueryParam::from("a"), QueryParam::Null],
                vec![QueryParam::from("b"), QueryParam::from("b@x")],
            ],
            Some("id"),
            None,
        )
        .unwrap();
        assert_eq!(
            stmt.sql,
            "INSERT INTO \"users\" (\"name\", \"email\") VALUES ($1, NULL), ($2, $3) RETURNING \"id\""
        );
        assert_eq!(stmt.params.len(), 3);
    }

    #[test]
    fn test_insert_default_values() {
        let stmt = insert(DatabaseType::SQLite, "Counter", "counters", &[], vec![], None, None).unwrap();
        assert_eq!(stmt.sql, "INSERT INTO \"counters\" DEFAULT VALUES");
        let stmt = insert(DatabaseType::MySQL, "Counter", "counters", &[], vec![], None, None).unwrap();
        assert_eq!(stmt.sql, "INSERT INTO `counters` () VALUES ()");
    }

    #[test]
    fn test_update_statement() {
        let stmt = update(
            DatabaseType::MySQL,
            "User",
            "users",
            vec![
                ("name".into(), QueryParam::from("x")),
                ("email".into(), QueryParam::Null),
            ],
            "id",
            QueryParam::Int(3),
            None,
        )
        .unwrap();
        assert_eq!(
            stmt.sql,
            "UPDATE `users` SET `name` = ?, `email` = NULL WHERE `id` = ?"
        );
        assert_eq!(stmt.params, vec![QueryParam::from("x"), QueryParam::Int(3)]);
    }

    #[test]
    fn test_text_binds_cast_to_declared_column_types() {
        let casts: ColumnTypes = [
            ("created_at".to_string(), "timestamp without time zone".to_string()),
            ("ref".to_string(), "uuid".to_string()),
        ]
        .into_iter()
        .collect();

        let stmt = update(
            DatabaseType::PostgreSQL,
            "Event",
            "events",
            vec![
                ("created_at".into(), QueryParam::from("2026-01-01T00:00:00")),
                ("title".into(), QueryParam::from("launch")),
            ],
            "ref",
            QueryParam::from("6f1c0d7e-8a55-4c53-9b8e-2f0c5a3c1d10"),
            Some(&casts),
        )
        .unwrap();
        assert_eq!(
            stmt.sql,
            "UPDATE \"events\" SET \"created_at\" = CAST($1 AS timestamp without time zone), \"title\" = $2 WHERE \"ref\" = CAST($3 AS uuid)"
        );

        // non-text values bind with their own type
        let filter = Filter::In {
            column: "created_at".into(),
            values: vec![QueryParam::from("2026-01-01"), QueryParam::Null],
        };
        let stmt = count(DatabaseType::PostgreSQL, "Event", "events", Some(&filter), Some(&casts)).unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT COUNT(*) AS total FROM \"events\" WHERE \"created_at\" IN (CAST($1 AS timestamp without time zone), NULL)"
        );
    }

    #[test]
    fn test_needs_text_cast() {
        assert!(needs_text_cast("timestamp with time zone"));
        assert!(needs_text_cast("uuid"));
        assert!(needs_text_cast("numeric(10,2)"));
        assert!(!needs_text_cast("text"));
        assert!(!needs_text_cast("character varying(100)"));
        assert!(!needs_text_cast("character(2)"));
    }

    #[test]
    fn test_copy_statement_and_csv() {
        let sql = copy_from_stdin("User", "users", &columns(&["name", "meta"])).unwrap();
        assert_eq!(
            sql,
            "COPY \"users\" (\"name\", \"meta\") FROM STDIN WITH (FORMAT csv)"
        );

        let csv = encode_copy_csv(&[
            vec![QueryParam::from("say \"hi\""), QueryParam::Json(json!({"a": 1}))],
            vec![QueryParam::from(""), QueryParam::Null],
            vec![QueryParam::Bool(true), QueryParam::Bytes(vec![0xde, 0xad])],
        ]);
        assert_eq!(
            String::from_utf8(csv).unwrap(),
            "\"say \"\"hi\"\"\",\"{\"\"a\"\":1}\"\n\"\",\ntrue,\"\\xdead\"\n"
        );
    }
}
