//! Entity contract and the typed query surface.
//!
//! Callers describe filters with [`Field`] and [`Predicate`] values instead of
//! SQL fragments; the repository compiles them into dialect SQL with bound
//! parameters.

use crate::error::{DbError, DbResult};
use crate::models::QueryParam;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};
use std::any::type_name;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{BitAnd, BitOr, Not};

/// A row type stored in a single table.
///
/// Serialized field names are the column names. The column set is taken from
/// the serialized form of `Self::default()`, so every column must serialize
/// (no `skip_serializing_if`).
pub trait Entity: Serialize + DeserializeOwned + Default + Send + Sync + 'static {
    /// Table name, optionally schema-qualified (`schema.table`).
    const TABLE: &'static str;

    /// Primary key column.
    const KEY: &'static str = "id";

    /// Whether the store generates the key on insert.
    const GENERATED_KEY: bool = true;

    /// Short type name used in error and log context.
    fn entity_name() -> &'static str {
        let full = type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full)
    }
}

/// Serialize an entity into its column map.
pub(crate) fn to_columns<E: Entity>(entity: &E) -> DbResult<Map<String, JsonValue>> {
    match serde_json::to_value(entity) {
        Ok(JsonValue::Object(map)) => Ok(map),
        Ok(other) => Err(DbError::invalid_input(format!(
            "{} must serialize to an object, got {}",
            E::entity_name(),
            json_kind(&other)
        ))),
        Err(e) => Err(DbError::invalid_input(format!(
            "{} could not be serialized: {}",
            E::entity_name(),
            e
        ))),
    }
}

/// Ordered column names of an entity.
pub(crate) fn column_names<E: Entity>() -> DbResult<Vec<String>> {
    Ok(to_columns(&E::default())?.into_iter().map(|(k, _)| k).collect())
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// A typed reference to one column of `E`.
///
/// Declare them as associated constants next to the entity:
///
/// ```ignore
/// impl User {
///     pub const NAME: Field<User> = Field::new("name");
/// }
/// ```
pub struct Field<E> {
    name: &'static str,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for Field<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for Field<E> {}

impl<E> fmt::Debug for Field<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Field").field(&self.name).finish()
    }
}

impl<E> PartialEq for Field<E> {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl<E> Eq for Field<E> {}

impl<E> Field<E> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _entity: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn compare(self, op: CompareOp, value: impl Into<QueryParam>) -> Predicate<E> {
        Predicate::from_filter(Filter::Compare {
            column: self.name.to_string(),
            op,
            value: value.into(),
        })
    }

    pub fn eq(self, value: impl Into<QueryParam>) -> Predicate<E> {
        self.compare(CompareOp::Eq, value)
    }

    pub fn ne(self, value: impl Into<QueryParam>) -> Predicate<E> {
        self.compare(CompareOp::Ne, value)
    }

    pub fn gt(self, value: impl Into<QueryParam>) -> Predicate<E> {
        self.compare(CompareOp::Gt, value)
    }

    pub fn ge(self, value: impl Into<QueryParam>) -> Predicate<E> {
        self.compare(CompareOp::Ge, value)
    }

    pub fn lt(self, value: impl Into<QueryParam>) -> Predicate<E> {
        self.compare(CompareOp::Lt, value)
    }

    pub fn le(self, value: impl Into<QueryParam>) -> Predicate<E> {
        self.compare(CompareOp::Le, value)
    }

    /// SQL `LIKE` with the caller's pattern (`%`/`_` wildcards).
    pub fn like(self, pattern: impl Into<String>) -> Predicate<E> {
        Predicate::from_filter(Filter::Like {
            column: self.name.to_string(),
            pattern: pattern.into(),
        })
    }

    /// Membership test. An empty set matches nothing.
    pub fn is_in<I, V>(self, values: I) -> Predicate<E>
    where
        I: IntoIterator<Item = V>,
        V: Into<QueryParam>,
    {
        Predicate::from_filter(Filter::In {
            column: self.name.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        })
    }

    pub fn is_null(self) -> Predicate<E> {
        Predicate::from_filter(Filter::IsNull(self.name.to_string()))
    }

    pub fn is_not_null(self) -> Predicate<E> {
        Predicate::from_filter(Filter::IsNotNull(self.name.to_string()))
    }
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
        }
    }
}

/// Untyped filter tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Compare {
        column: String,
        op: CompareOp,
        value: QueryParam,
    },
    Like {
        column: String,
        pattern: String,
    },
    In {
        column: String,
        values: Vec<QueryParam>,
    },
    IsNull(String),
    IsNotNull(String),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    /// Every column the filter references, in visiting order.
    pub fn columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Compare { column, .. }
            | Self::Like { column, .. }
            | Self::In { column, .. }
            | Self::IsNull(column)
            | Self::IsNotNull(column) => out.push(column),
            Self::And(items) | Self::Or(items) => {
                for item in items {
                    item.collect_columns(out);
                }
            }
            Self::Not(inner) => inner.collect_columns(out),
        }
    }
}

/// A boolean condition over rows of `E`.
///
/// Combine with `&`, `|` and `!`.
pub struct Predicate<E> {
    filter: Filter,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for Predicate<E> {
    fn clone(&self) -> Self {
        Self::from_filter(self.filter.clone())
    }
}

impl<E> fmt::Debug for Predicate<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Predicate").field(&self.filter).finish()
    }
}

impl<E> PartialEq for Predicate<E> {
    fn eq(&self, other: &Self) -> bool {
        self.filter == other.filter
    }
}

impl<E> Predicate<E> {
    fn from_filter(filter: Filter) -> Self {
        Self {
            filter,
            _entity: PhantomData,
        }
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    pub fn into_filter(self) -> Filter {
        self.filter
    }

    pub fn and(self, other: Predicate<E>) -> Predicate<E> {
        let items = match (self.filter, other.filter) {
            (Filter::And(mut left), Filter::And(right)) => {
                left.extend(right);
                left
            }
            (Filter::And(mut left), right) => {
                left.push(right);
                left
            }
            (left, right) => vec![left, right],
        };
        Self::from_filter(Filter::And(items))
    }

    pub fn or(self, other: Predicate<E>) -> Predicate<E> {
        let items = match (self.filter, other.filter) {
            (Filter::Or(mut left), Filter::Or(right)) => {
                left.extend(right);
                left
            }
            (Filter::Or(mut left), right) => {
                left.push(right);
                left
            }
            (left, right) => vec![left, right],
        };
        Self::from_filter(Filter::Or(items))
    }

    pub fn negate(self) -> Predicate<E> {
        match self.filter {
            Filter::Not(inner) => Self::from_filter(*inner),
            other => Self::from_filter(Filter::Not(Box::new(other))),
        }
    }
}

impl<E> BitAnd for Predicate<E> {
    type Output = Predicate<E>;

    fn bitand(self, rhs: Self) -> Self::Output {
        self.and(rhs)
    }
}

impl<E> BitOr for Predicate<E> {
    type Output = Predicate<E>;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.or(rhs)
    }
}

impl<E> Not for Predicate<E> {
    type Output = Predicate<E>;

    fn not(self) -> Self::Output {
        self.negate()
    }
}

/// A column subset of `E` to load. Unselected fields keep their
/// `Default` values in the returned entities.
pub struct Projection<E> {
    columns: Vec<&'static str>,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for Projection<E> {
    fn clone(&self) -> Self {
        Self {
            columns: self.columns.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E> fmt::Debug for Projection<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Projection").field(&self.columns).finish()
    }
}

impl<E> Projection<E> {
    pub fn new(fields: impl IntoIterator<Item = Field<E>>) -> Self {
        let mut columns: Vec<&'static str> = Vec::new();
        for field in fields {
            if !columns.contains(&field.name) {
                columns.push(field.name);
            }
        }
        Self {
            columns,
            _entity: PhantomData,
        }
    }

    pub fn columns(&self) -> &[&'static str] {
        &self.columns
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Account {
        id: i64,
        owner: String,
        balance: f64,
    }

    impl Entity for Account {
        const TABLE: &'static str = "accounts";
    }

    impl Account {
        const ID: Field<Account> = Field::new("id");
        const OWNER: Field<Account> = Field::new("owner");
        const BALANCE: Field<Account> = Field::new("balance");
    }

    #[test]
    fn test_entity_name() {
        assert_eq!(Account::entity_name(), "Account");
    }

    #[test]
    fn test_column_names_follow_declaration_order() {
        assert_eq!(column_names::<Account>().unwrap(), vec!["id", "owner", "balance"]);
    }

    #[test]
    fn test_compare_builds_filter() {
        let p = Account::OWNER.eq("ann");
        assert_eq!(
            p.filter(),
            &Filter::Compare {
                column: "owner".to_string(),
                op: CompareOp::Eq,
                value: QueryParam::String("ann".to_string()),
            }
        );
    }

    #[test]
    fn test_and_flattens() {
        let p = Account::ID.gt(1) & Account::ID.lt(10) & Account::OWNER.is_not_null();
        match p.into_filter() {
            Filter::And(items) => assert_eq!(items.len(), 3),
            other => panic!("expected And, got {:?}", other),
        }
    }

    #[test]
    fn test_or_and_not() {
        let p = !(Account::BALANCE.lt(0.0) | Account::OWNER.is_null());
        match p.filter() {
            Filter::Not(inner) => assert!(matches!(**inner, Filter::Or(ref v) if v.len() == 2)),
            other => panic!("expected Not, got {:?}", other),
        }
        let double = !!Account::ID.eq(1);
        assert_eq!(double, Account::ID.eq(1));
    }

    #[test]
    fn test_filter_columns() {
        let p = Account::ID.is_in([1, 2]) | (Account::OWNER.like("a%") & Account::BALANCE.ge(5));
        assert_eq!(p.filter().columns(), vec!["id", "owner", "balance"]);
    }

    #[test]
    fn test_projection_dedups() {
        let projection = Projection::new([Account::ID, Account::OWNER, Account::ID]);
        assert_eq!(projection.columns(), &["id", "owner"]);
    }
}
