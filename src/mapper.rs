//! Entity ↔ DTO projection.
//!
//! A [`Mapper`] holds explicit conversion functions keyed by
//! `(source type, destination type)`. It is built once with a
//! [`MapperBuilder`] and shared as `Arc<Mapper>`.

use crate::error::{DbError, DbResult};
use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::fmt;

type MapFn = Box<dyn Fn(&dyn Any) -> Option<Box<dyn Any + Send>> + Send + Sync>;

struct Registration {
    from: &'static str,
    to: &'static str,
    map: MapFn,
}

/// Registry of projection functions.
#[derive(Default)]
pub struct Mapper {
    mappings: HashMap<(TypeId, TypeId), Registration>,
}

impl fmt::Debug for Mapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut pairs: Vec<String> = self
            .mappings
            .values()
            .map(|r| format!("{} -> {}", r.from, r.to))
            .collect();
        pairs.sort();
        f.debug_struct("Mapper").field("mappings", &pairs).finish()
    }
}

impl Mapper {
    pub fn builder() -> MapperBuilder {
        MapperBuilder::default()
    }

    /// An empty mapper: every projection fails with `MappingNotRegistered`.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn supports<S: 'static, D: 'static>(&self) -> bool {
        self.mappings
            .contains_key(&(TypeId::of::<S>(), TypeId::of::<D>()))
    }

    pub fn map<S: 'static, D: Send + 'static>(&self, source: &S) -> DbResult<D> {
        let registration = self
            .mappings
            .get(&(TypeId::of::<S>(), TypeId::of::<D>()))
            .ok_or_else(|| DbError::mapping_not_registered(type_name::<S>(), type_name::<D>()))?;

        (registration.map)(source)
            .and_then(|boxed| boxed.downcast::<D>().ok())
            .map(|d| *d)
            .ok_or_else(|| DbError::mapping_not_registered(type_name::<S>(), type_name::<D>()))
    }

    /// Map every item, preserving order.
    pub fn map_all<S: 'static, D: Send + 'static>(&self, sources: &[S]) -> DbResult<Vec<D>> {
        sources.iter().map(|s| self.map::<S, D>(s)).collect()
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

/// Collects projection functions before the mapper is shared.
#[derive(Default)]
pub struct MapperBuilder {
    mapper: Mapper,
}

impl MapperBuilder {
    /// Register `S → D`. A second registration for the same pair replaces
    /// the first.
    pub fn register<S, D, F>(mut self, f: F) -> Self
    where
        S: 'static,
        D: Send + 'static,
        F: Fn(&S) -> D + Send + Sync + 'static,
    {
        let map: MapFn = Box::new(move |any: &dyn Any| {
            any.downcast_ref::<S>()
                .map(|s| Box::new(f(s)) as Box<dyn Any + Send>)
        });
        self.mapper.mappings.insert(
            (TypeId::of::<S>(), TypeId::of::<D>()),
            Registration {
                from: type_name::<S>(),
                to: type_name::<D>(),
                map,
            },
        );
        self
    }

    /// Register `S → D` through `D: From<&S>`.
    pub fn register_from<S, D>(self) -> Self
    where
        S: 'static,
        D: for<'a> From<&'a S> + Send + 'static,
    {
        self.register::<S, D, _>(|s| D::from(s))
    }

    /// Register both directions of a pair.
    pub fn register_pair<A, B, F, G>(self, a_to_b: F, b_to_a: G) -> Self
    where
        A: Send + 'static,
        B: Send + 'static,
        F: Fn(&A) -> B + Send + Sync + 'static,
        G: Fn(&B) -> A + Send + Sync + 'static,
    {
        self.register::<A, B, F>(a_to_b).register::<B, A, G>(b_to_a)
    }

    pub fn build(self) -> Mapper {
        self.mapper
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct User {
        id: i64,
        first: String,
        last: String,
    }

    #[derive(Debug, PartialEq)]
    struct UserSummary {
        id: i64,
        display: String,
    }

    impl From<&User> for UserSummary {
        fn from(u: &User) -> Self {
            Self {
                id: u.id,
                display: format!("{} {}", u.first, u.last),
            }
        }
    }

    fn user(id: i64) -> User {
        User {
            id,
            first: "Ada".to_string(),
            last: "Lovelace".to_string(),
        }
    }

    #[test]
    fn test_register_and_map() {
        let mapper = Mapper::builder()
            .register::<User, i64, _>(|u| u.id)
            .build();
        assert!(mapper.supports::<User, i64>());
        assert_eq!(mapper.map::<User, i64>(&user(7)).unwrap(), 7);
    }

    #[test]
    fn test_register_from() {
        let mapper = Mapper::builder().register_from::<User, UserSummary>().build();
        let summary: UserSummary = mapper.map(&user(1)).unwrap();
        assert_eq!(summary.display, "Ada Lovelace");
    }

    #[test]
    fn test_register_pair() {
        let mapper = Mapper::builder()
            .register_pair::<User, String, _, _>(
                |u| u.first.clone(),
                |s| User {
                    id: 0,
                    first: s.clone(),
                    last: String::new(),
                },
            )
            .build();
        assert_eq!(mapper.len(), 2);
        let back: User = mapper.map(&"Grace".to_string()).unwrap();
        assert_eq!(back.first, "Grace");
    }

    #[test]
    fn test_map_all_preserves_order() {
        let mapper = Mapper::builder().register_from::<User, UserSummary>().build();
        let out: Vec<UserSummary> = mapper.map_all(&[user(3), user(1), user(2)]).unwrap();
        let ids: Vec<i64> = out.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![3, 1, 2]);
    }

    #[test]
    fn test_missing_mapping() {
        let mapper = Mapper::empty();
        assert!(mapper.is_empty());
        let result = mapper.map::<User, UserSummary>(&user(1));
        assert!(matches!(result, Err(DbError::MappingNotRegistered { .. })));
        // empty input still needs no mapping lookups
        assert!(mapper.map_all::<User, UserSummary>(&[]).unwrap().is_empty());
    }
}
