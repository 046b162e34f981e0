//! Connection registry: database code → connection descriptor.
//!
//! The registry is loaded once and never changes afterwards. Every entry is
//! validated at load time, so a bad `dbType` or connection URL is reported
//! before any repository is requested.

use crate::error::{DbError, DbResult};
use crate::models::ConnectionDescriptor;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Section name under which the code map may be nested.
pub const CONNECTION_STRINGS_SECTION: &str = "ConnectionStrings";

#[derive(Debug, Deserialize)]
struct RegistryEntry {
    #[serde(
        rename = "connectionString",
        alias = "ConnectionString",
        alias = "connection_string"
    )]
    connection_string: String,
    #[serde(default, rename = "dbType", alias = "DbType", alias = "db_type")]
    db_type: Option<String>,
}

/// Immutable map of database codes to their descriptors.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    entries: HashMap<String, ConnectionDescriptor>,
}

impl ConnectionRegistry {
    /// Build a registry from descriptors that were already validated.
    ///
    /// A later descriptor with the same code replaces an earlier one.
    pub fn from_descriptors(descriptors: impl IntoIterator<Item = ConnectionDescriptor>) -> Self {
        Self {
            entries: descriptors
                .into_iter()
                .map(|d| (d.code.clone(), d))
                .collect(),
        }
    }

    /// Parse a registry document.
    ///
    /// Accepts either a bare `{ code: entry }` map or the same map nested
    /// under `"ConnectionStrings"`.
    pub fn from_json_str(json: &str) -> DbResult<Self> {
        let document: JsonValue = serde_json::from_str(json).map_err(|e| {
            DbError::configuration(
                format!("Connection registry is not valid JSON: {}", e),
                "Check the registry file syntax",
            )
        })?;

        let section = match document {
            JsonValue::Object(mut map) => match map.remove(CONNECTION_STRINGS_SECTION) {
                Some(section) => section,
                None => JsonValue::Object(map),
            },
            _ => {
                return Err(DbError::configuration(
                    "Connection registry must be a JSON object",
                    "Use { \"Default\": { \"connectionString\": \"...\" } }",
                ));
            }
        };

        let raw: HashMap<String, RegistryEntry> =
            serde_json::from_value(section).map_err(|e| {
                DbError::configuration(
                    format!("Invalid connection registry entry: {}", e),
                    "Every entry needs a connectionString and an optional dbType",
                )
            })?;

        let mut entries = HashMap::with_capacity(raw.len());
        for (code, entry) in raw {
            let descriptor = ConnectionDescriptor::new(
                code.as_str(),
                &entry.connection_string,
                entry.db_type.as_deref(),
            )?;
            debug!(
                code = %descriptor.code,
                db_type = %descriptor.db_type,
                "Registered database code"
            );
            entries.insert(code, descriptor);
        }

        Ok(Self { entries })
    }

    /// Read and parse a registry file.
    pub fn from_json_file(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            DbError::configuration(
                format!("Cannot read connection registry {}: {}", path.display(), e),
                "Check the registry path and file permissions",
            )
        })?;
        Self::from_json_str(&json)
    }

    pub fn get(&self, code: &str) -> Option<&ConnectionDescriptor> {
        self.entries.get(code)
    }

    pub fn contains(&self, code: &str) -> bool {
        self.entries.contains_key(code)
    }

    /// Registered codes, sorted.
    pub fn codes(&self) -> Vec<&str> {
        let mut codes: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        codes.sort_unstable();
        codes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
