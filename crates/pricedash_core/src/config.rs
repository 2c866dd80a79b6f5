//! Repository table configuration.
//!
//! # Responsibility
//! - Describe which table a repository talks to and which secondary indexes
//!   it may route queries through.
//! - Validate declarations before any request reaches the store.
//!
//! # Invariants
//! - Secondary indexes are addressable only after registration here.
//! - An index's partition and range attributes are distinct.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Key attributes of one secondary index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDescriptor {
    pub partition_key: String,
    pub range_key: String,
}

impl IndexDescriptor {
    pub fn new(partition_key: impl Into<String>, range_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            range_key: range_key.into(),
        }
    }
}

/// Options for one table-backed repository.
///
/// Wire shape: `{"tableName": "...", "indexes": {"name": {"partitionKey": "...", "rangeKey": "..."}}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableOptions {
    pub table_name: String,
    #[serde(default)]
    pub indexes: BTreeMap<String, IndexDescriptor>,
}

impl TableOptions {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            indexes: BTreeMap::new(),
        }
    }

    /// Registers a secondary index by name.
    pub fn with_index(mut self, name: impl Into<String>, index: IndexDescriptor) -> Self {
        self.indexes.insert(name.into(), index);
        self
    }

    /// Parses and validates options from JSON.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let options: Self =
            serde_json::from_str(raw).map_err(|err| ConfigError::Malformed(err.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.table_name.trim().is_empty() {
            return Err(ConfigError::EmptyTableName);
        }
        if !is_valid_resource_name(&self.table_name) {
            return Err(ConfigError::InvalidTableName(self.table_name.clone()));
        }

        for (name, index) in &self.indexes {
            if !is_valid_resource_name(name) {
                return Err(ConfigError::InvalidIndexName(name.clone()));
            }
            if index.partition_key.is_empty() || index.range_key.is_empty() {
                return Err(ConfigError::MissingIndexKey(name.clone()));
            }
            if index.partition_key == index.range_key {
                return Err(ConfigError::DuplicateIndexKey(name.clone()));
            }
        }
        Ok(())
    }
}

// Table and index names: 3..=255 chars of [A-Za-z0-9_.-].
fn is_valid_resource_name(value: &str) -> bool {
    (3..=255).contains(&value.len())
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Malformed(String),
    EmptyTableName,
    InvalidTableName(String),
    InvalidIndexName(String),
    MissingIndexKey(String),
    DuplicateIndexKey(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(details) => write!(f, "malformed table options: {details}"),
            Self::EmptyTableName => write!(f, "table name cannot be empty"),
            Self::InvalidTableName(name) => write!(f, "invalid table name: `{name}`"),
            Self::InvalidIndexName(name) => write!(f, "invalid index name: `{name}`"),
            Self::MissingIndexKey(name) => {
                write!(f, "index `{name}` must declare partition and range keys")
            }
            Self::DuplicateIndexKey(name) => {
                write!(f, "index `{name}` uses the same attribute for partition and range key")
            }
        }
    }
}

impl Error for ConfigError {}
