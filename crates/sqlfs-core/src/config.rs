// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Configuration types for SQLFS

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::DbError;

/// DSN query parameter naming the table prefix
pub const TABLE_PREFIX_PARAM: &str = "tblprefix";

/// Parsed connection string: `<scheme>://<database>[?key=value&...]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dsn {
    scheme: String,
    database: String,
    params: BTreeMap<String, String>,
}

impl Dsn {
    pub fn parse(raw: &str) -> Result<Self, DbError> {
        let (scheme, rest) = raw
            .split_once("://")
            .ok_or_else(|| DbError::InvalidDsn(format!("missing scheme separator in {raw:?}")))?;
        if scheme.is_empty() {
            return Err(DbError::InvalidDsn(format!("empty scheme in {raw:?}")));
        }

        let (database, query) = match rest.split_once('?') {
            Some((database, query)) => (database, Some(query)),
            None => (rest, None),
        };
        if database.is_empty() {
            return Err(DbError::InvalidDsn(format!("empty database in {raw:?}")));
        }

        let mut params = BTreeMap::new();
        for pair in query.into_iter().flat_map(|q| q.split('&')).filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            params.insert(key.to_string(), value.to_string());
        }

        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            database: database.to_string(),
            params,
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Table prefix, empty when the DSN carries none
    pub fn table_prefix(&self) -> &str {
        self.param(TABLE_PREFIX_PARAM).unwrap_or("")
    }
}

impl FromStr for Dsn {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Dsn::parse(s)
    }
}

impl fmt::Display for Dsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.database)?;
        for (i, (key, value)) in self.params.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{sep}{key}={value}")?;
        }
        Ok(())
    }
}

/// Connection pool settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Connections opened per pool (in-memory databases always use one)
    pub max_connections: u32,
    /// How long a statement waits on a locked database before failing
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_connections: 4,
            busy_timeout_ms: 5_000,
        }
    }
}

/// Host configuration, loadable from JSON
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    pub store: StoreConfig,
    /// Background write workers; `None` picks from the environment or CPU count
    pub write_threads: Option<usize>,
    /// Largest single write the kernel is asked to send
    pub max_write_bytes: u32,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            write_threads: None,
            max_write_bytes: 1024 * 1024,
        }
    }
}
