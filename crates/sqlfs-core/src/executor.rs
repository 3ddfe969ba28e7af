// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Statement executor interface consumed by the stores
//!
//! The stores only ever talk to the backing database through [`Executor`].
//! Statement templates may contain [`TABLE_PREFIX_TOKEN`], which the executor
//! replaces with the configured table prefix before running them.

use crate::error::{DbError, DbResult};

/// Literal placeholder substituted with the table prefix in every template
pub const TABLE_PREFIX_TOKEN: &str = "{%t_prefix%}";

/// Replace every prefix placeholder in `sql` with `prefix`
pub fn expand_table_prefix(sql: &str, prefix: &str) -> String {
    sql.replace(TABLE_PREFIX_TOKEN, prefix)
}

/// A bound argument or a fetched column value
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        // SQLite integers are signed 64-bit; inodes and sizes stay far below i64::MAX
        Value::Integer(v as i64)
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Blob(v.to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// One fetched row, columns in select order
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Row {
    values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn get_opt_i64(&self, index: usize) -> DbResult<Option<i64>> {
        match self.values.get(index) {
            Some(Value::Integer(v)) => Ok(Some(*v)),
            Some(Value::Null) => Ok(None),
            _ => Err(DbError::Column {
                index,
                expected: "integer or null",
            }),
        }
    }

    pub fn get_i64(&self, index: usize) -> DbResult<i64> {
        self.get_opt_i64(index)?.ok_or(DbError::Column {
            index,
            expected: "integer",
        })
    }

    pub fn get_u64(&self, index: usize) -> DbResult<u64> {
        u64::try_from(self.get_i64(index)?).map_err(|_| DbError::Column {
            index,
            expected: "non-negative integer",
        })
    }

    pub fn get_u32(&self, index: usize) -> DbResult<u32> {
        u32::try_from(self.get_i64(index)?).map_err(|_| DbError::Column {
            index,
            expected: "32-bit unsigned integer",
        })
    }

    pub fn get_text(&self, index: usize) -> DbResult<&str> {
        match self.values.get(index) {
            Some(Value::Text(v)) => Ok(v.as_str()),
            _ => Err(DbError::Column {
                index,
                expected: "text",
            }),
        }
    }

    /// Blob column; text is accepted as its UTF-8 bytes and NULL as empty
    pub fn get_blob(&self, index: usize) -> DbResult<Vec<u8>> {
        match self.values.get(index) {
            Some(Value::Blob(v)) => Ok(v.clone()),
            Some(Value::Text(v)) => Ok(v.clone().into_bytes()),
            Some(Value::Null) => Ok(Vec::new()),
            _ => Err(DbError::Column {
                index,
                expected: "blob",
            }),
        }
    }
}

/// Outcome of a data-modifying statement
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub rows_affected: u64,
    pub last_insert_id: i64,
}

/// A statement template with its arguments, used for atomic batches
#[derive(Clone, Debug, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub args: Vec<Value>,
    /// When set, the batch fails (and rolls back) unless exactly this many rows change
    pub expected_rows: Option<u64>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            args: Vec::new(),
            expected_rows: None,
        }
    }

    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn expect_rows(mut self, rows: u64) -> Self {
        self.expected_rows = Some(rows);
        self
    }
}

/// Parameterized statement/query executor over the backing store
///
/// Implementations own connection liveness. Every call blocks until the
/// store answers; none of them retries on failure.
#[cfg_attr(test, mockall::automock)]
pub trait Executor: Send + Sync {
    /// Run a data-modifying statement
    fn exec(&self, sql: &str, args: &[Value]) -> DbResult<ExecResult>;

    /// Run a query and collect every row
    fn query(&self, sql: &str, args: &[Value]) -> DbResult<Vec<Row>>;

    /// Run a query expected to yield at most one row
    fn query_row(&self, sql: &str, args: &[Value]) -> DbResult<Option<Row>>;

    /// Run every statement in one transaction; nothing is applied unless all succeed
    fn exec_atomic(&self, statements: &[Statement]) -> DbResult<Vec<ExecResult>>;

    /// Completed reconnects so far; callers record it before a failing call
    fn generation(&self) -> u64;

    /// Replace the connection pool with a freshly opened one
    ///
    /// `observed` is the [`generation`](Executor::generation) the caller saw
    /// when its failure happened. If a reconnect has completed since then,
    /// this returns without opening another pool.
    fn reconnect(&self, observed: u64) -> DbResult<()>;

    /// Database identifier from the DSN
    fn database(&self) -> String;

    /// Configured table prefix, empty when none
    fn table_prefix(&self) -> String;

    fn driver_name(&self) -> &'static str;
}
