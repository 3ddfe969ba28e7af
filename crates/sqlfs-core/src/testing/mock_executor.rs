// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Fault-injecting executor decorator
//!
//! Wraps a real [`Executor`] and fails selected operations according to a
//! [`FailureBehavior`], so error propagation through the stores can be
//! exercised against a live schema.

use crate::error::{DbError, DbResult};
use crate::executor::{ExecResult, Executor, Row, Statement, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Custom predicate function type for fault injection
pub type FaultPredicate = Arc<dyn Fn(&str, u64) -> Option<DbError> + Send + Sync>;

/// Configurable failure behavior for executor operations
#[derive(Default)]
pub enum FailureBehavior {
    /// Never fail
    #[default]
    AlwaysSucceed,

    /// Fail every call to `op` after the first `count`
    FailAfter {
        op: &'static str,
        count: u64,
        error_fn: Arc<dyn Fn() -> DbError + Send + Sync>,
    },

    /// Fail the first `count` calls to `op`
    FailFor {
        op: &'static str,
        count: u64,
        error_fn: Arc<dyn Fn() -> DbError + Send + Sync>,
    },

    AlwaysFail {
        op: &'static str,
        error_fn: Arc<dyn Fn() -> DbError + Send + Sync>,
    },

    /// Receives (operation_name, call_count); `Some` fails the call
    Custom(FaultPredicate),
}

pub struct FaultyExecutor {
    inner: Arc<dyn Executor>,
    behavior: Mutex<FailureBehavior>,
    call_counts: Mutex<HashMap<String, AtomicU64>>,
}

impl FaultyExecutor {
    pub fn new(inner: Arc<dyn Executor>) -> Self {
        Self::with_behavior(inner, FailureBehavior::AlwaysSucceed)
    }

    pub fn with_behavior(inner: Arc<dyn Executor>, behavior: FailureBehavior) -> Self {
        Self {
            inner,
            behavior: Mutex::new(behavior),
            call_counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_behavior(&self, behavior: FailureBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn call_count(&self, op: &str) -> u64 {
        self.call_counts
            .lock()
            .unwrap()
            .get(op)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn check_fault(&self, op: &str) -> DbResult<()> {
        let mut counts = self.call_counts.lock().unwrap();
        let counter = counts.entry(op.to_string()).or_insert_with(|| AtomicU64::new(0));
        let current = counter.fetch_add(1, Ordering::SeqCst);
        drop(counts);

        let behavior = self.behavior.lock().unwrap();
        let failure = match &*behavior {
            FailureBehavior::AlwaysSucceed => None,
            FailureBehavior::FailAfter {
                op: target,
                count,
                error_fn,
            } => (op == *target && current >= *count).then(|| error_fn()),
            FailureBehavior::FailFor {
                op: target,
                count,
                error_fn,
            } => (op == *target && current < *count).then(|| error_fn()),
            FailureBehavior::AlwaysFail { op: target, error_fn } => {
                (op == *target).then(|| error_fn())
            }
            FailureBehavior::Custom(predicate) => predicate(op, current),
        };
        failure.map_or(Ok(()), Err)
    }
}

impl Executor for FaultyExecutor {
    fn exec(&self, sql: &str, args: &[Value]) -> DbResult<ExecResult> {
        self.check_fault("exec")?;
        self.inner.exec(sql, args)
    }

    fn query(&self, sql: &str, args: &[Value]) -> DbResult<Vec<Row>> {
        self.check_fault("query")?;
        self.inner.query(sql, args)
    }

    fn query_row(&self, sql: &str, args: &[Value]) -> DbResult<Option<Row>> {
        self.check_fault("query_row")?;
        self.inner.query_row(sql, args)
    }

    fn exec_atomic(&self, statements: &[Statement]) -> DbResult<Vec<ExecResult>> {
        self.check_fault("exec_atomic")?;
        self.inner.exec_atomic(statements)
    }

    fn generation(&self) -> u64 {
        self.inner.generation()
    }

    fn reconnect(&self, observed: u64) -> DbResult<()> {
        self.check_fault("reconnect")?;
        self.inner.reconnect(observed)
    }

    fn database(&self) -> String {
        self.inner.database()
    }

    fn table_prefix(&self) -> String {
        self.inner.table_prefix()
    }

    fn driver_name(&self) -> &'static str {
        self.inner.driver_name()
    }
}

/// A dropped-connection error
pub fn connection_lost() -> DbError {
    DbError::Connection("injected: connection lost".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptors::DescriptorStore;
    use crate::error::FsError;
    use crate::testing::provisioned_in_memory;
    use crate::types::Inode;

    #[test]
    fn passes_through_by_default() {
        let mock = FaultyExecutor::new(provisioned_in_memory().unwrap());
        assert_eq!(mock.query("SELECT inode FROM descriptors", &[]).unwrap().len(), 1);
        assert_eq!(mock.call_count("query"), 1);
        assert_eq!(mock.call_count("exec"), 0);
    }

    #[test]
    fn fail_for_recovers_after_count() {
        let mock = FaultyExecutor::with_behavior(
            provisioned_in_memory().unwrap(),
            FailureBehavior::FailFor {
                op: "query_row",
                count: 2,
                error_fn: Arc::new(connection_lost),
            },
        );
        assert!(mock.query_row("SELECT 1", &[]).is_err());
        assert!(mock.query_row("SELECT 1", &[]).is_err());
        assert!(mock.query_row("SELECT 1", &[]).unwrap().is_some());
    }

    #[test]
    fn fail_after_count() {
        let mock = FaultyExecutor::with_behavior(
            provisioned_in_memory().unwrap(),
            FailureBehavior::FailAfter {
                op: "exec",
                count: 1,
                error_fn: Arc::new(connection_lost),
            },
        );
        assert!(mock.exec("UPDATE descriptors SET size = 0", &[]).is_ok());
        assert!(matches!(
            mock.exec("UPDATE descriptors SET size = 0", &[]),
            Err(DbError::Connection(_))
        ));
    }

    #[test]
    fn custom_predicate_reaches_store_callers() {
        let mock = Arc::new(FaultyExecutor::with_behavior(
            provisioned_in_memory().unwrap(),
            FailureBehavior::Custom(Arc::new(|op, _| {
                (op == "exec").then(|| DbError::Migration("read only".into()))
            })),
        ));
        let store = DescriptorStore::new(mock);
        let root = store.find_root().unwrap().unwrap();
        assert!(matches!(
            store.remove(root.inode, "anything"),
            Err(FsError::Storage(DbError::Migration(_)))
        ));
        assert!(store.find_by_inode(Inode(root.inode.as_u64())).unwrap().is_some());
    }
}
