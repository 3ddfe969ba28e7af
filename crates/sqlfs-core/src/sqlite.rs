// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! SQLite executor for SQLFS
//!
//! Uses `rusqlite` connections held in a small round-robin pool. The pool
//! handle sits behind a reader/writer lock that only guards swapping it:
//! callers clone the current `Arc` and release the lock before running SQL,
//! so a reconnect never serialises unrelated statements.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, Connection, ErrorCode, OpenFlags, TransactionBehavior};
use tracing::{debug, info};

use crate::config::{Dsn, StoreConfig};
use crate::error::{DbError, DbResult};
use crate::executor::{expand_table_prefix, ExecResult, Executor, Row, Statement, Value};

/// Database name selecting an in-memory store
pub const MEMORY_DATABASE: &str = ":memory:";

static MEMORY_DB_COUNTER: AtomicU64 = AtomicU64::new(0);

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Borrowed(match self {
            Value::Null => ValueRef::Null,
            Value::Integer(v) => ValueRef::Integer(*v),
            Value::Real(v) => ValueRef::Real(*v),
            Value::Text(v) => ValueRef::Text(v.as_bytes()),
            Value::Blob(v) => ValueRef::Blob(v.as_slice()),
        }))
    }
}

impl From<ValueRef<'_>> for Value {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(v) => Value::Integer(v),
            ValueRef::Real(v) => Value::Real(v),
            ValueRef::Text(v) => Value::Text(String::from_utf8_lossy(v).into_owned()),
            ValueRef::Blob(v) => Value::Blob(v.to_vec()),
        }
    }
}

/// Map constraint failures onto their typed variants
fn classify(err: rusqlite::Error) -> DbError {
    if let rusqlite::Error::SqliteFailure(ffi_err, message) = &err {
        if ffi_err.code == ErrorCode::ConstraintViolation {
            let detail = message.clone().unwrap_or_else(|| ffi_err.to_string());
            match ffi_err.extended_code {
                rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                    return DbError::UniqueViolation(detail);
                }
                rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY => {
                    return DbError::ForeignKeyViolation(detail);
                }
                _ => {}
            }
        }
    }
    DbError::Sqlite(err)
}

#[derive(Clone, Debug)]
enum OpenTarget {
    File(PathBuf),
    /// `memdb` VFS URI; stays alive while any connection to it is open
    Memory(String),
}

fn open_connection(target: &OpenTarget, busy_timeout: Duration) -> DbResult<Connection> {
    let conn = match target {
        OpenTarget::File(path) => Connection::open(path),
        OpenTarget::Memory(uri) => Connection::open_with_flags(
            uri,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        ),
    }
    .map_err(|e| DbError::Connection(e.to_string()))?;

    conn.busy_timeout(busy_timeout)?;
    // Cascading subtree removal depends on foreign keys, which SQLite enables per connection
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    if matches!(target, OpenTarget::File(_)) {
        // Answers with the resulting mode, so it has to be read as a query
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        debug!(target: "sqlfs::sqlite", journal_mode = %mode, "connection opened");
    }
    conn.query_row("SELECT 1", [], |_| Ok(()))
        .map_err(|e| DbError::Connection(e.to_string()))?;
    Ok(conn)
}

struct SqlitePool {
    connections: Vec<Mutex<Connection>>,
    next: AtomicUsize,
}

impl SqlitePool {
    fn open(target: &OpenTarget, size: usize, busy_timeout: Duration) -> DbResult<Self> {
        let connections = (0..size.max(1))
            .map(|_| open_connection(target, busy_timeout).map(Mutex::new))
            .collect::<DbResult<Vec<_>>>()?;
        Ok(Self {
            connections,
            next: AtomicUsize::new(0),
        })
    }

    /// Take the first idle connection, or wait on the round-robin pick
    fn acquire(&self) -> MutexGuard<'_, Connection> {
        let count = self.connections.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed) % count;
        for i in 0..count {
            if let Ok(guard) = self.connections[(start + i) % count].try_lock() {
                return guard;
            }
        }
        self.connections[start].lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// SQLite-backed [`Executor`]
pub struct SqliteExecutor {
    dsn: Dsn,
    target: OpenTarget,
    pool_size: usize,
    busy_timeout: Duration,
    pool: RwLock<Arc<SqlitePool>>,
    reconnect_lock: Mutex<()>,
    generation: AtomicU64,
}

impl SqliteExecutor {
    /// Open a pool for a `sqlite://` DSN
    pub fn connect(dsn: Dsn, config: &StoreConfig) -> DbResult<Self> {
        if dsn.scheme() != "sqlite" {
            return Err(DbError::InvalidDsn(format!(
                "sqlite executor cannot open scheme {:?}",
                dsn.scheme()
            )));
        }

        let (target, pool_size) = if dsn.database() == MEMORY_DATABASE {
            // A leading slash shares the memdb database between connections;
            // its locks honour the busy timeout, unlike shared-cache table locks
            let n = MEMORY_DB_COUNTER.fetch_add(1, Ordering::Relaxed);
            let uri = format!("file:/sqlfs-mem-{}-{}?vfs=memdb", std::process::id(), n);
            (OpenTarget::Memory(uri), 1)
        } else {
            (
                OpenTarget::File(PathBuf::from(dsn.database())),
                config.max_connections.max(1) as usize,
            )
        };

        let busy_timeout = Duration::from_millis(config.busy_timeout_ms);
        let pool = SqlitePool::open(&target, pool_size, busy_timeout)?;
        debug!(
            target: "sqlfs::sqlite",
            database = dsn.database(),
            pool_size,
            "sqlite pool opened"
        );

        Ok(Self {
            dsn,
            target,
            pool_size,
            busy_timeout,
            pool: RwLock::new(Arc::new(pool)),
            reconnect_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
        })
    }

    /// Private in-memory database with default settings
    pub fn in_memory() -> DbResult<Self> {
        let dsn = Dsn::parse(&format!("sqlite://{MEMORY_DATABASE}"))?;
        Self::connect(dsn, &StoreConfig::default())
    }

    fn pool(&self) -> Arc<SqlitePool> {
        Arc::clone(&self.pool.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn prepare(&self, sql: &str) -> String {
        expand_table_prefix(sql, self.dsn.table_prefix())
    }
}

impl Executor for SqliteExecutor {
    fn exec(&self, sql: &str, args: &[Value]) -> DbResult<ExecResult> {
        let sql = self.prepare(sql);
        let pool = self.pool();
        let conn = pool.acquire();
        let rows = conn
            .execute(&sql, params_from_iter(args.iter()))
            .map_err(classify)?;
        Ok(ExecResult {
            rows_affected: rows as u64,
            last_insert_id: conn.last_insert_rowid(),
        })
    }

    fn query(&self, sql: &str, args: &[Value]) -> DbResult<Vec<Row>> {
        let sql = self.prepare(sql);
        let pool = self.pool();
        let conn = pool.acquire();
        let mut stmt = conn.prepare_cached(&sql).map_err(classify)?;
        let columns = stmt.column_count();
        let rows = stmt
            .query_map(params_from_iter(args.iter()), |row| {
                (0..columns)
                    .map(|i| row.get_ref(i).map(Value::from))
                    .collect::<rusqlite::Result<Vec<_>>>()
            })
            .map_err(classify)?
            .map(|values| values.map(Row::new).map_err(classify))
            .collect::<DbResult<Vec<_>>>()?;
        Ok(rows)
    }

    fn query_row(&self, sql: &str, args: &[Value]) -> DbResult<Option<Row>> {
        Ok(self.query(sql, args)?.into_iter().next())
    }

    fn exec_atomic(&self, statements: &[Statement]) -> DbResult<Vec<ExecResult>> {
        let pool = self.pool();
        let mut conn = pool.acquire();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(classify)?;

        let mut results = Vec::with_capacity(statements.len());
        for (index, statement) in statements.iter().enumerate() {
            let sql = self.prepare(&statement.sql);
            let rows = tx
                .execute(&sql, params_from_iter(statement.args.iter()))
                .map_err(classify)? as u64;
            if let Some(expected) = statement.expected_rows {
                if rows != expected {
                    // Dropping `tx` rolls the batch back
                    return Err(DbError::UnexpectedRowCount {
                        index,
                        expected,
                        actual: rows,
                    });
                }
            }
            results.push(ExecResult {
                rows_affected: rows,
                last_insert_id: tx.last_insert_rowid(),
            });
        }

        tx.commit().map_err(classify)?;
        Ok(results)
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn reconnect(&self, observed: u64) -> DbResult<()> {
        let _guard = self.reconnect_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.generation.load(Ordering::Acquire) != observed {
            debug!(target: "sqlfs::sqlite", "reconnect already completed by a concurrent caller");
            return Ok(());
        }

        // Open first: an in-memory database lives only while a connection holds it
        let fresh = Arc::new(SqlitePool::open(&self.target, self.pool_size, self.busy_timeout)?);
        let previous = {
            let mut pool = self.pool.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *pool, fresh)
        };
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        drop(previous);

        info!(
            target: "sqlfs::sqlite",
            database = self.dsn.database(),
            generation,
            "reconnected"
        );
        Ok(())
    }

    fn database(&self) -> String {
        self.dsn.database().to_string()
    }

    fn table_prefix(&self) -> String {
        self.dsn.table_prefix().to_string()
    }

    fn driver_name(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(executor: &SqliteExecutor) {
        executor
            .exec(
                "CREATE TABLE {%t_prefix%}items (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE)",
                &[],
            )
            .unwrap();
    }

    #[test]
    fn exec_and_query_round_trip_values() {
        let executor = SqliteExecutor::in_memory().unwrap();
        scratch(&executor);

        let result = executor.exec("INSERT INTO items (name) VALUES (?)", &["a".into()]).unwrap();
        assert_eq!(result.rows_affected, 1);
        assert_eq!(result.last_insert_id, 1);

        let row = executor
            .query_row("SELECT id, name FROM items WHERE name = ?", &["a".into()])
            .unwrap()
            .unwrap();
        assert_eq!(row.get_i64(0).unwrap(), 1);
        assert_eq!(row.get_text(1).unwrap(), "a");

        assert!(executor
            .query_row("SELECT id FROM items WHERE name = ?", &["b".into()])
            .unwrap()
            .is_none());
    }

    #[test]
    fn unique_violation_is_classified() {
        let executor = SqliteExecutor::in_memory().unwrap();
        scratch(&executor);
        executor.exec("INSERT INTO items (name) VALUES ('a')", &[]).unwrap();
        let err = executor.exec("INSERT INTO items (name) VALUES ('a')", &[]).unwrap_err();
        assert!(matches!(err, DbError::UniqueViolation(_)), "{err:?}");
    }

    #[test]
    fn atomic_batch_rolls_back_on_row_count_mismatch() {
        let executor = SqliteExecutor::in_memory().unwrap();
        scratch(&executor);

        let err = executor
            .exec_atomic(&[
                Statement::new("INSERT INTO items (name) VALUES ('kept?')"),
                Statement::new("UPDATE items SET name = 'x' WHERE id = 99").expect_rows(1),
            ])
            .unwrap_err();
        assert!(matches!(
            err,
            DbError::UnexpectedRowCount {
                index: 1,
                expected: 1,
                actual: 0
            }
        ));
        assert!(executor.query("SELECT id FROM items", &[]).unwrap().is_empty());
    }

    #[test]
    fn table_prefix_is_applied() {
        let dsn = Dsn::parse("sqlite://:memory:?tblprefix=fs_").unwrap();
        let executor = SqliteExecutor::connect(dsn, &StoreConfig::default()).unwrap();
        assert_eq!(executor.table_prefix(), "fs_");
        scratch(&executor);
        executor.exec("INSERT INTO {%t_prefix%}items (name) VALUES ('a')", &[]).unwrap();
        assert_eq!(executor.query("SELECT name FROM fs_items", &[]).unwrap().len(), 1);
    }

    #[test]
    fn in_memory_data_survives_reconnect() {
        let executor = SqliteExecutor::in_memory().unwrap();
        scratch(&executor);
        executor.exec("INSERT INTO items (name) VALUES ('a')", &[]).unwrap();

        executor.reconnect(executor.generation()).unwrap();
        assert_eq!(executor.generation(), 1);
        assert_eq!(executor.query("SELECT id FROM items", &[]).unwrap().len(), 1);
    }

    #[test]
    fn concurrent_reconnects_complete_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let dsn = Dsn::parse(&format!("sqlite://{}", dir.path().join("fs.db").display())).unwrap();
        let executor = Arc::new(SqliteExecutor::connect(dsn, &StoreConfig::default()).unwrap());
        scratch(&executor);

        for round in 0..10u64 {
            let barrier = Arc::new(std::sync::Barrier::new(8));
            let workers: Vec<_> = (0..8)
                .map(|i| {
                    let executor = Arc::clone(&executor);
                    let barrier = Arc::clone(&barrier);
                    let observed = executor.generation();
                    std::thread::spawn(move || {
                        barrier.wait();
                        executor.reconnect(observed).unwrap();
                        executor
                            .exec(
                                "INSERT INTO items (name) VALUES (?)",
                                &[format!("r{round}-n{i}").into()],
                            )
                            .unwrap();
                    })
                })
                .collect();
            for worker in workers {
                worker.join().unwrap();
            }
            assert_eq!(executor.generation(), round + 1);
        }
        assert_eq!(executor.query("SELECT id FROM items", &[]).unwrap().len(), 80);
    }

    #[test]
    fn stale_reconnect_is_skipped() {
        let executor = SqliteExecutor::in_memory().unwrap();
        let observed = executor.generation();
        executor.reconnect(observed).unwrap();
        executor.reconnect(observed).unwrap();
        assert_eq!(executor.generation(), 1);
    }

    #[test]
    fn in_memory_writes_wait_out_a_reconnect() {
        let executor = Arc::new(SqliteExecutor::in_memory().unwrap());
        scratch(&executor);

        let workers: Vec<_> = (0..4)
            .map(|t| {
                let executor = Arc::clone(&executor);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        if t == 0 && i % 5 == 0 {
                            executor.reconnect(executor.generation()).unwrap();
                        }
                        executor
                            .exec_atomic(&[Statement::new("INSERT INTO items (name) VALUES (?)")
                                .bind(format!("t{t}-{i}"))])
                            .unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(executor.query("SELECT id FROM items", &[]).unwrap().len(), 200);
    }

    #[test]
    fn rejects_foreign_scheme() {
        let dsn = Dsn::parse("mysql://user@localhost/fs").unwrap();
        assert!(matches!(
            SqliteExecutor::connect(dsn, &StoreConfig::default()),
            Err(DbError::InvalidDsn(_))
        ));
    }
}
