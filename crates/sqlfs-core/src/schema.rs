// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Schema provisioning
//!
//! Migrations are applied in id order and recorded in a ledger table. Each
//! migration runs together with its ledger update as one atomic batch, so a
//! failed step leaves neither its tables nor its ledger row behind.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use crate::error::{FsError, FsResult};
use crate::executor::{Executor, Statement};
use crate::types::{DescriptorType, DEFAULT_DIR_PERMISSION, ROOT_NAME};

/// Name of the ledger table, before prefixing
pub const LEDGER_TABLE: &str = "migrations";

/// Identity written into provisioned rows
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProvisionContext {
    pub owner_uid: u32,
    pub owner_gid: u32,
}

impl ProvisionContext {
    /// Owner taken from the running process
    pub fn current() -> Self {
        Self {
            owner_uid: unsafe { libc::getuid() },
            owner_gid: unsafe { libc::getgid() },
        }
    }
}

/// One schema step
pub struct Migration {
    pub id: &'static str,
    pub description: &'static str,
    up: fn(&ProvisionContext) -> Vec<Statement>,
    down: fn() -> Vec<Statement>,
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("id", &self.id)
            .field("description", &self.description)
            .finish()
    }
}

fn ledger_up(_: &ProvisionContext) -> Vec<Statement> {
    vec![Statement::new(
        "CREATE TABLE IF NOT EXISTS {%t_prefix%}migrations (
            id TEXT PRIMARY KEY NOT NULL,
            migrated_at INTEGER NOT NULL
        )",
    )]
}

fn ledger_down() -> Vec<Statement> {
    vec![Statement::new("DROP TABLE IF EXISTS {%t_prefix%}migrations")]
}

fn descriptors_up(_: &ProvisionContext) -> Vec<Statement> {
    vec![Statement::new(
        "CREATE TABLE {%t_prefix%}descriptors (
            inode INTEGER PRIMARY KEY AUTOINCREMENT,
            parent INTEGER NULL REFERENCES {%t_prefix%}descriptors (inode) ON DELETE CASCADE,
            name TEXT NOT NULL,
            type TEXT NOT NULL CHECK (type IN ('DIR', 'FILE')),
            size INTEGER NOT NULL DEFAULT 0,
            permission INTEGER NOT NULL,
            uid INTEGER NOT NULL,
            gid INTEGER NOT NULL,
            UNIQUE (parent, name)
        )",
    )]
}

fn descriptors_down() -> Vec<Statement> {
    vec![Statement::new("DROP TABLE IF EXISTS {%t_prefix%}descriptors")]
}

fn contents_up(_: &ProvisionContext) -> Vec<Statement> {
    vec![Statement::new(
        "CREATE TABLE {%t_prefix%}contents (
            inode INTEGER PRIMARY KEY NOT NULL
                REFERENCES {%t_prefix%}descriptors (inode) ON DELETE CASCADE,
            data BLOB NOT NULL DEFAULT X''
        )",
    )]
}

fn contents_down() -> Vec<Statement> {
    vec![Statement::new("DROP TABLE IF EXISTS {%t_prefix%}contents")]
}

fn root_up(context: &ProvisionContext) -> Vec<Statement> {
    vec![Statement::new(
        "INSERT INTO {%t_prefix%}descriptors (parent, name, type, size, permission, uid, gid)
         VALUES (NULL, ?, ?, 0, ?, ?, ?)",
    )
    .bind(ROOT_NAME)
    .bind(DescriptorType::Dir.as_str())
    .bind(DEFAULT_DIR_PERMISSION.bits())
    .bind(context.owner_uid)
    .bind(context.owner_gid)
    .expect_rows(1)]
}

fn root_down() -> Vec<Statement> {
    // Cascades over the whole tree
    vec![Statement::new(
        "DELETE FROM {%t_prefix%}descriptors WHERE parent IS NULL AND name = ?",
    )
    .bind(ROOT_NAME)]
}

/// Built-in migrations, oldest first
pub fn migrations() -> Vec<Migration> {
    vec![
        Migration {
            id: "0001_create_migrations",
            description: "migration ledger",
            up: ledger_up,
            down: ledger_down,
        },
        Migration {
            id: "0002_create_descriptors",
            description: "descriptor table",
            up: descriptors_up,
            down: descriptors_down,
        },
        Migration {
            id: "0003_create_contents",
            description: "content table",
            up: contents_up,
            down: contents_down,
        },
        Migration {
            id: "0004_bootstrap_root",
            description: "root directory",
            up: root_up,
            down: root_down,
        },
    ]
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "up" => Ok(Direction::Up),
            "down" => Ok(Direction::Down),
            other => Err(format!("unknown migration direction: {other} (expected up or down)")),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Up => "up",
            Direction::Down => "down",
        })
    }
}

/// Applies and rolls back [`Migration`]s against an executor
pub struct Migrator {
    executor: Arc<dyn Executor>,
    migrations: Vec<Migration>,
    context: ProvisionContext,
}

impl Migrator {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self::with_context(executor, ProvisionContext::current())
    }

    pub fn with_context(executor: Arc<dyn Executor>, context: ProvisionContext) -> Self {
        Self {
            executor,
            migrations: migrations(),
            context,
        }
    }

    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// Run in `direction`; `count` limits rollbacks and is ignored going up
    pub fn run(&self, direction: Direction, count: Option<usize>) -> FsResult<usize> {
        match direction {
            Direction::Up => self.up(),
            Direction::Down => self.down(count),
        }
    }

    /// Apply every pending migration, returning how many ran
    pub fn up(&self) -> FsResult<usize> {
        let committed = self.committed()?;
        let mut applied = 0;

        for migration in &self.migrations {
            if committed.contains(migration.id) {
                continue;
            }
            let mut batch = (migration.up)(&self.context);
            batch.push(
                Statement::new("INSERT INTO {%t_prefix%}migrations (id, migrated_at) VALUES (?, ?)")
                    .bind(migration.id)
                    .bind(unix_now())
                    .expect_rows(1),
            );
            self.executor.exec_atomic(&batch)?;
            info!(target: "sqlfs::schema", id = migration.id, "migration applied");
            applied += 1;
        }

        if applied == 0 {
            warn!(target: "sqlfs::schema", database = %self.executor.database(), "no pending migrations");
        }
        Ok(applied)
    }

    /// Roll back the newest `count` committed migrations, or all of them
    pub fn down(&self, count: Option<usize>) -> FsResult<usize> {
        let committed = self.committed()?;
        let limit = count.unwrap_or(usize::MAX);
        let mut rolled_back = 0;

        for migration in self.migrations.iter().rev() {
            if rolled_back >= limit {
                break;
            }
            if !committed.contains(migration.id) {
                continue;
            }
            let mut batch = vec![Statement::new("DELETE FROM {%t_prefix%}migrations WHERE id = ?")
                .bind(migration.id)
                .expect_rows(1)];
            batch.extend((migration.down)());
            self.executor.exec_atomic(&batch)?;
            info!(target: "sqlfs::schema", id = migration.id, "migration rolled back");
            rolled_back += 1;
        }

        if rolled_back == 0 {
            warn!(target: "sqlfs::schema", database = %self.executor.database(), "no committed migrations to roll back");
        }
        Ok(rolled_back)
    }

    /// True when the ledger exists and records `id`
    pub fn is_committed(&self, id: &str) -> FsResult<bool> {
        Ok(self.committed()?.contains(id))
    }

    /// Ledger ids in ascending order
    pub fn committed(&self) -> FsResult<BTreeSet<String>> {
        if !self.ledger_exists()? {
            return Ok(BTreeSet::new());
        }
        let rows = self
            .executor
            .query("SELECT id FROM {%t_prefix%}migrations ORDER BY id", &[])?;
        rows.iter()
            .map(|row| row.get_text(0).map(str::to_string).map_err(FsError::from))
            .collect()
    }

    fn ledger_exists(&self) -> FsResult<bool> {
        let table = format!("{}{}", self.executor.table_prefix(), LEDGER_TABLE);
        let row = self.executor.query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
            &[table.into()],
        )?;
        Ok(row.is_some())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
