// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Descriptor table access
//!
//! Uniqueness of `(parent, name)` is enforced by the table itself. Callers
//! may check [`DescriptorStore::exists`] first, but only the insert decides
//! which of two concurrent creates wins.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{DbError, FsError, FsResult};
use crate::executor::{Executor, Row, Statement, Value};
use crate::types::{
    Descriptor, DescriptorAttrs, DescriptorType, Inode, Permission, ROOT_NAME,
};

const COLUMNS: &str = "inode, parent, name, type, size, permission, uid, gid";

/// CRUD and lookup over the descriptor table
#[derive(Clone)]
pub struct DescriptorStore {
    executor: Arc<dyn Executor>,
}

impl DescriptorStore {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    /// The unique parent-less directory named [`ROOT_NAME`]
    ///
    /// Returns `None` unless exactly one such row exists.
    pub fn find_root(&self) -> FsResult<Option<Descriptor>> {
        let rows = self.executor.query(
            &format!(
                "SELECT {COLUMNS} FROM {{%t_prefix%}}descriptors
                 WHERE parent IS NULL AND name = ? AND type = ? LIMIT 2"
            ),
            &[ROOT_NAME.into(), DescriptorType::Dir.as_str().into()],
        )?;

        match rows.as_slice() {
            [row] => hydrate(row).map(Some),
            [] => {
                warn!(target: "sqlfs::descriptors", "no root directory descriptor");
                Ok(None)
            }
            _ => {
                warn!(target: "sqlfs::descriptors", "more than one root descriptor");
                Ok(None)
            }
        }
    }

    pub fn find_by_name(&self, parent: Inode, name: &str) -> FsResult<Option<Descriptor>> {
        let row = self.executor.query_row(
            &format!("SELECT {COLUMNS} FROM {{%t_prefix%}}descriptors WHERE parent = ? AND name = ?"),
            &[parent.as_u64().into(), name.into()],
        )?;
        row.as_ref().map(hydrate).transpose()
    }

    pub fn find_by_inode(&self, inode: Inode) -> FsResult<Option<Descriptor>> {
        let row = self.executor.query_row(
            &format!("SELECT {COLUMNS} FROM {{%t_prefix%}}descriptors WHERE inode = ?"),
            &[inode.as_u64().into()],
        )?;
        row.as_ref().map(hydrate).transpose()
    }

    /// Children of `parent`, directories first, each group by name
    pub fn find_children(&self, parent: Inode) -> FsResult<Vec<Descriptor>> {
        let rows = self.executor.query(
            &format!(
                "SELECT {COLUMNS} FROM {{%t_prefix%}}descriptors WHERE parent = ? ORDER BY type, name"
            ),
            &[parent.as_u64().into()],
        )?;
        rows.iter().map(hydrate).collect()
    }

    pub fn exists(&self, parent: Inode, name: &str) -> FsResult<bool> {
        Ok(self.find_by_name(parent, name)?.is_some())
    }

    /// Insert a descriptor; files get an empty content row in the same batch
    pub fn create(
        &self,
        parent: Inode,
        name: &str,
        kind: DescriptorType,
        attrs: DescriptorAttrs,
    ) -> FsResult<Descriptor> {
        let mut batch = vec![Statement::new(
            "INSERT INTO {%t_prefix%}descriptors (parent, name, type, size, permission, uid, gid)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(parent.as_u64())
        .bind(name)
        .bind(kind.as_str())
        .bind(attrs.size)
        .bind(attrs.permission.bits())
        .bind(attrs.uid)
        .bind(attrs.gid)
        .expect_rows(1)];
        if kind == DescriptorType::File {
            batch.push(
                Statement::new(
                    "INSERT INTO {%t_prefix%}contents (inode, data) VALUES (last_insert_rowid(), X'')",
                )
                .expect_rows(1),
            );
        }

        let results = self.executor.exec_atomic(&batch).map_err(|err| match err {
            DbError::UniqueViolation(_) => {
                warn!(target: "sqlfs::descriptors", parent = %parent, name, "descriptor already exists");
                FsError::AlreadyExists
            }
            // Parent vanished between lookup and insert
            DbError::ForeignKeyViolation(_) => FsError::NotFound,
            other => FsError::Storage(other),
        })?;

        let inode = results
            .first()
            .map(|r| r.last_insert_id)
            .and_then(|id| u64::try_from(id).ok())
            .ok_or(DbError::UnexpectedRowCount {
                index: 0,
                expected: 1,
                actual: 0,
            })?;

        debug!(target: "sqlfs::descriptors", parent = %parent, name, inode, kind = %kind, "descriptor created");
        Ok(Descriptor {
            inode: Inode(inode),
            parent: Some(parent),
            name: name.to_string(),
            kind,
            attrs,
        })
    }

    /// Delete the entry `name` under `parent` together with its subtree and content
    pub fn remove(&self, parent: Inode, name: &str) -> FsResult<()> {
        let result = self.executor.exec(
            "DELETE FROM {%t_prefix%}descriptors WHERE parent = ? AND name = ?",
            &[parent.as_u64().into(), name.into()],
        )?;
        if result.rows_affected == 0 {
            return Err(FsError::PreconditionFailed(format!(
                "no entry {name:?} under inode {parent}"
            )));
        }
        debug!(target: "sqlfs::descriptors", parent = %parent, name, "descriptor removed");
        Ok(())
    }
}

fn hydrate(row: &Row) -> FsResult<Descriptor> {
    let kind = row
        .get_text(3)?
        .parse::<DescriptorType>()
        .map_err(|_| DbError::Column {
            index: 3,
            expected: "DIR or FILE",
        })?;
    let parent = match row.get(1) {
        Some(Value::Null) => None,
        _ => Some(Inode(row.get_u64(1)?)),
    };

    Ok(Descriptor {
        inode: Inode(row.get_u64(0)?),
        parent,
        name: row.get_text(2)?.to_string(),
        kind,
        attrs: DescriptorAttrs {
            size: row.get_u64(4)?,
            permission: Permission::new(row.get_u32(5)?),
            uid: row.get_u32(6)?,
            gid: row.get_u32(7)?,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecResult, MockExecutor};
    use crate::testing::provisioned_in_memory;

    fn attrs(kind: DescriptorType) -> DescriptorAttrs {
        DescriptorAttrs::defaults_for(kind, 1000, 1000)
    }

    #[test]
    fn root_is_found_after_provisioning() {
        let store = DescriptorStore::new(provisioned_in_memory().unwrap());
        let root = store.find_root().unwrap().unwrap();
        assert!(root.is_root());
        assert!(root.is_dir());
        assert_eq!(root.name, ROOT_NAME);
    }

    #[test]
    fn duplicate_root_hides_root() {
        let executor = provisioned_in_memory().unwrap();
        executor
            .exec(
                "INSERT INTO descriptors (parent, name, type, size, permission, uid, gid)
                 VALUES (NULL, '/', 'DIR', 0, 493, 0, 0)",
                &[],
            )
            .unwrap();
        assert!(DescriptorStore::new(executor).find_root().unwrap().is_none());
    }

    #[test]
    fn file_typed_root_is_not_a_root() {
        let executor = provisioned_in_memory().unwrap();
        executor.exec("UPDATE descriptors SET type = 'FILE' WHERE parent IS NULL", &[]).unwrap();
        assert!(DescriptorStore::new(executor).find_root().unwrap().is_none());
    }

    #[test]
    fn stray_file_root_does_not_hide_the_directory_root() {
        let executor = provisioned_in_memory().unwrap();
        executor
            .exec(
                "INSERT INTO descriptors (parent, name, type, size, permission, uid, gid)
                 VALUES (NULL, '/', 'FILE', 0, 420, 0, 0)",
                &[],
            )
            .unwrap();
        let root = DescriptorStore::new(executor).find_root().unwrap().unwrap();
        assert!(root.is_dir());
        assert_eq!(root.inode, Inode(1));
    }

    #[test]
    fn create_then_find() {
        let store = DescriptorStore::new(provisioned_in_memory().unwrap());
        let root = store.find_root().unwrap().unwrap();

        let dir = store.create(root.inode, "docs", DescriptorType::Dir, attrs(DescriptorType::Dir)).unwrap();
        assert_eq!(dir.parent, Some(root.inode));
        assert_eq!(store.find_by_inode(dir.inode).unwrap().unwrap(), dir);
        assert_eq!(store.find_by_name(root.inode, "docs").unwrap().unwrap(), dir);
        assert!(store.exists(root.inode, "docs").unwrap());
        assert!(!store.exists(root.inode, "missing").unwrap());
        assert!(store.find_by_name(root.inode, "missing").unwrap().is_none());
    }

    #[test]
    fn same_name_conflicts_across_types() {
        let store = DescriptorStore::new(provisioned_in_memory().unwrap());
        let root = store.find_root().unwrap().unwrap();
        store.create(root.inode, "x", DescriptorType::Dir, attrs(DescriptorType::Dir)).unwrap();
        let err = store
            .create(root.inode, "x", DescriptorType::File, attrs(DescriptorType::File))
            .unwrap_err();
        assert!(matches!(err, FsError::AlreadyExists));
        // The rejected file left no content row behind
        let contents = store.executor().query("SELECT inode FROM contents", &[]).unwrap();
        assert!(contents.is_empty());
    }

    #[test]
    fn create_under_missing_parent_is_not_found() {
        let store = DescriptorStore::new(provisioned_in_memory().unwrap());
        let err = store
            .create(Inode(999), "orphan", DescriptorType::Dir, attrs(DescriptorType::Dir))
            .unwrap_err();
        assert!(matches!(err, FsError::NotFound), "{err:?}");
    }

    #[test]
    fn children_list_directories_first() {
        let store = DescriptorStore::new(provisioned_in_memory().unwrap());
        let root = store.find_root().unwrap().unwrap();
        for (name, kind) in [
            ("zeta.txt", DescriptorType::File),
            ("beta", DescriptorType::Dir),
            ("alpha.txt", DescriptorType::File),
            ("gamma", DescriptorType::Dir),
        ] {
            store.create(root.inode, name, kind, attrs(kind)).unwrap();
        }

        let names: Vec<_> = store
            .find_children(root.inode)
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, ["beta", "gamma", "alpha.txt", "zeta.txt"]);
    }

    #[test]
    fn remove_cascades_over_subtree() {
        let store = DescriptorStore::new(provisioned_in_memory().unwrap());
        let root = store.find_root().unwrap().unwrap();
        let dir = store.create(root.inode, "d", DescriptorType::Dir, attrs(DescriptorType::Dir)).unwrap();
        let file = store.create(dir.inode, "f", DescriptorType::File, attrs(DescriptorType::File)).unwrap();

        store.remove(root.inode, "d").unwrap();
        assert!(store.find_by_name(root.inode, "d").unwrap().is_none());
        assert!(store.find_by_inode(file.inode).unwrap().is_none());
        let content = store
            .executor()
            .query_row("SELECT inode FROM contents WHERE inode = ?", &[file.inode.as_u64().into()])
            .unwrap();
        assert!(content.is_none());
    }

    #[test]
    fn removing_absent_entry_fails() {
        let store = DescriptorStore::new(provisioned_in_memory().unwrap());
        let root = store.find_root().unwrap().unwrap();
        assert!(matches!(
            store.remove(root.inode, "ghost"),
            Err(FsError::PreconditionFailed(_))
        ));
    }

    #[test]
    fn create_issues_one_atomic_batch_for_files() {
        let mut executor = MockExecutor::new();
        executor
            .expect_exec_atomic()
            .withf(|batch| {
                batch.len() == 2
                    && batch[0].sql.contains("{%t_prefix%}descriptors")
                    && batch[1].sql.contains("{%t_prefix%}contents")
            })
            .times(1)
            .returning(|_| {
                Ok(vec![
                    ExecResult {
                        rows_affected: 1,
                        last_insert_id: 42,
                    },
                    ExecResult {
                        rows_affected: 1,
                        last_insert_id: 42,
                    },
                ])
            });

        let store = DescriptorStore::new(Arc::new(executor));
        let file = store
            .create(Inode(1), "a", DescriptorType::File, attrs(DescriptorType::File))
            .unwrap();
        assert_eq!(file.inode, Inode(42));
    }

    #[test]
    fn storage_errors_propagate() {
        let mut executor = MockExecutor::new();
        executor
            .expect_query_row()
            .returning(|_, _| Err(DbError::Connection("gone".into())));
        let store = DescriptorStore::new(Arc::new(executor));
        assert!(matches!(
            store.find_by_name(Inode(1), "a"),
            Err(FsError::Storage(DbError::Connection(_)))
        ));
    }
}
