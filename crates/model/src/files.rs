//! Pure metadata operations over the file-node store: name uniqueness,
//! ownership checks, tree walks, listings, and the transactional
//! children-first subtree delete.

use std::str::FromStr;

use anyhow::Context;
use common::{
    knobs::{
        MAX_BREADCRUMB_DEPTH,
        RECENT_LISTING_LIMIT,
    },
    runtime::UnixTimestamp,
    types::{
        FileId,
        UserId,
    },
};
use errors::ErrorMetadata;
use rusqlite::{
    params,
    Connection,
    Row,
};

use crate::{
    types::{
        Breadcrumb,
        FileNode,
        ListFilter,
    },
    Database,
};

const NODE_COLUMNS: &str = "id, owner_id, parent_id, filename, content_type, size, is_directory, \
                            is_favorite, is_shared, created_at, updated_at, last_modified_at, \
                            deleted_at";

fn text_to_id<T>(value: String) -> rusqlite::Result<T>
where
    T: FromStr<Err = anyhow::Error>,
{
    value.parse().map_err(|e: anyhow::Error| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
    })
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<FileNode> {
    Ok(FileNode {
        id: text_to_id(row.get::<_, String>(0)?)?,
        owner_id: text_to_id(row.get::<_, String>(1)?)?,
        parent_id: row
            .get::<_, Option<String>>(2)?
            .map(text_to_id)
            .transpose()?,
        filename: row.get(3)?,
        content_type: row.get(4)?,
        size: row.get::<_, i64>(5)? as u64,
        is_directory: row.get(6)?,
        is_favorite: row.get(7)?,
        is_shared: row.get(8)?,
        created_at: UnixTimestamp::from_millis(row.get::<_, i64>(9)? as u64),
        updated_at: UnixTimestamp::from_millis(row.get::<_, i64>(10)? as u64),
        last_modified_at: row
            .get::<_, Option<i64>>(11)?
            .map(|ms| UnixTimestamp::from_millis(ms as u64)),
        deleted_at: row
            .get::<_, Option<i64>>(12)?
            .map(|ms| UnixTimestamp::from_millis(ms as u64)),
    })
}

fn ts(t: UnixTimestamp) -> i64 {
    t.as_millis() as i64
}

fn opt_ts(t: Option<UnixTimestamp>) -> Option<i64> {
    t.map(ts)
}

fn opt_id(id: Option<FileId>) -> Option<String> {
    id.map(|id| id.to_string())
}

pub fn name_conflict(filename: &str) -> ErrorMetadata {
    ErrorMetadata::conflict(
        "FileNameConflict",
        format!("an item named \"{filename}\" already exists here"),
    )
}

pub fn file_not_found(file_id: FileId) -> ErrorMetadata {
    ErrorMetadata::not_found("FileNotFound", format!("file {file_id} does not exist"))
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::ConstraintViolation)
    )
}

fn query_nodes(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> anyhow::Result<Vec<FileNode>> {
    let mut stmt = conn.prepare(sql)?;
    let nodes = stmt
        .query_map(params, node_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(nodes)
}

impl Database {
    pub fn insert_node(&self, node: &FileNode) -> anyhow::Result<()> {
        self.with_conn(|conn| insert_node_inner(conn, node))
    }

    /// Directory creation checks uniqueness and inserts in one transaction.
    pub fn create_directory_node(&self, node: &FileNode) -> anyhow::Result<()> {
        anyhow::ensure!(node.is_directory, "not a directory node");
        self.with_tx(|tx| {
            ensure_unique_name_inner(tx, node.owner_id, node.parent_id, &node.filename)?;
            insert_node_inner(tx, node)
        })
    }

    /// The authorization primitive: a node is visible iff the caller owns
    /// it. Soft-deleted nodes are returned too; callers decide whether trash
    /// is acceptable for their operation.
    pub fn get_node(&self, owner_id: UserId, file_id: FileId) -> anyhow::Result<Option<FileNode>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {NODE_COLUMNS} FROM file_nodes WHERE id = ?1 AND owner_id = ?2"
            ))?;
            let mut rows = stmt
                .query_map(params![file_id.to_string(), owner_id.to_string()], node_from_row)?;
            Ok(rows.next().transpose()?)
        })
    }

    /// Duplicate-completion guard: does any node with this id exist, owned
    /// by anyone, deleted or not?
    pub fn node_id_exists(&self, file_id: FileId) -> anyhow::Result<bool> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT 1 FROM file_nodes WHERE id = ?1")?;
            Ok(stmt.exists(params![file_id.to_string()])?)
        })
    }

    pub fn ensure_unique_name(
        &self,
        owner_id: UserId,
        parent_id: Option<FileId>,
        filename: &str,
    ) -> anyhow::Result<()> {
        self.with_conn(|conn| ensure_unique_name_inner(conn, owner_id, parent_id, filename))
    }

    pub fn sibling_name_exists(
        &self,
        owner_id: UserId,
        parent_id: Option<FileId>,
        filename: &str,
    ) -> anyhow::Result<bool> {
        self.with_conn(|conn| sibling_name_exists_inner(conn, owner_id, parent_id, filename))
    }

    pub fn rename_node(
        &self,
        owner_id: UserId,
        file_id: FileId,
        filename: &str,
        now: UnixTimestamp,
    ) -> anyhow::Result<()> {
        self.update_node(
            file_id,
            "filename = ?3, updated_at = ?4",
            params![
                file_id.to_string(),
                owner_id.to_string(),
                filename,
                ts(now)
            ],
        )
    }

    pub fn set_parent(
        &self,
        owner_id: UserId,
        file_id: FileId,
        parent_id: Option<FileId>,
        now: UnixTimestamp,
    ) -> anyhow::Result<()> {
        self.update_node(
            file_id,
            "parent_id = ?3, updated_at = ?4",
            params![
                file_id.to_string(),
                owner_id.to_string(),
                opt_id(parent_id),
                ts(now)
            ],
        )
    }

    pub fn set_favorite(
        &self,
        owner_id: UserId,
        file_id: FileId,
        is_favorite: bool,
        now: UnixTimestamp,
    ) -> anyhow::Result<()> {
        self.update_node(
            file_id,
            "is_favorite = ?3, updated_at = ?4",
            params![
                file_id.to_string(),
                owner_id.to_string(),
                is_favorite,
                ts(now)
            ],
        )
    }

    pub fn set_content(
        &self,
        owner_id: UserId,
        file_id: FileId,
        size: u64,
        content_type: &str,
        last_modified_at: Option<UnixTimestamp>,
        now: UnixTimestamp,
    ) -> anyhow::Result<()> {
        self.update_node(
            file_id,
            "size = ?3, content_type = ?4, last_modified_at = ?5, updated_at = ?6",
            params![
                file_id.to_string(),
                owner_id.to_string(),
                size as i64,
                content_type,
                opt_ts(last_modified_at),
                ts(now)
            ],
        )
    }

    pub fn set_deleted(
        &self,
        owner_id: UserId,
        file_id: FileId,
        deleted_at: Option<UnixTimestamp>,
        now: UnixTimestamp,
    ) -> anyhow::Result<()> {
        self.update_node(
            file_id,
            "deleted_at = ?3, updated_at = ?4",
            params![
                file_id.to_string(),
                owner_id.to_string(),
                opt_ts(deleted_at),
                ts(now)
            ],
        )
    }

    /// Restore pulls a node out of the trash, possibly with a new parent
    /// (the original vanished) and a new name (a sibling took the old one).
    pub fn restore_node(
        &self,
        owner_id: UserId,
        file_id: FileId,
        parent_id: Option<FileId>,
        filename: &str,
        now: UnixTimestamp,
    ) -> anyhow::Result<()> {
        self.update_node(
            file_id,
            "parent_id = ?3, filename = ?4, deleted_at = NULL, updated_at = ?5",
            params![
                file_id.to_string(),
                owner_id.to_string(),
                opt_id(parent_id),
                filename,
                ts(now)
            ],
        )
    }

    fn update_node(
        &self,
        file_id: FileId,
        set_clause: &str,
        params: impl rusqlite::Params,
    ) -> anyhow::Result<()> {
        self.with_conn(|conn| {
            let sql =
                format!("UPDATE file_nodes SET {set_clause} WHERE id = ?1 AND owner_id = ?2");
            let updated = conn.execute(&sql, params).map_err(|e| {
                if is_unique_violation(&e) {
                    anyhow::anyhow!(e).context(ErrorMetadata::conflict(
                        "FileNameConflict",
                        "an item with this name already exists here",
                    ))
                } else {
                    anyhow::anyhow!(e)
                }
            })?;
            anyhow::ensure!(updated == 1, file_not_found(file_id));
            Ok(())
        })
    }

    /// Ordered path from the root down to (and including) the given
    /// directory. Bounded, so a corrupt or adversarial parent chain cannot
    /// spin forever.
    pub fn breadcrumbs(
        &self,
        owner_id: UserId,
        leaf_id: Option<FileId>,
    ) -> anyhow::Result<Vec<Breadcrumb>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, filename, parent_id FROM file_nodes WHERE id = ?1 AND owner_id = ?2",
            )?;
            let mut crumbs = vec![];
            let mut cursor = leaf_id;
            while let Some(id) = cursor {
                anyhow::ensure!(
                    crumbs.len() < *MAX_BREADCRUMB_DEPTH,
                    "directory nesting exceeds {} levels",
                    *MAX_BREADCRUMB_DEPTH
                );
                let mut rows = stmt.query_map(
                    params![id.to_string(), owner_id.to_string()],
                    |row| {
                        Ok((
                            text_to_id::<FileId>(row.get::<_, String>(0)?)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Option<String>>(2)?
                                .map(text_to_id::<FileId>)
                                .transpose()?,
                        ))
                    },
                )?;
                let Some(row) = rows.next().transpose()? else {
                    break;
                };
                let (id, filename, parent_id) = row;
                crumbs.push(Breadcrumb { id, filename });
                cursor = parent_id;
            }
            crumbs.reverse();
            Ok(crumbs)
        })
    }

    /// The subtree rooted at `root_id`, including the root itself and any
    /// soft-deleted descendants, ordered parents-before-children. Empty when
    /// the root does not exist.
    pub fn descendants(&self, owner_id: UserId, root_id: FileId) -> anyhow::Result<Vec<FileNode>> {
        self.with_conn(|conn| {
            let sql = format!(
                "WITH RECURSIVE subtree(id, depth) AS ( \
                     SELECT id, 0 FROM file_nodes WHERE owner_id = ?1 AND id = ?2 \
                     UNION ALL \
                     SELECT f.id, s.depth + 1 FROM file_nodes f \
                     JOIN subtree s ON f.parent_id = s.id \
                     WHERE f.owner_id = ?1 \
                 ) \
                 SELECT {} FROM file_nodes \
                 JOIN subtree ON file_nodes.id = subtree.id \
                 ORDER BY subtree.depth ASC",
                format!("file_nodes.{}", NODE_COLUMNS).replace(", ", ", file_nodes.")
            );
            query_nodes(
                conn,
                &sql,
                params![owner_id.to_string(), root_id.to_string()],
            )
        })
    }

    pub fn list(&self, owner_id: UserId, filter: ListFilter) -> anyhow::Result<Vec<FileNode>> {
        self.with_conn(|conn| {
            let owner = owner_id.to_string();
            match filter {
                ListFilter::Folder(parent_id) => query_nodes(
                    conn,
                    &format!(
                        "SELECT {NODE_COLUMNS} FROM file_nodes \
                         WHERE owner_id = ?1 AND parent_id IS ?2 AND deleted_at IS NULL \
                         ORDER BY is_directory DESC, filename ASC"
                    ),
                    params![owner, opt_id(parent_id)],
                ),
                ListFilter::All => query_nodes(
                    conn,
                    &format!(
                        "SELECT {NODE_COLUMNS} FROM file_nodes \
                         WHERE owner_id = ?1 AND deleted_at IS NULL \
                         ORDER BY updated_at DESC"
                    ),
                    params![owner],
                ),
                ListFilter::Favorites => query_nodes(
                    conn,
                    &format!(
                        "SELECT {NODE_COLUMNS} FROM file_nodes \
                         WHERE owner_id = ?1 AND is_favorite = 1 AND deleted_at IS NULL \
                         ORDER BY updated_at DESC"
                    ),
                    params![owner],
                ),
                ListFilter::Recent => query_nodes(
                    conn,
                    &format!(
                        "SELECT {NODE_COLUMNS} FROM file_nodes \
                         WHERE owner_id = ?1 AND is_directory = 0 AND deleted_at IS NULL \
                         ORDER BY updated_at DESC LIMIT ?2"
                    ),
                    params![owner, *RECENT_LISTING_LIMIT as i64],
                ),
                ListFilter::Shared => query_nodes(
                    conn,
                    &format!(
                        "SELECT {NODE_COLUMNS} FROM file_nodes \
                         WHERE owner_id = ?1 AND is_shared = 1 AND deleted_at IS NULL \
                         ORDER BY updated_at DESC"
                    ),
                    params![owner],
                ),
                ListFilter::Trash => query_nodes(
                    conn,
                    &format!(
                        "SELECT {NODE_COLUMNS} FROM file_nodes \
                         WHERE owner_id = ?1 AND deleted_at IS NOT NULL \
                         ORDER BY deleted_at DESC"
                    ),
                    params![owner],
                ),
            }
        })
    }

    /// Removes an entire subtree and returns the reclaimed bytes to the
    /// owner, in one transaction. `file_ids` must be ordered children-first
    /// so parent rows never outlive their children mid-transaction.
    pub fn delete_subtree(
        &self,
        owner_id: UserId,
        file_ids: &[FileId],
        reclaim_bytes: u64,
    ) -> anyhow::Result<()> {
        self.with_tx(|tx| {
            let owner = owner_id.to_string();
            for file_id in file_ids {
                tx.execute(
                    "DELETE FROM file_nodes WHERE id = ?1 AND owner_id = ?2",
                    params![file_id.to_string(), owner],
                )?;
            }
            tx.execute(
                "UPDATE users SET used_bytes = MAX(0, used_bytes - ?2) WHERE id = ?1",
                params![owner, reclaim_bytes as i64],
            )?;
            Ok(())
        })
    }
}

fn insert_node_inner(conn: &Connection, node: &FileNode) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO file_nodes (id, owner_id, parent_id, filename, content_type, size, \
         is_directory, is_favorite, is_shared, created_at, updated_at, last_modified_at, \
         deleted_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            node.id.to_string(),
            node.owner_id.to_string(),
            opt_id(node.parent_id),
            node.filename,
            node.content_type,
            node.size as i64,
            node.is_directory,
            node.is_favorite,
            node.is_shared,
            ts(node.created_at),
            ts(node.updated_at),
            opt_ts(node.last_modified_at),
            opt_ts(node.deleted_at),
        ],
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            anyhow::anyhow!(e).context(name_conflict(&node.filename))
        } else {
            anyhow::anyhow!(e)
        }
    })
    .context("failed to insert file node")?;
    Ok(())
}

fn sibling_name_exists_inner(
    conn: &Connection,
    owner_id: UserId,
    parent_id: Option<FileId>,
    filename: &str,
) -> anyhow::Result<bool> {
    let mut stmt = conn.prepare(
        "SELECT 1 FROM file_nodes \
         WHERE owner_id = ?1 AND parent_id IS ?2 AND filename = ?3 AND deleted_at IS NULL",
    )?;
    Ok(stmt.exists(params![owner_id.to_string(), opt_id(parent_id), filename])?)
}

fn ensure_unique_name_inner(
    conn: &Connection,
    owner_id: UserId,
    parent_id: Option<FileId>,
    filename: &str,
) -> anyhow::Result<()> {
    if sibling_name_exists_inner(conn, owner_id, parent_id, filename)? {
        anyhow::bail!(name_conflict(filename));
    }
    Ok(())
}
