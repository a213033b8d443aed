use std::{
    cmp,
    ops::Range,
};

use common::{
    knobs::{
        UPLOAD_HARD_TOLERANCE_BYTES,
        UPLOAD_SIZE_TOLERANCE_FLOOR_BYTES,
    },
    runtime::{
        Runtime,
        UnixTimestamp,
    },
    stream::FileStream,
    types::{
        FileId,
        UserId,
    },
};
use errors::{
    report_error,
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};
use headers::ContentLength;
use model::{
    files::file_not_found,
    types::{
        Breadcrumb,
        FileNode,
        ListFilter,
        DIRECTORY_CONTENT_TYPE,
    },
};
use serde::Serialize;

use crate::{
    FileDownload,
    FileStorage,
    SyncEventKind,
};

#[derive(Clone, Debug)]
pub struct UploadRequest {
    pub filename: String,
    pub parent_id: Option<FileId>,
    pub content_type: String,
    pub claimed_size: u64,
    pub last_modified: Option<UnixTimestamp>,
}

#[derive(Debug, Serialize)]
pub struct FileListing {
    pub files: Vec<FileNode>,
    #[serde(rename = "parentID")]
    pub parent_id: Option<FileId>,
    pub breadcrumbs: Vec<Breadcrumb>,
}

/// How many bytes past the claimed size the inbound stream may run before
/// the provider cuts it off. Tolerates transport-encoding overhead without
/// letting a lying client stream unbounded data.
pub(crate) fn stream_ceiling(claimed_size: u64) -> u64 {
    claimed_size + cmp::max(claimed_size / 20, *UPLOAD_SIZE_TOLERANCE_FLOOR_BYTES)
}

pub(crate) fn size_mismatch(claimed_size: u64, actual: Option<u64>) -> ErrorMetadata {
    let detail = match actual {
        Some(actual) => format!("declared {claimed_size} bytes but sent {actual}"),
        None => format!("body diverged from the declared size of {claimed_size} bytes"),
    };
    ErrorMetadata::bad_request("SizeMismatch", detail)
}

fn invalid_filename(filename: &str) -> ErrorMetadata {
    ErrorMetadata::bad_request(
        "InvalidFileName",
        format!("\"{filename}\" is not a usable file name"),
    )
}

pub(crate) fn check_filename(filename: &str) -> anyhow::Result<()> {
    if filename.is_empty() || filename.len() > 255 || filename.contains('/') {
        anyhow::bail!(invalid_filename(filename));
    }
    Ok(())
}

impl<RT: Runtime> FileStorage<RT> {
    /// Single-request upload: reserve quota for the claimed size, stream to
    /// the provider under a byte ceiling, reconcile the reservation against
    /// the bytes actually written, then commit the node. Every failure path
    /// compensates backwards so neither ghost bytes, ghost quota, nor ghost
    /// rows survive.
    pub async fn upload(
        &self,
        owner_id: UserId,
        request: UploadRequest,
        body: FileStream,
    ) -> anyhow::Result<FileNode> {
        let UploadRequest {
            filename,
            parent_id,
            content_type,
            claimed_size,
            last_modified,
        } = request;
        check_filename(&filename)?;
        self.check_parent_directory(owner_id, parent_id).await?;
        self.db.ensure_unique_name(owner_id, parent_id, &filename)?;

        self.db.reserve(owner_id, claimed_size)?;
        let file_id = FileId::from(self.rt.new_uuid_v4());

        let actual_size = match self
            .provider
            .save(owner_id, file_id, body, stream_ceiling(claimed_size))
            .await
        {
            Ok(actual_size) => actual_size,
            Err(e) => {
                self.db.release(owner_id, claimed_size)?;
                if e.short_msg() == Some("OversizeStream") {
                    // The body blew past the ceiling, so the claimed size was
                    // a lie: surface it as a mismatch.
                    return Err(e.context(size_mismatch(claimed_size, None)));
                }
                return Err(e);
            },
        };

        if actual_size > claimed_size + *UPLOAD_HARD_TOLERANCE_BYTES {
            self.cleanup_object(owner_id, file_id).await;
            self.db.release(owner_id, claimed_size)?;
            anyhow::bail!(size_mismatch(claimed_size, Some(actual_size)));
        }
        // Reconcile the reservation so the ledger lands exactly on the bytes
        // written.
        if actual_size < claimed_size {
            self.db.release(owner_id, claimed_size - actual_size)?;
        } else if actual_size > claimed_size {
            // Within tolerance, but the extra bytes still have to fit the
            // tier.
            if let Err(e) = self.db.reserve(owner_id, actual_size - claimed_size) {
                self.cleanup_object(owner_id, file_id).await;
                self.db.release(owner_id, claimed_size)?;
                return Err(e);
            }
        }

        let now = self.rt.unix_timestamp();
        let node = FileNode {
            id: file_id,
            owner_id,
            parent_id,
            filename,
            content_type,
            size: actual_size,
            is_directory: false,
            is_favorite: false,
            is_shared: false,
            created_at: now,
            updated_at: now,
            last_modified_at: last_modified,
            deleted_at: None,
        };
        if let Err(e) = self.db.insert_node(&node) {
            self.cleanup_object(owner_id, file_id).await;
            self.db.release(owner_id, actual_size)?;
            return Err(e);
        }

        tracing::info!(
            file_id = %file_id,
            owner_id = %owner_id,
            size = actual_size,
            "uploaded file"
        );
        self.emit(owner_id, file_id, SyncEventKind::Create, true);
        Ok(node)
    }

    /// Overwrites the content of an existing file. Quota moves by exactly
    /// `actual - existing`: a delta reservation up front, reconciled once
    /// the true byte count is known.
    pub async fn update_content(
        &self,
        owner_id: UserId,
        file_id: FileId,
        claimed_size: u64,
        content_type: String,
        last_modified: Option<UnixTimestamp>,
        body: FileStream,
    ) -> anyhow::Result<FileNode> {
        let node = self.require_active_node(owner_id, file_id).await?;
        if node.is_directory {
            anyhow::bail!(ErrorMetadata::bad_request(
                "NotAFile",
                "directories have no content to update",
            ));
        }
        let existing_size = node.size;
        let estimated_delta = claimed_size as i64 - existing_size as i64;

        let mut net_reserved: i64 = 0;
        if estimated_delta > 0 {
            self.db.reserve(owner_id, estimated_delta as u64)?;
            net_reserved = estimated_delta;
        }

        let actual_size = match self
            .provider
            .save(owner_id, file_id, body, stream_ceiling(claimed_size))
            .await
        {
            Ok(actual_size) => actual_size,
            Err(e) => {
                self.db.force_adjust(owner_id, -net_reserved)?;
                if e.short_msg() == Some("OversizeStream") {
                    return Err(e.context(size_mismatch(claimed_size, None)));
                }
                return Err(e);
            },
        };

        // From here on the object already holds the new bytes. A failure
        // below cannot restore the old content; we unwind the ledger,
        // propagate, and log loudly.
        let actual_delta = actual_size as i64 - existing_size as i64;
        let reconcile = actual_delta - net_reserved;
        let reconciled: anyhow::Result<()> = if reconcile > 0 {
            self.db.reserve(owner_id, reconcile as u64)
        } else {
            self.db.release(owner_id, reconcile.unsigned_abs())
        };
        if let Err(e) = reconciled {
            self.db.force_adjust(owner_id, -net_reserved)?;
            tracing::error!(
                file_id = %file_id,
                "content overwritten but reconciliation failed; object and metadata disagree"
            );
            return Err(e);
        }
        net_reserved = actual_delta;

        if let Err(e) = self.db.set_content(
            owner_id,
            file_id,
            actual_size,
            &content_type,
            last_modified,
            self.rt.unix_timestamp(),
        ) {
            self.db.force_adjust(owner_id, -net_reserved)?;
            tracing::error!(
                file_id = %file_id,
                "content overwritten but metadata commit failed; object and metadata disagree"
            );
            return Err(e);
        }

        tracing::info!(
            file_id = %file_id,
            owner_id = %owner_id,
            size = actual_size,
            "updated file content"
        );
        self.emit(owner_id, file_id, SyncEventKind::Update, true);
        self.require_node(owner_id, file_id).await
    }

    pub async fn create_directory(
        &self,
        owner_id: UserId,
        name: String,
        parent_id: Option<FileId>,
    ) -> anyhow::Result<FileNode> {
        check_filename(&name)?;
        self.check_parent_directory(owner_id, parent_id).await?;
        let now = self.rt.unix_timestamp();
        let node = FileNode {
            id: FileId::from(self.rt.new_uuid_v4()),
            owner_id,
            parent_id,
            filename: name,
            content_type: DIRECTORY_CONTENT_TYPE.to_string(),
            size: 0,
            is_directory: true,
            is_favorite: false,
            is_shared: false,
            created_at: now,
            updated_at: now,
            last_modified_at: None,
            deleted_at: None,
        };
        self.db.create_directory_node(&node)?;
        self.emit(owner_id, node.id, SyncEventKind::Create, false);
        Ok(node)
    }

    pub async fn rename(
        &self,
        owner_id: UserId,
        file_id: FileId,
        new_name: String,
    ) -> anyhow::Result<FileNode> {
        check_filename(&new_name)?;
        let node = self.require_active_node(owner_id, file_id).await?;
        if node.filename == new_name {
            return Ok(node);
        }
        self.db
            .ensure_unique_name(owner_id, node.parent_id, &new_name)?;
        self.db
            .rename_node(owner_id, file_id, &new_name, self.rt.unix_timestamp())?;
        self.emit(owner_id, file_id, SyncEventKind::Update, false);
        self.require_node(owner_id, file_id).await
    }

    /// Re-parents a node. The destination must be an owned, live directory,
    /// and moving a directory into its own subtree is rejected so the tree
    /// stays a tree.
    pub async fn move_node(
        &self,
        owner_id: UserId,
        file_id: FileId,
        new_parent_id: Option<FileId>,
    ) -> anyhow::Result<FileNode> {
        let node = self.require_active_node(owner_id, file_id).await?;
        if let Some(parent_id) = new_parent_id {
            let parent = self.require_active_node(owner_id, parent_id).await?;
            if !parent.is_directory {
                anyhow::bail!(ErrorMetadata::bad_request(
                    "MoveTargetNotADirectory",
                    "files can only be moved into directories",
                ));
            }
            // The destination's ancestry must not pass through the node
            // being moved.
            let ancestry = self.db.breadcrumbs(owner_id, Some(parent_id))?;
            if ancestry.iter().any(|crumb| crumb.id == file_id) {
                anyhow::bail!(ErrorMetadata::conflict(
                    "MoveIntoOwnSubtree",
                    "cannot move a directory into itself or its own subtree",
                ));
            }
        }
        if node.parent_id == new_parent_id {
            return Ok(node);
        }
        self.db
            .ensure_unique_name(owner_id, new_parent_id, &node.filename)?;
        self.db
            .set_parent(owner_id, file_id, new_parent_id, self.rt.unix_timestamp())?;
        self.emit(owner_id, file_id, SyncEventKind::Update, false);
        self.require_node(owner_id, file_id).await
    }

    /// Sets the favorite flag, or flips it when no explicit value is given.
    pub async fn set_favorite(
        &self,
        owner_id: UserId,
        file_id: FileId,
        is_favorite: Option<bool>,
    ) -> anyhow::Result<FileNode> {
        let node = self.require_active_node(owner_id, file_id).await?;
        let target = is_favorite.unwrap_or(!node.is_favorite);
        if target != node.is_favorite {
            self.db
                .set_favorite(owner_id, file_id, target, self.rt.unix_timestamp())?;
            self.emit(owner_id, file_id, SyncEventKind::Update, false);
        }
        self.require_node(owner_id, file_id).await
    }

    /// Moves a node to the trash. Quota is not returned until the node is
    /// hard-deleted, because restore must never fail on a full tier.
    pub async fn soft_delete(&self, owner_id: UserId, file_id: FileId) -> anyhow::Result<()> {
        let _node = self.require_active_node(owner_id, file_id).await?;
        let now = self.rt.unix_timestamp();
        self.db.set_deleted(owner_id, file_id, Some(now), now)?;
        self.emit(owner_id, file_id, SyncEventKind::Trash, false);
        Ok(())
    }

    /// Pulls a node out of the trash. If its old parent vanished it lands in
    /// the root; if its old name was taken, " (restored)" is appended before
    /// the extension until the name is free.
    pub async fn restore(&self, owner_id: UserId, file_id: FileId) -> anyhow::Result<FileNode> {
        let node = self.require_node(owner_id, file_id).await?;
        if node.deleted_at.is_none() {
            anyhow::bail!(ErrorMetadata::conflict(
                "NotInTrash",
                "only trashed files can be restored",
            ));
        }

        let parent_id = match node.parent_id {
            Some(parent_id) => match self.db.get_node(owner_id, parent_id)? {
                Some(parent) if parent.is_directory && parent.deleted_at.is_none() => {
                    Some(parent_id)
                },
                _ => None,
            },
            None => None,
        };

        let mut filename = node.filename.clone();
        while self.db.sibling_name_exists(owner_id, parent_id, &filename)? {
            filename = restored_name(&filename, node.is_directory);
        }

        self.db.restore_node(
            owner_id,
            file_id,
            parent_id,
            &filename,
            self.rt.unix_timestamp(),
        )?;
        self.emit(owner_id, file_id, SyncEventKind::Restore, false);
        self.require_node(owner_id, file_id).await
    }

    /// Removes a subtree for good: provider objects best-effort first, then
    /// all rows children-first plus the quota release in one transaction. We
    /// prefer orphaned bytes to orphaned metadata, so a failed provider
    /// delete is logged and the traversal continues.
    pub async fn hard_delete(&self, owner_id: UserId, file_id: FileId) -> anyhow::Result<()> {
        let subtree = self.db.descendants(owner_id, file_id)?;
        if subtree.is_empty() {
            anyhow::bail!(file_not_found(file_id));
        }

        let reclaim: u64 = subtree
            .iter()
            .filter(|node| !node.is_directory)
            .map(|node| node.size)
            .sum();

        for node in subtree.iter().filter(|node| !node.is_directory) {
            if let Err(e) = self.provider.delete(owner_id, node.id).await {
                report_error(&e.context(format!("failed to delete object for {}", node.id)));
            }
        }

        let children_first: Vec<FileId> = subtree.iter().rev().map(|node| node.id).collect();
        self.db.delete_subtree(owner_id, &children_first, reclaim)?;

        tracing::info!(
            file_id = %file_id,
            owner_id = %owner_id,
            nodes = subtree.len(),
            reclaimed = reclaim,
            "hard-deleted subtree"
        );
        self.emit(owner_id, file_id, SyncEventKind::Delete, false);
        Ok(())
    }

    pub async fn download(
        &self,
        owner_id: UserId,
        file_id: FileId,
        range: Option<Range<u64>>,
    ) -> anyhow::Result<FileDownload> {
        let node = self.require_active_node(owner_id, file_id).await?;
        if node.is_directory {
            anyhow::bail!(ErrorMetadata::bad_request(
                "NotAFile",
                "directories cannot be downloaded",
            ));
        }
        let stream = self.provider.get(owner_id, file_id, range).await?;
        Ok(FileDownload {
            content_length: ContentLength(stream.content_length),
            node,
            stream,
        })
    }

    pub async fn get_node(&self, owner_id: UserId, file_id: FileId) -> anyhow::Result<FileNode> {
        self.require_node(owner_id, file_id).await
    }

    pub async fn list(
        &self,
        owner_id: UserId,
        filter: ListFilter,
    ) -> anyhow::Result<FileListing> {
        let (parent_id, breadcrumbs) = match filter {
            ListFilter::Folder(parent_id) => {
                if let Some(parent_id) = parent_id {
                    let parent = self.require_active_node(owner_id, parent_id).await?;
                    anyhow::ensure!(
                        parent.is_directory,
                        ErrorMetadata::bad_request("NotADirectory", "cannot list a file")
                    );
                }
                (parent_id, self.db.breadcrumbs(owner_id, parent_id)?)
            },
            _ => (None, vec![]),
        };
        Ok(FileListing {
            files: self.db.list(owner_id, filter)?,
            parent_id,
            breadcrumbs,
        })
    }

    /// Ownership-checked fetch; trashed nodes are visible.
    pub(crate) async fn require_node(
        &self,
        owner_id: UserId,
        file_id: FileId,
    ) -> anyhow::Result<FileNode> {
        self.db
            .get_node(owner_id, file_id)?
            .ok_or_else(|| file_not_found(file_id).into())
    }

    /// Ownership-checked fetch that treats trashed nodes as absent.
    pub(crate) async fn require_active_node(
        &self,
        owner_id: UserId,
        file_id: FileId,
    ) -> anyhow::Result<FileNode> {
        let node = self.require_node(owner_id, file_id).await?;
        if node.deleted_at.is_some() {
            anyhow::bail!(file_not_found(file_id));
        }
        Ok(node)
    }

    pub(crate) async fn check_parent_directory(
        &self,
        owner_id: UserId,
        parent_id: Option<FileId>,
    ) -> anyhow::Result<()> {
        let Some(parent_id) = parent_id else {
            return Ok(());
        };
        let parent = self.require_active_node(owner_id, parent_id).await?;
        anyhow::ensure!(
            parent.is_directory,
            ErrorMetadata::bad_request("NotADirectory", "the parent must be a directory")
        );
        Ok(())
    }

    /// Best-effort provider delete on a compensation path.
    pub(crate) async fn cleanup_object(&self, owner_id: UserId, file_id: FileId) {
        if let Err(e) = self.provider.delete(owner_id, file_id).await {
            report_error(&e.context(format!("failed to clean up object for {file_id}")));
        }
    }
}

/// `"notes.txt"` becomes `"notes (restored).txt"`; directories and files
/// without an extension get the suffix at the end.
fn restored_name(filename: &str, is_directory: bool) -> String {
    if !is_directory {
        if let Some((stem, extension)) = filename.rsplit_once('.') {
            if !stem.is_empty() {
                return format!("{stem} (restored).{extension}");
            }
        }
    }
    format!("{filename} (restored)")
}
