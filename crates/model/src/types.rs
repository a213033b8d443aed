use common::{
    runtime::UnixTimestamp,
    types::{
        FileId,
        SessionId,
        UserId,
    },
};
use serde::Serialize;

/// The single entity for both files and directories. A node with
/// `deleted_at` set is in the trash: hidden from every listing except the
/// trash view, restorable, still counted against quota until hard-deleted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FileNode {
    pub id: FileId,
    #[serde(rename = "ownerID")]
    pub owner_id: UserId,
    #[serde(rename = "parentID")]
    pub parent_id: Option<FileId>,
    pub filename: String,
    #[serde(rename = "contentType")]
    pub content_type: String,
    pub size: u64,
    #[serde(rename = "isDirectory")]
    pub is_directory: bool,
    #[serde(rename = "isFavorite")]
    pub is_favorite: bool,
    #[serde(rename = "isShared")]
    pub is_shared: bool,
    #[serde(rename = "createdAt")]
    pub created_at: UnixTimestamp,
    #[serde(rename = "updatedAt")]
    pub updated_at: UnixTimestamp,
    #[serde(rename = "lastModifiedAt")]
    pub last_modified_at: Option<UnixTimestamp>,
    #[serde(rename = "deletedAt")]
    pub deleted_at: Option<UnixTimestamp>,
}

pub const DIRECTORY_CONTENT_TYPE: &str = "directory";

/// Which slice of a user's tree a listing returns. Ordering rules differ per
/// variant and live next to the SQL in `files.rs`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListFilter {
    /// Children of one directory; `None` means the root.
    Folder(Option<FileId>),
    All,
    Favorites,
    /// Recently touched files, newest first, bounded.
    Recent,
    Shared,
    Trash,
}

/// One step of the path from the root down to a directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Breadcrumb {
    pub id: FileId,
    pub filename: String,
}

/// Audit/cleanup record of an in-flight multipart upload. The signed upload
/// token carries the authoritative copy of these claims; this row exists so
/// the expiry sweeper can find abandoned uploads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultipartSession {
    pub id: SessionId,
    pub file_id: FileId,
    pub upload_id: String,
    pub owner_id: UserId,
    pub filename: String,
    pub content_type: String,
    pub parent_id: Option<FileId>,
    pub total_size: u64,
    pub last_modified_at: Option<UnixTimestamp>,
    pub expires_at: UnixTimestamp,
}
