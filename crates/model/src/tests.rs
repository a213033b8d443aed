use std::time::Duration;

use common::{
    runtime::{
        testing::TestRuntime,
        Runtime,
        UnixTimestamp,
    },
    types::{
        FileId,
        SessionId,
        UserId,
    },
};
use errors::ErrorMetadataAnyhowExt;

use crate::{
    types::{
        FileNode,
        ListFilter,
        MultipartSession,
        DIRECTORY_CONTENT_TYPE,
    },
    Database,
};

const TIER: &str = "basic";

fn fixture(limit_bytes: u64) -> anyhow::Result<(TestRuntime, Database, UserId)> {
    let rt = TestRuntime::new();
    let db = Database::in_memory()?;
    db.create_tier(TIER, "Basic", limit_bytes)?;
    let owner = UserId::from(rt.new_uuid_v4());
    db.ensure_user(owner, TIER)?;
    Ok((rt, db, owner))
}

fn file_node(
    rt: &TestRuntime,
    owner: UserId,
    parent: Option<FileId>,
    filename: &str,
    size: u64,
) -> FileNode {
    let now = rt.unix_timestamp();
    FileNode {
        id: FileId::from(rt.new_uuid_v4()),
        owner_id: owner,
        parent_id: parent,
        filename: filename.to_string(),
        content_type: "application/octet-stream".to_string(),
        size,
        is_directory: false,
        is_favorite: false,
        is_shared: false,
        created_at: now,
        updated_at: now,
        last_modified_at: None,
        deleted_at: None,
    }
}

fn directory_node(
    rt: &TestRuntime,
    owner: UserId,
    parent: Option<FileId>,
    filename: &str,
) -> FileNode {
    FileNode {
        is_directory: true,
        content_type: DIRECTORY_CONTENT_TYPE.to_string(),
        size: 0,
        ..file_node(rt, owner, parent, filename, 0)
    }
}

#[test]
fn test_reserve_until_quota_exhausted() -> anyhow::Result<()> {
    let (_rt, db, owner) = fixture(10 << 20)?;
    db.reserve(owner, 9 << 20)?;
    assert_eq!(db.used_bytes(owner)?, 9 << 20);

    let err = db.reserve(owner, 2 << 20).unwrap_err();
    assert!(err.is_quota_exceeded());
    // A failed reservation must not move the ledger.
    assert_eq!(db.used_bytes(owner)?, 9 << 20);

    // Exactly filling the tier is allowed.
    db.reserve(owner, 1 << 20)?;
    assert_eq!(db.used_bytes(owner)?, 10 << 20);
    Ok(())
}

#[test]
fn test_release_clamps_at_zero() -> anyhow::Result<()> {
    let (_rt, db, owner) = fixture(10 << 20)?;
    db.reserve(owner, 100)?;
    db.release(owner, 5000)?;
    assert_eq!(db.used_bytes(owner)?, 0);
    Ok(())
}

#[test]
fn test_adjust_is_signed() -> anyhow::Result<()> {
    let (_rt, db, owner) = fixture(10 << 20)?;
    db.adjust(owner, 4096)?;
    db.adjust(owner, -1024)?;
    assert_eq!(db.used_bytes(owner)?, 3072);
    Ok(())
}

#[test]
fn test_reserve_unknown_user() -> anyhow::Result<()> {
    let (rt, db, _owner) = fixture(10 << 20)?;
    let stranger = UserId::from(rt.new_uuid_v4());
    let err = db.reserve(stranger, 1).unwrap_err();
    assert!(err.is_not_found());
    Ok(())
}

#[test]
fn test_sibling_names_are_unique_per_parent() -> anyhow::Result<()> {
    let (rt, db, owner) = fixture(10 << 20)?;
    let dir = directory_node(&rt, owner, None, "docs");
    db.create_directory_node(&dir)?;
    db.insert_node(&file_node(&rt, owner, Some(dir.id), "a.txt", 1))?;

    let err = db.ensure_unique_name(owner, Some(dir.id), "a.txt").unwrap_err();
    assert_eq!(err.short_msg(), Some("FileNameConflict"));

    // Same name under a different parent is fine.
    db.ensure_unique_name(owner, None, "a.txt")?;
    // The backstop index rejects a raw insert too.
    let err = db
        .insert_node(&file_node(&rt, owner, Some(dir.id), "a.txt", 1))
        .unwrap_err();
    assert_eq!(err.short_msg(), Some("FileNameConflict"));
    Ok(())
}

#[test]
fn test_trash_frees_the_name() -> anyhow::Result<()> {
    let (rt, db, owner) = fixture(10 << 20)?;
    let node = file_node(&rt, owner, None, "a.txt", 1);
    db.insert_node(&node)?;
    db.set_deleted(owner, node.id, Some(rt.unix_timestamp()), rt.unix_timestamp())?;
    // A soft-deleted sibling no longer blocks the name.
    db.ensure_unique_name(owner, None, "a.txt")?;
    db.insert_node(&file_node(&rt, owner, None, "a.txt", 1))?;
    Ok(())
}

#[test]
fn test_descendants_returns_parents_first() -> anyhow::Result<()> {
    let (rt, db, owner) = fixture(10 << 20)?;
    let root = directory_node(&rt, owner, None, "root");
    let child_dir = directory_node(&rt, owner, Some(root.id), "nested");
    let leaf = file_node(&rt, owner, Some(child_dir.id), "deep.txt", 5);
    let sibling = file_node(&rt, owner, Some(root.id), "shallow.txt", 3);
    db.create_directory_node(&root)?;
    db.create_directory_node(&child_dir)?;
    db.insert_node(&leaf)?;
    db.insert_node(&sibling)?;

    let subtree = db.descendants(owner, root.id)?;
    assert_eq!(subtree.len(), 4);
    assert_eq!(subtree[0].id, root.id);
    let position = |id| subtree.iter().position(|n| n.id == id).unwrap();
    assert!(position(child_dir.id) < position(leaf.id));

    // Unknown root yields an empty subtree.
    assert!(db
        .descendants(owner, FileId::from(rt.new_uuid_v4()))?
        .is_empty());
    Ok(())
}

#[test]
fn test_folder_listing_orders_directories_first() -> anyhow::Result<()> {
    let (rt, db, owner) = fixture(10 << 20)?;
    db.insert_node(&file_node(&rt, owner, None, "zebra.txt", 1))?;
    db.create_directory_node(&directory_node(&rt, owner, None, "albums"))?;
    db.insert_node(&file_node(&rt, owner, None, "alpha.txt", 1))?;
    db.create_directory_node(&directory_node(&rt, owner, None, "zoo"))?;

    let names: Vec<String> = db
        .list(owner, ListFilter::Folder(None))?
        .into_iter()
        .map(|n| n.filename)
        .collect();
    assert_eq!(names, vec!["albums", "zoo", "alpha.txt", "zebra.txt"]);
    Ok(())
}

#[test]
fn test_recent_listing_excludes_directories_and_trash() -> anyhow::Result<()> {
    let (rt, db, owner) = fixture(10 << 20)?;
    db.create_directory_node(&directory_node(&rt, owner, None, "dir"))?;
    let old = file_node(&rt, owner, None, "old.txt", 1);
    db.insert_node(&old)?;
    rt.advance(Duration::from_secs(60));
    let fresh = file_node(&rt, owner, None, "fresh.txt", 1);
    db.insert_node(&fresh)?;
    let trashed = file_node(&rt, owner, None, "gone.txt", 1);
    db.insert_node(&trashed)?;
    db.set_deleted(owner, trashed.id, Some(rt.unix_timestamp()), rt.unix_timestamp())?;

    let recent = db.list(owner, ListFilter::Recent)?;
    let names: Vec<&str> = recent.iter().map(|n| n.filename.as_str()).collect();
    assert_eq!(names, vec!["fresh.txt", "old.txt"]);
    Ok(())
}

#[test]
fn test_trash_listing_orders_by_deletion_time() -> anyhow::Result<()> {
    let (rt, db, owner) = fixture(10 << 20)?;
    let first = file_node(&rt, owner, None, "first.txt", 1);
    let second = file_node(&rt, owner, None, "second.txt", 1);
    db.insert_node(&first)?;
    db.insert_node(&second)?;
    db.set_deleted(owner, first.id, Some(rt.unix_timestamp()), rt.unix_timestamp())?;
    rt.advance(Duration::from_secs(5));
    db.set_deleted(owner, second.id, Some(rt.unix_timestamp()), rt.unix_timestamp())?;

    let trash = db.list(owner, ListFilter::Trash)?;
    let names: Vec<&str> = trash.iter().map(|n| n.filename.as_str()).collect();
    assert_eq!(names, vec!["second.txt", "first.txt"]);
    Ok(())
}

#[test]
fn test_breadcrumbs_walk_to_root() -> anyhow::Result<()> {
    let (rt, db, owner) = fixture(10 << 20)?;
    let a = directory_node(&rt, owner, None, "a");
    let b = directory_node(&rt, owner, Some(a.id), "b");
    let c = directory_node(&rt, owner, Some(b.id), "c");
    db.create_directory_node(&a)?;
    db.create_directory_node(&b)?;
    db.create_directory_node(&c)?;

    let crumbs = db.breadcrumbs(owner, Some(c.id))?;
    let names: Vec<&str> = crumbs.iter().map(|c| c.filename.as_str()).collect();
    assert_eq!(names, vec!["a", "b", "c"]);

    assert!(db.breadcrumbs(owner, None)?.is_empty());
    Ok(())
}

#[test]
fn test_listings_are_scoped_to_owner() -> anyhow::Result<()> {
    let (rt, db, owner) = fixture(10 << 20)?;
    let other = UserId::from(rt.new_uuid_v4());
    db.ensure_user(other, TIER)?;
    let mine = file_node(&rt, owner, None, "mine.txt", 1);
    db.insert_node(&mine)?;
    db.insert_node(&file_node(&rt, other, None, "theirs.txt", 1))?;

    let listing = db.list(owner, ListFilter::All)?;
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].filename, "mine.txt");
    // Ownership check hides other users' nodes entirely.
    assert!(db.get_node(other, mine.id)?.is_none());
    Ok(())
}

#[test]
fn test_delete_subtree_releases_quota_once() -> anyhow::Result<()> {
    let (rt, db, owner) = fixture(10 << 20)?;
    let dir = directory_node(&rt, owner, None, "bulk");
    let one = file_node(&rt, owner, Some(dir.id), "one.bin", 600);
    let two = file_node(&rt, owner, Some(dir.id), "two.bin", 400);
    db.create_directory_node(&dir)?;
    db.insert_node(&one)?;
    db.insert_node(&two)?;
    db.reserve(owner, 1000)?;

    // Children first, parent last.
    db.delete_subtree(owner, &[one.id, two.id, dir.id], 1000)?;
    assert_eq!(db.used_bytes(owner)?, 0);
    assert!(db.get_node(owner, dir.id)?.is_none());
    assert!(db.get_node(owner, one.id)?.is_none());
    assert!(db.descendants(owner, dir.id)?.is_empty());
    Ok(())
}

#[test]
fn test_session_lifecycle() -> anyhow::Result<()> {
    let (rt, db, owner) = fixture(10 << 20)?;
    let session = MultipartSession {
        id: SessionId::from(rt.new_uuid_v4()),
        file_id: FileId::from(rt.new_uuid_v4()),
        upload_id: "upload-1".to_string(),
        owner_id: owner,
        filename: "big.iso".to_string(),
        content_type: "application/octet-stream".to_string(),
        parent_id: None,
        total_size: 15 << 20,
        last_modified_at: None,
        expires_at: rt.unix_timestamp() + Duration::from_secs(24 * 60 * 60),
    };
    db.insert_session(&session)?;
    assert_eq!(db.get_session(session.id)?, Some(session.clone()));

    // Not expired yet.
    assert!(db.expired_sessions(rt.unix_timestamp())?.is_empty());
    rt.advance(Duration::from_secs(25 * 60 * 60));
    let expired = db.expired_sessions(rt.unix_timestamp())?;
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].id, session.id);

    assert!(db.delete_session(session.id)?);
    assert!(!db.delete_session(session.id)?);
    Ok(())
}

#[test]
fn test_update_missing_node_is_not_found() -> anyhow::Result<()> {
    let (rt, db, owner) = fixture(10 << 20)?;
    let err = db
        .rename_node(
            owner,
            FileId::from(rt.new_uuid_v4()),
            "ghost.txt",
            UnixTimestamp::from_millis(0),
        )
        .unwrap_err();
    assert!(err.is_not_found());
    Ok(())
}
