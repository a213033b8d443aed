use std::{
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use common::{
    runtime::{
        testing::TestRuntime,
        Runtime,
    },
    stream::FileStream,
    types::UserId,
};
use errors::ErrorMetadataAnyhowExt;
use futures::{
    future,
    stream,
    StreamExt,
};
use keybroker::{
    KeyBroker,
    Secret,
};
use model::{
    types::ListFilter,
    Database,
};
use storage::{
    LocalDirStorage,
    StorageProvider,
};

use crate::{
    CompletedPartInput,
    FileStorage,
    MultipartInitRequest,
    UploadRequest,
};

const MIB: u64 = 1 << 20;
const TIER: &str = "test";

struct Fixture {
    rt: TestRuntime,
    fs: FileStorage<TestRuntime>,
    owner: UserId,
}

fn setup(limit_bytes: u64) -> anyhow::Result<Fixture> {
    let rt = TestRuntime::new();
    let db = Database::in_memory()?;
    db.create_tier(TIER, "Test", limit_bytes)?;
    let owner = UserId::from(rt.new_uuid_v4());
    db.ensure_user(owner, TIER)?;
    let provider: Arc<dyn StorageProvider> = Arc::new(LocalDirStorage::new(rt.clone())?);
    let fs = FileStorage::new(rt.clone(), db, provider, KeyBroker::new(Secret::random()));
    Ok(Fixture { rt, fs, owner })
}

fn body(data: Vec<u8>) -> FileStream {
    stream::iter(vec![Ok(Bytes::from(data))]).boxed()
}

fn chunked_body(chunk: usize, chunks: usize) -> FileStream {
    stream::iter((0..chunks).map(move |i| Ok(Bytes::from(vec![i as u8; chunk])))).boxed()
}

fn upload_request(filename: &str, claimed_size: u64) -> UploadRequest {
    UploadRequest {
        filename: filename.to_string(),
        parent_id: None,
        content_type: "application/octet-stream".to_string(),
        claimed_size,
        last_modified: None,
    }
}

fn multipart_request(filename: &str, total_size: u64) -> MultipartInitRequest {
    MultipartInitRequest {
        filename: filename.to_string(),
        content_type: "application/octet-stream".to_string(),
        total_size,
        parent_id: None,
        last_modified: None,
    }
}

fn manifest_entry(part: &storage::ObjectPart) -> CompletedPartInput {
    CompletedPartInput {
        part_number: part.part_number.as_u16(),
        etag: part.etag.clone(),
        size: part.size,
    }
}

/// Invariant 1: with no operation in flight, the ledger equals the summed
/// size of every file row the user owns, trash included (trashed bytes stay
/// reserved so restore can never fail on a full tier).
async fn assert_quota_conserved(fixture: &Fixture) -> anyhow::Result<()> {
    let Fixture { fs, owner, .. } = fixture;
    let mut total = 0u64;
    for filter in [ListFilter::All, ListFilter::Trash] {
        total += fs
            .list(*owner, filter)
            .await?
            .files
            .iter()
            .filter(|node| !node.is_directory)
            .map(|node| node.size)
            .sum::<u64>();
    }
    assert_eq!(fs.database().used_bytes(*owner)?, total);
    Ok(())
}

/// Invariant 2, forward direction: every live file row has a provider
/// object behind it.
async fn assert_no_ghost_rows(fixture: &Fixture) -> anyhow::Result<()> {
    let Fixture { fs, owner, .. } = fixture;
    for filter in [ListFilter::All, ListFilter::Trash] {
        for node in fs.list(*owner, filter).await?.files {
            if !node.is_directory {
                assert!(
                    fs.provider().exists(*owner, node.id).await?,
                    "no provider object for {}",
                    node.id
                );
            }
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_s1_happy_path_single_upload() -> anyhow::Result<()> {
    let fixture = setup(10 * MIB)?;
    let Fixture { fs, owner, .. } = &fixture;

    let node = fs
        .upload(*owner, upload_request("notes.txt", 1024), body(vec![7; 1024]))
        .await?;
    assert_eq!(node.size, 1024);
    assert_eq!(node.filename, "notes.txt");
    assert!(!node.is_directory);
    assert_eq!(fs.database().used_bytes(*owner)?, 1024);
    assert!(fs.provider().exists(*owner, node.id).await?);

    let download = fs.download(*owner, node.id, None).await?;
    assert_eq!(&download.stream.collect_as_bytes().await?[..], &[7u8; 1024][..]);

    assert_quota_conserved(&fixture).await?;
    assert_no_ghost_rows(&fixture).await?;
    Ok(())
}

#[tokio::test]
async fn test_s2_oversize_stream_is_rejected() -> anyhow::Result<()> {
    let fixture = setup(10 * MIB)?;
    let Fixture { fs, owner, .. } = &fixture;

    let err = fs
        .upload(
            *owner,
            upload_request("notes.txt", 1024),
            chunked_body(MIB as usize, 10),
        )
        .await
        .unwrap_err();
    assert_eq!(err.short_msg(), Some("SizeMismatch"));
    assert_eq!(fs.database().used_bytes(*owner)?, 0);
    assert!(fs.list(*owner, ListFilter::All).await?.files.is_empty());

    assert_quota_conserved(&fixture).await?;
    Ok(())
}

#[tokio::test]
async fn test_s3_quota_exceeded_at_reservation() -> anyhow::Result<()> {
    let fixture = setup(10 * MIB)?;
    let Fixture { fs, owner, .. } = &fixture;

    fs.upload(
        *owner,
        upload_request("ballast.bin", 9 * MIB),
        body(vec![1; (9 * MIB) as usize]),
    )
    .await?;

    let err = fs
        .upload(
            *owner,
            upload_request("more.bin", 2 * MIB),
            body(vec![2; (2 * MIB) as usize]),
        )
        .await
        .unwrap_err();
    assert!(err.is_quota_exceeded());
    assert_eq!(fs.database().used_bytes(*owner)?, 9 * MIB);
    assert_quota_conserved(&fixture).await?;
    Ok(())
}

#[tokio::test]
async fn test_s4_multipart_happy_path() -> anyhow::Result<()> {
    let fixture = setup(32 * MIB)?;
    let Fixture { fs, owner, .. } = &fixture;

    let init = fs
        .initiate_multipart(*owner, multipart_request("disk.img", 15 * MIB))
        .await?;
    assert_eq!(fs.database().used_bytes(*owner)?, 15 * MIB);

    // Parts pushed out of order and concurrently.
    let session_id = init.session_id;
    let uploads = [2u16, 1, 3].map(|n| {
        let token = init.token.clone();
        async move {
            fs.upload_part(
                &token,
                session_id,
                n,
                5 * MIB,
                body(vec![n as u8; (5 * MIB) as usize]),
            )
            .await
        }
    });
    let mut parts = future::try_join_all(uploads).await?;
    // Manifest submitted in whatever order the client held it.
    parts.rotate_left(1);
    let manifest: Vec<CompletedPartInput> = parts.iter().map(manifest_entry).collect();

    let node = fs
        .complete_multipart(&init.token, init.session_id, manifest)
        .await?;
    assert_eq!(node.size, 15 * MIB);
    assert_eq!(node.id, init.file_id);
    assert!(fs.database().get_session(init.session_id)?.is_none());
    assert_eq!(fs.database().used_bytes(*owner)?, 15 * MIB);

    // Parts were assembled in part-number order, not upload order.
    let download = fs.download(*owner, node.id, None).await?;
    let content = download.stream.collect_as_bytes().await?;
    assert_eq!(content.len(), (15 * MIB) as usize);
    assert_eq!(content[0], 1);
    assert_eq!(content[(5 * MIB) as usize], 2);
    assert_eq!(content[(10 * MIB) as usize], 3);

    assert_quota_conserved(&fixture).await?;
    assert_no_ghost_rows(&fixture).await?;
    Ok(())
}

#[tokio::test]
async fn test_s5_completion_with_missing_part() -> anyhow::Result<()> {
    let fixture = setup(32 * MIB)?;
    let Fixture { fs, owner, .. } = &fixture;

    let init = fs
        .initiate_multipart(*owner, multipart_request("disk.img", 15 * MIB))
        .await?;
    let mut parts = vec![];
    for n in [1u16, 3] {
        parts.push(
            fs.upload_part(
                &init.token,
                init.session_id,
                n,
                5 * MIB,
                body(vec![n as u8; (5 * MIB) as usize]),
            )
            .await?,
        );
    }

    let manifest: Vec<CompletedPartInput> = parts.iter().map(manifest_entry).collect();
    let err = fs
        .complete_multipart(&init.token, init.session_id, manifest)
        .await
        .unwrap_err();
    assert_eq!(err.short_msg(), Some("BadChunkSet"));

    // Failed completion keeps the session and the reservation for a retry.
    assert!(fs.database().get_session(init.session_id)?.is_some());
    assert_eq!(fs.database().used_bytes(*owner)?, 15 * MIB);
    assert!(fs.list(*owner, ListFilter::All).await?.files.is_empty());

    // Abort reclaims the quota.
    fs.abort_multipart(&init.token, init.session_id).await?;
    assert_eq!(fs.database().used_bytes(*owner)?, 0);
    assert!(fs.database().get_session(init.session_id)?.is_none());
    assert_quota_conserved(&fixture).await?;
    Ok(())
}

#[tokio::test]
async fn test_s6_duplicate_completion_conflicts() -> anyhow::Result<()> {
    let fixture = setup(32 * MIB)?;
    let Fixture { fs, owner, .. } = &fixture;

    let init = fs
        .initiate_multipart(*owner, multipart_request("disk.img", MIB))
        .await?;
    let part = fs
        .upload_part(
            &init.token,
            init.session_id,
            1,
            MIB,
            body(vec![5; MIB as usize]),
        )
        .await?;
    let manifest = vec![manifest_entry(&part)];

    let node = fs
        .complete_multipart(&init.token, init.session_id, manifest.clone())
        .await?;
    let err = fs
        .complete_multipart(&init.token, init.session_id, manifest)
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(err.short_msg(), Some("UploadAlreadyCompleted"));

    // Exactly one node and one object.
    let files = fs.list(*owner, ListFilter::All).await?.files;
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].id, node.id);
    assert!(fs.provider().exists(*owner, node.id).await?);
    assert_eq!(fs.database().used_bytes(*owner)?, MIB);
    assert_quota_conserved(&fixture).await?;
    Ok(())
}

#[tokio::test]
async fn test_s7_restore_collision_renames() -> anyhow::Result<()> {
    let fixture = setup(10 * MIB)?;
    let Fixture { fs, owner, .. } = &fixture;

    let first = fs
        .upload(*owner, upload_request("a.txt", 4), body(b"one!".to_vec()))
        .await?;
    fs.soft_delete(*owner, first.id).await?;
    fs.upload(*owner, upload_request("a.txt", 4), body(b"two!".to_vec()))
        .await?;

    let restored = fs.restore(*owner, first.id).await?;
    assert_eq!(restored.id, first.id);
    assert_eq!(restored.filename, "a (restored).txt");
    assert!(restored.deleted_at.is_none());

    // Content survived the round trip.
    let download = fs.download(*owner, restored.id, None).await?;
    assert_eq!(&download.stream.collect_as_bytes().await?[..], b"one!");
    assert_quota_conserved(&fixture).await?;
    assert_no_ghost_rows(&fixture).await?;
    Ok(())
}

#[tokio::test]
async fn test_restore_round_trip_without_conflict() -> anyhow::Result<()> {
    let fixture = setup(10 * MIB)?;
    let Fixture { fs, owner, .. } = &fixture;

    let node = fs
        .upload(*owner, upload_request("keep.txt", 9), body(b"unchanged".to_vec()))
        .await?;
    fs.soft_delete(*owner, node.id).await?;

    // Hidden from normal listings, visible in trash.
    assert!(fs.list(*owner, ListFilter::All).await?.files.is_empty());
    let trash = fs.list(*owner, ListFilter::Trash).await?.files;
    assert_eq!(trash.len(), 1);
    // Trash keeps the bytes reserved.
    assert_eq!(fs.database().used_bytes(*owner)?, 9);

    let restored = fs.restore(*owner, node.id).await?;
    assert_eq!(restored.id, node.id);
    assert_eq!(restored.filename, "keep.txt");
    assert_quota_conserved(&fixture).await?;
    Ok(())
}

#[tokio::test]
async fn test_restore_reparents_to_root_when_parent_trashed() -> anyhow::Result<()> {
    let fixture = setup(10 * MIB)?;
    let Fixture { fs, owner, .. } = &fixture;

    let dir = fs.create_directory(*owner, "inbox".to_string(), None).await?;
    let node = fs
        .upload(
            *owner,
            UploadRequest {
                parent_id: Some(dir.id),
                ..upload_request("mail.txt", 4)
            },
            body(b"mail".to_vec()),
        )
        .await?;
    fs.soft_delete(*owner, node.id).await?;
    fs.soft_delete(*owner, dir.id).await?;

    let restored = fs.restore(*owner, node.id).await?;
    assert_eq!(restored.parent_id, None);
    Ok(())
}

#[tokio::test]
async fn test_hard_delete_reclaims_subtree() -> anyhow::Result<()> {
    let fixture = setup(10 * MIB)?;
    let Fixture { fs, owner, .. } = &fixture;

    let dir = fs.create_directory(*owner, "bulk".to_string(), None).await?;
    let nested = fs
        .create_directory(*owner, "nested".to_string(), Some(dir.id))
        .await?;
    let a = fs
        .upload(
            *owner,
            UploadRequest {
                parent_id: Some(dir.id),
                ..upload_request("a.bin", 600)
            },
            body(vec![1; 600]),
        )
        .await?;
    let b = fs
        .upload(
            *owner,
            UploadRequest {
                parent_id: Some(nested.id),
                ..upload_request("b.bin", 400)
            },
            body(vec![2; 400]),
        )
        .await?;
    // A trashed descendant is purged along with the rest.
    fs.soft_delete(*owner, b.id).await?;
    let outside = fs
        .upload(*owner, upload_request("outside.bin", 50), body(vec![3; 50]))
        .await?;

    fs.hard_delete(*owner, dir.id).await?;

    // Invariant 7: no descendant row, quota down by exactly the subtree sum.
    assert_eq!(fs.database().used_bytes(*owner)?, 50);
    assert!(fs.database().get_node(*owner, dir.id)?.is_none());
    assert!(fs.database().get_node(*owner, nested.id)?.is_none());
    assert!(fs.database().get_node(*owner, a.id)?.is_none());
    assert!(fs.database().get_node(*owner, b.id)?.is_none());
    assert!(!fs.provider().exists(*owner, a.id).await?);
    assert!(!fs.provider().exists(*owner, b.id).await?);
    assert!(fs.provider().exists(*owner, outside.id).await?);

    // Hard-deleting again is NotFound.
    let err = fs.hard_delete(*owner, dir.id).await.unwrap_err();
    assert!(err.is_not_found());
    assert_quota_conserved(&fixture).await?;
    assert_no_ghost_rows(&fixture).await?;
    Ok(())
}

#[tokio::test]
async fn test_update_content_reconciles_quota() -> anyhow::Result<()> {
    let fixture = setup(10 * MIB)?;
    let Fixture { fs, owner, .. } = &fixture;

    let node = fs
        .upload(*owner, upload_request("doc.txt", 1000), body(vec![1; 1000]))
        .await?;
    assert_eq!(fs.database().used_bytes(*owner)?, 1000);

    // Shrink.
    let updated = fs
        .update_content(
            *owner,
            node.id,
            400,
            "text/plain".to_string(),
            None,
            body(vec![2; 400]),
        )
        .await?;
    assert_eq!(updated.size, 400);
    assert_eq!(updated.content_type, "text/plain");
    assert_eq!(fs.database().used_bytes(*owner)?, 400);

    // Grow.
    let updated = fs
        .update_content(
            *owner,
            node.id,
            2000,
            "text/plain".to_string(),
            None,
            body(vec![3; 2000]),
        )
        .await?;
    assert_eq!(updated.size, 2000);
    assert_eq!(fs.database().used_bytes(*owner)?, 2000);

    let download = fs.download(*owner, node.id, None).await?;
    assert_eq!(&download.stream.collect_as_bytes().await?[..], &vec![3u8; 2000][..]);
    assert_quota_conserved(&fixture).await?;
    Ok(())
}

#[tokio::test]
async fn test_update_content_rejects_directories_and_over_quota() -> anyhow::Result<()> {
    let fixture = setup(10 * MIB)?;
    let Fixture { fs, owner, .. } = &fixture;

    let dir = fs.create_directory(*owner, "dir".to_string(), None).await?;
    let err = fs
        .update_content(*owner, dir.id, 10, "text/plain".to_string(), None, body(vec![0; 10]))
        .await
        .unwrap_err();
    assert_eq!(err.short_msg(), Some("NotAFile"));

    let node = fs
        .upload(*owner, upload_request("doc.txt", MIB), body(vec![1; MIB as usize]))
        .await?;
    let err = fs
        .update_content(
            *owner,
            node.id,
            20 * MIB,
            "text/plain".to_string(),
            None,
            body(vec![2; 16]),
        )
        .await
        .unwrap_err();
    assert!(err.is_quota_exceeded());
    // Reservation rolled back, node untouched.
    assert_eq!(fs.database().used_bytes(*owner)?, MIB);
    assert_eq!(fs.get_node(*owner, node.id).await?.size, MIB);
    assert_quota_conserved(&fixture).await?;
    Ok(())
}

#[tokio::test]
async fn test_move_rename_favorite() -> anyhow::Result<()> {
    let fixture = setup(10 * MIB)?;
    let Fixture { fs, owner, .. } = &fixture;

    let dir = fs.create_directory(*owner, "docs".to_string(), None).await?;
    let node = fs
        .upload(*owner, upload_request("a.txt", 1), body(vec![0]))
        .await?;

    let moved = fs.move_node(*owner, node.id, Some(dir.id)).await?;
    assert_eq!(moved.parent_id, Some(dir.id));

    let renamed = fs.rename(*owner, node.id, "b.txt".to_string()).await?;
    assert_eq!(renamed.filename, "b.txt");

    // Flip, then set explicitly.
    let flipped = fs.set_favorite(*owner, node.id, None).await?;
    assert!(flipped.is_favorite);
    let unset = fs.set_favorite(*owner, node.id, Some(false)).await?;
    assert!(!unset.is_favorite);

    // A sibling with the same name blocks both rename and move.
    let sibling = fs
        .upload(
            *owner,
            UploadRequest {
                parent_id: Some(dir.id),
                ..upload_request("c.txt", 1)
            },
            body(vec![0]),
        )
        .await?;
    let err = fs
        .rename(*owner, sibling.id, "b.txt".to_string())
        .await
        .unwrap_err();
    assert_eq!(err.short_msg(), Some("FileNameConflict"));
    let root_file = fs
        .upload(*owner, upload_request("b.txt", 1), body(vec![0]))
        .await?;
    let err = fs
        .move_node(*owner, root_file.id, Some(dir.id))
        .await
        .unwrap_err();
    assert_eq!(err.short_msg(), Some("FileNameConflict"));
    Ok(())
}

#[tokio::test]
async fn test_move_into_own_subtree_is_rejected() -> anyhow::Result<()> {
    let fixture = setup(10 * MIB)?;
    let Fixture { fs, owner, .. } = &fixture;

    let a = fs.create_directory(*owner, "a".to_string(), None).await?;
    let b = fs.create_directory(*owner, "b".to_string(), Some(a.id)).await?;

    let err = fs.move_node(*owner, a.id, Some(b.id)).await.unwrap_err();
    assert!(err.is_conflict());
    let err = fs.move_node(*owner, a.id, Some(a.id)).await.unwrap_err();
    assert!(err.is_conflict());

    // Moving into a file is refused too.
    let file = fs
        .upload(*owner, upload_request("f.txt", 1), body(vec![0]))
        .await?;
    let err = fs.move_node(*owner, b.id, Some(file.id)).await.unwrap_err();
    assert_eq!(err.short_msg(), Some("MoveTargetNotADirectory"));
    Ok(())
}

#[tokio::test]
async fn test_ownership_is_enforced() -> anyhow::Result<()> {
    let fixture = setup(10 * MIB)?;
    let Fixture { rt, fs, owner } = &fixture;
    let stranger = UserId::from(rt.new_uuid_v4());
    fs.database().ensure_user(stranger, TIER)?;

    let node = fs
        .upload(*owner, upload_request("mine.txt", 4), body(b"mine".to_vec()))
        .await?;
    // Another user's id simply does not resolve.
    assert!(fs.download(stranger, node.id, None).await.unwrap_err().is_not_found());
    assert!(fs.soft_delete(stranger, node.id).await.unwrap_err().is_not_found());
    assert!(fs.hard_delete(stranger, node.id).await.unwrap_err().is_not_found());
    Ok(())
}

#[tokio::test]
async fn test_multipart_abort_is_idempotent() -> anyhow::Result<()> {
    let fixture = setup(32 * MIB)?;
    let Fixture { fs, owner, .. } = &fixture;

    let init = fs
        .initiate_multipart(*owner, multipart_request("big.bin", 4 * MIB))
        .await?;
    fs.upload_part(
        &init.token,
        init.session_id,
        1,
        MIB,
        body(vec![1; MIB as usize]),
    )
    .await?;

    fs.abort_multipart(&init.token, init.session_id).await?;
    assert_eq!(fs.database().used_bytes(*owner)?, 0);
    // A second abort must not release twice.
    fs.abort_multipart(&init.token, init.session_id).await?;
    assert_eq!(fs.database().used_bytes(*owner)?, 0);
    assert_quota_conserved(&fixture).await?;
    Ok(())
}

#[tokio::test]
async fn test_part_upload_guards() -> anyhow::Result<()> {
    let fixture = setup(32 * MIB)?;
    let Fixture { fs, owner, .. } = &fixture;

    let init = fs
        .initiate_multipart(*owner, multipart_request("big.bin", 4 * MIB))
        .await?;
    let other = fs
        .initiate_multipart(*owner, multipart_request("other.bin", MIB))
        .await?;

    // Token bound to a different session id in the URL.
    let err = fs
        .upload_part(&init.token, other.session_id, 1, 16, body(vec![0; 16]))
        .await
        .unwrap_err();
    assert_eq!(err.short_msg(), Some("SessionMismatch"));

    // Part number out of range.
    let err = fs
        .upload_part(&init.token, init.session_id, 0, 16, body(vec![0; 16]))
        .await
        .unwrap_err();
    assert_eq!(err.short_msg(), Some("InvalidPartNumber"));

    // Declared chunk size over the token's ceiling is rejected up front.
    let err = fs
        .upload_part(
            &init.token,
            init.session_id,
            1,
            64 * MIB,
            body(vec![0; 16]),
        )
        .await
        .unwrap_err();
    assert_eq!(err.short_msg(), Some("OversizeStream"));

    // Garbage token.
    let err = fs
        .upload_part("not-a-token", init.session_id, 1, 16, body(vec![0; 16]))
        .await
        .unwrap_err();
    assert_eq!(err.short_msg(), Some("InvalidUploadToken"));
    Ok(())
}

#[tokio::test]
async fn test_expired_sessions_are_swept() -> anyhow::Result<()> {
    let fixture = setup(32 * MIB)?;
    let Fixture { rt, fs, owner } = &fixture;

    let init = fs
        .initiate_multipart(*owner, multipart_request("stale.bin", 8 * MIB))
        .await?;
    fs.upload_part(
        &init.token,
        init.session_id,
        1,
        MIB,
        body(vec![1; MIB as usize]),
    )
    .await?;
    assert_eq!(fs.database().used_bytes(*owner)?, 8 * MIB);

    // Nothing to sweep yet.
    assert_eq!(fs.sweep_expired_sessions().await?, 0);

    rt.advance(Duration::from_secs(25 * 60 * 60));
    assert_eq!(fs.sweep_expired_sessions().await?, 1);
    assert_eq!(fs.database().used_bytes(*owner)?, 0);
    assert!(fs.database().get_session(init.session_id)?.is_none());
    // Double execution is safe.
    assert_eq!(fs.sweep_expired_sessions().await?, 0);
    assert_eq!(fs.database().used_bytes(*owner)?, 0);

    // The token died with the session.
    let err = fs
        .upload_part(&init.token, init.session_id, 2, 16, body(vec![0; 16]))
        .await
        .unwrap_err();
    assert_eq!(err.short_msg(), Some("UploadTokenExpired"));
    assert_quota_conserved(&fixture).await?;
    Ok(())
}

#[tokio::test]
async fn test_multipart_quota_exceeded_at_initiate() -> anyhow::Result<()> {
    let fixture = setup(10 * MIB)?;
    let Fixture { fs, owner, .. } = &fixture;

    let err = fs
        .initiate_multipart(*owner, multipart_request("huge.bin", 11 * MIB))
        .await
        .unwrap_err();
    assert!(err.is_quota_exceeded());
    assert_eq!(fs.database().used_bytes(*owner)?, 0);
    Ok(())
}

#[tokio::test]
async fn test_folder_listing_with_breadcrumbs() -> anyhow::Result<()> {
    let fixture = setup(10 * MIB)?;
    let Fixture { rt, fs, owner } = &fixture;

    let top = fs.create_directory(*owner, "top".to_string(), None).await?;
    let sub = fs
        .create_directory(*owner, "sub".to_string(), Some(top.id))
        .await?;
    fs.upload(
        *owner,
        UploadRequest {
            parent_id: Some(sub.id),
            ..upload_request("leaf.txt", 1)
        },
        body(vec![0]),
    )
    .await?;

    let listing = fs.list(*owner, ListFilter::Folder(Some(sub.id))).await?;
    assert_eq!(listing.parent_id, Some(sub.id));
    let crumb_names: Vec<&str> = listing
        .breadcrumbs
        .iter()
        .map(|c| c.filename.as_str())
        .collect();
    assert_eq!(crumb_names, vec!["top", "sub"]);
    assert_eq!(listing.files.len(), 1);

    // Listing an unknown folder is NotFound.
    let bogus = common::types::FileId::from(rt.new_uuid_v4());
    let err = fs
        .list(*owner, ListFilter::Folder(Some(bogus)))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    Ok(())
}
