//! The stateless multipart protocol. Initiate reserves the full claimed
//! size and mints a signed token carrying every claim completion will need;
//! part uploads verify the token and talk straight to the provider with zero
//! database work; completion validates the client's manifest and commits;
//! abort and the expiry sweeper reclaim whatever the client abandoned.

use common::{
    knobs::{
        MULTIPART_MAX_CHUNK_SIZE_BYTES,
        MULTIPART_SESSION_TTL,
    },
    runtime::{
        Runtime,
        UnixTimestamp,
    },
    stream::{
        oversize_stream_error,
        FileStream,
    },
    types::{
        FileId,
        SessionId,
        UserId,
    },
};
use errors::{
    report_error,
    ErrorMetadata,
};
use keybroker::UploadTokenClaims;
use model::types::{
    FileNode,
    MultipartSession,
};
use serde::{
    Deserialize,
    Serialize,
};
use storage::{
    bad_chunk_set,
    ObjectPart,
    PartNumber,
    UploadId,
};

use crate::{
    core::{
        check_filename,
        size_mismatch,
    },
    FileStorage,
    SyncEventKind,
};

#[derive(Clone, Debug)]
pub struct MultipartInitRequest {
    pub filename: String,
    pub content_type: String,
    pub total_size: u64,
    pub parent_id: Option<FileId>,
    pub last_modified: Option<UnixTimestamp>,
}

#[derive(Debug, Serialize)]
pub struct MultipartInitiated {
    #[serde(rename = "sessionID")]
    pub session_id: SessionId,
    #[serde(rename = "fileID")]
    pub file_id: FileId,
    #[serde(rename = "uploadID")]
    pub upload_id: String,
    #[serde(rename = "maxChunkSize")]
    pub max_chunk_size: u64,
    pub token: String,
}

/// One entry of the client-retained completion manifest.
#[derive(Clone, Debug, Deserialize)]
pub struct CompletedPartInput {
    #[serde(rename = "partNumber")]
    pub part_number: u16,
    pub etag: String,
    pub size: u64,
}

fn session_mismatch() -> ErrorMetadata {
    ErrorMetadata::forbidden(
        "SessionMismatch",
        "upload token does not belong to this session",
    )
}

impl<RT: Runtime> FileStorage<RT> {
    /// Reserves the full claimed size up front, opens a provider upload, and
    /// hands the client a signed token. Keeping the whole reservation honest
    /// from the start is what lets thousands of parts proceed in parallel
    /// without ledger work.
    pub async fn initiate_multipart(
        &self,
        owner_id: UserId,
        request: MultipartInitRequest,
    ) -> anyhow::Result<MultipartInitiated> {
        let MultipartInitRequest {
            filename,
            content_type,
            total_size,
            parent_id,
            last_modified,
        } = request;
        check_filename(&filename)?;
        self.check_parent_directory(owner_id, parent_id).await?;
        self.db.ensure_unique_name(owner_id, parent_id, &filename)?;

        self.db.reserve(owner_id, total_size)?;
        let file_id = FileId::from(self.rt.new_uuid_v4());

        let upload_id = match self.provider.initiate_multipart(owner_id, file_id).await {
            Ok(upload_id) => upload_id,
            Err(e) => {
                self.db.release(owner_id, total_size)?;
                return Err(e);
            },
        };

        let session_id = SessionId::from(self.rt.new_uuid_v4());
        let now = self.rt.unix_timestamp();
        let expires_at = now + *MULTIPART_SESSION_TTL;
        let session = MultipartSession {
            id: session_id,
            file_id,
            upload_id: upload_id.to_string(),
            owner_id,
            filename: filename.clone(),
            content_type: content_type.clone(),
            parent_id,
            total_size,
            last_modified_at: last_modified,
            expires_at,
        };
        if let Err(e) = self.db.insert_session(&session) {
            self.abort_provider_upload(owner_id, file_id, &upload_id).await;
            self.db.release(owner_id, total_size)?;
            return Err(e);
        }

        let claims = UploadTokenClaims {
            session_id,
            file_id,
            upload_id: upload_id.to_string(),
            owner_id,
            filename,
            content_type,
            total_size,
            max_chunk_size: *MULTIPART_MAX_CHUNK_SIZE_BYTES,
            parent_id,
            last_modified,
            issued_at: now,
            expires_at,
        };
        let token = match self.key_broker.issue_upload_token(&claims) {
            Ok(token) => token,
            Err(e) => {
                self.abort_provider_upload(owner_id, file_id, &upload_id).await;
                self.db.delete_session(session_id)?;
                self.db.release(owner_id, total_size)?;
                return Err(e);
            },
        };

        tracing::info!(
            session_id = %session_id,
            file_id = %file_id,
            total_size,
            "initiated multipart upload"
        );
        Ok(MultipartInitiated {
            session_id,
            file_id,
            upload_id: upload_id.to_string(),
            max_chunk_size: *MULTIPART_MAX_CHUNK_SIZE_BYTES,
            token,
        })
    }

    /// The hot path. Executes thousands of times per large upload and
    /// touches zero database rows: the token is the session state.
    pub async fn upload_part(
        &self,
        token: &str,
        url_session_id: SessionId,
        part_number: u16,
        content_length: u64,
        body: FileStream,
    ) -> anyhow::Result<ObjectPart> {
        let claims = self.check_token(token, url_session_id)?;

        let part_number = PartNumber::try_from(part_number).map_err(|e| {
            e.context(ErrorMetadata::bad_request(
                "InvalidPartNumber",
                "part numbers run from 1 to 10000",
            ))
        })?;
        // Reject before reading any body bytes.
        if content_length > claims.max_chunk_size {
            anyhow::bail!(oversize_stream_error(claims.max_chunk_size));
        }

        self.provider
            .upload_part(
                claims.owner_id,
                claims.file_id,
                &UploadId::from(claims.upload_id),
                part_number,
                body,
                content_length,
            )
            .await
    }

    /// Validates the client-supplied manifest and assembles the object.
    /// Failure semantics differ by step: a bad manifest or chunk set keeps
    /// the session and the reservation alive for a client retry, while a
    /// commit failure after assembly unwinds everything.
    pub async fn complete_multipart(
        &self,
        token: &str,
        url_session_id: SessionId,
        manifest: Vec<CompletedPartInput>,
    ) -> anyhow::Result<FileNode> {
        let claims = self.check_token(token, url_session_id)?;
        let owner_id = claims.owner_id;
        let file_id = claims.file_id;
        let upload_id = UploadId::from(claims.upload_id.clone());

        // Duplicate-completion guard, backed by the primary key on file id:
        // each token is effectively single-use.
        if self.db.node_id_exists(file_id)? {
            anyhow::bail!(ErrorMetadata::conflict(
                "UploadAlreadyCompleted",
                "this upload has already been completed",
            ));
        }

        let parts = validate_manifest(manifest)?;
        let assembled_size = self
            .provider
            .complete_multipart(owner_id, file_id, &upload_id, &parts)
            .await?;

        if assembled_size != claims.total_size {
            // The object exists but does not match what was reserved; tear
            // it down rather than commit a lie.
            self.cleanup_object(owner_id, file_id).await;
            self.db.release(owner_id, claims.total_size)?;
            self.db.delete_session(claims.session_id)?;
            anyhow::bail!(size_mismatch(claims.total_size, Some(assembled_size)));
        }

        let now = self.rt.unix_timestamp();
        let node = FileNode {
            id: file_id,
            owner_id,
            parent_id: claims.parent_id,
            filename: claims.filename.clone(),
            content_type: claims.content_type.clone(),
            size: claims.total_size,
            is_directory: false,
            is_favorite: false,
            is_shared: false,
            created_at: now,
            updated_at: now,
            last_modified_at: claims.last_modified,
            deleted_at: None,
        };
        if let Err(e) = self.db.insert_node(&node) {
            if self.db.node_id_exists(file_id)? {
                // Lost a completion race. The winner's node owns both the
                // object and the reservation, so compensating here would
                // corrupt them.
                anyhow::bail!(ErrorMetadata::conflict(
                    "UploadAlreadyCompleted",
                    "this upload has already been completed",
                ));
            }
            self.cleanup_object(owner_id, file_id).await;
            self.db.release(owner_id, claims.total_size)?;
            self.db.delete_session(claims.session_id)?;
            return Err(e);
        }
        self.db.delete_session(claims.session_id)?;

        tracing::info!(
            session_id = %claims.session_id,
            file_id = %file_id,
            size = claims.total_size,
            parts = parts.len(),
            "completed multipart upload"
        );
        self.emit(owner_id, file_id, SyncEventKind::Create, true);
        Ok(node)
    }

    /// Abort is always reported as successful: the session row is the
    /// linearization point, and whoever deletes it performs the reclaim.
    /// Everything after that is best-effort with the sweeper as the safety
    /// net.
    pub async fn abort_multipart(
        &self,
        token: &str,
        url_session_id: SessionId,
    ) -> anyhow::Result<()> {
        let claims = self.check_token(token, url_session_id)?;

        if !self.db.delete_session(claims.session_id)? {
            // Already completed, aborted, or swept; nothing left to reclaim.
            return Ok(());
        }
        if self.db.node_id_exists(claims.file_id)? {
            // Lost the race against completion: the file exists and its
            // reservation is accounted for.
            return Ok(());
        }
        if let Err(e) = self.db.release(claims.owner_id, claims.total_size) {
            report_error(&e.context("failed to release quota while aborting upload"));
        }
        self.abort_provider_upload(
            claims.owner_id,
            claims.file_id,
            &UploadId::from(claims.upload_id),
        )
        .await;
        tracing::info!(session_id = %claims.session_id, "aborted multipart upload");
        Ok(())
    }

    fn check_token(
        &self,
        token: &str,
        url_session_id: SessionId,
    ) -> anyhow::Result<UploadTokenClaims> {
        let claims = self
            .key_broker
            .check_upload_token(token, self.rt.unix_timestamp())?;
        if claims.session_id != url_session_id {
            anyhow::bail!(session_mismatch());
        }
        Ok(claims)
    }

    pub(crate) async fn abort_provider_upload(
        &self,
        owner_id: UserId,
        file_id: FileId,
        upload_id: &UploadId,
    ) {
        if let Err(e) = self
            .provider
            .abort_multipart(owner_id, file_id, upload_id)
            .await
        {
            report_error(&e.context(format!("failed to abort provider upload {upload_id}")));
        }
    }
}

/// The manifest must be non-empty and its part numbers must form the
/// contiguous set `{1..N}` with no duplicates. Returns the parts sorted
/// ascending, ready for the provider.
fn validate_manifest(manifest: Vec<CompletedPartInput>) -> anyhow::Result<Vec<ObjectPart>> {
    if manifest.is_empty() {
        anyhow::bail!(bad_chunk_set("completion manifest is empty"));
    }
    let mut parts = Vec::with_capacity(manifest.len());
    for entry in manifest {
        let part_number = PartNumber::try_from(entry.part_number)
            .map_err(|e| e.context(bad_chunk_set("manifest part number out of range")))?;
        parts.push(ObjectPart {
            part_number,
            etag: entry.etag,
            size: entry.size,
        });
    }
    parts.sort_by_key(|part| part.part_number);
    for (index, part) in parts.iter().enumerate() {
        let expected = (index + 1) as u16;
        if part.part_number.as_u16() != expected {
            anyhow::bail!(bad_chunk_set(format!(
                "manifest part numbers must form 1..={} with no gaps or duplicates",
                parts.len()
            )));
        }
    }
    Ok(parts)
}

#[cfg(test)]
mod manifest_tests {
    use super::{
        validate_manifest,
        CompletedPartInput,
    };

    fn entry(part_number: u16) -> CompletedPartInput {
        CompletedPartInput {
            part_number,
            etag: format!("etag-{part_number}"),
            size: 1024,
        }
    }

    #[test]
    fn test_unordered_manifest_is_sorted() -> anyhow::Result<()> {
        let parts = validate_manifest(vec![entry(2), entry(3), entry(1)])?;
        let numbers: Vec<u16> = parts.iter().map(|p| p.part_number.as_u16()).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        Ok(())
    }

    #[test]
    fn test_bad_manifests_are_rejected() {
        use errors::ErrorMetadataAnyhowExt;

        // Empty, gap, duplicate, not starting at one, out of range.
        let cases = vec![
            vec![],
            vec![entry(1), entry(3)],
            vec![entry(1), entry(1), entry(2)],
            vec![entry(2), entry(3)],
            vec![entry(0), entry(1)],
        ];
        for manifest in cases {
            let err = validate_manifest(manifest).unwrap_err();
            assert_eq!(err.short_msg(), Some("BadChunkSet"));
        }
    }
}
