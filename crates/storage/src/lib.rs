//! The storage provider capability: physical byte I/O behind a closed set of
//! interchangeable backends. The local filesystem backend lives here; the S3
//! backend lives in the `aws_s3` crate.

use std::{
    fmt::Debug,
    io,
    ops::Range,
};

use async_trait::async_trait;
use bytes::Bytes;
use common::{
    stream::FileStream,
    types::{
        FileId,
        UserId,
    },
};
use errors::ErrorMetadata;
use futures::stream::BoxStream;

mod local;

pub use local::LocalDirStorage;

/// Hard provider limit on multipart part numbers, fixed by S3 and mirrored
/// by the local backend.
pub const MAX_NUM_PARTS: u16 = 10000;

/// Provider-scoped identifier of an in-flight multipart upload. For S3 this
/// is the native upload id verbatim; the local backend generates an opaque
/// fresh id whose chunk directory is the state.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug, derive_more::Display)]
pub struct UploadId(String);

impl From<String> for UploadId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl UploadId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// 1-based part number, bounded by [`MAX_NUM_PARTS`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, derive_more::Display)]
pub struct PartNumber(u16);

impl TryFrom<u16> for PartNumber {
    type Error = anyhow::Error;

    fn try_from(n: u16) -> anyhow::Result<Self> {
        anyhow::ensure!(
            (1..=MAX_NUM_PARTS).contains(&n),
            "part number {n} outside 1..={MAX_NUM_PARTS}"
        );
        Ok(Self(n))
    }
}

impl From<PartNumber> for u16 {
    fn from(n: PartNumber) -> u16 {
        n.0
    }
}

impl PartNumber {
    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

/// One uploaded chunk: what the provider reports back after `upload_part`
/// and what the client hands back in the completion manifest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectPart {
    pub part_number: PartNumber,
    pub etag: String,
    pub size: u64,
}

/// A ranged download: the byte stream plus how many bytes it will yield.
pub struct StorageGetStream {
    pub content_length: u64,
    pub stream: BoxStream<'static, io::Result<Bytes>>,
}

impl std::fmt::Debug for StorageGetStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageGetStream")
            .field("content_length", &self.content_length)
            .finish()
    }
}

impl StorageGetStream {
    #[cfg(any(test, feature = "testing"))]
    pub async fn collect_as_bytes(self) -> anyhow::Result<Bytes> {
        use futures::TryStreamExt;

        let Self {
            content_length,
            stream,
        } = self;
        let chunks: Vec<Bytes> = stream.try_collect().await?;
        let content: Vec<u8> = chunks.concat();
        anyhow::ensure!(
            content_length as usize == content.len(),
            "ContentLength mismatch"
        );
        Ok(content.into())
    }
}

pub fn object_not_found(owner_id: UserId, file_id: FileId) -> ErrorMetadata {
    ErrorMetadata::not_found(
        "ObjectNotFound",
        format!("no stored object for ({owner_id}, {file_id})"),
    )
}

pub fn bad_chunk_set(msg: impl Into<std::borrow::Cow<'static, str>>) -> ErrorMetadata {
    ErrorMetadata::bad_request("BadChunkSet", msg)
}

/// Physical byte storage addressed by `(owner_id, file_id)`.
///
/// Implementations guarantee that `save` is all-or-nothing: after a failure
/// no partially-written object is observable. `delete` and `abort_multipart`
/// are idempotent; absence is not an error.
#[async_trait]
pub trait StorageProvider: Send + Sync + Debug {
    /// Writes the entire stream to the object addressed by
    /// `(owner_id, file_id)` and returns the number of bytes written. Fails
    /// with an `OversizeStream` tag if the client transmits more than
    /// `max_size` bytes.
    async fn save(
        &self,
        owner_id: UserId,
        file_id: FileId,
        body: FileStream,
        max_size: u64,
    ) -> anyhow::Result<u64>;

    /// Streams the object back, optionally restricted to a byte range. The
    /// range is clamped to the object size.
    async fn get(
        &self,
        owner_id: UserId,
        file_id: FileId,
        range: Option<Range<u64>>,
    ) -> anyhow::Result<StorageGetStream>;

    async fn delete(&self, owner_id: UserId, file_id: FileId) -> anyhow::Result<()>;

    async fn exists(&self, owner_id: UserId, file_id: FileId) -> anyhow::Result<bool>;

    async fn initiate_multipart(
        &self,
        owner_id: UserId,
        file_id: FileId,
    ) -> anyhow::Result<UploadId>;

    /// Streams one chunk. Repeating a part number overwrites the previous
    /// attempt, which is what makes client retries safe.
    async fn upload_part(
        &self,
        owner_id: UserId,
        file_id: FileId,
        upload_id: &UploadId,
        part_number: PartNumber,
        body: FileStream,
        max_size: u64,
    ) -> anyhow::Result<ObjectPart>;

    /// Assembles the final object from `parts`, which the caller supplies in
    /// ascending part-number order. Each part's etag is verified; a missing
    /// or mismatched chunk fails with `BadChunkSet`. Returns the final
    /// object size.
    async fn complete_multipart(
        &self,
        owner_id: UserId,
        file_id: FileId,
        upload_id: &UploadId,
        parts: &[ObjectPart],
    ) -> anyhow::Result<u64>;

    /// Discards all state of an in-flight upload. Succeeds even if some or
    /// all chunks are already gone.
    async fn abort_multipart(
        &self,
        owner_id: UserId,
        file_id: FileId,
        upload_id: &UploadId,
    ) -> anyhow::Result<()>;
}
