use std::{
    mem,
    ops::Range,
};

use anyhow::Context;
use async_trait::async_trait;
use aws_config::{
    retry::RetryConfig,
    BehaviorVersion,
};
use aws_sdk_s3::{
    error::{
        ProvideErrorMetadata,
        SdkError,
    },
    primitives::ByteStream,
    types::{
        CompletedMultipartUpload,
        CompletedPart,
    },
    Client,
};
use bytes::Bytes;
use common::{
    stream::{
        map_body_error,
        CountingStream,
        FileStream,
    },
    types::{
        FileId,
        UserId,
    },
};
use errors::report_error;
use futures::{
    StreamExt,
    TryStreamExt,
};
use storage::{
    bad_chunk_set,
    object_not_found,
    ObjectPart,
    PartNumber,
    StorageGetStream,
    StorageProvider,
    UploadId,
};

use crate::{
    into_io_stream,
    sdk_error,
};

/// Intermediate part size for single-shot saves streamed through S3
/// multipart. S3 requires at least 5 MiB for every part but the last.
const SAVE_PART_SIZE: usize = 8 * (1 << 20);

#[derive(Clone)]
pub struct S3Storage {
    client: Client,
    bucket: String,
    // Prepended to every key, for sharing a bucket between deployments.
    key_prefix: String,
}

impl std::fmt::Debug for S3Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Storage")
            .field("bucket", &self.bucket)
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

async fn s3_client() -> anyhow::Result<Client> {
    static S3_CLIENT: tokio::sync::OnceCell<Client> = tokio::sync::OnceCell::const_new();
    let client = S3_CLIENT
        .get_or_init(|| async {
            let config = aws_config::defaults(BehaviorVersion::latest())
                .retry_config(RetryConfig::standard())
                .load()
                .await;
            Client::new(&config)
        })
        .await
        .clone();
    Ok(client)
}

impl S3Storage {
    pub async fn new_with_prefix(bucket: String, key_prefix: String) -> anyhow::Result<Self> {
        Ok(Self {
            client: s3_client().await?,
            bucket,
            key_prefix,
        })
    }

    pub fn new_from_client(client: Client, bucket: String, key_prefix: String) -> Self {
        Self {
            client,
            bucket,
            key_prefix,
        }
    }

    fn s3_key(&self, owner_id: UserId, file_id: FileId) -> String {
        format!("{}{owner_id}/{file_id}", self.key_prefix)
    }

    async fn put_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> anyhow::Result<CompletedPart> {
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| sdk_error("upload part", e))?;
        let etag = output.e_tag().context("uploaded part is missing an etag")?;
        Ok(CompletedPart::builder()
            .part_number(part_number)
            .e_tag(etag)
            .build())
    }

    /// Buffers the inbound stream into >= 5 MiB parts and pushes them
    /// through a provider-native multipart upload.
    async fn stream_parts(
        &self,
        key: &str,
        upload_id: &str,
        body: FileStream,
        max_size: u64,
    ) -> anyhow::Result<u64> {
        let (counted, counter) = CountingStream::new(body, max_size);
        let mut counted = counted;
        let mut completed = vec![];
        let mut buffer: Vec<u8> = Vec::with_capacity(SAVE_PART_SIZE);
        let mut part_number: i32 = 1;
        while let Some(chunk) = counted
            .try_next()
            .await
            .map_err(|e| map_body_error(e, max_size))?
        {
            buffer.extend_from_slice(&chunk);
            if buffer.len() >= SAVE_PART_SIZE {
                let data = mem::replace(&mut buffer, Vec::with_capacity(SAVE_PART_SIZE));
                completed.push(self.put_part(key, upload_id, part_number, data.into()).await?);
                part_number += 1;
            }
        }
        // The final part may be arbitrarily small; S3 also refuses
        // zero-part uploads, so an empty object still gets one empty part.
        if !buffer.is_empty() || completed.is_empty() {
            let data = mem::take(&mut buffer);
            completed.push(self.put_part(key, upload_id, part_number, data.into()).await?);
        }
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| sdk_error("complete multipart upload", e))?;
        Ok(counter.get())
    }

    async fn object_size(&self, key: &str) -> anyhow::Result<Option<u64>> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;
        match result {
            Ok(head) => {
                let size = head.content_length().context("object is missing a size")?;
                Ok(Some(size as u64))
            },
            Err(SdkError::ServiceError(service_err)) if service_err.err().is_not_found() => {
                Ok(None)
            },
            Err(e) => Err(sdk_error("head object", e)),
        }
    }

}

fn service_error_code<E: ProvideErrorMetadata>(err: &SdkError<E>) -> Option<&str> {
    match err {
        SdkError::ServiceError(service_err) => service_err.err().code(),
        _ => None,
    }
}

#[async_trait]
impl StorageProvider for S3Storage {
    async fn save(
        &self,
        owner_id: UserId,
        file_id: FileId,
        body: FileStream,
        max_size: u64,
    ) -> anyhow::Result<u64> {
        let key = self.s3_key(owner_id, file_id);
        let create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| sdk_error("create multipart upload", e))?;
        let upload_id = create
            .upload_id()
            .context("multipart upload is missing an upload id")?
            .to_string();

        match self.stream_parts(&key, &upload_id, body, max_size).await {
            Ok(actual_bytes) => Ok(actual_bytes),
            Err(e) => {
                if let Err(abort_err) = self
                    .abort_multipart(owner_id, file_id, &UploadId::from(upload_id))
                    .await
                {
                    report_error(&abort_err.context("failed to abort save upload"));
                }
                Err(e)
            },
        }
    }

    async fn get(
        &self,
        owner_id: UserId,
        file_id: FileId,
        range: Option<Range<u64>>,
    ) -> anyhow::Result<StorageGetStream> {
        let mut request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.s3_key(owner_id, file_id));
        if let Some(range) = &range {
            if range.start >= range.end {
                return Ok(StorageGetStream {
                    content_length: 0,
                    stream: futures::stream::empty().boxed(),
                });
            }
            request = request.range(format!("bytes={}-{}", range.start, range.end - 1));
        }
        let output = match request.send().await {
            Ok(output) => output,
            Err(e) if service_error_code(&e) == Some("NoSuchKey") => {
                anyhow::bail!(object_not_found(owner_id, file_id));
            },
            Err(e) => return Err(sdk_error("get object", e)),
        };
        Ok(StorageGetStream {
            content_length: output
                .content_length()
                .context("object is missing a content length")? as u64,
            stream: into_io_stream(output.body),
        })
    }

    async fn delete(&self, owner_id: UserId, file_id: FileId) -> anyhow::Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.s3_key(owner_id, file_id))
            .send()
            .await
            .map_err(|e| sdk_error("delete object", e))?;
        Ok(())
    }

    async fn exists(&self, owner_id: UserId, file_id: FileId) -> anyhow::Result<bool> {
        Ok(self
            .object_size(&self.s3_key(owner_id, file_id))
            .await?
            .is_some())
    }

    async fn initiate_multipart(
        &self,
        owner_id: UserId,
        file_id: FileId,
    ) -> anyhow::Result<UploadId> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(self.s3_key(owner_id, file_id))
            .send()
            .await
            .map_err(|e| sdk_error("create multipart upload", e))?;
        let upload_id = output
            .upload_id()
            .context("multipart upload is missing an upload id")?;
        Ok(UploadId::from(upload_id.to_string()))
    }

    async fn upload_part(
        &self,
        owner_id: UserId,
        file_id: FileId,
        upload_id: &UploadId,
        part_number: PartNumber,
        body: FileStream,
        max_size: u64,
    ) -> anyhow::Result<ObjectPart> {
        // Chunks are bounded by the token's max chunk size, so buffering one
        // in memory is fine and gives the SDK a sized body.
        let (counted, counter) = CountingStream::new(body, max_size);
        let mut counted = counted;
        let mut buffer = Vec::new();
        while let Some(chunk) = counted
            .try_next()
            .await
            .map_err(|e| map_body_error(e, max_size))?
        {
            buffer.extend_from_slice(&chunk);
        }

        let completed = self
            .put_part(
                &self.s3_key(owner_id, file_id),
                upload_id.as_str(),
                part_number.as_u16() as i32,
                buffer.into(),
            )
            .await?;
        Ok(ObjectPart {
            part_number,
            etag: completed.e_tag().context("part is missing an etag")?.to_string(),
            size: counter.get(),
        })
    }

    async fn complete_multipart(
        &self,
        owner_id: UserId,
        file_id: FileId,
        upload_id: &UploadId,
        parts: &[ObjectPart],
    ) -> anyhow::Result<u64> {
        let key = self.s3_key(owner_id, file_id);
        let completed_parts: Vec<CompletedPart> = parts
            .iter()
            .map(|part| {
                CompletedPart::builder()
                    .part_number(part.part_number.as_u16() as i32)
                    .e_tag(&part.etag)
                    .build()
            })
            .collect();
        let result = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .upload_id(upload_id.as_str())
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await;
        if let Err(e) = result {
            // An etag the provider does not recognize means the manifest
            // does not describe the uploaded chunks.
            match service_error_code(&e) {
                Some("InvalidPart") | Some("InvalidPartOrder") | Some("NoSuchPart") => {
                    return Err(sdk_error("complete multipart upload", e)
                        .context(bad_chunk_set("provider rejected the completion manifest")));
                },
                _ => anyhow::bail!(sdk_error("complete multipart upload", e)),
            }
        }
        self.object_size(&key)
            .await?
            .context("completed object is missing")
    }

    async fn abort_multipart(
        &self,
        owner_id: UserId,
        file_id: FileId,
        upload_id: &UploadId,
    ) -> anyhow::Result<()> {
        let result = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(self.s3_key(owner_id, file_id))
            .upload_id(upload_id.as_str())
            .send()
            .await;
        match result {
            Ok(_) => Ok(()),
            // Aborting an upload that no longer exists is a no-op.
            Err(e) if service_error_code(&e) == Some("NoSuchUpload") => Ok(()),
            Err(e) => Err(sdk_error("abort multipart upload", e)),
        }
    }
}
