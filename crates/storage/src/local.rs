use std::{
    io,
    ops::Range,
    path::PathBuf,
    sync::Arc,
};

use anyhow::Context;
use async_trait::async_trait;
use common::{
    runtime::Runtime,
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
use futures::{
    stream,
    StreamExt,
    TryStreamExt,
};
use tempfile::TempDir;
use tokio::io::{
    AsyncReadExt,
    AsyncSeekExt,
    AsyncWriteExt,
};
use tokio_util::io::ReaderStream;

use crate::{
    bad_chunk_set,
    object_not_found,
    ObjectPart,
    PartNumber,
    StorageGetStream,
    StorageProvider,
    UploadId,
};

/// Filesystem-backed storage provider.
///
/// Objects live at `{root}/{first two hex chars of file id}/{file id}`.
/// Writes land in `{root}/_tmp` first and are renamed into place, so a
/// failed save never leaves a torn object behind. Multipart chunks live at
/// `{root}/_chunks/{file id}/{upload id}/part_{N}`; the directory tree is
/// the only session state the backend keeps.
#[derive(Clone)]
pub struct LocalDirStorage<RT: Runtime> {
    rt: RT,
    root: PathBuf,
    _temp_dir: Option<Arc<TempDir>>,
}

impl<RT: Runtime> std::fmt::Debug for LocalDirStorage<RT> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalDirStorage")
            .field("root", &self.root)
            .finish()
    }
}

impl<RT: Runtime> LocalDirStorage<RT> {
    /// Creates local storage under a temporary directory that is deleted
    /// when the last handle is dropped.
    pub fn new(rt: RT) -> anyhow::Result<Self> {
        let temp_dir = TempDir::new()?;
        Ok(Self {
            rt,
            root: temp_dir.path().to_owned(),
            _temp_dir: Some(Arc::new(temp_dir)),
        })
    }

    /// Creates storage rooted at the provided directory.
    pub fn new_at_path(rt: RT, root: PathBuf) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            rt,
            root,
            _temp_dir: None,
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.root
    }

    fn object_path(&self, file_id: FileId) -> PathBuf {
        let name = file_id.to_string();
        self.root.join(&name[..2]).join(name)
    }

    fn chunk_root(&self, file_id: FileId) -> PathBuf {
        self.root.join("_chunks").join(file_id.to_string())
    }

    fn chunk_dir(&self, file_id: FileId, upload_id: &UploadId) -> PathBuf {
        self.chunk_root(file_id).join(upload_id.as_str())
    }

    fn chunk_path(&self, file_id: FileId, upload_id: &UploadId, part_number: PartNumber) -> PathBuf {
        self.chunk_dir(file_id, upload_id)
            .join(format!("part_{part_number}"))
    }

    fn fresh_tmp_path(&self) -> PathBuf {
        self.root.join("_tmp").join(self.rt.new_uuid_v4().to_string())
    }

    /// Drains `body` into a fresh temp file, enforcing `max_size`, and
    /// returns the temp path plus the byte count. The temp file is removed
    /// on any failure.
    async fn spool_to_tmp(&self, body: FileStream, max_size: u64) -> anyhow::Result<(PathBuf, u64)> {
        let (counted, counter) = CountingStream::new(body, max_size);
        let tmp = self.fresh_tmp_path();
        tokio::fs::create_dir_all(tmp.parent().expect("tmp path has a parent")).await?;
        let mut file = tokio::fs::File::create(&tmp).await?;
        let written: anyhow::Result<()> = async {
            let mut counted = counted;
            while let Some(buf) = counted
                .try_next()
                .await
                .map_err(|e| map_body_error(e, max_size))?
            {
                file.write_all(&buf).await?;
            }
            file.sync_all().await?;
            Ok(())
        }
        .await;
        if let Err(e) = written {
            drop(file);
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }
        Ok((tmp, counter.get()))
    }

    async fn promote_tmp(&self, tmp: PathBuf, file_id: FileId) -> anyhow::Result<()> {
        let object = self.object_path(file_id);
        tokio::fs::create_dir_all(object.parent().expect("object path has a parent")).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &object).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e).context("failed to move spooled object into place");
        }
        Ok(())
    }
}

fn not_found_to_none<T>(result: io::Result<T>) -> io::Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl<RT: Runtime> StorageProvider for LocalDirStorage<RT> {
    async fn save(
        &self,
        _owner_id: UserId,
        file_id: FileId,
        body: FileStream,
        max_size: u64,
    ) -> anyhow::Result<u64> {
        let (tmp, actual_bytes) = self.spool_to_tmp(body, max_size).await?;
        self.promote_tmp(tmp, file_id).await?;
        Ok(actual_bytes)
    }

    async fn get(
        &self,
        owner_id: UserId,
        file_id: FileId,
        range: Option<Range<u64>>,
    ) -> anyhow::Result<StorageGetStream> {
        let path = self.object_path(file_id);
        let Some(mut file) = not_found_to_none(tokio::fs::File::open(&path).await)? else {
            anyhow::bail!(object_not_found(owner_id, file_id));
        };
        let size = file.metadata().await?.len();
        let (start, end) = match range {
            Some(range) => (range.start.min(size), range.end.min(size)),
            None => (0, size),
        };
        if start >= end {
            return Ok(StorageGetStream {
                content_length: 0,
                stream: stream::empty().boxed(),
            });
        }
        file.seek(io::SeekFrom::Start(start)).await?;
        let reader = file.take(end - start);
        Ok(StorageGetStream {
            content_length: end - start,
            stream: ReaderStream::new(reader).boxed(),
        })
    }

    async fn delete(&self, _owner_id: UserId, file_id: FileId) -> anyhow::Result<()> {
        not_found_to_none(tokio::fs::remove_file(self.object_path(file_id)).await)?;
        Ok(())
    }

    async fn exists(&self, _owner_id: UserId, file_id: FileId) -> anyhow::Result<bool> {
        Ok(not_found_to_none(tokio::fs::metadata(self.object_path(file_id)).await)?.is_some())
    }

    async fn initiate_multipart(
        &self,
        _owner_id: UserId,
        file_id: FileId,
    ) -> anyhow::Result<UploadId> {
        let upload_id = UploadId::from(self.rt.new_uuid_v4().to_string());
        tokio::fs::create_dir_all(self.chunk_dir(file_id, &upload_id)).await?;
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _owner_id: UserId,
        file_id: FileId,
        upload_id: &UploadId,
        part_number: PartNumber,
        body: FileStream,
        max_size: u64,
    ) -> anyhow::Result<ObjectPart> {
        let dir = self.chunk_dir(file_id, upload_id);
        if not_found_to_none(tokio::fs::metadata(&dir).await)?.is_none() {
            anyhow::bail!(upload_not_found(upload_id));
        }

        let (counted, counter) = CountingStream::new(body, max_size);
        let path = self.chunk_path(file_id, upload_id, part_number);
        // Create truncates, so a retried part number overwrites cleanly.
        let mut file = tokio::fs::File::create(&path).await?;
        let mut hasher = md5::Context::new();
        let written: anyhow::Result<()> = async {
            let mut counted = counted;
            while let Some(buf) = counted
                .try_next()
                .await
                .map_err(|e| map_body_error(e, max_size))?
            {
                hasher.consume(&buf);
                file.write_all(&buf).await?;
            }
            file.sync_all().await?;
            Ok(())
        }
        .await;
        if let Err(e) = written {
            drop(file);
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e);
        }
        Ok(ObjectPart {
            part_number,
            etag: format!("{:x}", hasher.compute()),
            size: counter.get(),
        })
    }

    async fn complete_multipart(
        &self,
        _owner_id: UserId,
        file_id: FileId,
        upload_id: &UploadId,
        parts: &[ObjectPart],
    ) -> anyhow::Result<u64> {
        let dir = self.chunk_dir(file_id, upload_id);
        if not_found_to_none(tokio::fs::metadata(&dir).await)?.is_none() {
            anyhow::bail!(upload_not_found(upload_id));
        }
        anyhow::ensure!(!parts.is_empty(), bad_chunk_set("completion manifest is empty"));

        let tmp = self.fresh_tmp_path();
        tokio::fs::create_dir_all(tmp.parent().expect("tmp path has a parent")).await?;
        let mut out = tokio::fs::File::create(&tmp).await?;
        let concatenated: anyhow::Result<u64> = async {
            let mut total = 0u64;
            for part in parts {
                let path = self.chunk_path(file_id, upload_id, part.part_number);
                let Some(chunk) = not_found_to_none(tokio::fs::File::open(&path).await)? else {
                    anyhow::bail!(bad_chunk_set(format!(
                        "part {} was never uploaded",
                        part.part_number
                    )));
                };
                let mut hasher = md5::Context::new();
                let mut reader = ReaderStream::new(chunk);
                let mut chunk_bytes = 0u64;
                while let Some(buf) = reader.try_next().await? {
                    hasher.consume(&buf);
                    chunk_bytes += buf.len() as u64;
                    out.write_all(&buf).await?;
                }
                let etag = format!("{:x}", hasher.compute());
                if etag != part.etag {
                    anyhow::bail!(bad_chunk_set(format!(
                        "part {} etag mismatch: expected {}, stored chunk has {etag}",
                        part.part_number, part.etag
                    )));
                }
                total += chunk_bytes;
            }
            out.sync_all().await?;
            Ok(total)
        }
        .await;
        let total = match concatenated {
            Ok(total) => total,
            Err(e) => {
                drop(out);
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(e);
            },
        };
        self.promote_tmp(tmp, file_id).await?;

        let _ = tokio::fs::remove_dir_all(&dir).await;
        // Remove the per-file chunk root too if this was its last upload.
        let _ = tokio::fs::remove_dir(self.chunk_root(file_id)).await;
        Ok(total)
    }

    async fn abort_multipart(
        &self,
        _owner_id: UserId,
        file_id: FileId,
        upload_id: &UploadId,
    ) -> anyhow::Result<()> {
        not_found_to_none(tokio::fs::remove_dir_all(self.chunk_dir(file_id, upload_id)).await)?;
        let _ = tokio::fs::remove_dir(self.chunk_root(file_id)).await;
        Ok(())
    }
}

fn upload_not_found(upload_id: &UploadId) -> errors::ErrorMetadata {
    errors::ErrorMetadata::not_found(
        "UploadNotFound",
        format!("multipart upload {upload_id} does not exist"),
    )
}
