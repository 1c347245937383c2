//! src/services/fs_backend.rs
//!
//! Local filesystem backend. Blobs live sharded beneath
//! `base_path/{bucket}/{shard}/{shard}/{key}`; writes go to a temporary file
//! first and are renamed into place once fully flushed, so readers never see
//! partial content.

use crate::services::{
    backend::{BlobStream, PhysicalBackend, StoredBlob, content_type_for},
    storage_service::{StorageError, StorageResult},
};
use axum::{
    body::Body,
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use futures::StreamExt;
use md5::Context;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

pub const FS_BACKEND: &str = "fs";

const MAX_PHYSICAL_KEY_LEN: usize = 255;

/// Physical keys never change their content, so delivered blobs may be cached forever.
const IMMUTABLE_CACHE_CONTROL: &str = "public, max-age=31536000, immutable";

#[derive(Debug, Clone)]
pub struct FileSystemBackend {
    base_path: PathBuf,
}

impl FileSystemBackend {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn bucket_root(&self, bucket: &str) -> PathBuf {
        self.base_path.join(bucket)
    }

    /// Uses MD5(bucket/key) and returns the first two bytes as lowercase
    /// hexadecimal strings (00–ff). Reduces file count per directory.
    fn shards(bucket: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{bucket}/{key}"));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn blob_path(&self, bucket: &str, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::shards(bucket, key);
        let mut path = self.bucket_root(bucket);
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    /// Physical keys are generated internally, but delivery receives them
    /// from URLs, so anything resembling a path is rejected.
    fn ensure_key_safe(key: &str) -> StorageResult<()> {
        if key.is_empty() || key.len() > MAX_PHYSICAL_KEY_LEN {
            return Err(StorageError::InvalidObjectKey);
        }
        if key.starts_with('.') || key.contains("..") {
            return Err(StorageError::InvalidObjectKey);
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'/' || b == b'\\')
        {
            return Err(StorageError::InvalidObjectKey);
        }
        Ok(())
    }

    async fn open(&self, bucket: &str, key: &str) -> StorageResult<Option<File>> {
        Self::ensure_key_safe(key)?;
        match File::open(self.blob_path(bucket, key)).await {
            Ok(file) => Ok(Some(file)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    /// Recursively remove empty directories up to the bucket root.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl PhysicalBackend for FileSystemBackend {
    fn name(&self) -> &str {
        FS_BACKEND
    }

    async fn store(
        &self,
        bucket: &str,
        key: &str,
        mut data: BlobStream,
        checksum: Option<&str>,
        _size: Option<i64>,
    ) -> StorageResult<StoredBlob> {
        Self::ensure_key_safe(key)?;

        let file_path = self.blob_path(bucket, key);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::other("blob path missing parent directory"))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size: i64 = 0;
        let mut digest = Context::new();
        while let Some(chunk) = data.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(StorageError::Io(err));
                }
            };
            size += chunk.len() as i64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        drop(file);

        let actual = format!("{:x}", digest.compute());
        let mismatch = checksum.filter(|expected| !expected.eq_ignore_ascii_case(&actual));
        if let Some(expected) = mismatch {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::ChecksumMismatch {
                expected: expected.to_string(),
                actual,
            });
        }

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }

        debug!(bucket, key, size, "stored blob");
        Ok(StoredBlob {
            size,
            checksum: actual,
        })
    }

    async fn delete(&self, bucket: &str, key: &str) -> StorageResult<()> {
        Self::ensure_key_safe(key)?;
        let file_path = self.blob_path(bucket, key);
        match fs::remove_file(&file_path).await {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(StorageError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent, &self.bucket_root(bucket)).await;
        }
        Ok(())
    }

    async fn fetch(&self, bucket: &str, key: &str) -> StorageResult<Option<BlobStream>> {
        Ok(self
            .open(bucket, key)
            .await?
            .map(|file| Box::pin(ReaderStream::new(file)) as BlobStream))
    }

    async fn deliver(&self, bucket: &str, key: &str, extension: &str) -> StorageResult<Response> {
        let not_found = || StorageError::ObjectNotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        };
        let file = match self.open(bucket, key).await {
            Ok(Some(file)) => file,
            Ok(None) | Err(StorageError::InvalidObjectKey) => return Err(not_found()),
            Err(err) => return Err(err),
        };
        let length = file.metadata().await?.len();

        let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
        *response.status_mut() = StatusCode::OK;
        let headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&content_type_for(extension)) {
            headers.insert(header::CONTENT_TYPE, value);
        }
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
        headers.insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static(IMMUTABLE_CACHE_CONTROL),
        );
        Ok(response)
    }
}
