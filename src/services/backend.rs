//! src/services/backend.rs
//!
//! The physical backend contract. A backend persists immutable blobs under
//! caller-supplied opaque keys; it never overwrites a key in place. Which
//! backend serves a bucket is decided by the bucket configuration.

use crate::services::storage_service::StorageResult;
use axum::response::Response;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt, stream};
use std::{collections::HashMap, io, pin::Pin, sync::Arc};

/// Streamed blob content, as accepted by [`PhysicalBackend::store`] and
/// returned by [`PhysicalBackend::fetch`].
pub type BlobStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// What a backend reports after durably storing a blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    /// Number of bytes written.
    pub size: i64,
    /// MD5 checksum (lowercase hex) of the written bytes.
    pub checksum: String,
}

/// Everything a backend needs to produce its own delivery URL.
#[derive(Debug, Clone)]
pub struct UrlRequest<'a> {
    pub bucket: &'a str,
    pub physical_key: &'a str,
    pub file_extension: &'a str,
    pub filename: Option<&'a str>,
    pub base_url: Option<&'a str>,
    pub addon_text: Option<&'a str>,
    pub eternally_valid: bool,
}

/// Stores, retrieves and delivers raw blobs by opaque key.
///
/// Implementations must make a blob visible only once it is completely
/// written, and must treat deleting a missing key as success.
#[async_trait::async_trait]
pub trait PhysicalBackend: Send + Sync {
    /// Name used by bucket definitions to select this backend.
    fn name(&self) -> &str;

    /// Writes `data` under `key`. A supplied checksum is verified against
    /// the streamed bytes.
    async fn store(
        &self,
        bucket: &str,
        key: &str,
        data: BlobStream,
        checksum: Option<&str>,
        size: Option<i64>,
    ) -> StorageResult<StoredBlob>;

    /// Removes the blob. Missing blobs are not an error.
    async fn delete(&self, bucket: &str, key: &str) -> StorageResult<()>;

    /// Opens the blob for reading, `None` if it doesn't exist.
    async fn fetch(&self, bucket: &str, key: &str) -> StorageResult<Option<BlobStream>>;

    /// Builds a cacheable HTTP response streaming the blob.
    async fn deliver(&self, bucket: &str, key: &str, extension: &str) -> StorageResult<Response>;

    /// Lets a backend hand out its own (e.g. presigned) URL instead of the
    /// default hash-authenticated one.
    fn create_url(&self, _request: &UrlRequest<'_>) -> Option<String> {
        None
    }
}

/// All backends known to the process, by name.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn PhysicalBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, backend: Arc<dyn PhysicalBackend>) -> Self {
        self.backends.insert(backend.name().to_string(), backend);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn PhysicalBackend>> {
        self.backends.get(name).cloned()
    }
}

/// Wraps an in-memory buffer as a [`BlobStream`].
pub fn stream_from_bytes(data: Bytes) -> BlobStream {
    Box::pin(stream::once(async move { Ok(data) }))
}

/// An empty [`BlobStream`], used for objects without content.
pub fn empty_stream() -> BlobStream {
    Box::pin(stream::empty())
}

/// Reads a whole [`BlobStream`] into memory.
pub async fn collect_stream(data: BlobStream) -> io::Result<Bytes> {
    let chunks: Vec<Bytes> = data.try_collect().await?;
    let mut buffer = Vec::with_capacity(chunks.iter().map(Bytes::len).sum());
    for chunk in chunks {
        buffer.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(buffer))
}

/// Lowercase hex MD5 of a buffer, the checksum format used throughout.
pub fn checksum_of(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// Guesses the `Content-Type` for a file extension.
pub fn content_type_for(extension: &str) -> String {
    mime_guess::from_ext(extension)
        .first_raw()
        .unwrap_or("application/octet-stream")
        .to_string()
}

/// Maps a stream of arbitrary errors into a [`BlobStream`].
pub fn into_blob_stream<S, E>(data: S) -> BlobStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    Box::pin(data.map(|chunk| chunk.map_err(io::Error::other)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collects_streamed_chunks() {
        let data: BlobStream = Box::pin(stream::iter(vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ]));
        assert_eq!(collect_stream(data).await.unwrap(), Bytes::from_static(b"hello world"));
        assert!(collect_stream(empty_stream()).await.unwrap().is_empty());
    }

    #[test]
    fn guesses_content_types() {
        assert_eq!(content_type_for("png"), "image/png");
        assert_eq!(content_type_for("pdf"), "application/pdf");
        assert_eq!(content_type_for(""), "application/octet-stream");
    }

    #[test]
    fn checksum_is_lower_hex_md5() {
        assert_eq!(checksum_of(b""), "d41d8cd98f00b204e9800998ecf8427e");
    }
}
