//! src/services/storage_service.rs
//!
//! StorageService: the orchestrator between virtual objects (SQLite
//! metadata) and their physical blobs (a pluggable backend per bucket).
//!
//! Every content change allocates a fresh physical key. The new blob is
//! stored first, the metadata is committed second, and only then are the
//! old blob and all derived versions removed. URLs built from a physical key
//! therefore never point to changed content.

use crate::models::{bucket::BucketInfo, object::VirtualObject, version::DerivedVersion};
use crate::services::{
    backend::{
        BackendRegistry, BlobStream, PhysicalBackend, checksum_of, collect_stream, empty_stream,
        stream_from_bytes,
    },
    cache::{ObjectCache, ObjectCacheKey, VersionCache},
    url_signer::UrlSigner,
};
use axum::response::Response;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use sqlx::SqlitePool;
use std::{collections::BTreeMap, io, sync::Arc};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("storage misconfigured: {0}")]
    Configuration(String),
    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, key: String },
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error("path is empty")]
    InvalidPath,
    #[error("path `{path}` already exists in bucket `{bucket}`")]
    PathConflict { bucket: String, path: String },
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("upload failed: {0}")]
    UploadFailed(#[source] io::Error),
    #[error("conversion failed: {0}")]
    Conversion(String),
    #[error("invalid authentication hash")]
    Forbidden,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StorageError {
    /// I/O failures while writing content surface as a failed upload.
    fn into_upload_failure(self) -> Self {
        match self {
            StorageError::Io(err) => StorageError::UploadFailed(err),
            other => other,
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

const BUCKET_NAME_MAX_LEN: usize = 63;

macro_rules! select_objects {
    ($tail:literal) => {
        concat!(
            "SELECT id, tenant_id, bucket, object_key, physical_key, file_size, checksum, ",
            "path, file_extension, reference, temporary, last_modified ",
            "FROM virtual_objects ",
            $tail
        )
    };
}

macro_rules! select_versions {
    ($tail:literal) => {
        concat!(
            "SELECT id, virtual_object_id, bucket, version_key, physical_key, file_size, ",
            "checksum, created_at FROM derived_versions ",
            $tail
        )
    };
}

/// StorageService provides the virtual object operations:
/// - lookups by key (cached) and by normalized path
/// - creation of path-bound and temporary objects
/// - content replacement with store-then-delete ordering
/// - deletion cascading to blobs and derived versions
/// - reference claiming and cascading for reference fields
/// - authenticated delivery of physical blobs
///
/// Cloning is cheap; all clones share the pool, caches and backends.
#[derive(Clone)]
pub struct StorageService {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    buckets: Arc<BTreeMap<String, BucketInfo>>,
    backends: BackendRegistry,
    signer: UrlSigner,
    objects: ObjectCache,
    versions: VersionCache,
}

impl StorageService {
    /// Creates the service for the given buckets.
    ///
    /// Fails fast if a bucket name is malformed or names a backend which
    /// isn't registered.
    pub fn new(
        db: Arc<SqlitePool>,
        buckets: impl IntoIterator<Item = BucketInfo>,
        backends: BackendRegistry,
        signer: UrlSigner,
    ) -> StorageResult<Self> {
        let mut bucket_map = BTreeMap::new();
        for bucket in buckets {
            ensure_bucket_name_safe(&bucket.name)?;
            if backends.get(&bucket.backend).is_none() {
                return Err(StorageError::Configuration(format!(
                    "bucket `{}` uses unknown backend `{}`",
                    bucket.name, bucket.backend
                )));
            }
            bucket_map.insert(bucket.name.clone(), bucket);
        }

        Ok(Self {
            db,
            buckets: Arc::new(bucket_map),
            backends,
            signer,
            objects: ObjectCache::new(),
            versions: VersionCache::new(),
        })
    }

    /// All configured buckets, ordered by name.
    pub fn buckets(&self) -> impl Iterator<Item = &BucketInfo> {
        self.buckets.values()
    }

    pub fn bucket(&self, name: &str) -> Option<&BucketInfo> {
        self.buckets.get(name)
    }

    pub fn signer(&self) -> &UrlSigner {
        &self.signer
    }

    pub(crate) fn version_cache(&self) -> &VersionCache {
        &self.versions
    }

    /// Resolves the backend bound to the bucket.
    pub fn backend_for(&self, bucket: &str) -> StorageResult<Arc<dyn PhysicalBackend>> {
        let info = self
            .bucket(bucket)
            .ok_or_else(|| StorageError::BucketNotFound(bucket.to_string()))?;
        self.backends.get(&info.backend).ok_or_else(|| {
            StorageError::Configuration(format!(
                "no backend `{}` bound for bucket `{bucket}`",
                info.backend
            ))
        })
    }

    /// Finds an object by its globally unique key.
    ///
    /// Cached objects are re-checked against the requested tenant and bucket;
    /// a mismatch is reported as absent. A `None` tenant matches any tenant.
    pub async fn find_by_key(
        &self,
        tenant: Option<&str>,
        bucket: &str,
        key: &str,
    ) -> StorageResult<Option<VirtualObject>> {
        if let Some(cached) = self.objects.get(&ObjectCacheKey::new(bucket, key)) {
            if check_integrity(&cached, tenant, bucket) {
                return Ok(Some(cached));
            }
            debug!(bucket, key, "cached object belongs to another tenant");
            return Ok(None);
        }

        let object = sqlx::query_as::<_, VirtualObject>(select_objects!(
            "WHERE bucket = ? AND object_key = ? AND (? IS NULL OR tenant_id = ?)"
        ))
        .bind(bucket)
        .bind(key)
        .bind(tenant)
        .bind(tenant)
        .fetch_optional(&*self.db)
        .await?;

        if let Some(object) = &object {
            self.objects.put(object);
        }

        Ok(object)
    }

    /// Finds an object by its path; the path is normalized first.
    ///
    /// Only path-bound objects are considered: temporary uploads and objects
    /// owned by a reference field are never found by path.
    pub async fn find_by_path(
        &self,
        tenant: &str,
        bucket: &str,
        path: &str,
    ) -> StorageResult<Option<VirtualObject>> {
        match normalize_path(path) {
            Some(path) => self.find_with_normalized_path(tenant, bucket, &path).await,
            None => Ok(None),
        }
    }

    /// Finds the object with the given path or creates an empty one.
    pub async fn find_or_create_by_path(
        &self,
        tenant: &str,
        bucket: &str,
        path: &str,
    ) -> StorageResult<VirtualObject> {
        self.backend_for(bucket)?;
        let path = normalize_path(path).ok_or(StorageError::InvalidPath)?;

        if let Some(object) = self.find_with_normalized_path(tenant, bucket, &path).await? {
            return Ok(object);
        }

        match self.insert_object(tenant, bucket, None, Some(&path), false).await {
            Err(StorageError::PathConflict { .. }) => {
                // Lost the race against a concurrent creation of the same path.
                debug!(bucket, path = %path, "path created concurrently, reusing object");
                self.find_with_normalized_path(tenant, bucket, &path)
                    .await?
                    .ok_or_else(|| StorageError::PathConflict {
                        bucket: bucket.to_string(),
                        path,
                    })
            }
            other => other,
        }
    }

    async fn find_with_normalized_path(
        &self,
        tenant: &str,
        bucket: &str,
        path: &str,
    ) -> StorageResult<Option<VirtualObject>> {
        Ok(sqlx::query_as::<_, VirtualObject>(select_objects!(
            "WHERE tenant_id = ? AND bucket = ? AND path = ? \
             AND temporary = 0 AND reference IS NULL LIMIT 1"
        ))
        .bind(tenant)
        .bind(bucket)
        .bind(path)
        .fetch_optional(&*self.db)
        .await?)
    }

    /// Creates an object for an upload which isn't claimed by an owner yet.
    ///
    /// The object stays temporary until [`Self::mark_as_used`] is invoked by
    /// the owner's save; unclaimed objects are removed by the retention sweep.
    pub async fn create_temporary(
        &self,
        tenant: &str,
        bucket: &str,
        reference: Option<&str>,
        path: Option<&str>,
    ) -> StorageResult<VirtualObject> {
        self.backend_for(bucket)?;
        let path = path.and_then(normalize_path);
        self.insert_object(tenant, bucket, reference, path.as_deref(), true)
            .await
    }

    /// Lists the path-bound objects of a bucket, newest first.
    ///
    /// Objects owned by a reference field or still temporary are not part of
    /// the bucket's browsable content.
    pub async fn list(
        &self,
        tenant: Option<&str>,
        bucket: &str,
    ) -> StorageResult<Vec<VirtualObject>> {
        Ok(sqlx::query_as::<_, VirtualObject>(select_objects!(
            "WHERE bucket = ? AND temporary = 0 AND reference IS NULL AND path IS NOT NULL \
             AND (? IS NULL OR tenant_id = ?) \
             ORDER BY last_modified DESC, id DESC"
        ))
        .bind(bucket)
        .bind(tenant)
        .bind(tenant)
        .fetch_all(&*self.db)
        .await?)
    }

    async fn insert_object(
        &self,
        tenant: &str,
        bucket: &str,
        reference: Option<&str>,
        path: Option<&str>,
        temporary: bool,
    ) -> StorageResult<VirtualObject> {
        let result = sqlx::query_as::<_, VirtualObject>(
            r#"
            INSERT INTO virtual_objects (
                tenant_id, bucket, object_key, physical_key, file_size, checksum,
                path, file_extension, reference, temporary, last_modified
            ) VALUES (?, ?, ?, NULL, 0, NULL, ?, ?, ?, ?, ?)
            RETURNING id, tenant_id, bucket, object_key, physical_key, file_size, checksum,
                      path, file_extension, reference, temporary, last_modified
            "#,
        )
        .bind(tenant)
        .bind(bucket)
        .bind(generate_key())
        .bind(path)
        .bind(path.and_then(file_extension))
        .bind(reference)
        .bind(temporary)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await;

        match result {
            Ok(object) => {
                debug!(bucket, key = %object.object_key, temporary, "created virtual object");
                Ok(object)
            }
            Err(err) if is_unique_violation(&err) => Err(StorageError::PathConflict {
                bucket: bucket.to_string(),
                path: path.unwrap_or_default().to_string(),
            }),
            Err(err) => Err(StorageError::Sqlx(err)),
        }
    }

    /// Persists the mutable metadata of an object and invalidates its caches.
    async fn save_object(&self, object: &mut VirtualObject) -> StorageResult<()> {
        object.path = object.path.as_deref().and_then(normalize_path);
        object.file_extension = object.path.as_deref().and_then(file_extension);
        object.last_modified = Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE virtual_objects SET
                physical_key = ?, file_size = ?, checksum = ?, path = ?,
                file_extension = ?, reference = ?, temporary = ?, last_modified = ?
            WHERE id = ?
            "#,
        )
        .bind(&object.physical_key)
        .bind(object.file_size)
        .bind(&object.checksum)
        .bind(&object.path)
        .bind(&object.file_extension)
        .bind(&object.reference)
        .bind(object.temporary)
        .bind(object.last_modified)
        .bind(object.id)
        .execute(&*self.db)
        .await;

        self.clear_caches(object);

        match result {
            Ok(done) if done.rows_affected() == 0 => Err(StorageError::ObjectNotFound {
                bucket: object.bucket.clone(),
                key: object.object_key.clone(),
            }),
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(StorageError::PathConflict {
                bucket: object.bucket.clone(),
                path: object.path.clone().unwrap_or_default(),
            }),
            Err(err) => Err(StorageError::Sqlx(err)),
        }
    }

    fn clear_caches(&self, object: &VirtualObject) {
        let key = ObjectCacheKey::of(object);
        self.objects.remove(&key);
        self.versions.remove(&key);
    }

    /// Replaces the content of an object.
    ///
    /// Nothing happens if `checksum` matches the stored checksum. Otherwise the
    /// new blob is stored under a fresh physical key, the metadata committed,
    /// and then all derived versions and the previous blob are removed.
    /// A `filename` replaces the last segment of the object's path.
    pub async fn update_content<S>(
        &self,
        object: &mut VirtualObject,
        data: S,
        filename: Option<&str>,
        checksum: Option<&str>,
        size: Option<i64>,
    ) -> StorageResult<()>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        if checksum.is_some() && checksum == object.checksum.as_deref() {
            debug!(key = %object.object_key, "content unchanged, skipping update");
            return Ok(());
        }

        let bucket = object.bucket.clone();
        let backend = self.backend_for(&bucket)?;
        let new_key = generate_key();
        let stored = backend
            .store(&bucket, &new_key, Box::pin(data) as BlobStream, checksum, size)
            .await
            .map_err(StorageError::into_upload_failure)?;

        if object.physical_key.is_some()
            && object.checksum.as_deref() == Some(stored.checksum.as_str())
        {
            debug!(key = %object.object_key, "uploaded content is identical, discarding new blob");
            self.delete_physical(&bucket, &new_key).await;
            return Ok(());
        }

        let previous = object.clone();
        object.physical_key = Some(new_key.clone());
        object.file_size = stored.size;
        object.checksum = Some(stored.checksum);
        if let Some(filename) = filename {
            object.path = Some(replace_filename(object.path.as_deref(), filename));
        }

        if let Err(err) = self.save_object(object).await {
            self.delete_physical(&bucket, &new_key).await;
            *object = previous;
            return Err(err);
        }

        self.delete_versions(object).await?;
        if let Some(old_key) = previous.physical_key {
            self.delete_physical(&bucket, &old_key).await;
        }

        info!(
            bucket = %bucket,
            key = %object.object_key,
            physical_key = %new_key,
            size = object.file_size,
            "updated object content"
        );
        Ok(())
    }

    /// Replaces the content from an in-memory buffer.
    pub async fn update_content_bytes(
        &self,
        object: &mut VirtualObject,
        data: Bytes,
        filename: Option<&str>,
    ) -> StorageResult<()> {
        let checksum = checksum_of(&data);
        let size = data.len() as i64;
        self.update_content(object, stream_from_bytes(data), filename, Some(&checksum), Some(size))
            .await
    }

    /// Streams the current content; an object without content yields an empty stream.
    pub async fn get_data(&self, object: &VirtualObject) -> StorageResult<BlobStream> {
        let Some(physical_key) = object.physical_key.as_deref() else {
            return Ok(empty_stream());
        };

        let data = self
            .backend_for(&object.bucket)?
            .fetch(&object.bucket, physical_key)
            .await?;
        Ok(data.unwrap_or_else(|| {
            warn!(bucket = %object.bucket, physical_key, "physical blob is missing");
            empty_stream()
        }))
    }

    /// Reads the current content into memory.
    pub async fn read_bytes(&self, object: &VirtualObject) -> StorageResult<Bytes> {
        Ok(collect_stream(self.get_data(object).await?).await?)
    }

    /// Deletes the object, its blob and all derived versions.
    pub async fn delete(&self, object: &VirtualObject) -> StorageResult<()> {
        self.delete_versions(object).await?;

        sqlx::query("DELETE FROM virtual_objects WHERE id = ?")
            .bind(object.id)
            .execute(&*self.db)
            .await?;
        self.clear_caches(object);

        if let Some(physical_key) = object.physical_key.as_deref() {
            self.delete_physical(&object.bucket, physical_key).await;
        }

        debug!(bucket = %object.bucket, key = %object.object_key, "deleted virtual object");
        Ok(())
    }

    /// Deletes every object carrying `reference`, except `excluded_key`.
    ///
    /// Returns the number of deleted objects.
    pub async fn delete_referenced(
        &self,
        reference: &str,
        excluded_key: Option<&str>,
    ) -> StorageResult<usize> {
        if reference.is_empty() {
            return Ok(0);
        }

        let objects = sqlx::query_as::<_, VirtualObject>(select_objects!(
            "WHERE reference = ? AND (? IS NULL OR object_key <> ?)"
        ))
        .bind(reference)
        .bind(excluded_key)
        .bind(excluded_key)
        .fetch_all(&*self.db)
        .await?;

        for object in &objects {
            self.delete(object).await?;
        }

        if !objects.is_empty() {
            debug!(reference, count = objects.len(), "deleted referenced objects");
        }
        Ok(objects.len())
    }

    /// Makes a temporary object permanent and binds it to `reference`.
    ///
    /// Only rows still flagged temporary are touched, so repeated calls are
    /// harmless and shared (non-temporary) objects are never claimed.
    pub async fn mark_as_used(&self, reference: &str, object_key: &str) -> StorageResult<bool> {
        let result = sqlx::query(
            "UPDATE virtual_objects SET reference = ?, temporary = 0, last_modified = ? \
             WHERE object_key = ? AND temporary = 1",
        )
        .bind(reference)
        .bind(Utc::now())
        .bind(object_key)
        .execute(&*self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delivers a blob addressed by a default delivery URL.
    ///
    /// `physical_file` is `[addon--]physical_key.extension`; the hash must
    /// authenticate the physical key.
    pub async fn deliver_physical(
        &self,
        bucket: &str,
        auth_hash: &str,
        physical_file: &str,
    ) -> StorageResult<Response> {
        let (physical_key, extension) = split_physical_file(physical_file);
        if !self.signer.verify_hash(physical_key, auth_hash) {
            return Err(StorageError::Forbidden);
        }

        self.backend_for(bucket)?
            .deliver(bucket, physical_key, extension)
            .await
    }

    /// Removes a blob, logging instead of failing.
    pub(crate) async fn delete_physical(&self, bucket: &str, physical_key: &str) {
        let result = match self.backend_for(bucket) {
            Ok(backend) => backend.delete(bucket, physical_key).await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            warn!(bucket, physical_key, error = %err, "failed to delete physical blob");
        }
    }

    /// Deletes all derived versions of an object together with their blobs.
    pub(crate) async fn delete_versions(&self, object: &VirtualObject) -> StorageResult<()> {
        let versions = sqlx::query_as::<_, DerivedVersion>(select_versions!(
            "WHERE virtual_object_id = ?"
        ))
        .bind(object.id)
        .fetch_all(&*self.db)
        .await?;

        sqlx::query("DELETE FROM derived_versions WHERE virtual_object_id = ?")
            .bind(object.id)
            .execute(&*self.db)
            .await?;
        self.versions.remove(&ObjectCacheKey::of(object));

        for version in &versions {
            if let Some(physical_key) = version.physical_key.as_deref() {
                self.delete_physical(&version.bucket, physical_key).await;
            }
        }
        Ok(())
    }

    pub(crate) async fn find_version(
        &self,
        object_id: i64,
        version_key: &str,
    ) -> StorageResult<Option<DerivedVersion>> {
        Ok(sqlx::query_as::<_, DerivedVersion>(select_versions!(
            "WHERE virtual_object_id = ? AND version_key = ?"
        ))
        .bind(object_id)
        .bind(version_key)
        .fetch_optional(&*self.db)
        .await?)
    }

    /// Inserts the placeholder row for a version.
    ///
    /// Returns `None` if a row for this version already exists, i.e. another
    /// request already owns the computation.
    pub(crate) async fn insert_placeholder(
        &self,
        object: &VirtualObject,
        version_key: &str,
    ) -> StorageResult<Option<DerivedVersion>> {
        Ok(sqlx::query_as::<_, DerivedVersion>(
            r#"
            INSERT INTO derived_versions (
                virtual_object_id, bucket, version_key, physical_key, file_size, checksum, created_at
            ) VALUES (?, ?, ?, NULL, 0, NULL, ?)
            ON CONFLICT (virtual_object_id, version_key) DO NOTHING
            RETURNING id, virtual_object_id, bucket, version_key, physical_key, file_size,
                      checksum, created_at
            "#,
        )
        .bind(object.id)
        .bind(&object.bucket)
        .bind(version_key)
        .bind(Utc::now())
        .fetch_optional(&*self.db)
        .await?)
    }

    /// Fills a placeholder with its computed blob.
    ///
    /// Returns `false` if the placeholder vanished in the meantime (the
    /// object's content changed or it was deleted).
    pub(crate) async fn complete_version(
        &self,
        version_id: i64,
        physical_key: &str,
        size: i64,
        checksum: &str,
    ) -> StorageResult<bool> {
        let result = sqlx::query(
            "UPDATE derived_versions SET physical_key = ?, file_size = ?, checksum = ? \
             WHERE id = ? AND physical_key IS NULL",
        )
        .bind(physical_key)
        .bind(size)
        .bind(checksum)
        .bind(version_id)
        .execute(&*self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub(crate) async fn delete_version_row(&self, version: &DerivedVersion) -> StorageResult<()> {
        sqlx::query("DELETE FROM derived_versions WHERE id = ?")
            .bind(version.id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// Temporary objects not touched since `older_than`.
    pub(crate) async fn find_stale_temporary(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> StorageResult<Vec<VirtualObject>> {
        Ok(sqlx::query_as::<_, VirtualObject>(select_objects!(
            "WHERE temporary = 1 AND last_modified < ? ORDER BY last_modified ASC LIMIT ?"
        ))
        .bind(older_than)
        .bind(limit)
        .fetch_all(&*self.db)
        .await?)
    }

    /// Permanent objects of a bucket not touched since `older_than`.
    pub(crate) async fn find_expired(
        &self,
        bucket: &str,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> StorageResult<Vec<VirtualObject>> {
        Ok(sqlx::query_as::<_, VirtualObject>(select_objects!(
            "WHERE bucket = ? AND temporary = 0 AND last_modified < ? \
             ORDER BY last_modified ASC LIMIT ?"
        ))
        .bind(bucket)
        .bind(older_than)
        .bind(limit)
        .fetch_all(&*self.db)
        .await?)
    }

    /// Removes placeholders whose computation never finished.
    pub(crate) async fn delete_stale_placeholders(
        &self,
        older_than: DateTime<Utc>,
    ) -> StorageResult<u64> {
        let result = sqlx::query(
            "DELETE FROM derived_versions WHERE physical_key IS NULL AND created_at < ?",
        )
        .bind(older_than)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Generates a fresh, never reused key for objects and blobs.
pub fn generate_key() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Normalizes a virtual path: trims, turns `\` into `/`, collapses repeated
/// slashes, lowercases and ensures a single leading slash.
///
/// Returns `None` if nothing is left.
pub fn normalize_path(path: &str) -> Option<String> {
    let unified = path.trim().replace('\\', "/").to_lowercase();
    let segments: Vec<&str> = unified.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return None;
    }

    let mut normalized = format!("/{}", segments.join("/"));
    if unified.ends_with('/') {
        normalized.push('/');
    }
    Some(normalized)
}

/// Extension of the last path segment, lowercased.
pub fn file_extension(path: &str) -> Option<String> {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.rsplit_once('.')
        .map(|(_, ext)| ext.trim().to_lowercase())
        .filter(|ext| !ext.is_empty())
}

/// Keeps the directory of `path` and swaps in the last segment of `filename`.
fn replace_filename(path: Option<&str>, filename: &str) -> String {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename).trim();
    match path.and_then(|p| p.rsplit_once('/')) {
        Some((dir, _)) => format!("{dir}/{name}"),
        None => format!("/{name}"),
    }
}

/// Splits `[addon--]key.ext` into key and extension.
pub fn split_physical_file(physical_file: &str) -> (&str, &str) {
    let effective = physical_file
        .rsplit_once("--")
        .map(|(_, key)| key)
        .unwrap_or(physical_file);
    effective.rsplit_once('.').unwrap_or((effective, ""))
}

fn check_integrity(object: &VirtualObject, tenant: Option<&str>, bucket: &str) -> bool {
    tenant.is_none_or(|tenant| object.tenant_id == tenant) && object.bucket == bucket
}

/// Validate a configured bucket name.
///
/// Bucket names end up in URLs and directory names, so only lowercase
/// letters, digits, dots, hyphens and underscores are accepted.
fn ensure_bucket_name_safe(name: &str) -> StorageResult<()> {
    if name.is_empty() || name.len() > BUCKET_NAME_MAX_LEN {
        return Err(StorageError::InvalidBucketName {
            name: name.to_string(),
            reason: "must be between 1 and 63 characters".into(),
        });
    }

    if !name
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-' | '_'))
    {
        return Err(StorageError::InvalidBucketName {
            name: name.to_string(),
            reason: "allowed characters are lowercase letters, digits, dots, hyphens and underscores"
                .into(),
        });
    }

    if name.starts_with('.') || name.contains("..") {
        return Err(StorageError::InvalidBucketName {
            name: name.to_string(),
            reason: "cannot start with a dot or contain consecutive dots".into(),
        });
    }

    Ok(())
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::{TestContext, backdate};

    #[test]
    fn normalizes_paths() {
        assert_eq!(normalize_path("/a/b.png").as_deref(), Some("/a/b.png"));
        assert_eq!(normalize_path("a\\b.png ").as_deref(), Some("/a/b.png"));
        assert_eq!(normalize_path("  //A//B.PNG").as_deref(), Some("/a/b.png"));
        assert_eq!(normalize_path("docs/").as_deref(), Some("/docs/"));
        assert_eq!(normalize_path("   "), None);
        assert_eq!(normalize_path("///"), None);
    }

    #[test]
    fn extracts_extensions() {
        assert_eq!(file_extension("/a/b.PNG").as_deref(), Some("png"));
        assert_eq!(file_extension("/a.dir/readme"), None);
        assert_eq!(file_extension("/a/b."), None);
    }

    #[test]
    fn replaces_filenames_within_directory() {
        assert_eq!(replace_filename(Some("/a/b.png"), "c.jpg"), "/a/c.jpg");
        assert_eq!(replace_filename(None, "C:\\tmp\\x.pdf"), "/x.pdf");
        assert_eq!(replace_filename(Some("/b.png"), "c.jpg"), "/c.jpg");
    }

    #[test]
    fn splits_physical_file_names() {
        assert_eq!(split_physical_file("abc.png"), ("abc", "png"));
        assert_eq!(split_physical_file("my-text--abc.png"), ("abc", "png"));
        assert_eq!(split_physical_file("abc"), ("abc", ""));
    }

    #[test]
    fn validates_bucket_names() {
        assert!(ensure_bucket_name_safe("products").is_ok());
        assert!(ensure_bucket_name_safe("work_files-2").is_ok());
        assert!(ensure_bucket_name_safe("").is_err());
        assert!(ensure_bucket_name_safe("Products").is_err());
        assert!(ensure_bucket_name_safe("../etc").is_err());
    }

    #[tokio::test]
    async fn unknown_backend_fails_fast() {
        let ctx = TestContext::new().await;
        let result = StorageService::new(
            ctx.storage.db.clone(),
            vec![BucketInfo::new("products").with_backend("s3")],
            BackendRegistry::new(),
            ctx.storage.signer().clone(),
        );
        assert!(matches!(result, Err(StorageError::Configuration(_))));
    }

    #[tokio::test]
    async fn find_or_create_by_path_is_stable() {
        let ctx = TestContext::new().await;
        let first = ctx
            .storage
            .find_or_create_by_path("t1", "products", "/a/b.png")
            .await
            .unwrap();
        let second = ctx
            .storage
            .find_or_create_by_path("t1", "products", "a\\b.png ")
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.path.as_deref(), Some("/a/b.png"));
        assert_eq!(first.file_extension.as_deref(), Some("png"));
        assert!(!first.temporary);

        let other_tenant = ctx
            .storage
            .find_or_create_by_path("t2", "products", "/a/b.png")
            .await
            .unwrap();
        assert_ne!(first.id, other_tenant.id);
    }

    #[tokio::test]
    async fn concurrent_creation_of_a_path_yields_one_object() {
        let ctx = TestContext::new().await;
        let (a, b) = tokio::join!(
            ctx.storage.find_or_create_by_path("t1", "products", "/race.png"),
            ctx.storage.find_or_create_by_path("t1", "products", "/race.png"),
        );

        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.id, b.id);
        assert_eq!(a.object_key, b.object_key);
    }

    #[tokio::test]
    async fn failed_write_keeps_previous_content() {
        let ctx = TestContext::new().await;
        let mut object = ctx.object_with_content("/a/doc.txt", b"first").await;
        let before = object.clone();

        let broken = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::other("connection reset")),
        ]);
        let result = ctx
            .storage
            .update_content(&mut object, broken, None, None, None)
            .await;

        assert!(matches!(result, Err(StorageError::UploadFailed(_))));
        assert_eq!(object, before);
        let reloaded = ctx
            .storage
            .find_by_key(None, "products", &object.object_key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.physical_key, before.physical_key);
        assert_eq!(reloaded.checksum, before.checksum);
        assert_eq!(ctx.storage.read_bytes(&object).await.unwrap(), Bytes::from_static(b"first"));
    }

    #[tokio::test]
    async fn find_by_path_treats_empty_path_as_absent() {
        let ctx = TestContext::new().await;
        assert!(ctx.storage.find_by_path("t1", "products", " / ").await.unwrap().is_none());
        assert!(matches!(
            ctx.storage.find_or_create_by_path("t1", "products", "  ").await,
            Err(StorageError::InvalidPath)
        ));
    }

    #[tokio::test]
    async fn unknown_bucket_is_rejected() {
        let ctx = TestContext::new().await;
        assert!(matches!(
            ctx.storage.find_or_create_by_path("t1", "nope", "/a.png").await,
            Err(StorageError::BucketNotFound(_))
        ));
    }

    #[tokio::test]
    async fn update_content_replaces_blob() {
        let ctx = TestContext::new().await;
        let mut object = ctx.object_with_content("/a/doc.txt", b"first").await;
        let old_key = object.physical_key.clone().unwrap();

        ctx.storage
            .update_content_bytes(&mut object, Bytes::from_static(b"second"), None)
            .await
            .unwrap();

        let new_key = object.physical_key.clone().unwrap();
        assert_ne!(old_key, new_key);
        assert_eq!(object.file_size, 6);
        assert_eq!(object.checksum.as_deref(), Some(checksum_of(b"second").as_str()));
        assert_eq!(ctx.storage.read_bytes(&object).await.unwrap(), Bytes::from_static(b"second"));
        assert!(ctx.fetch_blob("products", &old_key).await.is_none());

        let reloaded = ctx
            .storage
            .find_by_key(Some("t1"), "products", &object.object_key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.physical_key.as_deref(), Some(new_key.as_str()));
    }

    #[tokio::test]
    async fn identical_content_is_a_no_op() {
        let ctx = TestContext::new().await;
        let mut object = ctx.object_with_content("/a/doc.txt", b"same").await;
        let key = object.physical_key.clone();
        ctx.insert_version_row(&object, "size:10x10", Some("v1")).await;

        ctx.storage
            .update_content_bytes(&mut object, Bytes::from_static(b"same"), None)
            .await
            .unwrap();

        assert_eq!(object.physical_key, key);
        assert!(
            ctx.storage
                .find_version(object.id, "size:10x10")
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn content_change_invalidates_versions() {
        let ctx = TestContext::new().await;
        let mut object = ctx.object_with_content("/a/pic.png", b"one").await;
        ctx.store_blob("products", "v1", b"version").await;
        ctx.insert_version_row(&object, "size:10x10", Some("v1")).await;

        ctx.storage
            .update_content_bytes(&mut object, Bytes::from_static(b"two"), None)
            .await
            .unwrap();

        assert!(
            ctx.storage
                .find_version(object.id, "size:10x10")
                .await
                .unwrap()
                .is_none()
        );
        assert!(ctx.fetch_blob("products", "v1").await.is_none());
    }

    #[tokio::test]
    async fn filename_renames_within_directory() {
        let ctx = TestContext::new().await;
        let mut object = ctx.object_with_content("/docs/a.txt", b"x").await;
        ctx.storage
            .update_content_bytes(&mut object, Bytes::from_static(b"y"), Some("Report.PDF"))
            .await
            .unwrap();

        assert_eq!(object.path.as_deref(), Some("/docs/report.pdf"));
        assert_eq!(object.file_extension.as_deref(), Some("pdf"));
    }

    #[tokio::test]
    async fn path_conflict_is_reported() {
        let ctx = TestContext::new().await;
        ctx.object_with_content("/docs/a.txt", b"x").await;
        let mut other = ctx.object_with_content("/docs/b.txt", b"y").await;

        let result = ctx
            .storage
            .update_content_bytes(&mut other, Bytes::from_static(b"z"), Some("a.txt"))
            .await;
        assert!(matches!(result, Err(StorageError::PathConflict { .. })));
        assert_eq!(other.path.as_deref(), Some("/docs/b.txt"));
        assert_eq!(ctx.storage.read_bytes(&other).await.unwrap(), Bytes::from_static(b"y"));
    }

    #[tokio::test]
    async fn temporary_objects_may_share_paths() {
        let ctx = TestContext::new().await;
        ctx.object_with_content("/a.png", b"x").await;
        let first = ctx
            .storage
            .create_temporary("t1", "products", None, Some("a.png"))
            .await
            .unwrap();
        let second = ctx
            .storage
            .create_temporary("t1", "products", None, Some("a.png"))
            .await
            .unwrap();

        assert!(first.temporary && second.temporary);
        assert_ne!(first.object_key, second.object_key);
        assert_eq!(first.path.as_deref(), Some("/a.png"));
    }

    #[tokio::test]
    async fn find_by_key_checks_cached_tenant() {
        let ctx = TestContext::new().await;
        let object = ctx.object_with_content("/a.txt", b"x").await;

        // Populates the cache.
        assert!(
            ctx.storage
                .find_by_key(Some("t1"), "products", &object.object_key)
                .await
                .unwrap()
                .is_some()
        );
        assert!(
            ctx.storage
                .find_by_key(Some("t2"), "products", &object.object_key)
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            ctx.storage
                .find_by_key(None, "products", &object.object_key)
                .await
                .unwrap()
                .is_some()
        );
        assert!(
            ctx.storage
                .find_by_key(Some("t1"), "archive", &object.object_key)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn temporary_objects_are_not_cached() {
        let ctx = TestContext::new().await;
        let object = ctx
            .storage
            .create_temporary("t1", "products", None, Some("a.png"))
            .await
            .unwrap();

        ctx.storage
            .find_by_key(Some("t1"), "products", &object.object_key)
            .await
            .unwrap()
            .unwrap();
        assert!(
            ctx.storage
                .objects
                .get(&ObjectCacheKey::of(&object))
                .is_none()
        );
    }

    #[tokio::test]
    async fn delete_removes_blob_and_versions() {
        let ctx = TestContext::new().await;
        let object = ctx.object_with_content("/a/pic.png", b"one").await;
        ctx.store_blob("products", "v1", b"version").await;
        ctx.insert_version_row(&object, "size:10x10", Some("v1")).await;
        let physical_key = object.physical_key.clone().unwrap();

        ctx.storage.delete(&object).await.unwrap();

        assert!(
            ctx.storage
                .find_by_key(None, "products", &object.object_key)
                .await
                .unwrap()
                .is_none()
        );
        assert!(ctx.fetch_blob("products", &physical_key).await.is_none());
        assert!(ctx.fetch_blob("products", "v1").await.is_none());
        assert!(ctx.storage.find_version(object.id, "size:10x10").await.unwrap().is_none());

        // The blob is gone already, deleting again must still succeed.
        ctx.storage.delete(&object).await.unwrap();
    }

    #[tokio::test]
    async fn mark_as_used_only_claims_temporary_rows() {
        let ctx = TestContext::new().await;
        let upload = ctx
            .storage
            .create_temporary("t1", "products", None, Some("a.png"))
            .await
            .unwrap();
        let shared = ctx.object_with_content("/shared.png", b"x").await;

        assert!(ctx.storage.mark_as_used("logo:7", &upload.object_key).await.unwrap());
        assert!(!ctx.storage.mark_as_used("logo:7", &upload.object_key).await.unwrap());
        assert!(!ctx.storage.mark_as_used("logo:7", &shared.object_key).await.unwrap());

        let claimed = ctx
            .storage
            .find_by_key(None, "products", &upload.object_key)
            .await
            .unwrap()
            .unwrap();
        assert!(!claimed.temporary);
        assert_eq!(claimed.reference.as_deref(), Some("logo:7"));

        let untouched = ctx
            .storage
            .find_by_key(None, "products", &shared.object_key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(untouched.reference, None);
    }

    #[tokio::test]
    async fn delete_referenced_spares_excluded_object() {
        let ctx = TestContext::new().await;
        let old = ctx
            .storage
            .create_temporary("t1", "products", Some("logo:7"), Some("old.png"))
            .await
            .unwrap();
        let new = ctx
            .storage
            .create_temporary("t1", "products", Some("logo:7"), Some("new.png"))
            .await
            .unwrap();
        let unrelated = ctx
            .storage
            .create_temporary("t1", "products", Some("logo:8"), Some("x.png"))
            .await
            .unwrap();

        let deleted = ctx
            .storage
            .delete_referenced("logo:7", Some(&new.object_key))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        let old = ctx.storage.find_by_key(None, "products", &old.object_key).await;
        assert!(old.unwrap().is_none());
        let new = ctx.storage.find_by_key(None, "products", &new.object_key).await;
        assert!(new.unwrap().is_some());
        assert!(
            ctx.storage
                .find_by_key(None, "products", &unrelated.object_key)
                .await
                .unwrap()
                .is_some()
        );
        assert_eq!(ctx.storage.delete_referenced("", None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn list_returns_newest_first() {
        let ctx = TestContext::new().await;
        let older = ctx.object_with_content("/old.txt", b"x").await;
        backdate(&ctx.storage, older.id, Utc::now() - chrono::TimeDelta::hours(2)).await;
        let newer = ctx.object_with_content("/new.txt", b"y").await;
        ctx.storage
            .create_temporary("t1", "products", None, Some("tmp.txt"))
            .await
            .unwrap();
        let logo = ctx
            .storage
            .create_temporary("t1", "products", None, Some("logo.png"))
            .await
            .unwrap();
        assert!(ctx.storage.mark_as_used("logo:product-7", &logo.object_key).await.unwrap());

        let listed = ctx.storage.list(Some("t1"), "products").await.unwrap();
        let keys: Vec<_> = listed.iter().map(|o| o.object_key.as_str()).collect();
        assert_eq!(keys, vec![newer.object_key.as_str(), older.object_key.as_str()]);
    }

    #[tokio::test]
    async fn deliver_physical_checks_hash() {
        let ctx = TestContext::new().await;
        let object = ctx.object_with_content("/a.txt", b"payload").await;
        let key = object.physical_key.clone().unwrap();
        let hash = ctx.storage.signer().compute_hash(&key, 0);

        let response = ctx
            .storage
            .deliver_physical("products", &hash, &format!("some-text--{key}.txt"))
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);

        assert!(matches!(
            ctx.storage
                .deliver_physical("products", "bogus", &format!("{key}.txt"))
                .await,
            Err(StorageError::Forbidden)
        ));
    }
}
