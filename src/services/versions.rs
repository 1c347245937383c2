//! src/services/versions.rs
//!
//! Resolves derived versions of images and computes missing ones in the
//! background.
//!
//! The placeholder row inserted for a missing version acts as the
//! single-flight marker: whoever inserts it owns the computation, everyone
//! else serves the original until the row carries a physical key.

use crate::models::{object::VirtualObject, version::DerivedVersion};
use crate::services::{
    backend::{checksum_of, stream_from_bytes},
    cache::ObjectCacheKey,
    converter::{ImageConverter, VersionSpec},
    download::DownloadBuilder,
    storage_service::{StorageResult, StorageService, generate_key},
};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, mpsc::error::TrySendError};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolConfig {
    /// Number of concurrent conversions.
    pub workers: usize,
    /// Pending conversions accepted before new requests are dropped.
    pub queue_capacity: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 64,
        }
    }
}

struct VersionJob {
    object: VirtualObject,
    version: DerivedVersion,
    spec: VersionSpec,
}

/// Entry point for version resolution and download URLs.
///
/// Must be created inside a tokio runtime, as it spawns its worker pool.
#[derive(Clone)]
pub struct VersionManager {
    storage: StorageService,
    jobs: mpsc::Sender<VersionJob>,
}

impl VersionManager {
    pub fn new(
        storage: StorageService,
        converter: Arc<dyn ImageConverter>,
        pool: WorkerPoolConfig,
    ) -> Self {
        let (jobs, receiver) = mpsc::channel(pool.queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        for worker in 0..pool.workers {
            let storage = storage.clone();
            let converter = converter.clone();
            let receiver = receiver.clone();
            tokio::spawn(async move {
                loop {
                    let job = receiver.lock().await.recv().await;
                    let Some(job) = job else { break };
                    compute_version(&storage, converter.as_ref(), job).await;
                }
                debug!(worker, "version worker stopped");
            });
        }

        info!(
            workers = pool.workers,
            queue_capacity = pool.queue_capacity,
            converter = converter.name(),
            "started version workers"
        );
        Self { storage, jobs }
    }

    pub fn storage(&self) -> &StorageService {
        &self.storage
    }

    /// Looks up an object by bucket and key, regardless of tenant.
    pub async fn fetch_physical_object(
        &self,
        bucket: &str,
        object_key: &str,
    ) -> StorageResult<Option<VirtualObject>> {
        self.storage.find_by_key(None, bucket, object_key).await
    }

    /// Starts a download URL for the object with the given key.
    pub fn prepare_download(&self, bucket: &str, object_key: &str) -> DownloadBuilder<'_> {
        DownloadBuilder::for_key(self, bucket, object_key)
    }

    /// Starts a download URL for an already loaded object.
    pub fn prepare_object_download(&self, object: &VirtualObject) -> DownloadBuilder<'_> {
        DownloadBuilder::for_object(self, object.clone())
    }

    /// Returns the physical key of the requested version, if it is computed.
    ///
    /// A missing version of an image is scheduled for computation and
    /// `None` is returned meanwhile, so callers serve the original.
    pub async fn fetch_version(
        &self,
        object: &VirtualObject,
        spec: &str,
    ) -> StorageResult<Option<String>> {
        let cache_key = ObjectCacheKey::of(object);
        if let Some(physical_key) = self.storage.version_cache().get(&cache_key, spec) {
            return Ok(Some(physical_key));
        }

        if !object.is_image() || object.physical_key.is_none() {
            return Ok(None);
        }

        let parsed = match spec.parse::<VersionSpec>() {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(
                    key = %object.object_key,
                    spec,
                    error = %err,
                    "ignoring invalid version spec"
                );
                return Ok(None);
            }
        };

        if let Some(version) = self.storage.find_version(object.id, spec).await? {
            return Ok(version.physical_key.inspect(|physical_key| {
                self.storage.version_cache().put(&cache_key, spec, physical_key);
            }));
        }

        let Some(version) = self.storage.insert_placeholder(object, spec).await? else {
            debug!(key = %object.object_key, spec, "version is already being computed");
            return Ok(None);
        };

        let job = VersionJob {
            object: object.clone(),
            version,
            spec: parsed,
        };
        match self.jobs.try_send(job) {
            Ok(()) => debug!(key = %object.object_key, spec, "scheduled version computation"),
            Err(TrySendError::Full(job) | TrySendError::Closed(job)) => {
                warn!(key = %object.object_key, spec, "version queue overloaded, dropping request");
                self.storage.delete_version_row(&job.version).await?;
            }
        }
        Ok(None)
    }
}

async fn compute_version(
    storage: &StorageService,
    converter: &dyn ImageConverter,
    job: VersionJob,
) {
    if let Err(err) = try_compute_version(storage, converter, &job).await {
        warn!(
            key = %job.object.object_key,
            path = job.object.path.as_deref().unwrap_or_default(),
            spec = %job.version.version_key,
            error = %err,
            "failed to compute version"
        );
        discard_placeholder(storage, &job.version).await;
    }
}

async fn try_compute_version(
    storage: &StorageService,
    converter: &dyn ImageConverter,
    job: &VersionJob,
) -> StorageResult<()> {
    let object = &job.object;
    let source = storage.read_bytes(object).await?;
    let extension = object.file_extension.as_deref().unwrap_or_default();
    let output = converter.convert(source, extension, &job.spec).await?;

    if output.is_empty() {
        warn!(
            key = %object.object_key,
            spec = %job.version.version_key,
            "conversion resulted in an empty file"
        );
        discard_placeholder(storage, &job.version).await;
        return Ok(());
    }

    let physical_key = generate_key();
    let checksum = checksum_of(&output);
    let size = output.len() as i64;
    storage
        .backend_for(&object.bucket)?
        .store(
            &object.bucket,
            &physical_key,
            stream_from_bytes(Bytes::from(output)),
            Some(&checksum),
            Some(size),
        )
        .await?;

    if storage
        .complete_version(job.version.id, &physical_key, size, &checksum)
        .await?
    {
        debug!(
            key = %object.object_key,
            spec = %job.version.version_key,
            %physical_key,
            "computed version"
        );
    } else {
        debug!(key = %object.object_key, "object changed during conversion, discarding version");
        storage.delete_physical(&object.bucket, &physical_key).await;
    }
    Ok(())
}

async fn discard_placeholder(storage: &StorageService, version: &DerivedVersion) {
    if let Err(err) = storage.delete_version_row(version).await {
        warn!(version = version.id, error = %err, "failed to remove version placeholder");
    }
}
