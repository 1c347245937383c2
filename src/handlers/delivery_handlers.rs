//! Delivery of physical blobs via hash-authenticated URLs.

use crate::{errors::AppError, services::storage_service::StorageService};
use axum::{
    extract::{Path, State},
    response::Response,
};

/// `GET /storage/physical/{bucket}/{hash}/{file}`
///
/// `file` is `[addon--]physical_key.extension`. Responds 403 on a bad hash
/// and 404 if the blob doesn't exist.
pub async fn deliver_physical(
    State(storage): State<StorageService>,
    Path((bucket, hash, file)): Path<(String, String, String)>,
) -> Result<Response, AppError> {
    Ok(storage.deliver_physical(&bucket, &hash, &file).await?)
}
