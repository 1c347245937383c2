//! HTTP handlers for path-bound objects and delivery URLs.
//! Streams request bodies to the backend without buffering and delegates
//! storage concerns to `StorageService`.

use crate::{
    errors::AppError,
    models::object::VirtualObject,
    services::backend::into_blob_stream,
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};

const TENANT_HEADER: &str = "x-tenant-id";
/// Comma separated permissions granted to the caller.
const PERMISSIONS_HEADER: &str = "x-permissions";

/// Query params accepted by the URL endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct UrlQuery {
    /// Version spec, e.g. `size:200x200,imageFormat:png`.
    pub version: Option<String>,
    /// Filename offered to the browser when saving.
    pub download: Option<String>,
    /// Free text prepended to the file name.
    pub addon: Option<String>,
    #[serde(default)]
    pub eternal: bool,
}

#[derive(Debug, Serialize)]
pub struct UrlResponse {
    pub url: String,
}

fn tenant(headers: &HeaderMap) -> Result<String, AppError> {
    headers
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::bad_request(format!("missing `{TENANT_HEADER}` header")))
}

/// Rejects callers lacking the permission the bucket is guarded by.
fn ensure_accessible(state: &AppState, bucket: &str, headers: &HeaderMap) -> Result<(), AppError> {
    let info = state
        .storage
        .bucket(bucket)
        .ok_or_else(|| AppError::not_found(format!("bucket `{bucket}` not found")))?;
    let granted = headers
        .get(PERMISSIONS_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .split(',')
        .map(str::trim);

    if info.is_accessible(granted) {
        Ok(())
    } else {
        Err(AppError::forbidden(format!("no access to bucket `{bucket}`")))
    }
}

/// `PUT /storage/objects/{bucket}/{*path}`: create or replace the object at `path`.
///
/// An object created by this request is removed again if the upload fails.
pub async fn upload_object(
    State(state): State<AppState>,
    Path((bucket, path)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<VirtualObject>, AppError> {
    let tenant = tenant(&headers)?;
    ensure_accessible(&state, &bucket, &headers)?;
    let size = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok());

    let existing = state.storage.find_by_path(&tenant, &bucket, &path).await?;
    let created = existing.is_none();
    let mut object = match existing {
        Some(object) => object,
        None => {
            state
                .storage
                .find_or_create_by_path(&tenant, &bucket, &path)
                .await?
        }
    };

    let data = into_blob_stream(body.into_data_stream());
    if let Err(err) = state
        .storage
        .update_content(&mut object, data, None, None, size)
        .await
    {
        if created && object.physical_key.is_none() {
            if let Err(cleanup) = state.storage.delete(&object).await {
                tracing::warn!(
                    key = %object.object_key,
                    error = %cleanup,
                    "failed to remove object of failed upload"
                );
            }
        }
        return Err(err.into());
    }

    Ok(Json(object))
}

/// `DELETE /storage/objects/{bucket}/{*path}`
pub async fn delete_object(
    State(state): State<AppState>,
    Path((bucket, path)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    let tenant = tenant(&headers)?;
    ensure_accessible(&state, &bucket, &headers)?;
    let object = state
        .storage
        .find_by_path(&tenant, &bucket, &path)
        .await?
        .ok_or_else(|| AppError::not_found(format!("no object at `{path}` in `{bucket}`")))?;

    state.storage.delete(&object).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /storage/objects/{bucket}`: the tenant's objects, newest first.
pub async fn list_objects(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Vec<VirtualObject>>, AppError> {
    let tenant = tenant(&headers)?;
    ensure_accessible(&state, &bucket, &headers)?;
    Ok(Json(state.storage.list(Some(&tenant), &bucket).await?))
}

/// `GET /storage/url/{bucket}/{key}`: builds a delivery URL for an object.
pub async fn object_url(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    Query(query): Query<UrlQuery>,
) -> Result<impl IntoResponse, AppError> {
    let mut builder = state.versions.prepare_download(&bucket, &key);
    if let Some(version) = query.version {
        builder = builder.with_version(version);
    }
    if let Some(filename) = query.download {
        builder = builder.as_download(filename);
    }
    if let Some(addon) = query.addon.as_deref() {
        builder = builder.with_addon_text(addon);
    }
    if let Some(base_url) = state.public_url.as_deref() {
        builder = builder.with_base_url(base_url);
    }
    if query.eternal {
        builder = builder.eternally_valid();
    }

    let url = builder
        .build_url()
        .await?
        .ok_or_else(|| {
            AppError::not_found(format!("object `{key}` has no content in `{bucket}`"))
        })?;
    Ok(Json(UrlResponse { url }))
}
