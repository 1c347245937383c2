//! Defines the HTTP routes of the storage service.
//!
//! ## Structure
//! - **Health**
//!   - `GET    /healthz`, `GET /readyz`
//!
//! - **Objects** (tenant from the `x-tenant-id` header)
//!   - `GET    /storage/objects/{bucket}`: list objects, newest first
//!   - `PUT    /storage/objects/{bucket}/{*path}`: upload to a path
//!   - `DELETE /storage/objects/{bucket}/{*path}`: delete the object at a path
//!
//! - **Delivery**
//!   - `GET    /storage/url/{bucket}/{key}`: build a delivery URL
//!   - `GET    /storage/physical/{bucket}/{hash}/{file}`: authenticated blob download
//!
//! The wildcard `*path` allows nested paths like `photos/2025/img.jpg`.

use crate::{
    handlers::{
        delivery_handlers::deliver_physical,
        health_handlers::{healthz, readyz},
        object_handlers::{delete_object, list_objects, object_url, upload_object},
    },
    state::AppState,
};
use axum::{
    Router,
    routing::{get, put},
};

/// Build and return the router, carrying [`AppState`] to all handlers.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // object routes
        .route("/storage/objects/{bucket}", get(list_objects))
        .route(
            "/storage/objects/{bucket}/{*path}",
            put(upload_object).delete(delete_object),
        )
        // delivery routes
        .route("/storage/url/{bucket}/{key}", get(object_url))
        .route(
            "/storage/physical/{bucket}/{hash}/{file}",
            get(deliver_physical),
        )
}
