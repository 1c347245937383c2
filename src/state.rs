//! Shared application state handed to every handler.

use crate::services::{storage_service::StorageService, versions::VersionManager};
use axum::extract::FromRef;
use std::path::PathBuf;

#[derive(Clone)]
pub struct AppState {
    pub storage: StorageService,
    pub versions: VersionManager,
    /// Root of the filesystem backend, probed by `/readyz`.
    pub storage_dir: PathBuf,
    /// Prefix of generated delivery URLs.
    pub public_url: Option<String>,
}

impl FromRef<AppState> for StorageService {
    fn from_ref(state: &AppState) -> Self {
        state.storage.clone()
    }
}
