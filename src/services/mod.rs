//! Core services: the storage orchestrator and its collaborators.

pub mod backend;
pub mod cache;
pub mod converter;
pub mod download;
pub mod fs_backend;
pub mod reference;
pub mod retention;
pub mod storage_service;
pub mod url_signer;
pub mod versions;
