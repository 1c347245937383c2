//! Virtual object storage: stable logical file identities over immutable
//! physical blobs, derived image versions computed in the background, and
//! hash-authenticated delivery URLs.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
