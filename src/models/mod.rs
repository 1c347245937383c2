//! Core data models for the virtual object storage.
//!
//! A [`object::VirtualObject`] is the stable, logical identity of a file while
//! its content lives in an immutable physical blob. Every computed variant of
//! that content is a [`version::DerivedVersion`]. Both map to SQLite tables
//! via `sqlx::FromRow` and serialize as JSON via `serde`.

pub mod bucket;
pub mod object;
pub mod version;
