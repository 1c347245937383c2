//! Represents a computed variant (e.g. a resized image) of a virtual object.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One derived version of a [`super::object::VirtualObject`].
///
/// A row without `physical_key` is a placeholder: the computation was
/// requested and has not completed yet.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct DerivedVersion {
    /// Internal row id.
    pub id: i64,

    /// Row id of the owning virtual object.
    pub virtual_object_id: i64,

    /// Bucket of the owning object (the blob lives in the same backend).
    pub bucket: String,

    /// The version specification, acting as cache key (e.g. `size:200x200,imageFormat:png`).
    pub version_key: String,

    /// Key of the computed blob, none while pending.
    pub physical_key: Option<String>,

    /// Size in bytes of the computed blob.
    pub file_size: i64,

    /// MD5 checksum (lowercase hex) of the computed blob.
    pub checksum: Option<String>,

    /// When the version was requested.
    pub created_at: DateTime<Utc>,
}

impl DerivedVersion {
    pub fn is_placeholder(&self) -> bool {
        self.physical_key.is_none()
    }
}
