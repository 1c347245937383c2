//! Represents the logical identity of a stored file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A file as seen by the application.
///
/// The `object_key` is assigned once and never changes, whereas the
/// `physical_key` is replaced every time the content changes. URLs are built
/// from the physical key, so they can be cached forever.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct VirtualObject {
    /// Internal row id.
    pub id: i64,

    /// Tenant owning this object.
    pub tenant_id: String,

    /// Bucket in which the object resides.
    pub bucket: String,

    /// Globally unique, immutable key of this object.
    pub object_key: String,

    /// Key of the blob holding the current content (none until content is attached).
    pub physical_key: Option<String>,

    /// Size in bytes of the current content.
    pub file_size: i64,

    /// MD5 checksum (lowercase hex) of the current content.
    pub checksum: Option<String>,

    /// Normalized virtual path.
    pub path: Option<String>,

    /// File extension derived from `path`.
    pub file_extension: Option<String>,

    /// Tag (`field:owner`) of the record field owning this object.
    pub reference: Option<String>,

    /// Set while an upload waits for its owning record to be saved.
    pub temporary: bool,

    /// Timestamp of the last metadata change.
    pub last_modified: DateTime<Utc>,
}

impl VirtualObject {
    /// Returns the last path segment, if a path is present.
    pub fn filename(&self) -> Option<&str> {
        self.path
            .as_deref()
            .map(|path| path.rsplit('/').next().unwrap_or(path))
            .filter(|name| !name.is_empty())
    }

    /// Determines if the content is an image, judged by the file extension.
    pub fn is_image(&self) -> bool {
        self.file_extension
            .as_deref()
            .and_then(|ext| mime_guess::from_ext(ext).first())
            .map(|mime| mime.type_() == mime_guess::mime::IMAGE)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(path: Option<&str>, ext: Option<&str>) -> VirtualObject {
        VirtualObject {
            id: 1,
            tenant_id: "t1".into(),
            bucket: "products".into(),
            object_key: "k".into(),
            physical_key: None,
            file_size: 0,
            checksum: None,
            path: path.map(str::to_string),
            file_extension: ext.map(str::to_string),
            reference: None,
            temporary: false,
            last_modified: Utc::now(),
        }
    }

    #[test]
    fn filename_is_last_segment() {
        assert_eq!(object(Some("/a/b.png"), None).filename(), Some("b.png"));
        assert_eq!(object(None, None).filename(), None);
    }

    #[test]
    fn image_detection_uses_extension() {
        assert!(object(Some("/a.png"), Some("png")).is_image());
        assert!(object(Some("/a.JPG"), Some("jpg")).is_image());
        assert!(!object(Some("/a.pdf"), Some("pdf")).is_image());
        assert!(!object(None, None).is_image());
    }
}
