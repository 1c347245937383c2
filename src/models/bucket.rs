//! Represents a configured bucket: a named space of objects bound to a backend.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Name of the backend used when a bucket definition doesn't name one.
pub const DEFAULT_BACKEND: &str = "fs";

/// A storage bucket as provided by the configuration.
///
/// Buckets are not persisted; they are declared at startup and determine
/// which physical backend stores the blobs and how long objects are kept.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BucketInfo {
    /// Unique bucket name.
    pub name: String,

    /// Permission a caller needs to browse or modify the bucket over HTTP.
    pub permission: Option<String>,

    /// Objects older than this are removed by the retention sweep (0 keeps them forever).
    pub delete_files_after_days: u32,

    /// Name of the physical backend storing the blobs.
    pub backend: String,
}

impl BucketInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            permission: None,
            delete_files_after_days: 0,
            backend: DEFAULT_BACKEND.to_string(),
        }
    }

    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.delete_files_after_days = days;
        self
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = backend.into();
        self
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permission = Some(permission.into());
        self
    }

    pub fn has_retention(&self) -> bool {
        self.delete_files_after_days > 0
    }

    /// Determines if a caller holding `granted` may access the bucket.
    ///
    /// Buckets without a permission are open to everyone.
    pub fn is_accessible<'a>(&self, granted: impl IntoIterator<Item = &'a str>) -> bool {
        match self.permission.as_deref() {
            Some(required) => granted.into_iter().any(|permission| permission == required),
            None => true,
        }
    }
}

/// Parses `name[:retention_days[:backend[:permission]]]`.
impl FromStr for BucketInfo {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut parts = value.trim().split(':');
        let name = parts
            .next()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| format!("bucket definition `{value}` has no name"))?;
        let mut bucket = BucketInfo::new(name);

        if let Some(days) = parts.next().map(str::trim).filter(|d| !d.is_empty()) {
            let days = days
                .parse::<u32>()
                .map_err(|err| format!("bucket `{name}`: invalid retention days `{days}`: {err}"))?;
            bucket = bucket.with_retention_days(days);
        }

        if let Some(backend) = parts.next().map(str::trim).filter(|b| !b.is_empty()) {
            bucket = bucket.with_backend(backend);
        }

        if let Some(permission) = parts.next().map(str::trim).filter(|p| !p.is_empty()) {
            bucket = bucket.with_permission(permission);
        }

        if parts.next().is_some() {
            return Err(format!("bucket definition `{value}` has too many parts"));
        }

        Ok(bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bucket_definitions() {
        let bucket: BucketInfo = "products".parse().unwrap();
        assert_eq!(bucket, BucketInfo::new("products"));

        let bucket: BucketInfo = "exports:30:s3".parse().unwrap();
        assert_eq!(bucket.delete_files_after_days, 30);
        assert_eq!(bucket.backend, "s3");
        assert!(bucket.has_retention());
    }

    #[test]
    fn rejects_broken_definitions() {
        assert!("".parse::<BucketInfo>().is_err());
        assert!("exports:soon".parse::<BucketInfo>().is_err());
        assert!("a:1:fs:perm:extra".parse::<BucketInfo>().is_err());
    }

    #[test]
    fn parses_permissions() {
        let bucket: BucketInfo = "invoices::fs:permission-invoices".parse().unwrap();
        assert_eq!(bucket.permission.as_deref(), Some("permission-invoices"));
        assert!(!bucket.has_retention());
        assert_eq!(bucket.backend, "fs");
    }

    #[test]
    fn checks_bucket_access() {
        let open = BucketInfo::new("public");
        assert!(open.is_accessible([]));

        let guarded = BucketInfo::new("invoices").with_permission("permission-invoices");
        assert!(!guarded.is_accessible([]));
        assert!(!guarded.is_accessible(["permission-orders"]));
        assert!(guarded.is_accessible(["permission-orders", "permission-invoices"]));
    }
}
