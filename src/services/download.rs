//! src/services/download.rs
//!
//! Builder for delivery URLs. The default URL has the form
//! `{base}/storage/physical/{bucket}/{hash}/[{addon}--]{physical_key}.{ext}[?name={filename}]`
//! and is authenticated by the hash alone.

use crate::models::object::VirtualObject;
use crate::services::{
    backend::UrlRequest, converter::VersionSpec, storage_service::StorageResult,
    versions::VersionManager,
};

enum Target {
    Object(VirtualObject),
    Key { bucket: String, object_key: String },
}

/// Collects the parameters of a single delivery URL.
pub struct DownloadBuilder<'a> {
    versions: &'a VersionManager,
    target: Target,
    version: Option<String>,
    file_extension: Option<String>,
    filename: Option<String>,
    base_url: Option<String>,
    addon_text: Option<String>,
    eternally_valid: bool,
    hook: Option<String>,
    payload: Option<String>,
}

impl<'a> DownloadBuilder<'a> {
    pub(crate) fn for_object(versions: &'a VersionManager, object: VirtualObject) -> Self {
        Self::new(versions, Target::Object(object))
    }

    pub(crate) fn for_key(versions: &'a VersionManager, bucket: &str, object_key: &str) -> Self {
        Self::new(
            versions,
            Target::Key {
                bucket: bucket.to_string(),
                object_key: object_key.to_string(),
            },
        )
    }

    fn new(versions: &'a VersionManager, target: Target) -> Self {
        Self {
            versions,
            target,
            version: None,
            file_extension: None,
            filename: None,
            base_url: None,
            addon_text: None,
            eternally_valid: false,
            hook: None,
            payload: None,
        }
    }

    /// Requests a derived version (e.g. `size:200x200`) instead of the original.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into()).filter(|v: &String| !v.trim().is_empty());
        self
    }

    pub fn with_file_extension(mut self, extension: impl Into<String>) -> Self {
        self.file_extension = Some(extension.into());
        self
    }

    /// Makes the browser save the file under `filename`.
    ///
    /// Also determines the file extension unless one was set explicitly.
    pub fn as_download(mut self, filename: impl Into<String>) -> Self {
        let filename = filename.into();
        if self.file_extension.is_none() {
            self.file_extension = filename
                .rsplit_once('.')
                .map(|(_, ext)| ext.to_string())
                .filter(|ext| !ext.is_empty());
        }
        self.filename = Some(filename);
        self
    }

    /// Prefixes the URL, e.g. with `https://cdn.example.com`.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn eternally_valid(mut self) -> Self {
        self.eternally_valid = true;
        self
    }

    /// Adds a human readable text (e.g. for SEO), which is ignored on delivery.
    pub fn with_addon_text(mut self, text: &str) -> Self {
        let sanitized: String = text
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '.' { c } else { '-' })
            .collect();
        self.addon_text = Some(sanitized).filter(|t| !t.is_empty());
        self
    }

    /// Attaches an opaque hook and payload for consumers of the builder.
    pub fn with_hook(mut self, hook: impl Into<String>, payload: impl Into<String>) -> Self {
        self.hook = Some(hook.into());
        self.payload = Some(payload.into());
        self
    }

    pub fn hook(&self) -> Option<&str> {
        self.hook.as_deref()
    }

    pub fn payload(&self) -> Option<&str> {
        self.payload.as_deref()
    }

    /// Builds the URL, `None` if the object or its content doesn't exist.
    ///
    /// While a requested version is pending or failed, the URL points to the
    /// original content.
    pub async fn build_url(&self) -> StorageResult<Option<String>> {
        let object = match &self.target {
            Target::Object(object) => object.clone(),
            Target::Key { bucket, object_key } => {
                match self.versions.fetch_physical_object(bucket, object_key).await? {
                    Some(object) => object,
                    None => return Ok(None),
                }
            }
        };

        let Some((physical_key, extension)) = self.resolve(&object).await? else {
            return Ok(None);
        };

        let storage = self.versions.storage();
        let request = UrlRequest {
            bucket: &object.bucket,
            physical_key: &physical_key,
            file_extension: &extension,
            filename: self.filename.as_deref(),
            base_url: self.base_url.as_deref(),
            addon_text: self.addon_text.as_deref(),
            eternally_valid: self.eternally_valid,
        };
        if let Some(url) = storage.backend_for(&object.bucket)?.create_url(&request) {
            return Ok(Some(url));
        }

        let hash = if self.eternally_valid {
            storage.signer().compute_eternal_hash(&physical_key)
        } else {
            storage.signer().compute_hash(&physical_key, 0)
        };
        Ok(Some(default_url(&request, &hash)))
    }

    /// Physical key and extension to deliver.
    async fn resolve(&self, object: &VirtualObject) -> StorageResult<Option<(String, String)>> {
        let Some(original) = object.physical_key.clone() else {
            return Ok(None);
        };
        let original_extension = || {
            self.file_extension
                .clone()
                .or_else(|| object.file_extension.clone())
                .unwrap_or_default()
        };

        let Some(version) = self.version.as_deref() else {
            return Ok(Some((original, original_extension())));
        };

        match self.versions.fetch_version(object, version).await? {
            Some(physical_key) => {
                let extension = self.file_extension.clone().unwrap_or_else(|| {
                    version
                        .parse::<VersionSpec>()
                        .map(|spec| spec.format.extension().to_string())
                        .unwrap_or_else(|_| original_extension())
                });
                Ok(Some((physical_key, extension)))
            }
            None => Ok(Some((original, original_extension()))),
        }
    }
}

fn default_url(request: &UrlRequest<'_>, hash: &str) -> String {
    let mut url = format!(
        "{}/storage/physical/{}/{}/",
        request.base_url.unwrap_or_default().trim_end_matches('/'),
        request.bucket,
        hash
    );
    if let Some(addon) = request.addon_text {
        url.push_str(addon);
        url.push_str("--");
    }
    url.push_str(request.physical_key);
    url.push('.');
    url.push_str(request.file_extension);
    if let Some(filename) = request.filename {
        url.push_str("?name=");
        url.push_str(&urlencoding::encode(filename));
    }
    url
}
