//! src/services/reference.rs
//!
//! A reference field embeds a single stored object into an owning record.
//!
//! Uploads for a field start out temporary. Once the owner is saved, the
//! bound object is claimed with the tag `field:owner` and every other object
//! carrying that tag is deleted. Deleting the owner deletes all tagged
//! objects. Objects which are merely linked (e.g. picked from a bucket) never
//! carry the tag and thus survive both.

use crate::models::object::VirtualObject;
use crate::services::{
    storage_service::{StorageResult, StorageService},
    versions::VersionManager,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A record which can own reference fields.
pub trait ReferenceOwner {
    /// Stable unique name of the record, `None` as long as it isn't persisted.
    fn unique_name(&self) -> Option<String>;
}

pub fn reference_tag(field: &str, owner: &str) -> String {
    format!("{field}:{owner}")
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct StoredObjectRef {
    bucket: String,
    supports_url: bool,
    key: Option<String>,
    #[serde(skip)]
    changed: bool,
    #[serde(skip)]
    object: Option<VirtualObject>,
}

impl StoredObjectRef {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            supports_url: false,
            key: None,
            changed: false,
            object: None,
        }
    }

    /// A field which may hold an external http(s) URL instead of an object key.
    pub fn with_url_support(bucket: impl Into<String>) -> Self {
        Self {
            supports_url: true,
            ..Self::new(bucket)
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn is_filled(&self) -> bool {
        self.key.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_none()
    }

    pub fn is_changed(&self) -> bool {
        self.changed
    }

    pub fn is_url(&self) -> bool {
        self.supports_url
            && self
                .key
                .as_deref()
                .is_some_and(|key| key.starts_with("http://") || key.starts_with("https://"))
    }

    pub fn set_key(&mut self, key: Option<&str>) {
        let key = key.map(str::trim).filter(|k| !k.is_empty());
        if self.key.as_deref() != key {
            self.changed = true;
        }
        self.key = key.map(str::to_string);
        if self.object.as_ref().map(|o| o.object_key.as_str()) != key {
            self.object = None;
        }
    }

    pub fn set_object(&mut self, object: Option<&VirtualObject>) {
        let key = object.map(|o| o.object_key.clone());
        if self.key != key {
            self.changed = true;
        }
        self.key = key;
        self.object = object.cloned();
    }

    /// Loads the bound object. A key pointing to a vanished object is cleared.
    pub async fn object(
        &mut self,
        storage: &StorageService,
    ) -> StorageResult<Option<VirtualObject>> {
        if self.object.is_none() && !self.is_url() {
            if let Some(key) = self.key.as_deref() {
                self.object = storage.find_by_key(None, &self.bucket, key).await?;
                if self.object.is_none() {
                    debug!(bucket = %self.bucket, key, "referenced object vanished");
                    self.key = None;
                }
            }
        }
        Ok(self.object.clone())
    }

    /// Delivery URL of the field's content, `default` if there is none.
    ///
    /// An external URL is returned as is.
    pub async fn url(
        &mut self,
        versions: &VersionManager,
        version: Option<&str>,
        addon_text: Option<&str>,
        eternally_valid: bool,
        default: Option<String>,
    ) -> StorageResult<Option<String>> {
        if self.is_url() {
            return Ok(self.key.clone());
        }
        let Some(object) = self.object(versions.storage()).await? else {
            return Ok(default);
        };

        let mut builder = versions.prepare_object_download(&object);
        if let Some(version) = version {
            builder = builder.with_version(version);
        }
        if let Some(text) = addon_text {
            builder = builder.with_addon_text(text);
        }
        if eternally_valid {
            builder = builder.eternally_valid();
        }
        Ok(builder.build_url().await?.or(default))
    }

    /// Filename of the bound object or the last segment of an external URL.
    pub async fn filename(&mut self, storage: &StorageService) -> StorageResult<Option<String>> {
        if self.is_url() {
            return Ok(self
                .key
                .as_deref()
                .and_then(|url| url.rsplit('/').next())
                .map(str::to_string));
        }
        Ok(self
            .object(storage)
            .await?
            .and_then(|object| object.filename().map(str::to_string)))
    }

    /// Creates a temporary object to upload new content for this field into.
    ///
    /// If the owner is already persisted, the upload is tagged right away.
    pub async fn create_upload(
        &self,
        storage: &StorageService,
        tenant: &str,
        field: &str,
        owner: &impl ReferenceOwner,
        path: Option<&str>,
    ) -> StorageResult<VirtualObject> {
        let tag = owner.unique_name().map(|name| reference_tag(field, &name));
        storage
            .create_temporary(tenant, &self.bucket, tag.as_deref(), path)
            .await
    }

    /// Claims the bound object and removes replaced ones; call after the owner was saved.
    pub async fn on_after_save(
        &mut self,
        storage: &StorageService,
        field: &str,
        owner: &impl ReferenceOwner,
    ) -> StorageResult<()> {
        let Some(owner_name) = owner.unique_name() else {
            return Ok(());
        };
        if !self.changed {
            return Ok(());
        }

        let tag = reference_tag(field, &owner_name);
        let key = self.key.clone().filter(|_| !self.is_url());
        storage.delete_referenced(&tag, key.as_deref()).await?;
        if let Some(key) = key.as_deref() {
            storage.mark_as_used(&tag, key).await?;
        }
        self.changed = false;
        Ok(())
    }

    /// Deletes all objects owned through this field; call after the owner was deleted.
    pub async fn on_after_delete(
        &self,
        storage: &StorageService,
        field: &str,
        owner: &impl ReferenceOwner,
    ) -> StorageResult<usize> {
        match owner.unique_name() {
            Some(owner_name) => {
                storage
                    .delete_referenced(&reference_tag(field, &owner_name), None)
                    .await
            }
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::TestContext;
    use bytes::Bytes;

    struct Product {
        id: Option<i64>,
    }

    impl ReferenceOwner for Product {
        fn unique_name(&self) -> Option<String> {
            self.id.map(|id| format!("product-{id}"))
        }
    }

    async fn upload(
        ctx: &TestContext,
        field: &StoredObjectRef,
        owner: &Product,
        content: &'static [u8],
    ) -> VirtualObject {
        let mut object = field
            .create_upload(&ctx.storage, "t1", "logo", owner, Some("logo.png"))
            .await
            .unwrap();
        ctx.storage
            .update_content_bytes(&mut object, Bytes::from_static(content), None)
            .await
            .unwrap();
        object
    }

    async fn exists(ctx: &TestContext, object: &VirtualObject) -> bool {
        ctx.storage
            .find_by_key(None, "products", &object.object_key)
            .await
            .unwrap()
            .is_some()
    }

    #[test]
    fn tracks_changes() {
        let mut field = StoredObjectRef::new("products");
        assert!(field.is_empty() && !field.is_changed());

        field.set_key(Some("abc"));
        assert!(field.is_filled() && field.is_changed());

        let mut unchanged = StoredObjectRef::new("products");
        unchanged.set_key(Some("  "));
        assert!(unchanged.is_empty() && !unchanged.is_changed());
    }

    #[test]
    fn urls_need_support() {
        let mut plain = StoredObjectRef::new("products");
        plain.set_key(Some("https://example.com/a.png"));
        assert!(!plain.is_url());

        let mut linked = StoredObjectRef::with_url_support("products");
        linked.set_key(Some("https://example.com/a.png"));
        assert!(linked.is_url());
    }

    #[tokio::test]
    async fn new_owner_keeps_upload_temporary() {
        let ctx = TestContext::new().await;
        let owner = Product { id: None };
        let mut field = StoredObjectRef::new("products");
        let object = upload(&ctx, &field, &owner, b"a").await;
        field.set_object(Some(&object));

        field.on_after_save(&ctx.storage, "logo", &owner).await.unwrap();

        let stored = ctx
            .storage
            .find_by_key(None, "products", &object.object_key)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.temporary);
        assert!(field.is_changed());
    }

    #[tokio::test]
    async fn saving_claims_and_replaces() {
        let ctx = TestContext::new().await;
        let owner = Product { id: Some(7) };
        let mut field = StoredObjectRef::new("products");

        let first = upload(&ctx, &field, &owner, b"first").await;
        field.set_object(Some(&first));
        field.on_after_save(&ctx.storage, "logo", &owner).await.unwrap();
        assert!(!field.is_changed());

        let claimed = ctx
            .storage
            .find_by_key(None, "products", &first.object_key)
            .await
            .unwrap()
            .unwrap();
        assert!(!claimed.temporary);
        assert_eq!(claimed.reference.as_deref(), Some("logo:product-7"));

        let second = upload(&ctx, &field, &owner, b"second").await;
        field.set_object(Some(&second));
        field.on_after_save(&ctx.storage, "logo", &owner).await.unwrap();

        assert!(!exists(&ctx, &first).await);
        assert!(exists(&ctx, &second).await);
        assert!(
            ctx.fetch_blob("products", first.physical_key.as_deref().unwrap())
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn clearing_the_field_deletes_the_object() {
        let ctx = TestContext::new().await;
        let owner = Product { id: Some(7) };
        let mut field = StoredObjectRef::new("products");
        let object = upload(&ctx, &field, &owner, b"a").await;
        field.set_object(Some(&object));
        field.on_after_save(&ctx.storage, "logo", &owner).await.unwrap();

        field.set_key(None);
        field.on_after_save(&ctx.storage, "logo", &owner).await.unwrap();
        assert!(!exists(&ctx, &object).await);
    }

    #[tokio::test]
    async fn deleting_owner_cascades_but_spares_shared_objects() {
        let ctx = TestContext::new().await;
        let owner = Product { id: Some(7) };

        let mut logo = StoredObjectRef::new("products");
        let owned = upload(&ctx, &logo, &owner, b"owned").await;
        logo.set_object(Some(&owned));
        logo.on_after_save(&ctx.storage, "logo", &owner).await.unwrap();
        ctx.insert_version_row(&owned, "size:10x10", None).await;

        let shared = ctx.object_with_content("/shared/banner.png", b"shared").await;
        let mut banner = StoredObjectRef::new("products");
        banner.set_object(Some(&shared));
        banner.on_after_save(&ctx.storage, "banner", &owner).await.unwrap();

        assert_eq!(logo.on_after_delete(&ctx.storage, "logo", &owner).await.unwrap(), 1);
        assert_eq!(banner.on_after_delete(&ctx.storage, "banner", &owner).await.unwrap(), 0);

        assert!(!exists(&ctx, &owned).await);
        assert!(ctx.storage.find_version(owned.id, "size:10x10").await.unwrap().is_none());
        assert!(exists(&ctx, &shared).await);
    }

    #[tokio::test]
    async fn resolves_filenames_and_vanished_objects() {
        let ctx = TestContext::new().await;
        let object = ctx.object_with_content("/docs/manual.pdf", b"x").await;

        let mut field = StoredObjectRef::new("products");
        field.set_key(Some(&object.object_key));
        assert_eq!(
            field.filename(&ctx.storage).await.unwrap().as_deref(),
            Some("manual.pdf")
        );

        let mut external = StoredObjectRef::with_url_support("products");
        external.set_key(Some("https://example.com/files/photo.jpg"));
        assert_eq!(
            external.filename(&ctx.storage).await.unwrap().as_deref(),
            Some("photo.jpg")
        );

        let mut dangling = StoredObjectRef::new("products");
        dangling.set_key(Some("gone"));
        assert!(dangling.object(&ctx.storage).await.unwrap().is_none());
        assert!(dangling.is_empty());
    }
}
