use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tracing::debug;

use super::DatasetMetadata;
use crate::cloud::ObjectStorage;
use crate::context::RequestContext;
use crate::error::{DsError, Result};
use crate::repository::MetadataRepository;

/// Metadata records stored as JSON documents in an object-storage container.
///
/// Records live at `<account>/<id>` inside `bucket`.
pub struct ObjectMetadataStore {
    storage: Arc<dyn ObjectStorage>,
    bucket: String,
}

impl ObjectMetadataStore {
    /// Creates a store over `bucket`.
    pub fn new(storage: Arc<dyn ObjectStorage>, bucket: impl Into<String>) -> Self {
        Self {
            storage,
            bucket: bucket.into(),
        }
    }

    fn key(account: &str, id: &str) -> String {
        format!("{}/{}", account, id)
    }

    async fn read(&self, ctx: &RequestContext, account: &str, id: &str) -> Result<DatasetMetadata> {
        let key = Self::key(account, id);
        let raw = ctx
            .call(self.storage.get_object(&self.bucket, &key))
            .await
            .map_err(|e| match e {
                DsError::NotFound(_) => DsError::NotFound(format!("dataset {} not found", id)),
                other => other,
            })?;
        DatasetMetadata::from_json(&raw)
            .map_err(|e| DsError::Internal(format!("stored metadata for {} is corrupt: {}", id, e.message())))
    }

    async fn write(&self, ctx: &RequestContext, account: &str, id: &str, metadata: &DatasetMetadata) -> Result<()> {
        let body = serde_json::to_vec(metadata).map_err(|e| DsError::Internal(e.to_string()))?;
        ctx.call(self.storage.put_object(&self.bucket, &Self::key(account, id), Bytes::from(body)))
            .await
    }
}

#[async_trait]
impl MetadataRepository for ObjectMetadataStore {
    async fn create(&self, ctx: &RequestContext, account: &str, id: &str, mut metadata: DatasetMetadata) -> Result<DatasetMetadata> {
        match ctx.call(self.storage.head_object(&self.bucket, &Self::key(account, id))).await {
            Ok(_) => return Err(DsError::Conflict(format!("metadata for dataset {} already exists", id))),
            Err(DsError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        let now = Utc::now();
        metadata.created_at = Some(now);
        metadata.modified_at = Some(now);
        if metadata.modified_by.is_empty() {
            metadata.modified_by = metadata.created_by.clone();
        }
        metadata.finalized_at = None;
        metadata.finalized_by.clear();
        self.write(ctx, account, id, &metadata).await?;
        debug!(account, dataset = id, "metadata: created");
        Ok(metadata)
    }

    async fn get(&self, ctx: &RequestContext, account: &str, id: &str) -> Result<DatasetMetadata> {
        self.read(ctx, account, id).await
    }

    async fn update(&self, ctx: &RequestContext, account: &str, id: &str, metadata: DatasetMetadata) -> Result<DatasetMetadata> {
        let current = self.read(ctx, account, id).await?;
        if !metadata.data_storage.is_empty() && metadata.data_storage != current.data_storage {
            return Err(DsError::BadRequest("data_storage cannot be changed".to_string()));
        }
        if current.is_finalized() && !current.frozen_fields_equal(&metadata) {
            return Err(DsError::Conflict(format!(
                "dataset {} is finalized; only description may change",
                id
            )));
        }
        let updated = DatasetMetadata {
            data_storage: current.data_storage.clone(),
            created_by: current.created_by.clone(),
            created_at: current.created_at,
            finalized_by: current.finalized_by.clone(),
            finalized_at: current.finalized_at,
            modified_at: Some(Utc::now()),
            ..metadata
        };
        self.write(ctx, account, id, &updated).await?;
        debug!(account, dataset = id, "metadata: updated");
        Ok(updated)
    }

    async fn promote(&self, ctx: &RequestContext, account: &str, id: &str, user: &str) -> Result<DatasetMetadata> {
        let mut metadata = self.read(ctx, account, id).await?;
        if metadata.is_finalized() {
            return Err(DsError::Conflict(format!("dataset {} is already finalized", id)));
        }
        let now = Utc::now();
        metadata.derivative = false;
        metadata.finalized_by = user.to_string();
        metadata.finalized_at = Some(now);
        metadata.modified_by = user.to_string();
        metadata.modified_at = Some(now);
        self.write(ctx, account, id, &metadata).await?;
        debug!(account, dataset = id, user, "metadata: promoted");
        Ok(metadata)
    }

    async fn delete(&self, ctx: &RequestContext, account: &str, id: &str) -> Result<()> {
        let key = Self::key(account, id);
        ctx.call(self.storage.head_object(&self.bucket, &key))
            .await
            .map_err(|e| match e {
                DsError::NotFound(_) => DsError::NotFound(format!("dataset {} not found", id)),
                other => other,
            })?;
        ctx.call(self.storage.delete_object(&self.bucket, &key)).await?;
        debug!(account, dataset = id, "metadata: deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::memory::SimulatedCloud;
    use crate::error::ErrorKind;

    async fn store() -> ObjectMetadataStore {
        let cloud = Arc::new(SimulatedCloud::for_tests());
        cloud.create_bucket("meta").await.unwrap();
        ObjectMetadataStore::new(cloud, "meta")
    }

    fn sample() -> DatasetMetadata {
        DatasetMetadata {
            name: "ds1".into(),
            description: "first".into(),
            data_storage: "s3".into(),
            derivative: true,
            created_by: "alice".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_stamps_times_and_rejects_duplicates() {
        let s = store().await;
        let ctx = RequestContext::new();
        let md = s.create(&ctx, "acct", "id1", sample()).await.unwrap();
        assert!(md.created_at.is_some());
        assert_eq!(md.modified_by, "alice");
        assert_eq!(s.get(&ctx, "acct", "id1").await.unwrap(), md);
        let err = s.create(&ctx, "acct", "id1", sample()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let s = store().await;
        let err = s.get(&RequestContext::new(), "acct", "nope").await.unwrap_err();
        assert_eq!(err, DsError::NotFound("dataset nope not found".into()));
    }

    #[tokio::test]
    async fn test_update_keeps_immutable_fields() {
        let s = store().await;
        let ctx = RequestContext::new();
        let created = s.create(&ctx, "acct", "id1", sample()).await.unwrap();

        let mut change = created.clone();
        change.data_storage = "other".into();
        let err = s.update(&ctx, "acct", "id1", change).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);

        let mut change = created.clone();
        change.description = "second".into();
        change.created_by = "mallory".into();
        let updated = s.update(&ctx, "acct", "id1", change).await.unwrap();
        assert_eq!(updated.description, "second");
        assert_eq!(updated.created_by, "alice");
        assert_eq!(updated.created_at, created.created_at);
    }

    #[tokio::test]
    async fn test_promote_finalizes_once() {
        let s = store().await;
        let ctx = RequestContext::new();
        s.create(&ctx, "acct", "id1", sample()).await.unwrap();
        let md = s.promote(&ctx, "acct", "id1", "bob").await.unwrap();
        assert!(!md.derivative);
        assert_eq!(md.finalized_by, "bob");
        assert!(md.is_finalized());

        let err = s.promote(&ctx, "acct", "id1", "bob").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_finalized_allows_only_description() {
        let s = store().await;
        let ctx = RequestContext::new();
        s.create(&ctx, "acct", "id1", sample()).await.unwrap();
        let finalized = s.promote(&ctx, "acct", "id1", "bob").await.unwrap();

        let mut rename = finalized.clone();
        rename.name = "renamed".into();
        assert_eq!(
            s.update(&ctx, "acct", "id1", rename).await.unwrap_err().kind(),
            ErrorKind::Conflict
        );

        let mut describe = finalized.clone();
        describe.description = "final notes".into();
        describe.modified_by = "carol".into();
        let md = s.update(&ctx, "acct", "id1", describe).await.unwrap();
        assert_eq!(md.description, "final notes");
        assert_eq!(md.modified_by, "carol");
        assert_eq!(md.finalized_by, "bob");
    }

    #[tokio::test]
    async fn test_delete() {
        let s = store().await;
        let ctx = RequestContext::new();
        s.create(&ctx, "acct", "id1", sample()).await.unwrap();
        s.delete(&ctx, "acct", "id1").await.unwrap();
        assert!(s.get(&ctx, "acct", "id1").await.unwrap_err().is_not_found());
        assert!(s.delete(&ctx, "acct", "id1").await.unwrap_err().is_not_found());
    }
}
