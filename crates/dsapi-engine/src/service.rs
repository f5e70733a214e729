//! Per-tenant dataset orchestration.
//!
//! A [`Service`] owns the repositories of one account: a registry of storage
//! providers keyed by data-storage type, the metadata facade and the audit
//! log. Every operation on an existing dataset reads its metadata first to
//! find the provider; every mutating success emits an [`AuditRecord`].

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::auditlog::{AuditAction, AuditRecord};
use crate::cloud::{LogEvent, Tag};
use crate::context::RequestContext;
use crate::error::{DsError, Result};
use crate::metadata::DatasetMetadata;
use crate::objstore::{TAG_ID, TAG_ORG};
use crate::repository::{
    AccessMap, Attachment, AttachmentRepository, AuditLogRepository, CreatedUser, MetadataRepository, RepositoryInfo,
    StorageProvider, UpdatedUser, UserMap,
};
use crate::rollback::Rollback;

/// Retention of audit streams when none is configured.
pub const DEFAULT_LOG_RETENTION_DAYS: u32 = 90;

/// Body of a dataset creation request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateDatasetRequest {
    /// Dataset name
    #[serde(default)]
    pub name: String,
    /// Data-storage type; may be empty when the tenant has a single provider
    #[serde(rename = "type", default)]
    pub data_storage: String,
    /// Writable by policy
    #[serde(default)]
    pub derivative: bool,
    /// Extra container tags
    #[serde(default)]
    pub tags: Vec<Tag>,
    /// Initial metadata
    #[serde(default)]
    pub metadata: DatasetMetadata,
}

/// Result of a dataset creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedDataset {
    /// Dataset id
    pub id: String,
    /// Container name
    pub repository: String,
    /// Stored metadata
    pub metadata: DatasetMetadata,
}

/// A dataset as shown to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShownDataset {
    /// Dataset id
    pub id: String,
    /// Stored metadata
    pub metadata: DatasetMetadata,
    /// Container name and tags
    pub repository: RepositoryInfo,
}

/// Body of a dataset update; only these fields may change through the API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateDatasetRequest {
    /// New description, if changing
    #[serde(default)]
    pub description: Option<String>,
    /// Actor
    #[serde(default)]
    pub modified_by: String,
}

/// Body of a promote request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromoteDatasetRequest {
    /// Actor
    #[serde(default)]
    pub modified_by: String,
}

/// Datasets of one account.
pub struct Service {
    account: String,
    org: String,
    providers: BTreeMap<String, StorageProvider>,
    metadata: Arc<dyn MetadataRepository>,
    audit: Arc<dyn AuditLogRepository>,
    log_retention_days: u32,
}

impl Service {
    /// Creates a service without storage providers.
    pub fn new(
        account: impl Into<String>,
        org: impl Into<String>,
        metadata: Arc<dyn MetadataRepository>,
        audit: Arc<dyn AuditLogRepository>,
    ) -> Self {
        Self {
            account: account.into(),
            org: org.into(),
            providers: BTreeMap::new(),
            metadata,
            audit,
            log_retention_days: DEFAULT_LOG_RETENTION_DAYS,
        }
    }

    /// Registers a provider under a data-storage type.
    pub fn with_provider(mut self, data_storage: impl Into<String>, provider: StorageProvider) -> Self {
        self.providers.insert(data_storage.into(), provider);
        self
    }

    /// Sets the retention of newly created audit streams.
    pub fn with_log_retention(mut self, days: u32) -> Self {
        self.log_retention_days = days;
        self
    }

    /// Account name.
    pub fn account(&self) -> &str {
        &self.account
    }

    /// Registered data-storage types.
    pub fn storage_types(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }

    fn provider(&self, data_storage: &str) -> Result<&StorageProvider> {
        self.providers
            .get(data_storage)
            .ok_or_else(|| DsError::BadRequest(format!("unsupported data storage type {:?}", data_storage)))
    }

    fn resolve_storage_type(&self, requested: &str) -> Result<String> {
        if !requested.is_empty() {
            self.provider(requested)?;
            return Ok(requested.to_string());
        }
        let mut types = self.providers.keys();
        match (types.next(), types.next()) {
            (Some(only), None) => Ok(only.clone()),
            _ => Err(DsError::BadRequest("data storage type is required".to_string())),
        }
    }

    async fn dataset(&self, ctx: &RequestContext, id: &str) -> Result<(DatasetMetadata, &StorageProvider)> {
        let metadata = self.metadata.get(ctx, &self.account, id).await?;
        let provider = self.provider(&metadata.data_storage)?;
        Ok((metadata, provider))
    }

    async fn attachments_of(&self, ctx: &RequestContext, id: &str) -> Result<Arc<dyn AttachmentRepository>> {
        let (metadata, provider) = self.dataset(ctx, id).await?;
        provider.attachments.clone().ok_or_else(|| {
            DsError::BadRequest(format!(
                "data storage type {} does not support attachments",
                metadata.data_storage
            ))
        })
    }

    fn audit(&self, ctx: &RequestContext, group: &str, id: &str, action: AuditAction, detail: impl Into<String>) {
        let message = AuditRecord::new(ctx, action, id, detail).to_message();
        match self.audit.log(ctx, group, id) {
            Ok(tx) => {
                if let Err(e) = tx.try_send(message) {
                    warn!(dataset = id, error = %e, "audit: event dropped");
                }
            }
            Err(e) => warn!(dataset = id, error = %e, "audit: cannot open log"),
        }
    }

    /// Provisions a container, records its metadata and opens its audit stream.
    pub async fn create_dataset(&self, ctx: &RequestContext, group: &str, req: CreateDatasetRequest) -> Result<CreatedDataset> {
        let data_storage = self.resolve_storage_type(&req.data_storage)?;
        let mut metadata = req.metadata;
        if !req.name.is_empty() {
            metadata.name = req.name;
        }
        if metadata.name.is_empty() {
            return Err(DsError::BadRequest("dataset name is required".to_string()));
        }
        metadata.data_storage = data_storage.clone();
        metadata.derivative = req.derivative;

        let id = uuid::Uuid::new_v4().to_string();
        let provider = self.provider(&data_storage)?.clone();

        let mut rollback = Rollback::new(ctx);
        let result = self
            .create_steps(ctx, &mut rollback, group, &id, &provider, req.tags, metadata)
            .await;
        let created = rollback.finish(result).await?;

        info!(request_id = ctx.request_id(), account = %self.account, dataset = %id, repository = %created.repository, "dataset created");
        self.audit(ctx, group, &id, AuditAction::DatasetCreate, created.repository.clone());
        Ok(created)
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_steps(
        &self,
        ctx: &RequestContext,
        rollback: &mut Rollback,
        group: &str,
        id: &str,
        provider: &StorageProvider,
        tags: Vec<Tag>,
        metadata: DatasetMetadata,
    ) -> Result<CreatedDataset> {
        let repository = provider.data.provision(ctx, id, metadata.derivative, &tags).await?;
        let data = Arc::clone(&provider.data);
        let dataset = id.to_string();
        rollback.push(format!("delete repository {}", repository), move |ctx| async move {
            data.delete(&ctx, &dataset).await
        });
        debug!(dataset = id, repository = %repository, "create: repository provisioned");

        let metadata = self.metadata.create(ctx, &self.account, id, metadata).await?;
        let store = Arc::clone(&self.metadata);
        let account = self.account.clone();
        let dataset = id.to_string();
        rollback.push(format!("delete metadata {}", id), move |ctx| async move {
            store.delete(&ctx, &account, &dataset).await
        });
        debug!(dataset = id, "create: metadata stored");

        let log_tags = [Tag::new(TAG_ORG, self.org.clone()), Tag::new(TAG_ID, id)];
        self.audit
            .create_log(ctx, group, id, self.log_retention_days, &log_tags)
            .await?;

        Ok(CreatedDataset {
            id: id.to_string(),
            repository,
            metadata,
        })
    }

    /// Metadata of a dataset.
    pub async fn metadata(&self, ctx: &RequestContext, id: &str) -> Result<DatasetMetadata> {
        self.metadata.get(ctx, &self.account, id).await
    }

    /// Metadata and repository description of a dataset.
    pub async fn show_dataset(&self, ctx: &RequestContext, id: &str) -> Result<ShownDataset> {
        let (metadata, provider) = self.dataset(ctx, id).await?;
        let repository = provider.data.describe(ctx, id).await?;
        Ok(ShownDataset {
            id: id.to_string(),
            metadata,
            repository,
        })
    }

    /// Changes the description and records the modifier.
    pub async fn update_dataset(
        &self,
        ctx: &RequestContext,
        group: &str,
        id: &str,
        req: UpdateDatasetRequest,
    ) -> Result<DatasetMetadata> {
        let mut metadata = self.metadata.get(ctx, &self.account, id).await?;
        if let Some(description) = req.description {
            metadata.description = description;
        }
        if !req.modified_by.is_empty() {
            metadata.modified_by = req.modified_by;
        }
        let updated = self.metadata.update(ctx, &self.account, id, metadata).await?;
        self.audit(ctx, group, id, AuditAction::DatasetUpdate, updated.modified_by.clone());
        Ok(updated)
    }

    /// Finalizes a dataset; a derivative gets the read-only policy first.
    pub async fn promote_dataset(
        &self,
        ctx: &RequestContext,
        group: &str,
        id: &str,
        req: PromoteDatasetRequest,
    ) -> Result<DatasetMetadata> {
        let (metadata, provider) = self.dataset(ctx, id).await?;
        if metadata.is_finalized() {
            return Err(DsError::Conflict(format!("dataset {} is already finalized", id)));
        }

        let mut rollback = Rollback::new(ctx);
        if metadata.derivative {
            provider.data.set_policy(ctx, id, false).await?;
            let data = Arc::clone(&provider.data);
            let dataset = id.to_string();
            rollback.push(format!("restore derivative policy {}", id), move |ctx| async move {
                data.set_policy(&ctx, &dataset, true).await
            });
        }
        let result = self.metadata.promote(ctx, &self.account, id, &req.modified_by).await;
        let promoted = rollback.finish(result).await?;

        info!(request_id = ctx.request_id(), dataset = id, by = %req.modified_by, "dataset promoted");
        self.audit(ctx, group, id, AuditAction::DatasetPromote, req.modified_by);
        Ok(promoted)
    }

    /// Deletes an empty dataset's container, then its metadata.
    pub async fn delete_dataset(&self, ctx: &RequestContext, group: &str, id: &str) -> Result<()> {
        let (_, provider) = self.dataset(ctx, id).await?;
        provider.data.delete(ctx, id).await?;
        self.metadata.delete(ctx, &self.account, id).await?;
        info!(request_id = ctx.request_id(), dataset = id, "dataset deleted");
        self.audit(ctx, group, id, AuditAction::DatasetDelete, "");
        Ok(())
    }

    /// Stores an attachment.
    pub async fn create_attachment(&self, ctx: &RequestContext, group: &str, id: &str, name: &str, body: Bytes) -> Result<()> {
        let attachments = self.attachments_of(ctx, id).await?;
        attachments.create_attachment(ctx, id, name, body).await?;
        self.audit(ctx, group, id, AuditAction::AttachmentCreate, name);
        Ok(())
    }

    /// Lists attachments.
    pub async fn list_attachments(&self, ctx: &RequestContext, id: &str, show_urls: bool) -> Result<Vec<Attachment>> {
        self.attachments_of(ctx, id)
            .await?
            .list_attachments(ctx, id, show_urls)
            .await
    }

    /// Deletes an attachment.
    pub async fn delete_attachment(&self, ctx: &RequestContext, group: &str, id: &str, name: &str) -> Result<()> {
        let attachments = self.attachments_of(ctx, id).await?;
        attachments.delete_attachment(ctx, id, name).await?;
        self.audit(ctx, group, id, AuditAction::AttachmentDelete, name);
        Ok(())
    }

    /// Binds an instance to the dataset.
    pub async fn grant_access(&self, ctx: &RequestContext, group: &str, id: &str, instance_id: &str) -> Result<AccessMap> {
        let (_, provider) = self.dataset(ctx, id).await?;
        let access = provider.data.grant_access(ctx, id, instance_id).await?;
        self.audit(ctx, group, id, AuditAction::AccessGrant, instance_id);
        Ok(access)
    }

    /// Unbinds an instance from the dataset.
    pub async fn revoke_access(&self, ctx: &RequestContext, group: &str, id: &str, instance_id: &str) -> Result<()> {
        let (_, provider) = self.dataset(ctx, id).await?;
        provider.data.revoke_access(ctx, id, instance_id).await?;
        self.audit(ctx, group, id, AuditAction::AccessRevoke, instance_id);
        Ok(())
    }

    /// Instances bound to the dataset.
    pub async fn list_access(&self, ctx: &RequestContext, id: &str) -> Result<AccessMap> {
        let (_, provider) = self.dataset(ctx, id).await?;
        provider.data.list_access(ctx, id).await
    }

    /// Creates the temporary user.
    pub async fn create_user(&self, ctx: &RequestContext, group: &str, id: &str) -> Result<CreatedUser> {
        let (_, provider) = self.dataset(ctx, id).await?;
        let created = provider.data.create_user(ctx, id).await?;
        self.audit(ctx, group, id, AuditAction::UserCreate, created.user.clone());
        Ok(created)
    }

    /// Advances the temporary user's key rotation.
    pub async fn update_user(&self, ctx: &RequestContext, group: &str, id: &str) -> Result<UpdatedUser> {
        let (_, provider) = self.dataset(ctx, id).await?;
        let updated = provider.data.update_user(ctx, id).await?;
        let keys = updated
            .keys
            .iter()
            .map(|(k, s)| format!("{}={}", k, s.as_str()))
            .collect::<Vec<_>>()
            .join(",");
        self.audit(ctx, group, id, AuditAction::UserUpdate, keys);
        Ok(updated)
    }

    /// Removes the temporary user.
    pub async fn delete_user(&self, ctx: &RequestContext, group: &str, id: &str) -> Result<()> {
        let (_, provider) = self.dataset(ctx, id).await?;
        provider.data.delete_user(ctx, id).await?;
        self.audit(ctx, group, id, AuditAction::UserDelete, "");
        Ok(())
    }

    /// Temporary users and their keys. `NotFound` when none were created.
    pub async fn list_users(&self, ctx: &RequestContext, id: &str) -> Result<UserMap> {
        let (_, provider) = self.dataset(ctx, id).await?;
        provider.data.list_users(ctx, id).await
    }

    /// Events of the dataset's audit stream.
    pub async fn log_events(&self, ctx: &RequestContext, group: &str, id: &str) -> Result<Vec<LogEvent>> {
        self.metadata.get(ctx, &self.account, id).await?;
        self.audit.events(ctx, group, id).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::auditlog::CloudAuditLog;
    use crate::cloud::memory::SimulatedCloud;
    use crate::cloud::{AccessKeyStatus, ObjectStorage};
    use crate::error::ErrorKind;
    use crate::metadata::ObjectMetadataStore;
    use crate::objstore::testing::{repo_with, ORG};

    const META_BUCKET: &str = "dsapi-metadata";

    async fn setup() -> (Arc<SimulatedCloud>, Service) {
        let cloud = Arc::new(SimulatedCloud::for_tests());
        cloud.create_bucket(META_BUCKET).await.unwrap();
        let repo = Arc::new(repo_with(&cloud, Some("ds"), None));
        let service = Service::new(
            "tenantA",
            ORG,
            Arc::new(ObjectMetadataStore::new(cloud.clone(), META_BUCKET)),
            Arc::new(CloudAuditLog::new(cloud.clone(), Duration::from_secs(600))),
        )
        .with_provider("objstore", StorageProvider::with_attachments(repo))
        .with_log_retention(30);
        (cloud, service)
    }

    fn request(name: &str, derivative: bool) -> CreateDatasetRequest {
        CreateDatasetRequest {
            name: name.to_string(),
            data_storage: "objstore".to_string(),
            derivative,
            tags: vec![Tag::new("project", "x")],
            metadata: DatasetMetadata {
                created_by: "alice".to_string(),
                ..Default::default()
            },
        }
    }

    async fn wait_for_events(service: &Service, group: &str, id: &str, n: usize) -> Vec<LogEvent> {
        let ctx = RequestContext::new();
        for _ in 0..200 {
            let events = service.log_events(&ctx, group, id).await.unwrap();
            if events.len() >= n {
                return events;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} audit events", n);
    }

    #[tokio::test]
    async fn test_create_and_show() {
        let (cloud, service) = setup().await;
        let ctx = RequestContext::new();
        let created = service.create_dataset(&ctx, "grp", request("ds1", false)).await.unwrap();

        assert!(uuid::Uuid::parse_str(&created.id).is_ok());
        assert_eq!(created.repository, format!("ds-{}", created.id));
        assert_eq!(created.metadata.name, "ds1");
        assert_eq!(created.metadata.data_storage, "objstore");
        assert!(created.metadata.created_at.is_some());
        assert!(cloud.bucket_names().contains(&created.repository));

        let (retention, tags) = cloud.log_group_settings("grp").unwrap();
        assert_eq!(retention, Some(30));
        assert!(tags.contains(&Tag::new(TAG_ORG, ORG)));

        let shown = service.show_dataset(&ctx, &created.id).await.unwrap();
        assert_eq!(shown.repository.name, created.repository);
        assert!(shown.repository.tags.contains(&Tag::new(TAG_ID, created.id.as_str())));

        let events = wait_for_events(&service, "grp", &created.id, 1).await;
        let record: AuditRecord = serde_json::from_str(&events[0].message).unwrap();
        assert_eq!(record.action, AuditAction::DatasetCreate);
        assert_eq!(record.detail, created.repository);
    }

    #[tokio::test]
    async fn test_create_rolls_back_on_encryption_failure() {
        let (cloud, service) = setup().await;
        cloud.inject_fault("s3:PutBucketEncryption", "InternalError", 1);
        let ctx = RequestContext::new();

        let err = service.create_dataset(&ctx, "grp", request("ds1", false)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServiceUnavailable);
        assert_eq!(cloud.bucket_names(), vec![META_BUCKET.to_string()]);
        assert!(cloud.list_objects(META_BUCKET, "tenantA/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_rolls_back_when_log_stream_fails() {
        let (cloud, service) = setup().await;
        cloud.inject_fault("logs:CreateLogStream", "ServiceUnavailable", 1);
        let ctx = RequestContext::new();

        service.create_dataset(&ctx, "grp", request("ds1", false)).await.unwrap_err();
        assert_eq!(cloud.bucket_names(), vec![META_BUCKET.to_string()]);
        assert!(cloud.list_objects(META_BUCKET, "tenantA/").await.unwrap().is_empty());
        assert!(cloud.log_group_names().is_empty());
    }

    #[tokio::test]
    async fn test_create_validates_request() {
        let (_cloud, service) = setup().await;
        let ctx = RequestContext::new();

        let mut unknown = request("ds1", false);
        unknown.data_storage = "tape".to_string();
        let err = service.create_dataset(&ctx, "grp", unknown).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);

        let err = service.create_dataset(&ctx, "grp", request("", false)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);

        let mut implicit = request("ds1", false);
        implicit.data_storage.clear();
        let created = service.create_dataset(&ctx, "grp", implicit).await.unwrap();
        assert_eq!(created.metadata.data_storage, "objstore");
    }

    #[tokio::test]
    async fn test_update_only_touches_description() {
        let (_cloud, service) = setup().await;
        let ctx = RequestContext::new();
        let created = service.create_dataset(&ctx, "grp", request("ds1", false)).await.unwrap();

        let updated = service
            .update_dataset(
                &ctx,
                "grp",
                &created.id,
                UpdateDatasetRequest {
                    description: Some("genomes".to_string()),
                    modified_by: "bob".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.description, "genomes");
        assert_eq!(updated.modified_by, "bob");
        assert_eq!(updated.name, "ds1");
        assert_eq!(updated.created_by, "alice");
    }

    #[tokio::test]
    async fn test_promote_derivative_rewrites_policy() {
        let (cloud, service) = setup().await;
        let ctx = RequestContext::new();
        let created = service.create_dataset(&ctx, "grp", request("ds1", true)).await.unwrap();
        let before = cloud.call_count("iam:CreatePolicyVersion");

        let promoted = service
            .promote_dataset(&ctx, "grp", &created.id, PromoteDatasetRequest { modified_by: "carol".to_string() })
            .await
            .unwrap();
        assert!(!promoted.derivative);
        assert_eq!(promoted.finalized_by, "carol");
        assert_eq!(cloud.call_count("iam:CreatePolicyVersion"), before + 1);

        let err = service
            .promote_dataset(&ctx, "grp", &created.id, PromoteDatasetRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_delete_keeps_metadata_when_not_empty() {
        let (cloud, service) = setup().await;
        let ctx = RequestContext::new();
        let created = service.create_dataset(&ctx, "grp", request("ds1", false)).await.unwrap();
        cloud
            .put_object(&created.repository, "data.csv", Bytes::from_static(b"1,2"))
            .await
            .unwrap();

        let err = service.delete_dataset(&ctx, "grp", &created.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(service.show_dataset(&ctx, &created.id).await.is_ok());

        cloud.delete_object(&created.repository, "data.csv").await.unwrap();
        service.delete_dataset(&ctx, "grp", &created.id).await.unwrap();
        assert!(service.show_dataset(&ctx, &created.id).await.unwrap_err().is_not_found());
        assert!(!cloud.bucket_names().contains(&created.repository));
    }

    #[tokio::test]
    async fn test_users_and_instances_go_through_provider() {
        let (cloud, service) = setup().await;
        cloud.add_instance("i-0123");
        let ctx = RequestContext::new();
        let created = service.create_dataset(&ctx, "grp", request("ds1", false)).await.unwrap();

        let access = service.grant_access(&ctx, "grp", &created.id, "i-0123").await.unwrap();
        assert_eq!(access.get("i-0123").map(String::as_str), Some("instanceRole_i-0123"));
        assert_eq!(service.list_access(&ctx, &created.id).await.unwrap(), access);
        service.revoke_access(&ctx, "grp", &created.id, "i-0123").await.unwrap();
        assert!(service.list_access(&ctx, &created.id).await.unwrap().is_empty());

        assert!(service.list_users(&ctx, &created.id).await.unwrap_err().is_not_found());
        let user = service.create_user(&ctx, "grp", &created.id).await.unwrap();
        let users = service.list_users(&ctx, &created.id).await.unwrap();
        assert_eq!(
            users[&user.user].keys.get(&user.credentials.akid),
            Some(&AccessKeyStatus::Active)
        );
        service.delete_user(&ctx, "grp", &created.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_dataset_is_not_found() {
        let (_cloud, service) = setup().await;
        let ctx = RequestContext::new();
        let id = uuid::Uuid::new_v4().to_string();
        assert!(service.show_dataset(&ctx, &id).await.unwrap_err().is_not_found());
        assert!(service.list_access(&ctx, &id).await.unwrap_err().is_not_found());
        assert!(service.log_events(&ctx, "grp", &id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_attachments_require_capability() {
        let cloud = Arc::new(SimulatedCloud::for_tests());
        cloud.create_bucket(META_BUCKET).await.unwrap();
        let repo = Arc::new(repo_with(&cloud, None, None));
        let service = Service::new(
            "tenantA",
            ORG,
            Arc::new(ObjectMetadataStore::new(cloud.clone(), META_BUCKET)),
            Arc::new(CloudAuditLog::new(cloud.clone(), Duration::from_secs(600))),
        )
        .with_provider(
            "objstore",
            StorageProvider {
                data: repo,
                attachments: None,
            },
        );
        let ctx = RequestContext::new();
        let created = service.create_dataset(&ctx, "grp", request("ds1", false)).await.unwrap();
        assert_eq!(created.repository, created.id);

        let err = service
            .create_attachment(&ctx, "grp", &created.id, "a.txt", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
    }
}
