//! Capability interfaces a tenant's [`Service`](crate::service::Service) dispatches into.
//!
//! A data-storage type names a [`StorageProvider`]: the [`DataRepository`]
//! that owns containers, instance bindings and temporary users, plus an
//! optional [`AttachmentRepository`]. Metadata and audit logs are separate
//! plug-points shared by every storage type of a tenant.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::cloud::{AccessKeyStatus, LogEvent, Tag};
use crate::context::RequestContext;
use crate::error::Result;
use crate::metadata::DatasetMetadata;

/// `{instanceId: profileName}`
pub type AccessMap = BTreeMap<String, String>;

/// `{keyId: status}`
pub type KeyMap = BTreeMap<String, AccessKeyStatus>;

/// Name and tags of a provisioned container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryInfo {
    /// Container name
    pub name: String,
    /// Container tag set
    pub tags: Vec<Tag>,
}

/// A freshly issued access key pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Access key id
    pub akid: String,
    /// Secret access key
    pub secret: String,
}

/// Result of creating the temporary user triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedUser {
    /// Group name
    pub group: String,
    /// Policy name
    pub policy: String,
    /// User name
    pub user: String,
    /// Credentials of the first key
    pub credentials: Credentials,
}

/// Result of one key-rotation step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatedUser {
    /// Key states after the step
    pub keys: KeyMap,
    /// Credentials of a key minted by this step, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
}

/// Key listing of one temporary user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserKeys {
    /// Key states
    pub keys: KeyMap,
}

/// `{userName: {keys: {keyId: status}}}`
pub type UserMap = BTreeMap<String, UserKeys>;

/// One side-car file of a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// File name, without the reserved prefix
    pub name: String,
    /// Last modification time
    pub modified: DateTime<Utc>,
    /// Size in bytes
    pub size: u64,
    /// Short-lived retrieval URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Containers, instance access and temporary users of one storage type.
#[async_trait]
pub trait DataRepository: Send + Sync {
    /// Creates the dataset's container with every invariant in place.
    async fn provision(&self, ctx: &RequestContext, id: &str, derivative: bool, tags: &[Tag]) -> Result<String>;
    /// Reserved; currently only logged.
    async fn deprovision(&self, ctx: &RequestContext, id: &str) -> Result<()>;
    /// Deletes the (empty) container and its canonical policy.
    async fn delete(&self, ctx: &RequestContext, id: &str) -> Result<()>;
    /// Name and tags of the container.
    async fn describe(&self, ctx: &RequestContext, id: &str) -> Result<RepositoryInfo>;
    /// Rewrites the canonical policy for the given derivative flag.
    async fn set_policy(&self, ctx: &RequestContext, id: &str, derivative: bool) -> Result<()>;

    /// Binds a compute instance to the dataset.
    async fn grant_access(&self, ctx: &RequestContext, id: &str, instance_id: &str) -> Result<AccessMap>;
    /// Removes the dataset's policy from the instance's role.
    async fn revoke_access(&self, ctx: &RequestContext, id: &str, instance_id: &str) -> Result<()>;
    /// Instances currently bound to the dataset.
    async fn list_access(&self, ctx: &RequestContext, id: &str) -> Result<AccessMap>;

    /// Creates the temporary group, policy and user.
    async fn create_user(&self, ctx: &RequestContext, id: &str) -> Result<CreatedUser>;
    /// Removes the temporary group, policy and user.
    async fn delete_user(&self, ctx: &RequestContext, id: &str) -> Result<()>;
    /// Advances the key-rotation state machine by one step.
    async fn update_user(&self, ctx: &RequestContext, id: &str) -> Result<UpdatedUser>;
    /// Lists temporary users and their keys. `NotFound` if no group exists.
    async fn list_users(&self, ctx: &RequestContext, id: &str) -> Result<UserMap>;
}

/// Side-car files stored next to a dataset's data.
#[async_trait]
pub trait AttachmentRepository: Send + Sync {
    /// Stores a new attachment.
    async fn create_attachment(&self, ctx: &RequestContext, id: &str, name: &str, body: Bytes) -> Result<()>;
    /// Lists attachments, optionally with retrieval URLs.
    async fn list_attachments(&self, ctx: &RequestContext, id: &str, show_urls: bool) -> Result<Vec<Attachment>>;
    /// Deletes one attachment.
    async fn delete_attachment(&self, ctx: &RequestContext, id: &str, name: &str) -> Result<()>;
}

/// Dataset metadata records, keyed by `(account, id)`.
#[async_trait]
pub trait MetadataRepository: Send + Sync {
    /// Stores a new record, stamping creation and modification times.
    async fn create(&self, ctx: &RequestContext, account: &str, id: &str, metadata: DatasetMetadata) -> Result<DatasetMetadata>;
    /// Reads a record.
    async fn get(&self, ctx: &RequestContext, account: &str, id: &str) -> Result<DatasetMetadata>;
    /// Replaces the mutable fields of a record.
    async fn update(&self, ctx: &RequestContext, account: &str, id: &str, metadata: DatasetMetadata) -> Result<DatasetMetadata>;
    /// Finalizes a record; derivatives become originals.
    async fn promote(&self, ctx: &RequestContext, account: &str, id: &str, user: &str) -> Result<DatasetMetadata>;
    /// Deletes a record.
    async fn delete(&self, ctx: &RequestContext, account: &str, id: &str) -> Result<()>;
}

/// Append-only audit streams, one per `(group, dataset)`.
#[async_trait]
pub trait AuditLogRepository: Send + Sync {
    /// Creates the stream (and its group if needed) with retention and tags.
    async fn create_log(&self, ctx: &RequestContext, group: &str, stream: &str, retention_days: u32, tags: &[Tag]) -> Result<()>;
    /// Opens a write-only channel into the stream.
    fn log(&self, ctx: &RequestContext, group: &str, stream: &str) -> Result<mpsc::Sender<String>>;
    /// Reads the stream back, oldest first.
    async fn events(&self, ctx: &RequestContext, group: &str, stream: &str) -> Result<Vec<LogEvent>>;
}

/// The repositories registered for one data-storage type.
#[derive(Clone)]
pub struct StorageProvider {
    /// Containers, access and users
    pub data: Arc<dyn DataRepository>,
    /// Attachments, if the storage type supports them
    pub attachments: Option<Arc<dyn AttachmentRepository>>,
}

impl StorageProvider {
    /// A provider whose repository also stores attachments.
    pub fn with_attachments<R>(repo: Arc<R>) -> Self
    where
        R: DataRepository + AttachmentRepository + 'static,
    {
        Self {
            data: repo.clone(),
            attachments: Some(repo),
        }
    }
}
