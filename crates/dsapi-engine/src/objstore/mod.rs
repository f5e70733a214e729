//! Object-storage implementation of the data and attachment repositories.
//!
//! One container per dataset, one canonical policy per container, one
//! `instanceRole_<instanceId>` role/profile pair per compute instance and one
//! temporary group/user/policy triple per dataset.

mod access;
mod attachments;
mod provision;
mod users;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::OnceCell;

use crate::cloud::{ComputeService, IdentityService, ObjectStorage, Tag};
use crate::context::RequestContext;
use crate::error::{DsError, Result};
use crate::repository::{
    AccessMap, Attachment, AttachmentRepository, CreatedUser, DataRepository, RepositoryInfo, UpdatedUser, UserMap,
};
use crate::retry::{retry, RetryBudget, RetryError};

pub use attachments::{ATTACHMENT_PREFIX, ATTACHMENT_URL_TTL, MAX_ATTACHMENT_SIZE};

/// Tag key carrying the dataset id.
pub const TAG_ID: &str = "ID";
/// Tag key carrying the container name.
pub const TAG_NAME: &str = "Name";
/// Tag key carrying the organization.
pub const TAG_ORG: &str = "spinup:org";

/// Retry budgets of the protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudgets {
    /// Container existence probe after creation
    pub probe: RetryBudget,
    /// Profile association and disassociation
    pub association: RetryBudget,
    /// Policy detach cascade
    pub detach: RetryBudget,
    /// Waiting for new identities to become queryable
    pub identity_wait: RetryBudget,
}

impl Default for RetryBudgets {
    fn default() -> Self {
        Self {
            probe: RetryBudget::new(3, Duration::from_millis(500)),
            association: RetryBudget::new(5, Duration::from_secs(2)),
            detach: RetryBudget::new(3, Duration::from_millis(500)),
            identity_wait: RetryBudget::new(5, Duration::from_millis(500)),
        }
    }
}

/// Deployment settings of an object-storage repository.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectStoreSettings {
    /// Organization tagged on every resource
    pub org: String,
    /// Optional container name prefix
    pub prefix: Option<String>,
    /// Optional container receiving server access logs
    pub logging_bucket: Option<String>,
}

/// Data and attachment repository backed by object storage plus identity and compute services.
pub struct ObjectStoreRepository {
    storage: Arc<dyn ObjectStorage>,
    iam: Arc<dyn IdentityService>,
    compute: Arc<dyn ComputeService>,
    settings: ObjectStoreSettings,
    budgets: RetryBudgets,
    account_id: OnceCell<String>,
}

impl ObjectStoreRepository {
    /// Creates a repository.
    pub fn new(
        storage: Arc<dyn ObjectStorage>,
        iam: Arc<dyn IdentityService>,
        compute: Arc<dyn ComputeService>,
        settings: ObjectStoreSettings,
    ) -> Self {
        Self {
            storage,
            iam,
            compute,
            settings,
            budgets: RetryBudgets::default(),
            account_id: OnceCell::new(),
        }
    }

    /// Replaces the retry budgets.
    pub fn with_budgets(mut self, budgets: RetryBudgets) -> Self {
        self.budgets = budgets;
        self
    }

    /// Container name of dataset `id`: `<prefix>-<id>`, or `<id>` without a prefix.
    pub fn container_name(&self, id: &str) -> String {
        match self.settings.prefix.as_deref() {
            Some(prefix) if !prefix.is_empty() => format!("{}-{}", prefix, id),
            _ => id.to_string(),
        }
    }

    /// IAM path every identity resource is created under.
    pub fn iam_path(&self) -> String {
        format!("/spinup/{}/", self.settings.org)
    }

    /// Name of the canonical policy of a container.
    pub fn policy_name(container: &str) -> String {
        format!("policy-{}", container)
    }

    /// Name of the role and profile bound to a compute instance.
    pub fn instance_role_name(instance_id: &str) -> String {
        format!("instanceRole_{}", instance_id)
    }

    async fn account_id(&self, ctx: &RequestContext) -> Result<&str> {
        self.account_id
            .get_or_try_init(|| async { ctx.call(self.iam.account_id()).await })
            .await
            .map(String::as_str)
    }

    async fn policy_arn(&self, ctx: &RequestContext, policy_name: &str) -> Result<String> {
        let account = self.account_id(ctx).await?;
        Ok(format!("arn:aws:iam::{}:policy{}{}", account, self.iam_path(), policy_name))
    }

    async fn canonical_policy_arn(&self, ctx: &RequestContext, id: &str) -> Result<String> {
        self.policy_arn(ctx, &Self::policy_name(&self.container_name(id))).await
    }

    fn org_tag(&self) -> Tag {
        Tag::new(TAG_ORG, self.settings.org.clone())
    }

    /// Detaches a policy from a role, tolerating an already-detached policy.
    async fn detach_role_policy_with_retry(&self, ctx: &RequestContext, role: &str, arn: &str) -> Result<()> {
        retry(ctx, self.budgets.detach, |_| async move {
            match ctx.call(self.iam.detach_role_policy(role, arn)).await {
                Ok(()) => Ok(()),
                Err(DsError::NotFound(_)) => Ok(()),
                Err(e) => Err(RetryError::Transient(e)),
            }
        })
        .await
    }

    /// Detaches a policy from a group, tolerating an already-detached policy.
    async fn detach_group_policy_with_retry(&self, ctx: &RequestContext, group: &str, arn: &str) -> Result<()> {
        retry(ctx, self.budgets.detach, |_| async move {
            match ctx.call(self.iam.detach_group_policy(group, arn)).await {
                Ok(()) => Ok(()),
                Err(DsError::NotFound(_)) => Ok(()),
                Err(e) => Err(RetryError::Transient(e)),
            }
        })
        .await
    }
}

#[async_trait]
impl DataRepository for ObjectStoreRepository {
    async fn provision(&self, ctx: &RequestContext, id: &str, derivative: bool, tags: &[Tag]) -> Result<String> {
        self.provision_container(ctx, id, derivative, tags).await
    }

    async fn deprovision(&self, ctx: &RequestContext, id: &str) -> Result<()> {
        tracing::info!(request_id = ctx.request_id(), dataset = id, "deprovision requested; nothing to do");
        Ok(())
    }

    async fn delete(&self, ctx: &RequestContext, id: &str) -> Result<()> {
        self.delete_container(ctx, id).await
    }

    async fn describe(&self, ctx: &RequestContext, id: &str) -> Result<RepositoryInfo> {
        self.describe_container(ctx, id).await
    }

    async fn set_policy(&self, ctx: &RequestContext, id: &str, derivative: bool) -> Result<()> {
        self.rewrite_policy(ctx, id, derivative).await
    }

    async fn grant_access(&self, ctx: &RequestContext, id: &str, instance_id: &str) -> Result<AccessMap> {
        self.grant(ctx, id, instance_id).await
    }

    async fn revoke_access(&self, ctx: &RequestContext, id: &str, instance_id: &str) -> Result<()> {
        self.revoke(ctx, id, instance_id).await
    }

    async fn list_access(&self, ctx: &RequestContext, id: &str) -> Result<AccessMap> {
        self.bound_instances(ctx, id).await
    }

    async fn create_user(&self, ctx: &RequestContext, id: &str) -> Result<CreatedUser> {
        self.create_temp_user(ctx, id).await
    }

    async fn delete_user(&self, ctx: &RequestContext, id: &str) -> Result<()> {
        self.delete_temp_user(ctx, id).await
    }

    async fn update_user(&self, ctx: &RequestContext, id: &str) -> Result<UpdatedUser> {
        self.rotate_keys(ctx, id).await
    }

    async fn list_users(&self, ctx: &RequestContext, id: &str) -> Result<UserMap> {
        self.temp_users(ctx, id).await
    }
}

#[async_trait]
impl AttachmentRepository for ObjectStoreRepository {
    async fn create_attachment(&self, ctx: &RequestContext, id: &str, name: &str, body: Bytes) -> Result<()> {
        self.put_attachment(ctx, id, name, body).await
    }

    async fn list_attachments(&self, ctx: &RequestContext, id: &str, show_urls: bool) -> Result<Vec<Attachment>> {
        self.attachments(ctx, id, show_urls).await
    }

    async fn delete_attachment(&self, ctx: &RequestContext, id: &str, name: &str) -> Result<()> {
        self.remove_attachment(ctx, id, name).await
    }
}
