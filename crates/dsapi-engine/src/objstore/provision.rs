use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{ObjectStoreRepository, TAG_ID, TAG_NAME, TAG_ORG};
use crate::cloud::{PublicAccessBlock, SseAlgorithm, Tag};
use crate::context::RequestContext;
use crate::error::{DsError, Result};
use crate::policy::{container_policy, PolicyKind};
use crate::repository::RepositoryInfo;
use crate::retry::{retry, RetryError};
use crate::rollback::Rollback;

/// Most versions a managed policy may hold.
const MAX_POLICY_VERSIONS: usize = 5;

impl ObjectStoreRepository {
    /// Merges caller tags with the reserved ones; reserved keys always win.
    pub(super) fn container_tags(&self, id: &str, container: &str, extra: &[Tag]) -> Vec<Tag> {
        let reserved = [
            Tag::new(TAG_ID, id),
            Tag::new(TAG_NAME, container),
            Tag::new(TAG_ORG, self.settings.org.clone()),
        ];
        let reserved_keys: HashSet<&str> = reserved.iter().map(|t| t.key.as_str()).collect();
        let mut seen = HashSet::new();
        let mut tags: Vec<Tag> = extra
            .iter()
            .filter(|t| !reserved_keys.contains(t.key.as_str()))
            .filter(|t| seen.insert(t.key.clone()))
            .cloned()
            .collect();
        tags.extend(reserved);
        tags
    }

    pub(super) async fn provision_container(
        &self,
        ctx: &RequestContext,
        id: &str,
        derivative: bool,
        tags: &[Tag],
    ) -> Result<String> {
        let container = self.container_name(id);
        info!(request_id = ctx.request_id(), dataset = id, container = %container, "provisioning container");

        let mut rollback = Rollback::new(ctx);
        let result = self
            .provision_steps(ctx, &mut rollback, id, &container, derivative, tags)
            .await;
        rollback.finish(result).await
    }

    async fn provision_steps(
        &self,
        ctx: &RequestContext,
        rollback: &mut Rollback,
        id: &str,
        container: &str,
        derivative: bool,
        tags: &[Tag],
    ) -> Result<String> {
        match ctx.call(self.storage.head_bucket(container)).await {
            Ok(()) => return Err(DsError::Conflict(format!("container {} already exists", container))),
            Err(DsError::Forbidden(m)) => {
                return Err(DsError::Forbidden(format!("container {} is not accessible: {}", container, m)))
            }
            Err(DsError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        ctx.call(self.storage.create_bucket(container)).await?;
        let storage = Arc::clone(&self.storage);
        let name = container.to_string();
        rollback.push(format!("delete container {}", container), move |ctx| async move {
            ctx.call(storage.delete_bucket(&name)).await
        });
        debug!(container, "container created");

        retry(ctx, self.budgets.probe, |_| async move {
            match ctx.call(self.storage.head_bucket(container)).await {
                Ok(()) => Ok(()),
                Err(DsError::Cancelled) => Err(RetryError::Stop(DsError::Cancelled)),
                Err(e) => Err(RetryError::Transient(e)),
            }
        })
        .await
        .map_err(|e| match e {
            DsError::Cancelled => DsError::Cancelled,
            e => DsError::Internal(format!("container {} did not become available: {}", container, e)),
        })?;

        ctx.call(self.storage.put_public_access_block(container, PublicAccessBlock::all_blocked()))
            .await?;
        debug!(container, "public access blocked");

        ctx.call(self.storage.put_bucket_encryption(container, SseAlgorithm::Aes256))
            .await?;
        debug!(container, "default encryption enabled");

        let policy_name = Self::policy_name(container);
        let document = container_policy(PolicyKind::canonical(derivative), container).to_json();
        let policy = ctx
            .call(self.iam.create_policy(
                &policy_name,
                &self.iam_path(),
                &format!("access policy for dataset {}", id),
                &document,
            ))
            .await?;
        let iam = Arc::clone(&self.iam);
        let arn = policy.arn.clone();
        rollback.push(format!("delete policy {}", policy.name), move |ctx| async move {
            ctx.call(iam.delete_policy(&arn)).await
        });
        debug!(container, policy = %policy.arn, derivative, "canonical policy created");

        if let Some(target) = self.settings.logging_bucket.as_deref().filter(|b| !b.is_empty()) {
            ctx.call(self.storage.put_bucket_logging(container, target, &format!("{}/", container)))
                .await?;
            debug!(container, target, "access logging enabled");
        }

        let tags = self.container_tags(id, container, tags);
        ctx.call(self.storage.put_bucket_tagging(container, &tags)).await?;
        debug!(container, count = tags.len(), "tags applied");

        info!(request_id = ctx.request_id(), dataset = id, container, "container provisioned");
        Ok(container.to_string())
    }

    pub(super) async fn describe_container(&self, ctx: &RequestContext, id: &str) -> Result<RepositoryInfo> {
        let container = self.container_name(id);
        ctx.call(self.storage.head_bucket(&container)).await.map_err(|e| match e {
            DsError::NotFound(_) => DsError::NotFound(format!("container {} not found", container)),
            other => other,
        })?;
        let tags = match ctx.call(self.storage.get_bucket_tagging(&container)).await {
            Ok(tags) => tags,
            Err(DsError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        Ok(RepositoryInfo { name: container, tags })
    }

    pub(super) async fn rewrite_policy(&self, ctx: &RequestContext, id: &str, derivative: bool) -> Result<()> {
        let container = self.container_name(id);
        let arn = self.canonical_policy_arn(ctx, id).await?;

        let mut versions = ctx.call(self.iam.list_policy_versions(&arn)).await?;
        if versions.len() >= MAX_POLICY_VERSIONS {
            versions.sort_by_key(|v| v.created);
            if let Some(oldest) = versions.iter().find(|v| !v.is_default) {
                debug!(policy = %arn, version = %oldest.version_id, "pruning oldest policy version");
                ctx.call(self.iam.delete_policy_version(&arn, &oldest.version_id)).await?;
            }
        }

        let document = container_policy(PolicyKind::canonical(derivative), &container).to_json();
        let version = ctx
            .call(self.iam.create_policy_version(&arn, &document, true))
            .await?;
        info!(
            request_id = ctx.request_id(),
            dataset = id,
            policy = %arn,
            version = %version.version_id,
            derivative,
            "canonical policy rewritten"
        );
        Ok(())
    }

    pub(super) async fn delete_container(&self, ctx: &RequestContext, id: &str) -> Result<()> {
        let container = self.container_name(id);
        ctx.call(self.storage.delete_bucket(&container)).await?;
        info!(request_id = ctx.request_id(), dataset = id, container = %container, "container deleted");

        if let Err(e) = self.delete_canonical_policy(ctx, id).await {
            warn!(dataset = id, error = %e, "canonical policy cleanup failed");
        }
        Ok(())
    }

    async fn delete_canonical_policy(&self, ctx: &RequestContext, id: &str) -> Result<()> {
        let arn = self.canonical_policy_arn(ctx, id).await?;
        let entities = match ctx.call(self.iam.list_entities_for_policy(&arn, &self.iam_path())).await {
            Ok(entities) => entities,
            Err(DsError::NotFound(_)) => {
                debug!(policy = %arn, "canonical policy already gone");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        for role in &entities.roles {
            self.detach_role_policy_with_retry(ctx, role, &arn).await?;
        }
        for group in &entities.groups {
            self.detach_group_policy_with_retry(ctx, group, &arn).await?;
        }

        for version in ctx.call(self.iam.list_policy_versions(&arn)).await? {
            if !version.is_default {
                ctx.call(self.iam.delete_policy_version(&arn, &version.version_id)).await?;
            }
        }
        ctx.call(self.iam.delete_policy(&arn)).await?;
        debug!(policy = %arn, "canonical policy deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::cloud::{IdentityService, ObjectStorage};
    use crate::error::ErrorKind;
    use crate::policy::{Action, PolicyDocument};
    use crate::repository::DataRepository;
    use bytes::Bytes;

    fn tag_value<'a>(tags: &'a [Tag], key: &str) -> Option<&'a str> {
        tags.iter().find(|t| t.key == key).map(|t| t.value.as_str())
    }

    #[tokio::test]
    async fn test_provision_establishes_invariants() {
        let (cloud, repo) = setup();
        let ctx = RequestContext::new();
        let name = repo
            .provision(&ctx, "abc", false, &[Tag::new("project", "x"), Tag::new("ID", "spoofed")])
            .await
            .unwrap();
        assert_eq!(name, "ds-abc");

        assert!(cloud.get_public_access_block(&name).await.unwrap().is_fully_blocked());
        assert_eq!(cloud.get_bucket_encryption(&name).await.unwrap(), SseAlgorithm::Aes256);

        let tags = cloud.get_bucket_tagging(&name).await.unwrap();
        assert_eq!(tag_value(&tags, TAG_ID), Some("abc"));
        assert_eq!(tag_value(&tags, TAG_NAME), Some("ds-abc"));
        assert_eq!(tag_value(&tags, TAG_ORG), Some(ORG));
        assert_eq!(tag_value(&tags, "project"), Some("x"));
        assert_eq!(tags.iter().filter(|t| t.key == TAG_ID).count(), 1);
    }

    #[tokio::test]
    async fn test_provision_policy_matches_derivative_flag() {
        let (cloud, repo) = setup();
        let ctx = RequestContext::new();
        repo.provision(&ctx, "orig", false, &[]).await.unwrap();
        repo.provision(&ctx, "deriv", true, &[]).await.unwrap();

        let arn = repo.canonical_policy_arn(&ctx, "orig").await.unwrap();
        let doc = PolicyDocument::from_json(&cloud.get_policy_document(&arn).await.unwrap()).unwrap();
        assert_eq!(doc, container_policy(PolicyKind::Original, "ds-orig"));

        let arn = repo.canonical_policy_arn(&ctx, "deriv").await.unwrap();
        let doc = PolicyDocument::from_json(&cloud.get_policy_document(&arn).await.unwrap()).unwrap();
        assert_eq!(doc, container_policy(PolicyKind::Derivative, "ds-deriv"));
    }

    #[tokio::test]
    async fn test_existing_container_conflicts() {
        let (cloud, repo) = setup();
        cloud.create_bucket("ds-abc").await.unwrap();
        let err = repo.provision(&RequestContext::new(), "abc", false, &[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(cloud.bucket_names(), vec!["ds-abc"]);
    }

    #[tokio::test]
    async fn test_foreign_container_is_forbidden() {
        let (cloud, repo) = setup();
        cloud.add_foreign_bucket("ds-abc");
        let err = repo.provision(&RequestContext::new(), "abc", false, &[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        assert_eq!(cloud.call_count("s3:CreateBucket"), 0);
    }

    #[tokio::test]
    async fn test_every_failing_step_rolls_back_everything() {
        let steps = [
            ("s3:CreateBucket", "InternalError"),
            ("s3:PutPublicAccessBlock", "InternalError"),
            ("s3:PutBucketEncryption", "InternalError"),
            ("iam:CreatePolicy", "ServiceFailure"),
            ("s3:PutBucketLogging", "AccessDenied"),
            ("s3:PutBucketTagging", "InvalidTag"),
        ];
        for (op, code) in steps {
            let cloud = std::sync::Arc::new(crate::cloud::memory::SimulatedCloud::for_tests());
            cloud.create_bucket("logs").await.unwrap();
            let repo = repo_with(&cloud, Some("ds"), Some("logs"));
            cloud.inject_fault(op, code, 1);

            let res = repo.provision(&RequestContext::new(), "abc", true, &[]).await;
            assert!(res.is_err(), "{} should fail", op);
            assert_eq!(cloud.bucket_names(), vec!["logs"], "{} left a container", op);
            assert!(cloud.policy_arns().is_empty(), "{} left a policy", op);
        }
    }

    #[tokio::test]
    async fn test_probe_exhaustion_is_internal() {
        let (cloud, repo) = setup();
        // pre-check plus three probes
        cloud.inject_fault("s3:HeadBucket", "NotFound", 4);
        let err = repo.provision(&RequestContext::new(), "abc", false, &[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(cloud.bucket_names().is_empty());
    }

    #[tokio::test]
    async fn test_logging_bucket_prefix() {
        let cloud = std::sync::Arc::new(crate::cloud::memory::SimulatedCloud::for_tests());
        cloud.create_bucket("access-logs").await.unwrap();
        let repo = repo_with(&cloud, Some("ds"), Some("access-logs"));
        repo.provision(&RequestContext::new(), "abc", false, &[]).await.unwrap();
        assert_eq!(
            cloud.bucket_logging("ds-abc"),
            Some(("access-logs".to_string(), "ds-abc/".to_string()))
        );
    }

    #[tokio::test]
    async fn test_describe() {
        let (_cloud, repo) = setup();
        let ctx = RequestContext::new();
        repo.provision(&ctx, "abc", false, &[]).await.unwrap();
        let info = repo.describe(&ctx, "abc").await.unwrap();
        assert_eq!(info.name, "ds-abc");
        assert_eq!(tag_value(&info.tags, TAG_ID), Some("abc"));
        assert!(repo.describe(&ctx, "missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_set_policy_rewrites_and_prunes() {
        let (cloud, repo) = setup();
        let ctx = RequestContext::new();
        repo.provision(&ctx, "abc", true, &[]).await.unwrap();
        let arn = repo.canonical_policy_arn(&ctx, "abc").await.unwrap();

        for i in 0..6 {
            repo.set_policy(&ctx, "abc", i % 2 == 1).await.unwrap();
        }
        assert!(cloud.list_policy_versions(&arn).await.unwrap().len() <= 5);

        repo.set_policy(&ctx, "abc", false).await.unwrap();
        let doc = PolicyDocument::from_json(&cloud.get_policy_document(&arn).await.unwrap()).unwrap();
        assert!(!doc.allows(Action::PutObject, "arn:aws:s3:::ds-abc/*"));
    }

    #[tokio::test]
    async fn test_delete_container_and_policy() {
        let (cloud, repo) = setup();
        let ctx = RequestContext::new();
        repo.provision(&ctx, "abc", false, &[]).await.unwrap();
        repo.set_policy(&ctx, "abc", true).await.unwrap();
        let arn = repo.canonical_policy_arn(&ctx, "abc").await.unwrap();
        cloud.create_role("r", "/spinup/acme/", "{}", "", &[]).await.unwrap();
        cloud.attach_role_policy("r", &arn).await.unwrap();

        repo.delete(&ctx, "abc").await.unwrap();
        assert!(cloud.bucket_names().is_empty());
        assert!(cloud.policy_arns().is_empty());
        assert!(cloud.list_attached_role_policies("r").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_non_empty_conflicts() {
        let (cloud, repo) = setup();
        let ctx = RequestContext::new();
        repo.provision(&ctx, "abc", false, &[]).await.unwrap();
        cloud.put_object("ds-abc", "data.csv", Bytes::from_static(b"1,2")).await.unwrap();

        let err = repo.delete(&ctx, "abc").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.message().contains("BucketNotEmpty"));
        assert_eq!(cloud.policy_arns().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let (_cloud, repo) = setup();
        let err = repo.delete(&RequestContext::new(), "nope").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
