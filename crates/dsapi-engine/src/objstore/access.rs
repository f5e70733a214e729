use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::ObjectStoreRepository;
use crate::cloud::{AssociationState, Instance, ProfileAssociation};
use crate::context::RequestContext;
use crate::error::{DsError, Result};
use crate::policy::assume_role_policy;
use crate::repository::AccessMap;
use crate::retry::{retry, RetryBudget, RetryError};
use crate::rollback::Rollback;

/// Profile name from an instance-profile ARN (`...:instance-profile/<path>/<name>`).
fn profile_name_from_arn(arn: &str) -> &str {
    arn.rsplit('/').next().unwrap_or(arn)
}

impl ObjectStoreRepository {
    async fn describe_single_instance(&self, ctx: &RequestContext, instance_id: &str) -> Result<Instance> {
        let mut found = ctx
            .call(self.compute.describe_instances(&[instance_id.to_string()]))
            .await
            .map_err(|e| match e {
                DsError::NotFound(m) => DsError::BadRequest(format!("instance {} not found: {}", instance_id, m)),
                other => other,
            })?;
        if found.len() != 1 {
            return Err(DsError::BadRequest(format!(
                "expected exactly one instance {}, found {}",
                instance_id,
                found.len()
            )));
        }
        Ok(found.remove(0))
    }

    async fn current_association(&self, ctx: &RequestContext, instance_id: &str) -> Result<Option<ProfileAssociation>> {
        let associations = ctx
            .call(self.compute.describe_profile_associations(instance_id))
            .await?;
        Ok(associations
            .into_iter()
            .find(|a| a.state == AssociationState::Associated))
    }

    pub(super) async fn grant(&self, ctx: &RequestContext, id: &str, instance_id: &str) -> Result<AccessMap> {
        info!(request_id = ctx.request_id(), dataset = id, instance = instance_id, "granting instance access");
        let mut rollback = Rollback::new(ctx);
        let result = self.grant_steps(ctx, &mut rollback, id, instance_id).await;
        rollback.finish(result).await
    }

    async fn grant_steps(
        &self,
        ctx: &RequestContext,
        rollback: &mut Rollback,
        id: &str,
        instance_id: &str,
    ) -> Result<AccessMap> {
        let policy_arn = self.canonical_policy_arn(ctx, id).await?;
        ctx.call(self.iam.get_policy(&policy_arn)).await.map_err(|e| match e {
            DsError::NotFound(_) => DsError::NotFound(format!("access policy of dataset {} not found", id)),
            other => other,
        })?;

        self.describe_single_instance(ctx, instance_id).await?;

        let role_name = Self::instance_role_name(instance_id);
        let path = self.iam_path();
        let role_exists = match ctx.call(self.iam.get_role(&role_name)).await {
            Ok(_) => true,
            Err(DsError::NotFound(_)) => false,
            Err(e) => return Err(e),
        };

        if !role_exists {
            ctx.call(self.iam.create_role(
                &role_name,
                &path,
                &assume_role_policy().to_json(),
                &format!("instance role for {}", instance_id),
                &[self.org_tag()],
            ))
            .await?;
            let iam = Arc::clone(&self.iam);
            let name = role_name.clone();
            rollback.push(format!("delete role {}", role_name), move |ctx| async move {
                ctx.call(iam.delete_role(&name)).await
            });
            debug!(role = %role_name, "instance role created");
        }

        let profile = match ctx.call(self.iam.get_instance_profile(&role_name)).await {
            Ok(profile) => profile,
            Err(DsError::NotFound(_)) => {
                let profile = ctx
                    .call(self.iam.create_instance_profile(&role_name, &path))
                    .await?;
                let iam = Arc::clone(&self.iam);
                let name = role_name.clone();
                rollback.push(format!("delete instance profile {}", role_name), move |ctx| async move {
                    ctx.call(iam.delete_instance_profile(&name)).await
                });
                debug!(profile = %profile.name, "instance profile created");
                profile
            }
            Err(e) => return Err(e),
        };

        if !profile.roles.iter().any(|r| r == &role_name) {
            ctx.call(self.iam.add_role_to_instance_profile(&role_name, &role_name))
                .await?;
            let iam = Arc::clone(&self.iam);
            let name = role_name.clone();
            rollback.push(format!("remove role from profile {}", role_name), move |ctx| async move {
                ctx.call(iam.remove_role_from_instance_profile(&name, &name)).await
            });
        }

        let already_attached: BTreeSet<String> = ctx
            .call(self.iam.list_attached_role_policies(&role_name))
            .await?
            .into_iter()
            .map(|p| p.arn)
            .collect();

        if !already_attached.contains(&policy_arn) {
            ctx.call(self.iam.attach_role_policy(&role_name, &policy_arn)).await?;
            let iam = Arc::clone(&self.iam);
            let (role, arn) = (role_name.clone(), policy_arn.clone());
            rollback.push(format!("detach {} from {}", policy_arn, role_name), move |ctx| async move {
                ctx.call(iam.detach_role_policy(&role, &arn)).await
            });
            debug!(role = %role_name, policy = %policy_arn, "dataset policy attached");
        }

        let current = self.current_association(ctx, instance_id).await?;
        match current {
            Some(assoc) if assoc.profile_arn == profile.arn => {
                debug!(instance = instance_id, profile = %profile.name, "instance already uses this profile");
            }
            Some(assoc) => {
                let old_profile = profile_name_from_arn(&assoc.profile_arn).to_string();
                self.migrate_policies(ctx, rollback, &old_profile, &role_name, &already_attached, &policy_arn)
                    .await?;

                let association_id = assoc.association_id.clone();
                self.with_association_retry(ctx, |ctx| {
                    let compute = Arc::clone(&self.compute);
                    let association_id = association_id.clone();
                    async move {
                        match ctx.call(compute.disassociate_profile(&association_id)).await {
                            Ok(()) | Err(DsError::NotFound(_)) => Ok(()),
                            Err(e) => Err(e),
                        }
                    }
                })
                .await?;
                info!(instance = instance_id, profile = %old_profile, "previous profile disassociated");

                let compute = Arc::clone(&self.compute);
                let budget = self.budgets.association;
                let (instance, old) = (instance_id.to_string(), old_profile.clone());
                rollback.push(format!("re-associate {} with {}", old_profile, instance_id), move |ctx| async move {
                    reassociate(&ctx, compute, budget, &instance, &old).await
                });

                self.associate(ctx, instance_id, &role_name).await?;
            }
            None => {
                self.associate(ctx, instance_id, &role_name).await?;
            }
        }

        info!(request_id = ctx.request_id(), dataset = id, instance = instance_id, role = %role_name, "instance access granted");
        let mut granted = AccessMap::new();
        granted.insert(instance_id.to_string(), role_name);
        Ok(granted)
    }

    /// Attaches every policy held by the roles of `old_profile` to `role`.
    async fn migrate_policies(
        &self,
        ctx: &RequestContext,
        rollback: &mut Rollback,
        old_profile: &str,
        role: &str,
        already_attached: &BTreeSet<String>,
        policy_arn: &str,
    ) -> Result<()> {
        let profile = ctx.call(self.iam.get_instance_profile(old_profile)).await?;
        let mut inherited = BTreeSet::new();
        for old_role in &profile.roles {
            for p in ctx.call(self.iam.list_attached_role_policies(old_role)).await? {
                if p.arn != policy_arn && !already_attached.contains(&p.arn) {
                    inherited.insert(p.arn);
                }
            }
        }

        let mut migrated = Vec::new();
        for arn in &inherited {
            if let Err(e) = ctx.call(self.iam.attach_role_policy(role, arn)).await {
                push_detach_all(rollback, Arc::clone(&self.iam), role, migrated);
                return Err(e);
            }
            migrated.push(arn.clone());
        }
        debug!(role, from = old_profile, count = migrated.len(), "policies migrated");
        push_detach_all(rollback, Arc::clone(&self.iam), role, migrated);
        Ok(())
    }

    async fn with_association_retry<F, Fut>(&self, ctx: &RequestContext, mut op: F) -> Result<()>
    where
        F: FnMut(RequestContext) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        retry(ctx, self.budgets.association, |_| {
            let fut = op(ctx.clone());
            async move { fut.await.map_err(RetryError::Transient) }
        })
        .await
    }

    async fn associate(&self, ctx: &RequestContext, instance_id: &str, profile: &str) -> Result<()> {
        self.with_association_retry(ctx, |ctx| {
            let compute = Arc::clone(&self.compute);
            let (instance, profile) = (instance_id.to_string(), profile.to_string());
            async move {
                ctx.call(compute.associate_profile(&instance, &profile)).await.map(|_| ())
            }
        })
        .await?;
        info!(instance = instance_id, profile, "profile associated");
        Ok(())
    }

    pub(super) async fn revoke(&self, ctx: &RequestContext, id: &str, instance_id: &str) -> Result<()> {
        let policy_arn = self.canonical_policy_arn(ctx, id).await?;
        let instance = self.describe_single_instance(ctx, instance_id).await?;
        let profile_arn = instance.profile_arn.ok_or_else(|| {
            DsError::BadRequest(format!("instance {} has no instance profile", instance_id))
        })?;
        let profile = ctx
            .call(self.iam.get_instance_profile(profile_name_from_arn(&profile_arn)))
            .await?;

        let mut found = false;
        let mut failures = Vec::new();
        for role in &profile.roles {
            let attached = match ctx.call(self.iam.list_attached_role_policies(role)).await {
                Ok(attached) => attached,
                Err(DsError::Cancelled) => return Err(DsError::Cancelled),
                Err(e) => {
                    warn!(role = %role, error = %e, "revoke: cannot list role policies");
                    failures.push(e.to_string());
                    continue;
                }
            };
            if !attached.iter().any(|p| p.arn == policy_arn) {
                continue;
            }
            found = true;
            match self.detach_role_policy_with_retry(ctx, role, &policy_arn).await {
                Ok(()) => debug!(role = %role, policy = %policy_arn, "dataset policy detached"),
                Err(DsError::Cancelled) => return Err(DsError::Cancelled),
                Err(e) => {
                    warn!(role = %role, error = %e, "revoke: detach failed");
                    failures.push(e.to_string());
                }
            }
        }

        if !failures.is_empty() {
            return Err(DsError::Internal(format!(
                "revoking access of {} to dataset {} partially failed: {}",
                instance_id,
                id,
                failures.join("; ")
            )));
        }
        if !found {
            return Err(DsError::BadRequest(format!(
                "instance {} does not have access to dataset {}",
                instance_id, id
            )));
        }
        info!(request_id = ctx.request_id(), dataset = id, instance = instance_id, "instance access revoked");
        Ok(())
    }

    pub(super) async fn bound_instances(&self, ctx: &RequestContext, id: &str) -> Result<AccessMap> {
        let policy_arn = self.canonical_policy_arn(ctx, id).await?;
        let entities = ctx
            .call(self.iam.list_entities_for_policy(&policy_arn, &self.iam_path()))
            .await
            .map_err(|e| match e {
                DsError::NotFound(_) => DsError::NotFound(format!("access policy of dataset {} not found", id)),
                other => other,
            })?;

        let mut bound = AccessMap::new();
        for role in &entities.roles {
            let profiles = match ctx.call(self.iam.list_instance_profiles_for_role(role)).await {
                Ok(p) => p,
                Err(DsError::Cancelled) => return Err(DsError::Cancelled),
                Err(e) => {
                    warn!(role = %role, error = %e, "list access: cannot list profiles");
                    continue;
                }
            };
            if profiles.is_empty() {
                debug!(role = %role, "list access: role has no profile");
            }
            for profile in profiles {
                let instances = match ctx.call(self.compute.describe_instances_by_profile(&profile.arn)).await {
                    Ok(i) => i,
                    Err(DsError::Cancelled) => return Err(DsError::Cancelled),
                    Err(e) => {
                        warn!(profile = %profile.name, error = %e, "list access: cannot describe instances");
                        continue;
                    }
                };
                if instances.is_empty() {
                    debug!(profile = %profile.name, "list access: profile has no instances");
                }
                for instance in instances {
                    bound.insert(instance.instance_id, profile.name.clone());
                }
            }
        }
        Ok(bound)
    }
}

fn push_detach_all(rollback: &mut Rollback, iam: Arc<dyn crate::cloud::IdentityService>, role: &str, arns: Vec<String>) {
    if arns.is_empty() {
        return;
    }
    let role = role.to_string();
    rollback.push(format!("detach {} migrated policies from {}", arns.len(), role), move |ctx| async move {
        let mut last = Ok(());
        for arn in &arns {
            if let Err(e) = ctx.call(iam.detach_role_policy(&role, arn)).await {
                warn!(role = %role, policy = %arn, error = %e, "cannot detach migrated policy");
                last = Err(e);
            }
        }
        last
    });
}

async fn reassociate(
    ctx: &RequestContext,
    compute: Arc<dyn crate::cloud::ComputeService>,
    budget: RetryBudget,
    instance: &str,
    profile: &str,
) -> Result<()> {
    retry(ctx, budget, |_| {
        let compute = Arc::clone(&compute);
        async move {
            if let Some(assoc) = ctx
                .call(compute.describe_profile_associations(instance))
                .await?
                .into_iter()
                .find(|a| a.state == AssociationState::Associated)
            {
                ctx.call(compute.disassociate_profile(&assoc.association_id)).await?;
            }
            ctx.call(compute.associate_profile(instance, profile))
                .await
                .map(|_| ())
                .map_err(RetryError::Transient)
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::cloud::memory::SimulatedCloud;
    use crate::cloud::{ComputeService, IdentityService};
    use crate::error::ErrorKind;
    use crate::repository::DataRepository;

    async fn prior_profile(cloud: &SimulatedCloud, instance: &str, profile: &str, policies: &[&str]) -> Vec<String> {
        cloud.add_instance(instance);
        cloud.create_role(profile, "/", "{}", "", &[]).await.unwrap();
        cloud.create_instance_profile(profile, "/").await.unwrap();
        cloud.add_role_to_instance_profile(profile, profile).await.unwrap();
        let mut arns = Vec::new();
        for p in policies {
            let created = cloud.create_policy(p, "/", "", "{}").await.unwrap();
            cloud.attach_role_policy(profile, &created.arn).await.unwrap();
            arns.push(created.arn);
        }
        cloud.associate_profile(instance, profile).await.unwrap();
        arns
    }

    async fn attached_arns(cloud: &SimulatedCloud, role: &str) -> BTreeSet<String> {
        cloud
            .list_attached_role_policies(role)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.arn)
            .collect()
    }

    async fn associated_profile(cloud: &SimulatedCloud, instance: &str) -> Option<String> {
        cloud.describe_instances(&[instance.to_string()]).await.unwrap()[0]
            .profile_arn
            .clone()
    }

    #[tokio::test]
    async fn test_grant_fresh_instance() {
        let (cloud, repo) = setup();
        let ctx = RequestContext::new();
        repo.provision(&ctx, "abc", false, &[]).await.unwrap();
        cloud.add_instance("i-1");

        let map = repo.grant_access(&ctx, "abc", "i-1").await.unwrap();
        assert_eq!(map.get("i-1").map(String::as_str), Some("instanceRole_i-1"));

        let policy = repo.canonical_policy_arn(&ctx, "abc").await.unwrap();
        assert!(attached_arns(&cloud, "instanceRole_i-1").await.contains(&policy));
        assert!(associated_profile(&cloud, "i-1").await.unwrap().ends_with("/instanceRole_i-1"));
    }

    #[tokio::test]
    async fn test_grant_swaps_profile_and_migrates_policies() {
        let (cloud, repo) = setup();
        let ctx = RequestContext::new();
        repo.provision(&ctx, "abc", true, &[]).await.unwrap();
        let prior = prior_profile(&cloud, "i-0123", "profOld", &["polX", "polY"]).await;

        repo.grant_access(&ctx, "abc", "i-0123").await.unwrap();

        let mut expected: BTreeSet<String> = prior.into_iter().collect();
        expected.insert(repo.canonical_policy_arn(&ctx, "abc").await.unwrap());
        assert_eq!(attached_arns(&cloud, "instanceRole_i-0123").await, expected);
        assert!(associated_profile(&cloud, "i-0123")
            .await
            .unwrap()
            .ends_with("/instanceRole_i-0123"));
    }

    #[tokio::test]
    async fn test_grant_twice_is_idempotent() {
        let (cloud, repo) = setup();
        let ctx = RequestContext::new();
        repo.provision(&ctx, "abc", false, &[]).await.unwrap();
        cloud.add_instance("i-1");
        repo.grant_access(&ctx, "abc", "i-1").await.unwrap();
        repo.grant_access(&ctx, "abc", "i-1").await.unwrap();
        assert_eq!(cloud.call_count("ec2:AssociateIamInstanceProfile"), 1);
    }

    #[tokio::test]
    async fn test_grant_second_dataset_reuses_role() {
        let (cloud, repo) = setup();
        let ctx = RequestContext::new();
        repo.provision(&ctx, "one", false, &[]).await.unwrap();
        repo.provision(&ctx, "two", false, &[]).await.unwrap();
        cloud.add_instance("i-1");
        repo.grant_access(&ctx, "one", "i-1").await.unwrap();
        repo.grant_access(&ctx, "two", "i-1").await.unwrap();
        assert_eq!(attached_arns(&cloud, "instanceRole_i-1").await.len(), 2);
        assert_eq!(cloud.role_names(), vec!["instanceRole_i-1"]);
    }

    #[tokio::test]
    async fn test_grant_without_policy_is_not_found() {
        let (cloud, repo) = setup();
        cloud.add_instance("i-1");
        let err = repo.grant_access(&RequestContext::new(), "missing", "i-1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_grant_unknown_instance_is_bad_request() {
        let (_cloud, repo) = setup();
        let ctx = RequestContext::new();
        repo.provision(&ctx, "abc", false, &[]).await.unwrap();
        let err = repo.grant_access(&ctx, "abc", "i-404").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
    }

    #[tokio::test]
    async fn test_failed_association_restores_previous_profile() {
        let (cloud, repo) = setup();
        let ctx = RequestContext::new();
        repo.provision(&ctx, "abc", false, &[]).await.unwrap();
        let prior = prior_profile(&cloud, "i-1", "profOld", &["polX"]).await;
        let before_calls = cloud.call_count("ec2:AssociateIamInstanceProfile");
        cloud.inject_fault("ec2:AssociateIamInstanceProfile", "InvalidParameterValue", 5);

        let err = repo.grant_access(&ctx, "abc", "i-1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
        assert_eq!(cloud.call_count("ec2:AssociateIamInstanceProfile"), before_calls + 6);

        assert!(associated_profile(&cloud, "i-1").await.unwrap().ends_with("/profOld"));
        assert_eq!(attached_arns(&cloud, "profOld").await, prior.into_iter().collect());
        assert!(cloud.role_names().iter().all(|r| r != "instanceRole_i-1"));
        assert!(cloud.profile_names().iter().all(|p| p != "instanceRole_i-1"));
    }

    #[tokio::test]
    async fn test_revoke_detaches_only_dataset_policy() {
        let (cloud, repo) = setup();
        let ctx = RequestContext::new();
        repo.provision(&ctx, "abc", false, &[]).await.unwrap();
        let prior = prior_profile(&cloud, "i-1", "profOld", &["polX"]).await;
        repo.grant_access(&ctx, "abc", "i-1").await.unwrap();

        repo.revoke_access(&ctx, "abc", "i-1").await.unwrap();
        assert_eq!(attached_arns(&cloud, "instanceRole_i-1").await, prior.into_iter().collect());
        assert!(cloud.role_names().contains(&"instanceRole_i-1".to_string()));
        assert!(associated_profile(&cloud, "i-1").await.unwrap().ends_with("/instanceRole_i-1"));

        let err = repo.revoke_access(&ctx, "abc", "i-1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
        assert!(err.message().contains("does not have access"));
    }

    #[tokio::test]
    async fn test_revoke_without_profile_is_bad_request() {
        let (cloud, repo) = setup();
        let ctx = RequestContext::new();
        repo.provision(&ctx, "abc", false, &[]).await.unwrap();
        cloud.add_instance("i-1");
        let err = repo.revoke_access(&ctx, "abc", "i-1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
    }

    #[tokio::test]
    async fn test_revoke_detach_failure_is_internal() {
        let (cloud, repo) = setup();
        let ctx = RequestContext::new();
        repo.provision(&ctx, "abc", false, &[]).await.unwrap();
        cloud.add_instance("i-1");
        repo.grant_access(&ctx, "abc", "i-1").await.unwrap();
        cloud.fail_always("iam:DetachRolePolicy", "ServiceFailure");

        let err = repo.revoke_access(&ctx, "abc", "i-1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[tokio::test]
    async fn test_list_access() {
        let (cloud, repo) = setup();
        let ctx = RequestContext::new();
        repo.provision(&ctx, "abc", false, &[]).await.unwrap();
        assert!(repo.list_access(&ctx, "abc").await.unwrap().is_empty());

        cloud.add_instance("i-1");
        cloud.add_instance("i-2");
        repo.grant_access(&ctx, "abc", "i-1").await.unwrap();
        repo.grant_access(&ctx, "abc", "i-2").await.unwrap();
        // a role still referencing the policy but without any instance
        cloud.create_role("orphan", "/spinup/acme/", "{}", "", &[]).await.unwrap();
        let arn = repo.canonical_policy_arn(&ctx, "abc").await.unwrap();
        cloud.attach_role_policy("orphan", &arn).await.unwrap();

        let map = repo.list_access(&ctx, "abc").await.unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["i-1"], "instanceRole_i-1");
        assert_eq!(map["i-2"], "instanceRole_i-2");
    }
}
