use std::sync::Arc;

use tracing::{debug, info};

use super::ObjectStoreRepository;
use crate::cloud::AccessKeyStatus;
use crate::context::RequestContext;
use crate::error::{DsError, Result};
use crate::policy::{container_policy, PolicyKind};
use crate::repository::{CreatedUser, Credentials, KeyMap, UpdatedUser, UserKeys, UserMap};
use crate::retry::{retry, RetryError};
use crate::rollback::Rollback;

/// Names of a dataset's temporary identity triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempNames {
    /// Group name
    pub group: String,
    /// User name
    pub user: String,
    /// Policy name
    pub policy: String,
}

impl TempNames {
    /// Names derived from the container name.
    pub fn for_container(container: &str) -> Self {
        Self {
            group: format!("{}-DsTmpGrp", container),
            user: format!("{}-DsTmpUsr", container),
            policy: format!("{}-DsTmpPlc", container),
        }
    }
}

impl ObjectStoreRepository {
    pub(super) async fn create_temp_user(&self, ctx: &RequestContext, id: &str) -> Result<CreatedUser> {
        let container = self.container_name(id);
        let names = TempNames::for_container(&container);
        info!(request_id = ctx.request_id(), dataset = id, user = %names.user, "creating temporary user");

        let mut rollback = Rollback::new(ctx);
        let result = self.create_temp_user_steps(ctx, &mut rollback, &container, &names).await;
        rollback.finish(result).await
    }

    async fn create_temp_user_steps(
        &self,
        ctx: &RequestContext,
        rollback: &mut Rollback,
        container: &str,
        names: &TempNames,
    ) -> Result<CreatedUser> {
        let path = self.iam_path();
        let document = container_policy(PolicyKind::Temporary, container).to_json();
        let policy = ctx
            .call(self.iam.create_policy(
                &names.policy,
                &path,
                &format!("temporary access to {}", container),
                &document,
            ))
            .await?;
        let iam = Arc::clone(&self.iam);
        let arn = policy.arn.clone();
        rollback.push(format!("delete policy {}", names.policy), move |ctx| async move {
            ctx.call(iam.delete_policy(&arn)).await
        });
        self.wait_queryable(ctx, "policy", || self.iam.get_policy(&policy.arn)).await?;

        ctx.call(self.iam.create_group(&names.group, &path)).await?;
        let iam = Arc::clone(&self.iam);
        let group = names.group.clone();
        rollback.push(format!("delete group {}", names.group), move |ctx| async move {
            ctx.call(iam.delete_group(&group)).await
        });

        ctx.call(self.iam.attach_group_policy(&names.group, &policy.arn)).await?;
        let iam = Arc::clone(&self.iam);
        let (group, arn) = (names.group.clone(), policy.arn.clone());
        rollback.push(format!("detach policy from {}", names.group), move |ctx| async move {
            ctx.call(iam.detach_group_policy(&group, &arn)).await
        });

        ctx.call(self.iam.create_user(&names.user, &path, &[self.org_tag()])).await?;
        let iam = Arc::clone(&self.iam);
        let user = names.user.clone();
        rollback.push(format!("delete user {}", names.user), move |ctx| async move {
            ctx.call(iam.delete_user(&user)).await
        });
        self.wait_queryable(ctx, "user", || self.iam.get_user(&names.user)).await?;

        let key = ctx.call(self.iam.create_access_key(&names.user)).await?;
        let iam = Arc::clone(&self.iam);
        let (user, key_id) = (names.user.clone(), key.access_key_id.clone());
        rollback.push(format!("delete access key of {}", names.user), move |ctx| async move {
            ctx.call(iam.delete_access_key(&user, &key_id)).await
        });

        ctx.call(self.iam.add_user_to_group(&names.group, &names.user)).await?;
        let iam = Arc::clone(&self.iam);
        let (group, user) = (names.group.clone(), names.user.clone());
        rollback.push(format!("remove {} from {}", names.user, names.group), move |ctx| async move {
            ctx.call(iam.remove_user_from_group(&group, &user)).await
        });

        info!(user = %names.user, group = %names.group, "temporary user created");
        Ok(CreatedUser {
            group: names.group.clone(),
            policy: names.policy.clone(),
            user: names.user.clone(),
            credentials: Credentials {
                akid: key.access_key_id,
                secret: key.secret_access_key,
            },
        })
    }

    /// Polls a freshly created identity until the identity service returns it.
    async fn wait_queryable<T, F, Fut>(&self, ctx: &RequestContext, what: &str, mut probe: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = crate::cloud::CloudResult<T>>,
    {
        retry(ctx, self.budgets.identity_wait, |attempt| {
            let fut = probe();
            async move {
                match ctx.call(fut).await {
                    Ok(_) => Ok(()),
                    Err(e @ DsError::NotFound(_)) => {
                        debug!(what, attempt, "identity not yet queryable");
                        Err(RetryError::Transient(e))
                    }
                    Err(e) => Err(RetryError::Stop(e)),
                }
            }
        })
        .await
    }

    pub(super) async fn delete_temp_user(&self, ctx: &RequestContext, id: &str) -> Result<()> {
        let container = self.container_name(id);
        let names = TempNames::for_container(&container);

        let group = ctx.call(self.iam.get_group(&names.group)).await?;
        for attached in ctx.call(self.iam.list_attached_group_policies(&names.group)).await? {
            self.detach_group_policy_with_retry(ctx, &names.group, &attached.arn).await?;
        }
        let policy_arn = self.policy_arn(ctx, &names.policy).await?;
        ctx.call(self.iam.delete_policy(&policy_arn)).await?;

        for member in &group.users {
            ctx.call(self.iam.remove_user_from_group(&names.group, member)).await?;
            if member == &names.user {
                for key in ctx.call(self.iam.list_access_keys(member)).await? {
                    ctx.call(self.iam.delete_access_key(member, &key.access_key_id)).await?;
                }
                ctx.call(self.iam.delete_user(member)).await?;
            }
        }
        ctx.call(self.iam.delete_group(&names.group)).await?;
        info!(request_id = ctx.request_id(), dataset = id, group = %names.group, "temporary user deleted");
        Ok(())
    }

    /// One step of the key-rotation state machine, keyed on (active, inactive):
    ///
    /// * no user yet: run the create protocol, which mints the first key
    /// * `(0, 0)` mint a key
    /// * `(1, 0)` mint a key and retire the previously active one
    /// * `(0, 1)` mint a key and retire it at once
    /// * `(1, 1)` retire the active key
    /// * `(0, 2)` `LimitExceeded`
    ///
    /// `(1, 0)` keeps the fresh key active. Retiring both keys here would put
    /// the user at `(0, 2)` after two calls, so the caller would never hold a
    /// usable rotated key and the third call would already be refused. With
    /// the fresh key active, four calls walk active, rotated, retired, refused.
    pub(super) async fn rotate_keys(&self, ctx: &RequestContext, id: &str) -> Result<UpdatedUser> {
        let user = TempNames::for_container(&self.container_name(id)).user;
        let keys = match ctx.call(self.iam.list_access_keys(&user)).await {
            Ok(keys) => keys,
            Err(DsError::NotFound(_)) => {
                debug!(user = %user, "no temporary user yet, creating one");
                let created = self.create_temp_user(ctx, id).await?;
                let keys = self.key_map(ctx, &created.user).await?;
                return Ok(UpdatedUser {
                    keys,
                    credentials: Some(created.credentials),
                });
            }
            Err(e) => return Err(e),
        };
        let active: Vec<String> = keys
            .iter()
            .filter(|k| k.status == AccessKeyStatus::Active)
            .map(|k| k.access_key_id.clone())
            .collect();
        let inactive = keys.len() - active.len();
        debug!(user = %user, active = active.len(), inactive, "rotating access keys");

        let credentials = match (active.len(), inactive) {
            (0, 0) => Some(self.mint_key(ctx, &user).await?),
            (1, 0) => {
                let fresh = self.mint_key(ctx, &user).await?;
                self.deactivate(ctx, &user, &active).await?;
                Some(fresh)
            }
            (0, 1) => {
                let fresh = self.mint_key(ctx, &user).await?;
                self.deactivate(ctx, &user, std::slice::from_ref(&fresh.akid)).await?;
                Some(fresh)
            }
            (1, 1) => {
                self.deactivate(ctx, &user, &active).await?;
                None
            }
            (a, i) => {
                return Err(DsError::LimitExceeded(format!(
                    "too many access keys for {} ({} active, {} inactive)",
                    user, a, i
                )))
            }
        };

        let keys = self.key_map(ctx, &user).await?;
        info!(request_id = ctx.request_id(), dataset = id, user = %user, minted = credentials.is_some(), "access keys rotated");
        Ok(UpdatedUser { keys, credentials })
    }

    async fn key_map(&self, ctx: &RequestContext, user: &str) -> Result<KeyMap> {
        Ok(ctx
            .call(self.iam.list_access_keys(user))
            .await?
            .into_iter()
            .map(|k| (k.access_key_id, k.status))
            .collect())
    }

    async fn mint_key(&self, ctx: &RequestContext, user: &str) -> Result<Credentials> {
        let key = ctx.call(self.iam.create_access_key(user)).await?;
        Ok(Credentials {
            akid: key.access_key_id,
            secret: key.secret_access_key,
        })
    }

    async fn deactivate(&self, ctx: &RequestContext, user: &str, key_ids: &[String]) -> Result<()> {
        for key_id in key_ids {
            ctx.call(self.iam.update_access_key(user, key_id, AccessKeyStatus::Inactive))
                .await?;
        }
        Ok(())
    }

    pub(super) async fn temp_users(&self, ctx: &RequestContext, id: &str) -> Result<UserMap> {
        let group_name = TempNames::for_container(&self.container_name(id)).group;
        let group = ctx.call(self.iam.get_group(&group_name)).await.map_err(|e| match e {
            DsError::NotFound(_) => DsError::NotFound(format!("no temporary users for dataset {}", id)),
            other => other,
        })?;

        let mut users = UserMap::new();
        for member in group.users {
            let keys = ctx
                .call(self.iam.list_access_keys(&member))
                .await?
                .into_iter()
                .map(|k| (k.access_key_id, k.status))
                .collect();
            users.insert(member, UserKeys { keys });
        }
        Ok(users)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::cloud::IdentityService;
    use crate::error::ErrorKind;
    use crate::policy::{Action, PolicyDocument};
    use crate::repository::DataRepository;

    fn statuses(keys: &KeyMap) -> Vec<AccessKeyStatus> {
        keys.values().copied().collect()
    }

    #[tokio::test]
    async fn test_create_user_builds_triple() {
        let (cloud, repo) = setup();
        let ctx = RequestContext::new();
        let created = repo.create_user(&ctx, "abc").await.unwrap();
        assert_eq!(created.group, "ds-abc-DsTmpGrp");
        assert_eq!(created.user, "ds-abc-DsTmpUsr");
        assert_eq!(created.policy, "ds-abc-DsTmpPlc");
        assert!(!created.credentials.secret.is_empty());

        let group = cloud.get_group(&created.group).await.unwrap();
        assert_eq!(group.users, vec![created.user.clone()]);
        let attached = cloud.list_attached_group_policies(&created.group).await.unwrap();
        assert_eq!(attached.len(), 1);
        let doc = PolicyDocument::from_json(&cloud.get_policy_document(&attached[0].arn).await.unwrap()).unwrap();
        assert!(doc.allows(Action::PutObject, "arn:aws:s3:::ds-abc/*"));
    }

    #[tokio::test]
    async fn test_create_user_failure_rolls_back() {
        let (cloud, repo) = setup();
        cloud.inject_fault("iam:AddUserToGroup", "ServiceFailure", 1);
        let err = repo.create_user(&RequestContext::new(), "abc").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServiceUnavailable);
        assert!(cloud.user_names().is_empty());
        assert!(cloud.group_names().is_empty());
        assert!(cloud.policy_arns().is_empty());
    }

    #[tokio::test]
    async fn test_create_user_waits_for_propagation() {
        let (cloud, repo) = setup();
        cloud.inject_fault("iam:GetUser", "NoSuchEntity", 2);
        repo.create_user(&RequestContext::new(), "abc").await.unwrap();
        assert_eq!(cloud.call_count("iam:GetUser"), 3);
    }

    #[tokio::test]
    async fn test_rotation_sequence() {
        let (cloud, repo) = setup();
        let ctx = RequestContext::new();

        let first = repo.update_user(&ctx, "abc").await.unwrap();
        assert_eq!(statuses(&first.keys), vec![AccessKeyStatus::Active]);
        let k1 = first.credentials.unwrap().akid;
        assert_eq!(cloud.group_names(), vec!["ds-abc-DsTmpGrp".to_string()]);

        let second = repo.update_user(&ctx, "abc").await.unwrap();
        let k2 = second.credentials.unwrap().akid;
        assert_eq!(second.keys[&k1], AccessKeyStatus::Inactive);
        assert_eq!(second.keys[&k2], AccessKeyStatus::Active);

        let third = repo.update_user(&ctx, "abc").await.unwrap();
        assert!(third.credentials.is_none());
        assert_eq!(statuses(&third.keys), vec![AccessKeyStatus::Inactive; 2]);

        let err = repo.update_user(&ctx, "abc").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LimitExceeded);
        assert_eq!(cloud.list_access_keys("ds-abc-DsTmpUsr").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_rotation_creates_missing_user() {
        let (cloud, repo) = setup();
        let ctx = RequestContext::new();
        let step = repo.update_user(&ctx, "abc").await.unwrap();
        let credentials = step.credentials.unwrap();
        assert_eq!(step.keys.len(), 1);
        assert_eq!(step.keys[&credentials.akid], AccessKeyStatus::Active);

        let group = cloud.get_group("ds-abc-DsTmpGrp").await.unwrap();
        assert_eq!(group.users, vec!["ds-abc-DsTmpUsr".to_string()]);
        assert_eq!(cloud.list_attached_group_policies("ds-abc-DsTmpGrp").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rotation_create_failure_rolls_back() {
        let (cloud, repo) = setup();
        cloud.inject_fault("iam:AddUserToGroup", "ServiceFailure", 1);
        let err = repo.update_user(&RequestContext::new(), "abc").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServiceUnavailable);
        assert!(cloud.user_names().is_empty());
        assert!(cloud.group_names().is_empty());
        assert!(cloud.policy_arns().is_empty());
    }

    #[tokio::test]
    async fn test_rotation_from_one_inactive() {
        let (cloud, repo) = setup();
        let ctx = RequestContext::new();
        cloud.create_user("ds-abc-DsTmpUsr", "/", &[]).await.unwrap();
        let old = cloud.create_access_key("ds-abc-DsTmpUsr").await.unwrap();
        cloud
            .update_access_key("ds-abc-DsTmpUsr", &old.access_key_id, AccessKeyStatus::Inactive)
            .await
            .unwrap();

        let step = repo.update_user(&ctx, "abc").await.unwrap();
        assert!(step.credentials.is_some());
        assert_eq!(statuses(&step.keys), vec![AccessKeyStatus::Inactive; 2]);
    }

    #[tokio::test]
    async fn test_at_most_one_active_key() {
        let (cloud, repo) = setup();
        let ctx = RequestContext::new();
        cloud.create_user("ds-abc-DsTmpUsr", "/", &[]).await.unwrap();
        for _ in 0..3 {
            let step = repo.update_user(&ctx, "abc").await.unwrap();
            let active = step.keys.values().filter(|s| **s == AccessKeyStatus::Active).count();
            assert!(active <= 1);
            assert!(step.keys.len() <= 2);
        }
    }

    #[tokio::test]
    async fn test_list_users() {
        let (_cloud, repo) = setup();
        let ctx = RequestContext::new();
        assert!(repo.list_users(&ctx, "abc").await.unwrap_err().is_not_found());

        let created = repo.create_user(&ctx, "abc").await.unwrap();
        let users = repo.list_users(&ctx, "abc").await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(
            users[&created.user].keys[&created.credentials.akid],
            AccessKeyStatus::Active
        );
    }

    #[tokio::test]
    async fn test_delete_user_removes_everything() {
        let (cloud, repo) = setup();
        let ctx = RequestContext::new();
        repo.create_user(&ctx, "abc").await.unwrap();
        repo.update_user(&ctx, "abc").await.unwrap();

        repo.delete_user(&ctx, "abc").await.unwrap();
        assert!(cloud.user_names().is_empty());
        assert!(cloud.group_names().is_empty());
        assert!(cloud.policy_arns().is_empty());
        assert!(repo.delete_user(&ctx, "abc").await.unwrap_err().is_not_found());
    }
}
