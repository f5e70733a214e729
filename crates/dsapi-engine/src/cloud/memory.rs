//! In-process simulation of the cloud backends.
//!
//! [`SimulatedCloud`] implements object storage, identity, compute and log
//! services over a single mutex-guarded state. It reproduces the provider
//! behaviors the engine depends on: creating an already-owned container
//! succeeds silently, non-empty containers and attached policies refuse
//! deletion, users hold at most two access keys, policies hold at most five
//! versions, and an instance carries at most one profile association.
//!
//! Faults can be injected per operation name (`"s3:PutBucketEncryption"`,
//! `"ec2:AssociateIamInstanceProfile"`, ...) either for the next N calls or
//! permanently. Every call is recorded in order.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::debug;

use super::*;
use crate::presign::PresignSigner;

const MAX_ACCESS_KEYS: usize = 2;
const MAX_POLICY_VERSIONS: usize = 5;

#[derive(Debug)]
struct StoredObject {
    body: Bytes,
    last_modified: chrono::DateTime<Utc>,
}

#[derive(Debug, Default)]
struct BucketState {
    objects: BTreeMap<String, StoredObject>,
    public_access: PublicAccessBlock,
    encryption: Option<SseAlgorithm>,
    logging: Option<(String, String)>,
    tags: Vec<Tag>,
}

#[derive(Debug)]
struct PolicyState {
    policy: ManagedPolicy,
    versions: Vec<(PolicyVersion, String)>,
    next_version: u32,
}

#[derive(Debug)]
struct RoleState {
    role: Role,
    attached: BTreeSet<String>,
}

#[derive(Debug)]
struct GroupState {
    group: Group,
    path: String,
    users: BTreeSet<String>,
    attached: BTreeSet<String>,
}

#[derive(Debug)]
struct UserState {
    user: User,
    keys: Vec<(AccessKeyMetadata, String)>,
    groups: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct LogGroupState {
    retention_days: Option<u32>,
    tags: Vec<Tag>,
    streams: BTreeMap<String, Vec<LogEvent>>,
}

#[derive(Debug, Default)]
struct State {
    buckets: BTreeMap<String, BucketState>,
    foreign_buckets: HashSet<String>,

    policies: BTreeMap<String, PolicyState>,
    roles: BTreeMap<String, RoleState>,
    profiles: BTreeMap<String, InstanceProfile>,
    groups: BTreeMap<String, GroupState>,
    users: BTreeMap<String, UserState>,
    next_key: u64,

    instances: BTreeMap<String, String>,
    associations: BTreeMap<String, ProfileAssociation>,
    next_association: u64,

    log_groups: BTreeMap<String, LogGroupState>,
}

#[derive(Debug, Default)]
struct Faults {
    queued: HashMap<String, VecDeque<CloudError>>,
    always: HashMap<String, CloudError>,
}

/// In-memory implementation of every cloud backend trait.
pub struct SimulatedCloud {
    account_id: String,
    signer: PresignSigner,
    state: Mutex<State>,
    faults: Mutex<Faults>,
    calls: Mutex<Vec<String>>,
}

fn service_of(op: &str) -> &'static str {
    match op.split(':').next() {
        Some("s3") => "s3",
        Some("iam") => "iam",
        Some("ec2") => "ec2",
        Some("logs") => "logs",
        _ => "cloud",
    }
}

fn err(op: &str, code: &str, message: impl Into<String>) -> CloudError {
    CloudError::new(service_of(op), code, message)
}

impl SimulatedCloud {
    /// Creates a simulation for `account_id` signing URLs with `signer`.
    pub fn new(account_id: &str, signer: PresignSigner) -> Self {
        Self {
            account_id: account_id.to_string(),
            signer,
            state: Mutex::new(State::default()),
            faults: Mutex::new(Faults::default()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// A simulation with fixed test credentials.
    pub fn for_tests() -> Self {
        let signer = PresignSigner::new("us-east-1", "AKIDSIMULATED", "simulated-secret", None)
            .expect("static endpoint parses");
        Self::new("123456789012", signer)
    }

    /// The signer used for presigned URLs.
    pub fn signer(&self) -> &PresignSigner {
        &self.signer
    }

    /// Fails the next `times` calls of `op` with `code`.
    pub fn inject_fault(&self, op: &str, code: &str, times: usize) {
        let mut faults = self.faults.lock();
        let queue = faults.queued.entry(op.to_string()).or_default();
        for _ in 0..times {
            queue.push_back(err(op, code, "injected fault"));
        }
    }

    /// Fails every call of `op` with `code` until cleared.
    pub fn fail_always(&self, op: &str, code: &str) {
        self.faults.lock().always.insert(op.to_string(), err(op, code, "injected fault"));
    }

    /// Removes every injected fault.
    pub fn clear_faults(&self) {
        let mut faults = self.faults.lock();
        faults.queued.clear();
        faults.always.clear();
    }

    /// Operation names called so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Number of recorded calls of `op`.
    pub fn call_count(&self, op: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.as_str() == op).count()
    }

    /// Registers a container owned by somebody else.
    pub fn add_foreign_bucket(&self, bucket: &str) {
        self.state.lock().foreign_buckets.insert(bucket.to_string());
    }

    /// Registers a running compute instance.
    pub fn add_instance(&self, instance_id: &str) {
        self.state.lock().instances.insert(instance_id.to_string(), "running".to_string());
    }

    /// Names of existing containers.
    pub fn bucket_names(&self) -> Vec<String> {
        self.state.lock().buckets.keys().cloned().collect()
    }

    /// Logging target of a container, if enabled.
    pub fn bucket_logging(&self, bucket: &str) -> Option<(String, String)> {
        self.state.lock().buckets.get(bucket).and_then(|b| b.logging.clone())
    }

    /// ARNs of existing managed policies.
    pub fn policy_arns(&self) -> Vec<String> {
        self.state.lock().policies.keys().cloned().collect()
    }

    /// Names of existing roles.
    pub fn role_names(&self) -> Vec<String> {
        self.state.lock().roles.keys().cloned().collect()
    }

    /// Names of existing instance profiles.
    pub fn profile_names(&self) -> Vec<String> {
        self.state.lock().profiles.keys().cloned().collect()
    }

    /// Names of existing groups.
    pub fn group_names(&self) -> Vec<String> {
        self.state.lock().groups.keys().cloned().collect()
    }

    /// Names of existing users.
    pub fn user_names(&self) -> Vec<String> {
        self.state.lock().users.keys().cloned().collect()
    }

    /// Names of existing log groups.
    pub fn log_group_names(&self) -> Vec<String> {
        self.state.lock().log_groups.keys().cloned().collect()
    }

    /// Retention and tags of a log group.
    pub fn log_group_settings(&self, group: &str) -> Option<(Option<u32>, Vec<Tag>)> {
        self.state
            .lock()
            .log_groups
            .get(group)
            .map(|g| (g.retention_days, g.tags.clone()))
    }

    fn enter(&self, op: &str) -> CloudResult<()> {
        self.calls.lock().push(op.to_string());
        let mut faults = self.faults.lock();
        if let Some(e) = faults.always.get(op) {
            debug!(op, code = %e.code, "simulated fault (persistent)");
            return Err(e.clone());
        }
        if let Some(queue) = faults.queued.get_mut(op) {
            if let Some(e) = queue.pop_front() {
                debug!(op, code = %e.code, "simulated fault");
                return Err(e);
            }
        }
        Ok(())
    }

    fn arn(&self, kind: &str, path: &str, name: &str) -> String {
        format!("arn:aws:iam::{}:{}{}{}", self.account_id, kind, path, name)
    }

    fn bucket_mut<'a>(st: &'a mut State, op: &str, bucket: &str) -> CloudResult<&'a mut BucketState> {
        if st.foreign_buckets.contains(bucket) {
            return Err(err(op, "AccessDenied", format!("access denied to {}", bucket)));
        }
        st.buckets
            .get_mut(bucket)
            .ok_or_else(|| err(op, "NoSuchBucket", format!("bucket {} does not exist", bucket)))
    }

    fn no_entity(op: &str, what: &str, name: &str) -> CloudError {
        err(op, "NoSuchEntity", format!("the {} with name {} cannot be found", what, name))
    }

    fn policy_name_from_arn(arn: &str) -> String {
        arn.rsplit('/').next().unwrap_or(arn).to_string()
    }

    fn attached(st: &State, arns: &BTreeSet<String>) -> Vec<AttachedPolicy> {
        arns.iter()
            .map(|arn| AttachedPolicy {
                name: st
                    .policies
                    .get(arn)
                    .map(|p| p.policy.name.clone())
                    .unwrap_or_else(|| Self::policy_name_from_arn(arn)),
                arn: arn.clone(),
            })
            .collect()
    }

    fn associated_profile(st: &State, instance_id: &str) -> Option<String> {
        st.associations
            .values()
            .find(|a| a.instance_id == instance_id && a.state == AssociationState::Associated)
            .map(|a| a.profile_arn.clone())
    }

    fn instance(st: &State, instance_id: &str) -> Option<Instance> {
        st.instances.get(instance_id).map(|state| Instance {
            instance_id: instance_id.to_string(),
            state: state.clone(),
            profile_arn: Self::associated_profile(st, instance_id),
        })
    }
}

#[async_trait]
impl ObjectStorage for SimulatedCloud {
    async fn head_bucket(&self, bucket: &str) -> CloudResult<()> {
        let op = "s3:HeadBucket";
        self.enter(op)?;
        let st = self.state.lock();
        if st.foreign_buckets.contains(bucket) {
            return Err(err(op, "Forbidden", ""));
        }
        if st.buckets.contains_key(bucket) {
            Ok(())
        } else {
            Err(err(op, "NotFound", ""))
        }
    }

    async fn create_bucket(&self, bucket: &str) -> CloudResult<()> {
        let op = "s3:CreateBucket";
        self.enter(op)?;
        let mut st = self.state.lock();
        if st.foreign_buckets.contains(bucket) {
            return Err(err(op, "BucketAlreadyExists", format!("bucket {} is owned by another account", bucket)));
        }
        st.buckets.entry(bucket.to_string()).or_default();
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> CloudResult<()> {
        let op = "s3:DeleteBucket";
        self.enter(op)?;
        let mut st = self.state.lock();
        let b = Self::bucket_mut(&mut st, op, bucket)?;
        if !b.objects.is_empty() {
            return Err(err(op, "BucketNotEmpty", "The bucket you tried to delete is not empty"));
        }
        st.buckets.remove(bucket);
        Ok(())
    }

    async fn put_public_access_block(&self, bucket: &str, block: PublicAccessBlock) -> CloudResult<()> {
        let op = "s3:PutPublicAccessBlock";
        self.enter(op)?;
        let mut st = self.state.lock();
        Self::bucket_mut(&mut st, op, bucket)?.public_access = block;
        Ok(())
    }

    async fn get_public_access_block(&self, bucket: &str) -> CloudResult<PublicAccessBlock> {
        let op = "s3:GetPublicAccessBlock";
        self.enter(op)?;
        let mut st = self.state.lock();
        Ok(Self::bucket_mut(&mut st, op, bucket)?.public_access)
    }

    async fn put_bucket_encryption(&self, bucket: &str, algorithm: SseAlgorithm) -> CloudResult<()> {
        let op = "s3:PutBucketEncryption";
        self.enter(op)?;
        let mut st = self.state.lock();
        Self::bucket_mut(&mut st, op, bucket)?.encryption = Some(algorithm);
        Ok(())
    }

    async fn get_bucket_encryption(&self, bucket: &str) -> CloudResult<SseAlgorithm> {
        let op = "s3:GetBucketEncryption";
        self.enter(op)?;
        let mut st = self.state.lock();
        Self::bucket_mut(&mut st, op, bucket)?
            .encryption
            .ok_or_else(|| err(op, "ServerSideEncryptionConfigurationNotFoundError", "no encryption configured"))
    }

    async fn put_bucket_logging(&self, bucket: &str, target_bucket: &str, prefix: &str) -> CloudResult<()> {
        let op = "s3:PutBucketLogging";
        self.enter(op)?;
        let mut st = self.state.lock();
        if !st.buckets.contains_key(target_bucket) {
            return Err(err(op, "InvalidTargetBucketForLogging", format!("target bucket {} does not exist", target_bucket)));
        }
        Self::bucket_mut(&mut st, op, bucket)?.logging = Some((target_bucket.to_string(), prefix.to_string()));
        Ok(())
    }

    async fn put_bucket_tagging(&self, bucket: &str, tags: &[Tag]) -> CloudResult<()> {
        let op = "s3:PutBucketTagging";
        self.enter(op)?;
        let mut seen = HashSet::new();
        for t in tags {
            if !seen.insert(t.key.as_str()) {
                return Err(err(op, "InvalidTag", format!("duplicate tag key {}", t.key)));
            }
        }
        let mut st = self.state.lock();
        Self::bucket_mut(&mut st, op, bucket)?.tags = tags.to_vec();
        Ok(())
    }

    async fn get_bucket_tagging(&self, bucket: &str) -> CloudResult<Vec<Tag>> {
        let op = "s3:GetBucketTagging";
        self.enter(op)?;
        let mut st = self.state.lock();
        let b = Self::bucket_mut(&mut st, op, bucket)?;
        if b.tags.is_empty() {
            return Err(err(op, "NoSuchTagSet", "The TagSet does not exist"));
        }
        Ok(b.tags.clone())
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> CloudResult<()> {
        let op = "s3:PutObject";
        self.enter(op)?;
        let mut st = self.state.lock();
        Self::bucket_mut(&mut st, op, bucket)?.objects.insert(
            key.to_string(),
            StoredObject {
                body,
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> CloudResult<Bytes> {
        let op = "s3:GetObject";
        self.enter(op)?;
        let mut st = self.state.lock();
        Self::bucket_mut(&mut st, op, bucket)?
            .objects
            .get(key)
            .map(|o| o.body.clone())
            .ok_or_else(|| err(op, "NoSuchKey", format!("key {} does not exist", key)))
    }

    async fn head_object(&self, bucket: &str, key: &str) -> CloudResult<ObjectSummary> {
        let op = "s3:HeadObject";
        self.enter(op)?;
        let mut st = self.state.lock();
        Self::bucket_mut(&mut st, op, bucket)?
            .objects
            .get(key)
            .map(|o| ObjectSummary {
                key: key.to_string(),
                size: o.body.len() as u64,
                last_modified: o.last_modified,
            })
            .ok_or_else(|| err(op, "NotFound", ""))
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> CloudResult<Vec<ObjectSummary>> {
        let op = "s3:ListObjectsV2";
        self.enter(op)?;
        let mut st = self.state.lock();
        Ok(Self::bucket_mut(&mut st, op, bucket)?
            .objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, o)| ObjectSummary {
                key: k.clone(),
                size: o.body.len() as u64,
                last_modified: o.last_modified,
            })
            .collect())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> CloudResult<()> {
        let op = "s3:DeleteObject";
        self.enter(op)?;
        let mut st = self.state.lock();
        Self::bucket_mut(&mut st, op, bucket)?.objects.remove(key);
        Ok(())
    }

    async fn presign_get(&self, bucket: &str, key: &str, expires: Duration) -> CloudResult<String> {
        let op = "s3:PresignGetObject";
        self.enter(op)?;
        Ok(self.signer.presign_get(bucket, key, expires.as_secs(), Utc::now()))
    }
}

#[async_trait]
impl IdentityService for SimulatedCloud {
    async fn account_id(&self) -> CloudResult<String> {
        self.enter("sts:GetCallerIdentity")?;
        Ok(self.account_id.clone())
    }

    async fn create_policy(&self, name: &str, path: &str, _description: &str, document: &str) -> CloudResult<ManagedPolicy> {
        let op = "iam:CreatePolicy";
        self.enter(op)?;
        if serde_json::from_str::<serde_json::Value>(document).is_err() {
            return Err(err(op, "MalformedPolicyDocument", "policy document is not valid json"));
        }
        let arn = self.arn("policy", path, name);
        let mut st = self.state.lock();
        if st.policies.contains_key(&arn) {
            return Err(err(op, "EntityAlreadyExists", format!("a policy called {} already exists", name)));
        }
        let policy = ManagedPolicy {
            name: name.to_string(),
            arn: arn.clone(),
            path: path.to_string(),
            default_version: "v1".to_string(),
        };
        let version = PolicyVersion {
            version_id: "v1".to_string(),
            is_default: true,
            created: Utc::now(),
        };
        st.policies.insert(
            arn,
            PolicyState {
                policy: policy.clone(),
                versions: vec![(version, document.to_string())],
                next_version: 2,
            },
        );
        Ok(policy)
    }

    async fn get_policy(&self, arn: &str) -> CloudResult<ManagedPolicy> {
        let op = "iam:GetPolicy";
        self.enter(op)?;
        let st = self.state.lock();
        st.policies
            .get(arn)
            .map(|p| p.policy.clone())
            .ok_or_else(|| err(op, "NoSuchEntity", format!("policy {} was not found", arn)))
    }

    async fn get_policy_document(&self, arn: &str) -> CloudResult<String> {
        let op = "iam:GetPolicyVersion";
        self.enter(op)?;
        let st = self.state.lock();
        let p = st
            .policies
            .get(arn)
            .ok_or_else(|| err(op, "NoSuchEntity", format!("policy {} was not found", arn)))?;
        p.versions
            .iter()
            .find(|(v, _)| v.is_default)
            .map(|(_, doc)| doc.clone())
            .ok_or_else(|| err(op, "NoSuchEntity", "no default version"))
    }

    async fn delete_policy(&self, arn: &str) -> CloudResult<()> {
        let op = "iam:DeletePolicy";
        self.enter(op)?;
        let mut st = self.state.lock();
        let p = st
            .policies
            .get(arn)
            .ok_or_else(|| err(op, "NoSuchEntity", format!("policy {} was not found", arn)))?;
        let attached = st.roles.values().any(|r| r.attached.contains(arn))
            || st.groups.values().any(|g| g.attached.contains(arn));
        if attached {
            return Err(err(op, "DeleteConflict", "cannot delete a policy attached to entities"));
        }
        if p.versions.len() > 1 {
            return Err(err(op, "DeleteConflict", "cannot delete a policy with non-default versions"));
        }
        st.policies.remove(arn);
        Ok(())
    }

    async fn list_policy_versions(&self, arn: &str) -> CloudResult<Vec<PolicyVersion>> {
        let op = "iam:ListPolicyVersions";
        self.enter(op)?;
        let st = self.state.lock();
        st.policies
            .get(arn)
            .map(|p| p.versions.iter().map(|(v, _)| v.clone()).collect())
            .ok_or_else(|| err(op, "NoSuchEntity", format!("policy {} was not found", arn)))
    }

    async fn create_policy_version(&self, arn: &str, document: &str, set_as_default: bool) -> CloudResult<PolicyVersion> {
        let op = "iam:CreatePolicyVersion";
        self.enter(op)?;
        let mut st = self.state.lock();
        let p = st
            .policies
            .get_mut(arn)
            .ok_or_else(|| err(op, "NoSuchEntity", format!("policy {} was not found", arn)))?;
        if p.versions.len() >= MAX_POLICY_VERSIONS {
            return Err(err(op, "LimitExceeded", "a managed policy can have up to 5 versions"));
        }
        let version = PolicyVersion {
            version_id: format!("v{}", p.next_version),
            is_default: set_as_default,
            created: Utc::now(),
        };
        p.next_version += 1;
        if set_as_default {
            for (v, _) in p.versions.iter_mut() {
                v.is_default = false;
            }
            p.policy.default_version = version.version_id.clone();
        }
        p.versions.push((version.clone(), document.to_string()));
        Ok(version)
    }

    async fn delete_policy_version(&self, arn: &str, version_id: &str) -> CloudResult<()> {
        let op = "iam:DeletePolicyVersion";
        self.enter(op)?;
        let mut st = self.state.lock();
        let p = st
            .policies
            .get_mut(arn)
            .ok_or_else(|| err(op, "NoSuchEntity", format!("policy {} was not found", arn)))?;
        let idx = p
            .versions
            .iter()
            .position(|(v, _)| v.version_id == version_id)
            .ok_or_else(|| err(op, "NoSuchEntity", format!("version {} was not found", version_id)))?;
        if p.versions[idx].0.is_default {
            return Err(err(op, "DeleteConflict", "cannot delete the default version"));
        }
        p.versions.remove(idx);
        Ok(())
    }

    async fn list_entities_for_policy(&self, arn: &str, path_prefix: &str) -> CloudResult<PolicyEntities> {
        let op = "iam:ListEntitiesForPolicy";
        self.enter(op)?;
        let st = self.state.lock();
        if !st.policies.contains_key(arn) {
            return Err(err(op, "NoSuchEntity", format!("policy {} was not found", arn)));
        }
        Ok(PolicyEntities {
            roles: st
                .roles
                .values()
                .filter(|r| r.role.path.starts_with(path_prefix) && r.attached.contains(arn))
                .map(|r| r.role.name.clone())
                .collect(),
            groups: st
                .groups
                .values()
                .filter(|g| g.path.starts_with(path_prefix) && g.attached.contains(arn))
                .map(|g| g.group.name.clone())
                .collect(),
            users: Vec::new(),
        })
    }

    async fn get_role(&self, name: &str) -> CloudResult<Role> {
        let op = "iam:GetRole";
        self.enter(op)?;
        let st = self.state.lock();
        st.roles
            .get(name)
            .map(|r| r.role.clone())
            .ok_or_else(|| Self::no_entity(op, "role", name))
    }

    async fn create_role(&self, name: &str, path: &str, trust_policy: &str, _description: &str, _tags: &[Tag]) -> CloudResult<Role> {
        let op = "iam:CreateRole";
        self.enter(op)?;
        if serde_json::from_str::<serde_json::Value>(trust_policy).is_err() {
            return Err(err(op, "MalformedPolicyDocument", "trust policy is not valid json"));
        }
        let mut st = self.state.lock();
        if st.roles.contains_key(name) {
            return Err(err(op, "EntityAlreadyExists", format!("role with name {} already exists", name)));
        }
        let role = Role {
            name: name.to_string(),
            arn: self.arn("role", path, name),
            path: path.to_string(),
        };
        st.roles.insert(
            name.to_string(),
            RoleState {
                role: role.clone(),
                attached: BTreeSet::new(),
            },
        );
        Ok(role)
    }

    async fn delete_role(&self, name: &str) -> CloudResult<()> {
        let op = "iam:DeleteRole";
        self.enter(op)?;
        let mut st = self.state.lock();
        let r = st.roles.get(name).ok_or_else(|| Self::no_entity(op, "role", name))?;
        if !r.attached.is_empty() {
            return Err(err(op, "DeleteConflict", "cannot delete entity, must detach all policies first"));
        }
        if st.profiles.values().any(|p| p.roles.iter().any(|n| n == name)) {
            return Err(err(op, "DeleteConflict", "cannot delete entity, must remove roles from instance profile first"));
        }
        st.roles.remove(name);
        Ok(())
    }

    async fn attach_role_policy(&self, role: &str, policy_arn: &str) -> CloudResult<()> {
        let op = "iam:AttachRolePolicy";
        self.enter(op)?;
        let mut st = self.state.lock();
        if !st.policies.contains_key(policy_arn) {
            return Err(err(op, "NoSuchEntity", format!("policy {} does not exist", policy_arn)));
        }
        let r = st.roles.get_mut(role).ok_or_else(|| Self::no_entity(op, "role", role))?;
        r.attached.insert(policy_arn.to_string());
        Ok(())
    }

    async fn detach_role_policy(&self, role: &str, policy_arn: &str) -> CloudResult<()> {
        let op = "iam:DetachRolePolicy";
        self.enter(op)?;
        let mut st = self.state.lock();
        let r = st.roles.get_mut(role).ok_or_else(|| Self::no_entity(op, "role", role))?;
        if !r.attached.remove(policy_arn) {
            return Err(err(op, "NoSuchEntity", format!("policy {} is not attached to {}", policy_arn, role)));
        }
        Ok(())
    }

    async fn list_attached_role_policies(&self, role: &str) -> CloudResult<Vec<AttachedPolicy>> {
        let op = "iam:ListAttachedRolePolicies";
        self.enter(op)?;
        let st = self.state.lock();
        let r = st.roles.get(role).ok_or_else(|| Self::no_entity(op, "role", role))?;
        Ok(Self::attached(&st, &r.attached))
    }

    async fn create_instance_profile(&self, name: &str, path: &str) -> CloudResult<InstanceProfile> {
        let op = "iam:CreateInstanceProfile";
        self.enter(op)?;
        let mut st = self.state.lock();
        if st.profiles.contains_key(name) {
            return Err(err(op, "EntityAlreadyExists", format!("instance profile {} already exists", name)));
        }
        let profile = InstanceProfile {
            name: name.to_string(),
            arn: self.arn("instance-profile", path, name),
            roles: Vec::new(),
        };
        st.profiles.insert(name.to_string(), profile.clone());
        Ok(profile)
    }

    async fn get_instance_profile(&self, name: &str) -> CloudResult<InstanceProfile> {
        let op = "iam:GetInstanceProfile";
        self.enter(op)?;
        let st = self.state.lock();
        st.profiles
            .get(name)
            .cloned()
            .ok_or_else(|| Self::no_entity(op, "instance profile", name))
    }

    async fn delete_instance_profile(&self, name: &str) -> CloudResult<()> {
        let op = "iam:DeleteInstanceProfile";
        self.enter(op)?;
        let mut st = self.state.lock();
        let p = st.profiles.get(name).ok_or_else(|| Self::no_entity(op, "instance profile", name))?;
        if !p.roles.is_empty() {
            return Err(err(op, "DeleteConflict", "cannot delete entity, must remove roles from instance profile first"));
        }
        st.profiles.remove(name);
        Ok(())
    }

    async fn add_role_to_instance_profile(&self, profile: &str, role: &str) -> CloudResult<()> {
        let op = "iam:AddRoleToInstanceProfile";
        self.enter(op)?;
        let mut st = self.state.lock();
        if !st.roles.contains_key(role) {
            return Err(Self::no_entity(op, "role", role));
        }
        let p = st
            .profiles
            .get_mut(profile)
            .ok_or_else(|| Self::no_entity(op, "instance profile", profile))?;
        if !p.roles.is_empty() {
            return Err(err(op, "LimitExceeded", "cannot exceed quota for InstanceSessionsPerInstanceProfile: 1"));
        }
        p.roles.push(role.to_string());
        Ok(())
    }

    async fn remove_role_from_instance_profile(&self, profile: &str, role: &str) -> CloudResult<()> {
        let op = "iam:RemoveRoleFromInstanceProfile";
        self.enter(op)?;
        let mut st = self.state.lock();
        let p = st
            .profiles
            .get_mut(profile)
            .ok_or_else(|| Self::no_entity(op, "instance profile", profile))?;
        let before = p.roles.len();
        p.roles.retain(|r| r != role);
        if p.roles.len() == before {
            return Err(Self::no_entity(op, "role", role));
        }
        Ok(())
    }

    async fn list_instance_profiles_for_role(&self, role: &str) -> CloudResult<Vec<InstanceProfile>> {
        let op = "iam:ListInstanceProfilesForRole";
        self.enter(op)?;
        let st = self.state.lock();
        if !st.roles.contains_key(role) {
            return Err(Self::no_entity(op, "role", role));
        }
        Ok(st
            .profiles
            .values()
            .filter(|p| p.roles.iter().any(|r| r == role))
            .cloned()
            .collect())
    }

    async fn create_group(&self, name: &str, path: &str) -> CloudResult<Group> {
        let op = "iam:CreateGroup";
        self.enter(op)?;
        let mut st = self.state.lock();
        if st.groups.contains_key(name) {
            return Err(err(op, "EntityAlreadyExists", format!("group {} already exists", name)));
        }
        let group = Group {
            name: name.to_string(),
            arn: self.arn("group", path, name),
        };
        st.groups.insert(
            name.to_string(),
            GroupState {
                group: group.clone(),
                path: path.to_string(),
                users: BTreeSet::new(),
                attached: BTreeSet::new(),
            },
        );
        Ok(group)
    }

    async fn get_group(&self, name: &str) -> CloudResult<GroupDetail> {
        let op = "iam:GetGroup";
        self.enter(op)?;
        let st = self.state.lock();
        let g = st.groups.get(name).ok_or_else(|| Self::no_entity(op, "group", name))?;
        Ok(GroupDetail {
            group: g.group.clone(),
            users: g.users.iter().cloned().collect(),
        })
    }

    async fn delete_group(&self, name: &str) -> CloudResult<()> {
        let op = "iam:DeleteGroup";
        self.enter(op)?;
        let mut st = self.state.lock();
        let g = st.groups.get(name).ok_or_else(|| Self::no_entity(op, "group", name))?;
        if !g.users.is_empty() || !g.attached.is_empty() {
            return Err(err(op, "DeleteConflict", "cannot delete entity, must remove users and policies from group first"));
        }
        st.groups.remove(name);
        Ok(())
    }

    async fn attach_group_policy(&self, group: &str, policy_arn: &str) -> CloudResult<()> {
        let op = "iam:AttachGroupPolicy";
        self.enter(op)?;
        let mut st = self.state.lock();
        if !st.policies.contains_key(policy_arn) {
            return Err(err(op, "NoSuchEntity", format!("policy {} does not exist", policy_arn)));
        }
        let g = st.groups.get_mut(group).ok_or_else(|| Self::no_entity(op, "group", group))?;
        g.attached.insert(policy_arn.to_string());
        Ok(())
    }

    async fn detach_group_policy(&self, group: &str, policy_arn: &str) -> CloudResult<()> {
        let op = "iam:DetachGroupPolicy";
        self.enter(op)?;
        let mut st = self.state.lock();
        let g = st.groups.get_mut(group).ok_or_else(|| Self::no_entity(op, "group", group))?;
        if !g.attached.remove(policy_arn) {
            return Err(err(op, "NoSuchEntity", format!("policy {} is not attached to {}", policy_arn, group)));
        }
        Ok(())
    }

    async fn list_attached_group_policies(&self, group: &str) -> CloudResult<Vec<AttachedPolicy>> {
        let op = "iam:ListAttachedGroupPolicies";
        self.enter(op)?;
        let st = self.state.lock();
        let g = st.groups.get(group).ok_or_else(|| Self::no_entity(op, "group", group))?;
        Ok(Self::attached(&st, &g.attached))
    }

    async fn add_user_to_group(&self, group: &str, user: &str) -> CloudResult<()> {
        let op = "iam:AddUserToGroup";
        self.enter(op)?;
        let mut st = self.state.lock();
        if !st.groups.contains_key(group) {
            return Err(Self::no_entity(op, "group", group));
        }
        let u = st.users.get_mut(user).ok_or_else(|| Self::no_entity(op, "user", user))?;
        u.groups.insert(group.to_string());
        if let Some(g) = st.groups.get_mut(group) {
            g.users.insert(user.to_string());
        }
        Ok(())
    }

    async fn remove_user_from_group(&self, group: &str, user: &str) -> CloudResult<()> {
        let op = "iam:RemoveUserFromGroup";
        self.enter(op)?;
        let mut st = self.state.lock();
        let g = st.groups.get_mut(group).ok_or_else(|| Self::no_entity(op, "group", group))?;
        if !g.users.remove(user) {
            return Err(Self::no_entity(op, "user", user));
        }
        if let Some(u) = st.users.get_mut(user) {
            u.groups.remove(group);
        }
        Ok(())
    }

    async fn create_user(&self, name: &str, path: &str, _tags: &[Tag]) -> CloudResult<User> {
        let op = "iam:CreateUser";
        self.enter(op)?;
        let mut st = self.state.lock();
        if st.users.contains_key(name) {
            return Err(err(op, "EntityAlreadyExists", format!("user {} already exists", name)));
        }
        let user = User {
            name: name.to_string(),
            arn: self.arn("user", path, name),
        };
        st.users.insert(
            name.to_string(),
            UserState {
                user: user.clone(),
                keys: Vec::new(),
                groups: BTreeSet::new(),
            },
        );
        Ok(user)
    }

    async fn get_user(&self, name: &str) -> CloudResult<User> {
        let op = "iam:GetUser";
        self.enter(op)?;
        let st = self.state.lock();
        st.users
            .get(name)
            .map(|u| u.user.clone())
            .ok_or_else(|| Self::no_entity(op, "user", name))
    }

    async fn delete_user(&self, name: &str) -> CloudResult<()> {
        let op = "iam:DeleteUser";
        self.enter(op)?;
        let mut st = self.state.lock();
        let u = st.users.get(name).ok_or_else(|| Self::no_entity(op, "user", name))?;
        if !u.keys.is_empty() || !u.groups.is_empty() {
            return Err(err(op, "DeleteConflict", "cannot delete entity, must delete access keys and leave groups first"));
        }
        st.users.remove(name);
        Ok(())
    }

    async fn create_access_key(&self, user: &str) -> CloudResult<AccessKey> {
        let op = "iam:CreateAccessKey";
        self.enter(op)?;
        let mut st = self.state.lock();
        st.next_key += 1;
        let seq = st.next_key;
        let u = st.users.get_mut(user).ok_or_else(|| Self::no_entity(op, "user", user))?;
        if u.keys.len() >= MAX_ACCESS_KEYS {
            return Err(err(op, "LimitExceeded", "cannot exceed quota for AccessKeysPerUser: 2"));
        }
        let key = AccessKey {
            access_key_id: format!("AKIASIM{:013}", seq),
            secret_access_key: hex::encode(rand::random::<[u8; 20]>()),
            status: AccessKeyStatus::Active,
        };
        u.keys.push((
            AccessKeyMetadata {
                access_key_id: key.access_key_id.clone(),
                status: AccessKeyStatus::Active,
                created: Utc::now(),
            },
            key.secret_access_key.clone(),
        ));
        Ok(key)
    }

    async fn list_access_keys(&self, user: &str) -> CloudResult<Vec<AccessKeyMetadata>> {
        let op = "iam:ListAccessKeys";
        self.enter(op)?;
        let st = self.state.lock();
        let u = st.users.get(user).ok_or_else(|| Self::no_entity(op, "user", user))?;
        Ok(u.keys.iter().map(|(m, _)| m.clone()).collect())
    }

    async fn update_access_key(&self, user: &str, access_key_id: &str, status: AccessKeyStatus) -> CloudResult<()> {
        let op = "iam:UpdateAccessKey";
        self.enter(op)?;
        let mut st = self.state.lock();
        let u = st.users.get_mut(user).ok_or_else(|| Self::no_entity(op, "user", user))?;
        let k = u
            .keys
            .iter_mut()
            .find(|(m, _)| m.access_key_id == access_key_id)
            .ok_or_else(|| Self::no_entity(op, "access key", access_key_id))?;
        k.0.status = status;
        Ok(())
    }

    async fn delete_access_key(&self, user: &str, access_key_id: &str) -> CloudResult<()> {
        let op = "iam:DeleteAccessKey";
        self.enter(op)?;
        let mut st = self.state.lock();
        let u = st.users.get_mut(user).ok_or_else(|| Self::no_entity(op, "user", user))?;
        let before = u.keys.len();
        u.keys.retain(|(m, _)| m.access_key_id != access_key_id);
        if u.keys.len() == before {
            return Err(Self::no_entity(op, "access key", access_key_id));
        }
        Ok(())
    }
}

#[async_trait]
impl ComputeService for SimulatedCloud {
    async fn describe_instances(&self, instance_ids: &[String]) -> CloudResult<Vec<Instance>> {
        let op = "ec2:DescribeInstances";
        self.enter(op)?;
        let st = self.state.lock();
        let mut out = Vec::with_capacity(instance_ids.len());
        for id in instance_ids {
            match Self::instance(&st, id) {
                Some(i) => out.push(i),
                None => {
                    return Err(err(op, "InvalidInstanceID.NotFound", format!("the instance id '{}' does not exist", id)))
                }
            }
        }
        Ok(out)
    }

    async fn describe_instances_by_profile(&self, profile_arn: &str) -> CloudResult<Vec<Instance>> {
        let op = "ec2:DescribeInstances";
        self.enter(op)?;
        let st = self.state.lock();
        Ok(st
            .instances
            .keys()
            .filter_map(|id| Self::instance(&st, id))
            .filter(|i| i.profile_arn.as_deref() == Some(profile_arn))
            .collect())
    }

    async fn describe_profile_associations(&self, instance_id: &str) -> CloudResult<Vec<ProfileAssociation>> {
        let op = "ec2:DescribeIamInstanceProfileAssociations";
        self.enter(op)?;
        let st = self.state.lock();
        Ok(st
            .associations
            .values()
            .filter(|a| a.instance_id == instance_id && a.state == AssociationState::Associated)
            .cloned()
            .collect())
    }

    async fn associate_profile(&self, instance_id: &str, profile_name: &str) -> CloudResult<ProfileAssociation> {
        let op = "ec2:AssociateIamInstanceProfile";
        self.enter(op)?;
        let mut st = self.state.lock();
        if !st.instances.contains_key(instance_id) {
            return Err(err(op, "InvalidInstanceID.NotFound", format!("the instance id '{}' does not exist", instance_id)));
        }
        let profile = st
            .profiles
            .get(profile_name)
            .cloned()
            .ok_or_else(|| err(op, "InvalidParameterValue", format!("Value ({}) for parameter iamInstanceProfile.name is invalid", profile_name)))?;
        if profile.roles.is_empty() {
            return Err(err(op, "InvalidParameterValue", "instance profile has no role"));
        }
        if Self::associated_profile(&st, instance_id).is_some() {
            return Err(err(op, "IncorrectState", format!("there is an existing association for instance {}", instance_id)));
        }
        st.next_association += 1;
        let association = ProfileAssociation {
            association_id: format!("iip-assoc-{:017}", st.next_association),
            instance_id: instance_id.to_string(),
            profile_arn: profile.arn,
            state: AssociationState::Associated,
        };
        st.associations.insert(association.association_id.clone(), association.clone());
        Ok(association)
    }

    async fn disassociate_profile(&self, association_id: &str) -> CloudResult<()> {
        let op = "ec2:DisassociateIamInstanceProfile";
        self.enter(op)?;
        let mut st = self.state.lock();
        let a = st
            .associations
            .get_mut(association_id)
            .filter(|a| a.state == AssociationState::Associated)
            .ok_or_else(|| err(op, "InvalidAssociationID.NotFound", format!("association {} not found", association_id)))?;
        a.state = AssociationState::Disassociated;
        Ok(())
    }
}

#[async_trait]
impl LogService for SimulatedCloud {
    async fn create_log_group(&self, group: &str, tags: &[Tag]) -> CloudResult<()> {
        let op = "logs:CreateLogGroup";
        self.enter(op)?;
        let mut st = self.state.lock();
        if st.log_groups.contains_key(group) {
            return Err(err(op, "ResourceAlreadyExistsException", "the specified log group already exists"));
        }
        st.log_groups.insert(
            group.to_string(),
            LogGroupState {
                tags: tags.to_vec(),
                ..LogGroupState::default()
            },
        );
        Ok(())
    }

    async fn delete_log_group(&self, group: &str) -> CloudResult<()> {
        let op = "logs:DeleteLogGroup";
        self.enter(op)?;
        let mut st = self.state.lock();
        st.log_groups
            .remove(group)
            .map(|_| ())
            .ok_or_else(|| err(op, "ResourceNotFoundException", "the specified log group does not exist"))
    }

    async fn put_retention_policy(&self, group: &str, days: u32) -> CloudResult<()> {
        let op = "logs:PutRetentionPolicy";
        self.enter(op)?;
        let mut st = self.state.lock();
        let g = st
            .log_groups
            .get_mut(group)
            .ok_or_else(|| err(op, "ResourceNotFoundException", "the specified log group does not exist"))?;
        g.retention_days = Some(days);
        Ok(())
    }

    async fn create_log_stream(&self, group: &str, stream: &str) -> CloudResult<()> {
        let op = "logs:CreateLogStream";
        self.enter(op)?;
        let mut st = self.state.lock();
        let g = st
            .log_groups
            .get_mut(group)
            .ok_or_else(|| err(op, "ResourceNotFoundException", "the specified log group does not exist"))?;
        if g.streams.contains_key(stream) {
            return Err(err(op, "ResourceAlreadyExistsException", "the specified log stream already exists"));
        }
        g.streams.insert(stream.to_string(), Vec::new());
        Ok(())
    }

    async fn put_log_events(&self, group: &str, stream: &str, events: Vec<LogEvent>) -> CloudResult<()> {
        let op = "logs:PutLogEvents";
        self.enter(op)?;
        let mut st = self.state.lock();
        let s = st
            .log_groups
            .get_mut(group)
            .and_then(|g| g.streams.get_mut(stream))
            .ok_or_else(|| err(op, "ResourceNotFoundException", "the specified log stream does not exist"))?;
        s.extend(events);
        Ok(())
    }

    async fn get_log_events(&self, group: &str, stream: &str) -> CloudResult<Vec<LogEvent>> {
        let op = "logs:GetLogEvents";
        self.enter(op)?;
        let st = self.state.lock();
        st.log_groups
            .get(group)
            .and_then(|g| g.streams.get(stream))
            .cloned()
            .ok_or_else(|| err(op, "ResourceNotFoundException", "the specified log stream does not exist"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_owned_bucket_twice_succeeds() {
        let cloud = SimulatedCloud::for_tests();
        cloud.create_bucket("b").await.unwrap();
        cloud.create_bucket("b").await.unwrap();
        assert_eq!(cloud.bucket_names(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_head_bucket_codes() {
        let cloud = SimulatedCloud::for_tests();
        cloud.add_foreign_bucket("theirs");
        assert_eq!(cloud.head_bucket("missing").await.unwrap_err().code, "NotFound");
        assert_eq!(cloud.head_bucket("theirs").await.unwrap_err().code, "Forbidden");
    }

    #[tokio::test]
    async fn test_delete_non_empty_bucket_refused() {
        let cloud = SimulatedCloud::for_tests();
        cloud.create_bucket("b").await.unwrap();
        cloud.put_object("b", "k", Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(cloud.delete_bucket("b").await.unwrap_err().code, "BucketNotEmpty");
        cloud.delete_object("b", "k").await.unwrap();
        cloud.delete_bucket("b").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_objects_by_prefix() {
        let cloud = SimulatedCloud::for_tests();
        cloud.create_bucket("b").await.unwrap();
        for key in ["_attachments/a", "_attachments/b", "data/c"] {
            cloud.put_object("b", key, Bytes::from_static(b"12")).await.unwrap();
        }
        let listed = cloud.list_objects("b", "_attachments/").await.unwrap();
        let keys: Vec<_> = listed.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["_attachments/a", "_attachments/b"]);
        assert_eq!(listed[0].size, 2);
    }

    #[tokio::test]
    async fn test_injected_fault_is_one_shot() {
        let cloud = SimulatedCloud::for_tests();
        cloud.inject_fault("s3:CreateBucket", "InternalError", 1);
        assert_eq!(cloud.create_bucket("b").await.unwrap_err().code, "InternalError");
        cloud.create_bucket("b").await.unwrap();
        assert_eq!(cloud.call_count("s3:CreateBucket"), 2);
    }

    #[tokio::test]
    async fn test_access_key_quota() {
        let cloud = SimulatedCloud::for_tests();
        cloud.create_user("u", "/", &[]).await.unwrap();
        cloud.create_access_key("u").await.unwrap();
        cloud.create_access_key("u").await.unwrap();
        assert_eq!(cloud.create_access_key("u").await.unwrap_err().code, "LimitExceeded");
    }

    #[tokio::test]
    async fn test_policy_delete_requires_detach() {
        let cloud = SimulatedCloud::for_tests();
        let p = cloud.create_policy("p", "/x/", "", "{}").await.unwrap();
        assert_eq!(p.arn, "arn:aws:iam::123456789012:policy/x/p");
        cloud.create_role("r", "/x/", "{}", "", &[]).await.unwrap();
        cloud.attach_role_policy("r", &p.arn).await.unwrap();
        assert_eq!(cloud.delete_policy(&p.arn).await.unwrap_err().code, "DeleteConflict");
        cloud.detach_role_policy("r", &p.arn).await.unwrap();
        cloud.delete_policy(&p.arn).await.unwrap();
    }

    #[tokio::test]
    async fn test_single_association_per_instance() {
        let cloud = SimulatedCloud::for_tests();
        cloud.add_instance("i-1");
        cloud.create_role("r", "/", "{}", "", &[]).await.unwrap();
        let profile = cloud.create_instance_profile("p", "/").await.unwrap();
        cloud.add_role_to_instance_profile("p", "r").await.unwrap();
        let assoc = cloud.associate_profile("i-1", "p").await.unwrap();
        assert_eq!(
            cloud.associate_profile("i-1", "p").await.unwrap_err().code,
            "IncorrectState"
        );
        let instances = cloud.describe_instances_by_profile(&profile.arn).await.unwrap();
        assert_eq!(instances.len(), 1);
        cloud.disassociate_profile(&assoc.association_id).await.unwrap();
        let described = cloud.describe_instances(&["i-1".to_string()]).await.unwrap();
        assert_eq!(described[0].profile_arn, None);
    }

    #[tokio::test]
    async fn test_policy_versions_limit() {
        let cloud = SimulatedCloud::for_tests();
        let p = cloud.create_policy("p", "/", "", "{}").await.unwrap();
        for _ in 0..4 {
            cloud.create_policy_version(&p.arn, "{\"a\":1}", true).await.unwrap();
        }
        assert_eq!(
            cloud.create_policy_version(&p.arn, "{}", true).await.unwrap_err().code,
            "LimitExceeded"
        );
        assert_eq!(cloud.get_policy(&p.arn).await.unwrap().default_version, "v5");
        assert_eq!(cloud.get_policy_document(&p.arn).await.unwrap(), "{\"a\":1}");
    }
}
