//! Interfaces of the cloud backends the engine drives.
//!
//! The engine never talks to a provider SDK directly: it consumes the four
//! traits below (object storage, identity, compute, log service). Every call
//! returns a [`CloudError`] carrying the provider's opaque error code, which
//! the engine classifies.
//!
//! [`memory::SimulatedCloud`] implements all four in-process.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CloudError;

/// Result alias for backend calls.
pub type CloudResult<T> = std::result::Result<T, CloudError>;

/// A key/value tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    /// Tag key
    #[serde(alias = "Key")]
    pub key: String,
    /// Tag value
    #[serde(alias = "Value")]
    pub value: String,
}

impl Tag {
    /// Creates a tag.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// The four public-access switches of a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicAccessBlock {
    /// Reject public ACLs on writes
    pub block_public_acls: bool,
    /// Ignore existing public ACLs
    pub ignore_public_acls: bool,
    /// Reject public container policies
    pub block_public_policy: bool,
    /// Restrict access under public policies to the owner
    pub restrict_public_buckets: bool,
}

impl PublicAccessBlock {
    /// Every switch on.
    pub fn all_blocked() -> Self {
        Self {
            block_public_acls: true,
            ignore_public_acls: true,
            block_public_policy: true,
            restrict_public_buckets: true,
        }
    }

    /// True if all four switches are on.
    pub fn is_fully_blocked(&self) -> bool {
        self.block_public_acls
            && self.ignore_public_acls
            && self.block_public_policy
            && self.restrict_public_buckets
    }
}

/// Default server-side encryption algorithm of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SseAlgorithm {
    /// Symmetric AES-256 managed by the storage service
    Aes256,
    /// Key-management-service managed key
    Kms,
}

/// Metadata of a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    /// Object key
    pub key: String,
    /// Size in bytes
    pub size: u64,
    /// Last modification time
    pub last_modified: DateTime<Utc>,
}

/// Object storage operations.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Succeeds if the container exists and is reachable by the caller.
    async fn head_bucket(&self, bucket: &str) -> CloudResult<()>;
    /// Creates a container.
    async fn create_bucket(&self, bucket: &str) -> CloudResult<()>;
    /// Deletes an empty container.
    async fn delete_bucket(&self, bucket: &str) -> CloudResult<()>;
    /// Sets the public-access switches.
    async fn put_public_access_block(&self, bucket: &str, block: PublicAccessBlock) -> CloudResult<()>;
    /// Reads the public-access switches.
    async fn get_public_access_block(&self, bucket: &str) -> CloudResult<PublicAccessBlock>;
    /// Sets default server-side encryption.
    async fn put_bucket_encryption(&self, bucket: &str, algorithm: SseAlgorithm) -> CloudResult<()>;
    /// Reads default server-side encryption.
    async fn get_bucket_encryption(&self, bucket: &str) -> CloudResult<SseAlgorithm>;
    /// Enables server access logging into `target_bucket` under `prefix`.
    async fn put_bucket_logging(&self, bucket: &str, target_bucket: &str, prefix: &str) -> CloudResult<()>;
    /// Replaces the container tag set.
    async fn put_bucket_tagging(&self, bucket: &str, tags: &[Tag]) -> CloudResult<()>;
    /// Reads the container tag set.
    async fn get_bucket_tagging(&self, bucket: &str) -> CloudResult<Vec<Tag>>;
    /// Stores an object.
    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> CloudResult<()>;
    /// Reads an object.
    async fn get_object(&self, bucket: &str, key: &str) -> CloudResult<Bytes>;
    /// Reads object metadata.
    async fn head_object(&self, bucket: &str, key: &str) -> CloudResult<ObjectSummary>;
    /// Lists objects whose key starts with `prefix`, in key order.
    async fn list_objects(&self, bucket: &str, prefix: &str) -> CloudResult<Vec<ObjectSummary>>;
    /// Deletes an object.
    async fn delete_object(&self, bucket: &str, key: &str) -> CloudResult<()>;
    /// Produces a pre-signed retrieval URL valid for `expires`.
    async fn presign_get(&self, bucket: &str, key: &str, expires: Duration) -> CloudResult<String>;
}

/// A managed authorization policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedPolicy {
    /// Policy name
    pub name: String,
    /// Policy ARN
    pub arn: String,
    /// IAM path
    pub path: String,
    /// Id of the default version
    pub default_version: String,
}

/// One version of a managed policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyVersion {
    /// Version id, e.g. `v2`
    pub version_id: String,
    /// Whether this version is in force
    pub is_default: bool,
    /// Creation time, for pruning the oldest version
    pub created: DateTime<Utc>,
}

/// A policy attached to a role or group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttachedPolicy {
    /// Policy name
    pub name: String,
    /// Policy ARN
    pub arn: String,
}

/// Principals a policy is attached to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyEntities {
    /// Role names
    pub roles: Vec<String>,
    /// Group names
    pub groups: Vec<String>,
    /// User names
    pub users: Vec<String>,
}

/// An identity role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Role {
    /// Role name
    pub name: String,
    /// Role ARN
    pub arn: String,
    /// IAM path
    pub path: String,
}

/// An identity profile wrapping roles for a compute instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceProfile {
    /// Profile name
    pub name: String,
    /// Profile ARN
    pub arn: String,
    /// Names of the roles in the profile
    pub roles: Vec<String>,
}

/// A user group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    /// Group name
    pub name: String,
    /// Group ARN
    pub arn: String,
}

/// A group and its members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupDetail {
    /// The group
    pub group: Group,
    /// Member user names
    pub users: Vec<String>,
}

/// A human identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    /// User name
    pub name: String,
    /// User ARN
    pub arn: String,
}

/// State of an access key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessKeyStatus {
    /// Usable
    Active,
    /// Retired but still present
    Inactive,
}

impl AccessKeyStatus {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessKeyStatus::Active => "Active",
            AccessKeyStatus::Inactive => "Inactive",
        }
    }
}

/// A freshly created access key, including its secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessKey {
    /// Access key id
    pub access_key_id: String,
    /// Secret, only returned at creation
    pub secret_access_key: String,
    /// Initial status
    pub status: AccessKeyStatus,
}

/// Access key listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessKeyMetadata {
    /// Access key id
    pub access_key_id: String,
    /// Status
    pub status: AccessKeyStatus,
    /// Creation time
    pub created: DateTime<Utc>,
}

/// Identity (roles, profiles, policies, users, groups) operations.
#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Account number used to build ARNs.
    async fn account_id(&self) -> CloudResult<String>;

    /// Creates a managed policy.
    async fn create_policy(&self, name: &str, path: &str, description: &str, document: &str) -> CloudResult<ManagedPolicy>;
    /// Reads a managed policy.
    async fn get_policy(&self, arn: &str) -> CloudResult<ManagedPolicy>;
    /// Reads the document of the default version.
    async fn get_policy_document(&self, arn: &str) -> CloudResult<String>;
    /// Deletes a managed policy that has no attachments and no extra versions.
    async fn delete_policy(&self, arn: &str) -> CloudResult<()>;
    /// Lists versions of a policy.
    async fn list_policy_versions(&self, arn: &str) -> CloudResult<Vec<PolicyVersion>>;
    /// Adds a version, optionally making it the default.
    async fn create_policy_version(&self, arn: &str, document: &str, set_as_default: bool) -> CloudResult<PolicyVersion>;
    /// Deletes a non-default version.
    async fn delete_policy_version(&self, arn: &str, version_id: &str) -> CloudResult<()>;
    /// Lists principals a policy is attached to, restricted to `path_prefix`.
    async fn list_entities_for_policy(&self, arn: &str, path_prefix: &str) -> CloudResult<PolicyEntities>;

    /// Reads a role.
    async fn get_role(&self, name: &str) -> CloudResult<Role>;
    /// Creates a role with a trust policy.
    async fn create_role(&self, name: &str, path: &str, trust_policy: &str, description: &str, tags: &[Tag]) -> CloudResult<Role>;
    /// Deletes a role with no attachments and no profile memberships.
    async fn delete_role(&self, name: &str) -> CloudResult<()>;
    /// Attaches a managed policy to a role.
    async fn attach_role_policy(&self, role: &str, policy_arn: &str) -> CloudResult<()>;
    /// Detaches a managed policy from a role.
    async fn detach_role_policy(&self, role: &str, policy_arn: &str) -> CloudResult<()>;
    /// Lists managed policies attached to a role.
    async fn list_attached_role_policies(&self, role: &str) -> CloudResult<Vec<AttachedPolicy>>;

    /// Creates an instance profile.
    async fn create_instance_profile(&self, name: &str, path: &str) -> CloudResult<InstanceProfile>;
    /// Reads an instance profile.
    async fn get_instance_profile(&self, name: &str) -> CloudResult<InstanceProfile>;
    /// Deletes an empty instance profile.
    async fn delete_instance_profile(&self, name: &str) -> CloudResult<()>;
    /// Puts a role into a profile.
    async fn add_role_to_instance_profile(&self, profile: &str, role: &str) -> CloudResult<()>;
    /// Removes a role from a profile.
    async fn remove_role_from_instance_profile(&self, profile: &str, role: &str) -> CloudResult<()>;
    /// Lists profiles containing `role`.
    async fn list_instance_profiles_for_role(&self, role: &str) -> CloudResult<Vec<InstanceProfile>>;

    /// Creates a group.
    async fn create_group(&self, name: &str, path: &str) -> CloudResult<Group>;
    /// Reads a group and its members.
    async fn get_group(&self, name: &str) -> CloudResult<GroupDetail>;
    /// Deletes an empty group.
    async fn delete_group(&self, name: &str) -> CloudResult<()>;
    /// Attaches a managed policy to a group.
    async fn attach_group_policy(&self, group: &str, policy_arn: &str) -> CloudResult<()>;
    /// Detaches a managed policy from a group.
    async fn detach_group_policy(&self, group: &str, policy_arn: &str) -> CloudResult<()>;
    /// Lists managed policies attached to a group.
    async fn list_attached_group_policies(&self, group: &str) -> CloudResult<Vec<AttachedPolicy>>;
    /// Adds a user to a group.
    async fn add_user_to_group(&self, group: &str, user: &str) -> CloudResult<()>;
    /// Removes a user from a group.
    async fn remove_user_from_group(&self, group: &str, user: &str) -> CloudResult<()>;

    /// Creates a user.
    async fn create_user(&self, name: &str, path: &str, tags: &[Tag]) -> CloudResult<User>;
    /// Reads a user.
    async fn get_user(&self, name: &str) -> CloudResult<User>;
    /// Deletes a user with no keys and no group memberships.
    async fn delete_user(&self, name: &str) -> CloudResult<()>;
    /// Creates an access key (at most two per user).
    async fn create_access_key(&self, user: &str) -> CloudResult<AccessKey>;
    /// Lists a user's access keys.
    async fn list_access_keys(&self, user: &str) -> CloudResult<Vec<AccessKeyMetadata>>;
    /// Changes the status of an access key.
    async fn update_access_key(&self, user: &str, access_key_id: &str, status: AccessKeyStatus) -> CloudResult<()>;
    /// Deletes an access key.
    async fn delete_access_key(&self, user: &str, access_key_id: &str) -> CloudResult<()>;
}

/// A compute instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    /// Instance id
    pub instance_id: String,
    /// Lifecycle state, e.g. `running`
    pub state: String,
    /// ARN of the associated identity profile, if any
    pub profile_arn: Option<String>,
}

/// State of a profile association.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationState {
    /// Association in progress
    Associating,
    /// In force
    Associated,
    /// Removal in progress
    Disassociating,
    /// Removed
    Disassociated,
}

/// Association of an identity profile with an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileAssociation {
    /// Association id
    pub association_id: String,
    /// Instance id
    pub instance_id: String,
    /// Profile ARN
    pub profile_arn: String,
    /// State
    pub state: AssociationState,
}

/// Compute instance operations.
#[async_trait]
pub trait ComputeService: Send + Sync {
    /// Describes instances by id.
    async fn describe_instances(&self, instance_ids: &[String]) -> CloudResult<Vec<Instance>>;
    /// Describes instances whose associated profile has `profile_arn`.
    async fn describe_instances_by_profile(&self, profile_arn: &str) -> CloudResult<Vec<Instance>>;
    /// Lists profile associations of an instance.
    async fn describe_profile_associations(&self, instance_id: &str) -> CloudResult<Vec<ProfileAssociation>>;
    /// Associates the named profile with an instance that has none.
    async fn associate_profile(&self, instance_id: &str, profile_name: &str) -> CloudResult<ProfileAssociation>;
    /// Removes an association.
    async fn disassociate_profile(&self, association_id: &str) -> CloudResult<()>;
}

/// One audit log event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Receipt time, milliseconds since the epoch
    pub timestamp: i64,
    /// Event text
    pub message: String,
}

/// Append-only log stream operations.
#[async_trait]
pub trait LogService: Send + Sync {
    /// Creates a log group.
    async fn create_log_group(&self, group: &str, tags: &[Tag]) -> CloudResult<()>;
    /// Deletes a log group and its streams.
    async fn delete_log_group(&self, group: &str) -> CloudResult<()>;
    /// Sets retention of a log group.
    async fn put_retention_policy(&self, group: &str, days: u32) -> CloudResult<()>;
    /// Creates a stream in a group.
    async fn create_log_stream(&self, group: &str, stream: &str) -> CloudResult<()>;
    /// Appends events to a stream.
    async fn put_log_events(&self, group: &str, stream: &str, events: Vec<LogEvent>) -> CloudResult<()>;
    /// Reads every event of a stream, oldest first.
    async fn get_log_events(&self, group: &str, stream: &str) -> CloudResult<Vec<LogEvent>>;
}
