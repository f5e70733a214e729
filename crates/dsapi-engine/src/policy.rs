//! Canonical authorization documents for dataset containers.
//!
//! Four variants exist: `Original` (list + read), `Derivative` (list + read +
//! write + delete), `Temporary` (the derivative grant, issued to human users)
//! and `AssumeRole` (lets the compute service assume an instance role).

use serde::{Deserialize, Serialize};

/// IAM policy language version.
pub const POLICY_VERSION: &str = "2012-10-17";

/// Principal service allowed to assume instance roles.
pub const COMPUTE_SERVICE_PRINCIPAL: &str = "ec2.amazonaws.com";

/// Effect of a policy statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyEffect {
    /// Allow the action
    Allow,
    /// Deny the action
    Deny,
}

/// Storage and identity actions used by dataset policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// List container contents
    ListBucket,
    /// Read an object
    GetObject,
    /// Write an object
    PutObject,
    /// Delete an object
    DeleteObject,
    /// Assume a role
    AssumeRole,
}

impl Action {
    /// Returns the wire-form action string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::ListBucket => "s3:ListBucket",
            Action::GetObject => "s3:GetObject",
            Action::PutObject => "s3:PutObject",
            Action::DeleteObject => "s3:DeleteObject",
            Action::AssumeRole => "sts:AssumeRole",
        }
    }

    /// Parses a wire-form action string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "s3:ListBucket" => Some(Action::ListBucket),
            "s3:GetObject" => Some(Action::GetObject),
            "s3:PutObject" => Some(Action::PutObject),
            "s3:DeleteObject" => Some(Action::DeleteObject),
            "sts:AssumeRole" => Some(Action::AssumeRole),
            _ => None,
        }
    }
}

impl Serialize for Action {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Action {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Action::parse(&s).ok_or_else(|| serde::de::Error::custom(format!("unknown action {}", s)))
    }
}

/// Principal block of a trust policy statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Service principal, e.g. `ec2.amazonaws.com`
    #[serde(rename = "Service")]
    pub service: Vec<String>,
}

/// One statement of a policy document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statement {
    /// Allow or deny
    #[serde(rename = "Effect")]
    pub effect: PolicyEffect,
    /// Actions covered by the statement
    #[serde(rename = "Action")]
    pub action: Vec<Action>,
    /// Resources covered (omitted for trust policies)
    #[serde(rename = "Resource", default, skip_serializing_if = "Vec::is_empty")]
    pub resource: Vec<String>,
    /// Principal (trust policies only)
    #[serde(rename = "Principal", default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<Principal>,
}

/// A complete policy document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDocument {
    /// Policy language version
    #[serde(rename = "Version")]
    pub version: String,
    /// Statements
    #[serde(rename = "Statement")]
    pub statement: Vec<Statement>,
}

impl PolicyDocument {
    /// Serializes the document to its JSON wire form.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parses a document from JSON.
    pub fn from_json(s: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    /// Whether the document allows `action` on `resource`.
    pub fn allows(&self, action: Action, resource: &str) -> bool {
        let mut allowed = false;
        for st in &self.statement {
            if !st.action.contains(&action) || !st.resource.iter().any(|r| r == resource) {
                continue;
            }
            match st.effect {
                PolicyEffect::Deny => return false,
                PolicyEffect::Allow => allowed = true,
            }
        }
        allowed
    }
}

/// The variant of dataset policy to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    /// Read-only access for original datasets
    Original,
    /// Read-write access for derivative datasets
    Derivative,
    /// Read-write access for temporary human users
    Temporary,
}

impl PolicyKind {
    /// The canonical kind for a dataset given its derivative flag.
    pub fn canonical(derivative: bool) -> Self {
        if derivative {
            PolicyKind::Derivative
        } else {
            PolicyKind::Original
        }
    }
}

fn bucket_arn(container: &str) -> String {
    format!("arn:aws:s3:::{}", container)
}

fn objects_arn(container: &str) -> String {
    format!("arn:aws:s3:::{}/*", container)
}

fn allow(actions: &[Action], resource: String) -> Statement {
    Statement {
        effect: PolicyEffect::Allow,
        action: actions.to_vec(),
        resource: vec![resource],
        principal: None,
    }
}

/// Builds the access policy of `kind` for `container`.
pub fn container_policy(kind: PolicyKind, container: &str) -> PolicyDocument {
    let object_actions: &[Action] = match kind {
        PolicyKind::Original => &[Action::GetObject],
        PolicyKind::Derivative | PolicyKind::Temporary => {
            &[Action::GetObject, Action::PutObject, Action::DeleteObject]
        }
    };
    PolicyDocument {
        version: POLICY_VERSION.to_string(),
        statement: vec![
            allow(&[Action::ListBucket], bucket_arn(container)),
            allow(object_actions, objects_arn(container)),
        ],
    }
}

/// Trust policy letting the compute service assume a role.
pub fn assume_role_policy() -> PolicyDocument {
    PolicyDocument {
        version: POLICY_VERSION.to_string(),
        statement: vec![Statement {
            effect: PolicyEffect::Allow,
            action: vec![Action::AssumeRole],
            resource: Vec::new(),
            principal: Some(Principal {
                service: vec![COMPUTE_SERVICE_PRINCIPAL.to_string()],
            }),
        }],
    }
}
