//! Error types for the dataset engine and the backend error classifier.
//!
//! Backends report failures as [`CloudError`] carrying an opaque code string.
//! Everything the engine returns is a [`DsError`], produced by [`classify`]
//! from the closed taxonomy below.

use thiserror::Error;

/// Error raised by a cloud backend (object storage, identity, compute, logs).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{service}: {code}: {message}")]
pub struct CloudError {
    /// Backend service that produced the error (`s3`, `iam`, `ec2`, `logs`).
    pub service: &'static str,
    /// Opaque error code, e.g. `NoSuchBucket`.
    pub code: String,
    /// Human readable message.
    pub message: String,
}

impl CloudError {
    /// Creates a new backend error.
    pub fn new(service: &'static str, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            service,
            code: code.into(),
            message: message.into(),
        }
    }
}

/// The closed error taxonomy, one variant per HTTP status class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// 400
    BadRequest,
    /// 404
    NotFound,
    /// 403
    Forbidden,
    /// 409
    Conflict,
    /// 429
    LimitExceeded,
    /// 503
    ServiceUnavailable,
    /// 500
    Internal,
    /// The caller went away before the operation finished.
    Cancelled,
}

impl ErrorKind {
    /// Stable name used in responses and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "BadRequest",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Forbidden => "Forbidden",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::LimitExceeded => "LimitExceeded",
            ErrorKind::ServiceUnavailable => "ServiceUnavailable",
            ErrorKind::Internal => "Internal",
            ErrorKind::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by every engine operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DsError {
    /// Malformed or semantically invalid request.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Backend refused the operation.
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// Entity already exists or is in a conflicting state.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Quota, throttling or capacity limit hit.
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),
    /// Backend is temporarily unable to serve.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
    /// Request was cancelled.
    #[error("request cancelled")]
    Cancelled,
}

impl DsError {
    /// The taxonomy bucket of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DsError::BadRequest(_) => ErrorKind::BadRequest,
            DsError::NotFound(_) => ErrorKind::NotFound,
            DsError::Forbidden(_) => ErrorKind::Forbidden,
            DsError::Conflict(_) => ErrorKind::Conflict,
            DsError::LimitExceeded(_) => ErrorKind::LimitExceeded,
            DsError::ServiceUnavailable(_) => ErrorKind::ServiceUnavailable,
            DsError::Internal(_) => ErrorKind::Internal,
            DsError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// The message without the kind prefix.
    pub fn message(&self) -> String {
        match self {
            DsError::BadRequest(m)
            | DsError::NotFound(m)
            | DsError::Forbidden(m)
            | DsError::Conflict(m)
            | DsError::LimitExceeded(m)
            | DsError::ServiceUnavailable(m)
            | DsError::Internal(m) => m.clone(),
            DsError::Cancelled => "request cancelled".to_string(),
        }
    }

    /// True for errors that mean "the thing is not there".
    pub fn is_not_found(&self) -> bool {
        matches!(self, DsError::NotFound(_))
    }
}

impl From<CloudError> for DsError {
    fn from(err: CloudError) -> Self {
        classify(&err)
    }
}

impl From<serde_json::Error> for DsError {
    fn from(err: serde_json::Error) -> Self {
        DsError::BadRequest(format!("failed to decode json: {}", err))
    }
}

/// Result type alias using DsError as the error type.
pub type Result<T> = std::result::Result<T, DsError>;

const FORBIDDEN_CODES: &[&str] = &[
    "AccessDenied",
    "AccessDeniedException",
    "AccountProblem",
    "AllAccessDisabled",
    "Forbidden",
    "InvalidAccessKeyId",
    "UnauthorizedOperation",
];

const CONFLICT_CODES: &[&str] = &[
    "ConcurrentModification",
    "DeleteConflict",
    "EntityAlreadyExists",
    "AlreadyExists",
    "ResourceAlreadyExistsException",
    "BucketAlreadyExists",
    "BucketAlreadyOwnedByYou",
    "BucketNotEmpty",
    "OperationAborted",
    "RestoreAlreadyInProgress",
    "IncorrectState",
];

const NOT_FOUND_CODES: &[&str] = &[
    "NoSuchEntity",
    "NoSuchBucket",
    "NoSuchKey",
    "NoSuchUpload",
    "NotFound",
    "NoSuchLifecycleConfiguration",
    "NoSuchVersion",
    "NoSuchTagSet",
    "ResourceNotFoundException",
];

const LIMIT_CODES: &[&str] = &[
    "LimitExceeded",
    "LimitExceededException",
    "Throttling",
    "ThrottlingException",
    "SlowDown",
    "TooManyBuckets",
    "RequestLimitExceeded",
];

const UNAVAILABLE_CODES: &[&str] = &[
    "ServiceFailure",
    "ServiceUnavailable",
    "InternalError",
    "InternalFailure",
    "NotImplemented",
    "PermanentRedirect",
    "RequestTimeout",
    "RequestTimeTooSkewed",
];

/// Maps a backend error onto the taxonomy.
///
/// Exact codes are looked up first, then the `.NotFound` suffix used by the
/// compute service, then the `Invalid*` / `Malformed*` / `Duplicate*` prefix
/// families. Unknown codes become `BadRequest` carrying the backend message.
pub fn classify(err: &CloudError) -> DsError {
    let code = err.code.as_str();
    let msg = if err.message.is_empty() {
        code.to_string()
    } else {
        format!("{}: {}", code, err.message)
    };

    if FORBIDDEN_CODES.contains(&code) {
        return DsError::Forbidden(msg);
    }
    if CONFLICT_CODES.contains(&code) || code.starts_with("Duplicate") {
        return DsError::Conflict(msg);
    }
    if NOT_FOUND_CODES.contains(&code) || code.ends_with(".NotFound") {
        return DsError::NotFound(msg);
    }
    if LIMIT_CODES.contains(&code) {
        return DsError::LimitExceeded(msg);
    }
    if UNAVAILABLE_CODES.contains(&code) {
        return DsError::ServiceUnavailable(msg);
    }
    if code.starts_with("Invalid") || code.starts_with("Malformed") {
        return DsError::BadRequest(msg);
    }
    DsError::BadRequest(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s3(code: &str) -> CloudError {
        CloudError::new("s3", code, "boom")
    }

    #[test]
    fn test_forbidden_family() {
        for code in ["AccessDenied", "AccountProblem", "AllAccessDisabled", "InvalidAccessKeyId"] {
            assert_eq!(classify(&s3(code)).kind(), ErrorKind::Forbidden, "{}", code);
        }
    }

    #[test]
    fn test_conflict_family() {
        for code in [
            "BucketNotEmpty",
            "BucketAlreadyOwnedByYou",
            "EntityAlreadyExists",
            "DeleteConflict",
            "DuplicateSSHPublicKey",
            "OperationAborted",
        ] {
            assert_eq!(classify(&s3(code)).kind(), ErrorKind::Conflict, "{}", code);
        }
    }

    #[test]
    fn test_not_found_family() {
        for code in ["NoSuchBucket", "NoSuchEntity", "NoSuchKey", "NotFound", "InvalidInstanceID.NotFound"] {
            assert_eq!(classify(&s3(code)).kind(), ErrorKind::NotFound, "{}", code);
        }
    }

    #[test]
    fn test_limit_and_unavailable() {
        assert_eq!(classify(&s3("SlowDown")).kind(), ErrorKind::LimitExceeded);
        assert_eq!(classify(&s3("Throttling")).kind(), ErrorKind::LimitExceeded);
        assert_eq!(classify(&s3("TooManyBuckets")).kind(), ErrorKind::LimitExceeded);
        assert_eq!(classify(&s3("InternalError")).kind(), ErrorKind::ServiceUnavailable);
        assert_eq!(classify(&s3("RequestTimeTooSkewed")).kind(), ErrorKind::ServiceUnavailable);
    }

    #[test]
    fn test_invalid_and_malformed_prefixes() {
        assert_eq!(classify(&s3("InvalidBucketName")).kind(), ErrorKind::BadRequest);
        assert_eq!(classify(&s3("MalformedPolicyDocument")).kind(), ErrorKind::BadRequest);
    }

    #[test]
    fn test_unknown_code_passes_message_through() {
        let err = classify(&CloudError::new("iam", "Weird", "something odd"));
        assert_eq!(err, DsError::BadRequest("Weird: something odd".to_string()));
    }

    #[test]
    fn test_from_cloud_error() {
        let err: DsError = CloudError::new("s3", "NoSuchKey", "").into();
        assert_eq!(err, DsError::NotFound("NoSuchKey".to_string()));
    }

    #[test]
    fn test_message_strips_kind() {
        let err = DsError::Conflict("bucket exists".to_string());
        assert_eq!(err.message(), "bucket exists");
        assert_eq!(err.to_string(), "conflict: bucket exists");
        assert_eq!(DsError::Cancelled.kind(), ErrorKind::Cancelled);
    }
}
