#![warn(missing_docs)]

//! Dataset control plane engine: storage provisioning with rollback, instance access rebinding, temporary users, audit log pipe

pub mod auditlog;
pub mod cloud;
pub mod context;
pub mod error;
pub mod metadata;
pub mod objstore;
pub mod policy;
pub mod presign;
pub mod repository;
pub mod retry;
pub mod rollback;
pub mod service;

pub use context::RequestContext;
pub use error::{CloudError, DsError, ErrorKind, Result};
pub use metadata::DatasetMetadata;
pub use service::Service;
