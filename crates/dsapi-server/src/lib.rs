#![warn(missing_docs)]

//! Dataset control plane server: HTTP API, tenant configuration, metrics

pub mod api;
pub mod config;
pub mod metrics;
pub mod security;
pub mod tenants;

pub use api::DsApi;
pub use config::{ConfigError, DsApiConfig};
pub use tenants::Tenants;
