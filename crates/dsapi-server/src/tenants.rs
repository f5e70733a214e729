//! Construction of the per-account services from configuration.
//!
//! Every account gets its own backend, signing pre-signed URLs with the
//! account's credentials, and one storage provider per configured type.
//!
//! The backend is the in-process [`SimulatedCloud`]: containers, identities
//! and metadata (including `metadataRepository.type: "s3"`) live in memory
//! and are gone after a restart. Startup says so once per account.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use dsapi_engine::auditlog::CloudAuditLog;
use dsapi_engine::cloud::memory::SimulatedCloud;
use dsapi_engine::cloud::ObjectStorage;
use dsapi_engine::metadata::ObjectMetadataStore;
use dsapi_engine::objstore::{ObjectStoreRepository, ObjectStoreSettings};
use dsapi_engine::presign::PresignSigner;
use dsapi_engine::repository::{MetadataRepository, StorageProvider};
use dsapi_engine::Service;

use crate::config::{AccountConfig, ConfigError, DsApiConfig};

const DEFAULT_ACCOUNT_ID: &str = "000000000000";

/// Storage-type names served by the object-storage repository.
pub const OBJECT_STORAGE_TYPES: &[&str] = &["s3", "objstore"];

/// Account name to service map; fixed after startup.
#[derive(Clone, Default)]
pub struct Tenants {
    services: HashMap<String, Arc<Service>>,
}

impl Tenants {
    /// Wraps already built services.
    pub fn from_services(services: impl IntoIterator<Item = Service>) -> Self {
        Self {
            services: services
                .into_iter()
                .map(|s| (s.account().to_string(), Arc::new(s)))
                .collect(),
        }
    }

    /// Builds a service per configured account.
    pub async fn build(config: &DsApiConfig) -> Result<Self, ConfigError> {
        let mut services = HashMap::new();
        for (name, account) in &config.accounts {
            let service = build_service(config, name, account).await?;
            info!(account = %name, storage = ?service.storage_types(), "tenant ready");
            services.insert(name.clone(), Arc::new(service));
        }
        Ok(Self { services })
    }

    /// The service of `account`.
    pub fn get(&self, account: &str) -> Option<Arc<Service>> {
        self.services.get(account).cloned()
    }

    /// Number of tenants.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// True if no tenant is configured.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

async fn build_service(config: &DsApiConfig, name: &str, account: &AccountConfig) -> Result<Service, ConfigError> {
    let settings = &account.config;
    let backend_err = |message: String| ConfigError::Backend {
        account: name.to_string(),
        message,
    };

    let signer = PresignSigner::new(&settings.region, &settings.akid, &settings.secret, settings.endpoint.as_deref())
        .map_err(|e| backend_err(e.to_string()))?;
    let account_id = settings.account_id.as_deref().unwrap_or(DEFAULT_ACCOUNT_ID);
    let cloud = Arc::new(SimulatedCloud::new(account_id, signer.clone()));
    warn!(
        account = %name,
        metadata = %config.metadata_repository.kind,
        "backend is simulated in process memory, nothing survives a restart"
    );

    let metadata_bucket = &config.metadata_repository.config.bucket;
    let metadata_storage: Arc<SimulatedCloud> = match config.metadata_repository.kind.as_str() {
        "memory" => Arc::new(SimulatedCloud::new(account_id, signer)),
        _ => cloud.clone(),
    };
    metadata_storage
        .create_bucket(metadata_bucket)
        .await
        .map_err(|e| backend_err(e.to_string()))?;
    let metadata: Arc<dyn MetadataRepository> =
        Arc::new(ObjectMetadataStore::new(metadata_storage, metadata_bucket.clone()));

    let audit = Arc::new(CloudAuditLog::new(cloud.clone(), settings.audit_timeout()));
    let mut service = Service::new(name, &config.org, metadata, audit).with_log_retention(settings.log_retention_days());

    for kind in &account.storage_providers {
        if !OBJECT_STORAGE_TYPES.contains(&kind.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "account {} names unknown storage provider {:?}",
                name, kind
            )));
        }
        let repo = ObjectStoreRepository::new(
            cloud.clone(),
            cloud.clone(),
            cloud.clone(),
            ObjectStoreSettings {
                org: config.org.clone(),
                prefix: settings.prefix.clone(),
                logging_bucket: settings.logging_bucket.clone(),
            },
        );
        service = service.with_provider(kind.clone(), StorageProvider::with_attachments(Arc::new(repo)));
    }
    Ok(service)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(doc: &str) -> DsApiConfig {
        DsApiConfig::from_json(doc).unwrap()
    }

    #[tokio::test]
    async fn test_build_tenants() {
        let config = config(
            r#"{
                "org": "acme", "token": "t",
                "accounts": {
                    "a": {"storageProviders": ["s3", "objstore"], "config": {"region": "us-east-1", "akid": "A", "secret": "S"}},
                    "b": {"storageProviders": ["s3"], "config": {"region": "eu-west-1", "akid": "B", "secret": "S"}}
                }
            }"#,
        );
        let tenants = Tenants::build(&config).await.unwrap();
        assert_eq!(tenants.len(), 2);
        assert_eq!(tenants.get("a").unwrap().storage_types(), vec!["objstore", "s3"]);
        assert!(tenants.get("c").is_none());
    }

    #[tokio::test]
    async fn test_no_accounts_means_no_tenants() {
        let tenants = Tenants::build(&config(r#"{"org": "acme", "token": "t"}"#)).await.unwrap();
        assert!(tenants.is_empty());
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for Captured {
        type Writer = Self;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[tokio::test]
    async fn test_simulated_backend_is_announced() {
        let captured = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(captured.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let config = config(
            r#"{"org": "acme", "token": "t",
                "metadataRepository": {"type": "s3"},
                "accounts": {"a": {"storageProviders": ["s3"], "config": {"region": "r"}}}}"#,
        );
        Tenants::build(&config).await.unwrap();

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        let line = output
            .lines()
            .find(|l| l.contains("backend is simulated"))
            .expect("simulated backend warning");
        assert!(line.contains("WARN"));
        assert!(line.contains("account=a"));
        assert!(line.contains("metadata=s3"));
    }

    #[tokio::test]
    async fn test_unknown_provider_rejected() {
        let config = config(
            r#"{"org": "acme", "token": "t",
                "accounts": {"a": {"storageProviders": ["tape"], "config": {"region": "r"}}}}"#,
        );
        assert!(matches!(Tenants::build(&config).await, Err(ConfigError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_bad_endpoint_rejected() {
        let config = config(
            r#"{"org": "acme", "token": "t",
                "accounts": {"a": {"storageProviders": ["s3"], "config": {"region": "r", "endpoint": "not a url"}}}}"#,
        );
        assert!(matches!(Tenants::build(&config).await, Err(ConfigError::Backend { .. })));
    }
}
