use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use dsapi_engine::auditlog::DEFAULT_FLUSH_TIMEOUT;
use dsapi_engine::service::DEFAULT_LOG_RETENTION_DAYS;

/// Errors raised while loading the configuration or building tenants from it.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    /// The file is not valid JSON of the expected shape.
    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),
    /// A value is missing or out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
    /// A tenant's backend could not be prepared.
    #[error("cannot initialise backend for {account}: {message}")]
    Backend {
        /// Account name
        account: String,
        /// What failed
        message: String,
    },
}

/// Service configuration, read once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DsApiConfig {
    /// TCP bind address; `:port` binds every interface
    pub listen_address: String,
    /// Organization tagged on every resource
    pub org: String,
    /// Shared secret expected in `X-Auth-Token`
    pub token: String,
    /// Log filter used when `RUST_LOG` is unset
    pub log_level: Option<String>,
    /// Tenants by account name
    pub accounts: BTreeMap<String, AccountConfig>,
    /// Where dataset metadata is kept
    pub metadata_repository: MetadataRepositoryConfig,
    /// Build information echoed by `/version`
    pub version: VersionInfo,
}

impl Default for DsApiConfig {
    fn default() -> Self {
        Self {
            listen_address: ":8080".to_string(),
            org: String::new(),
            token: String::new(),
            log_level: None,
            accounts: BTreeMap::new(),
            metadata_repository: MetadataRepositoryConfig::default(),
            version: VersionInfo::default(),
        }
    }
}

/// One tenant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccountConfig {
    /// Data-storage types offered to this tenant
    pub storage_providers: Vec<String>,
    /// Backend settings
    pub config: AccountSettings,
}

/// Backend settings of a tenant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccountSettings {
    /// Backend region
    pub region: String,
    /// Access key id
    pub akid: String,
    /// Secret access key
    pub secret: String,
    /// Alternative service endpoint
    pub endpoint: Option<String>,
    /// Container receiving server access logs
    pub logging_bucket: Option<String>,
    /// Container name prefix
    pub prefix: Option<String>,
    /// Cloud account id; defaults to a zero id
    pub account_id: Option<String>,
    /// Retention of audit streams
    pub log_retention_days: Option<u32>,
    /// Audit pipe inactivity flush timeout
    pub audit_timeout_secs: Option<u64>,
}

impl AccountSettings {
    /// Retention of audit streams, falling back to the default.
    pub fn log_retention_days(&self) -> u32 {
        self.log_retention_days.unwrap_or(DEFAULT_LOG_RETENTION_DAYS)
    }

    /// Audit pipe flush timeout, falling back to the default.
    pub fn audit_timeout(&self) -> Duration {
        self.audit_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_FLUSH_TIMEOUT)
    }
}

/// Metadata repository selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetadataRepositoryConfig {
    /// `s3` or `memory`
    #[serde(rename = "type")]
    pub kind: String,
    /// Repository settings
    pub config: MetadataSettings,
}

impl Default for MetadataRepositoryConfig {
    fn default() -> Self {
        Self {
            kind: "s3".to_string(),
            config: MetadataSettings::default(),
        }
    }
}

/// Metadata repository settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetadataSettings {
    /// Container holding the metadata documents
    pub bucket: String,
}

impl Default for MetadataSettings {
    fn default() -> Self {
        Self {
            bucket: "dsapi-metadata".to_string(),
        }
    }
}

/// Build information.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VersionInfo {
    /// Release version
    pub version: String,
    /// Pre-release label
    pub prerelease: String,
    /// Build time stamp
    pub build_stamp: String,
    /// Source revision
    pub git_hash: String,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            prerelease: String::new(),
            build_stamp: String::new(),
            git_hash: String::new(),
        }
    }
}

impl DsApiConfig {
    /// Loads and validates a JSON configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Parses and validates a JSON configuration document.
    pub fn from_json(contents: &str) -> Result<Self, ConfigError> {
        let config: DsApiConfig = serde_json::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the values serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.org.trim().is_empty() {
            return Err(ConfigError::Invalid("org is required".to_string()));
        }
        if self.token.is_empty() {
            return Err(ConfigError::Invalid("token is required".to_string()));
        }
        for (name, account) in &self.accounts {
            if account.storage_providers.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "account {} has no storage providers",
                    name
                )));
            }
            if account.config.region.is_empty() {
                return Err(ConfigError::Invalid(format!("account {} has no region", name)));
            }
        }
        match self.metadata_repository.kind.as_str() {
            "s3" | "memory" => {}
            other => {
                return Err(ConfigError::Invalid(format!(
                    "unknown metadata repository type {:?}",
                    other
                )))
            }
        }
        self.socket_addr()?;
        Ok(())
    }

    /// The bind address, expanding the `:port` shorthand.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = if self.listen_address.starts_with(':') {
            format!("0.0.0.0{}", self.listen_address)
        } else {
            self.listen_address.clone()
        };
        addr.parse()
            .map_err(|_| ConfigError::Invalid(format!("bad listen address {:?}", self.listen_address)))
    }
}
