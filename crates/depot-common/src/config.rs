//! Configuration types for Depot
//!
//! A single structured config consumed at startup, loadable from a TOML
//! file with `DEPOT__*` environment overrides.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::types::{AttestationType, SbomFormat};

/// Root configuration for Depot
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub metadata: MetadataConfig,
    pub identity: IdentityConfig,
    pub supplychain: SupplyChainConfig,
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from an optional file plus `DEPOT__*`
    /// environment variables (e.g. `DEPOT__SERVER__PORT=9000`).
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder = builder.add_source(config::Environment::with_prefix("DEPOT").separator("__"));
        builder.build()?.try_deserialize()
    }
}

/// HTTP server configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
    pub tls: Option<TlsConfig>,
    /// Per-request deadline in seconds
    pub request_timeout_secs: u64,
    /// Maximum single-part upload body size in bytes
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 9000,
            tls: None,
            request_timeout_secs: 60,
            max_body_bytes: 100 * 1024 * 1024, // 100 MB
        }
    }
}

/// TLS configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Which storage backend serves object payloads
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Filesystem,
    S3,
    Gcs,
    Azure,
}

/// Storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for the filesystem backend and multipart staging
    pub root_directory: PathBuf,
    pub backend: BackendKind,
    pub backend_config: RemoteBackendConfig,
    /// Compute and store SHA-256 sidecars / object metadata inline
    pub enable_checksum: bool,
    pub retry: RetryConfig,
    /// Cap on the in-memory buffer that makes streamed writes replayable
    pub retry_buffer_bytes: usize,
    /// Multipart part upload deadline in seconds
    pub part_timeout_secs: u64,
    /// Multipart sessions idle longer than this are reaped
    pub multipart_idle_secs: u64,
    /// Orphan sweep interval in seconds
    pub sweep_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_directory: PathBuf::from("/var/lib/depot"),
            backend: BackendKind::Filesystem,
            backend_config: RemoteBackendConfig::default(),
            enable_checksum: true,
            retry: RetryConfig::default(),
            retry_buffer_bytes: 32 * 1024 * 1024, // 32 MB
            part_timeout_secs: 10 * 60,
            multipart_idle_secs: 24 * 60 * 60,
            sweep_interval_secs: 5 * 60,
        }
    }
}

/// Settings for the remote object-store backends
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteBackendConfig {
    /// Service endpoint, e.g. `https://s3.us-east-1.amazonaws.com`
    pub endpoint: String,
    pub region: String,
    /// The single remote bucket/container all Depot buckets map into
    pub container: String,
    pub access_key: String,
    pub secret_key: String,
    /// Bearer token for GCS
    pub token: String,
    /// Storage account name for Azure
    pub account: String,
}

/// Retry policy settings applied to backend I/O
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub const fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Metadata store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    pub db_path: PathBuf,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("/var/lib/depot/metadata.db"),
        }
    }
}

/// OIDC identity provider configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub enabled: bool,
    pub issuer_url: String,
    pub realm: String,
    pub client_id: String,
    pub client_secret: String,
    pub allow_anonymous_get: bool,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            issuer_url: String::new(),
            realm: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            allow_anonymous_get: false,
        }
    }
}

/// Supply-chain configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SupplyChainConfig {
    pub signing_enabled: bool,
    pub require_sbom: bool,
    pub allowed_sbom_formats: Vec<SbomFormat>,
    pub allowed_attestation_types: Vec<AttestationType>,
}

impl Default for SupplyChainConfig {
    fn default() -> Self {
        Self {
            signing_enabled: true,
            require_sbom: false,
            allowed_sbom_formats: vec![SbomFormat::Spdx, SbomFormat::Cyclonedx],
            allowed_attestation_types: vec![
                AttestationType::Build,
                AttestationType::Test,
                AttestationType::Scan,
                AttestationType::Deploy,
                AttestationType::Provenance,
            ],
        }
    }
}

/// Observability configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub prometheus_enabled: bool,
    pub prometheus_path: String,
    /// OTLP endpoint; tracing is disabled when absent
    pub tracing_endpoint: Option<String>,
    pub tracing_service_name: String,
    pub health_paths: HealthPaths,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            prometheus_enabled: true,
            prometheus_path: "/metrics".to_string(),
            tracing_endpoint: None,
            tracing_service_name: "depot".to_string(),
            health_paths: HealthPaths::default(),
        }
    }
}

/// Health probe routes
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthPaths {
    pub health: String,
    pub ready: String,
    pub live: String,
}

impl Default for HealthPaths {
    fn default() -> Self {
        Self {
            health: "/health".to_string(),
            ready: "/health/ready".to_string(),
            live: "/health/live".to_string(),
        }
    }
}
