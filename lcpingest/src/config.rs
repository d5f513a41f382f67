//! Application configuration management.
//!
//! Configuration is loaded from an optional YAML file with environment variable overrides. The
//! file path defaults to `config.yaml` but can be specified via the `-f` flag or the
//! `LCPINGEST_CONFIG` environment variable.
//!
//! ## Loading Priority
//!
//! Sources are merged in the following order (later sources override earlier ones):
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`, skipped if absent)
//! 2. **Environment variables** - Variables prefixed with `LCPINGEST_` override YAML values
//! 3. **Deployment aliases** - `PORT`, `LCP_SERVER_URL`, `LCP_SERVER_USER`, `LCP_SERVER_PASSWORD`,
//!    `STORAGE_ROOT` and `LCPENCRYPT_PATH`
//!
//! For nested values use double underscores, e.g. `LCPINGEST_LCP_SERVER__URL`.
//!
//! ## Environment Variable Examples
//!
//! ```bash
//! LCP_SERVER_URL=http://lcp.internal:8989
//! LCP_SERVER_USER=admin
//! LCP_SERVER_PASSWORD=secret
//! STORAGE_ROOT=/var/lib/lcpingest
//!
//! # Spawn the lcpencrypt tool instead of encrypting in-process
//! LCPINGEST_ENCRYPTION__MODE=external
//! LCPENCRYPT_PATH=/usr/local/bin/lcpencrypt
//! ```

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};
use url::Url;

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "LCPINGEST_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// Expose Prometheus metrics at `/internal/metrics`
    pub enable_metrics: bool,
    /// Enable OpenTelemetry OTLP export for distributed tracing
    pub enable_otel_export: bool,
    /// Where uploads and protected publications are written
    pub storage: StorageConfig,
    /// The licensing server that protected content is registered with
    pub lcp_server: LcpServerConfig,
    /// How publications are encrypted
    pub encryption: EncryptionConfig,
}

/// Working directory settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Root directory for uploads and encrypted outputs (required)
    pub root: PathBuf,
    /// Maximum accepted size of the uploaded publication in bytes
    pub max_upload_size: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::new(),
            max_upload_size: 5 * 1024 * 1024, // 5 MiB
        }
    }
}

/// Licensing server connection settings.
#[derive(Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LcpServerConfig {
    /// Base URL of the LCP server, e.g. `http://lcp.internal:8989`
    pub url: Option<Url>,
    /// Basic auth user
    pub username: String,
    /// Basic auth password
    #[serde(skip_serializing)]
    pub password: String,
    /// Timeout for the content registration call
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl std::fmt::Debug for LcpServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LcpServerConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Default for LcpServerConfig {
    fn default() -> Self {
        Self {
            url: None,
            username: String::new(),
            password: String::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Which encryption realization handles uploads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionMode {
    /// Encrypt with the linked engine and notify the LCP server from this service
    #[default]
    InProcess,
    /// Spawn the encryption executable, which notifies the LCP server itself
    External,
}

/// What to do when the external encryption process exits unsuccessfully.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayPolicy {
    /// A non-zero exit status fails the upload
    #[default]
    Strict,
    /// Relay whatever the process printed regardless of its exit status
    BestEffort,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct EncryptionConfig {
    pub mode: EncryptionMode,
    pub external: ExternalEncryptionConfig,
}

/// Settings for the external-process realization.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExternalEncryptionConfig {
    /// Path to the `lcpencrypt` executable (required in external mode)
    pub executable: Option<PathBuf>,
    /// How long the process may run before it is killed
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub relay: RelayPolicy,
}

impl Default for ExternalEncryptionConfig {
    fn default() -> Self {
        Self {
            executable: None,
            timeout: Duration::from_secs(5 * 60),
            relay: RelayPolicy::Strict,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8989,
            enable_metrics: false,
            enable_otel_export: false,
            storage: StorageConfig::default(),
            lcp_server: LcpServerConfig::default(),
            encryption: EncryptionConfig::default(),
        }
    }
}

/// Configuration problems found at startup
#[derive(Debug, thiserror::Error)]
#[error("Config validation: {0}")]
pub struct ConfigError(String);

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError("port must be set to a non-zero value".to_string()));
        }

        if self.storage.root.as_os_str().is_empty() {
            return Err(ConfigError(
                "storage.root is not configured. Set STORAGE_ROOT or LCPINGEST_STORAGE__ROOT.".to_string(),
            ));
        }

        if self.storage.max_upload_size == 0 {
            return Err(ConfigError("storage.max_upload_size cannot be 0".to_string()));
        }

        if self.lcp_server.url.is_none() {
            return Err(ConfigError(
                "lcp_server.url is not configured. Set LCP_SERVER_URL or LCPINGEST_LCP_SERVER__URL.".to_string(),
            ));
        }

        if self.lcp_server.username.is_empty() || self.lcp_server.password.is_empty() {
            return Err(ConfigError(
                "lcp_server credentials are not configured. Set LCP_SERVER_USER and LCP_SERVER_PASSWORD.".to_string(),
            ));
        }

        if self.encryption.mode == EncryptionMode::External {
            if self.encryption.external.executable.is_none() {
                return Err(ConfigError(
                    "encryption.mode is external but encryption.external.executable is not configured. Set LCPENCRYPT_PATH."
                        .to_string(),
                ));
            }

            if self.encryption.external.timeout.is_zero() {
                return Err(ConfigError("encryption.external.timeout cannot be 0".to_string()));
            }
        }

        Ok(())
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("LCPINGEST_").split("__"))
            .merge(Env::raw().only(&["PORT"]).map(|_| "port".into()))
            .merge(Env::raw().only(&["STORAGE_ROOT"]).map(|_| "storage.root".into()))
            .merge(Env::raw().only(&["LCP_SERVER_URL"]).map(|_| "lcp_server.url".into()))
            .merge(Env::raw().only(&["LCP_SERVER_USER"]).map(|_| "lcp_server.username".into()))
            .merge(Env::raw().only(&["LCP_SERVER_PASSWORD"]).map(|_| "lcp_server.password".into()))
            .merge(Env::raw().only(&["LCPENCRYPT_PATH"]).map(|_| "encryption.external.executable".into()))
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
