use crate::rules::{split_host_port, FilterMode, DEFAULT_MAX_FILTER_BYTES};
use rustls::pki_types::CertificateDer;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),
    #[error("Failed to parse PEM: {0}")]
    PemError(#[from] pem::PemError),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Relay endpoints and connection settings
    pub relay: RelayConfig,
    /// Payload injection settings
    pub payload: PayloadConfig,
    /// Logging settings
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Local listen address; `:port` listens on all interfaces
    pub listen: String,
    /// Remote address every connection is relayed to
    pub remote: String,
    /// `host:port` substituted into outbound payload templates
    pub server: Option<String>,
    /// Connect to the remote over TLS and relay plaintext locally
    pub unwrap_tls: bool,
    /// TLS dial target, defaults to `remote`
    pub tls_target: Option<String>,
    /// Extra PEM CA certificates trusted for TLS unwrap
    pub ca_cert: Option<String>,
    /// Keep Nagle's algorithm enabled
    pub nagle: bool,
    /// Answer WebSocket upgrades locally before opening the return pipe
    pub reverse_proxy: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: ":9999".to_string(),
            remote: "localhost:80".to_string(),
            server: None,
            unwrap_tls: false,
            tls_target: None,
            ca_cert: None,
            nagle: true,
            reverse_proxy: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadConfig {
    /// Replaces outbound buffers containing `CONNECT ` (empty disables)
    pub outbound: String,
    /// Replaces incoming buffers containing `HTTP/1.` (empty disables)
    pub incoming: String,
    /// Larger outbound buffers are never rewritten
    pub max_outbound_filter_bytes: usize,
    /// Larger incoming buffers are never rewritten
    pub max_inbound_filter_bytes: usize,
    /// size-threshold or first-buffer
    pub filter_mode: FilterMode,
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            outbound: String::new(),
            incoming: "HTTP/1.1 200 Connection Established".to_string(),
            max_outbound_filter_bytes: DEFAULT_MAX_FILTER_BYTES,
            max_inbound_filter_bytes: DEFAULT_MAX_FILTER_BYTES,
            filter_mode: FilterMode::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: text, json
    pub format: String,
    /// ANSI colors in text output
    pub color: bool,
    /// Render traced bytes as hex instead of text
    pub hex: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            color: false,
            hex: false,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create a default configuration file
    pub fn create_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Config::default();
        config.save(path)?;
        Ok(config)
    }

    /// Listen address with the `:port` shorthand expanded
    pub fn listen_addr(&self) -> String {
        let listen = self.relay.listen.trim();
        if listen.starts_with(':') {
            format!("0.0.0.0{}", listen)
        } else {
            listen.to_string()
        }
    }

    /// Address dialed when TLS unwrapping is on
    pub fn tls_dial_target(&self) -> &str {
        self.relay
            .tls_target
            .as_deref()
            .filter(|t| !t.is_empty())
            .unwrap_or(self.relay.remote.as_str())
    }

    /// Check values that can be checked without touching the network
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.relay.listen.trim().is_empty() {
            return Err(ConfigError::Invalid("listen address is empty".to_string()));
        }
        if self.relay.remote.trim().is_empty() {
            return Err(ConfigError::Invalid("remote address is empty".to_string()));
        }
        if let Some(server) = &self.relay.server {
            if !server.is_empty() && split_host_port(server).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "server address '{}' is not host:port",
                    server
                )));
            }
        }
        if self.relay.unwrap_tls && split_host_port(self.tls_dial_target()).is_none() {
            return Err(ConfigError::Invalid(format!(
                "TLS target '{}' is not host:port",
                self.tls_dial_target()
            )));
        }
        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(ConfigError::Invalid(format!(
                "unknown log format '{}'",
                self.logging.format
            )));
        }
        Ok(())
    }
}

/// Read every certificate from a PEM file
pub fn load_ca_certs<P: AsRef<Path>>(path: P) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let content = std::fs::read(path)?;
    let certs: Vec<CertificateDer<'static>> = pem::parse_many(&content)?
        .into_iter()
        .filter(|p| p.tag() == "CERTIFICATE")
        .map(|p| CertificateDer::from(p.into_contents()))
        .collect();

    if certs.is_empty() {
        return Err(ConfigError::Invalid("no certificates found in CA file".to_string()));
    }
    Ok(certs)
}
