//! System configuration, loaded from a TOML file via the `config` crate,
//! and the company-key artifact format (see spec §6).

use std::net::ToSocketAddrs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::DcaError;

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Network interface to bind the capture filter to.
    pub interface: String,
    /// Path to the persisted feature-scaler artifact.
    pub scaler_path: PathBuf,
    /// Path to the autoencoder trained on benign flows (PAMP signal source).
    pub benign_model_path: PathBuf,
    /// Path to the autoencoder trained on malicious flows (SAFE signal source).
    pub malicious_model_path: PathBuf,
    /// Hidden-layer width of both autoencoders.
    pub hidden_size: usize,
    pub dca: DcaConfig,
    pub queues: QueueConfig,
    pub shipper: ShipperConfig,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            interface: "eth0".to_string(),
            scaler_path: PathBuf::from("/etc/dca-endpoint/scaler.json"),
            benign_model_path: PathBuf::from("/etc/dca-endpoint/models/benign.safetensors"),
            malicious_model_path: PathBuf::from("/etc/dca-endpoint/models/malicious.safetensors"),
            hidden_size: 16,
            dca: DcaConfig::default(),
            queues: QueueConfig::default(),
            shipper: ShipperConfig::default(),
        }
    }
}

impl SystemConfig {
    /// Loads configuration from `path`, layering it over built-in defaults so
    /// the file only needs to override what differs from them.
    pub fn load(path: &Path) -> Result<Self, DcaError> {
        let defaults = config::Config::try_from(&Self::default())
            .map_err(|e| DcaError::Startup(format!("default config serialization failed: {e}")))?;

        config::Config::builder()
            .add_source(defaults)
            .add_source(config::File::from(path).required(false))
            .build()
            .map_err(|e| DcaError::Startup(format!("config load failed: {e}")))?
            .try_deserialize()
            .map_err(|e| DcaError::Startup(format!("config parse failed: {e}")))
    }
}

/// DCA population and migration parameters (spec §4.4 defaults).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DcaConfig {
    pub population_size: usize,
    pub migration_range: (f64, f64),
    pub max_antigens: usize,
    pub csm_weights: [f64; 2],
    pub k_weights: [f64; 2],
    pub segment_size: usize,
    pub anomaly_threshold: f64,
}

impl Default for DcaConfig {
    fn default() -> Self {
        Self {
            population_size: 5,
            migration_range: (5.0, 15.0),
            max_antigens: 5,
            csm_weights: [2.0, 2.0],
            k_weights: [2.0, -2.0],
            segment_size: 20,
            anomaly_threshold: 0.65,
        }
    }
}

/// Bounded-queue capacities between stages (spec §5 defaults).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QueueConfig {
    pub collector_to_dca: usize,
    pub dca_to_lymph: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            collector_to_dca: 10_000,
            dca_to_lymph: 1_000,
        }
    }
}

/// Alert shipper connection and reconnect policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShipperConfig {
    pub max_retries: u32,
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
}

impl Default for ShipperConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_secs: 1,
            max_backoff_secs: 30,
        }
    }
}

/// A parsed company-key artifact: `<32-hex-char uuid>:<hostname>:<port>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompanyKey {
    pub company_hash: String,
    pub server_hostname: String,
    pub server_port: u16,
    /// The full `<uuid>:<hostname>:<port>` string as given, unsplit. The
    /// server's credential check compares against this whole string, not
    /// just the hash field (`client_main.py` passes `company_key` itself as
    /// `company_hash` in the auth frame), so this is what the handshake
    /// actually sends.
    pub raw: String,
}

impl CompanyKey {
    /// Resolves the server hostname to a socket address (first result wins).
    pub fn resolve_server_addr(&self) -> Result<std::net::SocketAddr, DcaError> {
        (self.server_hostname.as_str(), self.server_port)
            .to_socket_addrs()
            .map_err(|e| DcaError::Startup(format!("cannot resolve server hostname: {e}")))?
            .next()
            .ok_or_else(|| DcaError::Startup("server hostname resolved to no addresses".into()))
    }
}

/// Parses and validates the company-key artifact format (spec §6).
///
/// Format: `<32-hex-char UUID>:<hostname>:<port>` where hostname matches
/// `^[A-Za-z0-9-]{1,63}$` with no leading/trailing hyphen, and port is
/// decimal. Any other shape is rejected.
pub fn parse_company_key(raw: &str) -> Result<CompanyKey, DcaError> {
    let parts: Vec<&str> = raw.split(':').collect();
    if parts.len() != 3 {
        return Err(DcaError::Startup(format!(
            "malformed company key: expected 3 ':'-separated fields, got {}",
            parts.len()
        )));
    }
    let (hash, hostname, port_str) = (parts[0], parts[1], parts[2]);

    if hash.len() != 32 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(DcaError::Startup(
            "malformed company key: company hash must be 32 hex characters".into(),
        ));
    }
    if !is_valid_hostname(hostname) {
        return Err(DcaError::Startup(format!(
            "malformed company key: invalid hostname '{hostname}'"
        )));
    }
    let port: u16 = port_str
        .parse()
        .map_err(|_| DcaError::Startup(format!("malformed company key: invalid port '{port_str}'")))?;

    Ok(CompanyKey {
        company_hash: hash.to_string(),
        server_hostname: hostname.to_string(),
        server_port: port,
        raw: raw.to_string(),
    })
}

fn is_valid_hostname(s: &str) -> bool {
    if s.is_empty() || s.len() > 63 {
        return false;
    }
    if s.starts_with('-') || s.ends_with('-') {
        return false;
    }
    s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_company_key() {
        let key = parse_company_key("0123456789abcdef0123456789abcdef:my-server:8000").unwrap();
        assert_eq!(key.company_hash, "0123456789abcdef0123456789abcdef");
        assert_eq!(key.server_hostname, "my-server");
        assert_eq!(key.server_port, 8000);
        assert_eq!(key.raw, "0123456789abcdef0123456789abcdef:my-server:8000");
    }

    #[test]
    fn rejects_wrong_hash_length() {
        assert!(parse_company_key("deadbeef:host:8000").is_err());
    }

    #[test]
    fn rejects_leading_hyphen_hostname() {
        let hash = "0".repeat(32);
        assert!(parse_company_key(&format!("{hash}:-host:8000")).is_err());
    }

    #[test]
    fn rejects_trailing_hyphen_hostname() {
        let hash = "0".repeat(32);
        assert!(parse_company_key(&format!("{hash}:host-:8000")).is_err());
    }

    #[test]
    fn rejects_non_numeric_port() {
        let hash = "0".repeat(32);
        assert!(parse_company_key(&format!("{hash}:host:notaport")).is_err());
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert!(parse_company_key("only:two").is_err());
    }
}
