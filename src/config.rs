//! Server configuration, deserialized from a TOML file.
//!
//! Every field has a default so a partial (or missing) file is usable.

pub const DEFAULT_CONFIG_PATH: &str = "config/oxmail.toml";

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: InnerServerConfig,
    pub smtpd: InnerSmtpdConfig,
    pub rfc: InnerRfcConfig,
    pub log: InnerLogConfig,
    pub database: InnerDatabaseConfig,
    pub store: InnerStoreConfig,
    pub queue: InnerQueueConfig,
    pub tls: InnerTlsConfig,
    pub clamav: InnerClamavConfig,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct InnerServerConfig {
    /// server identity, used in greetings and synthesized headers
    pub me: String,
    pub addr: std::net::SocketAddr,
    /// paths (tls assets, store, database) are resolved against this directory
    pub base_path: std::path::PathBuf,
    /// omit the software tag and version from the 220 banner
    pub hide_server_signature: bool,
}

impl Default for InnerServerConfig {
    fn default() -> Self {
        Self {
            me: "localhost".to_string(),
            addr: "0.0.0.0:2525".parse().expect("valid default addr"),
            base_path: std::path::PathBuf::from("."),
            hide_server_signature: false,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct InnerSmtpdConfig {
    /// idle timeout, reset on every byte received
    #[serde(with = "humantime_serde")]
    pub server_timeout: std::time::Duration,
    pub concurrency_incoming: i64,
    /// DATA size ceiling, 0 means unlimited
    pub max_data_bytes: usize,
    /// 0 means unlimited
    pub max_rcpt_to: i64,
    /// 0 means unlimited
    pub max_bad_rcpt_to: i64,
    /// 0 means unlimited
    pub max_vrfy: i64,
    pub max_hops: u32,
    /// remote addresses always allowed to relay
    pub relay_allowed_ips: Vec<std::net::IpAddr>,
}

impl Default for InnerSmtpdConfig {
    fn default() -> Self {
        Self {
            server_timeout: std::time::Duration::from_secs(300),
            concurrency_incoming: 20,
            max_data_bytes: 10_485_760,
            max_rcpt_to: 100,
            max_bad_rcpt_to: 5,
            max_vrfy: 10,
            max_hops: 50,
            relay_allowed_ips: vec![],
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct InnerRfcConfig {
    /// refuse MAIL before HELO/EHLO
    pub helo_mandatory: bool,
    /// HELO/EHLO argument must be an address literal or a resolvable fqdn
    pub helo_needs_fqn_or_address: bool,
    /// enforce the 64 byte local-part bound of RFC 5321 4.5.3.1.1
    pub mail_from_localpart_size: bool,
}

impl Default for InnerRfcConfig {
    fn default() -> Self {
        Self {
            helo_mandatory: false,
            helo_needs_fqn_or_address: false,
            mail_from_localpart_size: true,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct InnerLogConfig {
    pub debug_enabled: bool,
    /// log directory, or None for the console
    pub dirpath: Option<std::path::PathBuf>,
}

impl Default for InnerLogConfig {
    fn default() -> Self {
        Self {
            debug_enabled: false,
            dirpath: None,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct InnerDatabaseConfig {
    pub path: std::path::PathBuf,
}

impl Default for InnerDatabaseConfig {
    fn default() -> Self {
        Self {
            path: std::path::PathBuf::from("oxmail.db"),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct InnerStoreConfig {
    pub driver: String,
    pub source: std::path::PathBuf,
}

impl Default for InnerStoreConfig {
    fn default() -> Self {
        Self {
            driver: "disk".to_string(),
            source: std::path::PathBuf::from("store"),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct InnerQueueConfig {
    /// topic the per-recipient queue records are published on
    pub topic: String,
    pub nats_server: String,
}

impl Default for InnerQueueConfig {
    fn default() -> Self {
        Self {
            topic: "todeliver".to_string(),
            nats_server: "127.0.0.1:4222".to_string(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct InnerTlsConfig {
    pub cert: std::path::PathBuf,
    pub key: std::path::PathBuf,
}

impl Default for InnerTlsConfig {
    fn default() -> Self {
        Self {
            cert: std::path::PathBuf::from("ssl/server.crt"),
            key: std::path::PathBuf::from("ssl/server.key"),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct InnerClamavConfig {
    pub enabled: bool,
    pub address: String,
}

impl Default for InnerClamavConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: "127.0.0.1:3310".to_string(),
        }
    }
}

impl Config {
    /// Load the configuration from a TOML file, falling back to the
    /// defaults when the file does not exist.
    pub fn from_path(path: &std::path::Path) -> anyhow::Result<Self> {
        if !path.exists() {
            log::warn!("no configuration file at '{}', using defaults", path.display());
            return Ok(Self::default());
        }
        toml::from_str(&std::fs::read_to_string(path)?)
            .map_err(|e| anyhow::anyhow!("cannot parse '{}': {}", path.display(), e))
    }

    /// resolve a configured path against `server.base_path`
    pub fn resolve(&self, path: &std::path::Path) -> std::path::PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.server.base_path.join(path)
        }
    }
}
