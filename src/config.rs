//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `RPTMOND_AMI_HOST`, `RPTMOND_AMI_PASSWORD`,
//!    `RPTMOND_LISTEN`
//! 2. **Config file** — path via `--config <path>`, or `rptmond.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8080"
//!
//! [ami]
//! host = "127.0.0.1"
//! port = 5038
//! user = "admin"
//! password = "secret"
//! events = true
//! node_ids = [546, 547]
//! retry_min_ms = 1000
//! retry_max_ms = 30000
//!
//! [poll]
//! interval_ms = 5000
//! unkey_delay_ms = 2000
//!
//! [hub]
//! heartbeat_interval_ms = 5000
//! talker_log_max = 200
//! talker_log_ttl_ms = 600000
//! link_tx_batch_window_ms = 100
//! mask_ip_for_non_admin = true
//!
//! [directory]
//! path = "/etc/rptmond/nodes.txt"
//!
//! [auth]
//! admin_token = "change-me-admin"
//! viewer_token = "change-me-viewer"
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ami: AmiConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    /// Optional node-directory enrichment file; omit to run without enrichment.
    pub directory: Option<DirectoryConfig>,
}

/// HTTP/WebSocket listen settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
}

/// AMI connector settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AmiConfig {
    /// AMI host (default `127.0.0.1`). Override with `RPTMOND_AMI_HOST`.
    #[serde(default = "default_ami_host")]
    pub host: String,
    /// AMI port (default 5038).
    #[serde(default = "default_ami_port")]
    pub port: u16,
    /// AMI manager username (default `admin`).
    #[serde(default = "default_ami_user")]
    pub user: String,
    /// AMI manager password. Override with `RPTMOND_AMI_PASSWORD`.
    /// Defaults to `"change-me"`, which triggers a startup warning.
    #[serde(default = "default_ami_password")]
    pub password: String,
    /// `Events: on|off` on login (default `true`).
    #[serde(default = "default_ami_events")]
    pub events: bool,
    /// Local node ids to connect to and poll (default empty — misconfiguration,
    /// but not fatal; the process simply has nothing to do).
    #[serde(default)]
    pub node_ids: Vec<i64>,
    /// Minimum reconnect backoff in milliseconds (default 1000).
    #[serde(default = "default_retry_min_ms")]
    pub retry_min_ms: u64,
    /// Maximum reconnect backoff in milliseconds (default 30000).
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
}

/// Enhanced poller settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PollConfig {
    /// Ticker interval in milliseconds (default 5000).
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,
    /// Unkey-confirmation delay in milliseconds (default 2000).
    #[serde(default = "default_unkey_delay_ms")]
    pub unkey_delay_ms: i64,
}

/// WebSocket hub settings.
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// Heartbeat STATUS_UPDATE broadcast interval in milliseconds (default 5000).
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Talker log ring size cap (default 200).
    #[serde(default = "default_talker_log_max")]
    pub talker_log_max: usize,
    /// Talker log age cap in milliseconds (default 10 min).
    #[serde(default = "default_talker_log_ttl_ms")]
    pub talker_log_ttl_ms: i64,
    /// LINK_TX batching window in milliseconds (default 100).
    #[serde(default = "default_link_tx_batch_window_ms")]
    pub link_tx_batch_window_ms: u64,
    /// Mask the last two octets of IPv4 addresses for non-admin subscribers
    /// (default `true`).
    #[serde(default = "default_mask_ip_for_non_admin")]
    pub mask_ip_for_non_admin: bool,
}

/// WebSocket subscriber tokens. Both empty (the default) disables the
/// `SharedSecretValidator` entirely — the server falls back to
/// `AllowAllAdmin`, suitable only for local development.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub admin_token: String,
    #[serde(default)]
    pub viewer_token: String,
}

/// Node-directory enrichment file location.
#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryConfig {
    /// Path to the pipe-delimited `node|callsign|description|location` file.
    pub path: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_ami_host() -> String {
    "127.0.0.1".to_string()
}
fn default_ami_port() -> u16 {
    5038
}
fn default_ami_user() -> String {
    "admin".to_string()
}
fn default_ami_password() -> String {
    "change-me".to_string()
}
fn default_ami_events() -> bool {
    true
}
fn default_retry_min_ms() -> u64 {
    1000
}
fn default_retry_max_ms() -> u64 {
    30_000
}
fn default_poll_interval_ms() -> u64 {
    5000
}
fn default_unkey_delay_ms() -> i64 {
    crate::keying::DEFAULT_UNKEY_DELAY_MS
}
fn default_heartbeat_interval_ms() -> u64 {
    5000
}
fn default_talker_log_max() -> usize {
    crate::state::DEFAULT_TALKER_LOG_MAX
}
fn default_talker_log_ttl_ms() -> i64 {
    crate::state::DEFAULT_TALKER_LOG_TTL_MS
}
fn default_link_tx_batch_window_ms() -> u64 {
    100
}
fn default_mask_ip_for_non_admin() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for AmiConfig {
    fn default() -> Self {
        Self {
            host: default_ami_host(),
            port: default_ami_port(),
            user: default_ami_user(),
            password: default_ami_password(),
            events: default_ami_events(),
            node_ids: Vec::new(),
            retry_min_ms: default_retry_min_ms(),
            retry_max_ms: default_retry_max_ms(),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
            unkey_delay_ms: default_unkey_delay_ms(),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            talker_log_max: default_talker_log_max(),
            talker_log_ttl_ms: default_talker_log_ttl_ms(),
            link_tx_batch_window_ms: default_link_tx_batch_window_ms(),
            mask_ip_for_non_admin: default_mask_ip_for_non_admin(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure — this runs
    /// before `tracing` is initialized, so there is no logger to report
    /// through yet). Otherwise looks for `rptmond.toml` in the current
    /// directory, falling back to compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("rptmond.toml").exists() {
            let content = std::fs::read_to_string("rptmond.toml").expect("Failed to read rptmond.toml");
            toml::from_str(&content).expect("Failed to parse rptmond.toml")
        } else {
            Config {
                server: ServerConfig::default(),
                ami: AmiConfig::default(),
                poll: PollConfig::default(),
                hub: HubConfig::default(),
                logging: LoggingConfig::default(),
                auth: AuthConfig::default(),
                directory: None,
            }
        };

        if let Ok(host) = std::env::var("RPTMOND_AMI_HOST") {
            config.ami.host = host;
        }
        if let Ok(password) = std::env::var("RPTMOND_AMI_PASSWORD") {
            config.ami.password = password;
        }
        if let Ok(listen) = std::env::var("RPTMOND_LISTEN") {
            config.server.listen = listen;
        }

        config
    }

    /// Basic sanity checks run before the server starts accepting traffic.
    /// Mirrors this crate's convention of collecting all problems up front
    /// rather than failing on the first one found.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.ami.node_ids.is_empty() {
            errors.push("ami.node_ids must list at least one local node".to_string());
        }
        if self.ami.retry_min_ms == 0 {
            errors.push("ami.retry_min_ms must be greater than zero".to_string());
        }
        if self.ami.retry_max_ms < self.ami.retry_min_ms {
            errors.push("ami.retry_max_ms must be >= ami.retry_min_ms".to_string());
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:8080");
        assert_eq!(config.ami.port, 5038);
        assert_eq!(config.poll.unkey_delay_ms, 2000);
        assert!(config.hub.mask_ip_for_non_admin);
        assert!(config.directory.is_none());
    }

    #[test]
    fn validate_flags_missing_node_ids() {
        let config: Config = toml::from_str("").unwrap();
        let errors = config.validate();
        assert!(errors.iter().any(|e| e.contains("node_ids")));
    }

    #[test]
    fn validate_passes_with_node_ids_and_sane_retry_bounds() {
        let config: Config = toml::from_str("[ami]\nnode_ids = [546]\n").unwrap();
        assert!(config.validate().is_empty());
    }
}
