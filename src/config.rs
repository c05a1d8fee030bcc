//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;

/// Default pause before answering an inbound Follow.
///
/// Some peers are still inside their own request/response cycle when the
/// Accept arrives; replying immediately races them.
pub const DEFAULT_HANDSHAKE_DELAY_MS: u64 = 2000;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub federation: FederationConfig,
    pub users: UsersConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain, optionally with port (e.g., "social.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://social.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Federation behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Delay before replying to an inbound Follow/Undo (milliseconds)
    #[serde(default = "default_handshake_delay_ms")]
    pub handshake_delay_ms: u64,
    /// Items per collection page
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Actor cache TTL in seconds; unset keeps entries for the process lifetime
    #[serde(default)]
    pub actor_cache_ttl_secs: Option<u64>,
    /// Maximum accepted `date` skew for signed requests; unset disables the check
    #[serde(default)]
    pub max_clock_skew_secs: Option<i64>,
    /// Outbound HTTP timeout in seconds
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    /// User-Agent for outbound requests
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Scheme used for WebFinger lookups ("https" in production)
    #[serde(default = "default_webfinger_scheme")]
    pub webfinger_scheme: String,
    /// Upper bound on concurrently running background tasks
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Upper bound on items visited when walking a remote collection
    #[serde(default = "default_max_collection_items")]
    pub max_collection_items: usize,
}

impl FederationConfig {
    pub fn handshake_delay(&self) -> Duration {
        Duration::from_millis(self.handshake_delay_ms)
    }

    pub fn actor_cache_ttl(&self) -> Option<Duration> {
        self.actor_cache_ttl_secs.map(Duration::from_secs)
    }
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            handshake_delay_ms: default_handshake_delay_ms(),
            page_size: default_page_size(),
            actor_cache_ttl_secs: None,
            max_clock_skew_secs: None,
            http_timeout_secs: default_http_timeout_secs(),
            user_agent: default_user_agent(),
            webfinger_scheme: default_webfinger_scheme(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            max_collection_items: default_max_collection_items(),
        }
    }
}

fn default_handshake_delay_ms() -> u64 {
    DEFAULT_HANDSHAKE_DELAY_MS
}

fn default_page_size() -> usize {
    20
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_user_agent() -> String {
    format!("fedlink/{}", env!("CARGO_PKG_VERSION"))
}

fn default_webfinger_scheme() -> String {
    "https".to_string()
}

fn default_max_concurrent_tasks() -> usize {
    8
}

fn default_max_collection_items() -> usize {
    1000
}

/// Local users served by the in-memory user store
#[derive(Debug, Clone, Deserialize)]
pub struct UsersConfig {
    /// Local user names; each gets an RSA key pair at startup
    #[serde(default)]
    pub names: Vec<String>,
    /// RSA modulus size for generated keys
    #[serde(default = "default_key_bits")]
    pub key_bits: usize,
}

fn default_key_bits() -> usize {
    2048
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (FEDLINK__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.domain", "localhost:8080")?
            .set_default("server.protocol", "http")?
            .set_default("federation.handshake_delay_ms", DEFAULT_HANDSHAKE_DELAY_MS)?
            .set_default("federation.page_size", 20)?
            .set_default("federation.http_timeout_secs", 30)?
            .set_default("federation.webfinger_scheme", "https")?
            .set_default("federation.max_concurrent_tasks", 8)?
            .set_default("federation.max_collection_items", 1000)?
            .set_default("users.key_bits", 2048)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Load from config/default.toml if it exists
            .add_source(File::with_name("config/default").required(false))
            // Load from config/local.toml if it exists (overrides default)
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (FEDLINK__*)
            .add_source(
                Environment::with_prefix("FEDLINK")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("users.names")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub(crate) fn validate(&self) -> Result<(), crate::error::AppError> {
        let protocol = self.server.protocol.to_ascii_lowercase();
        if protocol != "http" && protocol != "https" {
            return Err(crate::error::AppError::Config(format!(
                "server.protocol must be http or https, got {}",
                self.server.protocol
            )));
        }

        if !is_local_server_domain(&self.server.domain) && protocol != "https" {
            return Err(crate::error::AppError::Config(
                "server.protocol must be https for non-local server domains".to_string(),
            ));
        }

        if self.federation.page_size == 0 {
            return Err(crate::error::AppError::Config(
                "federation.page_size must be greater than 0".to_string(),
            ));
        }

        if self.federation.max_concurrent_tasks == 0 {
            return Err(crate::error::AppError::Config(
                "federation.max_concurrent_tasks must be greater than 0".to_string(),
            ));
        }

        let scheme = self.federation.webfinger_scheme.to_ascii_lowercase();
        if scheme != "http" && scheme != "https" {
            return Err(crate::error::AppError::Config(format!(
                "federation.webfinger_scheme must be http or https, got {}",
                self.federation.webfinger_scheme
            )));
        }

        if self.federation.handshake_delay_ms == 0 {
            tracing::warn!("federation.handshake_delay_ms=0; Accept replies are sent immediately");
        }

        Ok(())
    }
}

fn normalized_server_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

fn is_local_server_domain(domain: &str) -> bool {
    let host = normalized_server_host(domain);
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AppConfig {
        AppConfig {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                domain: "localhost:8080".to_string(),
                protocol: "http".to_string(),
            },
            federation: FederationConfig::default(),
            users: UsersConfig {
                names: vec!["alice".to_string()],
                key_bits: 2048,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }

    #[test]
    fn validate_accepts_http_on_localhost() {
        let config = valid_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.base_url(), "http://localhost:8080");
    }

    #[test]
    fn validate_rejects_http_for_non_local_domain() {
        let mut config = valid_config();
        config.server.domain = "social.example.com".to_string();

        let error = config
            .validate()
            .expect_err("public domains must require https");
        assert!(matches!(
            error,
            crate::error::AppError::Config(message)
                if message.contains("server.protocol must be https")
        ));
    }

    #[test]
    fn validate_rejects_zero_page_size() {
        let mut config = valid_config();
        config.federation.page_size = 0;

        assert!(matches!(
            config.validate(),
            Err(crate::error::AppError::Config(message)) if message.contains("page_size")
        ));
    }

    #[test]
    fn federation_defaults_keep_two_second_handshake_delay() {
        let federation = FederationConfig::default();
        assert_eq!(federation.handshake_delay(), Duration::from_secs(2));
        assert!(federation.actor_cache_ttl().is_none());
        assert!(federation.max_clock_skew_secs.is_none());
        assert_eq!(federation.webfinger_scheme, "https");
    }
}
