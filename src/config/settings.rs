//! Application settings and configuration
//!
//! This module provides configuration management for the application,
//! loading settings from environment variables with sensible defaults.

use crate::services::{ClassificationPolicy, ForwarderConfig, HealthPolicy, PoolConfig};
use crate::utils::Backoff;
use anyhow::{anyhow, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Application environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    #[value(alias = "dev")]
    Development,
    #[value(alias = "stage")]
    Staging,
    #[value(alias = "prod")]
    Production,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Development => write!(f, "development"),
            Environment::Staging => write!(f, "staging"),
            Environment::Production => write!(f, "production"),
        }
    }
}

impl FromStr for Environment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "staging" | "stage" => Ok(Environment::Staging),
            "production" | "prod" => Ok(Environment::Production),
            _ => anyhow::bail!("Invalid environment: {}. Expected: development, staging, or production", s),
        }
    }
}

/// Upstream API configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    pub base_url: String,
    /// Per-attempt deadline for the response head
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Longest silence allowed between two body chunks
    pub read_timeout_secs: u64,
    /// Secrets registered into the pool at boot
    #[serde(skip_serializing, default)]
    pub api_keys: Vec<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://openrouter.ai/api".to_string(),
            timeout_secs: 30,
            connect_timeout_secs: 10,
            read_timeout_secs: 60,
            api_keys: Vec::new(),
        }
    }
}

/// Forwarding retry configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Base pause between attempts, 0 disables it
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_ms: 0,
        }
    }
}

/// Circuit breaker and rotation configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BreakerConfig {
    pub degrade_threshold: u32,
    pub open_threshold: u32,
    pub transport_threshold: u32,
    pub cooldown_secs: u64,
    pub cooldown_max_secs: u64,
    pub usage_window_secs: u64,
    pub default_weight: u32,
    pub monitor_interval_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            degrade_threshold: 2,
            open_threshold: 5,
            transport_threshold: 3,
            cooldown_secs: 60,
            cooldown_max_secs: 600,
            usage_window_secs: 3600,
            default_weight: 8,
            monitor_interval_secs: 30,
        }
    }
}

/// Upstream status codes counted against a credential or treated as transient
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClassificationConfig {
    pub credential_error_statuses: Vec<u16>,
    pub transient_error_statuses: Vec<u16>,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            credential_error_statuses: vec![401, 402, 403, 429],
            transient_error_statuses: vec![500, 502, 503, 504],
        }
    }
}

/// Client rate limiting configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests_per_window: u32,
    pub window_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_window: 1000,
            window_seconds: 3600,
        }
    }
}

/// Main application settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    // App settings
    pub app_name: String,
    pub app_version: String,
    pub environment: Environment,
    pub log_level: String,

    // Server settings
    pub host: String,
    pub port: u16,

    pub upstream: UpstreamConfig,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub classification: ClassificationConfig,

    // Authentication
    pub require_api_key: bool,
    #[serde(skip_serializing, default)]
    pub client_api_keys: Vec<String>,
    #[serde(skip_serializing)]
    pub master_api_key: Option<String>,

    // Rate limiting
    pub rate_limit: RateLimitConfig,

    /// JSON file holding credential secrets and health records; unset keeps them in memory
    pub credential_store_path: Option<PathBuf>,

    /// Ephemeral client key (generated at startup when no key is configured)
    #[serde(skip)]
    pub ephemeral_api_key: Option<String>,
}

impl Settings {
    /// Load settings from environment variables with defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists (ignored in production typically)
        dotenvy::dotenv().ok();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build settings from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let cooldown_secs: u64 = parse_var(&lookup, "COOLDOWN_SECS", 60)?;

        let settings = Self {
            // App settings
            app_name: var("APP_NAME", "credential-gateway"),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            environment: var("ENVIRONMENT", "development").parse()?,
            log_level: var("LOG_LEVEL", "info"),

            // Server settings
            host: var("HOST", "0.0.0.0"),
            port: parse_var(&lookup, "PORT", 8080)?,

            upstream: UpstreamConfig {
                base_url: var("UPSTREAM_BASE_URL", "https://openrouter.ai/api"),
                timeout_secs: parse_var(&lookup, "UPSTREAM_TIMEOUT_SECS", 30)?,
                connect_timeout_secs: parse_var(&lookup, "UPSTREAM_CONNECT_TIMEOUT_SECS", 10)?,
                read_timeout_secs: parse_var(&lookup, "UPSTREAM_READ_TIMEOUT_SECS", 60)?,
                api_keys: split_list(&var("UPSTREAM_API_KEYS", "")),
            },

            retry: RetryConfig {
                max_retries: parse_var(&lookup, "MAX_RETRIES", 2)?,
                backoff_ms: parse_var(&lookup, "RETRY_BACKOFF_MS", 0)?,
            },

            breaker: BreakerConfig {
                degrade_threshold: parse_var(&lookup, "DEGRADE_THRESHOLD", 2)?,
                open_threshold: parse_var(&lookup, "OPEN_THRESHOLD", 5)?,
                transport_threshold: parse_var(&lookup, "TRANSPORT_THRESHOLD", 3)?,
                cooldown_secs,
                cooldown_max_secs: parse_var(
                    &lookup,
                    "COOLDOWN_MAX_SECS",
                    cooldown_secs.saturating_mul(10),
                )?,
                usage_window_secs: parse_var(&lookup, "USAGE_WINDOW_SECS", 3600)?,
                default_weight: parse_var(&lookup, "DEFAULT_CREDENTIAL_WEIGHT", 8)?,
                monitor_interval_secs: parse_var(&lookup, "MONITOR_INTERVAL_SECS", 30)?,
            },

            classification: ClassificationConfig {
                credential_error_statuses: parse_statuses(
                    "CREDENTIAL_ERROR_STATUSES",
                    &var("CREDENTIAL_ERROR_STATUSES", "401,402,403,429"),
                )?,
                transient_error_statuses: parse_statuses(
                    "TRANSIENT_ERROR_STATUSES",
                    &var("TRANSIENT_ERROR_STATUSES", "500,502,503,504"),
                )?,
            },

            // Authentication
            require_api_key: parse_var(&lookup, "REQUIRE_API_KEY", true)?,
            client_api_keys: split_list(&var("CLIENT_API_KEYS", "")),
            master_api_key: lookup("MASTER_API_KEY").filter(|key| !key.trim().is_empty()),

            // Rate limiting
            rate_limit: RateLimitConfig {
                enabled: parse_var(&lookup, "RATE_LIMIT_ENABLED", true)?,
                requests_per_window: parse_var(&lookup, "RATE_LIMIT_REQUESTS_PER_WINDOW", 1000)?,
                window_seconds: parse_var(&lookup, "RATE_LIMIT_WINDOW_SECONDS", 3600)?,
            },

            credential_store_path: lookup("CREDENTIAL_STORE_PATH")
                .map(|path| path.trim().to_string())
                .filter(|path| !path.is_empty())
                .map(PathBuf::from),

            ephemeral_api_key: None,
        };

        // Validate settings
        settings.validate()?;

        Ok(settings)
    }

    /// Validate settings
    pub fn validate(&self) -> Result<()> {
        // Validate port range
        if self.port == 0 {
            anyhow::bail!("Port cannot be 0");
        }

        if self.upstream.timeout_secs == 0 {
            anyhow::bail!("UPSTREAM_TIMEOUT_SECS must be > 0");
        }
        if self.upstream.read_timeout_secs == 0 {
            anyhow::bail!("UPSTREAM_READ_TIMEOUT_SECS must be > 0");
        }

        let breaker = &self.breaker;
        if breaker.degrade_threshold == 0 {
            anyhow::bail!("DEGRADE_THRESHOLD must be > 0");
        }
        if breaker.open_threshold < breaker.degrade_threshold {
            anyhow::bail!(
                "OPEN_THRESHOLD ({}) must be >= DEGRADE_THRESHOLD ({})",
                breaker.open_threshold,
                breaker.degrade_threshold
            );
        }
        if breaker.transport_threshold == 0 {
            anyhow::bail!("TRANSPORT_THRESHOLD must be > 0");
        }
        if breaker.cooldown_secs == 0 {
            anyhow::bail!("COOLDOWN_SECS must be > 0");
        }
        if breaker.cooldown_max_secs < breaker.cooldown_secs {
            anyhow::bail!("COOLDOWN_MAX_SECS must be >= COOLDOWN_SECS");
        }
        if breaker.monitor_interval_secs == 0 {
            anyhow::bail!("MONITOR_INTERVAL_SECS must be > 0");
        }

        let credential: HashSet<_> = self.classification.credential_error_statuses.iter().collect();
        if let Some(status) = self
            .classification
            .transient_error_statuses
            .iter()
            .find(|status| credential.contains(status))
        {
            anyhow::bail!("Status {} is listed as both a credential and a transient error", status);
        }

        // Validate rate limit settings
        if self.rate_limit.enabled {
            if self.rate_limit.requests_per_window == 0 {
                anyhow::bail!("Rate limit requests_per_window must be > 0");
            }
            if self.rate_limit.window_seconds == 0 {
                anyhow::bail!("Rate limit window_seconds must be > 0");
            }
        }

        // Warn if no API key auth in production
        if self.environment == Environment::Production && !self.require_api_key {
            tracing::warn!("Running in production without API key authentication!");
        }

        Ok(())
    }

    /// Check if running in development mode
    pub fn is_development(&self) -> bool {
        self.environment == Environment::Development
    }

    /// Check if running in production mode
    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }

    /// Get the server address string
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn health_policy(&self) -> HealthPolicy {
        HealthPolicy {
            degrade_threshold: self.breaker.degrade_threshold,
            open_threshold: self.breaker.open_threshold,
            transport_threshold: self.breaker.transport_threshold,
            cooldown: Backoff::new(
                Duration::from_secs(self.breaker.cooldown_secs),
                Duration::from_secs(self.breaker.cooldown_max_secs),
            ),
            usage_window: Duration::from_secs(self.breaker.usage_window_secs),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::new(self.health_policy()).with_default_weight(self.breaker.default_weight)
    }

    pub fn forwarder_config(&self) -> ForwarderConfig {
        ForwarderConfig {
            max_retries: self.retry.max_retries,
            attempt_timeout: Duration::from_secs(self.upstream.timeout_secs),
            retry_backoff: Backoff::new(
                Duration::from_millis(self.retry.backoff_ms),
                Duration::from_millis(self.retry.backoff_ms.saturating_mul(8)),
            )
            .with_jitter(true),
        }
    }

    pub fn classification_policy(&self) -> ClassificationPolicy {
        ClassificationPolicy::new(
            self.classification.credential_error_statuses.iter().copied(),
            self.classification.transient_error_statuses.iter().copied(),
        )
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.breaker.monitor_interval_secs)
    }

    /// Generate and set an ephemeral client API key
    /// Returns the generated key
    pub fn generate_ephemeral_key(&mut self) -> String {
        let key = format!("sk-{}", uuid::Uuid::new_v4().simple());
        self.ephemeral_api_key = Some(key.clone());
        key
    }

    /// Every client token accepted on the forwarding routes
    pub fn accepted_client_keys(&self) -> impl Iterator<Item = &str> {
        self.client_api_keys
            .iter()
            .map(String::as_str)
            .chain(self.ephemeral_api_key.as_deref())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app_name: "credential-gateway".to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            environment: Environment::Development,
            log_level: "info".to_string(),
            host: "0.0.0.0".to_string(),
            port: 8080,
            upstream: UpstreamConfig::default(),
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
            classification: ClassificationConfig::default(),
            require_api_key: true,
            client_api_keys: Vec::new(),
            master_api_key: None,
            rate_limit: RateLimitConfig::default(),
            credential_store_path: None,
            ephemeral_api_key: None,
        }
    }
}

/// Parse an optional variable, falling back to `default` when unset
fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("Invalid {} value '{}': {}", key, raw, e)),
        _ => Ok(default),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_statuses(key: &str, raw: &str) -> Result<Vec<u16>> {
    split_list(raw)
        .into_iter()
        .map(|item| {
            let status: u16 = item
                .parse()
                .map_err(|e| anyhow!("Invalid {} entry '{}': {}", key, item, e))?;
            if !(100..=599).contains(&status) {
                anyhow::bail!("Invalid {} entry '{}': not an HTTP status", key, status);
            }
            Ok(status)
        })
        .collect()
}
