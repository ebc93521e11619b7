use anyhow::{Context, Result};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// --- Engine Settings ---

const CONFIG_PATH_ENV: &str = "STREAMCHAT_CONFIG";
const ENDPOINT_ENV: &str = "STREAMCHAT_ENDPOINT";

/// Sliding-window admission limits for the upstream endpoint.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { max_requests: 30, window_ms: 60_000 }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PreloadConfig {
    pub enabled: bool,
    /// Gap between warm-up fetches of the common queries (ms).
    pub warmup_throttle: u64,
    /// Gap between predicted follow-up fetches (ms).
    pub queue_gap: u64,
    pub max_candidates: usize,
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self { enabled: true, warmup_throttle: 100, queue_gap: 1_000, max_candidates: 3 }
    }
}

/// Recognized engine options. Every field has a default, so an empty JSON
/// object is a valid configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub endpoint: String,
    // Reference to the key, not the key itself - 'keyring', 'env:MY_API_KEY' or null
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_ref: Option<String>,
    #[serde(rename = "cacheTTL")]
    pub cache_ttl: u64,
    #[serde(rename = "preloadCacheTTL")]
    pub preload_cache_ttl: u64,
    pub max_cache_entries: usize,
    pub cache_sweep_interval: u64,
    pub retry_attempts: u32,
    pub retry_delay: u64,
    pub timeout: u64,
    pub rate_limit: RateLimitConfig,
    pub preload: PreloadConfig,
    pub history_window: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_path: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:3000/api/chat/stream".to_string(),
            api_key_ref: None,
            cache_ttl: 5 * 60 * 1000,
            preload_cache_ttl: 15 * 60 * 1000,
            max_cache_entries: 500,
            cache_sweep_interval: 60 * 1000,
            retry_attempts: 3,
            retry_delay: 1_000,
            timeout: 8_000,
            rate_limit: RateLimitConfig::default(),
            preload: PreloadConfig::default(),
            history_window: 10,
            profile_path: None,
        }
    }
}

impl EngineConfig {
    /// Reads a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Loads the file named by `STREAMCHAT_CONFIG` (or defaults), then applies
    /// the `STREAMCHAT_ENDPOINT` override.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => {
                log::info!("Loading engine config from {}", path);
                Self::load(path)?
            }
            Err(_) => {
                log::debug!("{} not set, using default engine config", CONFIG_PATH_ENV);
                Self::default()
            }
        };
        if let Ok(endpoint) = std::env::var(ENDPOINT_ENV) {
            log::debug!("Endpoint overridden from environment: {}", endpoint);
            config.endpoint = endpoint;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            anyhow::bail!("endpoint cannot be empty");
        }
        if self.retry_attempts == 0 {
            anyhow::bail!("retryAttempts must be at least 1");
        }
        if self.rate_limit.max_requests == 0 {
            anyhow::bail!("rateLimit.maxRequests must be at least 1");
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl)
    }

    pub fn preload_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.preload_cache_ttl)
    }

    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.cache_sweep_interval)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    /// Reads the optional user profile JSON named by `profilePath`.
    pub fn load_profile(&self) -> Result<Option<serde_json::Value>> {
        let Some(path) = self.profile_path.as_deref() else {
            return Ok(None);
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read user profile {}", path))?;
        let profile = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse user profile {}", path))?;
        Ok(Some(profile))
    }
}

// --- API Key Retrieval ---

const KEYRING_SERVICE: &str = "streamchat_api_key";
const KEYRING_USER: &str = "default";

/// Retrieves the API key for the backend.
/// `api_key_ref` selects the source: `env:VAR` or `keyring`. No reference means
/// the endpoint is called without credentials.
pub fn get_api_key(config: &EngineConfig) -> Result<Option<String>> {
    match config.api_key_ref.as_deref() {
        Some(ref_str) if ref_str.starts_with("env:") => {
            let env_var_name = ref_str.trim_start_matches("env:");
            log::debug!("Retrieving API key from environment variable: {}", env_var_name);
            std::env::var(env_var_name).map(Some).context(format!(
                "Failed to get API key from environment variable '{}'",
                env_var_name
            ))
        }
        Some("keyring") => {
            let entry = Entry::new(KEYRING_SERVICE, KEYRING_USER)
                .context("Failed to create keyring entry")?;
            log::debug!("Retrieving API key from keyring for service: {}", KEYRING_SERVICE);
            entry
                .get_password()
                .map(Some)
                .context("Failed to get API key from keyring. Store one with set_api_key_in_keyring.")
        }
        Some(other) => Err(anyhow::anyhow!("Unsupported apiKeyRef format: {}", other)),
        None => Ok(None),
    }
}

/// Stores the backend API key in the OS keyring.
pub fn set_api_key_in_keyring(api_key: &str) -> Result<()> {
    let entry = Entry::new(KEYRING_SERVICE, KEYRING_USER)
        .context("Failed to create keyring entry for setting password")?;
    log::info!("Setting API key in keyring for service: {}", KEYRING_SERVICE);
    entry
        .set_password(api_key)
        .context("Failed to set API key in keyring")
}
