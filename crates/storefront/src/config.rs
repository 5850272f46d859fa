//! Store configuration loaded from environment variables.
//!
//! # Environment Variables
//!
//! All variables are optional; an empty environment yields the in-memory
//! configuration returned by [`StoreConfig::default`].
//!
//! - `SHOPSTATE_STORAGE_DIR` - Directory for guest state files (default: in-memory)
//! - `SHOPSTATE_STORAGE_QUOTA_BYTES` - Local storage quota (default: 5242880)
//! - `SHOPSTATE_REMOTE_URL` - REST backend base URL (default: in-memory backend)
//! - `SHOPSTATE_REMOTE_API_KEY` - REST backend API key (required with `SHOPSTATE_REMOTE_URL`)
//! - `SHOPSTATE_POLL_INTERVAL_MS` - Live feed polling period (default: 2000)
//! - `SHOPSTATE_PAGE_SIZE` - Infinite list page size (default: 6)
//! - `SHOPSTATE_CATALOG_CACHE_TTL_SECS` - Single-product cache TTL (default: 300)
//! - `SHOPSTATE_CATALOG_CACHE_CAPACITY` - Single-product cache capacity (default: 1000)
//! - `SHOPSTATE_PRICE_FLOOR` / `SHOPSTATE_PRICE_CEILING` - Price bounds of an empty catalog (default: 0)
//! - `SENTRY_DSN` - Sentry error tracking DSN
//! - `SENTRY_ENVIRONMENT` - Sentry environment name

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use secrecy::SecretString;
use shopstate_core::Price;
use thiserror::Error;
use url::Url;

const MIN_ENTROPY_BITS_PER_CHAR: f64 = 3.3;

const DEFAULT_STORAGE_QUOTA_BYTES: usize = 5 * 1024 * 1024;
const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;
const DEFAULT_PAGE_SIZE: usize = 6;
const DEFAULT_CACHE_TTL_SECS: u64 = 300;
const DEFAULT_CACHE_CAPACITY: u64 = 1000;

/// Blocklist of common placeholder patterns (case-insensitive)
const PLACEHOLDER_PATTERNS: &[&str] = &[
    "your-",
    "changeme",
    "replace",
    "placeholder",
    "example",
    "secret",
    "password",
    "xxx",
    "todo",
    "fixme",
    "insert",
    "enter-",
    "put-your",
    "add-your",
];

/// Configuration errors that can occur during loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
    #[error("Insecure secret in {0}: {1}")]
    InsecureSecret(String, String),
}

/// Storefront state layer configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Guest state persistence
    pub storage: StorageConfig,
    /// Remote backend; `None` selects the in-process backend
    pub remote: Option<RemoteConfig>,
    /// Infinite list page size
    pub page_size: usize,
    /// Product catalog settings
    pub catalog: CatalogConfig,
    /// Sentry DSN for error tracking
    pub sentry_dsn: Option<String>,
    /// Sentry environment name
    pub sentry_environment: Option<String>,
}

/// Local (guest) storage configuration.
#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    /// Directory for guest state files; `None` keeps guest state in memory
    pub dir: Option<PathBuf>,
    /// Total bytes the adapter may hold
    pub quota_bytes: usize,
}

/// REST backend configuration.
///
/// Implements `Debug` manually to redact the API key.
#[derive(Clone)]
pub struct RemoteConfig {
    /// Base URL of the backend (e.g. `https://project.example.co`)
    pub base_url: Url,
    /// API key sent with every request
    pub api_key: SecretString,
    /// How often live feeds poll for changes
    pub poll_interval: Duration,
}

impl std::fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("base_url", &self.base_url.as_str())
            .field("api_key", &"[REDACTED]")
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

/// Product catalog configuration.
#[derive(Debug, Clone)]
pub struct CatalogConfig {
    /// Time-to-live of single-product cache entries
    pub cache_ttl: Duration,
    /// Maximum number of cached single-product lookups
    pub cache_capacity: u64,
    /// Price bounds reported while the catalog is empty
    pub fallback_price_bounds: (Price, Price),
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig {
                dir: None,
                quota_bytes: DEFAULT_STORAGE_QUOTA_BYTES,
            },
            remote: None,
            page_size: DEFAULT_PAGE_SIZE,
            catalog: CatalogConfig::default(),
            sentry_dsn: None,
            sentry_environment: None,
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            fallback_price_bounds: (Price::ZERO, Price::ZERO),
        }
    }
}

impl StoreConfig {
    /// Load configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv()` to load from `.env` file if present.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable cannot be parsed, if the remote URL
    /// is set without an API key, or if the API key fails validation
    /// (placeholder detection, entropy check).
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let storage = StorageConfig {
            dir: get_optional_env("SHOPSTATE_STORAGE_DIR").map(PathBuf::from),
            quota_bytes: get_parsed_or_default(
                "SHOPSTATE_STORAGE_QUOTA_BYTES",
                DEFAULT_STORAGE_QUOTA_BYTES,
            )?,
        };
        let remote = RemoteConfig::from_env()?;
        let page_size = get_parsed_or_default("SHOPSTATE_PAGE_SIZE", DEFAULT_PAGE_SIZE)?;
        if page_size == 0 {
            return Err(ConfigError::InvalidEnvVar(
                "SHOPSTATE_PAGE_SIZE".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        let catalog = CatalogConfig::from_env()?;

        Ok(Self {
            storage,
            remote,
            page_size,
            catalog,
            sentry_dsn: get_optional_env("SENTRY_DSN"),
            sentry_environment: get_optional_env("SENTRY_ENVIRONMENT"),
        })
    }
}

impl RemoteConfig {
    fn from_env() -> Result<Option<Self>, ConfigError> {
        let Some(raw_url) = get_optional_env("SHOPSTATE_REMOTE_URL") else {
            return Ok(None);
        };
        let base_url = Url::parse(&raw_url).map_err(|e| {
            ConfigError::InvalidEnvVar("SHOPSTATE_REMOTE_URL".to_string(), e.to_string())
        })?;
        let api_key = get_validated_secret("SHOPSTATE_REMOTE_API_KEY")?;
        let poll_ms = get_parsed_or_default("SHOPSTATE_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS)?;

        Ok(Some(Self {
            base_url,
            api_key,
            poll_interval: Duration::from_millis(poll_ms.max(1)),
        }))
    }
}

impl CatalogConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let floor: Decimal = get_parsed_or_default("SHOPSTATE_PRICE_FLOOR", Decimal::ZERO)?;
        let ceiling: Decimal = get_parsed_or_default("SHOPSTATE_PRICE_CEILING", Decimal::ZERO)?;
        if ceiling < floor {
            return Err(ConfigError::InvalidEnvVar(
                "SHOPSTATE_PRICE_CEILING".to_string(),
                format!("must not be below SHOPSTATE_PRICE_FLOOR ({floor})"),
            ));
        }

        Ok(Self {
            cache_ttl: Duration::from_secs(get_parsed_or_default(
                "SHOPSTATE_CATALOG_CACHE_TTL_SECS",
                DEFAULT_CACHE_TTL_SECS,
            )?),
            cache_capacity: get_parsed_or_default(
                "SHOPSTATE_CATALOG_CACHE_CAPACITY",
                DEFAULT_CACHE_CAPACITY,
            )?,
            fallback_price_bounds: (Price::new(floor), Price::new(ceiling)),
        })
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Get a required environment variable.
fn get_required_env(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

/// Get an optional environment variable, treating blank values as unset.
fn get_optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Parse an optional environment variable, falling back to `default` when unset.
fn get_parsed_or_default<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get_optional_env(key).map_or(Ok(default), |raw| parse_value(key, &raw))
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidEnvVar(key.to_string(), e.to_string()))
}

/// Calculate Shannon entropy in bits per character.
fn shannon_entropy(s: &str) -> f64 {
    if s.is_empty() {
        return 0.0;
    }

    let mut freq: HashMap<char, usize> = HashMap::new();
    for c in s.chars() {
        *freq.entry(c).or_insert(0) += 1;
    }

    #[allow(clippy::cast_precision_loss)] // String length will never exceed f64 precision
    let len = s.len() as f64;
    freq.values()
        .map(|&count| {
            #[allow(clippy::cast_precision_loss)] // Character count will never exceed f64 precision
            let p = count as f64 / len;
            -p * p.log2()
        })
        .sum()
}

/// Validate that a secret is not a placeholder and has sufficient entropy.
fn validate_secret_strength(secret: &str, var_name: &str) -> Result<(), ConfigError> {
    let lower = secret.to_lowercase();

    for pattern in PLACEHOLDER_PATTERNS {
        if lower.contains(pattern) {
            return Err(ConfigError::InsecureSecret(
                var_name.to_string(),
                format!("appears to be a placeholder (contains '{pattern}')"),
            ));
        }
    }

    let entropy = shannon_entropy(secret);
    if entropy < MIN_ENTROPY_BITS_PER_CHAR {
        return Err(ConfigError::InsecureSecret(
            var_name.to_string(),
            format!(
                "entropy too low ({entropy:.2} bits/char, need >= {MIN_ENTROPY_BITS_PER_CHAR:.1}). Use the key issued by the backend."
            ),
        ));
    }

    Ok(())
}

/// Load and validate a secret from environment.
fn get_validated_secret(key: &str) -> Result<SecretString, ConfigError> {
    let value = get_required_env(key)?;
    validate_secret_strength(&value, key)?;
    Ok(SecretString::from(value))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_shannon_entropy_empty() {
        assert!((shannon_entropy("") - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_shannon_entropy_two_chars() {
        // "ab" has entropy of 1 bit per char (50% a, 50% b)
        let entropy = shannon_entropy("ab");
        assert!((entropy - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_validate_secret_strength_placeholder() {
        let err = validate_secret_strength("your-api-key-here", "TEST_VAR").unwrap_err();
        assert!(matches!(err, ConfigError::InsecureSecret(_, _)));
    }

    #[test]
    fn test_validate_secret_strength_low_entropy() {
        let err = validate_secret_strength("aaaaaaaaaaaaaaaaaaaaaaaa", "TEST_VAR").unwrap_err();
        assert!(matches!(err, ConfigError::InsecureSecret(_, _)));
    }

    #[test]
    fn test_validate_secret_strength_valid() {
        let result = validate_secret_strength("aB3$xY9!mK2@nL5#pQ7&rT0*uW4^zC6", "TEST_VAR");
        assert!(result.is_ok());
    }

    #[test]
    fn test_parse_value_reports_variable() {
        let err = parse_value::<usize>("SHOPSTATE_PAGE_SIZE", "six").unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidEnvVar(ref key, _) if key == "SHOPSTATE_PAGE_SIZE")
        );
        assert_eq!(parse_value::<u64>("X", " 250 ").unwrap(), 250);
    }

    #[test]
    fn test_default_is_in_memory() {
        let config = StoreConfig::default();
        assert!(config.storage.dir.is_none());
        assert!(config.remote.is_none());
        assert_eq!(config.page_size, 6);
        assert_eq!(config.storage.quota_bytes, 5 * 1024 * 1024);
        assert_eq!(config.catalog.cache_ttl, Duration::from_secs(300));
        assert_eq!(
            config.catalog.fallback_price_bounds,
            (Price::ZERO, Price::ZERO)
        );
    }

    #[test]
    fn test_remote_config_debug_redacts_api_key() {
        let config = RemoteConfig {
            base_url: Url::parse("https://project.backend.test").unwrap(),
            api_key: SecretString::from("super_secret_api_key_value"),
            poll_interval: Duration::from_millis(2000),
        };

        let debug_output = format!("{config:?}");

        assert!(debug_output.contains("project.backend.test"));
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("super_secret_api_key_value"));
    }
}
