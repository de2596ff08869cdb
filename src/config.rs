//! Process configuration read from the environment.
//!
//! Every setting goes through a lookup function so configurations can be
//! built from a plain map in tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::domain::{CategorySet, ConfigError, ImageMediaType};

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(ConfigError::InvalidValue {
                key: "LOG_FORMAT".to_string(),
                message: format!("unknown format '{other}'"),
            }),
        }
    }
}

/// Where creation events go.
#[derive(Debug, Clone)]
pub struct EventConfig {
    pub nats_url: String,
    /// Exchange the events are published to (a JetStream stream).
    pub exchange: String,
    pub routing_key: String,
    /// Subject patterns bound to the exchange.
    pub bindings: Vec<String>,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            nats_url: "nats://127.0.0.1:4222".to_string(),
            exchange: "topic_fleet".to_string(),
            routing_key: "items.create".to_string(),
            bindings: vec!["items.>".to_string()],
        }
    }
}

/// Rules applied to uploaded images.
#[derive(Debug, Clone)]
pub struct ImagePolicy {
    pub max_bytes: usize,
    pub allowed_types: Vec<ImageMediaType>,
}

impl ImagePolicy {
    pub fn allows(&self, media_type: ImageMediaType) -> bool {
        self.allowed_types.contains(&media_type)
    }
}

impl Default for ImagePolicy {
    fn default() -> Self {
        Self {
            max_bytes: 1024 * 1024,
            allowed_types: vec![ImageMediaType::Jpeg, ImageMediaType::Png],
        }
    }
}

/// Background re-announcement of ledgered items.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub batch_size: i64,
    pub max_attempts: i32,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            batch_size: 20,
            max_attempts: 10,
        }
    }
}

/// Rate limiter configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Requests per second for item endpoints
    pub general_rps: u32,
    /// Burst size for item endpoints
    pub general_burst: u32,
    /// Requests per second for health endpoints
    pub health_rps: u32,
    /// Burst size for health endpoints
    pub health_burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            general_rps: 10,
            general_burst: 20,
            health_rps: 100,
            health_burst: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: SecretString,
    pub api_auth_key: SecretString,
    pub user_service_url: String,
    pub blob_root: PathBuf,
    pub blob_quota_bytes: Option<u64>,
    pub events: EventConfig,
    pub categories: CategorySet,
    pub images: ImagePolicy,
    /// Upper bound on every collaborator call made inside a request.
    pub call_timeout: Duration,
    pub server_addr: SocketAddr,
    pub reconcile: ReconcileConfig,
    pub rate_limit: RateLimitConfig,
    pub log_format: LogFormat,
}

impl AppConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration from a map, for tests and tooling.
    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_lookup(|key| vars.get(key).cloned())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);

        let events = EventConfig {
            nats_url: env.or_default("NATS_URL", "nats://127.0.0.1:4222"),
            exchange: env.or_default("EVENT_EXCHANGE", "topic_fleet"),
            routing_key: env.or_default("EVENT_ROUTING_KEY", "items.create"),
            bindings: env.list("EVENT_BINDINGS", "items.>"),
        };
        if !events
            .bindings
            .iter()
            .any(|pattern| subject_matches(pattern, &events.routing_key))
        {
            return Err(ConfigError::InvalidValue {
                key: "EVENT_BINDINGS".to_string(),
                message: format!(
                    "no binding routes '{}' into '{}'",
                    events.routing_key, events.exchange
                ),
            });
        }

        let categories = CategorySet::new(env.list("ITEM_CATEGORIES", "CH,LA,CO,RI"));
        if categories.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "ITEM_CATEGORIES".to_string(),
                message: "at least one category code is required".to_string(),
            });
        }

        let allowed_types = env
            .list("ALLOWED_IMAGE_TYPES", "image/jpeg,image/png")
            .iter()
            .map(|mime| {
                ImageMediaType::from_mime(mime).ok_or_else(|| ConfigError::InvalidValue {
                    key: "ALLOWED_IMAGE_TYPES".to_string(),
                    message: format!("unsupported media type '{mime}'"),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let defaults = RateLimitConfig::default();

        Ok(Self {
            database_url: SecretString::from(env.required("DATABASE_URL")?),
            api_auth_key: SecretString::from(env.required("API_AUTH_KEY")?),
            user_service_url: env.or_default("USER_SERVICE_URL", "http://127.0.0.1:8081"),
            blob_root: PathBuf::from(env.or_default("BLOB_ROOT", "./data/blobs")),
            blob_quota_bytes: env.optional("BLOB_QUOTA_BYTES")?,
            events,
            categories,
            images: ImagePolicy {
                max_bytes: env.parsed("MAX_IMAGE_BYTES", 1024 * 1024)?,
                allowed_types,
            },
            call_timeout: Duration::from_millis(env.positive("EXTERNAL_CALL_TIMEOUT_MS", 5000)?),
            server_addr: env.parsed("SERVER_ADDR", SocketAddr::from(([0, 0, 0, 0], 3000)))?,
            reconcile: ReconcileConfig {
                enabled: env.parsed("RECONCILE_ENABLED", true)?,
                interval: Duration::from_secs(env.positive("RECONCILE_INTERVAL_SECS", 30)?),
                batch_size: env.positive("RECONCILE_BATCH_SIZE", 20)?,
                max_attempts: env.positive("RECONCILE_MAX_ATTEMPTS", 10)?,
            },
            rate_limit: RateLimitConfig {
                general_rps: env.parsed("RATE_LIMIT_RPS", defaults.general_rps)?,
                general_burst: env.parsed("RATE_LIMIT_BURST", defaults.general_burst)?,
                ..defaults
            },
            log_format: env.optional("LOG_FORMAT")?.unwrap_or_default(),
        })
    }
}

/// NATS subject matching: `*` matches one token, a trailing `>` one or more.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return pattern_tokens.next().is_none(),
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

struct Env<'a, F>(&'a F);

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|value| !value.trim().is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.get(key)
            .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
    }

    fn or_default(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn list(&self, key: &str, default: &str) -> Vec<String> {
        self.or_default(key, default)
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn optional<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|raw| {
                raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: e.to_string(),
                })
            })
            .transpose()
    }

    fn parsed<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        Ok(self.optional(key)?.unwrap_or(default))
    }

    fn positive<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr + PartialOrd + Default,
        T::Err: std::fmt::Display,
    {
        let value = self.parsed(key, default)?;
        if value <= T::default() {
            return Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([
            (
                "DATABASE_URL".to_string(),
                "postgres://localhost/items".to_string(),
            ),
            ("API_AUTH_KEY".to_string(), "secret-key".to_string()),
        ])
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_map(&base_vars()).unwrap();

        assert_eq!(config.database_url.expose_secret(), "postgres://localhost/items");
        assert_eq!(config.events.exchange, "topic_fleet");
        assert_eq!(config.events.routing_key, "items.create");
        assert_eq!(config.events.bindings, vec!["items.>".to_string()]);
        assert!(config.categories.contains("RI"));
        assert_eq!(config.images.max_bytes, 1024 * 1024);
        assert!(config.images.allows(ImageMediaType::Png));
        assert_eq!(config.call_timeout, Duration::from_secs(5));
        assert_eq!(config.server_addr.port(), 3000);
        assert!(config.blob_quota_bytes.is_none());
        assert_eq!(config.reconcile.max_attempts, 10);
        assert_eq!(config.rate_limit.general_rps, 10);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_missing_required_variable() {
        let mut vars = base_vars();
        vars.remove("API_AUTH_KEY");

        let err = AppConfig::from_map(&vars).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref key) if key == "API_AUTH_KEY"));
    }

    #[test]
    fn test_blank_value_counts_as_missing() {
        let mut vars = base_vars();
        vars.insert("DATABASE_URL".to_string(), "  ".to_string());

        assert!(matches!(
            AppConfig::from_map(&vars),
            Err(ConfigError::MissingEnvVar(_))
        ));
    }

    #[test]
    fn test_overrides() {
        let mut vars = base_vars();
        vars.insert("ITEM_CATEGORIES".to_string(), "CH, LA ,".to_string());
        vars.insert("MAX_IMAGE_BYTES".to_string(), "2048".to_string());
        vars.insert("ALLOWED_IMAGE_TYPES".to_string(), "image/png".to_string());
        vars.insert("BLOB_QUOTA_BYTES".to_string(), "1000000".to_string());
        vars.insert("LOG_FORMAT".to_string(), "pretty".to_string());
        vars.insert("RECONCILE_ENABLED".to_string(), "false".to_string());

        let config = AppConfig::from_map(&vars).unwrap();
        assert!(config.categories.contains("LA"));
        assert!(!config.categories.contains("CO"));
        assert_eq!(config.images.max_bytes, 2048);
        assert!(!config.images.allows(ImageMediaType::Jpeg));
        assert_eq!(config.blob_quota_bytes, Some(1_000_000));
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert!(!config.reconcile.enabled);
    }

    #[test]
    fn test_malformed_number() {
        let mut vars = base_vars();
        vars.insert("EXTERNAL_CALL_TIMEOUT_MS".to_string(), "soon".to_string());

        let err = AppConfig::from_map(&vars).unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "EXTERNAL_CALL_TIMEOUT_MS")
        );
    }

    #[test]
    fn test_non_positive_values_rejected() {
        for key in ["EXTERNAL_CALL_TIMEOUT_MS", "RECONCILE_INTERVAL_SECS", "RECONCILE_BATCH_SIZE"] {
            let mut vars = base_vars();
            vars.insert(key.to_string(), "0".to_string());

            let err = AppConfig::from_map(&vars).unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidValue { key: ref k, .. } if k == key),
                "{key}"
            );
        }

        let mut vars = base_vars();
        vars.insert("RECONCILE_MAX_ATTEMPTS".to_string(), "-1".to_string());
        assert!(AppConfig::from_map(&vars).is_err());
    }

    #[test]
    fn test_unsupported_image_type() {
        let mut vars = base_vars();
        vars.insert("ALLOWED_IMAGE_TYPES".to_string(), "image/gif".to_string());

        assert!(AppConfig::from_map(&vars).is_err());
    }

    #[test]
    fn test_routing_key_must_be_bound() {
        let mut vars = base_vars();
        vars.insert("EVENT_BINDINGS".to_string(), "orders.*".to_string());

        let err = AppConfig::from_map(&vars).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "EVENT_BINDINGS"));
    }

    #[test]
    fn test_subject_matches() {
        assert!(subject_matches("items.>", "items.create"));
        assert!(subject_matches("items.>", "items.image.linked"));
        assert!(subject_matches("items.*", "items.create"));
        assert!(subject_matches("items.create", "items.create"));
        assert!(!subject_matches("items.*", "items.image.linked"));
        assert!(!subject_matches("items.>", "items"));
        assert!(!subject_matches("orders.>", "items.create"));
    }
}
