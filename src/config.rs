//! Runtime configuration, read from the environment.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Name of the forwarder rule file inside the config directory.
pub const RULE_FILE_NAME: &str = "forwarding.json";

/// Name of the correlation database inside the config directory.
pub const CORRELATION_DB_NAME: &str = "messages.db";

/// Legacy JSON correlation file, imported once on first start.
pub const LEGACY_CORRELATION_FILE: &str = "messages.json";

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Telegram bot token.
    pub bot_token: SecretString,
    /// Directory holding the rule file and the correlation database.
    pub config_dir: PathBuf,
    /// How long a media group claim stays live.
    pub media_group_ttl: Duration,
    /// How long to wait for the rest of a media group to arrive before fetching it.
    pub media_group_settle: Duration,
    /// Upper bound on the handling time of a single inbound event.
    pub event_timeout: Duration,
    /// Retries for rate-limited platform calls.
    pub max_retries: u32,
    /// Similarity score at or above which a photo counts as a blocked image.
    pub blocked_image_threshold: f64,
    /// Override for the translation endpoint.
    pub translate_url: Option<String>,
    /// Directory for rolling log files. Logs go to stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

impl RelayConfig {
    /// Load configuration from environment variables.
    ///
    /// Only `TELEGRAM_BOT_TOKEN` is required; everything else has a default.
    pub fn from_env() -> Result<Self, ConfigError> {
        let bot_token = std::env::var("TELEGRAM_BOT_TOKEN")
            .map_err(|_| ConfigError::MissingEnvVar("TELEGRAM_BOT_TOKEN".into()))?;

        let config_dir = std::env::var("RELAY_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./config"));

        let blocked_image_threshold: f64 = parse_env("RELAY_BLOCKED_IMAGE_THRESHOLD", 0.95)?;
        if !(0.0..=1.0).contains(&blocked_image_threshold) {
            return Err(ConfigError::InvalidValue {
                key: "RELAY_BLOCKED_IMAGE_THRESHOLD".into(),
                message: "must be between 0 and 1".into(),
            });
        }

        Ok(Self {
            bot_token: SecretString::from(bot_token),
            config_dir,
            media_group_ttl: Duration::from_secs(parse_env("RELAY_MEDIA_GROUP_TTL_SECS", 60)?),
            media_group_settle: Duration::from_millis(parse_env(
                "RELAY_MEDIA_GROUP_SETTLE_MS",
                1500,
            )?),
            event_timeout: Duration::from_secs(parse_env("RELAY_EVENT_TIMEOUT_SECS", 120)?),
            max_retries: parse_env("RELAY_MAX_RETRIES", 3)?,
            blocked_image_threshold,
            translate_url: std::env::var("RELAY_TRANSLATE_URL").ok(),
            log_dir: std::env::var("RELAY_LOG_DIR").ok().map(PathBuf::from),
        })
    }

    pub fn rule_file(&self) -> PathBuf {
        self.config_dir.join(RULE_FILE_NAME)
    }

    pub fn correlation_db(&self) -> PathBuf {
        self.config_dir.join(CORRELATION_DB_NAME)
    }

    pub fn legacy_correlation_file(&self) -> PathBuf {
        self.config_dir.join(LEGACY_CORRELATION_FILE)
    }
}

/// Parse an optional env var, falling back to `default` when unset.
fn parse_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}
