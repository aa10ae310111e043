use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use thiserror::Error;
use url::Url;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_API_BASE: &str = "https://api.replicate.com/v1";
const DEFAULT_MODEL: &str = "google/nano-banana";
/// Requests allowed per client key per UTC day.
pub const DEFAULT_DAILY_LIMIT: u32 = 10;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_POLL_TIMEOUT_SECS: u64 = 5 * 60;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 90;
/// Replicate caps `Prefer: wait` at 60 seconds.
const MAX_BLOCKING_WAIT_SECS: u64 = 60;
const DEFAULT_QUOTA_RETENTION_DAYS: u32 = 2;
const DEFAULT_REFERENCE_IMAGE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/assets/reference.png");

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// How the generation client waits for a prediction to finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationStrategy {
    /// One request with `Prefer: wait`, upstream holds the connection open.
    Blocking,
    /// Create the prediction, then poll its status URL.
    Poll,
}

impl FromStr for GenerationStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "blocking" | "sync" => Ok(Self::Blocking),
            "poll" | "polling" => Ok(Self::Poll),
            other => Err(format!("unknown strategy `{other}`, expected `poll` or `blocking`")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReplicateConfig {
    pub api_base: Url,
    pub api_token: SecretString,
    pub model: String,
    pub strategy: GenerationStrategy,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    pub http_timeout: Duration,
    pub blocking_wait: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub replicate: ReplicateConfig,
    pub daily_limit: u32,
    pub quota_retention_days: u32,
    pub reference_image_path: PathBuf,
    pub cache_reference_image: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the config from an arbitrary variable source. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let api_token = get("REPLICATE_API_TOKEN")
            .map(|value| SecretString::from(value.trim().to_string()))
            .ok_or(ConfigError::Missing("REPLICATE_API_TOKEN"))?;

        let raw_base = get("REPLICATE_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        let api_base = Url::parse(raw_base.trim()).map_err(|err| ConfigError::Invalid {
            name: "REPLICATE_API_BASE",
            reason: err.to_string(),
        })?;
        if !matches!(api_base.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid {
                name: "REPLICATE_API_BASE",
                reason: format!("unsupported scheme `{}`", api_base.scheme()),
            });
        }

        let model = get("REPLICATE_MODEL")
            .map(|value| value.trim().to_string())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        if !model.contains('/') {
            return Err(ConfigError::Invalid {
                name: "REPLICATE_MODEL",
                reason: format!("`{model}` is not of the form owner/name"),
            });
        }

        let strategy = match get("GENERATION_STRATEGY") {
            Some(value) => value.parse().map_err(|reason| ConfigError::Invalid {
                name: "GENERATION_STRATEGY",
                reason,
            })?,
            None => GenerationStrategy::Poll,
        };

        let daily_limit =
            parse_nonzero("DAILY_LIMIT", get("DAILY_LIMIT"), DEFAULT_DAILY_LIMIT)?;
        let poll_interval_ms =
            parse_nonzero("POLL_INTERVAL_MS", get("POLL_INTERVAL_MS"), DEFAULT_POLL_INTERVAL_MS)?;
        let poll_timeout_secs =
            parse_nonzero("POLL_TIMEOUT_SECS", get("POLL_TIMEOUT_SECS"), DEFAULT_POLL_TIMEOUT_SECS)?;
        let http_timeout_secs =
            parse_nonzero("HTTP_TIMEOUT_SECS", get("HTTP_TIMEOUT_SECS"), DEFAULT_HTTP_TIMEOUT_SECS)?;
        let blocking_wait_secs =
            parse_or("BLOCKING_WAIT_SECS", get("BLOCKING_WAIT_SECS"), MAX_BLOCKING_WAIT_SECS)?
                .clamp(1, MAX_BLOCKING_WAIT_SECS);

        let reference_image_path = get("REFERENCE_IMAGE_PATH")
            .map(|value| PathBuf::from(value.trim()))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_REFERENCE_IMAGE));

        Ok(Self {
            port: parse_or("PORT", get("PORT"), DEFAULT_PORT)?,
            replicate: ReplicateConfig {
                api_base,
                api_token,
                model,
                strategy,
                poll_interval: Duration::from_millis(poll_interval_ms),
                poll_timeout: Duration::from_secs(poll_timeout_secs),
                http_timeout: Duration::from_secs(http_timeout_secs),
                blocking_wait: Duration::from_secs(blocking_wait_secs),
            },
            daily_limit,
            quota_retention_days: parse_or(
                "QUOTA_RETENTION_DAYS",
                get("QUOTA_RETENTION_DAYS"),
                DEFAULT_QUOTA_RETENTION_DAYS,
            )?,
            reference_image_path,
            cache_reference_image: parse_or(
                "REFERENCE_IMAGE_CACHE",
                get("REFERENCE_IMAGE_CACHE"),
                false,
            )?,
        })
    }

    pub fn bind_address(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }
}

fn parse_or<T>(name: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(value) => value.trim().parse().map_err(|err: T::Err| ConfigError::Invalid {
            name,
            reason: err.to_string(),
        }),
        None => Ok(default),
    }
}

/// Like `parse_or`, but rejects zero.
fn parse_nonzero<T>(name: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr + Default + PartialEq,
    T::Err: std::fmt::Display,
{
    let value = parse_or(name, raw, default)?;
    if value == T::default() {
        return Err(ConfigError::Invalid {
            name,
            reason: "must be at least 1".to_string(),
        });
    }
    Ok(value)
}
