use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::feed::ComposerConfig;
use crate::rate_limit::RateLimitConfig;
use crate::repo::CommentLayout;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
    #[error("failed to parse {name} as integer: {source}")]
    ParseInt {
        name: String,
        #[source]
        source: std::num::ParseIntError,
    },
}

/// S3 / MinIO connection for image blobs.
#[derive(Debug, Clone)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    /// Prefix of the URLs handed back to clients for uploaded objects.
    pub public_base_url: String,
}

/// Process configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,
    pub port: u16,
    pub jwt_secret: String,
    pub feed: ComposerConfig,
    pub comment_layout: CommentLayout,
    /// Snapshot directory of the in-memory store; `None` keeps it volatile.
    pub data_dir: Option<PathBuf>,
    pub database_url: Option<String>,
    pub s3: S3Settings,
    pub rate_limit: RateLimitConfig,
}

impl Settings {
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or a value does not
    /// parse or validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = ComposerConfig::default();
        let bucket = env_or_default("S3_BUCKET", "craftfeed-images");
        let region = env_or_default("S3_REGION", "us-east-1");
        let endpoint = optional_env("S3_ENDPOINT");
        let public_base_url = optional_env("S3_PUBLIC_URL").unwrap_or_else(|| match &endpoint {
            Some(ep) => format!("{}/{}", ep.trim_end_matches('/'), bucket),
            None => format!("https://{bucket}.s3.{region}.amazonaws.com"),
        });
        let settings = Self {
            bind_addr: env_or_default("BIND_ADDR", "0.0.0.0"),
            port: parse_env_u16("PORT", 8080)?,
            jwt_secret: required_env("JWT_SECRET")?,
            feed: ComposerConfig {
                default_page_size: parse_env_usize("FEED_PAGE_SIZE", defaults.default_page_size)?,
                max_page_size: parse_env_usize("FEED_MAX_PAGE_SIZE", defaults.max_page_size)?,
                overfetch_factor: parse_env_usize("FEED_OVERFETCH_FACTOR", defaults.overfetch_factor)?,
                profile_cache_ttl: Duration::from_secs(parse_env_u64(
                    "FEED_PROFILE_CACHE_TTL_SECS",
                    defaults.profile_cache_ttl.as_secs(),
                )?),
                profile_cache_capacity: parse_env_usize("FEED_PROFILE_CACHE_CAPACITY", defaults.profile_cache_capacity)?,
            },
            comment_layout: parse_comment_layout(&env_or_default("COMMENT_LAYOUT", "collection"))?,
            data_dir: optional_env("CRAFTFEED_DATA_DIR").map(PathBuf::from),
            database_url: optional_env("DATABASE_URL"),
            s3: S3Settings {
                bucket,
                region,
                endpoint,
                access_key: optional_env("S3_ACCESS_KEY"),
                secret_key: optional_env("S3_SECRET_KEY"),
                public_base_url,
            },
            rate_limit: RateLimitConfig::from_env(),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jwt_secret.len() < 32 {
            return Err(invalid("JWT_SECRET", "must be at least 32 characters"));
        }
        if self.feed.default_page_size == 0 {
            return Err(invalid("FEED_PAGE_SIZE", "must be at least 1"));
        }
        if self.feed.max_page_size < self.feed.default_page_size {
            return Err(invalid("FEED_MAX_PAGE_SIZE", "must not be below FEED_PAGE_SIZE"));
        }
        if self.feed.overfetch_factor == 0 {
            return Err(invalid("FEED_OVERFETCH_FACTOR", "must be at least 1"));
        }
        if self.feed.profile_cache_capacity == 0 {
            return Err(invalid("FEED_PROFILE_CACHE_CAPACITY", "must be at least 1"));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> (String, u16) {
        (self.bind_addr.clone(), self.port)
    }
}

fn invalid(name: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue { name: name.to_string(), message: message.to_string() }
}

fn required_env(name: &str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.to_string()))
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_or_default(name: &str, default: &str) -> String {
    optional_env(name).unwrap_or_else(|| default.to_string())
}

fn parse_env_usize(name: &str, default: usize) -> Result<usize, ConfigError> {
    match optional_env(name) {
        Some(v) => v.parse().map_err(|source| ConfigError::ParseInt { name: name.to_string(), source }),
        None => Ok(default),
    }
}

fn parse_env_u64(name: &str, default: u64) -> Result<u64, ConfigError> {
    match optional_env(name) {
        Some(v) => v.parse().map_err(|source| ConfigError::ParseInt { name: name.to_string(), source }),
        None => Ok(default),
    }
}

fn parse_env_u16(name: &str, default: u16) -> Result<u16, ConfigError> {
    match optional_env(name) {
        Some(v) => v.parse().map_err(|source| ConfigError::ParseInt { name: name.to_string(), source }),
        None => Ok(default),
    }
}

fn parse_comment_layout(value: &str) -> Result<CommentLayout, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "collection" => Ok(CommentLayout::Collection),
        "embedded" => Ok(CommentLayout::Embedded),
        other => Err(invalid("COMMENT_LAYOUT", &format!("expected `collection` or `embedded`, got `{other}`"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comment_layout_parses_case_insensitively() {
        assert_eq!(parse_comment_layout("Embedded").unwrap(), CommentLayout::Embedded);
        assert!(matches!(parse_comment_layout("inline"), Err(ConfigError::InvalidValue { .. })));
    }
}
