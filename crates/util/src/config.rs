use std::{env, fmt, net::SocketAddr};

use super::{DEFAULT_BIND_ADDR, DEFAULT_DATABASE_URL};

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    /// Returns `true` when simulated (HMAC-signed) webhook deliveries may be
    /// accepted. The RSA path is the only trust domain in production.
    pub fn allows_simulated_webhooks(self) -> bool {
        !matches!(self, Self::Production)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    /// PEM override for the platform webhook public key; the built-in Kick
    /// key is used when unset.
    pub webhook_public_key_pem: Option<String>,
    pub kick_api_base_url: String,
    pub kick_bot_token: Option<String>,
    pub clip_buffer_url: Option<String>,
    pub discord_webhook_url: Option<String>,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = env::var("APP_BIND_ADDR")
            .unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string())
            .parse()
            .map_err(ConfigError::BindAddress)?;
        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());
        let kick_api_base_url = env::var("KICK_API_BASE_URL")
            .unwrap_or_else(|_| "https://api.kick.com/public/v1/".to_string());

        Ok(Self {
            bind_addr,
            environment,
            database_url,
            webhook_public_key_pem: env::var("KICK_WEBHOOK_PUBLIC_KEY").ok(),
            kick_api_base_url,
            kick_bot_token: env::var("KICK_BOT_TOKEN").ok(),
            clip_buffer_url: env::var("CLIP_BUFFER_URL").ok(),
            discord_webhook_url: env::var("DISCORD_WEBHOOK_URL").ok(),
        })
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
        }
    }
}

impl std::error::Error for ConfigError {}
