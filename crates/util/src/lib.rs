pub mod config;

pub use config::{AppConfig, ConfigError, Environment};

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_DATABASE_URL: &str = "sqlite://kick_bridge.db";

/// Loads environment variables from `.env` when available. Missing files
/// are ignored so production deployments need no dotenv file.
pub fn load_env_file() {
    let _ = dotenvy::dotenv();
}
