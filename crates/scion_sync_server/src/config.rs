use std::env;
use std::path::PathBuf;

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address (default: 0.0.0.0)
    pub host: String,
    /// Listen port (default: 3030)
    pub port: u16,
    /// Logger threshold (default: info)
    pub log_level: String,
    /// Root directory holding every vault (default: ./vaults)
    pub vault_path: PathBuf,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("PORT")
            .unwrap_or_else(|_| "3030".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let vault_path =
            PathBuf::from(env::var("VAULT_PATH").unwrap_or_else(|_| "./vaults".to_string()));

        Ok(Config {
            host,
            port,
            log_level,
            vault_path,
        })
    }

    /// Get the server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "Invalid PORT environment variable"),
        }
    }
}

impl std::error::Error for ConfigError {}
