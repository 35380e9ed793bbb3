pub mod database;
pub mod gcp;
pub mod server;

pub use gcp::{
    MAX_PROJECTS_PER_ACCOUNT, PENDING_DELETE_RETENTION_HOURS, VM_NAME_PREFIX,
    VM_NAME_PREFIX_LEGACY,
};

use once_cell::sync::Lazy;
use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub server: server::ServerConfig,
    pub database: database::DatabaseConfig,
    pub gcp: gcp::GcpConfig,

    // Logging
    pub log_level: String,

    // Public base URL used when building the submit-auth-key callback
    pub callback_base_url: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            server: server::ServerConfig::from_env(),
            database: database::DatabaseConfig::from_env(),
            gcp: gcp::GcpConfig::from_env(),

            log_level: env::var("GATC_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),

            callback_base_url: env::var("GATC_CALLBACK_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:5401".to_string()),
        }
    }
}

pub static CONFIG: Lazy<Config> = Lazy::new(Config::from_env);
