//! Configuration for grants-service.

use serde::{Deserialize, Serialize};
use service_core::config::{self as core_config, get_env, parse_env};
use service_core::error::AppError;

/// Which storage backend the service runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorerKind {
    Memory,
    Postgres,
    Mongodb,
}

impl std::str::FromStr for StorerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(StorerKind::Memory),
            "postgres" | "postgresql" => Ok(StorerKind::Postgres),
            "mongodb" | "mongo" => Ok(StorerKind::Mongodb),
            _ => Err(format!("Invalid storer: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MongoConfig {
    pub uri: String,
    pub database: String,
    /// Retries of a conflicting read-modify-write transaction.
    pub max_transaction_retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GrantsConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub storer: StorerKind,
    pub database: Option<DatabaseConfig>,
    pub mongodb: Option<MongoConfig>,
}

impl GrantsConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        let storer: StorerKind = get_env("GRANTS_STORER", Some("memory"))?
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let database = match storer {
            StorerKind::Postgres => Some(DatabaseConfig {
                url: get_env("DATABASE_URL", None)?,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", Some("10"))?,
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", Some("1"))?,
            }),
            _ => None,
        };

        let mongodb = match storer {
            StorerKind::Mongodb => Some(MongoConfig {
                uri: get_env("MONGODB_URI", None)?,
                database: get_env("MONGODB_DATABASE", Some("grants"))?,
                max_transaction_retries: parse_env("MONGODB_MAX_TRANSACTION_RETRIES", Some("10"))?,
            }),
            _ => None,
        };

        Ok(GrantsConfig {
            common,
            service_name: get_env("SERVICE_NAME", Some("grants-service"))?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")))?,
            log_level: get_env("LOG_LEVEL", Some("info"))?,
            otlp_endpoint: std::env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            storer,
            database,
            mongodb,
        })
    }

    /// The postgres settings, required when that backend is selected.
    pub fn database(&self) -> Result<&DatabaseConfig, AppError> {
        self.database
            .as_ref()
            .ok_or_else(|| AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is not configured")))
    }

    /// The mongodb settings, required when that backend is selected.
    pub fn mongodb(&self) -> Result<&MongoConfig, AppError> {
        self.mongodb
            .as_ref()
            .ok_or_else(|| AppError::ConfigError(anyhow::anyhow!("MONGODB_URI is not configured")))
    }
}
