use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::db::{TransactionMode, VectorExtension};
use crate::error::CoordinatorError;

/// Overrides `database.url`.
pub const DATABASE_URL_ENV: &str = "VECDB_DATABASE_URL";
/// Overrides `database.vector_extension`.
pub const VECTOR_EXTENSION_ENV: &str = "VECDB_VECTOR_EXTENSION";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub migrations: MigrationsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// libpq-style connection string or URL.
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// `pgvector` or `pgvecto.rs`.
    #[serde(default = "default_vector_extension")]
    pub vector_extension: String,
}

fn default_pool_size() -> u32 {
    4
}

fn default_vector_extension() -> String {
    VectorExtension::default().package_name().to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            pool_size: default_pool_size(),
            vector_extension: default_vector_extension(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationsConfig {
    #[serde(default = "default_migrations_dir")]
    pub directory: PathBuf,

    #[serde(default)]
    pub transaction: TransactionMode,
}

fn default_migrations_dir() -> PathBuf {
    Config::config_dir().join("migrations")
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            directory: default_migrations_dir(),
            transaction: TransactionMode::default(),
        }
    }
}

/// Settings the coordinator is constructed with. Fixed for the life of the
/// process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorConfig {
    pub vector_extension: VectorExtension,
    pub migration_mode: TransactionMode,
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        let config = if config_path.exists() {
            Self::load_from(&config_path)?
        } else {
            // Create default config
            let config = Config::default();
            config.save()?;
            config
        };
        Ok(config.with_env_overrides())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config.with_env_overrides())
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path();

        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;

        Ok(())
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var(DATABASE_URL_ENV) {
            self.database.url = Some(url);
        }
        if let Ok(extension) = std::env::var(VECTOR_EXTENSION_ENV) {
            self.database.vector_extension = extension;
        }
        self
    }

    /// Validate the settings the coordinator depends on.
    pub fn resolve(&self) -> std::result::Result<CoordinatorConfig, CoordinatorError> {
        Ok(CoordinatorConfig {
            vector_extension: self.database.vector_extension.parse()?,
            migration_mode: self.migrations.transaction,
        })
    }

    pub fn database_url(&self) -> std::result::Result<&str, CoordinatorError> {
        self.database
            .url
            .as_deref()
            .ok_or_else(|| CoordinatorError::Configuration("database url not configured".into()))
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vecdb-coordinator")
    }

    fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }
}
