//! Configuration for the Savor services.
//!
//! All three binaries read the same TOML file; each section covers one
//! external collaborator. Every key has a default aimed at a local
//! docker-compose deployment, so a minimal file can be empty.
//!
//! ```toml
//! [postgres]
//! host = "localhost"
//! password = "postgres"
//!
//! [model]
//! embedding_model = "nomic-embed-text"
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use savor_common::{Error, Result};

/// Root configuration shared by every Savor binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub postgres: PostgresConfig,
    #[serde(default)]
    pub nats: NatsConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub embedder: EmbedderConfig,
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Configuration(format!(
                "failed to read config {}: {e}",
                path.as_ref().display()
            ))
        })?;
        let config = Self::from_toml(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration from TOML text.
    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::Configuration(e.to_string()))
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.replication.publication.is_empty() || self.replication.slot.is_empty() {
            return Err(Error::Configuration(
                "replication publication and slot names must be set".into(),
            ));
        }
        if self.nats.stream.is_empty() {
            return Err(Error::Configuration("nats stream name must be set".into()));
        }
        let subjects = [
            &self.nats.restaurants_subject,
            &self.nats.menu_items_subject,
            &self.nats.categories_subject,
        ];
        if subjects.iter().any(|s| s.is_empty()) {
            return Err(Error::Configuration("nats subject names must be set".into()));
        }
        if self.embedder.workers == 0 {
            return Err(Error::Configuration("embedder workers must be >= 1".into()));
        }
        if self.embedder.queue_size == 0 {
            return Err(Error::Configuration(
                "embedder queue_size must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

/// Relational store connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    #[serde(default = "default_pg_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_pg_db")]
    pub database: String,
    #[serde(default = "default_sslmode")]
    pub sslmode: String,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_pg_port(),
            user: default_pg_user(),
            password: String::new(),
            database: default_pg_db(),
            sslmode: default_sslmode(),
        }
    }
}

impl PostgresConfig {
    /// Connection string for regular query connections.
    pub fn conn_str(&self) -> String {
        format!(
            "host={} port={} user={} password={} dbname={} sslmode={}",
            self.host, self.port, self.user, self.password, self.database, self.sslmode
        )
    }
}

/// Message bus settings: one stream, one subject per table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_nats_port")]
    pub port: u16,
    #[serde(default = "default_stream")]
    pub stream: String,
    #[serde(default = "default_restaurants_subject")]
    pub restaurants_subject: String,
    #[serde(default = "default_menu_items_subject")]
    pub menu_items_subject: String,
    #[serde(default = "default_categories_subject")]
    pub categories_subject: String,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_nats_port(),
            stream: default_stream(),
            restaurants_subject: default_restaurants_subject(),
            menu_items_subject: default_menu_items_subject(),
            categories_subject: default_categories_subject(),
        }
    }
}

impl NatsConfig {
    /// Bus server URL.
    pub fn url(&self) -> String {
        format!("nats://{}:{}", self.host, self.port)
    }

    /// All configured subjects, in table order.
    pub fn subjects(&self) -> [String; 3] {
        [
            self.restaurants_subject.clone(),
            self.menu_items_subject.clone(),
            self.categories_subject.clone(),
        ]
    }
}

/// Model server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model_url")]
    pub base_url: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_context_model")]
    pub context_model: String,
    #[serde(default = "default_parser_model")]
    pub parser_model: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: default_model_url(),
            embedding_model: default_embedding_model(),
            context_model: default_context_model(),
            parser_model: default_parser_model(),
        }
    }
}

/// Logical replication identifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    #[serde(default = "default_publication")]
    pub publication: String,
    #[serde(default = "default_slot")]
    pub slot: String,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            publication: default_publication(),
            slot: default_slot(),
        }
    }
}

/// HTTP server bind settings for the search service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_bind_host(),
            port: default_server_port(),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Worker pool sizing for the embedder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedderConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_size: default_queue_size(),
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_pg_port() -> u16 {
    5432
}

fn default_pg_user() -> String {
    "postgres".to_string()
}

fn default_pg_db() -> String {
    "savor".to_string()
}

fn default_sslmode() -> String {
    "disable".to_string()
}

fn default_nats_port() -> u16 {
    4222
}

fn default_stream() -> String {
    "restaurant-cdc".to_string()
}

fn default_restaurants_subject() -> String {
    "cdc.restaurants".to_string()
}

fn default_menu_items_subject() -> String {
    "cdc.menu-items".to_string()
}

fn default_categories_subject() -> String {
    "cdc.categories".to_string()
}

fn default_model_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

fn default_context_model() -> String {
    "llama3.1".to_string()
}

fn default_parser_model() -> String {
    "llama3.1".to_string()
}

fn default_publication() -> String {
    "savor_pub".to_string()
}

fn default_slot() -> String {
    "savor_slot".to_string()
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    8080
}

fn default_workers() -> usize {
    2
}

fn default_queue_size() -> usize {
    100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.postgres.port, 5432);
        assert_eq!(config.embedder.workers, 2);
        assert_eq!(config.embedder.queue_size, 100);
        assert_eq!(config.nats.stream, "restaurant-cdc");
    }

    #[test]
    fn test_partial_override() {
        let config = Config::from_toml(
            r#"
            [postgres]
            host = "db.internal"
            password = "secret"

            [embedder]
            workers = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.postgres.host, "db.internal");
        assert_eq!(config.postgres.database, "savor");
        assert_eq!(config.embedder.workers, 8);
        assert_eq!(config.embedder.queue_size, 100);
    }

    #[test]
    fn test_conn_str() {
        let config = Config::from_toml(
            r#"
            [postgres]
            host = "db"
            port = 5433
            user = "savor"
            password = "pw"
            database = "restaurants"
            "#,
        )
        .unwrap();
        assert_eq!(
            config.postgres.conn_str(),
            "host=db port=5433 user=savor password=pw dbname=restaurants sslmode=disable"
        );
    }

    #[test]
    fn test_nats_url_and_subjects() {
        let config = Config::default();
        assert_eq!(config.nats.url(), "nats://localhost:4222");
        assert_eq!(
            config.nats.subjects(),
            [
                "cdc.restaurants".to_string(),
                "cdc.menu-items".to_string(),
                "cdc.categories".to_string()
            ]
        );
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let config = Config::from_toml("[embedder]\nworkers = 0\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_slot() {
        let config = Config::from_toml("[replication]\nslot = \"\"\n").unwrap();
        assert!(config.validate().is_err());
    }
}
