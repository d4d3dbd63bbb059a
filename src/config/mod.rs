//! Configuration module for aduket
//!
//! Supports configuration via file (TOML or JSON) and environment variables.

use crate::server::DEFAULT_MAX_BODY_SIZE;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind the server to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Serve HTTPS with a self-signed certificate
    #[serde(default)]
    pub tls: bool,
    /// Maximum request body size in bytes, 0 disables the limit
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    /// Add permissive CORS handling
    #[serde(default)]
    pub cors: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_body_size() -> usize {
    DEFAULT_MAX_BODY_SIZE
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            tls: false,
            max_body_size: default_max_body_size(),
            cors: false,
        }
    }
}

impl ServerConfig {
    /// `host:port` string to bind to
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A single expectation loaded from configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpectationConfig {
    /// HTTP method to match
    pub method: String,
    /// Path to match, empty matches any path
    #[serde(default)]
    pub path: String,
    /// Response status code
    #[serde(default = "default_status")]
    pub status: u16,
    /// Response body
    #[serde(default)]
    pub response: String,
    /// Response headers
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Maximum number of matches, 0 = unlimited
    #[serde(default)]
    pub times: usize,
    /// Delay before responding, in milliseconds
    #[serde(default)]
    pub delay_ms: u64,
    /// Required query parameters
    #[serde(default)]
    pub query: HashMap<String, String>,
}

fn default_status() -> u16 {
    200
}

impl Default for ExpectationConfig {
    fn default() -> Self {
        Self {
            method: "GET".to_string(),
            path: String::new(),
            status: default_status(),
            response: String::new(),
            headers: HashMap::new(),
            times: 0,
            delay_ms: 0,
            query: HashMap::new(),
        }
    }
}

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Expectations registered at start-up
    #[serde(default)]
    pub expectations: Vec<ExpectationConfig>,
}

impl AppConfig {
    /// Load configuration from defaults, `aduket.{toml,json}` and environment
    pub fn load() -> anyhow::Result<Self> {
        // Try to load .env file (ignore if not found)
        let _ = dotenvy::dotenv();

        let mut config = config::Config::builder();

        config = config.add_source(config::Config::try_from(&AppConfig::default())?);
        config = config.add_source(config::File::with_name("aduket").required(false));

        // Override with environment variables, e.g. ADUKET_SERVER__PORT=9000
        config = config.add_source(
            config::Environment::with_prefix("ADUKET")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = config.build()?;
        let app_config: AppConfig = config.try_deserialize()?;

        Ok(app_config)
    }

    /// Load configuration from a specific TOML or JSON file
    pub fn load_from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).or_else(|_| serde_json::from_str(&contents))?;
        Ok(config)
    }

    /// The expectation registered when none are configured
    pub fn default_expectation() -> ExpectationConfig {
        ExpectationConfig {
            method: "GET".to_string(),
            path: "/".to_string(),
            response: r#"{"message": "Aduket CLI is running!"}"#.to_string(),
            headers: [("Content-Type".to_string(), "application/json".to_string())].into(),
            ..ExpectationConfig::default()
        }
    }
}
