//! Configuration module for the relay server
//!
//! Server configuration comes from YAML files, environment variables and
//! `.env` files. Priority: YAML > ENV vars > .env values > defaults.
//!
//! # Modules
//! - `yaml`: YAML configuration file loading
//! - `env`: Environment variable loading
//! - `merge`: Applying YAML overrides on top of the environment
//! - `validation`: Configuration validation logic
//!
//! # Example
//! ```rust,no_run
//! use avatar_relay::config::ServerConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variables only
//! let config = ServerConfig::from_env()?;
//!
//! // Load from YAML file with environment variable overrides
//! let config = ServerConfig::from_file(&PathBuf::from("config.yaml"))?;
//!
//! println!("Server listening on {}", config.address());
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::time::Duration;
use thiserror::Error;

mod env;
mod merge;
mod validation;
mod yaml;

pub use yaml::YamlConfig;

use crate::core::remote::gemini::{DEFAULT_GEMINI_MODEL, GeminiConfig, GeminiVoice, mask_api_key};
use crate::session::SessionConfig;

/// Default browser origins accepted for local development.
pub const DEFAULT_ALLOWED_ORIGINS: &[&str] = &["http://localhost:8000", "http://localhost:8080"];

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {message}")]
    Io { path: String, message: String },

    #[error("Failed to parse YAML config: {0}")]
    Yaml(String),

    #[error("Invalid value for {name}: {message}")]
    InvalidEnv { name: String, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("GEMINI_API_KEY or GOOGLE_API_KEY environment variable required")]
    MissingApiKey,
}

/// Server configuration
///
/// Contains everything needed to run the relay:
/// - Server settings (host, port)
/// - Gemini Live model settings and credentials
/// - Admission control (origins, connection limits, request rate)
/// - Optional Firebase ID token authentication
/// - Session registry bounds
/// - Per-session barge-in tuning
#[derive(Clone)]
pub struct ServerConfig {
    // Server settings
    pub host: String,
    pub port: u16,

    // Model settings
    pub gemini_api_key: Option<String>,
    pub model: String,
    pub voice: GeminiVoice,
    pub system_instructions: Option<String>,
    /// Context sent as a first user turn before the session reports ready
    pub preload_context: Option<String>,
    pub affective_dialog: bool,

    // Security settings
    pub allowed_origins: Vec<String>,
    /// Accept WebSocket upgrades without an `Origin` header
    pub allow_no_origin: bool,
    pub rate_limit_requests_per_second: u32,
    pub rate_limit_burst_size: u32,
    /// Maximum concurrent WebSocket connections (None = unlimited)
    pub max_websocket_connections: Option<usize>,
    pub max_connections_per_ip: usize,
    /// Upgrades accepted per IP in a sliding 60 second window
    pub max_connections_per_minute: usize,

    // Authentication
    /// Require a verified Firebase ID token before a session starts
    pub auth_required: bool,
    pub firebase_project_id: Option<String>,
    /// How long a verified token is trusted without re-verification
    pub auth_token_cache_ttl_seconds: u64,

    // Session registry
    pub max_sessions: usize,
    pub session_idle_timeout_seconds: u64,

    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            gemini_api_key: None,
            model: DEFAULT_GEMINI_MODEL.to_string(),
            voice: GeminiVoice::default(),
            system_instructions: None,
            preload_context: None,
            affective_dialog: false,
            allowed_origins: DEFAULT_ALLOWED_ORIGINS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            allow_no_origin: true,
            rate_limit_requests_per_second: 60,
            rate_limit_burst_size: 10,
            max_websocket_connections: Some(100),
            max_connections_per_ip: 10,
            max_connections_per_minute: 10,
            auth_required: false,
            firebase_project_id: None,
            auth_token_cache_ttl_seconds: 300,
            max_sessions: 1000,
            session_idle_timeout_seconds: 600,
            session: SessionConfig::default(),
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field(
                "gemini_api_key",
                &self.gemini_api_key.as_deref().map(mask_api_key),
            )
            .field("model", &self.model)
            .field("voice", &self.voice)
            .field("affective_dialog", &self.affective_dialog)
            .field("allowed_origins", &self.allowed_origins)
            .field("allow_no_origin", &self.allow_no_origin)
            .field("max_websocket_connections", &self.max_websocket_connections)
            .field("max_connections_per_ip", &self.max_connections_per_ip)
            .field("max_connections_per_minute", &self.max_connections_per_minute)
            .field("auth_required", &self.auth_required)
            .field("firebase_project_id", &self.firebase_project_id)
            .field("max_sessions", &self.max_sessions)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

/// Zeroize secrets when the configuration is dropped.
impl Drop for ServerConfig {
    fn drop(&mut self) {
        use zeroize::Zeroize;

        if let Some(ref mut key) = self.gemini_api_key {
            key.zeroize();
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, then validate it.
    ///
    /// `.env` values are expected to be loaded into the environment already
    /// (see `main`).
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = env::load_from_env()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a YAML file on top of the environment.
    ///
    /// Priority order (highest to lowest):
    /// 1. YAML file values
    /// 2. Environment variables (actual ENV vars override .env values)
    /// 3. .env file values
    /// 4. Default values
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let yaml_config = yaml::YamlConfig::from_file(path)?;
        let config = merge::merge_config(Some(yaml_config))?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Get the server address as "host:port".
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn has_api_key(&self) -> bool {
        self.gemini_api_key
            .as_deref()
            .is_some_and(|key| !key.trim().is_empty())
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_seconds)
    }

    pub fn auth_token_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.auth_token_cache_ttl_seconds)
    }

    /// Build the model channel configuration for one session.
    pub fn gemini_config(&self) -> Result<GeminiConfig, ConfigError> {
        let api_key = self
            .gemini_api_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .ok_or(ConfigError::MissingApiKey)?;

        let mut config = GeminiConfig::new(api_key);
        config.model = self.model.clone();
        config.voice = self.voice;
        config.system_instruction = self.system_instructions.clone();
        config.preload_context = self.preload_context.clone();
        config.affective_dialog = self.affective_dialog;
        Ok(config)
    }

    /// Whether `origin` is in the allowed list.
    pub fn is_origin_allowed(&self, origin: &str) -> bool {
        self.allowed_origins.iter().any(|allowed| allowed == origin)
    }
}
