use serde::Deserialize;
use std::path::Path;

use super::ConfigError;

/// Complete YAML configuration structure
///
/// All fields are optional to allow partial configuration. Values present
/// here override the environment.
///
/// # Example YAML structure
/// ```yaml
/// server:
///   host: "0.0.0.0"
///   port: 8080
///
/// gemini:
///   api_key: "your-api-key"
///   model: "models/gemini-2.5-flash-native-audio-preview-09-2025"
///   voice: "Puck"
///   system_instructions: "You are a friendly guide."
///   preload_context: "The user is visiting the museum."
///   affective_dialog: false
///
/// security:
///   allowed_origins:
///     - "https://avatar.example.com"
///   allow_no_origin: false
///   rate_limit_requests_per_second: 60
///   rate_limit_burst_size: 10
///   max_websocket_connections: 100
///   max_connections_per_ip: 10
///   max_connections_per_minute: 10
///
/// auth:
///   required: true
///   firebase_project_id: "my-firebase-project"
///   token_cache_ttl_seconds: 300
///
/// sessions:
///   max_sessions: 1000
///   idle_timeout_seconds: 600
///
/// session:
///   debounce_window_ms: 150
///   retrigger_window_ms: 50
///   interrupt_rms_threshold: 0.05
///   interrupt_poll_interval_ms: 50
///   ack_tone: false
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub server: Option<ServerYaml>,
    pub gemini: Option<GeminiYaml>,
    pub security: Option<SecurityYaml>,
    pub auth: Option<AuthYaml>,
    pub sessions: Option<SessionsYaml>,
    /// Per-session tuning. Missing keys keep their current values.
    pub session: Option<SessionYaml>,
}

/// Client authentication from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AuthYaml {
    pub required: Option<bool>,
    pub firebase_project_id: Option<String>,
    pub token_cache_ttl_seconds: Option<u64>,
}

/// Server configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServerYaml {
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// Model configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct GeminiYaml {
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub voice: Option<String>,
    pub system_instructions: Option<String>,
    pub preload_context: Option<String>,
    pub affective_dialog: Option<bool>,
}

/// Admission control from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SecurityYaml {
    pub allowed_origins: Option<Vec<String>>,
    pub allow_no_origin: Option<bool>,
    pub rate_limit_requests_per_second: Option<u32>,
    pub rate_limit_burst_size: Option<u32>,
    /// 0 disables the global limit
    pub max_websocket_connections: Option<usize>,
    pub max_connections_per_ip: Option<usize>,
    pub max_connections_per_minute: Option<usize>,
}

/// Session registry bounds from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SessionsYaml {
    pub max_sessions: Option<usize>,
    pub idle_timeout_seconds: Option<u64>,
}

/// Barge-in tuning from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SessionYaml {
    pub debounce_window_ms: Option<u64>,
    pub retrigger_window_ms: Option<u64>,
    pub interrupt_rms_threshold: Option<f32>,
    pub interrupt_poll_interval_ms: Option<u64>,
    pub ack_tone: Option<bool>,
    pub channel_capacity: Option<usize>,
}

impl YamlConfig {
    /// Load configuration from a YAML file
    ///
    /// # Errors
    /// Returns an error if:
    /// - The file cannot be read
    /// - The YAML is malformed
    /// - Fields have invalid types
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(contents).map_err(|e| ConfigError::Yaml(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn test_yaml_config_full() {
        let yaml = r#"
server:
  host: "127.0.0.1"
  port: 9000
gemini:
  api_key: "yaml-key"
  voice: "Kore"
  affective_dialog: true
security:
  allowed_origins: ["https://a.example"]
  allow_no_origin: false
  max_connections_per_minute: 5
auth:
  required: true
  firebase_project_id: "museum-avatar"
sessions:
  max_sessions: 50
session:
  debounce_window_ms: 250
  ack_tone: true
"#;
        let config = YamlConfig::parse(yaml).unwrap();

        let server = config.server.unwrap();
        assert_eq!(server.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(server.port, Some(9000));

        let gemini = config.gemini.unwrap();
        assert_eq!(gemini.api_key.as_deref(), Some("yaml-key"));
        assert_eq!(gemini.voice.as_deref(), Some("Kore"));
        assert_eq!(gemini.affective_dialog, Some(true));

        let security = config.security.unwrap();
        assert_eq!(
            security.allowed_origins,
            Some(vec!["https://a.example".to_string()])
        );
        assert_eq!(security.allow_no_origin, Some(false));
        assert_eq!(security.max_connections_per_minute, Some(5));

        let auth = config.auth.unwrap();
        assert_eq!(auth.required, Some(true));
        assert_eq!(auth.firebase_project_id.as_deref(), Some("museum-avatar"));
        assert!(auth.token_cache_ttl_seconds.is_none());

        assert_eq!(config.sessions.unwrap().max_sessions, Some(50));

        let session = config.session.unwrap();
        assert_eq!(session.debounce_window_ms, Some(250));
        assert_eq!(session.ack_tone, Some(true));
        assert!(session.retrigger_window_ms.is_none());
    }

    #[test]
    fn test_yaml_config_empty() {
        let config = YamlConfig::parse("").unwrap();
        assert!(config.server.is_none());
        assert!(config.gemini.is_none());
        assert!(config.session.is_none());
    }

    #[test]
    fn test_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        fs::write(&config_path, "server:\n  port: 3000\n").unwrap();

        let config = YamlConfig::from_file(&config_path).unwrap();
        assert_eq!(config.server.unwrap().port, Some(3000));
    }

    #[test]
    fn test_from_file_not_found() {
        let path = PathBuf::from("/nonexistent/config.yaml");
        let err = YamlConfig::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_invalid_yaml() {
        let err = YamlConfig::parse("server:\n  port: not-a-number\n").unwrap_err();
        assert!(matches!(err, ConfigError::Yaml(_)));
    }
}
