//! Configuration Loading Tests
//!
//! YAML file plus environment precedence, as the binary loads them.

use std::io::Write;

use serial_test::serial;
use tempfile::NamedTempFile;

use avatar_relay::ServerConfig;
use avatar_relay::core::remote::GeminiVoice;

const ENV_VARS: &[&str] = &[
    "HOST",
    "PORT",
    "GEMINI_API_KEY",
    "GOOGLE_API_KEY",
    "MODEL",
    "VOICE",
    "ALLOWED_ORIGINS",
    "ALLOW_NO_ORIGIN",
    "MAX_SESSIONS",
    "DEBOUNCE_WINDOW_MS",
    "INTERRUPT_RMS_THRESHOLD",
    "REQUIRE_AUTH",
    "FIREBASE_PROJECT_ID",
    "AUTH_TOKEN_CACHE_TTL_SECONDS",
];

fn clear_env() {
    for name in ENV_VARS {
        unsafe {
            std::env::remove_var(name);
        }
    }
}

fn write_yaml(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
#[serial]
fn test_yaml_overrides_environment() {
    clear_env();
    unsafe {
        std::env::set_var("PORT", "9000");
        std::env::set_var("GEMINI_API_KEY", "env-key");
        std::env::set_var("DEBOUNCE_WINDOW_MS", "200");
    }

    let file = write_yaml(
        r#"
server:
  port: 7000
gemini:
  voice: "Kore"
session:
  retrigger_window_ms: 40
"#,
    );
    let config = ServerConfig::from_file(file.path()).unwrap();

    assert_eq!(config.port, 7000);
    assert_eq!(config.voice, GeminiVoice::Kore);
    // Untouched by YAML, so the environment wins
    assert_eq!(config.gemini_api_key.as_deref(), Some("env-key"));
    assert_eq!(config.session.debounce_window_ms, 200);
    assert_eq!(config.session.retrigger_window_ms, 40);

    clear_env();
}

#[test]
#[serial]
fn test_env_only_defaults_are_valid() {
    clear_env();
    let config = ServerConfig::from_env().unwrap();

    assert_eq!(config.address(), "0.0.0.0:8080");
    assert!(!config.has_api_key());
    assert!(config.is_origin_allowed("http://localhost:8080"));
    assert!(!config.is_origin_allowed("https://elsewhere.example"));
    assert_eq!(config.session.debounce_window_ms, 150);
}

#[test]
#[serial]
fn test_invalid_session_tuning_rejected() {
    clear_env();
    let file = write_yaml(
        r#"
session:
  interrupt_rms_threshold: 3.0
"#,
    );
    assert!(ServerConfig::from_file(file.path()).is_err());
}

#[test]
#[serial]
fn test_unreadable_file_reported() {
    clear_env();
    let err = ServerConfig::from_file(std::path::Path::new("/nonexistent/relay.yaml"))
        .unwrap_err()
        .to_string();
    assert!(err.contains("/nonexistent/relay.yaml"));
}
