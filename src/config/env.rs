use std::env;
use std::str::FromStr;

use super::{ConfigError, ServerConfig};
use crate::core::remote::gemini::GeminiVoice;

/// Read a non-empty environment variable.
pub(super) fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Parse an environment variable, leaving `None` when unset.
pub(super) fn parse_env<T>(name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidEnv {
                name: name.to_string(),
                message: e.to_string(),
            }),
        None => Ok(None),
    }
}

/// Parse "true"/"false" (case-insensitive), also accepting 1/0 and yes/no.
pub(super) fn parse_bool_env(name: &str) -> Result<Option<bool>, ConfigError> {
    let Some(raw) = env_var(name) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(Some(true)),
        "false" | "0" | "no" => Ok(Some(false)),
        other => Err(ConfigError::InvalidEnv {
            name: name.to_string(),
            message: format!("expected a boolean, got '{other}'"),
        }),
    }
}

pub(super) fn parse_voice(name: &str, value: &str) -> Result<GeminiVoice, ConfigError> {
    GeminiVoice::parse(value.trim()).ok_or_else(|| ConfigError::InvalidEnv {
        name: name.to_string(),
        message: format!(
            "unsupported voice '{value}', expected one of: {}",
            GeminiVoice::supported_names()
        ),
    })
}

/// Split a comma-separated origin list, dropping blanks.
pub(super) fn split_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Build a configuration from defaults overridden by environment variables.
pub(super) fn load_from_env() -> Result<ServerConfig, ConfigError> {
    let mut config = ServerConfig::default();

    if let Some(host) = env_var("HOST") {
        config.host = host;
    }
    if let Some(port) = parse_env("PORT")? {
        config.port = port;
    }

    config.gemini_api_key = env_var("GEMINI_API_KEY").or_else(|| env_var("GOOGLE_API_KEY"));
    if let Some(model) = env_var("MODEL") {
        config.model = model;
    }
    if let Some(voice) = env_var("VOICE") {
        config.voice = parse_voice("VOICE", &voice)?;
    }
    config.system_instructions = env_var("SYSTEM_INSTRUCTIONS");
    config.preload_context = env_var("PRELOAD_CONTEXT");
    if let Some(affective) = parse_bool_env("AFFECTIVE_DIALOG")? {
        config.affective_dialog = affective;
    }

    if let Some(origins) = env_var("ALLOWED_ORIGINS") {
        config.allowed_origins = split_origins(&origins);
    }
    if let Some(allow) = parse_bool_env("ALLOW_NO_ORIGIN")? {
        config.allow_no_origin = allow;
    }
    if let Some(rps) = parse_env("RATE_LIMIT_REQUESTS_PER_SECOND")? {
        config.rate_limit_requests_per_second = rps;
    }
    if let Some(burst) = parse_env("RATE_LIMIT_BURST_SIZE")? {
        config.rate_limit_burst_size = burst;
    }
    if let Some(max) = parse_env::<usize>("MAX_WEBSOCKET_CONNECTIONS")? {
        config.max_websocket_connections = (max > 0).then_some(max);
    }
    if let Some(per_ip) = parse_env("MAX_CONNECTIONS_PER_IP")? {
        config.max_connections_per_ip = per_ip;
    }
    if let Some(per_minute) = parse_env("MAX_CONNECTIONS_PER_MINUTE")? {
        config.max_connections_per_minute = per_minute;
    }

    if let Some(required) = parse_bool_env("REQUIRE_AUTH")? {
        config.auth_required = required;
    }
    config.firebase_project_id = env_var("FIREBASE_PROJECT_ID");
    if let Some(ttl) = parse_env("AUTH_TOKEN_CACHE_TTL_SECONDS")? {
        config.auth_token_cache_ttl_seconds = ttl;
    }

    if let Some(max) = parse_env("MAX_SESSIONS")? {
        config.max_sessions = max;
    }
    if let Some(timeout) = parse_env("SESSION_IDLE_TIMEOUT_SECONDS")? {
        config.session_idle_timeout_seconds = timeout;
    }

    if let Some(ms) = parse_env("DEBOUNCE_WINDOW_MS")? {
        config.session.debounce_window_ms = ms;
    }
    if let Some(ms) = parse_env("RETRIGGER_WINDOW_MS")? {
        config.session.retrigger_window_ms = ms;
    }
    if let Some(threshold) = parse_env("INTERRUPT_RMS_THRESHOLD")? {
        config.session.interrupt_rms_threshold = threshold;
    }
    if let Some(ms) = parse_env("INTERRUPT_POLL_INTERVAL_MS")? {
        config.session.interrupt_poll_interval_ms = ms;
    }
    if let Some(ack) = parse_bool_env("ACK_TONE")? {
        config.session.ack_tone = ack;
    }

    Ok(config)
}
