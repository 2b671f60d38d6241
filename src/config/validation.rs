use super::{ConfigError, ServerConfig};

/// Check cross-field constraints on a loaded configuration.
///
/// The API key is not required here: a server without one starts and
/// reports itself not ready.
pub(super) fn validate(config: &ServerConfig) -> Result<(), ConfigError> {
    if config.host.trim().is_empty() {
        return Err(ConfigError::Invalid("host must not be empty".to_string()));
    }
    if config.model.trim().is_empty() {
        return Err(ConfigError::Invalid("model must not be empty".to_string()));
    }
    if config.max_connections_per_ip == 0 {
        return Err(ConfigError::Invalid(
            "max_connections_per_ip must be positive".to_string(),
        ));
    }
    if config.max_connections_per_minute == 0 {
        return Err(ConfigError::Invalid(
            "max_connections_per_minute must be positive".to_string(),
        ));
    }
    if config.max_sessions == 0 {
        return Err(ConfigError::Invalid(
            "max_sessions must be positive".to_string(),
        ));
    }
    if config.session_idle_timeout_seconds == 0 {
        return Err(ConfigError::Invalid(
            "session_idle_timeout_seconds must be positive".to_string(),
        ));
    }
    if config.rate_limit_requests_per_second == 0 || config.rate_limit_burst_size == 0 {
        return Err(ConfigError::Invalid(
            "rate limit rate and burst size must be positive".to_string(),
        ));
    }
    if !config.allow_no_origin && config.allowed_origins.is_empty() {
        return Err(ConfigError::Invalid(
            "allowed_origins is empty and allow_no_origin is false; no client could connect"
                .to_string(),
        ));
    }

    if config.auth_required
        && config
            .firebase_project_id
            .as_deref()
            .is_none_or(|p| p.trim().is_empty())
    {
        return Err(ConfigError::Invalid(
            "auth is required but FIREBASE_PROJECT_ID is not set".to_string(),
        ));
    }
    if config.auth_required && config.auth_token_cache_ttl_seconds == 0 {
        return Err(ConfigError::Invalid(
            "auth_token_cache_ttl_seconds must be positive".to_string(),
        ));
    }

    config
        .session
        .validate()
        .map_err(|e| ConfigError::Invalid(e.to_string()))
}
