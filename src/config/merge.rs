use super::env::{load_from_env, parse_voice};
use super::yaml::YamlConfig;
use super::{ConfigError, ServerConfig};

/// Load the environment and apply YAML overrides on top of it.
pub(super) fn merge_config(yaml: Option<YamlConfig>) -> Result<ServerConfig, ConfigError> {
    let mut config = load_from_env()?;
    if let Some(yaml) = yaml {
        apply_yaml(&mut config, yaml)?;
    }
    Ok(config)
}

fn apply_yaml(config: &mut ServerConfig, yaml: YamlConfig) -> Result<(), ConfigError> {
    if let Some(server) = yaml.server {
        if let Some(host) = server.host {
            config.host = host;
        }
        if let Some(port) = server.port {
            config.port = port;
        }
    }

    if let Some(gemini) = yaml.gemini {
        if let Some(key) = gemini.api_key.filter(|k| !k.trim().is_empty()) {
            config.gemini_api_key = Some(key);
        }
        if let Some(model) = gemini.model {
            config.model = model;
        }
        if let Some(voice) = gemini.voice {
            config.voice = parse_voice("gemini.voice", &voice)?;
        }
        if gemini.system_instructions.is_some() {
            config.system_instructions = gemini.system_instructions;
        }
        if gemini.preload_context.is_some() {
            config.preload_context = gemini.preload_context;
        }
        if let Some(affective) = gemini.affective_dialog {
            config.affective_dialog = affective;
        }
    }

    if let Some(security) = yaml.security {
        if let Some(origins) = security.allowed_origins {
            config.allowed_origins = origins
                .into_iter()
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
        }
        if let Some(allow) = security.allow_no_origin {
            config.allow_no_origin = allow;
        }
        if let Some(rps) = security.rate_limit_requests_per_second {
            config.rate_limit_requests_per_second = rps;
        }
        if let Some(burst) = security.rate_limit_burst_size {
            config.rate_limit_burst_size = burst;
        }
        if let Some(max) = security.max_websocket_connections {
            config.max_websocket_connections = (max > 0).then_some(max);
        }
        if let Some(per_ip) = security.max_connections_per_ip {
            config.max_connections_per_ip = per_ip;
        }
        if let Some(per_minute) = security.max_connections_per_minute {
            config.max_connections_per_minute = per_minute;
        }
    }

    if let Some(auth) = yaml.auth {
        if let Some(required) = auth.required {
            config.auth_required = required;
        }
        if let Some(project) = auth.firebase_project_id.filter(|p| !p.trim().is_empty()) {
            config.firebase_project_id = Some(project);
        }
        if let Some(ttl) = auth.token_cache_ttl_seconds {
            config.auth_token_cache_ttl_seconds = ttl;
        }
    }

    if let Some(sessions) = yaml.sessions {
        if let Some(max) = sessions.max_sessions {
            config.max_sessions = max;
        }
        if let Some(timeout) = sessions.idle_timeout_seconds {
            config.session_idle_timeout_seconds = timeout;
        }
    }

    if let Some(session) = yaml.session {
        let target = &mut config.session;
        if let Some(ms) = session.debounce_window_ms {
            target.debounce_window_ms = ms;
        }
        if let Some(ms) = session.retrigger_window_ms {
            target.retrigger_window_ms = ms;
        }
        if let Some(threshold) = session.interrupt_rms_threshold {
            target.interrupt_rms_threshold = threshold;
        }
        if let Some(ms) = session.interrupt_poll_interval_ms {
            target.interrupt_poll_interval_ms = ms;
        }
        if let Some(ack) = session.ack_tone {
            target.ack_tone = ack;
        }
        if let Some(capacity) = session.channel_capacity {
            target.channel_capacity = capacity;
        }
    }

    Ok(())
}
