use std::net::SocketAddr;
use std::path::PathBuf;

use tracing::info;

use clap::{Parser, Subcommand};
use http::{HeaderValue, Method, header::CONTENT_TYPE};
use tokio::net::TcpListener;
use tower_governor::{
    GovernorLayer, governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor,
};
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;

use anyhow::anyhow;

use avatar_relay::{ServerConfig, routes, state::AppState};

/// Avatar Relay - duplex audio relay between browsers and Gemini Live
#[derive(Parser, Debug)]
#[command(name = "avatar-relay")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Subcommand to run
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load and validate the configuration, then exit
    CheckConfig,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<ServerConfig> {
    match path {
        Some(config_path) => {
            println!("Loading configuration from {}", config_path.display());
            ServerConfig::from_file(config_path).map_err(|e| anyhow!(e.to_string()))
        }
        None => ServerConfig::from_env().map_err(|e| anyhow!(e.to_string())),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt::init();

    // The model channel dials out over TLS
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    if let Some(Commands::CheckConfig) = cli.command {
        println!("Configuration OK: {:?}", config);
        if !config.has_api_key() {
            println!("Warning: no model API key configured; /ready will report not ready");
        }
        return Ok(());
    }

    let address = config.address();
    let rate_limit_rps = config.rate_limit_requests_per_second;
    let rate_limit_burst = config.rate_limit_burst_size;
    let cors_origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    println!("Starting server on {address}");

    let app_state = AppState::new(config).await;
    app_state.log_limits();

    // Rate limiting (disabled when rate >= 100000 for load testing)
    let governor_layer = if rate_limit_rps < 100000 {
        let governor_config = GovernorConfigBuilder::default()
            .per_second(rate_limit_rps as u64)
            .burst_size(rate_limit_burst)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow!("Invalid rate limiter configuration"))?;
        Some(GovernorLayer::new(governor_config))
    } else {
        println!("Rate limiting disabled (rate >= 100000/s)");
        None
    };

    // CORS mirrors the WebSocket origin allow-list
    let cors_layer = CorsLayer::new()
        .allow_origin(cors_origins)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE])
        .allow_credentials(false);

    let security_headers = tower::ServiceBuilder::new()
        .layer(SetResponseHeaderLayer::overriding(
            http::header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            http::header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ));

    let app = routes::create_router(app_state)
        .layer(cors_layer)
        .layer(tower::util::option_layer(governor_layer))
        .layer(security_headers);

    let socket_addr: SocketAddr = address
        .parse()
        .map_err(|e| anyhow!("Invalid server address '{}': {}", address, e))?;

    info!("Server listening on http://{}", socket_addr);

    let listener = TcpListener::bind(&socket_addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
