use std::net::SocketAddr;
use tokio::net::TcpListener;

use pairchat_server::config::{generate_config_template, Config};
use pairchat_server::{db, dm, routes, state};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Initialize tracing/logging
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("pairchat_server=info"));
    if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(env_filter)
            .init();
    }

    tracing::info!(
        "pairchat server v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    // Initialize SQLite database
    let db = db::init_db(&config.data_dir)?;

    // Message encryption key: derived from the configured secret, or
    // loaded from / generated into data_dir
    let cipher = dm::keys::message_cipher(&config.data_dir, config.message_secret.as_deref())?;

    let chat = config.chat.clone().unwrap_or_default();
    let rate_limit = config.rate_limit.clone().unwrap_or_default();
    tracing::info!(
        recall_window_ms = chat.recall_window_ms,
        rate_limit = rate_limit.enabled,
        "Messaging configured"
    );

    // Build application state and router
    let app_state = state::AppState::new(db, cipher, chat);
    let app = routes::build_router(app_state, &rate_limit);

    // Bind and serve
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
