use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use forum_server::config::{generate_config_template, Config};
use forum_server::state::{AppState, AuthRateLimit};
use forum_server::{db, routes, ws};

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
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("forum_server=info"));
    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().pretty().with_env_filter(filter).init();
    }

    tracing::info!("Forum server v{} starting", env!("CARGO_PKG_VERSION"));

    // Initialize SQLite database
    let db = db::init_db(&config.data_dir)?;

    // Real-time hub control loop
    let hub = ws::spawn_hub(config.realtime.announce_presence);

    tracing::info!(
        outbound_queue_capacity = config.realtime.outbound_queue_capacity,
        ping_interval_secs = config.realtime.ping_interval_secs,
        pong_timeout_secs = config.realtime.pong_timeout_secs,
        "Real-time hub started"
    );

    let app_state = AppState {
        db,
        hub,
        session_ttl_hours: config.session_ttl_hours,
        secure_cookies: config.secure_cookies,
        auth_rate_limit: AuthRateLimit {
            burst_size: config.auth_burst_size,
            replenish_secs: config.auth_replenish_secs,
        },
        realtime: config.realtime.clone(),
    };

    // Build router
    let app = routes::build_router(app_state);

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
