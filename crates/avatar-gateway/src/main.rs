//! Avatar gateway: hosted-assistant chat and voiced, lip-synced replies for a 3D avatar front end.
//! POST /createAssistant, /start (JSON) and /chat, /talk (one-shot SSE).

mod handlers;
mod services;

use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use avatar_core::AvatarConfig;

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[avatar-gateway] .env not loaded: {} (using system environment)", e);
    }
    let config = AvatarConfig::from_env();

    // The guard flushes the file writer on exit; keep it for the life of main.
    let (file_layer, _log_guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "avatar-gateway.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    tracing::info!("avatar-gateway {} starting", avatar_core::version());
    for key in config.missing_keys() {
        tracing::warn!("{} is not set; endpoints that need it will report a configuration error", key);
    }

    let state = services::build_state(&config);
    let app = handlers::build_app(state, &config.allowed_origins);

    let listener = match tokio::net::TcpListener::bind(config.bind_addr.as_str()).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", config.bind_addr, e);
            std::process::exit(1);
        }
    };
    tracing::info!("Listening on {}", config.bind_addr);

    let server = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>());
    tokio::select! {
        result = server => {
            if let Err(e) = result {
                tracing::error!("Server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown requested (Ctrl+C received)");
        }
    }
}
