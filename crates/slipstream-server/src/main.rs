use std::net::SocketAddr;

use tracing_subscriber::EnvFilter;

use slipstream_server::config::ServerConfig;
use slipstream_server::{build_app, spawn_session_reaper};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::load();
    config.validate();

    let listen_addr = config.listen_addr.clone();
    let (app, state) = build_app(config);
    spawn_session_reaper(state);

    let listener = match tokio::net::TcpListener::bind(&listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %listen_addr, error = %e, "Failed to bind listener");
            std::process::exit(1);
        },
    };
    tracing::info!(addr = %listen_addr, "Slipstream server listening");

    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    {
        tracing::error!(error = %e, "Server error");
        std::process::exit(1);
    }
}
