pub mod config;
pub mod health;
pub mod session_manager;
pub mod state;
pub mod ws;

use axum::Router;
use tower_http::services::ServeDir;

use config::ServerConfig;
use state::AppState;

/// Build the Axum router and application state from a config.
pub fn build_app(config: ServerConfig) -> (Router<()>, AppState) {
    let web_root = config.web_root.clone();
    let state = AppState::new(config);

    let app = Router::new()
        .route("/ws", axum::routing::get(ws::ws_handler))
        .route("/health", axum::routing::get(health::health_check))
        .fallback_service(ServeDir::new(&web_root))
        .with_state(state.clone());

    (app, state)
}

/// Background task that periodically purges sessions idle past the
/// configured timeout.
pub fn spawn_session_reaper(state: AppState) {
    let interval = std::time::Duration::from_secs(state.config.sessions.reap_interval_secs);
    let max_idle = state.config.sessions.idle_timeout();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; skip it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = state.sessions.write().await.reap_idle_sessions(max_idle);
            if removed > 0 {
                tracing::info!(removed, "Reaped idle sessions");
            }
        }
    });
}
