use std::sync::atomic::Ordering;

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::state::AppState;

/// Structured health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub connections: ConnectionInfo,
    pub sessions: SessionInfo,
}

#[derive(Serialize)]
pub struct ConnectionInfo {
    pub websocket: usize,
}

#[derive(Serialize)]
pub struct SessionInfo {
    pub active: usize,
    pub players: usize,
}

/// Health endpoint: server status, connection count, and session totals.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let ws = state.ws_connection_count.load(Ordering::Relaxed);

    let (active_sessions, total_players) = {
        let sessions = state.sessions.read().await;
        sessions.stats()
    };

    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        connections: ConnectionInfo { websocket: ws },
        sessions: SessionInfo {
            active: active_sessions,
            players: total_players,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_response_serializes() {
        let resp = HealthResponse {
            status: "healthy",
            version: "0.1.0",
            connections: ConnectionInfo { websocket: 5 },
            sessions: SessionInfo {
                active: 2,
                players: 7,
            },
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"healthy\""));
        assert!(json.contains("\"websocket\":5"));
        assert!(json.contains("\"active\":2"));
        assert!(json.contains("\"players\":7"));
    }
}
