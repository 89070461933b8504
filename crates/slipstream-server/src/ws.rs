use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::extract::FromRequest;
use axum::extract::ws::{Message, Utf8Bytes, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use slipstream_core::player::PlayerId;
use slipstream_core::protocol::{ClientEvent, ServerEvent, decode_client_event};
use slipstream_core::session::normalize_session_code;

use crate::session_manager::{ConnectionId, EventSender, SessionError};
use crate::state::{AppState, ConnectionGuard, IpConnectionGuard};

/// Controllers see one opaque rejection for every join failure, so a code
/// probe cannot distinguish "full" from "nonexistent".
const INVALID_SESSION_MSG: &str = "Session invalide ou pleine.";

/// What this socket has bound itself to. A connection starts unbound and
/// commits to a role with its first successful create/reconnect/join.
enum Binding {
    Unbound,
    Host { code: String },
    Controller { code: String, player_id: PlayerId },
}

pub async fn ws_handler(
    State(state): State<AppState>,
    request: axum::extract::Request,
) -> Result<axum::response::Response, StatusCode> {
    let max_ws = state.config.limits.max_ws_connections;
    let current = state.ws_connection_count.load(Ordering::Relaxed);
    if current >= max_ws {
        tracing::warn!(current, max = max_ws, "WS connection limit reached");
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    // Per-IP connection limit
    let ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())
        .unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
    let max_per_ip = state.config.limits.max_ws_per_ip;
    let ip_guard = IpConnectionGuard::try_acquire(ip, Arc::clone(&state.ws_per_ip), max_per_ip);
    let Some(ip_guard) = ip_guard else {
        tracing::warn!(%ip, max_per_ip, "Per-IP WS connection limit reached");
        return Err(StatusCode::TOO_MANY_REQUESTS);
    };

    // Perform WebSocket upgrade manually
    let ws = WebSocketUpgrade::from_request(request, &state)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    Ok(ws
        .on_upgrade(move |socket| handle_socket(socket, state, ip_guard))
        .into_response())
}

async fn handle_socket(socket: WebSocket, state: AppState, _ip_guard: IpConnectionGuard) {
    let _guard = ConnectionGuard::new(Arc::clone(&state.ws_connection_count));
    let connection_id: ConnectionId = Uuid::new_v4();
    let (ws_sender, mut ws_receiver) = socket.split();

    let (tx, rx) = mpsc::channel::<Utf8Bytes>(state.config.limits.outbound_buffer);
    spawn_writer(ws_sender, rx);

    let mut binding = Binding::Unbound;
    let rate = state.config.limits.ws_rate_limit_per_sec;
    let mut rate_limiter = RateLimiter::new(rate, rate);

    while let Some(Ok(msg)) = ws_receiver.next().await {
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => break,
            // Pings are answered by axum; the protocol is text-only.
            _ => continue,
        };

        if !rate_limiter.allow() {
            tracing::debug!(%connection_id, "Rate limited");
            continue;
        }

        let mut event = match decode_client_event(text.as_str()) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(%connection_id, error = %e, "Dropping undecodable frame");
                continue;
            },
        };

        // Codes are matched case-insensitively: phones love autocapitalize.
        if let Some(code) = event.session_code_mut() {
            *code = normalize_session_code(code);
        }

        dispatch(event, &mut binding, connection_id, &tx, &state).await;
    }

    // Socket gone. Start the grace timer for whatever role it held.
    match binding {
        Binding::Unbound => {},
        Binding::Host { code } => {
            let grace = state.config.sessions.host_grace();
            state.sessions.write().await.host_disconnected(
                &code,
                connection_id,
                Arc::clone(&state.sessions),
                grace,
            );
        },
        Binding::Controller { code, player_id } => {
            let grace = state.config.sessions.controller_grace();
            state.sessions.write().await.controller_disconnected(
                &code,
                &player_id,
                connection_id,
                Arc::clone(&state.sessions),
                grace,
            );
        },
    }
}

async fn dispatch(
    event: ClientEvent,
    binding: &mut Binding,
    connection_id: ConnectionId,
    tx: &EventSender,
    state: &AppState,
) {
    // A binding to a session that has since closed (host grace expiry,
    // reaping) points at nothing; release it so the socket can bind anew
    // instead of having its create/join attempts dropped.
    if matches!(
        event,
        ClientEvent::CreateSession {}
            | ClientEvent::ReconnectHost { .. }
            | ClientEvent::JoinSession { .. }
    ) && let (Binding::Host { code } | Binding::Controller { code, .. }) = &*binding
        && !state.sessions.read().await.session_exists(code)
    {
        *binding = Binding::Unbound;
    }

    match event {
        ClientEvent::CreateSession {} => {
            if !matches!(binding, Binding::Unbound) {
                tracing::debug!(%connection_id, "Ignoring create_session on a bound connection");
                return;
            }
            let mut sessions = state.sessions.write().await;
            match sessions.create_session(connection_id, tx.clone()) {
                Ok(code) => {
                    send_self(tx, &ServerEvent::SessionCreated {
                        session_code: code.clone(),
                    });
                    *binding = Binding::Host { code };
                },
                Err(e) => {
                    tracing::error!(%connection_id, error = %e, "Failed to create session");
                    send_self(tx, &ServerEvent::InvalidSession {
                        message: INVALID_SESSION_MSG.to_string(),
                    });
                },
            }
        },

        ClientEvent::ReconnectHost { session_code } => {
            if !matches!(binding, Binding::Unbound) {
                return;
            }
            let mut sessions = state.sessions.write().await;
            match sessions.reconnect_host(&session_code, connection_id, tx.clone()) {
                Ok(players) => {
                    send_self(tx, &ServerEvent::HostReconnected {
                        session_code: session_code.clone(),
                        players,
                    });
                    *binding = Binding::Host { code: session_code };
                },
                Err(SessionError::NotFound) => {
                    send_self(tx, &ServerEvent::SessionNotFound {});
                },
                Err(e) => {
                    tracing::warn!(%connection_id, error = %e, "Host reconnect failed");
                    send_self(tx, &ServerEvent::SessionNotFound {});
                },
            }
        },

        ClientEvent::JoinSession {
            session_code,
            player_id,
        } => {
            if !matches!(binding, Binding::Unbound) {
                return;
            }
            let max_players = state.config.sessions.max_players;
            let mut sessions = state.sessions.write().await;
            match sessions.join_session(
                &session_code,
                player_id.as_deref(),
                connection_id,
                tx.clone(),
                max_players,
            ) {
                Ok(player) => {
                    send_self(tx, &ServerEvent::LobbyJoined {
                        player_id: player.id.clone(),
                    });
                    *binding = Binding::Controller {
                        code: session_code,
                        player_id: player.id,
                    };
                },
                Err(e) => {
                    tracing::debug!(%connection_id, session = %session_code, error = %e, "Join rejected");
                    send_self(tx, &ServerEvent::InvalidSession {
                        message: INVALID_SESSION_MSG.to_string(),
                    });
                },
            }
        },

        ClientEvent::UpdateName { session_code, name } => {
            let Some((code, player_id)) = controller_binding(binding, &session_code) else {
                return;
            };
            let mut sessions = state.sessions.write().await;
            match sessions.rename_player(code, player_id, &name) {
                Ok(()) => {},
                Err(SessionError::NameAlreadyTaken) => {
                    send_self(tx, &ServerEvent::NameAlreadyTaken {});
                },
                Err(e) => {
                    tracing::debug!(%connection_id, error = %e, "Rename failed");
                },
            }
        },

        ClientEvent::PlayerReady { session_code } => {
            let Some((code, player_id)) = controller_binding(binding, &session_code) else {
                return;
            };
            let countdown = state.config.sessions.countdown();
            let sessions_handle = Arc::clone(&state.sessions);
            let mut sessions = state.sessions.write().await;
            sessions.set_ready(code, player_id, true, sessions_handle, countdown);
        },

        ClientEvent::StartTurn {
            session_code,
            direction,
        } => {
            let Some((code, player_id)) = controller_binding(binding, &session_code) else {
                return;
            };
            let relayed = ServerEvent::StartTurn {
                player_id: player_id.to_string(),
                direction,
            };
            state
                .sessions
                .write()
                .await
                .relay_control(code, player_id, relayed);
        },

        ClientEvent::StopTurn { session_code } => {
            let Some((code, player_id)) = controller_binding(binding, &session_code) else {
                return;
            };
            let relayed = ServerEvent::StopTurn {
                player_id: player_id.to_string(),
            };
            state
                .sessions
                .write()
                .await
                .relay_control(code, player_id, relayed);
        },

        ClientEvent::Steer {
            session_code,
            angle,
        } => {
            let Some((code, player_id)) = controller_binding(binding, &session_code) else {
                return;
            };
            let relayed = ServerEvent::Steer {
                player_id: player_id.to_string(),
                angle,
            };
            state
                .sessions
                .write()
                .await
                .relay_control(code, player_id, relayed);
        },

        ClientEvent::PlayerEliminated {
            session_code,
            player_id,
            score,
        } => {
            let Some(code) = host_binding(binding, &session_code) else {
                return;
            };
            state
                .sessions
                .write()
                .await
                .mark_eliminated(code, &player_id, score);
        },

        ClientEvent::GameOver {
            session_code,
            score,
        } => {
            let Some(code) = host_binding(binding, &session_code) else {
                return;
            };
            state.sessions.write().await.game_over(code, score);
        },

        ClientEvent::RequestReplay { session_code } => {
            let Some(code) = host_binding(binding, &session_code) else {
                return;
            };
            state
                .sessions
                .write()
                .await
                .request_replay(code, connection_id);
        },

        ClientEvent::RequestActiveSessions {} => {
            let sessions = state.sessions.read().await;
            send_self(
                tx,
                &ServerEvent::AvailableSessionsList(sessions.active_sessions()),
            );
        },
    }
}

/// Resolve a controller-only event against the connection's binding. The
/// binding is the source of truth; a frame naming some other session is a
/// spoof attempt and gets dropped.
fn controller_binding<'a>(binding: &'a Binding, session_code: &str) -> Option<(&'a str, &'a str)> {
    match binding {
        Binding::Controller { code, player_id } if code == session_code => {
            Some((code, player_id))
        },
        Binding::Controller { code, .. } => {
            tracing::debug!(bound = %code, claimed = %session_code, "Session code mismatch");
            None
        },
        _ => None,
    }
}

/// Same, for host-only events.
fn host_binding<'a>(binding: &'a Binding, session_code: &str) -> Option<&'a str> {
    match binding {
        Binding::Host { code } if code == session_code => Some(code),
        Binding::Host { code } => {
            tracing::debug!(bound = %code, claimed = %session_code, "Session code mismatch");
            None
        },
        _ => None,
    }
}

fn send_self(tx: &EventSender, event: &ServerEvent) {
    match slipstream_core::protocol::encode_server_event(event) {
        Ok(text) => {
            if tx.try_send(Utf8Bytes::from(text)).is_err() {
                tracing::debug!("Outbound buffer full, dropping frame");
            }
        },
        Err(e) => tracing::warn!(error = %e, "Failed to encode server event"),
    }
}

fn spawn_writer(
    mut ws_sender: futures::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Utf8Bytes>,
) {
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });
}

/// Per-connection rate limiter (token bucket).
struct RateLimiter {
    tokens: f64,
    last_refill: tokio::time::Instant,
    max_tokens: f64,
    refill_rate: f64, // tokens per second
}

impl RateLimiter {
    fn new(max_tokens: f64, refill_rate: f64) -> Self {
        Self {
            tokens: max_tokens,
            last_refill: tokio::time::Instant::now(),
            max_tokens,
            refill_rate,
        }
    }

    /// Returns true if the message is allowed; false if rate-limited.
    fn allow(&mut self) -> bool {
        let now = tokio::time::Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
