use std::collections::HashMap;
use std::time::{Duration, Instant};

use axum::extract::ws::Utf8Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use slipstream_core::player::{MAX_NAME_LEN, Player, PlayerColor, PlayerId};
use slipstream_core::protocol::{ServerEvent, SessionSummary, encode_server_event};
use slipstream_core::session::{SessionPhase, generate_session_code};

use crate::state::SharedSessionManager;

/// Per-connection sender for outbound JSON frames. Bounded so a slow client
/// drops frames instead of growing memory; for steering relay only the
/// latest angle matters anyway.
pub type EventSender = mpsc::Sender<Utf8Bytes>;

/// Ephemeral identity of one WebSocket connection.
pub type ConnectionId = Uuid;

/// Give up drawing fresh codes after this many collisions in a row.
/// With a 36^6 space this only happens when the store is pathologically full.
const MAX_CODE_DRAWS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    NotFound,
    SessionFull,
    InvalidPhase,
    NameAlreadyTaken,
    CodeSpaceExhausted,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "session not found"),
            Self::SessionFull => write!(f, "session is full"),
            Self::InvalidPhase => write!(f, "not allowed in the current phase"),
            Self::NameAlreadyTaken => write!(f, "name already taken"),
            Self::CodeSpaceExhausted => write!(f, "session code space exhausted"),
        }
    }
}

impl std::error::Error for SessionError {}

/// A live connection bound to a session (host display or controller).
struct Connection {
    connection_id: ConnectionId,
    sender: EventSender,
}

/// A controller seat. `connection` is `None` while the player is inside the
/// disconnect grace window.
struct ControllerSlot {
    connection: Option<Connection>,
    grace_task: Option<JoinHandle<()>>,
}

struct SessionEntry {
    phase: SessionPhase,
    /// Join order, which the host uses for deterministic start positions.
    players: Vec<Player>,
    host: Option<Connection>,
    host_grace_task: Option<JoinHandle<()>>,
    countdown_task: Option<JoinHandle<()>>,
    controllers: HashMap<PlayerId, ControllerSlot>,
    next_player_seq: u32,
    last_activity: Instant,
}

impl SessionEntry {
    fn new(host: Connection) -> Self {
        Self {
            phase: SessionPhase::Lobby,
            players: Vec::new(),
            host: Some(host),
            host_grace_task: None,
            countdown_task: None,
            controllers: HashMap::new(),
            next_player_seq: 1,
            last_activity: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn player(&self, player_id: &str) -> Option<&Player> {
        self.players.iter().find(|p| p.id == player_id)
    }

    fn player_mut(&mut self, player_id: &str) -> Option<&mut Player> {
        self.players.iter_mut().find(|p| p.id == player_id)
    }

    fn is_controller_connected(&self, player_id: &str) -> bool {
        self.controllers
            .get(player_id)
            .is_some_and(|slot| slot.connection.is_some())
    }

    /// Phase change guarded by the lifecycle table. Invalid transitions are
    /// logged and rejected.
    fn set_phase(&mut self, code: &str, to: SessionPhase) -> bool {
        if self.phase.valid_transition(to) {
            self.phase = to;
            true
        } else {
            tracing::warn!(
                session = code,
                from = ?self.phase,
                to = ?to,
                "Invalid phase transition"
            );
            false
        }
    }

    fn abort_timers(&mut self) {
        if let Some(task) = self.host_grace_task.take() {
            task.abort();
        }
        if let Some(task) = self.countdown_task.take() {
            task.abort();
        }
        for slot in self.controllers.values_mut() {
            if let Some(task) = slot.grace_task.take() {
                task.abort();
            }
        }
    }
}

/// Manages all active sessions: store, roster, phase machine, and relay.
/// The shared `RwLock` around this struct serializes every mutation, so
/// grace timers and reconnects can never race each other.
pub struct SessionManager {
    sessions: HashMap<String, SessionEntry>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }

    /// Create a new session owned by the given host connection.
    pub fn create_session(
        &mut self,
        connection_id: ConnectionId,
        sender: EventSender,
    ) -> Result<String, SessionError> {
        let mut code = None;
        for _ in 0..MAX_CODE_DRAWS {
            let candidate = generate_session_code();
            if !self.sessions.contains_key(&candidate) {
                code = Some(candidate);
                break;
            }
        }
        let code = code.ok_or(SessionError::CodeSpaceExhausted)?;
        self.sessions.insert(
            code.clone(),
            SessionEntry::new(Connection {
                connection_id,
                sender,
            }),
        );
        tracing::info!(session = %code, "Session created");
        Ok(code)
    }

    /// Rebind a host display to its session after a drop. Also allows host
    /// replacement: a newly opened display takes over an attached session.
    /// Cancels any pending host grace timer.
    pub fn reconnect_host(
        &mut self,
        code: &str,
        connection_id: ConnectionId,
        sender: EventSender,
    ) -> Result<Vec<Player>, SessionError> {
        let entry = self.sessions.get_mut(code).ok_or(SessionError::NotFound)?;
        if let Some(task) = entry.host_grace_task.take() {
            task.abort();
        }
        entry.host = Some(Connection {
            connection_id,
            sender,
        });
        entry.touch();
        tracing::info!(session = code, "Host reconnected");
        Ok(entry.players.clone())
    }

    /// Join a controller to a session. When `existing_player_id` names a
    /// player inside its grace window, the connection is rebound to the
    /// retained record instead of creating a duplicate.
    pub fn join_session(
        &mut self,
        code: &str,
        existing_player_id: Option<&str>,
        connection_id: ConnectionId,
        sender: EventSender,
        max_players: usize,
    ) -> Result<Player, SessionError> {
        let entry = self.sessions.get_mut(code).ok_or(SessionError::NotFound)?;

        // Mid-grace reconnect path, valid in any phase.
        if let Some(player_id) = existing_player_id
            && entry.player(player_id).is_some()
            && let Some(slot) = entry.controllers.get_mut(player_id)
            && slot.connection.is_none()
        {
            if let Some(task) = slot.grace_task.take() {
                task.abort();
            }
            slot.connection = Some(Connection {
                connection_id,
                sender,
            });
            entry.touch();
            tracing::info!(session = code, player_id, "Controller reconnected within grace");
            let player = entry
                .player(player_id)
                .cloned()
                .ok_or(SessionError::NotFound)?;
            return Ok(player);
        }

        // Fresh join: Lobby only, capacity capped.
        if entry.phase != SessionPhase::Lobby {
            return Err(SessionError::InvalidPhase);
        }
        if entry.players.len() >= max_players {
            return Err(SessionError::SessionFull);
        }

        let seq = entry.next_player_seq;
        entry.next_player_seq += 1;
        let player = Player {
            id: format!("p{seq}"),
            name: format!("Joueur {seq}"),
            color: PlayerColor::PALETTE[entry.players.len() % PlayerColor::PALETTE.len()],
            is_ready: false,
            is_alive: true,
            score: 0,
        };
        entry.players.push(player.clone());
        entry.controllers.insert(
            player.id.clone(),
            ControllerSlot {
                connection: Some(Connection {
                    connection_id,
                    sender,
                }),
                grace_task: None,
            },
        );
        entry.touch();
        tracing::info!(session = code, player_id = %player.id, "Player joined");

        broadcast_except(code, entry, Some(&player.id), &ServerEvent::PlayerJoined(player.clone()));
        Ok(player)
    }

    /// Ready toggle, Lobby only — a silent no-op elsewhere. When every
    /// currently-connected player is ready (and at least one is present) the
    /// race starts: `start_game_for_all` goes out, the session enters
    /// Countdown, and a timer advances it to Racing.
    pub fn set_ready(
        &mut self,
        code: &str,
        player_id: &str,
        ready: bool,
        sessions: SharedSessionManager,
        countdown: Duration,
    ) {
        let Some(entry) = self.sessions.get_mut(code) else {
            return;
        };
        if entry.phase != SessionPhase::Lobby {
            tracing::debug!(session = code, player_id, "Ignoring ready toggle outside Lobby");
            return;
        }
        let Some(player) = entry.player_mut(player_id) else {
            return;
        };
        player.is_ready = ready;
        entry.touch();
        broadcast(
            code,
            entry,
            &ServerEvent::PlayerStatusUpdated {
                player_id: player_id.to_string(),
                is_ready: ready,
            },
        );

        let connected: Vec<&Player> = entry
            .players
            .iter()
            .filter(|p| {
                entry
                    .controllers
                    .get(&p.id)
                    .is_some_and(|slot| slot.connection.is_some())
            })
            .collect();
        let all_ready = !connected.is_empty() && connected.iter().all(|p| p.is_ready);
        if !all_ready {
            return;
        }

        entry.set_phase(code, SessionPhase::Countdown);
        for p in &mut entry.players {
            p.is_alive = true;
            p.score = 0;
        }
        broadcast(
            code,
            entry,
            &ServerEvent::StartGameForAll {
                players: entry.players.clone(),
            },
        );
        tracing::info!(session = code, players = entry.players.len(), "Countdown started");

        let code_owned = code.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(countdown).await;
            let mut mgr = sessions.write().await;
            // Re-validate: the lobby may have been aborted while we slept.
            if let Some(entry) = mgr.sessions.get_mut(&code_owned)
                && entry.phase == SessionPhase::Countdown
            {
                entry.set_phase(&code_owned, SessionPhase::Racing);
                entry.countdown_task = None;
                tracing::info!(session = %code_owned, "Race started");
            }
        });
        if let Some(entry) = self.sessions.get_mut(code) {
            entry.countdown_task = Some(handle);
        }
    }

    /// Rename a player. Valid in any phase; the sanitized name must not
    /// collide with another player's in the same session.
    pub fn rename_player(
        &mut self,
        code: &str,
        player_id: &str,
        raw_name: &str,
    ) -> Result<(), SessionError> {
        let entry = self.sessions.get_mut(code).ok_or(SessionError::NotFound)?;
        let name = sanitize_name(raw_name);
        if name.is_empty() {
            // Blank rename is a no-op; the placeholder stands.
            return Ok(());
        }
        let taken = entry
            .players
            .iter()
            .any(|p| p.id != player_id && p.name.to_lowercase() == name.to_lowercase());
        if taken {
            return Err(SessionError::NameAlreadyTaken);
        }
        let Some(player) = entry.player_mut(player_id) else {
            return Err(SessionError::NotFound);
        };
        player.name = name.clone();
        entry.touch();
        broadcast(
            code,
            entry,
            &ServerEvent::PlayerNameUpdated {
                player_id: player_id.to_string(),
                new_name: name,
            },
        );
        Ok(())
    }

    /// Forward a control event to the session's host, Racing phase only.
    /// The event is already tagged with the originating player's id.
    pub fn relay_control(&mut self, code: &str, player_id: &str, event: ServerEvent) {
        let Some(entry) = self.sessions.get_mut(code) else {
            return;
        };
        if entry.phase != SessionPhase::Racing {
            tracing::debug!(session = code, player_id, "Dropping control event outside Racing");
            return;
        }
        if entry.player(player_id).is_none() {
            return;
        }
        entry.touch();
        if let Some(host) = &entry.host {
            send(code, &host.sender, &event);
        }
    }

    /// Host reports a crash-out. The player record is retained with its
    /// frozen score for the final scoreboard; the controller is told its
    /// race is over.
    pub fn mark_eliminated(&mut self, code: &str, player_id: &str, final_score: Option<u32>) {
        let Some(entry) = self.sessions.get_mut(code) else {
            return;
        };
        if entry.phase != SessionPhase::Racing {
            tracing::debug!(session = code, player_id, "Ignoring elimination outside Racing");
            return;
        }
        let Some(player) = entry.player_mut(player_id) else {
            return;
        };
        player.is_alive = false;
        if let Some(score) = final_score {
            // Scores never move backwards during a race.
            player.score = player.score.max(score);
        }
        let score = player.score;
        entry.touch();
        tracing::info!(session = code, player_id, score, "Player eliminated");
        send_to_player(code, entry, player_id, &ServerEvent::GameOver { score });
    }

    /// Host reports the race concluded. Survivors inherit the representative
    /// score, every controller is notified, and the session parks in
    /// GameOver until a replay request.
    pub fn game_over(&mut self, code: &str, score: u32) {
        let Some(entry) = self.sessions.get_mut(code) else {
            return;
        };
        if !entry.set_phase(code, SessionPhase::GameOver) {
            return;
        }
        for player in &mut entry.players {
            if player.is_alive {
                player.score = player.score.max(score);
            }
        }
        entry.touch();
        tracing::info!(session = code, score, "Race over");
        broadcast_controllers(code, entry, &ServerEvent::GameOver { score });
    }

    /// Replay is host-authoritative: requests from controller connections
    /// are ignored. Resets every retained player for a fresh lobby.
    pub fn request_replay(&mut self, code: &str, connection_id: ConnectionId) {
        let Some(entry) = self.sessions.get_mut(code) else {
            return;
        };
        if entry.phase != SessionPhase::GameOver {
            tracing::debug!(session = code, "Ignoring replay request outside GameOver");
            return;
        }
        let from_host = entry
            .host
            .as_ref()
            .is_some_and(|h| h.connection_id == connection_id);
        if !from_host {
            tracing::debug!(session = code, "Ignoring replay request from non-host connection");
            return;
        }
        entry.set_phase(code, SessionPhase::Lobby);
        for player in &mut entry.players {
            player.is_ready = false;
            player.is_alive = true;
            player.score = 0;
        }
        entry.touch();
        tracing::info!(session = code, "Returning to lobby");
        broadcast(
            code,
            entry,
            &ServerEvent::ReturnToLobby {
                players: entry.players.clone(),
            },
        );
    }

    /// Remove a player for good (explicit leave or grace expiry). Aborts the
    /// race back to Lobby when the roster empties mid-game.
    pub fn remove_player(&mut self, code: &str, player_id: &str) {
        let Some(entry) = self.sessions.get_mut(code) else {
            return;
        };
        if let Some(mut slot) = entry.controllers.remove(player_id)
            && let Some(task) = slot.grace_task.take()
        {
            task.abort();
        }
        let before = entry.players.len();
        entry.players.retain(|p| p.id != player_id);
        if entry.players.len() == before {
            return;
        }
        entry.touch();
        tracing::info!(session = code, player_id, "Player left");
        broadcast(
            code,
            entry,
            &ServerEvent::PlayerLeft {
                player_id: player_id.to_string(),
            },
        );
        if entry.players.is_empty() && entry.phase != SessionPhase::Lobby {
            if let Some(task) = entry.countdown_task.take() {
                task.abort();
            }
            entry.set_phase(code, SessionPhase::Lobby);
        }
    }

    /// A controller's socket dropped. The player keeps its slot for the
    /// grace window; the timer re-validates before evicting, and is aborted
    /// outright if the controller reconnects first.
    pub fn controller_disconnected(
        &mut self,
        code: &str,
        player_id: &str,
        connection_id: ConnectionId,
        sessions: SharedSessionManager,
        grace: Duration,
    ) {
        let Some(entry) = self.sessions.get_mut(code) else {
            return;
        };
        let Some(slot) = entry.controllers.get_mut(player_id) else {
            return;
        };
        // A stale socket (already replaced by a reconnect) changes nothing.
        match &slot.connection {
            Some(conn) if conn.connection_id == connection_id => {},
            _ => return,
        }
        slot.connection = None;
        if let Some(task) = slot.grace_task.take() {
            task.abort();
        }
        tracing::info!(session = code, player_id, "Controller disconnected, grace timer started");

        let code_owned = code.to_string();
        let player_owned = player_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let mut mgr = sessions.write().await;
            let still_gone = mgr
                .sessions
                .get(&code_owned)
                .is_some_and(|e| !e.is_controller_connected(&player_owned));
            if still_gone {
                mgr.remove_player(&code_owned, &player_owned);
            }
        });
        if let Some(entry) = self.sessions.get_mut(code)
            && let Some(slot) = entry.controllers.get_mut(player_id)
        {
            slot.grace_task = Some(handle);
        }
    }

    /// The host display's socket dropped. The session survives for the host
    /// grace window, then closes and evicts everyone.
    pub fn host_disconnected(
        &mut self,
        code: &str,
        connection_id: ConnectionId,
        sessions: SharedSessionManager,
        grace: Duration,
    ) {
        let Some(entry) = self.sessions.get_mut(code) else {
            return;
        };
        match &entry.host {
            Some(host) if host.connection_id == connection_id => {},
            _ => return,
        }
        entry.host = None;
        if let Some(task) = entry.host_grace_task.take() {
            task.abort();
        }
        tracing::info!(session = code, "Host disconnected, grace timer started");

        let code_owned = code.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let mut mgr = sessions.write().await;
            // The host may have reconnected while we slept.
            let still_absent = mgr
                .sessions
                .get(&code_owned)
                .is_some_and(|e| e.host.is_none());
            if still_absent {
                tracing::info!(session = %code_owned, "Host grace expired, closing session");
                mgr.close_session(&code_owned);
            }
        });
        if let Some(entry) = self.sessions.get_mut(code) {
            entry.host_grace_task = Some(handle);
        }
    }

    /// Tear down a session. Idempotent; every bound connection hears
    /// `session_closed` before removal.
    pub fn close_session(&mut self, code: &str) {
        let Some(mut entry) = self.sessions.remove(code) else {
            return;
        };
        entry.abort_timers();
        broadcast(code, &entry, &ServerEvent::SessionClosed {});
        tracing::info!(session = code, "Session closed");
    }

    /// Purge sessions idle past `max_idle`. Run periodically, not on every
    /// event. Returns the number removed.
    pub fn reap_idle_sessions(&mut self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_activity) >= max_idle)
            .map(|(code, _)| code.clone())
            .collect();
        for code in &stale {
            tracing::info!(session = %code, "Reaping idle session");
            self.close_session(code);
        }
        stale.len()
    }

    /// Joinable sessions for the discovery response.
    pub fn active_sessions(&self) -> Vec<SessionSummary> {
        let mut list: Vec<SessionSummary> = self
            .sessions
            .iter()
            .filter(|(_, e)| e.phase == SessionPhase::Lobby)
            .map(|(code, e)| SessionSummary {
                session_code: code.clone(),
                player_count: e.players.len(),
            })
            .collect();
        list.sort_by(|a, b| a.session_code.cmp(&b.session_code));
        list
    }

    /// (active sessions, total players) for the health endpoint.
    pub fn stats(&self) -> (usize, usize) {
        let players = self.sessions.values().map(|e| e.players.len()).sum();
        (self.sessions.len(), players)
    }

    pub fn session_exists(&self, code: &str) -> bool {
        self.sessions.contains_key(code)
    }

    #[cfg(test)]
    fn get_players(&self, code: &str) -> Option<Vec<Player>> {
        self.sessions.get(code).map(|e| e.players.clone())
    }

    #[cfg(test)]
    fn get_phase(&self, code: &str) -> Option<SessionPhase> {
        self.sessions.get(code).map(|e| e.phase)
    }

    #[cfg(test)]
    fn age_session(&mut self, code: &str, age: Duration) {
        if let Some(entry) = self.sessions.get_mut(code)
            && let Some(when) = Instant::now().checked_sub(age)
        {
            entry.last_activity = when;
        }
    }
}

/// Trim, strip control characters, cap the length.
fn sanitize_name(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_NAME_LEN)
        .collect()
}

fn send(code: &str, sender: &EventSender, event: &ServerEvent) {
    let Ok(text) = encode_server_event(event) else {
        tracing::warn!(session = code, "Failed to encode server event");
        return;
    };
    if sender.try_send(Utf8Bytes::from(text)).is_err() {
        tracing::debug!(session = code, "Dropping frame for slow or closed connection");
    }
}

/// Send one event to every bound connection: the host and all connected
/// controllers. Encoded once; `Utf8Bytes` clones are zero-copy.
fn broadcast(code: &str, entry: &SessionEntry, event: &ServerEvent) {
    broadcast_except(code, entry, None, event);
}

fn broadcast_except(code: &str, entry: &SessionEntry, exclude: Option<&str>, event: &ServerEvent) {
    let Ok(text) = encode_server_event(event) else {
        tracing::warn!(session = code, "Failed to encode server event");
        return;
    };
    let frame = Utf8Bytes::from(text);
    if let Some(host) = &entry.host
        && host.sender.try_send(frame.clone()).is_err()
    {
        tracing::debug!(session = code, "Skipping broadcast to slow host");
    }
    for (player_id, slot) in &entry.controllers {
        if exclude.is_some_and(|ex| ex == player_id) {
            continue;
        }
        if let Some(conn) = &slot.connection
            && conn.sender.try_send(frame.clone()).is_err()
        {
            tracing::debug!(session = code, player_id = %player_id, "Skipping broadcast to slow controller");
        }
    }
}

fn broadcast_controllers(code: &str, entry: &SessionEntry, event: &ServerEvent) {
    let Ok(text) = encode_server_event(event) else {
        tracing::warn!(session = code, "Failed to encode server event");
        return;
    };
    let frame = Utf8Bytes::from(text);
    for (player_id, slot) in &entry.controllers {
        if let Some(conn) = &slot.connection
            && conn.sender.try_send(frame.clone()).is_err()
        {
            tracing::debug!(session = code, player_id = %player_id, "Skipping broadcast to slow controller");
        }
    }
}

fn send_to_player(code: &str, entry: &SessionEntry, player_id: &str, event: &ServerEvent) {
    if let Some(slot) = entry.controllers.get(player_id)
        && let Some(conn) = &slot.connection
    {
        send(code, &conn.sender, event);
    }
}
