use serde::{Deserialize, Serialize};

use crate::player::{Player, PlayerId};

/// Maximum accepted frame size in bytes.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024; // 64 KiB

#[derive(Debug)]
pub enum ProtocolError {
    EmptyMessage,
    PayloadTooLarge(usize),
    SerializeError(String),
    DeserializeError(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyMessage => write!(f, "empty message"),
            Self::PayloadTooLarge(size) => {
                write!(f, "payload too large: {size} bytes (max {MAX_MESSAGE_SIZE})")
            },
            Self::SerializeError(e) => write!(f, "serialize error: {e}"),
            Self::DeserializeError(e) => write!(f, "deserialize error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Steering direction for button-style controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnDirection {
    Left,
    Right,
}

/// Every inbound frame is `{"event": <name>, "data": {...}}`. The event
/// names are the wire contract with the browser clients; the enum replaces
/// their string-keyed handler tables with a single typed router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    /// Host display asks for a fresh session.
    CreateSession {},
    /// Host display reclaims an existing session after a drop.
    ReconnectHost { session_code: String },
    /// Controller joins a lobby; `player_id` rebinds a mid-grace player.
    JoinSession {
        session_code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        player_id: Option<PlayerId>,
    },
    UpdateName { session_code: String, name: String },
    PlayerReady { session_code: String },
    StartTurn {
        session_code: String,
        direction: TurnDirection,
    },
    StopTurn { session_code: String },
    Steer { session_code: String, angle: f32 },
    /// Host reports a crash-out. The observed runtime omits the score, in
    /// which case the player's last recorded score stands.
    PlayerEliminated {
        session_code: String,
        player_id: PlayerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        score: Option<u32>,
    },
    /// Host reports the race concluded with a representative score.
    GameOver { session_code: String, score: u32 },
    RequestReplay { session_code: String },
    RequestActiveSessions {},
}

impl ClientEvent {
    /// Mutable access to the session code, for gateway-side normalization.
    pub fn session_code_mut(&mut self) -> Option<&mut String> {
        match self {
            Self::ReconnectHost { session_code }
            | Self::JoinSession { session_code, .. }
            | Self::UpdateName { session_code, .. }
            | Self::PlayerReady { session_code }
            | Self::StartTurn { session_code, .. }
            | Self::StopTurn { session_code }
            | Self::Steer { session_code, .. }
            | Self::PlayerEliminated { session_code, .. }
            | Self::GameOver { session_code, .. }
            | Self::RequestReplay { session_code } => Some(session_code),
            Self::CreateSession {} | Self::RequestActiveSessions {} => None,
        }
    }
}

/// One row of the discovery response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_code: String,
    pub player_count: usize,
}

/// Outbound frames, same envelope as [`ClientEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    SessionCreated { session_code: String },
    HostReconnected {
        session_code: String,
        players: Vec<Player>,
    },
    SessionNotFound {},
    InvalidSession { message: String },
    LobbyJoined { player_id: PlayerId },
    PlayerJoined(Player),
    PlayerLeft { player_id: PlayerId },
    PlayerStatusUpdated { player_id: PlayerId, is_ready: bool },
    PlayerNameUpdated { player_id: PlayerId, new_name: String },
    NameAlreadyTaken {},
    StartGameForAll { players: Vec<Player> },
    ReturnToLobby { players: Vec<Player> },
    GameOver { score: u32 },
    SessionClosed {},
    AvailableSessionsList(Vec<SessionSummary>),

    // Control relay, server → host, tagged with the originating player.
    StartTurn {
        player_id: PlayerId,
        direction: TurnDirection,
    },
    StopTurn { player_id: PlayerId },
    Steer { player_id: PlayerId, angle: f32 },
}

/// Encode a server event to its JSON text frame.
pub fn encode_server_event(event: &ServerEvent) -> Result<String, ProtocolError> {
    let text =
        serde_json::to_string(event).map_err(|e| ProtocolError::SerializeError(e.to_string()))?;
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::PayloadTooLarge(text.len()));
    }
    Ok(text)
}

/// Decode a raw text frame into a client event.
pub fn decode_client_event(text: &str) -> Result<ClientEvent, ProtocolError> {
    if text.is_empty() {
        return Err(ProtocolError::EmptyMessage);
    }
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::PayloadTooLarge(text.len()));
    }
    serde_json::from_str(text).map_err(|e| ProtocolError::DeserializeError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::PlayerColor;

    fn test_player() -> Player {
        Player {
            id: "p1".to_string(),
            name: "Joueur 1".to_string(),
            color: PlayerColor::default(),
            is_ready: false,
            is_alive: true,
            score: 0,
        }
    }

    #[test]
    fn decode_join_session() {
        let frame = r#"{"event":"join_session","data":{"sessionCode":"AB12CD"}}"#;
        let event = decode_client_event(frame).unwrap();
        assert_eq!(
            event,
            ClientEvent::JoinSession {
                session_code: "AB12CD".to_string(),
                player_id: None,
            }
        );
    }

    #[test]
    fn decode_join_session_with_reconnect_id() {
        let frame = r#"{"event":"join_session","data":{"sessionCode":"AB12CD","playerId":"p3"}}"#;
        let event = decode_client_event(frame).unwrap();
        assert_eq!(
            event,
            ClientEvent::JoinSession {
                session_code: "AB12CD".to_string(),
                player_id: Some("p3".to_string()),
            }
        );
    }

    #[test]
    fn decode_steer_and_turns() {
        let steer = r#"{"event":"steer","data":{"sessionCode":"AB12CD","angle":-12.5}}"#;
        match decode_client_event(steer).unwrap() {
            ClientEvent::Steer { angle, .. } => assert!((angle + 12.5).abs() < f32::EPSILON),
            other => panic!("expected steer, got {other:?}"),
        }

        let turn = r#"{"event":"start_turn","data":{"sessionCode":"AB12CD","direction":"left"}}"#;
        match decode_client_event(turn).unwrap() {
            ClientEvent::StartTurn { direction, .. } => {
                assert_eq!(direction, TurnDirection::Left);
            },
            other => panic!("expected start_turn, got {other:?}"),
        }
    }

    #[test]
    fn roundtrip_client_events() {
        let events = [
            ClientEvent::CreateSession {},
            ClientEvent::ReconnectHost {
                session_code: "AB12CD".to_string(),
            },
            ClientEvent::UpdateName {
                session_code: "AB12CD".to_string(),
                name: "Léa".to_string(),
            },
            ClientEvent::PlayerReady {
                session_code: "AB12CD".to_string(),
            },
            ClientEvent::StopTurn {
                session_code: "AB12CD".to_string(),
            },
            ClientEvent::PlayerEliminated {
                session_code: "AB12CD".to_string(),
                player_id: "p2".to_string(),
                score: None,
            },
            ClientEvent::GameOver {
                session_code: "AB12CD".to_string(),
                score: 742,
            },
            ClientEvent::RequestReplay {
                session_code: "AB12CD".to_string(),
            },
            ClientEvent::RequestActiveSessions {},
        ];
        for event in events {
            let text = serde_json::to_string(&event).unwrap();
            assert_eq!(decode_client_event(&text).unwrap(), event);
        }
    }

    #[test]
    fn server_event_names_match_wire_contract() {
        let cases: Vec<(ServerEvent, &str)> = vec![
            (
                ServerEvent::SessionCreated {
                    session_code: "AB12CD".to_string(),
                },
                "session_created",
            ),
            (ServerEvent::SessionNotFound {}, "session_not_found"),
            (
                ServerEvent::LobbyJoined {
                    player_id: "p1".to_string(),
                },
                "lobby_joined",
            ),
            (ServerEvent::PlayerJoined(test_player()), "player_joined"),
            (
                ServerEvent::StartGameForAll {
                    players: vec![test_player()],
                },
                "start_game_for_all",
            ),
            (ServerEvent::GameOver { score: 10 }, "game_over"),
            (ServerEvent::SessionClosed {}, "session_closed"),
            (
                ServerEvent::AvailableSessionsList(vec![SessionSummary {
                    session_code: "AB12CD".to_string(),
                    player_count: 3,
                }]),
                "available_sessions_list",
            ),
        ];
        for (event, name) in cases {
            let value = serde_json::to_value(&event).unwrap();
            assert_eq!(value["event"], name);
        }
    }

    #[test]
    fn player_joined_payload_is_flat_player() {
        let text = encode_server_event(&ServerEvent::PlayerJoined(test_player())).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["data"]["id"], "p1");
        assert_eq!(value["data"]["isReady"], false);
        assert_eq!(value["data"]["color"], "#FF5757");
    }

    #[test]
    fn status_update_uses_camel_case_fields() {
        let text = encode_server_event(&ServerEvent::PlayerStatusUpdated {
            player_id: "p1".to_string(),
            is_ready: true,
        })
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["data"]["playerId"], "p1");
        assert_eq!(value["data"]["isReady"], true);
    }

    #[test]
    fn unknown_event_rejected() {
        let result = decode_client_event(r#"{"event":"set_turbo","data":{}}"#);
        assert!(matches!(result, Err(ProtocolError::DeserializeError(_))));
    }

    #[test]
    fn empty_and_oversized_frames_rejected() {
        assert!(matches!(
            decode_client_event(""),
            Err(ProtocolError::EmptyMessage)
        ));
        let huge = format!(
            r#"{{"event":"update_name","data":{{"sessionCode":"AB12CD","name":"{}"}}}}"#,
            "x".repeat(MAX_MESSAGE_SIZE)
        );
        assert!(matches!(
            decode_client_event(&huge),
            Err(ProtocolError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn session_code_mut_covers_code_carrying_events() {
        let mut event = ClientEvent::JoinSession {
            session_code: "ab12cd".to_string(),
            player_id: None,
        };
        if let Some(code) = event.session_code_mut() {
            *code = crate::session::normalize_session_code(code);
        }
        assert_eq!(
            event,
            ClientEvent::JoinSession {
                session_code: "AB12CD".to_string(),
                player_id: None,
            }
        );
        assert!(ClientEvent::CreateSession {}.session_code_mut().is_none());
        assert!(
            ClientEvent::RequestActiveSessions {}
                .session_code_mut()
                .is_none()
        );
    }

    #[test]
    fn protocol_error_display() {
        assert_eq!(format!("{}", ProtocolError::EmptyMessage), "empty message");
        assert!(format!("{}", ProtocolError::PayloadTooLarge(99999)).contains("99999"));
        assert!(format!("{}", ProtocolError::DeserializeError("oops".into())).contains("oops"));
    }
}
