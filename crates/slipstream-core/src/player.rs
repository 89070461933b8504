use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Per-session player identifier ("p1", "p2", …). Stable across reconnects
/// when the controller presents a previously issued id.
pub type PlayerId = String;

/// Display nicknames are truncated to this many characters.
pub const MAX_NAME_LEN: usize = 16;

/// A controller-backed participant in a session, as seen by clients.
/// Connection state lives server-side and is never serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub id: PlayerId,
    pub name: String,
    pub color: PlayerColor,
    pub is_ready: bool,
    pub is_alive: bool,
    pub score: u32,
}

/// Car tint, serialized as "#RRGGBB" so the host display can hand it
/// straight to its color parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayerColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Default for PlayerColor {
    fn default() -> Self {
        Self::PALETTE[0]
    }
}

impl PlayerColor {
    /// One color per seat; sessions cap at 10 players.
    pub const PALETTE: &[PlayerColor] = &[
        PlayerColor { r: 255, g: 87, b: 87 },   // red
        PlayerColor { r: 78, g: 205, b: 196 },  // teal
        PlayerColor { r: 255, g: 195, b: 18 },  // yellow
        PlayerColor { r: 130, g: 88, b: 255 },  // purple
        PlayerColor { r: 46, g: 213, b: 115 },  // green
        PlayerColor { r: 255, g: 148, b: 77 },  // orange
        PlayerColor { r: 83, g: 152, b: 255 },  // blue
        PlayerColor { r: 255, g: 107, b: 175 }, // pink
        PlayerColor { r: 236, g: 240, b: 241 }, // white
        PlayerColor { r: 120, g: 144, b: 156 }, // grey
    ];

    pub fn to_hex(self) -> String {
        format!("#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let hex = s.strip_prefix('#')?;
        if hex.len() != 6 {
            return None;
        }
        let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
        let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
        let b = u8::from_str_radix(&hex[4..6], 16).ok()?;
        Some(Self { r, g, b })
    }
}

impl Serialize for PlayerColor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PlayerColor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PlayerColor::from_hex(&s)
            .ok_or_else(|| D::Error::custom(format!("invalid color string: {s:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_hex_roundtrip() {
        for &color in PlayerColor::PALETTE {
            let hex = color.to_hex();
            assert_eq!(PlayerColor::from_hex(&hex), Some(color));
        }
    }

    #[test]
    fn color_serializes_as_hex_string() {
        let json = serde_json::to_string(&PlayerColor { r: 255, g: 87, b: 87 }).unwrap();
        assert_eq!(json, "\"#FF5757\"");
    }

    #[test]
    fn color_rejects_malformed_strings() {
        assert!(PlayerColor::from_hex("FF5757").is_none());
        assert!(PlayerColor::from_hex("#F57").is_none());
        assert!(PlayerColor::from_hex("#GG5757").is_none());
    }

    #[test]
    fn player_json_uses_camel_case() {
        let player = Player {
            id: "p1".to_string(),
            name: "Joueur 1".to_string(),
            color: PlayerColor::default(),
            is_ready: true,
            is_alive: true,
            score: 42,
        };
        let json = serde_json::to_value(&player).unwrap();
        assert_eq!(json["isReady"], true);
        assert_eq!(json["isAlive"], true);
        assert_eq!(json["score"], 42);
    }
}
