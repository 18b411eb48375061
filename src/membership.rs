use serde_json::Value as JsonValue;

use crate::ids::PlayerId;

const HUMAN: &str = "Human";

/// Human participants of a decoded save, in declaration order without duplicates.
///
/// Missing or mistyped fields yield an empty list; callers decide whether that is
/// acceptable.
pub fn extract_human_player_ids(save: &JsonValue) -> Vec<PlayerId> {
    let Some(players) = save
        .pointer("/gameParameters/players")
        .and_then(JsonValue::as_array)
    else {
        return Vec::new();
    };

    let mut ids: Vec<PlayerId> = Vec::with_capacity(players.len());
    for entry in players {
        if entry.get("playerType").and_then(JsonValue::as_str) != Some(HUMAN) {
            continue;
        }
        let Some(raw) = entry.get("playerId").and_then(JsonValue::as_str) else {
            continue;
        };
        if raw.is_empty() || ids.iter().any(|id| id.as_str() == raw) {
            continue;
        }
        ids.push(PlayerId::from_stored(raw));
    }
    ids
}
