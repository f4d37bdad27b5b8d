use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::action::SerializedAction;
use crate::element::{Element, ElementTree, Seat};
use crate::errors::EngineError;
use crate::game::GameEngine;

pub const SNAPSHOT_VERSION: u32 = 1;

/// A versioned capture of a game's full state plus the action log that
/// produced it. The element tree inside `state` is authoritative for
/// checkpoint restore; the action history is authoritative for replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameSnapshot {
    pub version: u32,
    pub game_type: String,
    pub seed: u64,
    /// Engine state blob as produced by `GameEngine::state_blob`.
    pub state: Value,
    pub action_history: Vec<SerializedAction>,
    /// RFC3339 capture time; metadata only, never replayed.
    pub taken_at: String,
}

/// Capture the full state of a game.
pub fn create_snapshot(
    game: &dyn GameEngine,
    action_history: &[SerializedAction],
    seed: u64,
) -> Result<GameSnapshot, EngineError> {
    Ok(GameSnapshot {
        version: SNAPSHOT_VERSION,
        game_type: game.game_type().to_string(),
        seed,
        state: game.state_blob()?,
        action_history: action_history.to_vec(),
        taken_at: chrono::Utc::now().to_rfc3339(),
    })
}

/// Restore a game from a snapshot taken on the same game type.
pub fn restore_snapshot(game: &mut dyn GameEngine, snapshot: &GameSnapshot)
    -> Result<(), EngineError> {
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(EngineError::SnapshotVersion {
            found: snapshot.version,
            expected: SNAPSHOT_VERSION,
        });
    }
    if snapshot.game_type != game.game_type() {
        return Err(EngineError::CorruptSnapshot(format!(
            "snapshot is for game type `{}`, not `{}`",
            snapshot.game_type,
            game.game_type()
        )));
    }
    game.restore(&snapshot.state)
}

/// Per-seat filtered representation of the element tree. Hidden nodes are
/// emitted with `__hidden: true` and their attributes and contents
/// redacted; the policy comes from element visibility, never from here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerView {
    /// `None` is the spectator view.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seat: Option<Seat>,
    pub phase: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_player: Option<Seat>,
    pub tree: Value,
}

/// Build the masked view of `game` for one seat (or a spectator).
pub fn create_player_view(game: &dyn GameEngine, seat: Option<Seat>) -> PlayerView {
    let tree = game.tree();
    let root = tree
        .get(tree.root())
        .map(|el| mask_element(tree, el, seat))
        .unwrap_or(Value::Null);
    PlayerView {
        seat,
        phase: game.phase().to_string(),
        current_player: game.current_player(),
        tree: root,
    }
}

/// Views for every seat, 1..=player_count.
pub fn create_all_player_views(game: &dyn GameEngine) -> Vec<PlayerView> {
    (1..=game.player_count())
        .map(|seat| create_player_view(game, Some(seat)))
        .collect()
}

fn mask_element(tree: &ElementTree, element: &Element, seat: Option<Seat>) -> Value {
    let mut node = Map::new();
    node.insert("id".to_string(), Value::from(element.id));
    node.insert("name".to_string(), Value::String(element.name.clone()));
    node.insert("kind".to_string(), Value::String(element.kind.clone()));
    if let Some(owner) = element.owner {
        node.insert("owner".to_string(), Value::from(owner));
    }

    if !element.visible_to(seat) {
        node.insert("__hidden".to_string(), Value::Bool(true));
        return Value::Object(node);
    }

    node.insert(
        "attributes".to_string(),
        Value::Object(element.attributes.clone()),
    );
    let children: Vec<Value> = element
        .children
        .iter()
        .filter_map(|id| tree.get(*id))
        .map(|child| mask_element(tree, child, seat))
        .collect();
    node.insert("children".to_string(), Value::Array(children));
    Value::Object(node)
}

/// Convenience used by tests and the persistence invariant check: two
/// games are state-equal when their trees serialize identically.
pub fn trees_equal(a: &dyn GameEngine, b: &dyn GameEngine) -> bool {
    json!(a.tree()) == json!(b.tree())
}
