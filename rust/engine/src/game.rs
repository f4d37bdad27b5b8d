use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::action::{ActionArgs, ActionMetadata, SelectionChoices};
use crate::element::{ElementTree, Seat};
use crate::errors::EngineError;

/// A rule-emitted event appended to a per-action buffer. The buffer is
/// cleared at the start of the next `perform_action`, so each batch is
/// broadcast exactly once; `id` is monotonic per game for client dedup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnimationEvent {
    pub id: u64,
    pub name: String,
    pub data: Value,
}

/// Everything a factory needs to construct a game instance. Replay of the
/// same setup plus the same action log must reproduce the same state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameSetup {
    pub seed: u64,
    pub player_names: Vec<String>,
    /// Per-seat options (color and similar), parallel to `player_names`.
    #[serde(default)]
    pub player_options: Vec<Map<String, Value>>,
    #[serde(default)]
    pub game_options: Map<String, Value>,
}

impl GameSetup {
    pub fn new(seed: u64, player_names: Vec<String>) -> Self {
        Self { seed, player_names, player_options: Vec::new(), game_options: Map::new() }
    }

    pub fn player_count(&self) -> u8 {
        self.player_names.len() as u8
    }
}

/// The engine contract the session layer programs against.
///
/// Implementations must be deterministic: the same `GameSetup` followed by
/// the same sequence of successful `perform_action` calls always yields an
/// identical tree and identical snapshots. A failed `perform_action` must
/// leave the game unchanged.
pub trait GameEngine: Send {
    fn game_type(&self) -> &str;
    fn player_count(&self) -> u8;
    fn player_names(&self) -> &[String];

    /// Game-defined phase label (for example `playing`, `finished`).
    fn phase(&self) -> &str;
    fn current_player(&self) -> Option<Seat>;
    fn is_complete(&self) -> bool;
    fn winners(&self) -> Vec<Seat>;

    /// Action names currently legal for `seat`.
    fn available_actions(&self, seat: Seat) -> Vec<String>;
    fn action_metadata(&self, action: &str) -> Option<ActionMetadata>;
    fn all_action_metadata(&self) -> Vec<ActionMetadata>;

    /// Enumerate choices for one selection of one action, given the
    /// selections made so far.
    fn selection_choices(
        &self,
        action: &str,
        selection: &str,
        seat: Seat,
        args: &ActionArgs,
    ) -> Result<SelectionChoices, EngineError>;

    /// Execute an action. On error the game state is unchanged.
    fn perform_action(&mut self, name: &str, seat: Seat, args: &ActionArgs)
        -> Result<(), EngineError>;

    /// Events emitted by the most recent successful action.
    fn animation_events(&self) -> &[AnimationEvent];

    fn tree(&self) -> &ElementTree;

    /// Full engine state as a versioned, self-contained JSON blob.
    fn state_blob(&self) -> Result<Value, EngineError>;

    /// Restore from a blob produced by [`state_blob`](Self::state_blob)
    /// on the same game type.
    fn restore(&mut self, blob: &Value) -> Result<(), EngineError>;
}

/// Constructs engines for one game type. Registered in the game registry
/// and invoked at session creation, replay, and restart.
pub trait GameFactory: Send + Sync {
    fn create(&self, setup: &GameSetup) -> Result<Box<dyn GameEngine>, EngineError>;
}
