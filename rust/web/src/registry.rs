use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use gametable_engine::games::pawns::{PawnsFactory, GAME_TYPE as PAWNS};
use gametable_engine::GameFactory;

use crate::errors::ApiError;

/// Schema of one configurable game option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OptionDef {
    Number { default: i64, min: i64, max: i64 },
    Select { choices: Vec<String>, default: String },
    Boolean { default: bool },
}

impl OptionDef {
    pub fn validate(&self, name: &str, value: &Value) -> Result<(), ApiError> {
        match self {
            OptionDef::Number { min, max, .. } => {
                let n = value.as_i64().ok_or_else(|| {
                    ApiError::invalid_args(format!("option `{name}` must be a number"))
                })?;
                if n < *min || n > *max {
                    return Err(ApiError::invalid_args(format!(
                        "option `{name}` must be between {min} and {max}"
                    )));
                }
            }
            OptionDef::Select { choices, .. } => {
                let s = value.as_str().ok_or_else(|| {
                    ApiError::invalid_args(format!("option `{name}` must be a string"))
                })?;
                if !choices.iter().any(|c| c == s) {
                    return Err(ApiError::invalid_args(format!(
                        "option `{name}` must be one of {choices:?}"
                    )));
                }
            }
            OptionDef::Boolean { .. } => {
                if !value.is_boolean() {
                    return Err(ApiError::invalid_args(format!(
                        "option `{name}` must be a boolean"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn default_value(&self) -> Value {
        match self {
            OptionDef::Number { default, .. } => Value::from(*default),
            OptionDef::Select { default, .. } => Value::String(default.clone()),
            OptionDef::Boolean { default } => Value::Bool(*default),
        }
    }
}

/// Everything the server knows about one registered game type.
pub struct GameDefinition {
    pub game_type: String,
    pub factory: Arc<dyn GameFactory>,
    pub min_players: u8,
    pub max_players: u8,
    pub game_options: BTreeMap<String, OptionDef>,
    /// Per-player options (color and similar); `Select` entries are
    /// unique per lobby, no two slots may hold the same value.
    pub player_options: BTreeMap<String, OptionDef>,
}

impl std::fmt::Debug for GameDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GameDefinition")
            .field("game_type", &self.game_type)
            .field("min_players", &self.min_players)
            .field("max_players", &self.max_players)
            .field("game_options", &self.game_options)
            .field("player_options", &self.player_options)
            .finish()
    }
}

impl GameDefinition {
    /// Validate a client-supplied game options map against the schema.
    /// Unknown keys are rejected.
    pub fn validate_game_options(&self, options: &Map<String, Value>) -> Result<(), ApiError> {
        for (name, value) in options {
            match self.game_options.get(name) {
                Some(def) => def.validate(name, value)?,
                None => {
                    return Err(ApiError::invalid_args(format!("unknown game option `{name}`")))
                }
            }
        }
        Ok(())
    }

    pub fn validate_player_count(&self, count: u8) -> Result<(), ApiError> {
        if count < self.min_players || count > self.max_players {
            return Err(ApiError::invalid_args(format!(
                "`{}` supports {}-{} players, got {count}",
                self.game_type, self.min_players, self.max_players
            )));
        }
        Ok(())
    }
}

/// Wire form of a definition, without the factory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameDefinitionInfo {
    pub game_type: String,
    pub min_players: u8,
    pub max_players: u8,
    pub game_options: BTreeMap<String, OptionDef>,
    pub player_options: BTreeMap<String, OptionDef>,
}

impl From<&GameDefinition> for GameDefinitionInfo {
    fn from(def: &GameDefinition) -> Self {
        Self {
            game_type: def.game_type.clone(),
            min_players: def.min_players,
            max_players: def.max_players,
            game_options: def.game_options.clone(),
            player_options: def.player_options.clone(),
        }
    }
}

/// Maps a game-type identifier to its factory and metadata.
#[derive(Debug, Default)]
pub struct GameRegistry {
    definitions: RwLock<HashMap<String, Arc<GameDefinition>>>,
}

impl GameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in reference game registered.
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        registry
            .register(GameDefinition {
                game_type: PAWNS.to_string(),
                factory: Arc::new(PawnsFactory),
                min_players: 2,
                max_players: 4,
                game_options: BTreeMap::from([
                    (
                        "trackLen".to_string(),
                        OptionDef::Number { default: 8, min: 4, max: 16 },
                    ),
                    (
                        "pawnsPerPlayer".to_string(),
                        OptionDef::Number { default: 2, min: 1, max: 4 },
                    ),
                ]),
                player_options: BTreeMap::from([(
                    "color".to_string(),
                    OptionDef::Select {
                        choices: vec![
                            "red".to_string(),
                            "blue".to_string(),
                            "green".to_string(),
                            "yellow".to_string(),
                        ],
                        default: "red".to_string(),
                    },
                )]),
            })
            .expect("register built-in game");
        registry
    }

    pub fn register(&self, definition: GameDefinition) -> Result<(), ApiError> {
        let mut guard = self.definitions.write().unwrap_or_else(|e| e.into_inner());
        if guard.contains_key(&definition.game_type) {
            return Err(ApiError::conflict(format!(
                "game type `{}` is already registered",
                definition.game_type
            )));
        }
        guard.insert(definition.game_type.clone(), Arc::new(definition));
        Ok(())
    }

    pub fn get(&self, game_type: &str) -> Option<Arc<GameDefinition>> {
        let guard = self.definitions.read().unwrap_or_else(|e| e.into_inner());
        guard.get(game_type).cloned()
    }

    pub fn require(&self, game_type: &str) -> Result<Arc<GameDefinition>, ApiError> {
        self.get(game_type)
            .ok_or_else(|| ApiError::not_found(format!("unknown game type `{game_type}`")))
    }

    pub fn list(&self) -> Vec<GameDefinitionInfo> {
        let guard = self.definitions.read().unwrap_or_else(|e| e.into_inner());
        let mut infos: Vec<GameDefinitionInfo> =
            guard.values().map(|def| GameDefinitionInfo::from(def.as_ref())).collect();
        infos.sort_by(|a, b| a.game_type.cmp(&b.game_type));
        infos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builtin_game_is_registered() {
        let registry = GameRegistry::with_builtin();
        let def = registry.get("pawns").expect("pawns registered");
        assert_eq!(def.min_players, 2);
        assert_eq!(def.max_players, 4);
        assert_eq!(registry.list().len(), 1);
        assert!(registry.get("chess").is_none());
    }

    #[test]
    fn duplicate_registration_conflicts() {
        let registry = GameRegistry::with_builtin();
        let err = registry
            .register(GameDefinition {
                game_type: "pawns".to_string(),
                factory: Arc::new(PawnsFactory),
                min_players: 2,
                max_players: 2,
                game_options: BTreeMap::new(),
                player_options: BTreeMap::new(),
            })
            .unwrap_err();
        assert_eq!(err.code, crate::errors::ErrorCode::Conflict);
    }

    #[test]
    fn option_validation_enforces_bounds_and_kinds() {
        let def = OptionDef::Number { default: 8, min: 4, max: 16 };
        assert!(def.validate("trackLen", &json!(8)).is_ok());
        assert!(def.validate("trackLen", &json!(3)).is_err());
        assert!(def.validate("trackLen", &json!("long")).is_err());

        let def = OptionDef::Select {
            choices: vec!["red".into(), "blue".into()],
            default: "red".into(),
        };
        assert!(def.validate("color", &json!("blue")).is_ok());
        assert!(def.validate("color", &json!("mauve")).is_err());

        let def = OptionDef::Boolean { default: false };
        assert!(def.validate("fast", &json!(true)).is_ok());
        assert!(def.validate("fast", &json!(1)).is_err());
    }

    #[test]
    fn game_option_maps_reject_unknown_keys() {
        let registry = GameRegistry::with_builtin();
        let def = registry.get("pawns").unwrap();

        let mut options = Map::new();
        options.insert("trackLen".to_string(), json!(10));
        assert!(def.validate_game_options(&options).is_ok());

        options.insert("bogus".to_string(), json!(1));
        assert!(def.validate_game_options(&options).is_err());
    }

    #[test]
    fn player_count_bounds() {
        let registry = GameRegistry::with_builtin();
        let def = registry.get("pawns").unwrap();
        assert!(def.validate_player_count(2).is_ok());
        assert!(def.validate_player_count(4).is_ok());
        assert!(def.validate_player_count(1).is_err());
        assert!(def.validate_player_count(5).is_err());
    }
}
