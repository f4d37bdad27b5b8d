use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use gametable_ai::AiLevel;
use gametable_engine::Seat;

use crate::errors::ApiError;
use crate::registry::{GameDefinition, OptionDef};

const DEFAULT_AI_LEVEL: &str = "medium";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Open,
    Ai,
    Claimed,
}

/// One row of the lobby; corresponds to a future seat (its 1-indexed
/// position in the slot list).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LobbySlot {
    pub status: SlotStatus,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub player_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ai_level: Option<String>,
    #[serde(default)]
    pub player_options: Map<String, Value>,
    pub ready: bool,
    pub connected: bool,
}

impl LobbySlot {
    fn open() -> Self {
        Self {
            status: SlotStatus::Open,
            name: String::new(),
            player_id: None,
            ai_level: None,
            player_options: Map::new(),
            ready: false,
            connected: false,
        }
    }

    fn ai(level: String) -> Self {
        Self {
            status: SlotStatus::Ai,
            name: format!("AI ({level})"),
            player_id: None,
            ai_level: Some(level),
            player_options: Map::new(),
            ready: true,
            connected: false,
        }
    }

    fn clear(&mut self) {
        *self = Self::open();
    }
}

/// Per-seat configuration accepted at game creation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerConfig {
    #[serde(default)]
    pub is_ai: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ai_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub name: Option<String>,
}

/// Slot assignments handed to the game constructor when the lobby
/// transitions to playing.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotAssignments {
    pub player_names: Vec<String>,
    pub player_options: Vec<Map<String, Value>>,
    pub ai_players: BTreeMap<Seat, String>,
    pub player_ids: Vec<(Seat, String)>,
    pub game_options: Map<String, Value>,
}

/// Pre-game slot configuration. A `Lobby` value exists only while the
/// game is waiting; the transition to playing consumes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lobby {
    pub slots: Vec<LobbySlot>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub creator_id: Option<String>,
    #[serde(default)]
    pub game_options: Map<String, Value>,
    pub min_players: u8,
    pub max_players: u8,
}

impl Lobby {
    pub fn new(
        def: &GameDefinition,
        player_count: u8,
        creator_id: Option<String>,
        player_configs: &[PlayerConfig],
        game_options: Map<String, Value>,
    ) -> Result<Self, ApiError> {
        def.validate_player_count(player_count)?;
        def.validate_game_options(&game_options)?;

        let mut slots = Vec::with_capacity(player_count as usize);
        for seat in 0..player_count as usize {
            let config = player_configs.get(seat).cloned().unwrap_or_default();
            if config.is_ai {
                let level = config.ai_level.unwrap_or_else(|| DEFAULT_AI_LEVEL.to_string());
                validate_ai_level(&level)?;
                slots.push(LobbySlot::ai(level));
            } else {
                slots.push(LobbySlot::open());
            }
        }

        Ok(Self {
            slots,
            creator_id,
            game_options,
            min_players: def.min_players,
            max_players: def.max_players,
        })
    }

    pub fn slot_count(&self) -> u8 {
        self.slots.len() as u8
    }

    fn slot(&self, seat: Seat) -> Result<&LobbySlot, ApiError> {
        if seat == 0 {
            return Err(ApiError::not_found("seats are 1-indexed"));
        }
        self.slots
            .get((seat - 1) as usize)
            .ok_or_else(|| ApiError::not_found(format!("no slot for seat {seat}")))
    }

    fn slot_mut(&mut self, seat: Seat) -> Result<&mut LobbySlot, ApiError> {
        if seat == 0 {
            return Err(ApiError::not_found("seats are 1-indexed"));
        }
        self.slots
            .get_mut((seat - 1) as usize)
            .ok_or_else(|| ApiError::not_found(format!("no slot for seat {seat}")))
    }

    /// Seat owned by a player id, if any.
    pub fn seat_of(&self, player_id: &str) -> Option<Seat> {
        self.slots
            .iter()
            .position(|s| s.player_id.as_deref() == Some(player_id))
            .map(|i| (i + 1) as Seat)
    }

    fn require_seat_of(&self, player_id: &str) -> Result<Seat, ApiError> {
        self.seat_of(player_id)
            .ok_or_else(|| ApiError::forbidden(format!("player `{player_id}` holds no slot")))
    }

    /// Host check. A lobby created without a creator id trusts every
    /// caller with host operations.
    fn require_host(&self, player_id: &str) -> Result<(), ApiError> {
        match &self.creator_id {
            Some(creator) if creator != player_id => {
                Err(ApiError::forbidden("only the lobby creator may do that"))
            }
            _ => Ok(()),
        }
    }

    pub fn claim_seat(&mut self, seat: Seat, player_id: &str, name: &str)
        -> Result<(), ApiError> {
        if self.seat_of(player_id).is_some() {
            return Err(ApiError::conflict(format!(
                "player `{player_id}` already holds a slot"
            )));
        }
        let slot = self.slot_mut(seat)?;
        if slot.status != SlotStatus::Open {
            return Err(ApiError::conflict(format!("seat {seat} is not open")));
        }
        slot.status = SlotStatus::Claimed;
        slot.player_id = Some(player_id.to_string());
        slot.name = name.to_string();
        slot.ready = false;
        slot.connected = true;
        Ok(())
    }

    pub fn leave_seat(&mut self, player_id: &str) -> Result<Seat, ApiError> {
        if self.creator_id.as_deref() == Some(player_id) {
            return Err(ApiError::forbidden("the creator cannot leave the lobby"));
        }
        let seat = self.require_seat_of(player_id)?;
        self.slot_mut(seat)?.clear();
        Ok(seat)
    }

    pub fn set_ready(&mut self, player_id: &str, ready: bool) -> Result<(), ApiError> {
        let seat = self.require_seat_of(player_id)?;
        self.slot_mut(seat)?.ready = ready;
        Ok(())
    }

    pub fn update_slot_name(&mut self, player_id: &str, name: &str) -> Result<(), ApiError> {
        let seat = self.require_seat_of(player_id)?;
        self.slot_mut(seat)?.name = name.to_string();
        Ok(())
    }

    pub fn add_slot(&mut self, host_id: &str) -> Result<(), ApiError> {
        self.require_host(host_id)?;
        if self.slot_count() >= self.max_players {
            return Err(ApiError::conflict(format!(
                "lobby is already at the maximum of {} players",
                self.max_players
            )));
        }
        self.slots.push(LobbySlot::open());
        Ok(())
    }

    pub fn remove_slot(&mut self, host_id: &str, seat: Seat) -> Result<(), ApiError> {
        self.require_host(host_id)?;
        if self.slot_count() <= self.min_players {
            return Err(ApiError::conflict(format!(
                "lobby is already at the minimum of {} players",
                self.min_players
            )));
        }
        if self.slot(seat)?.status == SlotStatus::Claimed {
            return Err(ApiError::conflict("cannot remove a claimed slot"));
        }
        // Remaining slots renumber implicitly: seat is list position.
        self.slots.remove((seat - 1) as usize);
        Ok(())
    }

    pub fn set_slot_ai(
        &mut self,
        host_id: &str,
        seat: Seat,
        is_ai: bool,
        ai_level: Option<&str>,
    ) -> Result<(), ApiError> {
        self.require_host(host_id)?;
        let slot = self.slot(seat)?;
        if slot.status == SlotStatus::Claimed {
            return Err(ApiError::conflict("cannot toggle AI on a claimed slot"));
        }
        if is_ai {
            let level = ai_level.unwrap_or(DEFAULT_AI_LEVEL).to_string();
            validate_ai_level(&level)?;
            *self.slot_mut(seat)? = LobbySlot::ai(level);
        } else {
            self.slot_mut(seat)?.clear();
        }
        Ok(())
    }

    /// Kick the human in `seat`. Returns the kicked player id so the
    /// caller can force-close their connection.
    pub fn kick_player(&mut self, host_id: &str, seat: Seat) -> Result<String, ApiError> {
        self.require_host(host_id)?;
        if let Some(host_seat) = self.seat_of(host_id) {
            if host_seat == seat {
                return Err(ApiError::forbidden("cannot kick yourself"));
            }
        }
        let slot = self.slot(seat)?;
        if slot.status != SlotStatus::Claimed {
            return Err(ApiError::conflict(format!("seat {seat} is not claimed")));
        }
        let kicked = slot.player_id.clone().unwrap_or_default();
        self.slot_mut(seat)?.clear();
        Ok(kicked)
    }

    pub fn update_player_options(
        &mut self,
        def: &GameDefinition,
        player_id: &str,
        options: &Map<String, Value>,
    ) -> Result<(), ApiError> {
        let seat = self.require_seat_of(player_id)?;
        self.merge_slot_options(def, seat, options)
    }

    pub fn update_slot_player_options(
        &mut self,
        def: &GameDefinition,
        host_id: &str,
        seat: Seat,
        options: &Map<String, Value>,
    ) -> Result<(), ApiError> {
        self.require_host(host_id)?;
        self.slot(seat)?;
        self.merge_slot_options(def, seat, options)
    }

    fn merge_slot_options(
        &mut self,
        def: &GameDefinition,
        seat: Seat,
        options: &Map<String, Value>,
    ) -> Result<(), ApiError> {
        for (name, value) in options {
            let option_def = def.player_options.get(name).ok_or_else(|| {
                ApiError::invalid_args(format!("unknown player option `{name}`"))
            })?;
            option_def.validate(name, value)?;
            // Enumerated options are exclusive: no two slots may hold the
            // same value (color clash).
            if matches!(option_def, OptionDef::Select { .. }) {
                let taken = self.slots.iter().enumerate().any(|(i, slot)| {
                    (i + 1) as Seat != seat && slot.player_options.get(name) == Some(value)
                });
                if taken {
                    return Err(ApiError::conflict(format!(
                        "`{name}` value {value} is already taken"
                    )));
                }
            }
        }
        let slot = self.slot_mut(seat)?;
        for (name, value) in options {
            slot.player_options.insert(name.clone(), value.clone());
        }
        Ok(())
    }

    pub fn update_game_options(
        &mut self,
        def: &GameDefinition,
        host_id: &str,
        options: &Map<String, Value>,
    ) -> Result<(), ApiError> {
        self.require_host(host_id)?;
        def.validate_game_options(options)?;
        for (name, value) in options {
            self.game_options.insert(name.clone(), value.clone());
        }
        Ok(())
    }

    /// Mirror connection liveness onto a human's slot. Returns true when
    /// the flag actually changed.
    pub fn set_connected(&mut self, player_id: &str, connected: bool) -> bool {
        match self.seat_of(player_id) {
            Some(seat) => match self.slots.get_mut((seat - 1) as usize) {
                Some(slot) if slot.connected != connected => {
                    slot.connected = connected;
                    true
                }
                _ => false,
            },
            None => false,
        }
    }

    /// Start gate: every slot filled and every human ready.
    pub fn is_ready(&self) -> bool {
        self.slots.iter().all(|slot| match slot.status {
            SlotStatus::Open => false,
            SlotStatus::Ai => true,
            SlotStatus::Claimed => slot.ready,
        })
    }

    /// Consume the lobby into constructor inputs. Fails `Conflict` when
    /// the start gate does not hold.
    pub fn into_assignments(self) -> Result<SlotAssignments, ApiError> {
        if !self.is_ready() {
            return Err(ApiError::conflict(
                "cannot start: every seat must be filled and every player ready",
            ));
        }
        let mut assignments = SlotAssignments {
            player_names: Vec::with_capacity(self.slots.len()),
            player_options: Vec::with_capacity(self.slots.len()),
            ai_players: BTreeMap::new(),
            player_ids: Vec::new(),
            game_options: self.game_options,
        };
        for (index, slot) in self.slots.into_iter().enumerate() {
            let seat = (index + 1) as Seat;
            assignments.player_names.push(if slot.name.is_empty() {
                format!("Player {seat}")
            } else {
                slot.name
            });
            assignments.player_options.push(slot.player_options);
            if let Some(level) = slot.ai_level {
                assignments.ai_players.insert(seat, level);
            }
            if let Some(player_id) = slot.player_id {
                assignments.player_ids.push((seat, player_id));
            }
        }
        Ok(assignments)
    }
}

fn validate_ai_level(level: &str) -> Result<(), ApiError> {
    AiLevel::parse(level)
        .map(|_| ())
        .ok_or_else(|| ApiError::invalid_args(format!("unknown AI level `{level}`")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::GameRegistry;
    use serde_json::json;
    use std::sync::Arc;

    fn def() -> Arc<GameDefinition> {
        GameRegistry::with_builtin().get("pawns").expect("pawns")
    }

    fn open_lobby(count: u8) -> Lobby {
        Lobby::new(&def(), count, Some("host".into()), &[], Map::new()).expect("lobby")
    }

    #[test]
    fn ready_gate_requires_full_and_ready() {
        let mut lobby = open_lobby(2);
        assert!(!lobby.is_ready());

        lobby.claim_seat(1, "host", "A").expect("claim 1");
        assert!(!lobby.is_ready());
        assert!(lobby.clone().into_assignments().is_err());

        lobby.claim_seat(2, "p2", "B").expect("claim 2");
        assert!(!lobby.is_ready());

        lobby.set_ready("host", true).expect("ready host");
        lobby.set_ready("p2", true).expect("ready p2");
        assert!(lobby.is_ready());

        let assignments = lobby.into_assignments().expect("assignments");
        assert_eq!(assignments.player_names, vec!["A".to_string(), "B".to_string()]);
        assert_eq!(assignments.player_ids.len(), 2);
        assert!(assignments.ai_players.is_empty());
    }

    #[test]
    fn ai_slots_are_always_ready() {
        let configs = vec![
            PlayerConfig::default(),
            PlayerConfig { is_ai: true, ai_level: Some("easy".into()), name: None },
        ];
        let mut lobby =
            Lobby::new(&def(), 2, Some("host".into()), &configs, Map::new()).expect("lobby");
        lobby.claim_seat(1, "host", "A").expect("claim");
        lobby.set_ready("host", true).expect("ready");
        assert!(lobby.is_ready());

        let assignments = lobby.into_assignments().expect("assignments");
        assert_eq!(assignments.ai_players.get(&2), Some(&"easy".to_string()));
    }

    #[test]
    fn claim_conflicts() {
        let mut lobby = open_lobby(2);
        lobby.claim_seat(1, "p1", "A").expect("claim");

        let err = lobby.claim_seat(1, "p2", "B").unwrap_err();
        assert_eq!(err.code, crate::errors::ErrorCode::Conflict);

        // Same player may not hold two slots.
        let err = lobby.claim_seat(2, "p1", "A again").unwrap_err();
        assert_eq!(err.code, crate::errors::ErrorCode::Conflict);
    }

    #[test]
    fn slot_count_boundaries() {
        let mut lobby = open_lobby(2);
        lobby.add_slot("host").expect("3");
        lobby.add_slot("host").expect("4");
        let err = lobby.add_slot("host").unwrap_err();
        assert_eq!(err.code, crate::errors::ErrorCode::Conflict);

        lobby.remove_slot("host", 4).expect("remove 4");
        lobby.remove_slot("host", 3).expect("remove 3");
        let err = lobby.remove_slot("host", 2).unwrap_err();
        assert_eq!(err.code, crate::errors::ErrorCode::Conflict);
    }

    #[test]
    fn host_only_operations() {
        let mut lobby = open_lobby(3);
        lobby.claim_seat(2, "p2", "B").expect("claim");

        assert!(lobby.add_slot("p2").is_err());
        assert!(lobby.remove_slot("p2", 3).is_err());
        assert!(lobby.set_slot_ai("p2", 3, true, None).is_err());
        assert!(lobby.kick_player("p2", 2).is_err());

        lobby.set_slot_ai("host", 3, true, Some("hard")).expect("set ai");
        assert_eq!(lobby.slots[2].status, SlotStatus::Ai);
        lobby.set_slot_ai("host", 3, false, None).expect("unset ai");
        assert_eq!(lobby.slots[2].status, SlotStatus::Open);
    }

    #[test]
    fn kick_clears_slot_and_reports_player() {
        let mut lobby = open_lobby(2);
        lobby.claim_seat(1, "host", "A").expect("claim host");
        lobby.claim_seat(2, "p2", "B").expect("claim p2");

        let kicked = lobby.kick_player("host", 2).expect("kick");
        assert_eq!(kicked, "p2");
        assert_eq!(lobby.slots[1].status, SlotStatus::Open);

        let err = lobby.kick_player("host", 1).unwrap_err();
        assert_eq!(err.code, crate::errors::ErrorCode::Forbidden);
    }

    #[test]
    fn leave_clears_readiness_and_blocks_creator() {
        let mut lobby = open_lobby(2);
        lobby.claim_seat(1, "host", "A").expect("claim host");
        lobby.claim_seat(2, "p2", "B").expect("claim p2");
        lobby.set_ready("p2", true).expect("ready");

        lobby.leave_seat("p2").expect("leave");
        assert_eq!(lobby.slots[1].status, SlotStatus::Open);
        assert!(!lobby.slots[1].ready);

        let err = lobby.leave_seat("host").unwrap_err();
        assert_eq!(err.code, crate::errors::ErrorCode::Forbidden);
    }

    #[test]
    fn color_clash_is_rejected() {
        let d = def();
        let mut lobby = open_lobby(2);
        lobby.claim_seat(1, "p1", "A").expect("claim");
        lobby.claim_seat(2, "p2", "B").expect("claim");

        let mut red = Map::new();
        red.insert("color".to_string(), json!("red"));
        lobby.update_player_options(&d, "p1", &red).expect("p1 red");

        let err = lobby.update_player_options(&d, "p2", &red).unwrap_err();
        assert_eq!(err.code, crate::errors::ErrorCode::Conflict);

        let mut blue = Map::new();
        blue.insert("color".to_string(), json!("blue"));
        lobby.update_player_options(&d, "p2", &blue).expect("p2 blue");

        // Re-applying your own color is idempotent, not a clash.
        lobby.update_player_options(&d, "p1", &red).expect("p1 red again");
        assert_eq!(lobby.slots[0].player_options.get("color"), Some(&json!("red")));
    }

    #[test]
    fn set_ready_is_idempotent() {
        let mut lobby = open_lobby(2);
        lobby.claim_seat(1, "p1", "A").expect("claim");
        lobby.set_ready("p1", true).expect("ready");
        lobby.set_ready("p1", true).expect("ready again");
        assert!(lobby.slots[0].ready);
    }

    #[test]
    fn game_options_are_validated() {
        let d = def();
        let mut lobby = open_lobby(2);

        let mut options = Map::new();
        options.insert("trackLen".to_string(), json!(12));
        lobby.update_game_options(&d, "host", &options).expect("set");
        assert_eq!(lobby.game_options.get("trackLen"), Some(&json!(12)));

        options.insert("trackLen".to_string(), json!(99));
        assert!(lobby.update_game_options(&d, "host", &options).is_err());
    }

    #[test]
    fn connected_flag_tracks_liveness() {
        let mut lobby = open_lobby(2);
        lobby.claim_seat(1, "p1", "A").expect("claim");
        assert!(lobby.slots[0].connected);

        assert!(lobby.set_connected("p1", false));
        assert!(!lobby.set_connected("p1", false));
        assert!(!lobby.slots[0].connected);
        assert!(!lobby.set_connected("ghost", true));
    }
}
