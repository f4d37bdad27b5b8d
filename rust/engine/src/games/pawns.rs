//! Reference game: a race of pawns along a shared track.
//!
//! Each seat owns a few pawns on an N-square track plus one face-down
//! card only its owner may see. `move` is a two-step action (pick a
//! piece, then a destination that depends on it), `advance` takes its
//! argument directly, `reveal` flips the own card without ending the
//! turn. First seat to walk a pawn off the end wins. Everything is
//! deterministic for a given seed, so replaying an action log rebuilds
//! an identical tree.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::action::{
    ActionArgs, ActionMetadata, MultiSelectConfig, SelectionChoices, SelectionDef, SelectionKind,
};
use crate::element::{ElementId, ElementTree, Seat, Visibility};
use crate::errors::EngineError;
use crate::game::{AnimationEvent, GameEngine, GameFactory, GameSetup};
use crate::value::SerializedValue;

pub const GAME_TYPE: &str = "pawns";

const DEFAULT_TRACK_LEN: u64 = 8;
const DEFAULT_PAWNS_PER_PLAYER: u64 = 2;
const MIN_PLAYERS: u8 = 2;
const MAX_PLAYERS: u8 = 4;

pub struct PawnsFactory;

impl GameFactory for PawnsFactory {
    fn create(&self, setup: &GameSetup) -> Result<Box<dyn GameEngine>, EngineError> {
        Ok(Box::new(PawnsGame::new(setup)?))
    }
}

/// Serialized engine state. The tree carries all per-element facts
/// (positions, card ranks, revealed flags via visibility); the rest is
/// turn bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PawnsState {
    tree: ElementTree,
    current: Seat,
    complete: bool,
    winner: Option<Seat>,
    next_event_id: u64,
    track_len: u64,
}

pub struct PawnsGame {
    player_names: Vec<String>,
    state: PawnsState,
    events: Vec<AnimationEvent>,
}

impl PawnsGame {
    pub fn new(setup: &GameSetup) -> Result<Self, EngineError> {
        let players = setup.player_count();
        if !(MIN_PLAYERS..=MAX_PLAYERS).contains(&players) {
            return Err(EngineError::InvalidArgs(format!(
                "pawns supports {MIN_PLAYERS}-{MAX_PLAYERS} players, got {players}"
            )));
        }

        let track_len = option_u64(setup, "trackLen", DEFAULT_TRACK_LEN, 4, 16)?;
        let pawns_per_player =
            option_u64(setup, "pawnsPerPlayer", DEFAULT_PAWNS_PER_PLAYER, 1, 4)?;

        let mut tree = ElementTree::new("table", "game");
        let track = tree.add_child(tree.root(), "track", "board", None, Visibility::All);
        tree.set_attribute(track, "len", json!(track_len));

        // One rank per seat off a seeded shuffle; the only randomness in
        // the game, consumed entirely at setup.
        let mut ranks: Vec<u64> = (1..=13).collect();
        let mut rng = ChaCha20Rng::seed_from_u64(setup.seed);
        ranks.shuffle(&mut rng);

        for seat in 1..=players {
            for index in 0..pawns_per_player {
                let pawn = tree.add_child(track, format!("pawn-{seat}-{index}"), "pawn",
                    Some(seat), Visibility::All);
                tree.set_attribute(pawn, "pos", json!(0));
            }
            let hand = tree.add_child(tree.root(), format!("hand-{seat}"), "hand",
                Some(seat), Visibility::Owner);
            let card = tree.add_child(hand, format!("card-{seat}"), "card",
                Some(seat), Visibility::Owner);
            tree.set_attribute(card, "rank", json!(ranks[(seat - 1) as usize]));
        }

        Ok(Self {
            player_names: setup.player_names.clone(),
            state: PawnsState {
                tree,
                current: 1,
                complete: false,
                winner: None,
                next_event_id: 0,
                track_len,
            },
            events: Vec::new(),
        })
    }

    fn own_pawns(&self, seat: Seat) -> Vec<ElementId> {
        self.state
            .tree
            .iter()
            .filter(|el| el.kind == "pawn" && el.owner == Some(seat))
            .map(|el| el.id)
            .collect()
    }

    fn own_card(&self, seat: Seat) -> Option<ElementId> {
        self.state
            .tree
            .iter()
            .find(|el| el.kind == "card" && el.owner == Some(seat))
            .map(|el| el.id)
    }

    fn pawn_pos(&self, id: ElementId) -> Option<u64> {
        self.state.tree.attribute(id, "pos").and_then(Value::as_u64)
    }

    /// Squares a pawn may move to: one or two steps forward, on or off
    /// the track's end, not already holding another pawn of the same seat.
    fn destinations(&self, seat: Seat, piece: ElementId) -> Vec<u64> {
        let Some(pos) = self.pawn_pos(piece) else { return Vec::new() };
        let occupied: Vec<u64> = self
            .own_pawns(seat)
            .into_iter()
            .filter(|id| *id != piece)
            .filter_map(|id| self.pawn_pos(id))
            .collect();
        [pos + 1, pos + 2]
            .into_iter()
            .filter(|dest| *dest <= self.state.track_len)
            .filter(|dest| *dest == self.state.track_len || !occupied.contains(dest))
            .collect()
    }

    fn require_own_pawn(&self, seat: Seat, args: &ActionArgs, key: &str)
        -> Result<ElementId, EngineError> {
        let piece = args
            .get(key)
            .and_then(|v| v.as_element())
            .ok_or_else(|| EngineError::InvalidArgs(format!("missing element arg `{key}`")))?;
        let element = self
            .state
            .tree
            .get(piece)
            .ok_or_else(|| EngineError::DanglingRef(format!("element id {piece}")))?;
        if element.kind != "pawn" || element.owner != Some(seat) {
            return Err(EngineError::IllegalAction(format!(
                "element {piece} is not a pawn owned by seat {seat}"
            )));
        }
        Ok(piece)
    }

    fn emit(&mut self, name: &str, data: Value) {
        let id = self.state.next_event_id;
        self.state.next_event_id += 1;
        self.events.push(AnimationEvent { id, name: name.to_string(), data });
    }

    fn move_pawn(&mut self, seat: Seat, piece: ElementId, dest: u64)
        -> Result<(), EngineError> {
        let from = self
            .pawn_pos(piece)
            .ok_or_else(|| EngineError::CorruptSnapshot("pawn without pos".into()))?;
        if !self.destinations(seat, piece).contains(&dest) {
            return Err(EngineError::IllegalAction(format!(
                "square {dest} is not reachable from {from}"
            )));
        }
        self.state.tree.set_attribute(piece, "pos", json!(dest));
        self.emit("pawnMoved", json!({ "piece": piece, "from": from, "to": dest }));
        if dest >= self.state.track_len {
            self.state.complete = true;
            self.state.winner = Some(seat);
            self.emit("gameWon", json!({ "winner": seat }));
        }
        Ok(())
    }

    fn end_turn(&mut self) {
        if !self.state.complete {
            self.state.current = self.state.current % self.player_count() + 1;
        }
    }

    fn card_revealed(&self, seat: Seat) -> bool {
        self.own_card(seat)
            .and_then(|id| self.state.tree.get(id))
            .map(|el| el.visibility == Visibility::All)
            .unwrap_or(false)
    }
}

impl GameEngine for PawnsGame {
    fn game_type(&self) -> &str {
        GAME_TYPE
    }

    fn player_count(&self) -> u8 {
        self.player_names.len() as u8
    }

    fn player_names(&self) -> &[String] {
        &self.player_names
    }

    fn phase(&self) -> &str {
        if self.state.complete { "finished" } else { "playing" }
    }

    fn current_player(&self) -> Option<Seat> {
        if self.state.complete { None } else { Some(self.state.current) }
    }

    fn is_complete(&self) -> bool {
        self.state.complete
    }

    fn winners(&self) -> Vec<Seat> {
        self.state.winner.into_iter().collect()
    }

    fn available_actions(&self, seat: Seat) -> Vec<String> {
        if self.state.complete || seat != self.state.current {
            return Vec::new();
        }
        let mut actions = vec!["advance".to_string(), "move".to_string(), "noop".to_string()];
        if !self.card_revealed(seat) {
            actions.push("reveal".to_string());
        }
        actions
    }

    fn action_metadata(&self, action: &str) -> Option<ActionMetadata> {
        self.all_action_metadata().into_iter().find(|m| m.name == action)
    }

    fn all_action_metadata(&self) -> Vec<ActionMetadata> {
        vec![
            ActionMetadata { name: "noop".into(), prompt: None, selections: vec![] },
            ActionMetadata {
                name: "advance".into(),
                prompt: Some("Advance a pawn one square".into()),
                selections: vec![SelectionDef {
                    name: "piece".into(),
                    kind: SelectionKind::Element,
                    depends_on: vec![],
                    prompt: Some("Choose a pawn".into()),
                }],
            },
            ActionMetadata {
                name: "move".into(),
                prompt: Some("Move a pawn".into()),
                selections: vec![
                    SelectionDef {
                        name: "piece".into(),
                        kind: SelectionKind::Element,
                        depends_on: vec![],
                        prompt: Some("Choose a pawn".into()),
                    },
                    SelectionDef {
                        name: "destination".into(),
                        kind: SelectionKind::Choice,
                        depends_on: vec!["piece".into()],
                        prompt: Some("Choose a square".into()),
                    },
                ],
            },
            ActionMetadata { name: "reveal".into(), prompt: None, selections: vec![] },
        ]
    }

    fn selection_choices(
        &self,
        action: &str,
        selection: &str,
        seat: Seat,
        args: &ActionArgs,
    ) -> Result<SelectionChoices, EngineError> {
        match (action, selection) {
            ("advance", "piece") | ("move", "piece") => Ok(SelectionChoices {
                choices: vec![],
                valid_elements: self
                    .own_pawns(seat)
                    .into_iter()
                    .filter(|id| !self.destinations(seat, *id).is_empty())
                    .collect(),
                multi_select: Some(MultiSelectConfig { min: 1, max: 1 }),
            }),
            ("move", "destination") => {
                let piece = self.require_own_pawn(seat, args, "piece")?;
                Ok(SelectionChoices {
                    choices: self
                        .destinations(seat, piece)
                        .into_iter()
                        .map(|d| SerializedValue::Number(d.into()))
                        .collect(),
                    valid_elements: vec![],
                    multi_select: None,
                })
            }
            ("noop", _) | ("advance", _) | ("move", _) | ("reveal", _) => {
                Err(EngineError::UnknownSelection {
                    action: action.to_string(),
                    selection: selection.to_string(),
                })
            }
            _ => Err(EngineError::UnknownAction(action.to_string())),
        }
    }

    fn perform_action(&mut self, name: &str, seat: Seat, args: &ActionArgs)
        -> Result<(), EngineError> {
        if self.state.complete {
            return Err(EngineError::GameOver);
        }
        if seat != self.state.current {
            return Err(EngineError::NotYourTurn { expected: self.state.current, actual: seat });
        }

        // Validate fully before clearing the event buffer so a failed
        // action leaves both state and events untouched.
        match name {
            "noop" => {
                self.events.clear();
                self.end_turn();
                Ok(())
            }
            "advance" => {
                let piece = self.require_own_pawn(seat, args, "piece")?;
                let pos = self
                    .pawn_pos(piece)
                    .ok_or_else(|| EngineError::CorruptSnapshot("pawn without pos".into()))?;
                let dest = pos + 1;
                if !self.destinations(seat, piece).contains(&dest) {
                    return Err(EngineError::IllegalAction(format!(
                        "pawn {piece} cannot advance to {dest}"
                    )));
                }
                self.events.clear();
                self.move_pawn(seat, piece, dest)?;
                self.end_turn();
                Ok(())
            }
            "move" => {
                let piece = self.require_own_pawn(seat, args, "piece")?;
                let dest = args
                    .get("destination")
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| {
                        EngineError::InvalidArgs("missing numeric arg `destination`".into())
                    })?;
                if !self.destinations(seat, piece).contains(&dest) {
                    return Err(EngineError::IllegalAction(format!(
                        "square {dest} is not reachable for pawn {piece}"
                    )));
                }
                self.events.clear();
                self.move_pawn(seat, piece, dest)?;
                self.end_turn();
                Ok(())
            }
            "reveal" => {
                if self.card_revealed(seat) {
                    return Err(EngineError::IllegalAction("card already revealed".into()));
                }
                let card = self
                    .own_card(seat)
                    .ok_or_else(|| EngineError::CorruptSnapshot("seat without card".into()))?;
                self.events.clear();
                if let Some(el) = self.state.tree.get_mut(card) {
                    el.visibility = Visibility::All;
                }
                if let Some(hand) = self.state.tree.get(card).and_then(|c| c.parent) {
                    if let Some(el) = self.state.tree.get_mut(hand) {
                        el.visibility = Visibility::All;
                    }
                }
                self.emit("cardRevealed", json!({ "seat": seat }));
                // Revealing does not end the turn.
                Ok(())
            }
            other => Err(EngineError::UnknownAction(other.to_string())),
        }
    }

    fn animation_events(&self) -> &[AnimationEvent] {
        &self.events
    }

    fn tree(&self) -> &ElementTree {
        &self.state.tree
    }

    fn state_blob(&self) -> Result<Value, EngineError> {
        serde_json::to_value(&self.state)
            .map_err(|err| EngineError::CorruptSnapshot(err.to_string()))
    }

    fn restore(&mut self, blob: &Value) -> Result<(), EngineError> {
        let state: PawnsState = serde_json::from_value(blob.clone())
            .map_err(|err| EngineError::CorruptSnapshot(err.to_string()))?;
        self.state = state;
        self.events.clear();
        Ok(())
    }
}

fn option_u64(setup: &GameSetup, key: &str, default: u64, min: u64, max: u64)
    -> Result<u64, EngineError> {
    match setup.game_options.get(key) {
        None => Ok(default),
        Some(value) => {
            let n = value.as_u64().ok_or_else(|| {
                EngineError::InvalidArgs(format!("option `{key}` must be a number"))
            })?;
            if (min..=max).contains(&n) {
                Ok(n)
            } else {
                Err(EngineError::InvalidArgs(format!(
                    "option `{key}` must be between {min} and {max}"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::GameValue;

    fn game() -> PawnsGame {
        PawnsGame::new(&GameSetup::new(42, vec!["A".into(), "B".into()])).expect("create")
    }

    fn first_pawn(game: &PawnsGame, seat: Seat) -> ElementId {
        game.own_pawns(seat)[0]
    }

    fn args_piece(piece: ElementId) -> ActionArgs {
        let mut args = ActionArgs::new();
        args.insert("piece".into(), GameValue::Element(piece));
        args
    }

    #[test]
    fn setup_is_deterministic_by_seed() {
        let a = game();
        let b = game();
        assert_eq!(json!(a.tree()), json!(b.tree()));

        let rank = |g: &PawnsGame, seat: Seat| {
            let card = g.own_card(seat).unwrap();
            g.state.tree.attribute(card, "rank").cloned()
        };
        assert_eq!(rank(&a, 1), rank(&b, 1));
        assert_eq!(rank(&a, 2), rank(&b, 2));
    }

    #[test]
    fn turn_order_enforced() {
        let mut g = game();
        let err = g.perform_action("noop", 2, &ActionArgs::new()).unwrap_err();
        assert_eq!(err, EngineError::NotYourTurn { expected: 1, actual: 2 });

        g.perform_action("noop", 1, &ActionArgs::new()).unwrap();
        assert_eq!(g.current_player(), Some(2));
    }

    #[test]
    fn advance_moves_one_square_and_emits_event() {
        let mut g = game();
        let pawn = first_pawn(&g, 1);
        g.perform_action("advance", 1, &args_piece(pawn)).unwrap();

        assert_eq!(g.pawn_pos(pawn), Some(1));
        let events = g.animation_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "pawnMoved");
        assert_eq!(events[0].data["to"], json!(1));
    }

    #[test]
    fn event_buffer_clears_on_next_action() {
        let mut g = game();
        let pawn = first_pawn(&g, 1);
        g.perform_action("advance", 1, &args_piece(pawn)).unwrap();
        assert_eq!(g.animation_events().len(), 1);

        g.perform_action("noop", 2, &ActionArgs::new()).unwrap();
        assert!(g.animation_events().is_empty());
    }

    #[test]
    fn failed_action_preserves_events_and_state() {
        let mut g = game();
        let pawn = first_pawn(&g, 1);
        g.perform_action("advance", 1, &args_piece(pawn)).unwrap();
        let before = json!(g.tree());

        // Seat 2 tries to move seat 1's pawn.
        let err = g.perform_action("advance", 2, &args_piece(pawn)).unwrap_err();
        assert!(matches!(err, EngineError::IllegalAction(_)));
        assert_eq!(json!(g.tree()), before);
        assert_eq!(g.animation_events().len(), 1);
    }

    #[test]
    fn move_destinations_depend_on_piece() {
        let g = game();
        let pawn = first_pawn(&g, 1);

        let choices = g
            .selection_choices("move", "destination", 1, &args_piece(pawn))
            .unwrap();
        assert_eq!(
            choices.choices,
            vec![SerializedValue::Number(1.into()), SerializedValue::Number(2.into())]
        );

        let pieces = g.selection_choices("move", "piece", 1, &ActionArgs::new()).unwrap();
        assert_eq!(pieces.valid_elements.len(), 2);
    }

    #[test]
    fn own_square_is_not_a_destination() {
        let mut g = game();
        let pawns = g.own_pawns(1);
        let mut args = args_piece(pawns[0]);
        args.insert("destination".into(), GameValue::Json(json!(2)));
        g.perform_action("move", 1, &args).unwrap();
        g.perform_action("noop", 2, &ActionArgs::new()).unwrap();

        // Second pawn may not land on square 2, which is occupied.
        let dests = g.destinations(1, pawns[1]);
        assert_eq!(dests, vec![1]);
    }

    #[test]
    fn winning_pawn_finishes_the_game() {
        let mut g = game();
        let pawn = first_pawn(&g, 1);
        // Alternate: seat 1 races the same pawn two squares per turn.
        loop {
            let pos = g.pawn_pos(pawn).unwrap();
            let dest = (pos + 2).min(g.state.track_len);
            let mut args = args_piece(pawn);
            args.insert("destination".into(), GameValue::Json(json!(dest)));
            g.perform_action("move", 1, &args).unwrap();
            if g.is_complete() {
                break;
            }
            g.perform_action("noop", 2, &ActionArgs::new()).unwrap();
        }
        assert_eq!(g.winners(), vec![1]);
        assert_eq!(g.phase(), "finished");
        assert_eq!(g.current_player(), None);
        assert_eq!(g.perform_action("noop", 2, &ActionArgs::new()), Err(EngineError::GameOver));
    }

    #[test]
    fn reveal_keeps_the_turn_and_flips_visibility() {
        let mut g = game();
        assert!(!g.card_revealed(1));
        g.perform_action("reveal", 1, &ActionArgs::new()).unwrap();
        assert!(g.card_revealed(1));
        assert_eq!(g.current_player(), Some(1));

        let err = g.perform_action("reveal", 1, &ActionArgs::new()).unwrap_err();
        assert!(matches!(err, EngineError::IllegalAction(_)));
    }

    #[test]
    fn state_blob_round_trips() {
        let mut g = game();
        let pawn = first_pawn(&g, 1);
        g.perform_action("advance", 1, &args_piece(pawn)).unwrap();

        let blob = g.state_blob().unwrap();
        let mut fresh = game();
        fresh.restore(&blob).unwrap();
        assert_eq!(json!(fresh.tree()), json!(g.tree()));
        assert_eq!(fresh.current_player(), g.current_player());
        assert!(fresh.animation_events().is_empty());
    }

    #[test]
    fn replaying_a_log_reproduces_state() {
        let mut a = game();
        let mut b = game();
        let pawn = first_pawn(&a, 1);

        let script: Vec<(&str, Seat, ActionArgs)> = vec![
            ("reveal", 1, ActionArgs::new()),
            ("advance", 1, args_piece(pawn)),
            ("noop", 2, ActionArgs::new()),
            ("advance", 1, args_piece(pawn)),
        ];
        for (name, seat, args) in &script {
            a.perform_action(name, *seat, args).unwrap();
        }
        for (name, seat, args) in &script {
            b.perform_action(name, *seat, args).unwrap();
        }
        assert_eq!(json!(a.tree()), json!(b.tree()));
        assert_eq!(a.state.next_event_id, b.state.next_event_id);
    }

    #[test]
    fn rejects_bad_player_counts_and_options() {
        assert!(PawnsGame::new(&GameSetup::new(1, vec!["solo".into()])).is_err());

        let mut setup = GameSetup::new(1, vec!["A".into(), "B".into()]);
        setup.game_options.insert("trackLen".into(), json!(100));
        assert!(PawnsGame::new(&setup).is_err());

        setup.game_options.insert("trackLen".into(), json!("long"));
        assert!(PawnsGame::new(&setup).is_err());
    }
}
