//! # gametable-ai: bot contract for the game server
//!
//! AI controllers run as background tasks owned by a game session, so a
//! bot must be promptly cancelable: [`Bot::choose_action`] receives a
//! cancel flag and is required to poll it between iterations of its
//! internal search. Budgets map from a difficulty level to an iteration
//! count plus a wall-clock cap; on cap expiry a bot returns its
//! best-so-far move rather than nothing.
//!
//! ## Core Components
//!
//! - [`Bot`] - Trait defining the interface for AI decision-making
//! - [`ThinkBudget`] / [`AiLevel`] - iteration and wall-clock bounds
//! - [`baseline`] - Seeded baseline bot used as the default opponent
//! - [`create_bot`] - Factory function for creating bots by name
//! - [`fallback_action`] - Deterministic legal move for timeouts

use std::sync::atomic::AtomicBool;
use std::time::Duration;

use gametable_engine::{
    ActionArgs, GameEngine, Seat, SelectionChoices, SerializeOpts, SerializedAction,
    SerializedValue,
};

pub mod baseline;

pub use baseline::BaselineBot;

/// Hard cap on concrete candidate actions enumerated per turn. Keeps the
/// expansion of dependent selections from going combinatorial.
const MAX_CANDIDATES: usize = 32;

/// Decision-making interface for AI-controlled seats.
///
/// `game` is a throwaway instance rebuilt from a snapshot; the bot may
/// inspect it freely but never mutates the live session state. The chosen
/// action is committed by the session through its own mutation lane.
pub trait Bot: Send + Sync {
    /// Pick an action for `seat`, or `None` when canceled before a
    /// decision was reached. Implementations must check `cancel` at
    /// least once per internal iteration.
    fn choose_action(
        &self,
        game: &dyn GameEngine,
        history: &[SerializedAction],
        seat: Seat,
        budget: &ThinkBudget,
        cancel: &AtomicBool,
    ) -> Option<SerializedAction>;

    fn name(&self) -> &str;
}

/// Difficulty levels understood by the lobby's `aiLevel` field. A raw
/// integer is accepted as a custom iteration count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AiLevel {
    Easy,
    Medium,
    Hard,
    Expert,
    Iterations(u64),
}

impl AiLevel {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "easy" => Some(AiLevel::Easy),
            "medium" => Some(AiLevel::Medium),
            "hard" => Some(AiLevel::Hard),
            "expert" => Some(AiLevel::Expert),
            other => other.parse::<u64>().ok().map(AiLevel::Iterations),
        }
    }

    pub fn iterations(&self) -> u64 {
        match self {
            AiLevel::Easy => 100,
            AiLevel::Medium => 1_000,
            AiLevel::Hard => 10_000,
            AiLevel::Expert => 100_000,
            AiLevel::Iterations(n) => *n,
        }
    }
}

/// Iteration and wall-clock bounds for one think.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThinkBudget {
    pub iterations: u64,
    pub wall_clock: Duration,
}

impl ThinkBudget {
    pub fn new(level: &AiLevel, wall_clock: Duration) -> Self {
        Self { iterations: level.iterations(), wall_clock }
    }
}

/// Factory for bots by name. Unknown names degrade to the baseline bot.
pub fn create_bot(name: &str) -> Box<dyn Bot> {
    match name {
        "baseline" | "" => Box::new(BaselineBot::new()),
        _ => Box::new(BaselineBot::new()),
    }
}

/// Enumerate concrete legal actions for `seat`: every available action,
/// with dependent selections expanded breadth-first up to
/// [`MAX_CANDIDATES`]. Ordering is deterministic (engine ordering).
pub fn enumerate_candidates(game: &dyn GameEngine, seat: Seat) -> Vec<SerializedAction> {
    let mut candidates = Vec::new();
    for name in game.available_actions(seat) {
        let Some(meta) = game.action_metadata(&name) else { continue };
        let mut partial: Vec<ActionArgs> = vec![ActionArgs::new()];
        let mut dead_end = false;
        for selection in &meta.selections {
            let mut expanded = Vec::new();
            for args in &partial {
                let Ok(choices) = game.selection_choices(&name, &selection.name, seat, args)
                else {
                    continue;
                };
                for value in selection_values(&choices) {
                    if let Ok(resolved) = value.resolve(game.tree(), game.player_count()) {
                        let mut next = args.clone();
                        next.insert(selection.name.clone(), resolved);
                        expanded.push(next);
                        if expanded.len() >= MAX_CANDIDATES {
                            break;
                        }
                    }
                }
                if expanded.len() >= MAX_CANDIDATES {
                    break;
                }
            }
            if expanded.is_empty() {
                dead_end = true;
                break;
            }
            partial = expanded;
        }
        if dead_end {
            continue;
        }
        for args in partial {
            candidates.push(gametable_engine::serialize_action(
                &name,
                seat,
                &args,
                game.tree(),
                0,
                SerializeOpts::default(),
            ));
            if candidates.len() >= MAX_CANDIDATES {
                return candidates;
            }
        }
    }
    candidates
}

fn selection_values(choices: &SelectionChoices) -> Vec<SerializedValue> {
    let mut values = choices.choices.clone();
    values.extend(choices.valid_elements.iter().map(|id| SerializedValue::ElementId(*id)));
    values
}

/// Any legal action for `seat`, deterministic by seed. Used when a think
/// times out or a bot fails.
pub fn fallback_action(game: &dyn GameEngine, seat: Seat, seed: u64)
    -> Option<SerializedAction> {
    let mut candidates = enumerate_candidates(game, seat);
    if candidates.is_empty() {
        return None;
    }
    candidates.sort_by_key(|c| format!("{c:?}"));
    let index = (seed as usize) % candidates.len();
    Some(candidates.swap_remove(index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gametable_engine::games::pawns::PawnsFactory;
    use gametable_engine::{GameFactory, GameSetup};

    fn game() -> Box<dyn GameEngine> {
        PawnsFactory
            .create(&GameSetup::new(11, vec!["A".into(), "B".into()]))
            .expect("create game")
    }

    #[test]
    fn level_table_matches_contract() {
        assert_eq!(AiLevel::parse("easy").unwrap().iterations(), 100);
        assert_eq!(AiLevel::parse("medium").unwrap().iterations(), 1_000);
        assert_eq!(AiLevel::parse("hard").unwrap().iterations(), 10_000);
        assert_eq!(AiLevel::parse("expert").unwrap().iterations(), 100_000);
        assert_eq!(AiLevel::parse("250").unwrap().iterations(), 250);
        assert!(AiLevel::parse("impossible").is_none());
    }

    #[test]
    fn candidates_cover_dependent_selections() {
        let g = game();
        let candidates = enumerate_candidates(g.as_ref(), 1);

        assert!(candidates.iter().any(|c| c.name == "noop"));
        assert!(candidates.iter().any(|c| c.name == "reveal"));
        // `move` expands into piece x destination combinations.
        let moves: Vec<_> = candidates.iter().filter(|c| c.name == "move").collect();
        assert!(moves.len() >= 2);
        assert!(moves.iter().all(|c| c.args.contains_key("piece")
            && c.args.contains_key("destination")));
    }

    #[test]
    fn no_candidates_when_not_your_turn() {
        let g = game();
        assert!(enumerate_candidates(g.as_ref(), 2).is_empty());
    }

    #[test]
    fn fallback_is_deterministic_by_seed() {
        let g = game();
        let a = fallback_action(g.as_ref(), 1, 7).expect("fallback");
        let b = fallback_action(g.as_ref(), 1, 7).expect("fallback");
        assert_eq!(a, b);
    }

    #[test]
    fn bot_trait_object_is_send_sync() {
        fn assert_send_sync<T: Send + Sync + ?Sized>() {}
        assert_send_sync::<Box<dyn Bot>>();
    }
}
