use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use gametable_engine::{
    ActionArgs, GameEngine, Seat, SelectionChoices, SelectionKind, SerializedValue,
};

use crate::errors::ApiError;

/// The selection a player must answer next, with its current choices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextSelection {
    pub name: String,
    pub kind: SelectionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    pub choices: SelectionChoices,
}

/// Server-side composition state for one multi-step action. Exists only
/// while a player is mid-composition; the engine sees nothing until the
/// final step commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingState {
    pub action_name: String,
    pub player_seat: Seat,
    pub partial_args: BTreeMap<String, SerializedValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_selection: Option<NextSelection>,
    #[serde(skip)]
    pub expires_at: Option<Instant>,
}

/// Outcome of one selection step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepResult {
    /// More selections remain; the updated pending state carries the
    /// next one's choices.
    Next(PendingState),
    /// All selections are resolved. The caller commits these args to the
    /// engine; the pending entry is already gone.
    Complete { action_name: String, args: BTreeMap<String, SerializedValue> },
}

/// Holds multi-step action composition per player: at most one pending
/// action per seat, replaced by a new `start`.
#[derive(Debug, Default)]
pub struct PendingActionManager {
    by_seat: HashMap<Seat, PendingState>,
    ttl: Option<Duration>,
}

impl PendingActionManager {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self { by_seat: HashMap::new(), ttl }
    }

    /// Whether an action needs the step-by-step flow (it has at least one
    /// selection whose choices depend on an earlier selection).
    pub fn has_repeating_selections(
        game: &dyn GameEngine,
        action: &str,
    ) -> Result<bool, ApiError> {
        let meta = game
            .action_metadata(action)
            .ok_or_else(|| ApiError::not_found(format!("unknown action `{action}`")))?;
        Ok(meta.has_repeating_selections())
    }

    /// Begin composing `action` for `seat`. Replaces any existing pending
    /// action for that seat.
    pub fn start(
        &mut self,
        game: &dyn GameEngine,
        action: &str,
        seat: Seat,
        initial_args: BTreeMap<String, SerializedValue>,
    ) -> Result<PendingState, ApiError> {
        let meta = game
            .action_metadata(action)
            .ok_or_else(|| ApiError::not_found(format!("unknown action `{action}`")))?;
        if meta.selections.is_empty() {
            return Err(ApiError::invalid_args(format!(
                "action `{action}` has no selections; perform it directly"
            )));
        }
        if !game.available_actions(seat).contains(&action.to_string()) {
            return Err(ApiError::illegal_action(format!(
                "action `{action}` is not available to seat {seat}"
            )));
        }

        let mut state = PendingState {
            action_name: action.to_string(),
            player_seat: seat,
            partial_args: initial_args,
            next_selection: None,
            expires_at: self.ttl.map(|ttl| Instant::now() + ttl),
        };
        state.next_selection = compute_next(game, &state)?;
        if state.next_selection.is_none() {
            return Err(ApiError::invalid_args(format!(
                "initial args already satisfy every selection of `{action}`"
            )));
        }
        self.by_seat.insert(seat, state.clone());
        Ok(state)
    }

    /// Validate one selection value and advance the composition. When the
    /// last selection resolves, the pending entry is removed and the full
    /// argument set is returned for the caller to commit.
    pub fn process_step(
        &mut self,
        game: &dyn GameEngine,
        seat: Seat,
        selection_name: &str,
        value: SerializedValue,
        action_name: Option<&str>,
        initial_args: Option<BTreeMap<String, SerializedValue>>,
    ) -> Result<StepResult, ApiError> {
        if !self.by_seat.contains_key(&seat) {
            match action_name {
                Some(action) => {
                    self.start(game, action, seat, initial_args.unwrap_or_default())?;
                }
                None => {
                    return Err(ApiError::not_found(format!(
                        "seat {seat} has no pending action"
                    )))
                }
            }
        }

        let mut state = self
            .by_seat
            .get(&seat)
            .cloned()
            .ok_or_else(|| ApiError::internal("pending state vanished mid-step"))?;
        let next = state.next_selection.clone().ok_or_else(|| {
            ApiError::invalid_step("pending action has no selection to answer")
        })?;
        if next.name != selection_name {
            return Err(ApiError::invalid_step(format!(
                "expected selection `{}`, got `{selection_name}`",
                next.name
            )));
        }
        if !next.choices.contains(&value) {
            return Err(ApiError::invalid_args(format!(
                "value is not among the current choices for `{selection_name}`"
            )));
        }

        state.partial_args.insert(selection_name.to_string(), value);
        state.next_selection = compute_next(game, &state)?;

        match &state.next_selection {
            None => {
                self.by_seat.remove(&seat);
                Ok(StepResult::Complete {
                    action_name: state.action_name,
                    args: state.partial_args,
                })
            }
            Some(next) if next.choices.is_empty() => {
                // Dead end: the earlier picks left nothing legal.
                self.by_seat.remove(&seat);
                Err(ApiError::illegal_action(format!(
                    "no legal choices remain for `{}`",
                    next.name
                )))
            }
            Some(_) => {
                self.by_seat.insert(seat, state.clone());
                Ok(StepResult::Next(state))
            }
        }
    }

    pub fn cancel(&mut self, seat: Seat) -> bool {
        self.by_seat.remove(&seat).is_some()
    }

    pub fn get(&self, seat: Seat) -> Option<&PendingState> {
        self.by_seat.get(&seat)
    }

    /// Drop pendings past their TTL. Returns the seats that were swept.
    pub fn sweep_expired(&mut self) -> Vec<Seat> {
        let now = Instant::now();
        let expired: Vec<Seat> = self
            .by_seat
            .iter()
            .filter(|(_, state)| state.expires_at.map(|t| t <= now).unwrap_or(false))
            .map(|(seat, _)| *seat)
            .collect();
        for seat in &expired {
            self.by_seat.remove(seat);
        }
        expired
    }
}

/// First selection of the action not yet present in the partial args,
/// with its choices computed against the current game state.
fn compute_next(
    game: &dyn GameEngine,
    state: &PendingState,
) -> Result<Option<NextSelection>, ApiError> {
    let meta = game
        .action_metadata(&state.action_name)
        .ok_or_else(|| ApiError::not_found(format!("unknown action `{}`", state.action_name)))?;
    let resolved = resolve_args(game, &state.partial_args)?;
    for selection in &meta.selections {
        if state.partial_args.contains_key(&selection.name) {
            continue;
        }
        let choices =
            game.selection_choices(&state.action_name, &selection.name, state.player_seat, &resolved)?;
        return Ok(Some(NextSelection {
            name: selection.name.clone(),
            kind: selection.kind,
            prompt: selection.prompt.clone(),
            choices,
        }));
    }
    Ok(None)
}

/// Resolve a wire argument map against the live game.
pub fn resolve_args(
    game: &dyn GameEngine,
    args: &BTreeMap<String, SerializedValue>,
) -> Result<ActionArgs, ApiError> {
    let mut resolved = ActionArgs::new();
    for (key, value) in args {
        resolved.insert(key.clone(), value.resolve(game.tree(), game.player_count())?);
    }
    Ok(resolved)
}
