use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use gametable_engine::{
    create_player_view, deserialize_action, AnimationEvent, ActionMetadata, GameEngine, PlayerView,
    Seat, SerializedAction, SerializedValue,
};

use crate::ai_controller::AiController;
use crate::broadcast::{ConnectionId, ConnectionTable, MessageSender, ServerMessage};
use crate::checkpoint::CheckpointManager;
use crate::errors::ApiError;
use crate::lobby::{Lobby, PlayerConfig};
use crate::pending::{resolve_args, NextSelection, PendingActionManager, PendingState, StepResult};
use crate::registry::{GameDefinition, GameRegistry};
use crate::settings::ServerSettings;
use crate::store::{GameRecord, StorageBackend, StoredGame};

/// Options accepted by `POST /games`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGameOptions {
    pub game_type: String,
    pub player_count: u8,
    #[serde(default)]
    pub player_names: Option<Vec<String>>,
    #[serde(default)]
    pub player_ids: Option<Vec<String>>,
    #[serde(default)]
    pub seed: Option<u64>,
    /// Seats controlled by AI, with `ai_level` applying to all of them.
    #[serde(default)]
    pub ai_players: Option<Vec<Seat>>,
    #[serde(default)]
    pub ai_level: Option<String>,
    #[serde(default)]
    pub game_options: Option<Map<String, Value>>,
    #[serde(default)]
    pub player_configs: Option<Vec<PlayerConfig>>,
    #[serde(default)]
    pub use_lobby: Option<bool>,
    #[serde(default)]
    pub creator_id: Option<String>,
}

/// One seat in the broadcast player list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerInfo {
    pub seat: Seat,
    pub name: String,
    pub is_ai: bool,
    pub connected: bool,
}

/// Coarse game progress, included in every state payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowState {
    pub phase: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_player: Option<Seat>,
    pub is_complete: bool,
}

/// Per-seat filtered state, broadcast after every successful mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerGameState {
    pub phase: String,
    pub players: Vec<PlayerInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_player: Option<Seat>,
    pub available_actions: Vec<String>,
    pub is_my_turn: bool,
    pub view: PlayerView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub animation_events: Option<Vec<AnimationEvent>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_animation_event_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_metadata: Option<Vec<ActionMetadata>>,
    pub can_undo: bool,
    pub actions_this_turn: usize,
    pub turn_start_action_index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_debug: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color_selection_enabled: Option<bool>,
}

/// Body of `GET /games/{id}` and of every `state` push.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<PlayerGameState>,
    pub flow_state: FlowState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lobby: Option<Lobby>,
}

/// Result of a successful mutating call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<PlayerGameState>,
    pub flow_state: FlowState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub action_history: Vec<SerializedAction>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewindResponse {
    pub actions_discarded: usize,
}

/// Result of one selection step (§ pending actions): either the next
/// selection to answer, or the committed action's outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResponse {
    pub done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_choices: Option<NextSelection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_complete: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_result: Option<ActionResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingState>,
}

struct SessionInner {
    record: GameRecord,
    /// Present once the game has started; `None` while the lobby holds.
    game: Option<Box<dyn GameEngine>>,
    history: Vec<SerializedAction>,
    lobby: Option<Lobby>,
    connections: ConnectionTable,
    pending: PendingActionManager,
    checkpoints: CheckpointManager,
    player_ids: BTreeMap<Seat, String>,
    /// Timestamp base carried across recovery so action timestamps stay
    /// monotonic over process restarts.
    ts_base: u64,
    /// Bumped on every committed mutation; AI thinks are discarded when
    /// it moved under them.
    mutation_count: u64,
    color_selection_enabled: bool,
}

/// One live game: engine instance, action log, lobby, connections, and
/// the single-writer mutation lane (the `inner` mutex; waiters are
/// served FIFO, so request order is commit order is broadcast order).
pub struct GameSession {
    game_id: String,
    registry: Arc<GameRegistry>,
    settings: Arc<ServerSettings>,
    backend: Arc<dyn StorageBackend>,
    inner: Mutex<SessionInner>,
    ai: AiController,
    started: Instant,
    last_activity: std::sync::Mutex<Instant>,
    self_ref: OnceLock<Weak<GameSession>>,
}

impl std::fmt::Debug for GameSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GameSession").field("game_id", &self.game_id).finish()
    }
}

impl GameSession {
    /// Create a session from `POST /games` options, persisting the
    /// initial record before it becomes visible.
    pub fn create(
        game_id: impl Into<String>,
        options: CreateGameOptions,
        registry: Arc<GameRegistry>,
        settings: Arc<ServerSettings>,
        backend: Arc<dyn StorageBackend>,
    ) -> Result<Arc<Self>, ApiError> {
        let game_id = game_id.into();
        let def = registry.require(&options.game_type)?;
        def.validate_player_count(options.player_count)?;
        let game_options = options.game_options.clone().unwrap_or_default();
        def.validate_game_options(&game_options)?;

        let seed = options
            .seed
            .unwrap_or_else(|| uuid::Uuid::new_v4().as_u128() as u64);
        let player_names = named_players(&options);
        let ai_players = ai_assignments(&options)?;
        let use_lobby = options.use_lobby.unwrap_or(false);

        let record = GameRecord {
            game_id: game_id.clone(),
            game_type: options.game_type.clone(),
            seed,
            player_count: options.player_count,
            created_at: chrono::Utc::now().to_rfc3339(),
            last_activity_ms: chrono::Utc::now().timestamp_millis(),
            game_options: game_options.clone(),
            player_names,
            player_options: vec![Map::new(); options.player_count as usize],
            ai_players,
            use_lobby,
            creator_id: options.creator_id.clone(),
        };

        let (game, lobby) = if use_lobby {
            let lobby = Lobby::new(
                &def,
                options.player_count,
                options.creator_id.clone(),
                options.player_configs.as_deref().unwrap_or(&[]),
                game_options,
            )?;
            (None, Some(lobby))
        } else {
            let engine = def.factory.create(&record.setup())?;
            (Some(engine), None)
        };

        let mut player_ids = BTreeMap::new();
        if let Some(ids) = &options.player_ids {
            for (index, player_id) in ids.iter().enumerate() {
                if !player_id.is_empty() {
                    player_ids.insert((index + 1) as Seat, player_id.clone());
                }
            }
        }

        backend.save_record(&record).map_err(ApiError::from)?;
        backend
            .save_lobby(&game_id, lobby.as_ref())
            .map_err(ApiError::from)?;
        let id_pairs: Vec<(Seat, String)> =
            player_ids.iter().map(|(s, p)| (*s, p.clone())).collect();
        backend
            .save_player_ids(&game_id, &id_pairs)
            .map_err(ApiError::from)?;

        tracing::info!(
            game_id = %game_id,
            game_type = %record.game_type,
            player_count = record.player_count,
            use_lobby,
            "created game session"
        );

        Ok(Self::assemble(game_id, record, game, lobby, Vec::new(), player_ids, 0, registry, settings, backend, &def))
    }

    /// Rebuild a session from storage by replaying its action log.
    pub fn recover(
        stored: StoredGame,
        registry: Arc<GameRegistry>,
        settings: Arc<ServerSettings>,
        backend: Arc<dyn StorageBackend>,
    ) -> Result<Arc<Self>, ApiError> {
        let def = registry.require(&stored.record.game_type)?;
        let game = if stored.lobby.is_some() {
            None
        } else {
            let mut engine = def.factory.create(&stored.record.setup())?;
            for action in &stored.actions {
                let (name, seat, args) =
                    deserialize_action(action, engine.tree(), engine.player_count())
                        .map_err(|err| ApiError::internal(format!("replay failed: {err}")))?;
                engine
                    .perform_action(&name, seat, &args)
                    .map_err(|err| ApiError::internal(format!("replay failed: {err}")))?;
            }
            Some(engine)
        };

        let ts_base = stored.actions.last().map(|a| a.timestamp).unwrap_or(0);
        let player_ids: BTreeMap<Seat, String> = stored.player_ids.into_iter().collect();
        let game_id = stored.record.game_id.clone();
        Ok(Self::assemble(
            game_id,
            stored.record,
            game,
            stored.lobby,
            stored.actions,
            player_ids,
            ts_base,
            registry,
            settings,
            backend,
            &def,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        game_id: String,
        record: GameRecord,
        game: Option<Box<dyn GameEngine>>,
        lobby: Option<Lobby>,
        history: Vec<SerializedAction>,
        player_ids: BTreeMap<Seat, String>,
        ts_base: u64,
        registry: Arc<GameRegistry>,
        settings: Arc<ServerSettings>,
        backend: Arc<dyn StorageBackend>,
        def: &GameDefinition,
    ) -> Arc<Self> {
        let color_selection_enabled = def.player_options.contains_key("color");
        let inner = SessionInner {
            record,
            game,
            history,
            lobby,
            connections: ConnectionTable::new(),
            pending: PendingActionManager::new(Some(Duration::from_secs(
                settings.connection_idle_s.max(60),
            ))),
            checkpoints: CheckpointManager::new(
                settings.checkpoint_interval,
                settings.checkpoint_window,
            ),
            player_ids,
            ts_base,
            mutation_count: 0,
            color_selection_enabled,
        };
        let session = Arc::new(Self {
            game_id,
            registry,
            settings,
            backend,
            inner: Mutex::new(inner),
            ai: AiController::new(),
            started: Instant::now(),
            last_activity: std::sync::Mutex::new(Instant::now()),
            self_ref: OnceLock::new(),
        });
        let _ = session.self_ref.set(Arc::downgrade(&session));
        session.kick_ai();
        session
    }

    pub fn game_id(&self) -> &str {
        &self.game_id
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Time since the last seated activity. Spectator traffic does not
    /// count.
    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .map(|at| at.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    fn touch(&self) {
        if let Ok(mut at) = self.last_activity.lock() {
            *at = Instant::now();
        }
    }

    fn now_ms(&self, inner: &SessionInner) -> u64 {
        inner.ts_base + self.started.elapsed().as_millis() as u64
    }

    fn kick_ai(&self) {
        if let Some(session) = self.self_ref.get().and_then(Weak::upgrade) {
            self.ai.reevaluate(&session);
        }
    }

    // ---- reads ------------------------------------------------------

    pub async fn get_state(&self, seat: Option<Seat>) -> StateResponse {
        let inner = self.inner.lock().await;
        if seat.is_some() {
            self.touch();
        }
        state_response(&inner, seat)
    }

    pub async fn get_lobby(&self) -> Result<Lobby, ApiError> {
        let inner = self.inner.lock().await;
        inner
            .lobby
            .clone()
            .ok_or_else(|| ApiError::not_found("game has no lobby"))
    }

    pub async fn get_history(&self) -> HistoryResponse {
        let inner = self.inner.lock().await;
        HistoryResponse {
            action_history: inner.history.clone(),
            created_at: inner.record.created_at.clone(),
        }
    }

    /// Read-only time travel: state as it was before action `idx` was
    /// applied (0 is the initial state). Rebuilt into a throwaway engine
    /// from the nearest checkpoint, never touching the live one.
    pub async fn get_state_at_action(
        &self,
        idx: usize,
        seat: Option<Seat>,
    ) -> Result<StateResponse, ApiError> {
        let inner = self.inner.lock().await;
        if idx >= inner.history.len() {
            return Err(ApiError::out_of_range(format!(
                "index {idx} is outside history of length {}",
                inner.history.len()
            )));
        }
        let throwaway = self.rebuild_engine(&inner, idx)?;
        let flow = flow_of(throwaway.as_ref());
        Ok(StateResponse {
            state: Some(build_player_state(&inner, throwaway.as_ref(), seat, &inner.history[..idx])),
            flow_state: flow,
            lobby: None,
        })
    }

    /// Shallow structural diff between the views at two indices.
    pub async fn get_state_diff(
        &self,
        from: usize,
        to: usize,
        seat: Option<Seat>,
    ) -> Result<Value, ApiError> {
        let inner = self.inner.lock().await;
        if from > to {
            return Err(ApiError::out_of_range(format!("from {from} exceeds to {to}")));
        }
        let before = self.rebuild_engine(&inner, from)?;
        let after = self.rebuild_engine(&inner, to)?;
        let a = serde_json::to_value(create_player_view(before.as_ref(), seat))
            .map_err(|err| ApiError::internal(err.to_string()))?;
        let b = serde_json::to_value(create_player_view(after.as_ref(), seat))
            .map_err(|err| ApiError::internal(err.to_string()))?;
        Ok(serde_json::json!({ "from": from, "to": to, "diff": json_diff(&a, &b) }))
    }

    pub async fn get_pending(&self, seat: Seat) -> Option<PendingState> {
        let inner = self.inner.lock().await;
        inner.pending.get(seat).cloned()
    }

    pub async fn get_selection_choices(
        &self,
        action: &str,
        selection: &str,
        seat: Seat,
        args: BTreeMap<String, SerializedValue>,
    ) -> Result<gametable_engine::SelectionChoices, ApiError> {
        let inner = self.inner.lock().await;
        let game = require_game(&inner)?;
        let resolved = resolve_args(game, &args)?;
        Ok(game.selection_choices(action, selection, seat, &resolved)?)
    }

    // ---- mutations --------------------------------------------------

    /// The one-shot action path: concrete args, commit, persist,
    /// broadcast.
    pub async fn perform_action(
        &self,
        name: &str,
        seat: Seat,
        args: BTreeMap<String, SerializedValue>,
    ) -> Result<ActionResponse, ApiError> {
        let mut inner = self.inner.lock().await;
        self.touch();
        self.commit_action(&mut inner, name, seat, &args)?;
        let response = action_response(&inner, Some(seat));
        broadcast_state(&mut inner);
        drop(inner);
        self.kick_ai();
        Ok(response)
    }

    /// Shared commit path for human, pending-completion, and AI actions.
    /// On any failure the engine, history, and checkpoints are exactly as
    /// before and nothing was broadcast.
    fn commit_action(
        &self,
        inner: &mut SessionInner,
        name: &str,
        seat: Seat,
        args: &BTreeMap<String, SerializedValue>,
    ) -> Result<(), ApiError> {
        if inner.lobby.is_some() {
            return Err(ApiError::conflict("game has not started yet"));
        }
        let timestamp = self.now_ms(inner);
        let game = inner
            .game
            .as_mut()
            .ok_or_else(|| ApiError::conflict("game has not started yet"))?;
        if game.is_complete() {
            return Err(ApiError::game_over());
        }

        let resolved = {
            let mut out = gametable_engine::ActionArgs::new();
            for (key, value) in args {
                out.insert(key.clone(), value.resolve(game.tree(), game.player_count())?);
            }
            out
        };

        let rollback = game
            .state_blob()
            .map_err(|err| ApiError::internal(err.to_string()))?;
        game.perform_action(name, seat, &resolved)?;

        let action = SerializedAction {
            name: name.to_string(),
            player: seat,
            args: args.clone(),
            timestamp,
        };
        inner.history.push(action.clone());
        inner.record.last_activity_ms = chrono::Utc::now().timestamp_millis();

        let idx = (inner.history.len() - 1) as u64;
        if let Err(err) = self.backend.append_action(&inner.record, idx, &action) {
            // Storage failure: roll the engine back so the client sees a
            // clean rejection and nothing was half-persisted.
            tracing::error!(game_id = %self.game_id, error = %err, "persist failed, rolling back");
            inner.history.pop();
            if let Some(game) = inner.game.as_mut() {
                if let Err(restore_err) = game.restore(&rollback) {
                    tracing::error!(game_id = %self.game_id, error = %restore_err, "rollback restore failed");
                }
            }
            return Err(ApiError::internal(format!("storage failure: {err}")));
        }

        let history_len = inner.history.len();
        let SessionInner { game, checkpoints, .. } = &mut *inner;
        if let Some(engine) = game.as_ref() {
            checkpoints.maybe_capture(history_len, || engine.state_blob().ok());
        }
        inner.pending.cancel(seat);
        inner.mutation_count += 1;
        Ok(())
    }

    /// Commit a move chosen by the AI controller. Discarded when the
    /// game mutated after the think started.
    pub async fn commit_ai_action(
        &self,
        generation: u64,
        action: SerializedAction,
    ) -> Result<bool, ApiError> {
        let mut inner = self.inner.lock().await;
        if inner.mutation_count != generation {
            tracing::debug!(
                game_id = %self.game_id,
                seat = action.player,
                "discarding stale AI move"
            );
            return Ok(false);
        }
        self.commit_action(&mut inner, &action.name, action.player, &action.args)?;
        broadcast_state(&mut inner);
        drop(inner);
        self.kick_ai();
        Ok(true)
    }

    /// Rewind to the first action of `seat`'s current trailing turn.
    pub async fn undo_to_turn_start(&self, seat: Seat) -> Result<ActionResponse, ApiError> {
        let mut inner = self.inner.lock().await;
        self.touch();
        {
            let game = require_game(&inner)?;
            if game.is_complete() {
                return Err(ApiError::game_over());
            }
        }
        let run = trailing_run(&inner.history, seat);
        if run == 0 {
            return Err(ApiError::illegal_action("nothing to undo"));
        }
        let new_len = inner.history.len() - run;
        self.truncate_live(&mut inner, new_len)?;
        inner.pending.cancel(seat);
        let response = action_response(&inner, Some(seat));
        broadcast_state(&mut inner);
        drop(inner);
        self.kick_ai();
        Ok(response)
    }

    /// Debug-only rewind to an arbitrary point in the log.
    pub async fn rewind_to_action(&self, idx: usize) -> Result<RewindResponse, ApiError> {
        let mut inner = self.inner.lock().await;
        self.touch();
        require_game(&inner)?;
        if idx > inner.history.len() {
            return Err(ApiError::out_of_range(format!(
                "index {idx} exceeds history length {}",
                inner.history.len()
            )));
        }
        let discarded = inner.history.len() - idx;
        self.truncate_live(&mut inner, idx)?;
        broadcast_state(&mut inner);
        drop(inner);
        self.kick_ai();
        Ok(RewindResponse { actions_discarded: discarded })
    }

    /// Delete-and-recreate under the same id with a fresh seed. The
    /// action log starts over.
    pub async fn restart(&self) -> Result<ActionResponse, ApiError> {
        let mut inner = self.inner.lock().await;
        self.touch();
        if inner.lobby.is_some() {
            return Err(ApiError::conflict("game has not started yet"));
        }
        let def = self.registry.require(&inner.record.game_type)?;
        inner.record.seed = inner.record.seed.wrapping_add(1);
        inner.record.last_activity_ms = chrono::Utc::now().timestamp_millis();
        let engine = def.factory.create(&inner.record.setup())?;
        inner.game = Some(engine);
        inner.history.clear();
        inner.checkpoints.clear();
        inner.pending = PendingActionManager::new(Some(Duration::from_secs(
            self.settings.connection_idle_s.max(60),
        )));
        inner.mutation_count += 1;

        self.backend
            .truncate_actions(&self.game_id, 0)
            .map_err(ApiError::from)?;
        self.backend.save_record(&inner.record).map_err(ApiError::from)?;

        tracing::info!(game_id = %self.game_id, seed = inner.record.seed, "restarted game");

        let response = action_response(&inner, None);
        broadcast_restart(&mut inner);
        drop(inner);
        self.kick_ai();
        Ok(response)
    }

    // ---- pending actions --------------------------------------------

    pub async fn start_pending_action(
        &self,
        name: &str,
        seat: Seat,
    ) -> Result<PendingState, ApiError> {
        let mut inner = self.inner.lock().await;
        self.touch();
        let SessionInner { game, pending, lobby, .. } = &mut *inner;
        if lobby.is_some() {
            return Err(ApiError::conflict("game has not started yet"));
        }
        let game = game
            .as_deref()
            .ok_or_else(|| ApiError::conflict("game has not started yet"))?;
        if game.is_complete() {
            return Err(ApiError::game_over());
        }
        pending.start(game, name, seat, BTreeMap::new())
    }

    pub async fn process_selection_step(
        &self,
        seat: Seat,
        selection: &str,
        value: SerializedValue,
        action_name: Option<&str>,
        initial_args: Option<BTreeMap<String, SerializedValue>>,
    ) -> Result<StepResponse, ApiError> {
        let mut inner = self.inner.lock().await;
        self.touch();
        let step = {
            let SessionInner { game, pending, lobby, .. } = &mut *inner;
            if lobby.is_some() {
                return Err(ApiError::conflict("game has not started yet"));
            }
            let game = game
                .as_deref()
                .ok_or_else(|| ApiError::conflict("game has not started yet"))?;
            if game.is_complete() {
                return Err(ApiError::game_over());
            }
            pending.process_step(game, seat, selection, value, action_name, initial_args)?
        };

        match step {
            StepResult::Next(state) => Ok(StepResponse {
                done: false,
                next_choices: state.next_selection.clone(),
                action_complete: None,
                action_result: None,
                pending: Some(state),
            }),
            StepResult::Complete { action_name, args } => {
                // Client-visible effects happen only on this final commit.
                self.commit_action(&mut inner, &action_name, seat, &args)?;
                let result = action_response(&inner, Some(seat));
                broadcast_state(&mut inner);
                drop(inner);
                self.kick_ai();
                Ok(StepResponse {
                    done: true,
                    next_choices: None,
                    action_complete: Some(true),
                    action_result: Some(result),
                    pending: None,
                })
            }
        }
    }

    pub async fn cancel_pending_action(&self, seat: Seat) -> bool {
        let mut inner = self.inner.lock().await;
        inner.pending.cancel(seat)
    }

    // ---- lobby ------------------------------------------------------

    async fn with_lobby<T>(
        &self,
        f: impl FnOnce(&mut Lobby, &GameDefinition) -> Result<T, ApiError>,
    ) -> Result<T, ApiError> {
        let mut inner = self.inner.lock().await;
        self.touch();
        let def = self.registry.require(&inner.record.game_type)?;
        let lobby = inner
            .lobby
            .as_mut()
            .ok_or_else(|| ApiError::conflict("game has already started"))?;
        let out = f(lobby, &def)?;
        self.backend
            .save_lobby(&self.game_id, Some(lobby))
            .map_err(ApiError::from)?;
        broadcast_state(&mut inner);
        Ok(out)
    }

    pub async fn claim_seat(
        &self,
        seat: Seat,
        player_id: &str,
        name: &str,
    ) -> Result<Lobby, ApiError> {
        let lobby = self
            .with_lobby(|lobby, _| {
                lobby.claim_seat(seat, player_id, name)?;
                Ok(lobby.clone())
            })
            .await?;
        let mut inner = self.inner.lock().await;
        inner.player_ids.insert(seat, player_id.to_string());
        let pairs: Vec<(Seat, String)> =
            inner.player_ids.iter().map(|(s, p)| (*s, p.clone())).collect();
        self.backend
            .save_player_ids(&self.game_id, &pairs)
            .map_err(ApiError::from)?;
        Ok(lobby)
    }

    pub async fn leave_seat(&self, player_id: &str) -> Result<Lobby, ApiError> {
        let (lobby, seat) = self
            .with_lobby(|lobby, _| {
                let seat = lobby.leave_seat(player_id)?;
                Ok((lobby.clone(), seat))
            })
            .await?;
        let mut inner = self.inner.lock().await;
        inner.player_ids.remove(&seat);
        Ok(lobby)
    }

    pub async fn set_ready(&self, player_id: &str, ready: bool) -> Result<Lobby, ApiError> {
        self.with_lobby(|lobby, _| {
            lobby.set_ready(player_id, ready)?;
            Ok(lobby.clone())
        })
        .await
    }

    pub async fn update_slot_name(&self, player_id: &str, name: &str) -> Result<Lobby, ApiError> {
        self.with_lobby(|lobby, _| {
            lobby.update_slot_name(player_id, name)?;
            Ok(lobby.clone())
        })
        .await
    }

    pub async fn add_slot(&self, host_id: &str) -> Result<Lobby, ApiError> {
        self.with_lobby(|lobby, _| {
            lobby.add_slot(host_id)?;
            Ok(lobby.clone())
        })
        .await
    }

    pub async fn remove_slot(&self, host_id: &str, seat: Seat) -> Result<Lobby, ApiError> {
        self.with_lobby(|lobby, _| {
            lobby.remove_slot(host_id, seat)?;
            Ok(lobby.clone())
        })
        .await
    }

    pub async fn set_slot_ai(
        &self,
        host_id: &str,
        seat: Seat,
        is_ai: bool,
        ai_level: Option<&str>,
    ) -> Result<Lobby, ApiError> {
        self.with_lobby(|lobby, _| {
            lobby.set_slot_ai(host_id, seat, is_ai, ai_level)?;
            Ok(lobby.clone())
        })
        .await
    }

    pub async fn kick_player(&self, host_id: &str, seat: Seat) -> Result<Lobby, ApiError> {
        let (lobby, kicked) = self
            .with_lobby(|lobby, _| {
                let kicked = lobby.kick_player(host_id, seat)?;
                Ok((lobby.clone(), kicked))
            })
            .await?;
        let mut inner = self.inner.lock().await;
        inner.player_ids.remove(&seat);
        inner.connections.close_player(&kicked);
        Ok(lobby)
    }

    pub async fn update_player_options(
        &self,
        player_id: &str,
        options: &Map<String, Value>,
    ) -> Result<Lobby, ApiError> {
        self.with_lobby(|lobby, def| {
            lobby.update_player_options(def, player_id, options)?;
            Ok(lobby.clone())
        })
        .await
    }

    pub async fn update_slot_player_options(
        &self,
        host_id: &str,
        seat: Seat,
        options: &Map<String, Value>,
    ) -> Result<Lobby, ApiError> {
        self.with_lobby(|lobby, def| {
            lobby.update_slot_player_options(def, host_id, seat, options)?;
            Ok(lobby.clone())
        })
        .await
    }

    pub async fn update_game_options(
        &self,
        host_id: &str,
        options: &Map<String, Value>,
    ) -> Result<Lobby, ApiError> {
        self.with_lobby(|lobby, def| {
            lobby.update_game_options(def, host_id, options)?;
            Ok(lobby.clone())
        })
        .await
    }

    /// The one-way lobby -> playing edge: invoke the game constructor
    /// with the slot assignments and discard the lobby.
    pub async fn start_game(&self, host_id: &str) -> Result<ActionResponse, ApiError> {
        let mut inner = self.inner.lock().await;
        self.touch();
        let def = self.registry.require(&inner.record.game_type)?;
        let lobby = inner
            .lobby
            .take()
            .ok_or_else(|| ApiError::conflict("game has already started"))?;
        if let Some(creator) = &lobby.creator_id {
            if creator != host_id {
                inner.lobby = Some(lobby);
                return Err(ApiError::forbidden("only the lobby creator may start the game"));
            }
        }
        let assignments = match lobby.clone().into_assignments() {
            Ok(assignments) => assignments,
            Err(err) => {
                inner.lobby = Some(lobby);
                return Err(err);
            }
        };

        inner.record.player_count = assignments.player_names.len() as u8;
        inner.record.player_names = assignments.player_names;
        inner.record.player_options = assignments.player_options;
        inner.record.ai_players = assignments.ai_players;
        inner.record.game_options = assignments.game_options;
        inner.record.last_activity_ms = chrono::Utc::now().timestamp_millis();
        for (seat, player_id) in &assignments.player_ids {
            inner.player_ids.insert(*seat, player_id.clone());
        }

        let engine = match def.factory.create(&inner.record.setup()) {
            Ok(engine) => engine,
            Err(err) => {
                inner.lobby = Some(lobby);
                return Err(err.into());
            }
        };
        inner.game = Some(engine);
        inner.mutation_count += 1;

        self.backend.save_record(&inner.record).map_err(ApiError::from)?;
        self.backend.save_lobby(&self.game_id, None).map_err(ApiError::from)?;
        let pairs: Vec<(Seat, String)> =
            inner.player_ids.iter().map(|(s, p)| (*s, p.clone())).collect();
        self.backend
            .save_player_ids(&self.game_id, &pairs)
            .map_err(ApiError::from)?;

        tracing::info!(game_id = %self.game_id, "lobby complete, game started");

        let response = action_response(&inner, None);
        broadcast_state(&mut inner);
        drop(inner);
        self.kick_ai();
        Ok(response)
    }

    // ---- connections ------------------------------------------------

    /// Attach a socket. The newest connection for a (player, seat) pair
    /// supersedes older ones; the initial state is pushed immediately.
    pub async fn connect(
        &self,
        player_id: &str,
        seat: Option<Seat>,
        spectator: bool,
        sender: MessageSender,
    ) -> Result<ConnectionId, ApiError> {
        let mut inner = self.inner.lock().await;
        let seat = if spectator {
            None
        } else {
            match seat {
                Some(seat) => {
                    if seat == 0 || seat > inner.record.player_count.max(inner.lobby.as_ref().map(|l| l.slot_count()).unwrap_or(0)) {
                        return Err(ApiError::invalid_args(format!("seat {seat} is out of range")));
                    }
                    Some(seat)
                }
                None => inner
                    .player_ids
                    .iter()
                    .find(|(_, p)| p.as_str() == player_id)
                    .map(|(s, _)| *s)
                    .or_else(|| inner.lobby.as_ref().and_then(|l| l.seat_of(player_id))),
            }
        };

        if let Some(seat) = seat {
            inner.player_ids.entry(seat).or_insert_with(|| player_id.to_string());
        }
        let id = inner.connections.add(player_id, seat, sender);
        tracing::debug!(game_id = %self.game_id, connection_id = id, player_id, seat = ?seat, "connection attached");

        let lobby_changed = match inner.lobby.as_mut() {
            Some(lobby) if !spectator => lobby.set_connected(player_id, true),
            _ => false,
        };
        if lobby_changed {
            self.backend
                .save_lobby(&self.game_id, inner.lobby.as_ref())
                .map_err(ApiError::from)?;
            broadcast_state(&mut inner);
        } else {
            let message = state_message(&inner, seat, spectator);
            inner.connections.send_to(id, message);
        }
        if !spectator {
            self.touch();
        }
        Ok(id)
    }

    pub async fn disconnect(&self, id: ConnectionId) {
        let mut inner = self.inner.lock().await;
        let player_id = inner.connections.get(id).map(|c| c.player_id.clone());
        inner.connections.close(id);
        if let Some(player_id) = player_id {
            if !inner.connections.is_player_connected(&player_id) {
                let changed = inner
                    .lobby
                    .as_mut()
                    .map(|lobby| lobby.set_connected(&player_id, false))
                    .unwrap_or(false);
                if changed {
                    if let Err(err) =
                        self.backend.save_lobby(&self.game_id, inner.lobby.as_ref())
                    {
                        tracing::warn!(game_id = %self.game_id, error = %err, "failed to persist lobby on disconnect");
                    }
                    broadcast_state(&mut inner);
                }
            }
        }
    }

    /// Ping keeps the connection live; the pong goes only to the caller.
    pub async fn ping(&self, id: ConnectionId) {
        let mut inner = self.inner.lock().await;
        inner.connections.touch_ping(id);
        inner
            .connections
            .send_to(id, ServerMessage::Pong { timestamp: chrono::Utc::now().timestamp_millis() });
    }

    /// Push the current state to one connection (the `getState` message).
    pub async fn push_state_to(&self, id: ConnectionId) {
        let mut inner = self.inner.lock().await;
        let Some(conn) = inner.connections.get(id) else { return };
        let (seat, spectator) = (conn.seat, conn.seat.is_none());
        let message = state_message(&inner, seat, spectator);
        inner.connections.send_to(id, message);
    }

    pub async fn send_error_to(&self, id: ConnectionId, error: &ApiError) {
        let mut inner = self.inner.lock().await;
        inner
            .connections
            .send_to(id, ServerMessage::Error { error: error.message.clone() });
    }

    pub async fn connection_seat(&self, id: ConnectionId) -> Option<Seat> {
        let inner = self.inner.lock().await;
        inner.connections.get(id).and_then(|c| c.seat)
    }

    /// Periodic housekeeping: close idle connections, expire stale
    /// pendings, mirror liveness into the lobby.
    pub async fn sweep(&self) {
        let mut inner = self.inner.lock().await;
        let idle = self.settings.connection_idle();
        let swept = inner.connections.sweep_idle(idle);
        inner.pending.sweep_expired();
        let mut changed = false;
        for player_id in &swept {
            if let Some(lobby) = inner.lobby.as_mut() {
                changed |= lobby.set_connected(player_id, false);
            }
        }
        if changed {
            if let Err(err) = self.backend.save_lobby(&self.game_id, inner.lobby.as_ref()) {
                tracing::warn!(game_id = %self.game_id, error = %err, "failed to persist lobby during sweep");
            }
            broadcast_state(&mut inner);
        }
    }

    // ---- AI support -------------------------------------------------

    /// Snapshot what the AI controller needs for one think, or `None`
    /// when no AI move is due.
    pub async fn ai_think_input(&self) -> Option<crate::ai_controller::ThinkInput> {
        let inner = self.inner.lock().await;
        if inner.lobby.is_some() {
            return None;
        }
        let game = inner.game.as_deref()?;
        if game.is_complete() {
            return None;
        }
        let seat = game.current_player()?;
        let level = inner.record.ai_players.get(&seat)?.clone();
        if inner.pending.get(seat).is_some() {
            return None;
        }
        Some(crate::ai_controller::ThinkInput {
            generation: inner.mutation_count,
            game_type: inner.record.game_type.clone(),
            setup: inner.record.setup(),
            state: game.state_blob().ok()?,
            history: inner.history.clone(),
            seat,
            level,
            seed: inner.record.seed ^ u64::from(seat),
        })
    }

    pub fn registry(&self) -> Arc<GameRegistry> {
        Arc::clone(&self.registry)
    }

    // ---- rebuild helpers --------------------------------------------

    /// Throwaway engine at `len` actions: nearest checkpoint at or below,
    /// then forward replay.
    fn rebuild_engine(
        &self,
        inner: &SessionInner,
        len: usize,
    ) -> Result<Box<dyn GameEngine>, ApiError> {
        if len > inner.history.len() {
            return Err(ApiError::out_of_range(format!(
                "index {len} is outside history of length {}",
                inner.history.len()
            )));
        }
        require_game(inner)?;
        let def = self.registry.require(&inner.record.game_type)?;
        let mut engine = def.factory.create(&inner.record.setup())?;
        let start = match inner.checkpoints.nearest_at_or_below(len) {
            Some(checkpoint) => {
                engine
                    .restore(&checkpoint.state)
                    .map_err(|err| ApiError::internal(err.to_string()))?;
                checkpoint.at_action_index
            }
            None => 0,
        };
        for action in &inner.history[start..len] {
            let (name, seat, args) =
                deserialize_action(action, engine.tree(), engine.player_count())
                    .map_err(|err| ApiError::internal(format!("replay failed: {err}")))?;
            engine
                .perform_action(&name, seat, &args)
                .map_err(|err| ApiError::internal(format!("replay failed: {err}")))?;
        }
        Ok(engine)
    }

    /// Truncate the live game to `new_len` actions: rebuild from the
    /// nearest surviving checkpoint, truncate the log, persist.
    fn truncate_live(&self, inner: &mut SessionInner, new_len: usize) -> Result<(), ApiError> {
        let def = self.registry.require(&inner.record.game_type)?;
        let mut engine = def.factory.create(&inner.record.setup())?;
        inner.checkpoints.truncate_to(new_len);
        let start = match inner.checkpoints.nearest_at_or_below(new_len) {
            Some(checkpoint) => {
                engine
                    .restore(&checkpoint.state)
                    .map_err(|err| ApiError::internal(err.to_string()))?;
                checkpoint.at_action_index
            }
            None => 0,
        };
        for action in &inner.history[start..new_len] {
            let (name, seat, args) =
                deserialize_action(action, engine.tree(), engine.player_count())
                    .map_err(|err| ApiError::internal(format!("replay failed: {err}")))?;
            engine
                .perform_action(&name, seat, &args)
                .map_err(|err| ApiError::internal(format!("replay failed: {err}")))?;
        }
        inner.history.truncate(new_len);
        inner.game = Some(engine);
        inner.record.last_activity_ms = chrono::Utc::now().timestamp_millis();
        inner.mutation_count += 1;
        self.backend
            .truncate_actions(&self.game_id, new_len as u64)
            .map_err(ApiError::from)?;
        self.backend.save_record(&inner.record).map_err(ApiError::from)?;
        Ok(())
    }
}

fn require_game<'a>(inner: &'a SessionInner) -> Result<&'a dyn GameEngine, ApiError> {
    if inner.lobby.is_some() {
        return Err(ApiError::conflict("game has not started yet"));
    }
    inner
        .game
        .as_deref()
        .ok_or_else(|| ApiError::conflict("game has not started yet"))
}

/// Length of the trailing run of actions by `seat` (the undo window).
fn trailing_run(history: &[SerializedAction], seat: Seat) -> usize {
    history.iter().rev().take_while(|a| a.player == seat).count()
}

fn flow_of(game: &dyn GameEngine) -> FlowState {
    FlowState {
        phase: game.phase().to_string(),
        current_player: game.current_player(),
        is_complete: game.is_complete(),
    }
}

fn lobby_flow() -> FlowState {
    FlowState { phase: "lobby".to_string(), current_player: None, is_complete: false }
}

fn build_player_state(
    inner: &SessionInner,
    game: &dyn GameEngine,
    seat: Option<Seat>,
    history: &[SerializedAction],
) -> PlayerGameState {
    let players: Vec<PlayerInfo> = (1..=game.player_count())
        .map(|s| PlayerInfo {
            seat: s,
            name: inner
                .record
                .player_names
                .get((s - 1) as usize)
                .cloned()
                .unwrap_or_else(|| format!("Player {s}")),
            is_ai: inner.record.ai_players.contains_key(&s),
            connected: inner
                .player_ids
                .get(&s)
                .map(|p| inner.connections.is_player_connected(p))
                .unwrap_or(false),
        })
        .collect();

    let events = game.animation_events();
    let (animation_events, last_animation_event_id) = if events.is_empty() {
        (None, None)
    } else {
        (Some(events.to_vec()), events.last().map(|e| e.id))
    };

    let (can_undo, actions_this_turn, turn_start) = match seat {
        Some(seat) => {
            let run = trailing_run(history, seat);
            (run > 0 && !game.is_complete(), run, history.len() - run)
        }
        None => (false, 0, history.len()),
    };

    PlayerGameState {
        phase: game.phase().to_string(),
        players,
        current_player: game.current_player(),
        available_actions: seat.map(|s| game.available_actions(s)).unwrap_or_default(),
        is_my_turn: seat.is_some() && game.current_player() == seat,
        view: create_player_view(game, seat),
        animation_events,
        last_animation_event_id,
        action_metadata: Some(game.all_action_metadata()),
        can_undo,
        actions_this_turn,
        turn_start_action_index: turn_start,
        custom_debug: None,
        color_selection_enabled: if inner.color_selection_enabled { Some(true) } else { None },
    }
}

fn state_response(inner: &SessionInner, seat: Option<Seat>) -> StateResponse {
    match inner.game.as_deref() {
        Some(game) => StateResponse {
            state: Some(build_player_state(inner, game, seat, &inner.history)),
            flow_state: flow_of(game),
            lobby: None,
        },
        None => StateResponse {
            state: None,
            flow_state: lobby_flow(),
            lobby: inner.lobby.clone(),
        },
    }
}

fn action_response(inner: &SessionInner, seat: Option<Seat>) -> ActionResponse {
    match inner.game.as_deref() {
        Some(game) => ActionResponse {
            state: Some(build_player_state(inner, game, seat, &inner.history)),
            flow_state: flow_of(game),
        },
        None => ActionResponse { state: None, flow_state: lobby_flow() },
    }
}

fn state_message(inner: &SessionInner, seat: Option<Seat>, spectator: bool) -> ServerMessage {
    let response = state_response(inner, seat);
    ServerMessage::State {
        state: response.state.map(Box::new),
        lobby: response.lobby,
        flow_state: response.flow_state,
        player_position: seat,
        is_spectator: spectator,
    }
}

/// Fan the post-mutation state out to every connection, each with its
/// own seat's masked view. Runs under the mutation lane, which is what
/// guarantees receivers observe commits in order.
fn broadcast_state(inner: &mut SessionInner) {
    let targets: HashSet<(Option<Seat>, bool)> =
        inner.connections.iter().map(|c| (c.seat, c.seat.is_none())).collect();
    let mut cache: HashMap<(Option<Seat>, bool), ServerMessage> = HashMap::new();
    for (seat, spectator) in targets {
        cache.insert((seat, spectator), state_message(inner, seat, spectator));
    }
    let dropped = inner.connections.broadcast(|conn| {
        cache
            .get(&(conn.seat, conn.seat.is_none()))
            .cloned()
            .unwrap_or(ServerMessage::Error { error: "no state available".to_string() })
    });
    for player_id in dropped {
        if !inner.connections.is_player_connected(&player_id) {
            if let Some(lobby) = inner.lobby.as_mut() {
                lobby.set_connected(&player_id, false);
            }
        }
    }
}

fn broadcast_restart(inner: &mut SessionInner) {
    let targets: HashSet<Option<Seat>> = inner.connections.iter().map(|c| c.seat).collect();
    let mut cache: HashMap<Option<Seat>, ServerMessage> = HashMap::new();
    for seat in targets {
        if let Some(game) = inner.game.as_deref() {
            cache.insert(
                seat,
                ServerMessage::Restart {
                    state: Box::new(build_player_state(inner, game, seat, &inner.history)),
                    flow_state: flow_of(game),
                },
            );
        }
    }
    inner.connections.broadcast(|conn| {
        cache
            .get(&conn.seat)
            .cloned()
            .unwrap_or(ServerMessage::Error { error: "no state available".to_string() })
    });
}

/// Leaf-level JSON diff: `{path: {from, to}}` for every changed leaf.
fn json_diff(a: &Value, b: &Value) -> Value {
    let mut out = Map::new();
    diff_into(a, b, String::new(), &mut out);
    Value::Object(out)
}

fn diff_into(a: &Value, b: &Value, path: String, out: &mut Map<String, Value>) {
    match (a, b) {
        (Value::Object(ma), Value::Object(mb)) => {
            let keys: HashSet<&String> = ma.keys().chain(mb.keys()).collect();
            for key in keys {
                let next = if path.is_empty() { key.clone() } else { format!("{path}/{key}") };
                diff_into(
                    ma.get(key).unwrap_or(&Value::Null),
                    mb.get(key).unwrap_or(&Value::Null),
                    next,
                    out,
                );
            }
        }
        (Value::Array(va), Value::Array(vb)) => {
            let len = va.len().max(vb.len());
            for i in 0..len {
                let next = format!("{path}/{i}");
                diff_into(
                    va.get(i).unwrap_or(&Value::Null),
                    vb.get(i).unwrap_or(&Value::Null),
                    next,
                    out,
                );
            }
        }
        (a, b) if a != b => {
            out.insert(path, serde_json::json!({ "from": a, "to": b }));
        }
        _ => {}
    }
}

fn named_players(options: &CreateGameOptions) -> Vec<String> {
    (1..=options.player_count)
        .map(|seat| {
            options
                .player_names
                .as_ref()
                .and_then(|names| names.get((seat - 1) as usize))
                .cloned()
                .unwrap_or_else(|| format!("Player {seat}"))
        })
        .collect()
}

fn ai_assignments(options: &CreateGameOptions) -> Result<BTreeMap<Seat, String>, ApiError> {
    let mut out = BTreeMap::new();
    let default_level = options.ai_level.clone().unwrap_or_else(|| "medium".to_string());
    if gametable_ai::AiLevel::parse(&default_level).is_none() {
        return Err(ApiError::invalid_args(format!("unknown AI level `{default_level}`")));
    }
    if let Some(seats) = &options.ai_players {
        for seat in seats {
            if *seat == 0 || *seat > options.player_count {
                return Err(ApiError::invalid_args(format!("AI seat {seat} is out of range")));
            }
            out.insert(*seat, default_level.clone());
        }
    }
    if let Some(configs) = &options.player_configs {
        for (index, config) in configs.iter().enumerate() {
            if config.is_ai {
                let level = config.ai_level.clone().unwrap_or_else(|| default_level.clone());
                if gametable_ai::AiLevel::parse(&level).is_none() {
                    return Err(ApiError::invalid_args(format!("unknown AI level `{level}`")));
                }
                out.insert((index + 1) as Seat, level);
            }
        }
    }
    Ok(out)
}
