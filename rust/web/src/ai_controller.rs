//! Schedules AI turns for a session.
//!
//! The controller is re-evaluated after every committed mutation. When
//! the current seat is AI-controlled it spawns a cancellable think task
//! against a throwaway engine rebuilt from a state snapshot; the chosen
//! move is committed back through the session's mutation lane, where a
//! generation check discards it if the game moved underneath the think.
//!
//! ```text
//!  IDLE --(turn change, seat is AI)--> THINKING
//!  THINKING --(move chosen, generation unchanged)--> COMMIT --> IDLE
//!  THINKING --(game mutated, e.g. undo)--> CANCELED --> IDLE
//!  THINKING --(budget expiry)--> COMMIT best-so-far / fallback --> IDLE
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::task::JoinHandle;

use gametable_ai::{fallback_action, AiLevel, BaselineBot, Bot, ThinkBudget};
use gametable_engine::{GameSetup, Seat, SerializedAction};

use crate::session::GameSession;

/// Everything one think needs, captured under the mutation lane so the
/// bot never touches live state.
pub struct ThinkInput {
    pub generation: u64,
    pub game_type: String,
    pub setup: GameSetup,
    pub state: Value,
    pub history: Vec<SerializedAction>,
    pub seat: Seat,
    pub level: String,
    pub seed: u64,
}

struct ThinkTask {
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Per-session AI scheduler. Owns at most one in-flight think.
pub struct AiController {
    current: Mutex<Option<ThinkTask>>,
}

impl Default for AiController {
    fn default() -> Self {
        Self::new()
    }
}

impl AiController {
    pub fn new() -> Self {
        Self { current: Mutex::new(None) }
    }

    /// Cancel any in-flight think and, if the current seat is AI with no
    /// pending composition, start a new one. Called after every session
    /// mutation; cheap when there is nothing to do.
    pub fn reevaluate(&self, session: &Arc<GameSession>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let mut guard = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = guard.take() {
            task.cancel.store(true, Ordering::SeqCst);
            task.handle.abort();
        }

        let cancel = Arc::new(AtomicBool::new(false));
        let task_cancel = Arc::clone(&cancel);
        let session = Arc::clone(session);
        let handle = runtime.spawn(async move {
            run_think(session, task_cancel).await;
        });
        *guard = Some(ThinkTask { cancel, handle });
    }
}

async fn run_think(session: Arc<GameSession>, cancel: Arc<AtomicBool>) {
    let Some(input) = session.ai_think_input().await else {
        return;
    };
    let game_id = session.game_id().to_string();
    let registry = session.registry();
    let def = match registry.require(&input.game_type) {
        Ok(def) => def,
        Err(err) => {
            tracing::error!(game_id = %game_id, error = %err, "AI think aborted: unknown game type");
            return;
        }
    };

    let level = AiLevel::parse(&input.level).unwrap_or(AiLevel::Medium);
    let budget = ThinkBudget::new(&level, session.settings().think_timeout());
    let generation = input.generation;
    let seat = input.seat;
    let seed = input.seed;
    let factory = Arc::clone(&def.factory);
    let blocking_cancel = Arc::clone(&cancel);

    tracing::debug!(
        game_id = %game_id,
        seat,
        level = %input.level,
        iterations = budget.iterations,
        "AI thinking"
    );

    // The search runs on the blocking pool; the cancel flag is its only
    // link back, polled every iteration.
    let chosen = tokio::task::spawn_blocking(move || -> Option<SerializedAction> {
        let mut engine = factory.create(&input.setup).ok()?;
        engine.restore(&input.state).ok()?;
        let bot = BaselineBot::with_seed(seed);
        bot.choose_action(engine.as_ref(), &input.history, seat, &budget, &blocking_cancel)
            .or_else(|| {
                if blocking_cancel.load(Ordering::SeqCst) {
                    None
                } else {
                    // Budget ran dry without a pick: deterministic
                    // fallback from the availability set.
                    fallback_action(engine.as_ref(), seat, seed)
                }
            })
    })
    .await;

    match chosen {
        Ok(Some(mut action)) => {
            if cancel.load(Ordering::SeqCst) {
                return;
            }
            action.player = seat;
            match session.commit_ai_action(generation, action).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(game_id = %game_id, seat, "AI move discarded: state changed");
                }
                Err(err) => {
                    // The session is unchanged on error; log and let the
                    // next mutation re-trigger evaluation.
                    tracing::warn!(game_id = %game_id, seat, error = %err, "AI move rejected");
                }
            }
        }
        Ok(None) => {}
        Err(err) => {
            tracing::error!(game_id = %game_id, seat, error = %err, "AI think task failed");
        }
    }
}
