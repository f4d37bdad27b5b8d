//! # gametable-web: session and server core
//!
//! The systems half of the gametable platform: owns live game
//! instances, accepts player connections over HTTP and WebSocket,
//! routes actions through the deterministic engine, fans out per-seat
//! filtered state, and manages lobby lifecycle before a game starts.
//! Persistence is an append-only action log; recovery replays it.
//!
//! ## Core Modules
//!
//! - [`session`] - Per-game state machine and the single-writer
//!   mutation lane
//! - [`store`] - `gameId -> GameSession` map over a pluggable backend
//!   (in-memory or sled)
//! - [`registry`] - Game-type definitions and option schemas
//! - [`lobby`] - Slot lifecycle: claim, ready, AI config, kicks
//! - [`pending`] - Multi-step action composition per player
//! - [`checkpoint`] - Rolling snapshot window for fast replay
//! - [`ai_controller`] - Cancellable AI turn scheduling
//! - [`matchmaker`] - FIFO queues pairing players into sessions
//! - [`broadcast`] - Session-owned connection table and fanout
//! - [`server`] / [`handlers`] - warp routes for the HTTP and
//!   WebSocket surface
//! - [`errors`] / [`settings`] / [`logging`] / [`metrics`] - ambient
//!   plumbing

pub mod ai_controller;
pub mod broadcast;
pub mod checkpoint;
pub mod errors;
pub mod handlers;
pub mod lobby;
pub mod logging;
pub mod matchmaker;
pub mod metrics;
pub mod pending;
pub mod registry;
pub mod server;
pub mod session;
pub mod settings;
pub mod store;

pub use ai_controller::AiController;
pub use broadcast::{Connection, ConnectionId, ConnectionTable, Liveness, ServerMessage};
pub use checkpoint::{Checkpoint, CheckpointManager};
pub use errors::{ApiError, ErrorCode, ErrorResponse, ErrorSeverity, IntoErrorResponse};
pub use lobby::{Lobby, LobbySlot, PlayerConfig, SlotStatus};
pub use logging::init_logging;
pub use matchmaker::{MatchStatus, Matchmaker};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use pending::{NextSelection, PendingActionManager, PendingState, StepResult};
pub use registry::{GameDefinition, GameDefinitionInfo, GameRegistry, OptionDef};
pub use server::{AppContext, ServerConfig, ServerError, ServerHandle, WebServer};
pub use session::{
    ActionResponse, CreateGameOptions, FlowState, GameSession, HistoryResponse, PlayerGameState,
    PlayerInfo, StateResponse, StepResponse,
};
pub use settings::{ServerSettings, SettingsError, StorageBackendKind};
pub use store::{GameRecord, GameStore, MemoryBackend, SledBackend, StorageBackend, StoredGame};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_provides_shared_components() {
        let ctx = AppContext::new_for_tests();
        assert_eq!(ctx.store().session_count(), 0);
        assert_eq!(ctx.matchmaker().queued_count(), 0);
        assert_eq!(ctx.metrics().snapshot().total_requests, 0);
    }
}
