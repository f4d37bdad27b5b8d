use thiserror::Error;

use crate::element::Seat;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("It's not player {actual}'s turn (expected player {expected})")]
    NotYourTurn { expected: Seat, actual: Seat },
    #[error("Illegal action: {0}")]
    IllegalAction(String),
    #[error("Game is already complete")]
    GameOver,
    #[error("Unknown action: {0}")]
    UnknownAction(String),
    #[error("Unknown selection `{selection}` for action `{action}`")]
    UnknownSelection { action: String, selection: String },
    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("Dangling reference: {0}")]
    DanglingRef(String),
    #[error("Unsupported snapshot version {found} (expected {expected})")]
    SnapshotVersion { found: u32, expected: u32 },
    #[error("Corrupt snapshot: {0}")]
    CorruptSnapshot(String),
}
