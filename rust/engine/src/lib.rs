//! # gametable-engine: board game engine contract
//!
//! The engine side of the gametable platform: an id-keyed element tree
//! with per-seat visibility, a reference-bearing JSON value encoding,
//! action schemas with dependent selections, versioned snapshots with
//! masked per-player views, and the [`game::GameEngine`] trait the
//! session layer drives. Engines are deterministic: a seed plus an
//! action log always rebuilds the same tree, which is what makes the
//! server's replay-based persistence and time travel possible.
//!
//! ## Core Modules
//!
//! - [`element`] - Element arena, branch paths, visibility policy
//! - [`value`] - `SerializedValue` wire encoding and reference resolution
//! - [`action`] - Action log records and selection schemas
//! - [`game`] - The `GameEngine` / `GameFactory` traits
//! - [`snapshot`] - Snapshots, restore, per-seat masked views
//! - [`games`] - Built-in reference game (`games::pawns`)
//! - [`errors`] - Error types for engine operations

pub mod action;
pub mod element;
pub mod errors;
pub mod game;
pub mod games;
pub mod snapshot;
pub mod value;

pub use action::{
    deserialize_action, serialize_action, ActionArgs, ActionMetadata, MultiSelectConfig,
    SelectionChoices, SelectionDef, SelectionKind, SerializedAction,
};
pub use element::{Element, ElementId, ElementTree, Seat, Visibility};
pub use errors::EngineError;
pub use game::{AnimationEvent, GameEngine, GameFactory, GameSetup};
pub use snapshot::{
    create_all_player_views, create_player_view, create_snapshot, restore_snapshot, trees_equal,
    GameSnapshot, PlayerView, SNAPSHOT_VERSION,
};
pub use value::{is_serialized_reference, GameValue, SerializeOpts, SerializedValue};
