use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sled::transaction::ConflictableTransactionError;
use sled::Transactional;
use thiserror::Error;

use gametable_engine::{GameSetup, Seat, SerializedAction};

use crate::errors::ApiError;
use crate::lobby::Lobby;
use crate::registry::GameRegistry;
use crate::session::GameSession;
use crate::settings::ServerSettings;

/// Bookkeeping row for one game: the original creation options plus
/// activity metadata. The action log, not this row, is the source of
/// truth for game state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameRecord {
    pub game_id: String,
    pub game_type: String,
    pub seed: u64,
    pub player_count: u8,
    /// RFC3339 creation time.
    pub created_at: String,
    /// Unix milliseconds of the last seated activity.
    pub last_activity_ms: i64,
    #[serde(default)]
    pub game_options: Map<String, Value>,
    pub player_names: Vec<String>,
    #[serde(default)]
    pub player_options: Vec<Map<String, Value>>,
    /// Seat -> AI level for AI-controlled seats.
    #[serde(default)]
    pub ai_players: BTreeMap<Seat, String>,
    #[serde(default)]
    pub use_lobby: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub creator_id: Option<String>,
}

impl GameRecord {
    pub fn setup(&self) -> GameSetup {
        GameSetup {
            seed: self.seed,
            player_names: self.player_names.clone(),
            player_options: self.player_options.clone(),
            game_options: self.game_options.clone(),
        }
    }
}

/// Everything persisted for one game, as loaded during recovery.
#[derive(Debug, Clone)]
pub struct StoredGame {
    pub record: GameRecord,
    pub actions: Vec<SerializedAction>,
    pub lobby: Option<Lobby>,
    pub player_ids: Vec<(Seat, String)>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Game already exists: {0}")]
    AlreadyExists(String),
    #[error("Game not found: {0}")]
    NotFound(String),
    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AlreadyExists(id) => {
                ApiError::conflict(format!("game `{id}` already exists"))
            }
            StoreError::NotFound(id) => ApiError::not_found(format!("game `{id}` not found")),
            StoreError::Backend(msg) => ApiError::internal(msg),
        }
    }
}

/// Persistence plug-in behind the session cache. The in-memory backend
/// keeps nothing; the sled backend mirrors the schema tables as trees.
pub trait StorageBackend: Send + Sync {
    fn save_record(&self, record: &GameRecord) -> Result<(), StoreError>;

    /// Durability contract: the updated record and the action row are
    /// written atomically and fsynced before this returns Ok. Partial
    /// writes are forbidden.
    fn append_action(
        &self,
        record: &GameRecord,
        idx: u64,
        action: &SerializedAction,
    ) -> Result<(), StoreError>;

    /// Drop action rows with index >= new_len (undo / rewind).
    fn truncate_actions(&self, game_id: &str, new_len: u64) -> Result<(), StoreError>;

    fn save_lobby(&self, game_id: &str, lobby: Option<&Lobby>) -> Result<(), StoreError>;

    fn save_player_ids(&self, game_id: &str, ids: &[(Seat, String)]) -> Result<(), StoreError>;

    fn load(&self, game_id: &str) -> Result<Option<StoredGame>, StoreError>;

    fn delete(&self, game_id: &str) -> Result<(), StoreError>;

    fn list(&self) -> Result<Vec<String>, StoreError>;

    /// Idempotent flush of anything buffered.
    fn flush(&self) -> Result<(), StoreError>;
}

/// Backend for `storage_backend = memory`: the session cache is the
/// store, so every operation is a no-op and recovery finds nothing.
#[derive(Debug, Default)]
pub struct MemoryBackend;

impl StorageBackend for MemoryBackend {
    fn save_record(&self, _record: &GameRecord) -> Result<(), StoreError> {
        Ok(())
    }

    fn append_action(
        &self,
        _record: &GameRecord,
        _idx: u64,
        _action: &SerializedAction,
    ) -> Result<(), StoreError> {
        Ok(())
    }

    fn truncate_actions(&self, _game_id: &str, _new_len: u64) -> Result<(), StoreError> {
        Ok(())
    }

    fn save_lobby(&self, _game_id: &str, _lobby: Option<&Lobby>) -> Result<(), StoreError> {
        Ok(())
    }

    fn save_player_ids(&self, _game_id: &str, _ids: &[(Seat, String)]) -> Result<(), StoreError> {
        Ok(())
    }

    fn load(&self, _game_id: &str) -> Result<Option<StoredGame>, StoreError> {
        Ok(None)
    }

    fn delete(&self, _game_id: &str) -> Result<(), StoreError> {
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, StoreError> {
        Ok(Vec::new())
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Single-file embedded store. Trees mirror the schema: `games` (one
/// JSON record per id), `actions` (append-only log keyed by
/// `<id>\0<idx>`), `lobby`, `player_ids`.
pub struct SledBackend {
    db: sled::Db,
    games: sled::Tree,
    actions: sled::Tree,
    lobby: sled::Tree,
    player_ids: sled::Tree,
}

impl SledBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path.as_ref())?;
        Ok(Self {
            games: db.open_tree("games")?,
            actions: db.open_tree("actions")?,
            lobby: db.open_tree("lobby")?,
            player_ids: db.open_tree("player_ids")?,
            db,
        })
    }

    fn action_key(game_id: &str, idx: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(game_id.len() + 11);
        key.extend_from_slice(game_id.as_bytes());
        key.push(0);
        key.extend_from_slice(format!("{idx:010}").as_bytes());
        key
    }

    fn action_prefix(game_id: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(game_id.len() + 1);
        prefix.extend_from_slice(game_id.as_bytes());
        prefix.push(0);
        prefix
    }

    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(value).map_err(|err| StoreError::Backend(err.to_string()))
    }

    fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, StoreError> {
        serde_json::from_slice(bytes).map_err(|err| StoreError::Backend(err.to_string()))
    }
}

impl StorageBackend for SledBackend {
    fn save_record(&self, record: &GameRecord) -> Result<(), StoreError> {
        self.games
            .insert(record.game_id.as_bytes(), Self::encode(record)?)?;
        self.db.flush()?;
        Ok(())
    }

    fn append_action(
        &self,
        record: &GameRecord,
        idx: u64,
        action: &SerializedAction,
    ) -> Result<(), StoreError> {
        let record_bytes = Self::encode(record)?;
        let action_bytes = Self::encode(action)?;
        let record_key = record.game_id.as_bytes().to_vec();
        let action_key = Self::action_key(&record.game_id, idx);

        (&self.games, &self.actions)
            .transaction(|(games, actions)| {
                games.insert(record_key.as_slice(), record_bytes.as_slice())?;
                actions.insert(action_key.as_slice(), action_bytes.as_slice())?;
                Ok::<(), ConflictableTransactionError<()>>(())
            })
            .map_err(|err| StoreError::Backend(format!("{err:?}")))?;
        self.db.flush()?;
        Ok(())
    }

    fn truncate_actions(&self, game_id: &str, new_len: u64) -> Result<(), StoreError> {
        let start = Self::action_key(game_id, new_len);
        let mut end = Self::action_prefix(game_id);
        end.push(0xff);
        for entry in self.actions.range(start..end) {
            let (key, _) = entry?;
            self.actions.remove(key)?;
        }
        self.db.flush()?;
        Ok(())
    }

    fn save_lobby(&self, game_id: &str, lobby: Option<&Lobby>) -> Result<(), StoreError> {
        match lobby {
            Some(lobby) => {
                self.lobby.insert(game_id.as_bytes(), Self::encode(lobby)?)?;
            }
            None => {
                self.lobby.remove(game_id.as_bytes())?;
            }
        }
        self.db.flush()?;
        Ok(())
    }

    fn save_player_ids(&self, game_id: &str, ids: &[(Seat, String)]) -> Result<(), StoreError> {
        self.player_ids
            .insert(game_id.as_bytes(), Self::encode(&ids.to_vec())?)?;
        self.db.flush()?;
        Ok(())
    }

    fn load(&self, game_id: &str) -> Result<Option<StoredGame>, StoreError> {
        let Some(record_bytes) = self.games.get(game_id.as_bytes())? else {
            return Ok(None);
        };
        let record: GameRecord = Self::decode(&record_bytes)?;

        let mut actions = Vec::new();
        for entry in self.actions.scan_prefix(Self::action_prefix(game_id)) {
            let (_, bytes) = entry?;
            actions.push(Self::decode::<SerializedAction>(&bytes)?);
        }

        let lobby = match self.lobby.get(game_id.as_bytes())? {
            Some(bytes) => Some(Self::decode::<Lobby>(&bytes)?),
            None => None,
        };

        let player_ids = match self.player_ids.get(game_id.as_bytes())? {
            Some(bytes) => Self::decode::<Vec<(Seat, String)>>(&bytes)?,
            None => Vec::new(),
        };

        Ok(Some(StoredGame { record, actions, lobby, player_ids }))
    }

    fn delete(&self, game_id: &str) -> Result<(), StoreError> {
        self.games.remove(game_id.as_bytes())?;
        self.lobby.remove(game_id.as_bytes())?;
        self.player_ids.remove(game_id.as_bytes())?;
        for entry in self.actions.scan_prefix(Self::action_prefix(game_id)) {
            let (key, _) = entry?;
            self.actions.remove(key)?;
        }
        self.db.flush()?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut ids = Vec::new();
        for entry in self.games.iter() {
            let (key, _) = entry?;
            ids.push(String::from_utf8_lossy(&key).to_string());
        }
        Ok(ids)
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

/// Owns the mapping `gameId -> GameSession`. Lookups fall through to the
/// backend: a cache miss replays the persisted action log through the
/// engine, which must rebuild state bit-exactly.
pub struct GameStore {
    sessions: RwLock<HashMap<String, Arc<GameSession>>>,
    backend: Arc<dyn StorageBackend>,
    registry: Arc<GameRegistry>,
    settings: Arc<ServerSettings>,
}

impl GameStore {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        registry: Arc<GameRegistry>,
        settings: Arc<ServerSettings>,
    ) -> Self {
        Self { sessions: RwLock::new(HashMap::new()), backend, registry, settings }
    }

    pub fn backend(&self) -> Arc<dyn StorageBackend> {
        Arc::clone(&self.backend)
    }

    pub fn registry(&self) -> Arc<GameRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn settings(&self) -> Arc<ServerSettings> {
        Arc::clone(&self.settings)
    }

    /// Register a freshly created session. Fails `Conflict` if the id is
    /// taken in the cache or on disk.
    pub fn create_game(&self, session: Arc<GameSession>) -> Result<(), ApiError> {
        let game_id = session.game_id().to_string();
        {
            let guard = self.sessions.read().unwrap_or_else(|e| e.into_inner());
            if guard.contains_key(&game_id) {
                return Err(StoreError::AlreadyExists(game_id).into());
            }
        }
        if self.backend.load(&game_id).map_err(ApiError::from)?.is_some() {
            return Err(StoreError::AlreadyExists(game_id).into());
        }
        let mut guard = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        if guard.contains_key(&game_id) {
            return Err(StoreError::AlreadyExists(game_id).into());
        }
        guard.insert(game_id, session);
        Ok(())
    }

    /// Cache lookup with replay-based recovery on miss.
    pub fn get_game(&self, game_id: &str) -> Result<Option<Arc<GameSession>>, ApiError> {
        {
            let guard = self.sessions.read().unwrap_or_else(|e| e.into_inner());
            if let Some(session) = guard.get(game_id) {
                return Ok(Some(Arc::clone(session)));
            }
        }
        let Some(stored) = self.backend.load(game_id).map_err(ApiError::from)? else {
            return Ok(None);
        };
        tracing::info!(game_id = %game_id, actions = stored.actions.len(), "recovering session from storage");
        let session = GameSession::recover(
            stored,
            Arc::clone(&self.registry),
            Arc::clone(&self.settings),
            Arc::clone(&self.backend),
        )?;
        let mut guard = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        let session = guard.entry(game_id.to_string()).or_insert(session);
        Ok(Some(Arc::clone(session)))
    }

    pub fn require_game(&self, game_id: &str) -> Result<Arc<GameSession>, ApiError> {
        self.get_game(game_id)?
            .ok_or_else(|| ApiError::not_found(format!("game `{game_id}` not found")))
    }

    pub fn delete_game(&self, game_id: &str) -> Result<(), ApiError> {
        let removed = {
            let mut guard = self.sessions.write().unwrap_or_else(|e| e.into_inner());
            guard.remove(game_id)
        };
        let on_disk = self.backend.load(game_id).map_err(ApiError::from)?.is_some();
        if removed.is_none() && !on_disk {
            return Err(StoreError::NotFound(game_id.to_string()).into());
        }
        self.backend.delete(game_id).map_err(ApiError::from)?;
        Ok(())
    }

    pub fn list_active(&self) -> Vec<String> {
        let mut ids: Vec<String> = {
            let guard = self.sessions.read().unwrap_or_else(|e| e.into_inner());
            guard.keys().cloned().collect()
        };
        if let Ok(on_disk) = self.backend.list() {
            for id in on_disk {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        ids.sort();
        ids
    }

    /// Idempotent flush after a mutation.
    pub fn persist(&self, _game_id: &str) -> Result<(), ApiError> {
        self.backend.flush().map_err(ApiError::from)
    }

    /// Drop idle sessions from the cache. With a durable backend they
    /// remain recoverable from disk; the in-memory backend never evicts
    /// while the process is alive.
    pub fn evict_idle(&self) -> Vec<String> {
        if matches!(self.settings.storage_backend, crate::settings::StorageBackendKind::Memory) {
            return Vec::new();
        }
        let ttl = self.settings.session_ttl();
        let mut evicted = Vec::new();
        let mut guard = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        guard.retain(|id, session| {
            if session.idle_for() >= ttl {
                evicted.push(id.clone());
                false
            } else {
                true
            }
        });
        for id in &evicted {
            tracing::info!(game_id = %id, "evicted idle session from cache");
        }
        evicted
    }

    /// Flush every session's durable state; used by graceful shutdown.
    pub fn flush_all(&self) -> Result<(), ApiError> {
        self.backend.flush().map_err(ApiError::from)
    }

    pub fn session_count(&self) -> usize {
        let guard = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        guard.len()
    }

    /// Sessions currently resident in the cache (housekeeping sweep).
    pub fn cached_sessions(&self) -> Vec<Arc<GameSession>> {
        let guard = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        guard.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> GameRecord {
        GameRecord {
            game_id: id.to_string(),
            game_type: "pawns".to_string(),
            seed: 1,
            player_count: 2,
            created_at: chrono::Utc::now().to_rfc3339(),
            last_activity_ms: 0,
            game_options: Map::new(),
            player_names: vec!["A".into(), "B".into()],
            player_options: Vec::new(),
            ai_players: BTreeMap::new(),
            use_lobby: false,
            creator_id: None,
        }
    }

    fn action(name: &str, ts: u64) -> SerializedAction {
        SerializedAction { name: name.to_string(), player: 1, args: BTreeMap::new(), timestamp: ts }
    }

    #[test]
    fn sled_round_trips_a_game() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = SledBackend::open(dir.path().join("games.db")).expect("open");

        let rec = record("g1");
        backend.save_record(&rec).expect("save record");
        backend.append_action(&rec, 0, &action("noop", 1)).expect("append 0");
        backend.append_action(&rec, 1, &action("advance", 2)).expect("append 1");
        backend
            .save_player_ids("g1", &[(1, "p1".to_string())])
            .expect("save ids");

        let stored = backend.load("g1").expect("load").expect("present");
        assert_eq!(stored.record, rec);
        assert_eq!(stored.actions.len(), 2);
        assert_eq!(stored.actions[0].name, "noop");
        assert_eq!(stored.actions[1].name, "advance");
        assert_eq!(stored.player_ids, vec![(1, "p1".to_string())]);
        assert!(stored.lobby.is_none());

        assert_eq!(backend.list().expect("list"), vec!["g1".to_string()]);
    }

    #[test]
    fn sled_truncate_drops_the_tail_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = SledBackend::open(dir.path().join("games.db")).expect("open");

        let rec = record("g1");
        backend.save_record(&rec).expect("save");
        for idx in 0..5 {
            backend.append_action(&rec, idx, &action("noop", idx)).expect("append");
        }
        backend.truncate_actions("g1", 2).expect("truncate");

        let stored = backend.load("g1").expect("load").expect("present");
        assert_eq!(stored.actions.len(), 2);
        assert_eq!(stored.actions[1].timestamp, 1);
    }

    #[test]
    fn sled_keys_do_not_collide_across_game_ids() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = SledBackend::open(dir.path().join("games.db")).expect("open");

        let a = record("game");
        let b = record("game2");
        backend.save_record(&a).expect("save a");
        backend.save_record(&b).expect("save b");
        backend.append_action(&a, 0, &action("noop", 1)).expect("append a");
        backend.append_action(&b, 0, &action("advance", 2)).expect("append b");

        let stored_a = backend.load("game").expect("load").expect("present");
        assert_eq!(stored_a.actions.len(), 1);
        assert_eq!(stored_a.actions[0].name, "noop");

        backend.delete("game").expect("delete");
        assert!(backend.load("game").expect("load").is_none());
        let stored_b = backend.load("game2").expect("load").expect("still present");
        assert_eq!(stored_b.actions.len(), 1);
    }

    #[test]
    fn memory_backend_is_a_no_op() {
        let backend = MemoryBackend;
        let rec = record("g1");
        backend.save_record(&rec).expect("save");
        backend.append_action(&rec, 0, &action("noop", 1)).expect("append");
        assert!(backend.load("g1").expect("load").is_none());
        assert!(backend.list().expect("list").is_empty());
    }
}
