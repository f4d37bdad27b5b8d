use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use gametable_engine::Seat;

use crate::errors::ApiError;

/// One waiting player.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub player_id: String,
    pub player_name: String,
    enqueued_at: Instant,
}

#[derive(Debug, Clone)]
struct MatchedInfo {
    game_id: String,
    position: Seat,
    players: Vec<String>,
}

/// Body of `POST /matchmaking/join` and `GET /matchmaking/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchStatus {
    pub matched: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub game_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player_position: Option<Seat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub players: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub players_needed: Option<usize>,
}

impl MatchStatus {
    fn matched(info: &MatchedInfo) -> Self {
        Self {
            matched: true,
            game_id: Some(info.game_id.clone()),
            player_position: Some(info.position),
            players: Some(info.players.clone()),
            position: None,
            queue_size: None,
            players_needed: None,
        }
    }

    fn queued(position: usize, queue_size: usize, players_needed: usize) -> Self {
        Self {
            matched: false,
            game_id: None,
            player_position: None,
            players: None,
            position: Some(position),
            queue_size: Some(queue_size),
            players_needed: Some(players_needed),
        }
    }
}

#[derive(Debug, Default)]
struct MatchState {
    queues: HashMap<(String, u8), VecDeque<QueueEntry>>,
    matched: HashMap<String, MatchedInfo>,
}

/// FIFO queues keyed by (gameType, playerCount). The fill check and the
/// dequeue happen in one critical section, with the session creation
/// callback inside it, so two racing joins can never both claim the
/// same waiting players.
#[derive(Debug)]
pub struct Matchmaker {
    state: Mutex<MatchState>,
    ttl: Duration,
}

impl Matchmaker {
    pub fn new(ttl: Duration) -> Self {
        Self { state: Mutex::new(MatchState::default()), ttl }
    }

    /// Enqueue, and if the queue can fill a game, dequeue the players
    /// and invoke `create` with them (FIFO order, joiner last).
    pub fn join(
        &self,
        game_type: &str,
        player_count: u8,
        player_id: &str,
        player_name: &str,
        create: impl FnOnce(&[QueueEntry]) -> Result<String, ApiError>,
    ) -> Result<MatchStatus, ApiError> {
        if player_count < 2 {
            return Err(ApiError::invalid_args("playerCount must be at least 2"));
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        evict_expired(&mut state, self.ttl);

        if let Some(info) = state.matched.get(player_id) {
            return Ok(MatchStatus::matched(info));
        }

        let key = (game_type.to_string(), player_count);
        // A rejoin refreshes the existing entry rather than duplicating.
        for queue in state.queues.values_mut() {
            queue.retain(|e| e.player_id != player_id);
        }
        let queue = state.queues.entry(key.clone()).or_default();
        queue.push_back(QueueEntry {
            player_id: player_id.to_string(),
            player_name: player_name.to_string(),
            enqueued_at: Instant::now(),
        });

        if queue.len() >= player_count as usize {
            let members: Vec<QueueEntry> =
                queue.drain(..player_count as usize).collect();
            match create(&members) {
                Ok(game_id) => {
                    tracing::info!(
                        game_type,
                        player_count,
                        game_id = %game_id,
                        "matchmaking filled a game"
                    );
                    let players: Vec<String> =
                        members.iter().map(|e| e.player_name.clone()).collect();
                    let mut joiner = None;
                    for (index, member) in members.iter().enumerate() {
                        let info = MatchedInfo {
                            game_id: game_id.clone(),
                            position: (index + 1) as Seat,
                            players: players.clone(),
                        };
                        if member.player_id == player_id {
                            joiner = Some(info.clone());
                        }
                        state.matched.insert(member.player_id.clone(), info);
                    }
                    let joiner = joiner.ok_or_else(|| {
                        ApiError::internal("joiner missing from its own match")
                    })?;
                    Ok(MatchStatus::matched(&joiner))
                }
                Err(err) => {
                    // Creation failed: put everyone back at the front in
                    // their original order.
                    let queue = state.queues.entry(key).or_default();
                    for member in members.into_iter().rev() {
                        queue.push_front(member);
                    }
                    Err(err)
                }
            }
        } else {
            let position = queue.len();
            let queue_size = queue.len();
            let needed = player_count as usize - queue.len();
            Ok(MatchStatus::queued(position, queue_size, needed))
        }
    }

    pub fn status(&self, player_id: &str) -> Result<MatchStatus, ApiError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        evict_expired(&mut state, self.ttl);

        if let Some(info) = state.matched.get(player_id) {
            return Ok(MatchStatus::matched(info));
        }
        for ((_, player_count), queue) in &state.queues {
            if let Some(index) = queue.iter().position(|e| e.player_id == player_id) {
                return Ok(MatchStatus::queued(
                    index + 1,
                    queue.len(),
                    (*player_count as usize).saturating_sub(queue.len()),
                ));
            }
        }
        Err(ApiError::not_found(format!("player `{player_id}` is not queued")))
    }

    /// Dequeue. Also forgets a recorded match so the id can re-queue.
    pub fn leave(&self, player_id: &str) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut removed = state.matched.remove(player_id).is_some();
        for queue in state.queues.values_mut() {
            let before = queue.len();
            queue.retain(|e| e.player_id != player_id);
            removed |= queue.len() != before;
        }
        removed
    }

    /// Drop queue entries older than the TTL. Run by the server's
    /// housekeeping tick and on every queue access.
    pub fn evict_expired(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        evict_expired(&mut state, self.ttl);
    }

    pub fn queued_count(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.queues.values().map(|q| q.len()).sum()
    }
}

fn evict_expired(state: &mut MatchState, ttl: Duration) {
    let now = Instant::now();
    for queue in state.queues.values_mut() {
        queue.retain(|e| now.duration_since(e.enqueued_at) < ttl);
    }
    state.queues.retain(|_, queue| !queue.is_empty());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matchmaker() -> Matchmaker {
        Matchmaker::new(Duration::from_secs(300))
    }

    #[test]
    fn queues_until_enough_players_then_fills_fifo() {
        let m = matchmaker();
        let status = m
            .join("pawns", 2, "p1", "Alice", |_| panic!("must not fill yet"))
            .expect("join p1");
        assert!(!status.matched);
        assert_eq!(status.position, Some(1));
        assert_eq!(status.players_needed, Some(1));

        let status = m
            .join("pawns", 2, "p2", "Bob", |members| {
                assert_eq!(members[0].player_id, "p1");
                assert_eq!(members[1].player_id, "p2");
                Ok("g-1".to_string())
            })
            .expect("join p2");
        assert!(status.matched);
        assert_eq!(status.game_id.as_deref(), Some("g-1"));
        assert_eq!(status.player_position, Some(2));
        assert_eq!(status.players, Some(vec!["Alice".to_string(), "Bob".to_string()]));

        // The first player sees the same match via status.
        let status = m.status("p1").expect("status p1");
        assert!(status.matched);
        assert_eq!(status.player_position, Some(1));
    }

    #[test]
    fn different_player_counts_queue_separately() {
        let m = matchmaker();
        m.join("pawns", 2, "p1", "A", |_| panic!("no fill")).expect("join");
        let status = m
            .join("pawns", 3, "p2", "B", |_| panic!("no fill"))
            .expect("join other bucket");
        assert!(!status.matched);
        assert_eq!(status.players_needed, Some(2));
        assert_eq!(m.queued_count(), 2);
    }

    #[test]
    fn leave_dequeues() {
        let m = matchmaker();
        m.join("pawns", 2, "p1", "A", |_| panic!("no fill")).expect("join");
        assert!(m.leave("p1"));
        assert!(!m.leave("p1"));
        assert!(m.status("p1").is_err());

        // The queue really is empty: the next joiner waits.
        let status = m
            .join("pawns", 2, "p2", "B", |_| panic!("no fill"))
            .expect("join after leave");
        assert_eq!(status.position, Some(1));
    }

    #[test]
    fn failed_creation_restores_the_queue() {
        let m = matchmaker();
        m.join("pawns", 2, "p1", "A", |_| panic!("no fill")).expect("join");
        let err = m
            .join("pawns", 2, "p2", "B", |_| Err(ApiError::internal("boom")))
            .unwrap_err();
        assert_eq!(err.code, crate::errors::ErrorCode::Internal);

        // Both players are still queued, in order.
        let status = m.status("p1").expect("status p1");
        assert_eq!(status.position, Some(1));
        let status = m.status("p2").expect("status p2");
        assert_eq!(status.position, Some(2));
    }

    #[test]
    fn stale_entries_are_evicted() {
        let m = Matchmaker::new(Duration::from_millis(0));
        m.join("pawns", 2, "p1", "A", |_| panic!("no fill")).expect("join");
        std::thread::sleep(Duration::from_millis(5));
        m.evict_expired();
        assert_eq!(m.queued_count(), 0);
        assert!(m.status("p1").is_err());
    }

    #[test]
    fn rejoin_refreshes_instead_of_duplicating() {
        let m = matchmaker();
        m.join("pawns", 3, "p1", "A", |_| panic!("no fill")).expect("join");
        m.join("pawns", 3, "p1", "A", |_| panic!("no fill")).expect("rejoin");
        assert_eq!(m.queued_count(), 1);
    }
}
