//! Baseline bot: a seeded preference sampler over the legal move set.
//!
//! Good enough to keep a game moving and fully deterministic for a given
//! (seed, history length), which is what the server's replay tests need.
//! The iteration loop exists to honor the think budget contract: the
//! cancel flag is polled every iteration, so cancellation latency is one
//! iteration at worst.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use gametable_engine::{GameEngine, Seat, SerializedAction};

use crate::{enumerate_candidates, Bot, ThinkBudget};

#[derive(Debug, Clone)]
pub struct BaselineBot {
    seed: u64,
}

impl BaselineBot {
    pub fn new() -> Self {
        Self { seed: 0 }
    }

    /// Seed mixed into every decision, so two bots in one game can be
    /// configured to diverge.
    pub fn with_seed(seed: u64) -> Self {
        Self { seed }
    }

    /// Preference weight of a candidate. Moving beats revealing beats
    /// passing; everything else ties.
    fn weight(candidate: &SerializedAction) -> u32 {
        match candidate.name.as_str() {
            "move" | "advance" => 4,
            "reveal" => 2,
            "noop" => 1,
            _ => 2,
        }
    }
}

impl Default for BaselineBot {
    fn default() -> Self {
        Self::new()
    }
}

impl Bot for BaselineBot {
    fn choose_action(
        &self,
        game: &dyn GameEngine,
        history: &[SerializedAction],
        seat: Seat,
        budget: &ThinkBudget,
        cancel: &AtomicBool,
    ) -> Option<SerializedAction> {
        let candidates = enumerate_candidates(game, seat);
        if candidates.is_empty() {
            return None;
        }

        // Weighted sampling repeated over the iteration budget; the last
        // accepted sample wins. Seeding by history length keeps the whole
        // run a pure function of (seed, log), independent of timing.
        let mut rng =
            ChaCha20Rng::seed_from_u64(self.seed ^ (history.len() as u64).wrapping_mul(0x9e37));
        let total: u32 = candidates.iter().map(Self::weight).sum();
        let started = Instant::now();
        let mut best: Option<&SerializedAction> = None;

        for _ in 0..budget.iterations.max(1) {
            if cancel.load(Ordering::Relaxed) {
                return None;
            }
            if started.elapsed() >= budget.wall_clock {
                break;
            }
            let mut roll = rng.random_range(0..total);
            for candidate in &candidates {
                let w = Self::weight(candidate);
                if roll < w {
                    best = Some(candidate);
                    break;
                }
                roll -= w;
            }
        }

        best.or_else(|| candidates.first()).cloned()
    }

    fn name(&self) -> &str {
        "baseline"
    }
}
