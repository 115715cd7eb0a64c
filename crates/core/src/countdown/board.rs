//! All countdowns one viewer is watching

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use rand::Rng;

use super::engine::{Countdown, CountdownMode, CountdownPhase, CountdownSignal, CountdownSpec};

/// Number of concurrent loops at which expiries start getting jittered
pub const LOOP_JITTER_THRESHOLD: usize = 4;

const LOOP_JITTER_MS: std::ops::Range<u64> = 50..300;

/// Identifies one countdown: whose action, and which action
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CountdownKey {
    pub player: String,
    pub action_id: String,
}

impl CountdownKey {
    pub fn new(player: impl Into<String>, action_id: impl Into<String>) -> Self {
        Self {
            player: player.into(),
            action_id: action_id.into(),
        }
    }
}

impl std::fmt::Display for CountdownKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.player, self.action_id)
    }
}

/// Display-friendly view of one countdown
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountdownView {
    pub key: CountdownKey,
    pub remaining: u32,
    pub phase: CountdownPhase,
    pub mode: CountdownMode,
}

#[derive(Debug, Default)]
pub struct CountdownBoard {
    countdowns: BTreeMap<CountdownKey, Countdown>,
}

impl CountdownBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restart the countdown for `key`, creating it if needed
    pub fn trigger(&mut self, key: CountdownKey, spec: CountdownSpec, now: Instant) {
        match self.countdowns.get_mut(&key) {
            Some(countdown) => {
                tracing::debug!(key = %key, "Restarting countdown");
                countdown.rearm_with(spec, now);
            }
            None => {
                tracing::debug!(key = %key, total = spec.total_seconds(), "Arming countdown");
                self.countdowns.insert(key, Countdown::armed(spec, now));
            }
        }
    }

    /// Show a countdown held at zero without starting it
    ///
    /// Does nothing if the key is already present.
    pub fn park(&mut self, key: CountdownKey, spec: CountdownSpec) {
        self.countdowns
            .entry(key)
            .or_insert_with(|| Countdown::parked(spec));
    }

    /// Advance every countdown and collect their signals
    pub fn tick(&mut self, now: Instant) -> Vec<(CountdownKey, CountdownSignal)> {
        let loops = self
            .countdowns
            .values()
            .filter(|c| c.mode() == CountdownMode::Loop && c.phase() != CountdownPhase::Idle)
            .count();
        let jitter = loops >= LOOP_JITTER_THRESHOLD;
        let mut rng = rand::thread_rng();

        let mut out = Vec::new();
        let mut closed = Vec::new();

        for (key, countdown) in self.countdowns.iter_mut() {
            if countdown.mode() == CountdownMode::Loop && countdown.expires_by(now) {
                let delay = if jitter {
                    Duration::from_millis(rng.gen_range(LOOP_JITTER_MS))
                } else {
                    Duration::ZERO
                };
                countdown.set_rearm_delay(delay);
            }

            for signal in countdown.tick(now) {
                if signal == CountdownSignal::Closed {
                    closed.push(key.clone());
                }
                out.push((key.clone(), signal));
            }
        }

        for key in closed {
            self.countdowns.remove(&key);
        }

        out
    }

    /// Stop and forget one countdown
    pub fn dismiss(&mut self, key: &CountdownKey) -> bool {
        match self.countdowns.remove(key) {
            Some(mut countdown) => {
                countdown.dismiss();
                true
            }
            None => false,
        }
    }

    /// Drop every countdown belonging to `player`, returning how many went
    pub fn dismiss_player(&mut self, player: &str) -> usize {
        let before = self.countdowns.len();
        self.countdowns.retain(|key, _| key.player != player);
        before - self.countdowns.len()
    }

    pub fn clear(&mut self) {
        self.countdowns.clear();
    }

    pub fn get(&self, key: &CountdownKey) -> Option<&Countdown> {
        self.countdowns.get(key)
    }

    pub fn len(&self) -> usize {
        self.countdowns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.countdowns.is_empty()
    }

    pub fn snapshot(&self) -> Vec<CountdownView> {
        self.countdowns
            .iter()
            .map(|(key, c)| CountdownView {
                key: key.clone(),
                remaining: c.remaining(),
                phase: c.phase(),
                mode: c.mode(),
            })
            .collect()
    }
}
