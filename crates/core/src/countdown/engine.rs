//! Single-action countdown state machine
//!
//! The deadline (`start + total`) is the source of truth. `remaining` is
//! recomputed from it on every tick as `ceil(deadline - now)`, so late or
//! irregular ticks never accumulate drift, including across Loop cycles.
//!
//! Time is always passed in, which keeps the machine deterministic under
//! test. Callers tick on a short fixed interval (~100ms), not once a second.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How long a finished OneShot countdown stays at zero before closing
pub const DEFAULT_HOLD: Duration = Duration::from_secs(2);

/// What happens when a countdown reaches zero
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountdownMode {
    /// Hold at zero briefly, then close
    #[default]
    OneShot,
    /// Hold at zero until triggered again
    Permanent,
    /// Restart immediately
    Loop,
}

/// Validated countdown parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountdownSpec {
    total_seconds: u32,
    mode: CountdownMode,
    alert_threshold_seconds: u32,
}

impl CountdownSpec {
    pub fn new(total_seconds: u32, mode: CountdownMode, alert_threshold_seconds: u32) -> Result<Self> {
        if total_seconds == 0 {
            return Err(Error::InvalidCountdown(
                "total_seconds must be at least 1".into(),
            ));
        }
        Ok(Self {
            total_seconds,
            mode,
            alert_threshold_seconds,
        })
    }

    pub fn total_seconds(&self) -> u32 {
        self.total_seconds
    }

    pub fn total(&self) -> Duration {
        Duration::from_secs(u64::from(self.total_seconds))
    }

    pub fn mode(&self) -> CountdownMode {
        self.mode
    }

    pub fn alert_threshold_seconds(&self) -> u32 {
        self.alert_threshold_seconds
    }
}

/// Externally visible phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownPhase {
    Idle,
    Running,
    /// OneShot at zero, about to close
    Holding,
    /// Permanent at zero, waiting for a re-arm
    Held,
    /// Loop at zero, waiting out its re-arm delay
    Rearming,
}

/// Notifications produced by a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownSignal {
    /// Displayed value changed
    Remaining(u32),
    /// Early warning (or expiry warning when the threshold is 0)
    Alert,
    /// Reached zero; play the expiry sound
    Expired,
    /// Loop restarted
    Rearmed,
    /// OneShot finished holding; the display should close
    Closed,
}

#[derive(Debug, Clone, Copy)]
enum State {
    Idle,
    Running { start: Instant },
    Holding { until: Instant },
    Held,
    Rearming { due: Instant },
}

/// Countdown for one action as seen by one viewer
#[derive(Debug, Clone)]
pub struct Countdown {
    spec: CountdownSpec,
    state: State,
    remaining: u32,
    /// Last value reported through `Remaining`
    displayed: Option<u32>,
    alert_fired: bool,
    hold: Duration,
    rearm_delay: Duration,
}

impl Countdown {
    /// Create an idle countdown
    pub fn new(spec: CountdownSpec) -> Self {
        Self {
            spec,
            state: State::Idle,
            remaining: 0,
            displayed: None,
            alert_fired: false,
            hold: DEFAULT_HOLD,
            rearm_delay: Duration::ZERO,
        }
    }

    /// Create and arm in one step
    pub fn armed(spec: CountdownSpec, now: Instant) -> Self {
        let mut countdown = Self::new(spec);
        countdown.arm(now);
        countdown
    }

    /// Create a countdown already held at zero
    ///
    /// Used for always-on actions that should be visible before first use.
    pub fn parked(spec: CountdownSpec) -> Self {
        let mut countdown = Self::new(spec);
        countdown.state = State::Held;
        countdown
    }

    /// Start (or restart) from the full duration
    pub fn arm(&mut self, now: Instant) {
        self.state = State::Running { start: now };
        self.remaining = self.spec.total_seconds;
        self.displayed = None;
        self.alert_fired = false;
    }

    /// Replace the parameters and restart
    pub fn rearm_with(&mut self, spec: CountdownSpec, now: Instant) {
        self.spec = spec;
        self.arm(now);
    }

    /// Stop regardless of mode
    pub fn dismiss(&mut self) {
        self.state = State::Idle;
        self.remaining = 0;
        self.displayed = None;
    }

    /// Advance to `now` and report what changed
    pub fn tick(&mut self, now: Instant) -> Vec<CountdownSignal> {
        let mut signals = Vec::new();

        match self.state {
            State::Idle | State::Held => {}
            State::Running { start } => {
                let deadline = start + self.spec.total();
                self.remaining = ceil_seconds(deadline.saturating_duration_since(now));
                self.notify_remaining(&mut signals);

                let threshold = self.spec.alert_threshold_seconds;
                if threshold > 0 && !self.alert_fired && self.remaining <= threshold {
                    self.alert_fired = true;
                    signals.push(CountdownSignal::Alert);
                }

                if self.remaining == 0 {
                    self.expire(now, &mut signals);
                }
            }
            State::Holding { until } => {
                if now >= until {
                    self.state = State::Idle;
                    signals.push(CountdownSignal::Closed);
                }
            }
            State::Rearming { due } => {
                if now >= due {
                    self.restart_loop(now, &mut signals);
                }
            }
        }

        signals
    }

    fn expire(&mut self, now: Instant, signals: &mut Vec<CountdownSignal>) {
        if self.spec.alert_threshold_seconds == 0 && !self.alert_fired {
            self.alert_fired = true;
            signals.push(CountdownSignal::Alert);
        }
        signals.push(CountdownSignal::Expired);

        match self.spec.mode {
            CountdownMode::OneShot => {
                self.state = State::Holding {
                    until: now + self.hold,
                };
            }
            CountdownMode::Permanent => {
                self.state = State::Held;
            }
            CountdownMode::Loop => {
                if self.rearm_delay.is_zero() {
                    self.restart_loop(now, signals);
                } else {
                    self.state = State::Rearming {
                        due: now + self.rearm_delay,
                    };
                }
            }
        }
    }

    // Anchored at the re-arm instant, not the old deadline, so a long stall
    // does not cause a burst of catch-up cycles.
    fn restart_loop(&mut self, now: Instant, signals: &mut Vec<CountdownSignal>) {
        self.arm(now);
        signals.push(CountdownSignal::Rearmed);
        self.notify_remaining(signals);
    }

    fn notify_remaining(&mut self, signals: &mut Vec<CountdownSignal>) {
        if self.displayed != Some(self.remaining) {
            self.displayed = Some(self.remaining);
            signals.push(CountdownSignal::Remaining(self.remaining));
        }
    }

    /// True if a tick at `now` would reach zero
    pub fn expires_by(&self, now: Instant) -> bool {
        match self.state {
            State::Running { start } => now >= start + self.spec.total(),
            _ => false,
        }
    }

    pub fn spec(&self) -> CountdownSpec {
        self.spec
    }

    pub fn mode(&self) -> CountdownMode {
        self.spec.mode
    }

    /// Whole seconds left as of the last tick (never negative)
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn alert_fired(&self) -> bool {
        self.alert_fired
    }

    pub fn phase(&self) -> CountdownPhase {
        match self.state {
            State::Idle => CountdownPhase::Idle,
            State::Running { .. } => CountdownPhase::Running,
            State::Holding { .. } => CountdownPhase::Holding,
            State::Held => CountdownPhase::Held,
            State::Rearming { .. } => CountdownPhase::Rearming,
        }
    }

    /// When the current cycle started
    pub fn started_at(&self) -> Option<Instant> {
        match self.state {
            State::Running { start } => Some(start),
            _ => None,
        }
    }

    pub fn set_hold(&mut self, hold: Duration) {
        self.hold = hold;
    }

    /// Delay before a Loop restarts after reaching zero
    pub fn set_rearm_delay(&mut self, delay: Duration) {
        self.rearm_delay = delay;
    }
}

fn ceil_seconds(d: Duration) -> u32 {
    let secs = d.as_nanos().div_ceil(1_000_000_000);
    u32::try_from(secs).unwrap_or(u32::MAX)
}
