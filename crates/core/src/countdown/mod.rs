//! Drift-free action countdowns

mod board;
mod engine;

pub use board::{CountdownBoard, CountdownKey, CountdownView, LOOP_JITTER_THRESHOLD};
pub use engine::{
    Countdown, CountdownMode, CountdownPhase, CountdownSignal, CountdownSpec, DEFAULT_HOLD,
};
