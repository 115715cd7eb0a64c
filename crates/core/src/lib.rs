//! Skillsync Core Library
//!
//! Room codes, countdowns, settings and the action event model. Nothing in
//! here touches the network.

pub mod config;
pub mod countdown;
pub mod error;
pub mod event;
pub mod room_code;

pub use config::{ActionSettings, Settings, TransportKind, DEFAULT_PEER_PORT, DEFAULT_RELAY_PORT};
pub use countdown::{
    Countdown, CountdownBoard, CountdownKey, CountdownMode, CountdownPhase, CountdownSignal,
    CountdownSpec, CountdownView,
};
pub use error::{Error, Result, RoomCodeError};
pub use event::ActionEvent;
pub use room_code::RoomCode;
