//! Polling relay transport
//!
//! For players who cannot reach each other directly. Everyone talks to a
//! hosted HTTP relay that keeps an ordered log per room.

pub mod client;
pub mod server;

pub use client::{mint_room_code, RelayClient, RelayTiming, RELAY_CODE_LEN};
pub use server::{router, RelayServer, SWEEP_INTERVAL};
