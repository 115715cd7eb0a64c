//! Skillsync Network Library
//!
//! Rooms and transports for sharing action events.
//!
//! # Architecture
//!
//! - **Server**: run by a peer-room host, accepts members over TCP
//! - **Client**: joins a peer room from its room code
//! - **Relay**: HTTP relay service and its polling client
//! - **Session**: one room membership over any of the above
//! - **Protocol**: newline-delimited JSON (peer) and JSON bodies (relay)
//!
//! # Usage
//!
//! ```ignore
//! let opts = SessionOptions::from_settings(&settings);
//! let mut session = Session::create_room(TransportKind::Direct, "alice", &opts).await?;
//! println!("Room code: {}", session.code());
//!
//! session.broadcast(ActionEvent::new("fireball", "alice")).await?;
//! while let Some(event) = session.try_next_event() {
//!     match event {
//!         SessionEvent::Action(event) => { /* arm countdown */ }
//!         _ => {}
//!     }
//! }
//! ```

pub mod client;
pub mod error;
mod frame;
pub mod nat;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;

pub use client::Client;
pub use error::{Error, Result};
pub use protocol::{RelayEnvelope, RelayRequest, WireMessage};
pub use registry::{PeerRoom, RelayRegistry};
pub use relay::{RelayClient, RelayServer, RelayTiming};
pub use server::HostServer;
pub use session::{CloseReason, Session, SessionEvent, SessionOptions};
