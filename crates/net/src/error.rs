//! Network error types

use std::io;

use skillsync_core::RoomCodeError;

/// Network result type
pub type Result<T> = std::result::Result<T, Error>;

/// Network errors
///
/// `MalformedFrame` and `PeerDisconnected` are routine: the first costs one
/// message, the second one member. Neither ends the room for anyone else.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Peer disconnected")]
    PeerDisconnected,

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Timed out connecting to {0}")]
    ConnectTimeout(String),

    #[error("Connection refused by {0}")]
    ConnectRefused(String),

    #[error("Invalid room code: {0}")]
    AddressDecode(#[from] RoomCodeError),

    #[error("Port mapping failed: {0}")]
    PortMappingFailed(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Relay error: {0}")]
    Relay(String),

    #[error("No relay server reachable")]
    RelayUnavailable,

    #[error("Not connected")]
    NotConnected,

    #[error("Room is full")]
    RoomFull,

    #[error("Room was disbanded")]
    RoomDisbanded,
}

impl Error {
    /// Map a connect failure to the join-role taxonomy
    pub(crate) fn from_connect(err: io::Error, target: impl Into<String>) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Error::ConnectRefused(target.into()),
            io::ErrorKind::TimedOut => Error::ConnectTimeout(target.into()),
            _ => Error::Io(err),
        }
    }
}
