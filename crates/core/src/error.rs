//! Error types for skillsync core

use thiserror::Error;

/// Room code decode failures
///
/// All of these are user-correctable: the caller should ask for the code
/// to be re-entered rather than abort anything.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoomCodeError {
    #[error("Room code is empty")]
    Empty,

    #[error("Room code address segment must be {expected} characters, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Room code contains invalid character '{0}'")]
    InvalidCharacter(char),

    #[error("Room code checksum mismatch")]
    InvalidChecksum,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Room code error: {0}")]
    RoomCode(#[from] RoomCodeError),

    #[error("Invalid countdown: {0}")]
    InvalidCountdown(String),

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config serialize error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
