//! Error kinds and their process exit codes.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PbmError {
    /// Bad command line input.
    #[error("{0}")]
    Input(String),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("got unknown database version: {0}")]
    UnknownSchemaVersion(i64),

    /// The url points at something that is missing or not a regular file.
    #[error("not a regular file: {}", .0.display())]
    NotARegularFile(PathBuf),

    #[error("dbus error: {0}")]
    Bus(#[from] zbus::Error),

    /// The player did not provide a property an operation needs.
    #[error("{0}")]
    MissingProperty(String),

    #[error("dbus connection closed")]
    BusClosed,

    /// The player command failed to produce a manageable player.
    #[error("{message}")]
    PlayerCmd { message: String, exit_code: i32 },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<zbus::fdo::Error> for PbmError {
    fn from(err: zbus::fdo::Error) -> Self {
        PbmError::Bus(zbus::Error::from(err))
    }
}

impl From<zbus::names::Error> for PbmError {
    fn from(err: zbus::names::Error) -> Self {
        PbmError::Bus(zbus::Error::from(err))
    }
}

impl From<zbus::zvariant::Error> for PbmError {
    fn from(err: zbus::zvariant::Error) -> Self {
        PbmError::Bus(zbus::Error::from(err))
    }
}

impl PbmError {
    pub fn player_cmd(message: impl Into<String>, exit_code: i32) -> Self {
        PbmError::PlayerCmd {
            message: message.into(),
            exit_code,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            PbmError::PlayerCmd { exit_code, .. } => *exit_code,
            _ => 1,
        }
    }
}
