//! Crate-level error taxonomy.

use std::path::PathBuf;
use thiserror::Error;

use crate::protocol::frame::FrameError;
use crate::protocol::time::TimeError;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum JensenError {
    /// No usable USB backend on this host. Fatal; carries every path that
    /// was probed so the user can be told what to install.
    #[error("no usable USB backend found; probed: {attempted:?}")]
    BackendInit { attempted: Vec<PathBuf> },

    /// Device absent or could not be opened. Recoverable by retry or by
    /// fallback device selection.
    #[error(
        "could not connect to VID={vid:04X} PID={pid:04X}{}",
        if *fallback_tried { " (no fallback HiDock device attached either)" } else { "" }
    )]
    Connection {
        vid: u16,
        pid: u16,
        fallback_tried: bool,
    },

    /// Byte stream desynchronized or a body had an impossible shape.
    /// The session forces a device-state reset before any further command.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("command {command} timed out after {millis}ms")]
    Timeout { command: u16, millis: u64 },

    /// The device rejected the command outright (broken-pipe pattern),
    /// or the command is gated to a model family this device is not in.
    #[error("command {0} is not supported by this device")]
    UnsupportedCommand(u16),

    /// An exclusivity violation was attempted while an exchange was in
    /// flight.
    #[error("device is busy with another operation")]
    DeviceBusy,

    /// Commands known to destabilize the device are blocked unless
    /// `allow_destructive` is set.
    #[error("command {0} is blocked by default (set allow_destructive to send it)")]
    CommandBlocked(u16),

    #[error("session is not connected")]
    NotConnected,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<FrameError> for JensenError {
    fn from(e: FrameError) -> Self {
        JensenError::Protocol(e.to_string())
    }
}

impl From<TimeError> for JensenError {
    fn from(e: TimeError) -> Self {
        JensenError::Protocol(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, JensenError>;
