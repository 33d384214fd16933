//! Error types for stmboot.

use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for stmboot operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for stmboot operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// GPIO chip or line could not be opened, read or written.
    #[error("GPIO resource error on {chip}{}: {message}", .line.map(|l| format!(":{l}")).unwrap_or_default())]
    Resource {
        /// Chip name the failure relates to.
        chip: String,
        /// Line offset, if the failure is line specific.
        line: Option<u32>,
        /// Underlying failure description.
        message: String,
    },

    /// Serial device could not be opened.
    #[error("Serial link unavailable: {0}")]
    LinkOpen(String),

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Mass erase was not acknowledged, even after re-syncing.
    #[error("Extended erase rejected by bootloader")]
    EraseRejected,

    /// A write block failed on every attempt.
    #[error("Write rejected at address 0x{address:08X}")]
    BlockWriteRejected {
        /// Address of the failing block.
        address: u32,
    },

    /// Operation cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// Firmware image cannot be flashed.
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// Another operation is already in flight on this link.
    #[error("Link busy: another operation is in progress")]
    Busy,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Build a [`Error::Resource`] for a specific line.
    pub fn resource(chip: &str, line: Option<u32>, message: impl fmt::Display) -> Self {
        Self::Resource {
            chip: chip.to_string(),
            line,
            message: message.to_string(),
        }
    }
}

/// Terminal reason for a failed bootloader operation.
///
/// Unlike [`Error`] this is `Copy`, so it can be stored in session state and
/// sent across threads in events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// Sync window or an ACK wait elapsed.
    Timeout,
    /// Extended erase failed twice.
    EraseRejected,
    /// Block at the given address failed twice.
    BlockWriteRejected(u32),
    /// Serial link could not be opened or is closed.
    LinkUnavailable,
    /// Firmware file could not be read.
    ImageUnreadable,
    /// Firmware image is empty or does not fit the address space.
    InvalidImage,
    /// Caller requested cancellation.
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::EraseRejected => write!(f, "erase rejected"),
            Self::BlockWriteRejected(addr) => write!(f, "write rejected @0x{addr:08X}"),
            Self::LinkUnavailable => write!(f, "link unavailable"),
            Self::ImageUnreadable => write!(f, "image unreadable"),
            Self::InvalidImage => write!(f, "invalid image"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl From<FailureReason> for Error {
    fn from(reason: FailureReason) -> Self {
        match reason {
            FailureReason::Timeout => Self::Timeout("no ACK from bootloader".into()),
            FailureReason::EraseRejected => Self::EraseRejected,
            FailureReason::BlockWriteRejected(address) => Self::BlockWriteRejected { address },
            FailureReason::LinkUnavailable => Self::LinkOpen("link is not open".into()),
            FailureReason::ImageUnreadable => {
                Self::InvalidImage("firmware file could not be read".into())
            },
            FailureReason::InvalidImage => Self::InvalidImage("image rejected".into()),
            FailureReason::Cancelled => Self::Cancelled,
        }
    }
}

impl Error {
    /// Map an error back onto the terminal reason reported to callers.
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            Self::EraseRejected => FailureReason::EraseRejected,
            Self::BlockWriteRejected { address } => FailureReason::BlockWriteRejected(*address),
            Self::Cancelled => FailureReason::Cancelled,
            Self::LinkOpen(_) => FailureReason::LinkUnavailable,
            Self::InvalidImage(_) => FailureReason::InvalidImage,
            Self::Io(_) => FailureReason::ImageUnreadable,
            _ => FailureReason::Timeout,
        }
    }
}
