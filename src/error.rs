//! Error types for the XMODEM engine.

use std::io;
use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type returned by the engine's public entry points.
///
/// Recoverable protocol hiccups (a bad checksum, an out-of-sequence block,
/// a single missed timeout) never reach this enum — they are handled
/// internally via NAK/retry and only show up in the log. Only conditions
/// that end a transfer, or that reject a call outright, are represented
/// here.
#[derive(Debug, Error)]
pub enum Error {
    /// `start_receive`/`start_send` called while a transfer is already in
    /// progress.
    #[error("a transfer is already in progress")]
    AlreadyActive,

    /// The destination could not be opened, created, or is not writable.
    #[error("sink unavailable: {0}")]
    SinkUnavailable(String),

    /// The source file is missing, not a regular file, or unreadable.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// The source file contains zero bytes.
    #[error("source file is empty; XMODEM has no defined empty-file encoding")]
    EmptySource,

    /// A transport send or sink write failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A retry counter (block or EOT) reached its configured maximum.
    #[error("retry limit exhausted after {attempts} attempts")]
    RetryExhausted {
        /// Number of attempts made before giving up.
        attempts: u32,
    },

    /// A received block number was neither the expected nor the previous
    /// one.
    #[error("protocol violation: unexpected block number {got} (expected {expected})")]
    ProtocolViolation {
        /// Block number actually received.
        got: u8,
        /// Block number the receiver was expecting.
        expected: u8,
    },

    /// The remote end sent CAN, cancelling the transfer.
    #[error("transfer cancelled by remote")]
    RemoteCancelled,

    /// The receiver exhausted its initiation retries without a first
    /// block arriving.
    #[error("timed out waiting for the sender to start")]
    RemoteInitiationTimeout,

    /// The sender exhausted its initiation retries without NAK/'C'
    /// arriving from the receiver.
    #[error("timed out waiting for the receiver to start")]
    LocalInitiationTimeout,
}

/// Reason a single received block failed validation.
///
/// Never surfaces through [`Error`] — `handle_block_error` always responds
/// with NAK/retry — but is logged so the cause of a retry is visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockError {
    /// `blk + !blk != 0xFF`.
    ComplementMismatch,
    /// Checksum or CRC did not match the payload.
    IntegrityMismatch,
    /// The frame was shorter than the block length implied by the mode.
    Truncated,
}

impl std::fmt::Display for BlockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ComplementMismatch => write!(f, "block number complement mismatch"),
            Self::IntegrityMismatch => write!(f, "checksum/CRC mismatch"),
            Self::Truncated => write!(f, "frame shorter than expected block length"),
        }
    }
}
