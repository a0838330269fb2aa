//! Error types for sarathi
//!
//! # Error Recovery Strategies
//!
//! ## Link Errors (Driver-Recovered)
//!
//! - **`PortUnavailable`**: The serial device could not be opened. The stream
//!   supervisor retries with back-off; control commands fail until the port
//!   returns.
//! - **`WriteTimeout`**: A command write did not complete within the
//!   configured timeout. The link is marked degraded and the command can be
//!   retried by the caller.
//! - **`FramingExceeded`**: Ten consecutive resyncs without a checksum-valid
//!   frame. The stream supervisor reopens the port and re-issues the stream
//!   request.
//! - **`DecoderInconsistent`**: A checksum-valid frame contained a packet id
//!   the decoder has no layout for. The frame is dropped and counted like a
//!   resync.
//!
//! ## Terminal Errors
//!
//! - **`Closed`**: The driver has been shut down. Reported to callers;
//!   control sessions surface it and close the operator channel.
//!
//! ## Surface Errors (Log and Continue)
//!
//! - **`PlanInvalid`**: Malformed plan geometry. The load fails and the
//!   previous plan stays active.
//! - **`OperatorInvalid`**: A bad command payload. The single command is
//!   rejected with a reason; the channel stays open.
//! - **`SnapRejected`**: A fiducial result was unusable. Logged once per
//!   signature; odometry is unaffected.
//!
//! ## Configuration Errors (Fix and Restart)
//!
//! - **`Config`**: The configuration file is invalid.

use thiserror::Error;

/// Errors that can occur in sarathi
///
/// See module-level documentation for recovery strategies.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Serial port unavailable: {0}")]
    PortUnavailable(String),

    #[error("Write timed out")]
    WriteTimeout,

    #[error("Framing error threshold exceeded")]
    FramingExceeded,

    #[error("Decoder inconsistent: {0}")]
    DecoderInconsistent(String),

    #[error("Driver closed")]
    Closed,

    #[error("Invalid plan: {0}")]
    PlanInvalid(String),

    #[error("Invalid operator command: {0}")]
    OperatorInvalid(String),

    #[error("Snap rejected: {0}")]
    SnapRejected(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Mutex poisoned")]
    MutexPoisoned,

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the driver's stream supervisor may retry after this error.
    pub fn is_link_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Serial(_)
                | Error::Io(_)
                | Error::PortUnavailable(_)
                | Error::WriteTimeout
                | Error::FramingExceeded
                | Error::DecoderInconsistent(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
