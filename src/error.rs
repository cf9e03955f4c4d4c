//! Error types for the sweep coordination core.
//!
//! Two layers are distinguished on purpose:
//!
//! - [`ChannelError`] is the transport-level result of a single channel
//!   operation. A `Timeout` is ordinary during a drain loop ("no new data
//!   yet") and is retried; an `Io` failure is fatal to the segment in
//!   progress.
//! - [`SweepError`] is the application taxonomy everything above the channel
//!   speaks: planner input rejection, cooperative cancellation, session
//!   arbitration refusals, configuration problems.
//!
//! Cancellation is modelled as an error variant so it propagates through `?`
//! like any other early exit, but callers treat it as a terminal *outcome*,
//! not a failure.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the sweep error type.
pub type SweepResult<T> = std::result::Result<T, SweepError>;

/// Failure of a single channel operation.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// No complete line arrived within the current read timeout.
    #[error("channel read timed out after {0:?}")]
    Timeout(Duration),

    /// The transport failed. The command/response pairing on the line can no
    /// longer be trusted.
    #[error("channel I/O failure: {0}")]
    Io(String),
}

impl ChannelError {
    /// True when this error is the recoverable "no data yet" case.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ChannelError::Timeout(_))
    }
}

impl From<std::io::Error> for ChannelError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::TimedOut {
            ChannelError::Timeout(Duration::ZERO)
        } else {
            ChannelError::Io(err.to_string())
        }
    }
}

/// Application-level error taxonomy.
#[derive(Error, Debug)]
pub enum SweepError {
    /// A channel operation failed.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The shared cancellation token was set while an operation was in
    /// flight.
    #[error("sweep cancelled")]
    Cancelled,

    /// Sweep parameters were rejected before any channel I/O took place.
    #[error("invalid sweep parameters: {0}")]
    PlannerInput(String),

    /// The channel is owned by the other side of the session; the request
    /// was rejected rather than queued.
    #[error("instrument busy: {0}")]
    InstrumentBusy(String),

    /// A channel handed back to the arbiter failed its health probe.
    #[error("instrument session lost: {0}")]
    SessionLost(String),

    /// A command template failed to render.
    #[error("command template error: {0}")]
    CommandTemplate(#[from] strfmt::FmtError),

    /// The sweep worker thread could not be spawned.
    #[error("worker thread error: {0}")]
    Worker(String),

    /// Configuration extraction failed.
    #[error("configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration parsed but held an invalid value.
    #[error("configuration validation error: {0}")]
    ConfigValidation(String),
}

impl SweepError {
    /// True when the error represents user-initiated cancellation rather
    /// than a genuine failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SweepError::Cancelled)
    }

    /// True when the underlying cause is a hard channel I/O failure.
    pub fn is_channel_io(&self) -> bool {
        matches!(self, SweepError::Channel(ChannelError::Io(_)))
    }
}
