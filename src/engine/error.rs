//! Error types for the output backend.
//!
//! Two layers:
//! - [`NativeError`]: status reported by the platform binding (the "native code").
//! - [`StreamError`]: what the backend hands back to the host engine. Every
//!   lifecycle or transition failure is logged with the native status text and
//!   returned, never retried, except a disconnect which goes through recovery.

use std::time::Duration;

use crate::engine::clock::StreamState;
use crate::engine::output::transition::Transition;

/// Status reported by the native audio platform.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NativeError {
    /// The device backing the stream is gone.
    #[error("device disconnected")]
    Disconnected,

    /// A wait elapsed without the stream changing state.
    #[error("timed out")]
    Timeout,

    /// The request is not legal in the stream's current state.
    #[error("illegal in state {0:?}")]
    InvalidState(StreamState),

    /// A parameter was outside the range the device accepts.
    #[error("value out of range")]
    OutOfRange,

    /// No output device could be found.
    #[error("no output device available")]
    NoDevice,

    /// The platform does not support the request.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Any other platform failure, with its text.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result alias for calls into the platform binding.
pub type NativeResult<T> = std::result::Result<T, NativeError>;

/// Errors returned to the host engine by the backend.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The stream builder could not be allocated.
    #[error("failed to create stream builder: {0}")]
    Builder(#[source] NativeError),

    /// Opening the stream failed.
    #[error("failed to open the stream: {0}")]
    Open(#[source] NativeError),

    /// Closing the stream failed. The handle is released regardless.
    #[error("failed to close the stream: {0}")]
    Close(#[source] NativeError),

    /// Deleting the stream builder failed.
    #[error("failed to delete stream builder: {0}")]
    Delete(#[source] NativeError),

    /// The hardware rejected a start/pause/stop/flush request.
    #[error("failed to {transition} the stream: {source}")]
    Transition {
        /// The rejected request.
        transition: Transition,
        /// Native status.
        #[source]
        source: NativeError,
    },

    /// A blocking transition did not reach its target state in time.
    #[error("timed out after {waited:?} waiting for {target:?} (last seen {last:?})")]
    Timeout {
        /// State the caller was waiting for.
        target: StreamState,
        /// Last state the hardware reported.
        last: StreamState,
        /// Accumulated wait.
        waited: Duration,
    },

    /// The wait primitive itself failed with a non-timeout status.
    #[error("failed waiting for {target:?}: {source}")]
    Wait {
        /// State the caller was waiting for.
        target: StreamState,
        /// Native status.
        #[source]
        source: NativeError,
    },

    /// The device was removed while a request was in flight.
    #[error("device disconnected")]
    Disconnected,

    /// A stream is already open; destroy it before creating another.
    #[error("a stream is already open")]
    AlreadyOpen,

    /// No stream is open.
    #[error("no stream is open")]
    NotOpen,
}

impl StreamError {
    /// Wraps a rejected transition request, lifting disconnects to their own variant.
    pub fn transition(transition: Transition, source: NativeError) -> Self {
        match source {
            NativeError::Disconnected => Self::Disconnected,
            source => Self::Transition { transition, source },
        }
    }

    /// Returns `true` for failures caused by the device going away.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::Disconnected
                | Self::Open(NativeError::Disconnected)
                | Self::Wait {
                    source: NativeError::Disconnected,
                    ..
                }
        )
    }
}

/// Result alias for backend operations.
pub type Result<T> = std::result::Result<T, StreamError>;
