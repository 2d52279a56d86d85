use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that may occur in this library.
///
/// Observer failures are stored inside the observer and later surfaced by
/// `await_done` / `result`, so the type is cloneable and comparable.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum Error {
    /// The observer did not reach a terminal state within its deadline.
    #[error("timed out after {elapsed:?} (allowed {allowed:?})")]
    Timeout {
        /// The timeout the observer was started with.
        allowed: Duration,
        /// Time measured from `start()` to the moment the timer fired,
        /// on the monotonic clock.
        elapsed: Duration,
    },

    /// The command's parser detected a negative pattern in the output.
    #[error("command `{command}` failed: {reason}")]
    CommandFailure {
        /// The CMD string that was put on the wire.
        command: String,
        /// What the parser objected to.
        reason: String,
    },

    /// Output was consumed but its structure was not recognized.
    #[error("could not parse output: {0}")]
    ParsingFailure(String),

    /// The transport closed while the observer was still running.
    #[error("connection `{0}` was lost")]
    ConnectionLost(String),

    /// `cancel()` was called; no result will ever be available.
    #[error("observer was cancelled")]
    Cancelled,

    /// `start()` called on an observer that already left the created state.
    #[error("observer was already started")]
    AlreadyStarted,

    /// The same observer was submitted to a runner twice.
    #[error("observer was already submitted to a runner")]
    AlreadySubmitted,

    /// `set_result` / `set_exception` called on a terminal observer.
    #[error("observer already reached a terminal state")]
    AlreadyDone,

    /// `result()` called before the observer reached a terminal state.
    #[error("no result available yet")]
    NotDone,

    /// A command/event was requested that is not registered for the
    /// device's current state.
    #[error("`{name}` is not registered for state `{state}`")]
    NotAllowed {
        /// The requested command/event name.
        name: String,
        /// The device state at the time of the request.
        state: String,
    },

    /// A device with this name already exists in the factory.
    #[error("device name `{0}` is already in use")]
    NameInUse(String),

    /// A hop command failed during `goto_state`.
    #[error("hop `{from}` -> `{to}` failed during {stage}: {source}")]
    HopFailure {
        /// State the hop started from.
        from: String,
        /// State the hop was meant to reach.
        to: String,
        /// Which part of the hop failed (e.g. "open", "command").
        stage: String,
        /// The underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// A worker caught an escaping panic or an impossible state.
    #[error("internal error: {0}")]
    InternalError(String),

    /// The configuration structure is inconsistent.
    #[error("bad configuration: {0}")]
    BadConfig(String),
}

impl Error {
    /// Unwrap the `BadConfig` message, if this is that variant.
    pub fn try_into_bad_config(self) -> Result<String, Self> {
        if let Self::BadConfig(msg) = self {
            Ok(msg)
        } else {
            Err(self)
        }
    }

    /// True for the `Timeout` variant.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// True for the `ConnectionLost` variant.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionLost(_))
    }
}
