//! Custom error types for the crate.
//!
//! This module defines the primary error type, `DaqError`, shared by the link layer,
//! the ITC503 client and the sampling worker. Using the `thiserror` crate, it keeps
//! the failure taxonomy in one place so every layer reports problems the same way.
//!
//! ## Error Hierarchy
//!
//! - **`Communication`**: The link failed (timeout, closed stream, transport fault).
//!   Transient; nothing in this crate retries. During sampling it aborts one tick only.
//! - **`Parse`**: The controller answered, but the reply was malformed. Non-retryable;
//!   also aborts the current tick.
//! - **`Rejected`**: The controller answered with `?` - it did not accept the command.
//! - **`Configuration`**: Semantic problems found before any I/O happens: unknown channel
//!   names, zero sampling interval, out-of-range setpoints.
//! - **`Lifecycle`**: Misuse of the worker state machine, e.g. starting a worker twice.
//! - **`Config`** / **`Io`**: Wrapped errors from `figment` and `std::io`.
//!
//! Construction-time and lifecycle errors propagate synchronously to the caller. Per-tick
//! errors never escape the sampling loop; see [`crate::measurement::worker`].

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for instrument access and sampling.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration file loading or extraction failed.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration or argument values are semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Standard I/O failure outside of an instrument exchange.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The instrument link failed to complete an exchange.
    #[error("Communication error on {link}: {message}")]
    Communication {
        /// Link name, e.g. the serial port path.
        link: String,
        /// What went wrong.
        message: String,
    },

    /// A reply could not be interpreted.
    #[error("Failed to parse reply {reply:?} to '{command}': {reason}")]
    Parse {
        /// Command that produced the reply.
        command: String,
        /// Raw reply text.
        reply: String,
        /// Why it was not accepted.
        reason: String,
    },

    /// The controller refused the command.
    #[error("Controller rejected command '{command}' (reply {reply:?})")]
    Rejected {
        /// Command that was refused.
        command: String,
        /// Raw reply text.
        reply: String,
    },

    /// The sampling worker was used outside its state machine.
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),
}

impl DaqError {
    /// Build a [`DaqError::Communication`] for the given link.
    pub fn communication(link: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Communication {
            link: link.into(),
            message: message.into(),
        }
    }

    /// Build a [`DaqError::Parse`] for a command/reply pair.
    pub fn parse(
        command: impl Into<String>,
        reply: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Parse {
            command: command.into(),
            reply: reply.into(),
            reason: reason.into(),
        }
    }

    /// Whether the link failed and the same exchange may succeed if repeated.
    ///
    /// Only [`DaqError::Communication`] qualifies. A malformed or refused reply
    /// will come back the same way.
    pub fn is_transient(&self) -> bool {
        matches!(self, DaqError::Communication { .. })
    }
}
