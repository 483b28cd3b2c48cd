//! Custom error types for the controller.
//!
//! `DaqError` is the single error type of the library. It separates failures by what the
//! caller can do about them:
//!
//! - **`CommunicationTimeout`**: no reply arrived within the query ceiling. This is never
//!   represented as an empty string; an empty reply and a missing reply are different
//!   outcomes.
//! - **`ProtocolDecode`**: a reply arrived but does not match the encoding of the
//!   setting's value domain (e.g. `"1.2X"` for a current).
//! - **`VerificationFailed`**: the read-back after a write disagrees with the requested
//!   value. Carries the setting name, the requested and the observed value.
//! - **`PreconditionFailed`**: the pre-run cross-check of mode / profile / sense failed.
//! - **`Io`**: transport failures other than a receive timeout. These are fatal for a
//!   running discharge test.
//!
//! Timeouts and decode errors are "recoverable" in the sense of
//! [`DaqError::is_recoverable`]: the discharge loop degrades them to a skipped cycle.

use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Every failure the crate reports.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Settings could not be loaded or extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Settings or arguments were rejected.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Socket or file failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No reply within the query ceiling.
    #[error("No reply to '{command}' after {attempts} attempt(s) in {elapsed_ms} ms")]
    CommunicationTimeout {
        /// Query as sent, without terminator.
        command: String,
        /// Frames sent, including the first.
        attempts: u32,
        /// Time spent before giving up.
        elapsed_ms: u128,
    },

    /// A reply that does not fit the setting's domain.
    #[error("Cannot decode reply {reply:?} for '{setting}': {reason}")]
    ProtocolDecode {
        /// Setting that was read.
        setting: String,
        /// Raw reply text.
        reply: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A write was not reflected by the read-back.
    #[error("Verification of '{setting}' failed: requested {requested}, device reports {observed}")]
    VerificationFailed {
        /// Setting that was written.
        setting: String,
        /// Value written.
        requested: String,
        /// Value read back.
        observed: String,
    },

    /// The instrument is not in the state a run needs.
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// `*IDN?` names another instrument.
    #[error("Unexpected instrument model: expected '{expected}', device identifies as {identity:?}")]
    WrongModel {
        /// Model the configuration asks for.
        expected: String,
        /// Identity the device reported.
        identity: String,
    },

    /// Operation called out of order.
    #[error("Operation '{operation}' is not valid in state {state}")]
    InvalidState {
        /// Operation that was refused.
        operation: &'static str,
        /// State at the time.
        state: String,
    },

    /// Nothing to export.
    #[error("Test session has no samples to export")]
    EmptySession,

    /// The export sink failed.
    #[error("Export error: {0}")]
    Export(String),
}

impl DaqError {
    /// True for failures that only invalidate a single read.
    ///
    /// A missed or garbled reply during polling is not evidence that the test should end.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DaqError::CommunicationTimeout { .. } | DaqError::ProtocolDecode { .. }
        )
    }

    pub(crate) fn decode(
        setting: impl Into<String>,
        reply: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        DaqError::ProtocolDecode {
            setting: setting.into(),
            reply: reply.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn verification(
        setting: impl Into<String>,
        requested: impl ToString,
        observed: impl ToString,
    ) -> Self {
        DaqError::VerificationFailed {
            setting: setting.into(),
            requested: requested.to_string(),
            observed: observed.to_string(),
        }
    }
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_and_decode_errors_are_recoverable() {
        let timeout = DaqError::CommunicationTimeout {
            command: ":MEAS:VOLT?".into(),
            attempts: 3,
            elapsed_ms: 3000,
        };
        assert!(timeout.is_recoverable());
        assert!(DaqError::decode("MEAS:VOLT", "abc", "not a number").is_recoverable());
    }

    #[test]
    fn io_and_verification_errors_are_fatal() {
        let io = DaqError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        assert!(!io.is_recoverable());
        assert!(!DaqError::verification("INP", true, false).is_recoverable());
        assert!(!DaqError::PreconditionFailed("mode".into()).is_recoverable());
    }

    #[test]
    fn verification_message_names_setting_and_values() {
        let err = DaqError::verification("CURR", "1.000", "0.500");
        let msg = err.to_string();
        assert!(msg.contains("CURR"));
        assert!(msg.contains("1.000"));
        assert!(msg.contains("0.500"));
    }

    #[test]
    fn timeout_message_is_distinct_from_empty_reply() {
        let err = DaqError::CommunicationTimeout {
            command: "*IDN?".into(),
            attempts: 3,
            elapsed_ms: 3001,
        };
        assert!(err.to_string().starts_with("No reply to '*IDN?'"));
    }
}
