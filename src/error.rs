//! Error types for TLU configuration and readout.
//!
//! `TluError` follows the failure taxonomy of the readout path:
//!
//! - **`Protocol`**: the I2C master reported arbitration lost, or the bus
//!   otherwise violated the transaction protocol. Fatal to the in-flight
//!   transaction; during a run it escalates to an orderly stop.
//! - **`Timeout`**: acknowledge/busy polling exceeded its retry bound, or the
//!   addressed device did not acknowledge. The operation is aborted and the
//!   partial result is carried in the error so the caller can decide whether
//!   to retry.
//! - **`Configuration`**: malformed trigger rule, out-of-range pulse-vector
//!   element or any other invalid configuration value. Always raised before
//!   the first hardware write.
//! - **`Bus`**: the register transport itself failed (unknown register name,
//!   transport down).
//!
//! Data-integrity anomalies (misaligned FIFO reads, event-number gaps) are not
//! errors. They are logged as warnings and counted in the run summary.

use thiserror::Error;

/// Result type alias for TLU operations.
pub type Result<T> = std::result::Result<T, TluError>;

/// Coarse classification of a [`TluError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bus protocol violation (arbitration lost).
    Protocol,
    /// Polling bound exceeded or device not acknowledging.
    Timeout,
    /// Invalid configuration value.
    Configuration,
    /// Register transport failure.
    Bus,
    /// Event sink failure.
    Sink,
    /// Background run task failed.
    Task,
    /// File or environment I/O.
    Io,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::Protocol => "protocol",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Bus => "bus",
            ErrorKind::Sink => "sink",
            ErrorKind::Task => "task",
            ErrorKind::Io => "io",
        };
        write!(f, "{}", label)
    }
}

/// Errors raised by the TLU core.
#[derive(Error, Debug)]
pub enum TluError {
    /// Arbitration lost on the I2C bus or another protocol fault.
    #[error("Protocol error on '{register}': {context}")]
    Protocol {
        /// Register the fault was observed on
        register: String,
        /// What the engine was doing at the time
        context: String,
    },

    /// Polling exceeded its retry bound or the device sent no acknowledge.
    ///
    /// `completed` counts the payload bytes that were transferred before the
    /// abort; `partial` holds any bytes read so far.
    #[error("Timeout during {operation}: {completed}/{requested} bytes completed")]
    Timeout {
        /// Operation that timed out, e.g. `"i2c write 0x13"`
        operation: String,
        /// Payload bytes completed before the abort
        completed: usize,
        /// Payload bytes requested
        requested: usize,
        /// Data read before the abort (empty for writes)
        partial: Vec<u8>,
    },

    /// Configuration rejected before any hardware write.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Register transport failure.
    #[error("Register bus error: {0}")]
    Bus(String),

    /// Event sink failure.
    #[error("Event sink error: {0}")]
    Sink(String),

    /// The run task panicked or was cancelled.
    #[error("Run task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// Configuration file could not be loaded or extracted.
    #[error("Configuration load error: {0}")]
    Config(#[from] figment::Error),

    /// I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TluError {
    /// Shorthand for a [`TluError::Configuration`] error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Shorthand for a [`TluError::Protocol`] error.
    pub fn protocol(register: impl Into<String>, context: impl Into<String>) -> Self {
        Self::Protocol {
            register: register.into(),
            context: context.into(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TluError::Protocol { .. } => ErrorKind::Protocol,
            TluError::Timeout { .. } => ErrorKind::Timeout,
            TluError::Configuration(_) | TluError::Config(_) => ErrorKind::Configuration,
            TluError::Bus(_) => ErrorKind::Bus,
            TluError::Sink(_) => ErrorKind::Sink,
            TluError::Task(_) => ErrorKind::Task,
            TluError::Io(_) => ErrorKind::Io,
        }
    }

    /// Whether this error must end an active run.
    pub fn is_fatal_to_run(&self) -> bool {
        matches!(self, TluError::Protocol { .. })
    }

    /// Number of payload bytes completed before a timeout, if this is one.
    pub fn completed_bytes(&self) -> Option<usize> {
        match self {
            TluError::Timeout { completed, .. } => Some(*completed),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TluError::Timeout {
            operation: "i2c write 0x13".to_string(),
            completed: 1,
            requested: 3,
            partial: Vec::new(),
        };
        let msg = err.to_string();
        assert!(msg.contains("0x13"));
        assert!(msg.contains("1/3"));
    }

    #[test]
    fn test_only_protocol_is_fatal() {
        assert!(TluError::protocol("i2c_master.i2c_cmdstatus", "address phase").is_fatal_to_run());
        assert!(!TluError::config("bad rule").is_fatal_to_run());
        assert!(!TluError::Bus("down".into()).is_fatal_to_run());
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(TluError::config("x").kind(), ErrorKind::Configuration);
        assert_eq!(ErrorKind::Timeout.to_string(), "timeout");
        assert_eq!(
            TluError::Timeout {
                operation: "x".into(),
                completed: 2,
                requested: 4,
                partial: vec![],
            }
            .completed_bytes(),
            Some(2)
        );
    }
}
