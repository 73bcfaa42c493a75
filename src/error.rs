//! Custom error types for the pulse ingestion pipeline.
//!
//! This module defines the primary error type, `PulseError`, for the entire crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to
//! handle the different kinds of errors that can occur, from serial transport
//! faults to persistence-layer failures.
//!
//! ## Error Hierarchy
//!
//! `PulseError` consolidates the crate's error sources:
//!
//! - **`Config`**: Wraps errors from the `config` crate, typically file parsing
//!   or format issues in a TOML configuration file.
//! - **`Configuration`**: Semantic errors in configuration or API usage that pass
//!   parsing but are logically incorrect (e.g. calling `start` before
//!   `initialize`). These are contract violations, not transient faults.
//! - **`Io`**: Wraps standard `std::io::Error`, covering transport and file I/O.
//! - **`Serial`**: Wraps `tokio_serial::Error` from port enumeration and opening.
//! - **`Store`**: Persistence-layer failures. These are never propagated to the
//!   credit emission path; the orchestrator absorbs them into its retry queue.
//!
//! By using `#[from]`, `PulseError` can be seamlessly created from underlying
//! error types, simplifying error handling throughout the crate with the `?`
//! operator.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type PulseResult<T> = std::result::Result<T, PulseError>;

/// Primary error type for the pulse ingestion pipeline.
///
/// # Error Categories
///
/// Errors fall into three broad categories:
///
/// 1. **Configuration / contract errors** - `Config`, `Configuration`,
///    `InvalidPortName`, `PortAlreadyActive`
///    - Reported synchronously to the caller; never retried or swallowed.
///
/// 2. **Transport errors** - `Io`, `Serial`
///    - Timeouts are expected and recovered by polling; a closed transport
///      terminates the read loop cleanly; other I/O faults are logged and
///      retried after a brief backoff.
///
/// 3. **Persistence errors** - `Store`
///    - Recovered via the bounded retry queue; a full queue is the one
///      documented point where durability is knowingly sacrificed.
#[derive(Error, Debug)]
pub enum PulseError {
    /// Configuration file parsing failed.
    ///
    /// Occurs when loading a TOML configuration file that has syntax errors,
    /// missing required fields, or type mismatches.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Configuration or API-contract validation failed.
    ///
    /// Occurs when values parse correctly but fail semantic validation, or when
    /// an operation is invoked in a state that does not permit it. These are
    /// programming errors, not transient faults.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Standard I/O operation failed.
    ///
    /// Covers transport reads/writes and ledger file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port enumeration or opening failed.
    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// Persistence operation failed.
    ///
    /// The orchestrator never lets this reach the credit emission path; failed
    /// saves are absorbed into the bounded retry queue instead.
    #[error("Store error: {0}")]
    Store(String),

    /// `start` was called with an empty or blank port name.
    ///
    /// A contract violation reported synchronously to the caller.
    #[error("Port name must not be empty")]
    InvalidPortName,

    /// `start` was called while another port is already active.
    ///
    /// The pipeline handles exactly one active port at a time; stop the
    /// current session before starting another.
    #[error("Port '{port}' is already active")]
    PortAlreadyActive {
        /// Name of the port currently being read.
        port: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PulseError::Store("ledger write failed".to_string());
        assert_eq!(err.to_string(), "Store error: ledger write failed");
    }

    #[test]
    fn test_port_already_active_display() {
        let err = PulseError::PortAlreadyActive {
            port: "/dev/ttyACM0".to_string(),
        };
        assert!(err.to_string().contains("/dev/ttyACM0"));
    }
}
