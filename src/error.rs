//! Error types for the gateway.

use std::io;
use thiserror::Error;

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors that can occur while bridging PLC data to TCP clients.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The PLC driver reports no open connection.
    #[error("PLC not connected")]
    NotConnected,

    /// The PLC driver failed to open, read or write.
    #[error("Driver error: {reason}")]
    Driver {
        /// Description of the driver failure.
        reason: String,
    },

    /// Malformed or truncated wire data.
    #[error("Protocol error: {reason}")]
    Protocol {
        /// Description of the framing error.
        reason: String,
    },

    /// Invalid parameter provided.
    #[error("Invalid parameter '{parameter}': {reason}")]
    InvalidParameter {
        /// Name of the invalid parameter.
        parameter: String,
        /// Description of why the parameter is invalid.
        reason: String,
    },

    /// Missing or inconsistent startup configuration.
    #[error("Configuration error: {reason}")]
    Config {
        /// Description of the configuration problem.
        reason: String,
    },

    /// I/O error on a client socket or the listener.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl GatewayError {
    /// Creates a new `Driver` error.
    ///
    /// # Example
    ///
    /// ```
    /// use plc_gateway::GatewayError;
    ///
    /// let err = GatewayError::driver("connection refused");
    /// assert_eq!(err.to_string(), "Driver error: connection refused");
    /// ```
    pub fn driver(reason: impl Into<String>) -> Self {
        Self::Driver {
            reason: reason.into(),
        }
    }

    /// Creates a new `Protocol` error.
    ///
    /// # Example
    ///
    /// ```
    /// use plc_gateway::GatewayError;
    ///
    /// let err = GatewayError::protocol("buffer ends mid-command");
    /// ```
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    /// Creates a new `InvalidParameter` error.
    ///
    /// # Example
    ///
    /// ```
    /// use plc_gateway::GatewayError;
    ///
    /// let err = GatewayError::invalid_parameter("value", "expected int16, got bool");
    /// ```
    pub fn invalid_parameter(parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new `Config` error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Returns whether this error comes from losing the PLC connection
    /// rather than from bad input.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::NotConnected | Self::Driver { .. })
    }
}
