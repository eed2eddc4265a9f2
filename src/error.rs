//! Custom error types for the console.
//!
//! Every public operation of the console core resolves to a value or a
//! [`ConsoleError`]; nothing in this layer is fatal. Using the `thiserror`
//! crate, the errors are split along the lines the operator cares about:
//!
//! - **`Validation`**: caller-side problems (bad port, empty parameter set,
//!   out-of-range mixer settings). These are detected locally and are never
//!   sent to the backend. Several rule violations can be reported at once.
//! - **`Transport`**: the backend could not be reached, timed out, or failed
//!   with a 5xx. Presented as "backend unavailable" so the operator is not led
//!   to believe the instrument itself refused the request.
//! - **`Domain`**: the backend answered with `success: false` and a reason,
//!   e.g. the device refused a route.
//! - **`Busy`** / **`InvalidState`**: the local state machine rejected the
//!   request (a second connect while connecting, stop with no run, ...).
//!
//! By using `#[from]`, `ConsoleError` can be created from the underlying
//! error types with the `?` operator.

use crate::config::ConfigError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the console error type.
pub type ConsoleResult<T> = std::result::Result<T, ConsoleError>;

/// A single caller-side rule violation.
///
/// `OutOfRange` is the range error produced by the command builders.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("{field} = {value} is out of range (allowed: {allowed})")]
    OutOfRange {
        field: &'static str,
        value: String,
        allowed: String,
    },

    #[error("RF, IF and LO ports must be distinct (got {ports:?})")]
    PortsNotDistinct { ports: [u8; 3] },

    #[error("no measurement parameters selected")]
    EmptyParameterSet,

    #[error("no measurement results to export")]
    NothingToExport,

    #[error("parameter {parameter} does not belong to the {mode} measurement mode")]
    ParameterNotInMode { parameter: String, mode: String },

    #[error("start frequency {start} MHz must be below stop frequency {stop} MHz")]
    InvertedSweep { start: f64, stop: f64 },

    #[error("unknown VNA device '{0}'")]
    UnknownDevice(String),

    #[error("device {0} does not support mixer measurements")]
    MixerUnsupported(String),

    #[error("mixer configuration is for {expected} but the device needs {actual}")]
    MixerVariantMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("malformed command: {0}")]
    MalformedCommand(String),

    #[error("{0} must not be empty")]
    MissingField(&'static str),
}

/// All rule violations found in one validation pass.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl ValidationErrors {
    /// Returns `Ok(())` when no violation was collected.
    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }

    pub fn push(&mut self, error: ValidationError) {
        self.0.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ValidationError> {
        self.0.iter()
    }

    pub fn contains(&self, error: &ValidationError) -> bool {
        self.0.contains(error)
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, error) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

impl From<ValidationError> for ValidationErrors {
    fn from(error: ValidationError) -> Self {
        Self(vec![error])
    }
}

/// Failures reaching the backend device-control service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("backend unreachable: {0}")]
    Unreachable(String),

    #[error("backend returned HTTP {status}: {message}")]
    Server { status: u16, message: String },

    #[error("malformed backend response: {0}")]
    Decode(String),
}

/// Primary error type of the console core.
#[derive(Error, Debug)]
pub enum ConsoleError {
    #[error("validation failed: {0}")]
    Validation(ValidationErrors),

    #[error("backend unavailable: {0}")]
    Transport(#[from] TransportError),

    #[error("device rejected request: {message}")]
    Domain { message: String },

    #[error("operation rejected: {0}")]
    Busy(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ConsoleError {
    /// Whether this error means the backend service itself is unavailable.
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, ConsoleError::Transport(_))
    }

    /// The collected rule violations, if this is a validation failure.
    pub fn validation_errors(&self) -> Option<&ValidationErrors> {
        match self {
            ConsoleError::Validation(errors) => Some(errors),
            _ => None,
        }
    }

    pub(crate) fn domain(message: impl Into<String>) -> Self {
        ConsoleError::Domain {
            message: message.into(),
        }
    }
}

impl From<ValidationError> for ConsoleError {
    fn from(error: ValidationError) -> Self {
        ConsoleError::Validation(error.into())
    }
}

impl From<ValidationErrors> for ConsoleError {
    fn from(errors: ValidationErrors) -> Self {
        ConsoleError::Validation(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConsoleError::domain("NAK");
        assert_eq!(err.to_string(), "device rejected request: NAK");
    }

    #[test]
    fn test_validation_errors_join() {
        let mut errors = ValidationErrors::default();
        errors.push(ValidationError::PortsNotDistinct { ports: [1, 1, 2] });
        errors.push(ValidationError::EmptyParameterSet);
        let err = ConsoleError::from(errors);
        assert_eq!(
            err.to_string(),
            "validation failed: RF, IF and LO ports must be distinct (got [1, 1, 2]); \
             no measurement parameters selected"
        );
        assert_eq!(err.validation_errors().map(ValidationErrors::len), Some(2));
    }

    #[test]
    fn test_transport_is_backend_unavailable() {
        let err = ConsoleError::from(TransportError::Timeout(Duration::from_secs(30)));
        assert!(err.is_backend_unavailable());
        assert!(!ConsoleError::domain("refused").is_backend_unavailable());
    }

    #[test]
    fn test_empty_errors_into_ok() {
        assert!(ValidationErrors::default().into_result().is_ok());
    }
}
