// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Runtime error type.
//!
//! Correctness depends on every endpoint reaching the same global state, so most
//! variants are fatal: the endpoint that observes one raises a run-wide abort
//! before the error propagates (see [`Error::is_fatal`]).

use std::fmt;
use std::io;

use crate::marshal::MarshalError;
use crate::registry::Handle;
use crate::request::OpId;
use crate::EndpointId;

/// RMI runtime error.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Marshaling
    // ========================================================================
    /// Packed size exceeds the carrier ceiling.
    PayloadTooLarge { size: usize, capacity: usize },
    /// Reply carrier too small. Handled inside dispatch by growing the carrier.
    NeedsLargerBuffer { required: usize, capacity: usize },
    /// Malformed bytes or a short buffer.
    Marshal(MarshalError),

    // ========================================================================
    // Dispatch
    // ========================================================================
    /// Recursive drain exceeded the configured depth.
    NestingOverflow { depth: usize, max: usize },
    /// Handle not registered on the target endpoint.
    InvalidHandle { endpoint: EndpointId, handle: Handle },
    /// Operation selector unknown to the target's method table.
    UnknownOperation { handle: Handle, op: OpId },
    /// Registered object is not of the type the call expected.
    TypeMismatch { handle: Handle, expected: &'static str },
    /// Endpoint id outside the run.
    InvalidEndpoint { endpoint: EndpointId, endpoints: usize },

    // ========================================================================
    // Coordination
    // ========================================================================
    /// Fence iteration cap exceeded or fence messages out of step.
    FenceProtocolError { reason: String },
    /// Transport could not deliver or receive.
    TransportFailure { reason: String },
    /// Another endpoint aborted the run.
    Aborted { origin: EndpointId, reason: String },
    /// Underlying I/O error.
    Io(io::Error),
    /// Invalid configuration or launcher misuse.
    Config { reason: String },
}

impl Error {
    /// Whether this error must abort the whole run.
    ///
    /// `Aborted` is reported as non-fatal since the abort is already in progress.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::PayloadTooLarge { .. }
                | Error::NeedsLargerBuffer { .. }
                | Error::InvalidEndpoint { .. }
                | Error::Config { .. }
                | Error::Aborted { .. }
        )
    }

    pub(crate) fn transport(reason: impl Into<String>) -> Self {
        Error::TransportFailure {
            reason: reason.into(),
        }
    }

    pub(crate) fn fence(reason: impl Into<String>) -> Self {
        Error::FenceProtocolError {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::PayloadTooLarge { size, capacity } => write!(
                f,
                "payload too large: {} bytes (capacity {})",
                size, capacity
            ),
            Error::NeedsLargerBuffer { required, capacity } => write!(
                f,
                "reply needs {} bytes, carrier holds {}",
                required, capacity
            ),
            Error::Marshal(e) => write!(f, "marshal error: {}", e),
            Error::NestingOverflow { depth, max } => {
                write!(f, "nested dispatch depth {} exceeds {}", depth, max)
            }
            Error::InvalidHandle { endpoint, handle } => {
                write!(f, "invalid handle {} on endpoint {}", handle, endpoint)
            }
            Error::UnknownOperation { handle, op } => {
                write!(f, "unknown operation {} for handle {}", op, handle)
            }
            Error::TypeMismatch { handle, expected } => {
                write!(f, "handle {} is not a {}", handle, expected)
            }
            Error::InvalidEndpoint {
                endpoint,
                endpoints,
            } => write!(
                f,
                "endpoint {} out of range (run has {} endpoints)",
                endpoint, endpoints
            ),
            Error::FenceProtocolError { reason } => write!(f, "fence protocol error: {}", reason),
            Error::TransportFailure { reason } => write!(f, "transport failure: {}", reason),
            Error::Aborted { origin, reason } => {
                write!(f, "run aborted by endpoint {}: {}", origin, reason)
            }
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Config { reason } => write!(f, "configuration error: {}", reason),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Marshal(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<MarshalError> for Error {
    fn from(e: MarshalError) -> Self {
        Error::Marshal(e)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(!Error::PayloadTooLarge {
            size: 10,
            capacity: 5
        }
        .is_fatal());
        assert!(!Error::Aborted {
            origin: 1,
            reason: "x".into()
        }
        .is_fatal());
        assert!(Error::NestingOverflow { depth: 65, max: 64 }.is_fatal());
        assert!(Error::InvalidHandle {
            endpoint: 0,
            handle: Handle::new(3)
        }
        .is_fatal());
        assert!(Error::fence("stuck").is_fatal());
        assert!(Error::transport("closed").is_fatal());
    }

    #[test]
    fn test_display_variants() {
        let err = Error::PayloadTooLarge {
            size: 2048,
            capacity: 1024,
        };
        assert_eq!(
            err.to_string(),
            "payload too large: 2048 bytes (capacity 1024)"
        );

        let err = Error::InvalidHandle {
            endpoint: 2,
            handle: Handle::new(7),
        };
        assert_eq!(err.to_string(), "invalid handle 7 on endpoint 2");

        let err = Error::Aborted {
            origin: 3,
            reason: "fence protocol error: stuck".into(),
        };
        assert_eq!(
            err.to_string(),
            "run aborted by endpoint 3: fence protocol error: stuck"
        );
    }

    #[test]
    fn test_marshal_error_converts() {
        let err: Error = MarshalError::InvalidData {
            reason: "bad bool".into(),
        }
        .into();
        assert!(matches!(err, Error::Marshal(_)));
        assert!(err.is_fatal());
        assert!(std::error::Error::source(&err).is_some());
    }
}
