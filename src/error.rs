//! Error taxonomy for the verification client.
//!
//! `approve` never surfaces these: every variant maps to an [`Information`] status through
//! `status()`. Operations that must distinguish "could not proceed" from "proceeded, not
//! authenticated" (`upgrade`, `logout`, `get_access_token`) return [`ClientError`].

use std::fmt;
use std::time::Duration;

use crate::model::{AuthenticationInformation, Information};

/// Cap the number of stored failures inside `RetryExhausted` to avoid unbounded growth.
pub const MAX_RETRY_FAILURES: usize = 10;

/// Invalid or missing settings. Fatal for the call, never retried.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("no authority address configured")]
    NoAuthority,
    #[error("unknown transport: {0}")]
    UnknownTransport(String),
    #[error("unknown balance strategy: {0}")]
    UnknownBalance(String),
    #[error("unsupported cipher: {0}")]
    UnsupportedCipher(String),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("payload of {size} bytes exceeds the {limit}-byte packet budget")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("failed to load configuration: {0}")]
    Load(String),
}

/// Envelope sealing or opening failed.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("signature mismatch")]
    Signature,
    #[error("access key mismatch")]
    AccessKey,
    #[error("response serial mismatch: expected {expected}, got {actual}")]
    SerialMismatch { expected: String, actual: String },
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("request was not sealed")]
    Unsealed,
}

/// The round trip to the authority failed before a verdict was read.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportError {
    #[error("authority unreachable: {0}")]
    Unreachable(String),
    #[error("{phase} timed out after {timeout:?}")]
    Timeout { phase: &'static str, timeout: Duration },
    #[error("authority answered with status {0}")]
    Status(u16),
    #[error("empty reply from authority")]
    EmptyReply,
    #[error("i/o failure: {0}")]
    Io(String),
    #[error("malformed frame: {0}")]
    Frame(String),
    #[error("connection closed by authority")]
    Closed,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl TransportError {
    /// Status reported when this failure ends a call.
    pub fn status(&self) -> Information {
        match self {
            TransportError::Unreachable(_) | TransportError::EmptyReply => {
                Information::ServerNotFound
            }
            TransportError::Status(code) if (400..600).contains(code) => {
                Information::ServerNotFound
            }
            _ => Information::ServerError,
        }
    }

    /// Configuration problems surface through transports but never count against the authority.
    pub fn is_config(&self) -> bool {
        matches!(self, TransportError::Config(_))
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionRefused | ErrorKind::AddrNotAvailable | ErrorKind::NotFound => {
                TransportError::Unreachable(err.to_string())
            }
            ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::BrokenPipe => {
                TransportError::Closed
            }
            _ => TransportError::Io(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            TransportError::Unreachable(err.to_string())
        } else if err.is_timeout() {
            TransportError::Timeout { phase: "http request", timeout: Duration::ZERO }
        } else if let Some(status) = err.status() {
            TransportError::Status(status.as_u16())
        } else if err.is_decode() {
            TransportError::Codec(CodecError::Malformed(err.to_string()))
        } else {
            TransportError::Io(err.to_string())
        }
    }
}

/// Typed failure for the operations that do not fold errors into a status.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ClientError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),
    #[error("authority unavailable ({status}): {message}")]
    Transport { status: Information, message: String },
    #[error("credential rejected ({status}): {message}")]
    Credential { status: Information, message: String },
    #[error("protocol error ({status}): {message}")]
    Protocol { status: Information, message: String },
}

impl ClientError {
    /// Classifies a non-`OK` result.
    pub fn from_information(info: &AuthenticationInformation) -> Self {
        let status = info.status();
        let message = info.message().to_string();
        match status {
            Information::NoAuth | Information::AuthenticationFailure => {
                ClientError::Credential { status, message }
            }
            Information::ServerError | Information::ServerNotFound => {
                ClientError::Transport { status, message }
            }
            _ => ClientError::Protocol { status, message },
        }
    }

    pub fn status(&self) -> Information {
        match self {
            ClientError::Configuration(_) => Information::ServerError,
            ClientError::Transport { status, .. }
            | ClientError::Credential { status, .. }
            | ClientError::Protocol { status, .. } => *status,
        }
    }
}

/// Outcome of a call that went through the resilience wrapper.
#[derive(Debug, Clone)]
pub enum ResilienceError<E> {
    /// The circuit breaker is open
    CircuitOpen { failure_count: usize, open_duration: Duration },
    /// All retry attempts were exhausted
    RetryExhausted { attempts: usize, failures: Vec<E> },
    /// The underlying operation failed
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CircuitOpen { failure_count, open_duration } => write!(
                f,
                "circuit breaker open ({} failures, open for {:?})",
                failure_count, open_duration
            ),
            Self::RetryExhausted { attempts, failures } => match failures.last() {
                Some(last) => {
                    write!(f, "retry exhausted after {} attempts; last error: {}", attempts, last)
                }
                None => write!(f, "retry exhausted after {} attempts", attempts),
            },
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RetryExhausted { failures, .. } => {
                failures.last().map(|e| e as &dyn std::error::Error)
            }
            _ => None,
        }
    }
}

impl<E> ResilienceError<E> {
    /// Keeps only the most recent `MAX_RETRY_FAILURES` failures.
    pub fn retry_exhausted(attempts: usize, mut failures: Vec<E>) -> Self {
        if failures.len() > MAX_RETRY_FAILURES {
            failures.drain(..failures.len() - MAX_RETRY_FAILURES);
        }
        ResilienceError::RetryExhausted { attempts, failures }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }

    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// The failure that ended the call: the inner error, or the last retry failure.
    pub fn last_failure(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RetryExhausted { failures, .. } => failures.last(),
            Self::CircuitOpen { .. } => None,
        }
    }
}
