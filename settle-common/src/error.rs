//! Error taxonomy shared by every checker.
//!
//! Timeouts and attempt exhaustion are deliberately absent here: they are
//! normal completions of the polling mechanism and only show up in a
//! result's `error` field. Everything in this module means the mechanism
//! itself could not do its job.

use std::fmt;

use thiserror::Error;

/// A typed configuration could not be built from its input.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The generic config map did not decode into the typed struct.
    #[error("{0}")]
    Decode(#[from] serde_json::Error),

    /// A field required by the selected mode was not provided.
    #[error("{field} is required")]
    Missing { field: &'static str },

    /// A field was provided with an unusable value.
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    /// The requested variant is not supported.
    #[error("unsupported {kind}: {value}")]
    Unsupported { kind: &'static str, value: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl fmt::Display) -> Self {
        Self::Invalid {
            field,
            reason: reason.to_string(),
        }
    }
}

/// Hard errors raised while running a checker.
#[derive(Debug, Error)]
pub enum CheckError {
    /// A connection, consumer or producer could not be opened.
    #[error("failed to {what}: {cause}")]
    Setup { what: &'static str, cause: String },

    /// The backend rejected an operation that retrying cannot fix.
    #[error("{0}")]
    Backend(String),

    /// The caller cancelled the operation.
    #[error("cancelled while waiting for condition")]
    Cancelled,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to encode JSON: {0}")]
    Encode(#[from] serde_json::Error),
}

impl CheckError {
    pub fn setup(what: &'static str, cause: impl fmt::Display) -> Self {
        Self::Setup {
            what,
            cause: cause.to_string(),
        }
    }

    pub fn backend(context: &str, cause: impl fmt::Display) -> Self {
        Self::Backend(format!("{context}: {cause}"))
    }
}

/// A hard error paired with the result that was populated up to the failure.
///
/// The result's `error` field carries the same message as `error`, so
/// callers can branch on either.
#[derive(Debug)]
pub struct CheckFailure<R> {
    pub result: R,
    pub error: CheckError,
}

impl<R> CheckFailure<R> {
    pub fn new(result: R, error: CheckError) -> Self {
        Self { result, error }
    }

    pub fn into_error(self) -> CheckError {
        self.error
    }
}

impl<R> fmt::Display for CheckFailure<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

impl<R: fmt::Debug> std::error::Error for CheckFailure<R> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        std::error::Error::source(&self.error)
    }
}

/// Errors surfaced through the [`crate::Action`] contract.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("invalid {action} config: {source}")]
    Config {
        action: &'static str,
        #[source]
        source: ConfigError,
    },

    #[error("{action} failed: {source}")]
    Check {
        action: &'static str,
        #[source]
        source: CheckError,
    },

    #[error("unknown action: {0}")]
    UnknownAction(String),
}

impl ActionError {
    /// Whether the failure happened before any backend was contacted.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::Config { .. }
                | Self::UnknownAction(_)
                | Self::Check {
                    source: CheckError::Config(_),
                    ..
                }
        )
    }
}
