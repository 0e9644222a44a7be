use std::sync::Arc;

use thiserror::Error;

use crate::issuer::IssueError;

/// An error obtaining a valid access token
///
/// A single refresh outcome is handed to every caller waiting on it, so this
/// type is cheaply cloneable.
#[derive(Clone, Debug, Error)]
pub enum TokenError {
    /// The issuer could not be reached or did not answer properly in time
    #[error("credential issuer unavailable")]
    IssuerUnavailable(#[source] Arc<IssueError>),
    /// The issuer answered with an application-level error code
    #[error("credential issuer rejected the request with code {code}: {message}")]
    IssuerRejected {
        /// The issuer's error code
        code: i64,
        /// The issuer's error message
        message: String,
    },
    /// The caller stopped waiting, or the token server shut down
    #[error("wait for an access token was canceled")]
    Canceled,
    /// The token configuration cannot work as given
    #[error("invalid token configuration: {0}")]
    ConfigurationInvalid(String),
}

impl TokenError {
    pub(crate) fn invalid_config(reason: impl Into<String>) -> Self {
        Self::ConfigurationInvalid(reason.into())
    }

    /// Whether retrying later could reasonably succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::IssuerUnavailable(_))
    }
}

impl From<IssueError> for TokenError {
    fn from(error: IssueError) -> Self {
        match error {
            IssueError::Rejected { code, message } => Self::IssuerRejected { code, message },
            other => Self::IssuerUnavailable(Arc::new(other)),
        }
    }
}
