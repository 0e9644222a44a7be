//! Credential issuers
//!
//! An issuer exchanges the application's identity for a fresh access token and
//! reports how long that token will live. The refresh coordinator treats the
//! exchange as one opaque operation.

use std::{error, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use wxtoken_clock::DurationSecs;

use crate::AccessToken;

#[cfg(feature = "wechat")]
pub mod dto;
#[cfg(feature = "wechat")]
pub mod wechat;

#[cfg(feature = "wechat")]
pub use wechat::{Endpoint, WeChatIssuer};

/// A freshly issued access token and its time-to-live
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuedCredential {
    /// The access token
    pub access_token: AccessToken,
    /// How long the issuer says the token will be accepted
    pub ttl: DurationSecs,
}

impl IssuedCredential {
    /// Constructs a new issued credential
    pub fn new(access_token: impl Into<AccessToken>, ttl: DurationSecs) -> Self {
        Self {
            access_token: access_token.into(),
            ttl,
        }
    }
}

/// An error while asking the issuer for a new token
#[derive(Debug, Error)]
pub enum IssueError {
    /// The issuer answered with a non-zero application error code
    #[error("issuer returned error code {code}: {message}")]
    Rejected {
        /// The issuer's error code
        code: i64,
        /// The issuer's error message
        message: String,
    },
    /// No answer arrived within the allotted time
    #[error("no response from issuer within {0:?}")]
    Timeout(Duration),
    /// The request could not be sent or its response could not be read
    #[error("error communicating with issuer")]
    Transport(#[source] Box<dyn error::Error + Send + Sync + 'static>),
    /// The issuer answered with a non-success HTTP status
    #[error("issuer responded with HTTP status {status}: {body}")]
    ErrorStatus {
        /// The HTTP status code
        status: u16,
        /// The response body
        body: String,
    },
    /// The response did not carry a usable token
    #[error("malformed issuer response: {0}")]
    MalformedResponse(String),
}

/// A source of fresh access tokens
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    /// Requests a new access token from the issuer
    ///
    /// Implementations bound their own network time; the caller applies an
    /// additional upper bound on top.
    async fn issue(&self) -> Result<IssuedCredential, IssueError>;
}

/// An issuer that always hands out the same token
#[derive(Debug)]
pub struct StaticIssuer {
    access_token: AccessToken,
    ttl: DurationSecs,
}

impl StaticIssuer {
    /// Constructs an issuer handing out `access_token` with the given lifetime
    pub fn new(access_token: impl Into<AccessToken>, ttl: DurationSecs) -> Self {
        Self {
            access_token: access_token.into(),
            ttl,
        }
    }
}

#[async_trait]
impl CredentialIssuer for StaticIssuer {
    async fn issue(&self) -> Result<IssuedCredential, IssueError> {
        Ok(IssuedCredential {
            access_token: self.access_token.clone(),
            ttl: self.ttl,
        })
    }
}
