//! Wire types for the WeChat access token endpoints

use serde::{Deserialize, Serialize};
use wxtoken_clock::DurationSecs;

use super::{IssueError, IssuedCredential};
use crate::{AccessToken, AppId, AppSecret};

/// The grant type for application credentials
pub const CLIENT_CREDENTIAL: &str = "client_credential";

/// Application credentials as sent to the issuer
#[derive(Debug, Clone)]
pub struct AppCredentials {
    /// The application ID
    pub app_id: AppId,
    /// The application secret
    pub app_secret: AppSecret,
}

/// Query parameters of the classic `GET /cgi-bin/token` endpoint
#[derive(Debug, Serialize)]
pub(super) struct ClassicTokenQuery<'a> {
    pub grant_type: &'static str,
    pub appid: &'a str,
    pub secret: &'a str,
}

/// JSON body of the `POST /cgi-bin/stable_token` endpoint
#[derive(Debug, Serialize)]
pub(super) struct StableTokenRequest<'a> {
    pub grant_type: &'static str,
    pub appid: &'a str,
    pub secret: &'a str,
    pub force_refresh: bool,
}

impl AppCredentials {
    pub(super) fn classic_query(&self) -> ClassicTokenQuery<'_> {
        ClassicTokenQuery {
            grant_type: CLIENT_CREDENTIAL,
            appid: self.app_id.as_str(),
            secret: self.app_secret.as_str(),
        }
    }

    pub(super) fn stable_request(&self, force_refresh: bool) -> StableTokenRequest<'_> {
        StableTokenRequest {
            grant_type: CLIENT_CREDENTIAL,
            appid: self.app_id.as_str(),
            secret: self.app_secret.as_str(),
            force_refresh,
        }
    }
}

/// The issuer's answer, which is either a token or an error code
#[derive(Debug, Default, Deserialize)]
pub(super) struct TokenResponse {
    #[serde(default)]
    pub access_token: Option<AccessToken>,
    #[serde(default)]
    pub expires_in: Option<DurationSecs>,
    #[serde(default)]
    pub errcode: i64,
    #[serde(default)]
    pub errmsg: Option<String>,
}

impl TokenResponse {
    /// Only `errcode == 0` with a non-empty token and a lifetime counts as success
    pub(super) fn into_issued(self) -> Result<IssuedCredential, IssueError> {
        if self.errcode != 0 {
            return Err(IssueError::Rejected {
                code: self.errcode,
                message: self.errmsg.unwrap_or_default(),
            });
        }

        let access_token = self
            .access_token
            .filter(|t| !t.as_str().is_empty())
            .ok_or_else(|| IssueError::MalformedResponse("missing access_token".to_owned()))?;

        let ttl = self
            .expires_in
            .filter(|ttl| !ttl.is_zero())
            .ok_or_else(|| IssueError::MalformedResponse("missing expires_in".to_owned()))?;

        Ok(IssuedCredential { access_token, ttl })
    }
}
