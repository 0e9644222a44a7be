//! An issuer backed by the WeChat access token endpoints

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::{
    dto::{AppCredentials, TokenResponse},
    CredentialIssuer, IssueError, IssuedCredential,
};
use crate::config::ApiDomain;

/// Default bound on one request to the issuer
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Which token endpoint to call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endpoint {
    /// `GET /cgi-bin/token`
    ///
    /// Each successful call invalidates previously issued tokens after a
    /// short grace period.
    Classic,
    /// `POST /cgi-bin/stable_token`
    ///
    /// Returns the currently valid token unless `force_refresh` is set.
    Stable {
        /// Ask the issuer to rotate the token
        force_refresh: bool,
    },
}

impl Endpoint {
    fn path(self) -> &'static str {
        match self {
            Self::Classic => "cgi-bin/token",
            Self::Stable { .. } => "cgi-bin/stable_token",
        }
    }
}

/// A credential issuer that talks to the WeChat API
#[derive(Debug)]
pub struct WeChatIssuer {
    client: reqwest::Client,
    base_url: reqwest::Url,
    credentials: AppCredentials,
    endpoint: Endpoint,
    timeout: Duration,
}

impl WeChatIssuer {
    /// Constructs an issuer for the given API domain
    pub fn new(
        client: reqwest::Client,
        domain: ApiDomain,
        credentials: AppCredentials,
    ) -> Result<Self, InvalidBaseUrl> {
        Self::with_base_url(client, &format!("https://{}/", domain.host()), credentials)
    }

    /// Constructs an issuer that sends requests below `base_url`
    pub fn with_base_url(
        client: reqwest::Client,
        base_url: &str,
        credentials: AppCredentials,
    ) -> Result<Self, InvalidBaseUrl> {
        let mut base_url = reqwest::Url::parse(base_url)
            .map_err(|source| InvalidBaseUrl {
                url: base_url.to_owned(),
                source,
            })?;

        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            client,
            base_url,
            credentials,
            endpoint: Endpoint::Stable {
                force_refresh: false,
            },
            timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Selects the token endpoint
    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Bounds each request to the issuer
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn token_url(&self) -> Result<reqwest::Url, IssueError> {
        self.base_url
            .join(self.endpoint.path())
            .map_err(|e| IssueError::Transport(Box::new(e)))
    }

    fn transport_error(&self, error: reqwest::Error) -> IssueError {
        if error.is_timeout() {
            IssueError::Timeout(self.timeout)
        } else {
            IssueError::Transport(Box::new(error))
        }
    }
}

#[async_trait]
impl CredentialIssuer for WeChatIssuer {
    #[tracing::instrument(
        err,
        skip(self),
        fields(
            app_id = %self.credentials.app_id,
            endpoint = self.endpoint.path(),
        ),
    )]
    async fn issue(&self) -> Result<IssuedCredential, IssueError> {
        tracing::trace!("requesting access token from issuer");

        let url = self.token_url()?;
        let request = match self.endpoint {
            Endpoint::Classic => self
                .client
                .get(url)
                .query(&self.credentials.classic_query()),
            Endpoint::Stable { force_refresh } => self
                .client
                .post(url)
                .json(&self.credentials.stable_request(force_refresh)),
        };

        let resp = request
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = resp.status();
        tracing::debug!(
            response.status = status.as_u16(),
            "received token response from issuer"
        );

        if !status.is_success() {
            let body = resp.text().await.map_err(|e| self.transport_error(e))?;
            return Err(IssueError::ErrorStatus {
                status: status.as_u16(),
                body,
            });
        }

        let body = resp.bytes().await.map_err(|e| self.transport_error(e))?;
        let resp: TokenResponse = serde_json::from_slice(&body)
            .map_err(|e| IssueError::MalformedResponse(e.to_string()))?;

        let issued = resp.into_issued()?;

        tracing::info!(
            lifetime = issued.ttl.0,
            token = %issued.access_token.preview(),
            "received new access token"
        );

        Ok(issued)
    }
}

/// The issuer base URL could not be parsed
#[derive(Debug, Error)]
#[error("invalid issuer base URL {url:?}")]
pub struct InvalidBaseUrl {
    url: String,
    source: url::ParseError,
}

#[cfg(test)]
mod tests {
    use wiremock::{
        matchers::{body_json, method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };
    use wxtoken_clock::DurationSecs;

    use super::*;
    use crate::{AppId, AppSecret};

    fn credentials() -> AppCredentials {
        AppCredentials {
            app_id: AppId::from_static("wx0123456789"),
            app_secret: AppSecret::from_static("s3cr3t"),
        }
    }

    async fn issuer_for(server: &MockServer) -> WeChatIssuer {
        WeChatIssuer::with_base_url(reqwest::Client::new(), &server.uri(), credentials()).unwrap()
    }

    #[tokio::test]
    async fn stable_endpoint_posts_json_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/cgi-bin/stable_token"))
            .and(body_json(serde_json::json!({
                "grant_type": "client_credential",
                "appid": "wx0123456789",
                "secret": "s3cr3t",
                "force_refresh": false,
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "STABLE_TOKEN",
                "expires_in": 7200,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let issued = issuer_for(&server).await.issue().await.unwrap();

        assert_eq!(issued.access_token.as_str(), "STABLE_TOKEN");
        assert_eq!(issued.ttl, DurationSecs(7200));
    }

    #[tokio::test]
    async fn classic_endpoint_sends_query_parameters() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cgi-bin/token"))
            .and(query_param("grant_type", "client_credential"))
            .and(query_param("appid", "wx0123456789"))
            .and(query_param("secret", "s3cr3t"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "CLASSIC_TOKEN",
                "expires_in": 7200,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let issued = issuer_for(&server)
            .await
            .with_endpoint(Endpoint::Classic)
            .issue()
            .await
            .unwrap();

        assert_eq!(issued.access_token.as_str(), "CLASSIC_TOKEN");
    }

    #[tokio::test]
    async fn error_code_is_a_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "errcode": 40125,
                "errmsg": "invalid appsecret",
            })))
            .mount(&server)
            .await;

        let error = issuer_for(&server).await.issue().await.unwrap_err();

        assert!(matches!(
            error,
            IssueError::Rejected { code: 40125, ref message } if message == "invalid appsecret"
        ));
    }

    #[tokio::test]
    async fn http_failure_keeps_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let error = issuer_for(&server).await.issue().await.unwrap_err();

        assert!(matches!(
            error,
            IssueError::ErrorStatus { status: 502, ref body } if body == "bad gateway"
        ));
    }

    #[tokio::test]
    async fn unparseable_body_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let error = issuer_for(&server).await.issue().await.unwrap_err();

        assert!(matches!(error, IssueError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn slow_issuer_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({
                        "access_token": "LATE",
                        "expires_in": 7200,
                    }))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let error = issuer_for(&server)
            .await
            .with_timeout(Duration::from_millis(100))
            .issue()
            .await
            .unwrap_err();

        assert!(matches!(error, IssueError::Timeout(d) if d == Duration::from_millis(100)));
    }

    #[test]
    fn base_url_gains_a_trailing_slash() {
        let issuer = WeChatIssuer::with_base_url(
            reqwest::Client::new(),
            "http://localhost:1234/proxy",
            credentials(),
        )
        .unwrap();

        assert_eq!(
            issuer.token_url().unwrap().as_str(),
            "http://localhost:1234/proxy/cgi-bin/stable_token"
        );
    }

    #[test]
    fn invalid_base_url_is_reported() {
        assert!(
            WeChatIssuer::with_base_url(reqwest::Client::new(), "not a url", credentials())
                .is_err()
        );
    }
}
