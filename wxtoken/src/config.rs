//! Token server configuration
//!
//! Every section and field has a default, so a configuration file only needs
//! to name what differs. The application credentials have no useful default
//! and are rejected by [`TokenServerConfig::validate`] when left empty.
//!
//! ```toml
//! [wechat]
//! app_id = "wx0123456789abcdef"
//! app_secret = "..."
//! api_domain = "shanghai"
//!
//! [access_token]
//! refresh_buffer = 300
//!
//! [cache]
//! kind = "file"
//! path = "/var/cache/wxtoken.json"
//! ```

use std::{io, path::Path, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use wxtoken_clock::DurationSecs;

use crate::{AppId, AppSecret, RefreshPolicy, TokenError};

/// A WeChat API domain
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiDomain {
    /// The general-purpose domain
    #[default]
    Primary,
    /// The general-purpose disaster recovery domain
    Backup,
    /// Shanghai
    Shanghai,
    /// Shenzhen
    Shenzhen,
    /// Hong Kong
    HongKong,
}

impl ApiDomain {
    /// Gets the domain's host name
    pub fn host(self) -> &'static str {
        match self {
            Self::Primary => "api.weixin.qq.com",
            Self::Backup => "api2.weixin.qq.com",
            Self::Shanghai => "sh.api.weixin.qq.com",
            Self::Shenzhen => "sz.api.weixin.qq.com",
            Self::HongKong => "hk.api.weixin.qq.com",
        }
    }
}

/// Complete configuration of a token server
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TokenServerConfig {
    /// Default log filter for binaries embedding the server
    pub log_level: String,
    /// Application identity
    pub wechat: WeChatConfig,
    /// Renewal behaviour
    pub access_token: AccessTokenConfig,
    /// Persistence across restarts
    pub cache: CacheConfig,
}

impl Default for TokenServerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            wechat: WeChatConfig::default(),
            access_token: AccessTokenConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

/// Application identity
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WeChatConfig {
    /// The application ID
    pub app_id: AppId,
    /// The application secret
    pub app_secret: AppSecret,
    /// The domain to request tokens from
    pub api_domain: ApiDomain,
}

impl Default for WeChatConfig {
    fn default() -> Self {
        Self {
            app_id: AppId::from_static(""),
            app_secret: AppSecret::from_static(""),
            api_domain: ApiDomain::default(),
        }
    }
}

/// Renewal behaviour, all durations in seconds
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AccessTokenConfig {
    /// How long before expiry a token is renewed
    pub refresh_buffer: DurationSecs,
    /// The lifetime the issuer is expected to grant
    pub expected_ttl: DurationSecs,
    /// Longest sleep of the background refresher between checks
    pub refresh_interval: DurationSecs,
    /// Upper bound on one issuer call
    pub issue_timeout: DurationSecs,
    /// How much earlier than due a background renewal may randomly start
    pub max_jitter: DurationSecs,
    /// Renew in the background ahead of expiry
    pub enable_proactive: bool,
    /// Start a background renewal when a caller is served a stale token
    pub enable_reactive: bool,
    /// Use the stable token endpoint instead of the classic one
    pub use_stable_api: bool,
}

impl Default for AccessTokenConfig {
    fn default() -> Self {
        Self {
            refresh_buffer: DurationSecs(300),
            expected_ttl: DurationSecs(7200),
            refresh_interval: DurationSecs(3600),
            issue_timeout: DurationSecs(10),
            max_jitter: DurationSecs(30),
            enable_proactive: true,
            enable_reactive: true,
            use_stable_api: true,
        }
    }
}

impl AccessTokenConfig {
    /// The issue timeout as a [`Duration`]
    pub fn issue_timeout(&self) -> Duration {
        self.issue_timeout.into()
    }

    /// The refresh interval as a [`Duration`]
    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval.into()
    }
}

/// Where the token is persisted
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKind {
    /// Not persisted
    #[default]
    None,
    /// Kept in process memory
    Memory,
    /// Written to a local file
    File,
}

/// Persistence across restarts
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Which cache to use
    pub kind: CacheKind,
    /// The cache file, for [`CacheKind::File`]
    pub path: PathBuf,
    /// Subtracted from a token's expiry when it is persisted
    pub safety_margin: DurationSecs,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            kind: CacheKind::None,
            path: PathBuf::from(".wxtoken.json"),
            safety_margin: crate::cache::DEFAULT_SAFETY_MARGIN,
        }
    }
}

/// An error loading a configuration file
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("unable to read configuration file {}", path.display())]
    Read {
        /// The file
        path: PathBuf,
        /// The cause
        #[source]
        source: io::Error,
    },
    /// The file is not valid TOML for this configuration
    #[error("unable to parse configuration")]
    Parse(#[from] toml::de::Error),
    /// The configuration parsed but cannot work
    #[error(transparent)]
    Invalid(#[from] TokenError),
}

impl TokenServerConfig {
    /// Parses a configuration from TOML, without validating it
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Reads, parses and validates a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;

        let config = Self::from_toml_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that the configuration can work
    pub fn validate(&self) -> Result<(), TokenError> {
        let wechat = &self.wechat;
        if wechat.app_id.as_str().is_empty() {
            return Err(TokenError::invalid_config("wechat.app_id is empty"));
        }
        if wechat.app_secret.as_str().is_empty() {
            return Err(TokenError::invalid_config("wechat.app_secret is empty"));
        }

        let token = &self.access_token;
        RefreshPolicy::new(token.refresh_buffer).validate_lifetime(token.expected_ttl)?;
        if token.refresh_interval.is_zero() {
            return Err(TokenError::invalid_config(
                "access_token.refresh_interval must be positive",
            ));
        }
        if token.issue_timeout.is_zero() {
            return Err(TokenError::invalid_config(
                "access_token.issue_timeout must be positive",
            ));
        }
        if token.max_jitter > token.refresh_buffer {
            return Err(TokenError::invalid_config(format!(
                "access_token.max_jitter ({}) must not exceed access_token.refresh_buffer ({})",
                token.max_jitter, token.refresh_buffer
            )));
        }

        let cache = &self.cache;
        if cache.safety_margin >= token.expected_ttl {
            return Err(TokenError::invalid_config(format!(
                "cache.safety_margin ({}) must be shorter than access_token.expected_ttl ({})",
                cache.safety_margin, token.expected_ttl
            )));
        }
        if cache.kind == CacheKind::File && cache.path.as_os_str().is_empty() {
            return Err(TokenError::invalid_config(
                "cache.path is required for a file cache",
            ));
        }

        Ok(())
    }
}
