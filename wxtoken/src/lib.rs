//! A single-flight cache for WeChat access tokens
//!
//! WeChat access tokens are short-lived, rate-limited at the issuer, and
//! rotating one invalidates the previous token shortly after. An application
//! therefore needs exactly one owner of the token that hands it out to every
//! caller and renews it once per lifetime, no matter how many callers notice
//! at the same time that it needs renewing.
//!
//! The pieces, from the bottom up:
//!
//! * A [`Credential`] is the token plus when it was issued, when it should be
//!   renewed and when it expires. A [`RefreshPolicy`] decides these times.
//! * The [`CredentialStore`] holds the current credential and swaps it
//!   atomically.
//! * The [`RefreshCoordinator`] serves the stored token while it is valid and
//!   otherwise runs a single refresh against a [`CredentialIssuer`], handing
//!   its one outcome to everyone who waited on it. A failed refresh never
//!   evicts a token that is still usable.
//! * The [`ProactiveRefresher`] renews the token in the background before it
//!   goes stale, so that callers normally never wait on the issuer.
//! * The [`TokenServer`] ties these together with a start/stop lifecycle,
//!   optional persistence through a [`PersistentCache`][cache::PersistentCache]
//!   and construction from a [`TokenServerConfig`][config::TokenServerConfig].
//!
//! ```no_run
//! use tokio_util::sync::CancellationToken;
//! use wxtoken::{config::TokenServerConfig, TokenServer};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TokenServerConfig::load("wxtoken.toml")?;
//! let server = TokenServer::from_config(&config)?;
//! server.start().await;
//!
//! let token = server.get_token(&CancellationToken::new()).await?;
//! println!("using token {:#12}", token);
//!
//! server.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! Every wait accepts a [`CancellationToken`][tokio_util::sync::CancellationToken];
//! a caller that gives up only stops its own wait and never aborts the refresh
//! other callers depend on.
//!
//! # Features
//!
//! The following features are supported by this crate, all of which are enabled by default:
//!
//! * `wechat`: Provides [`WeChatIssuer`][issuer::WeChatIssuer], which requests
//!   tokens from the WeChat API, and [`TokenServer::from_config`].
//! * `file`: Provides a persistent cache using the local filesystem.
//! * `rand`: Provides for an implementation of [JitterSource][jitter::JitterSource] based on the
//!   random number generator provided by the [rand] crate.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod backoff;
mod braids;
pub mod cache;
pub mod config;
mod coordinator;
mod credential;
mod error;
pub mod issuer;
pub mod jitter;
mod refresher;
mod server;
mod stats;
mod store;

pub use wxtoken_clock as clock;

pub use braids::*;
pub use coordinator::{RefreshCoordinator, RefreshCoordinatorBuilder, DEFAULT_ISSUE_TIMEOUT};
pub use credential::{Credential, CredentialStatus, RefreshPolicy, DEFAULT_REFRESH_BUFFER};
pub use error::TokenError;
pub use issuer::{CredentialIssuer, IssueError, IssuedCredential, StaticIssuer};
pub use refresher::{ProactiveRefresher, DEFAULT_REFRESH_INTERVAL};
pub use server::{TokenServer, TokenServerBuilder, DEFAULT_MAX_JITTER};
pub use stats::RefreshStats;
pub use store::CredentialStore;
