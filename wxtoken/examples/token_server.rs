use std::{path::PathBuf, time::Duration};

use clap::Parser;
use tokio::time;
use tokio_util::sync::CancellationToken;
use wxtoken::{
    config::{CacheKind, TokenServerConfig},
    AppId, AppSecret, CredentialStatus, TokenServer,
};

#[derive(Debug, Parser)]
struct Opts {
    /// A TOML configuration file; defaults apply when omitted
    #[arg(short, long, env = "WXTOKEN_CONFIG")]
    config: Option<PathBuf>,

    /// The application ID, overriding the configuration file
    #[arg(short, long, env = "WECHAT_APPID")]
    app_id: Option<AppId>,

    /// The application secret, overriding the configuration file
    #[arg(short = 's', long, env = "WECHAT_APPSECRET", hide_env_values = true)]
    app_secret: Option<AppSecret>,

    /// Persist the token to this file
    #[arg(short = 'f', long)]
    cache_file: Option<PathBuf>,

    /// How often to report the token status, in seconds
    #[arg(long, default_value_t = 5)]
    report_every: u64,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    let opts = Opts::parse();

    let mut config = match &opts.config {
        Some(path) => TokenServerConfig::from_toml_str(&std::fs::read_to_string(path)?)?,
        None => TokenServerConfig::default(),
    };
    if let Some(app_id) = opts.app_id {
        config.wechat.app_id = app_id;
    }
    if let Some(app_secret) = opts.app_secret {
        config.wechat.app_secret = app_secret;
    }
    if let Some(path) = opts.cache_file {
        config.cache.kind = CacheKind::File;
        config.cache.path = path;
    }

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .init();

    let server = TokenServer::from_config(&config)?;
    server.start().await;

    let cancel = CancellationToken::new();
    let token = server.get_token(&cancel).await?;
    tracing::info!(token = format_args!("{:#?}", token), "first access token");

    let mut interval = time::interval(Duration::from_secs(opts.report_every.max(1)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = interval.tick() => {}
        }

        let stats = server.stats();
        let Some(credential) = server.coordinator().store().current() else {
            tracing::warn!(failures = stats.failure_count, "no access token yet");
            continue;
        };

        match server.status() {
            Some(CredentialStatus::Fresh) | None => tracing::debug!(
                refresh_at = credential.refresh_at().0,
                expiry = credential.expires_at().0,
                refreshes = stats.refresh_count,
                "token fresh"
            ),
            Some(CredentialStatus::Stale) => tracing::warn!(
                refresh_at = credential.refresh_at().0,
                expiry = credential.expires_at().0,
                failures = stats.failure_count,
                "token stale"
            ),
            Some(CredentialStatus::Expired) => tracing::error!(
                expiry = credential.expires_at().0,
                failures = stats.failure_count,
                "token expired"
            ),
        }
    }

    tracing::info!("shutting down");
    cancel.cancel();
    server.stop().await;

    Ok(())
}
