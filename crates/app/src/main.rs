mod admin;
mod api;
mod backfill;
mod problem;
mod retention;
mod router;
mod signature;
mod telemetry;
mod views;
mod webhook;

use std::{net::SocketAddr, sync::Arc};

use reqwest::Client;
use tracing::{info, warn};
use url::Url;

use stamphog_slack::SlackClient;
use stamphog_storage::Database;
use stamphog_util::{load_env_file, AppConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let storage = Database::connect(&config.database_url).await?;
    storage.run_migrations().await?;

    let slack = match &config.slack_bot_token {
        Some(token) => {
            let base = Url::parse(&config.slack_api_base)?;
            let http = Client::builder().build()?;
            Some(SlackClient::new(token.clone(), base, http))
        }
        None => {
            warn!(
                stage = "app",
                "SLACK_BOT_TOKEN is not set; identity and history lookups are disabled"
            );
            None
        }
    };

    let signing_secret: Option<Arc<[u8]>> = config
        .slack_signing_secret
        .as_ref()
        .map(|secret| Arc::from(secret.as_bytes().to_vec().into_boxed_slice()));
    if signing_secret.is_none() {
        warn!(
            stage = "app",
            "SLACK_SIGNING_SECRET is not set; webhook deliveries will be rejected"
        );
    }

    let state = router::AppState::new(
        metrics,
        storage.clone(),
        slack,
        signing_secret,
        config.channel_ids.clone(),
    );

    retention::RetentionWorker::new(storage).spawn();

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
