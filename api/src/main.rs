//! ispgate - Main Entry Point

use anyhow::Context;
use ispgate_api::{build_router, AppState, ServiceConfig};
use ispgate_billing::{DarajaClient, LogNotifier, Notifier, WebhookNotifier};
use ispgate_common::{MemoryStore, StoreSeed};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const NOTIFY_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = ServiceConfig::path();
    let loaded = ServiceConfig::load(&config_path);
    let config = match &loaded {
        Ok(config) => config.clone(),
        Err(_) => ServiceConfig::default(),
    }
    .with_env_overrides();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_filter.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("ispgate v{}", env!("CARGO_PKG_VERSION"));
    if let Err(e) = &loaded {
        tracing::warn!(error = %e, "config not loaded, using defaults");
    }

    let store = match &config.seed_path {
        Some(path) => {
            let content = std::fs::read_to_string(path).with_context(|| format!("reading seed {}", path))?;
            let seed: StoreSeed = serde_json::from_str(&content).with_context(|| format!("parsing seed {}", path))?;
            let store = MemoryStore::from_seed(seed)?;
            tracing::info!(path = %path, "store seeded");
            store
        }
        None => MemoryStore::new(),
    };

    let notifier: Arc<dyn Notifier> = match config.notifications.clone() {
        Some(hook) => {
            let url = hook.url.clone();
            let webhook = Arc::new(WebhookNotifier::new(hook, config.gateway_timeout())?);
            tokio::spawn(webhook.clone().run(NOTIFY_INTERVAL));
            tracing::info!(url = %url, "billing events go to webhook");
            webhook as Arc<dyn Notifier>
        }
        None => Arc::new(LogNotifier),
    };

    let gateway = Arc::new(DarajaClient::new(config.gateway_timeout())?);
    let state = AppState::new(Arc::new(store), gateway, notifier, &config.callback_base_url);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    tracing::info!("ispgate listening on {}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;

    Ok(())
}
