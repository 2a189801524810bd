//! Wires configuration into a broker, stores and an [`AutoManager`].

use anyhow::Context;
use std::num::NonZeroU32;
use std::sync::Arc;

use autotrade_broker::{Broker, BrokerClient, BrokerClientConfig, PaperBroker};
use autotrade_core::AppConfig;
use autotrade_manager::{AutoManager, LogNotifier, ManagerDeps, Notifier, WebhookNotifier};
use autotrade_store::{KvStore, MemoryTradeStore, PgTradeStore, RedisKv, TradeStore};

pub struct AppContext {
    pub config: AppConfig,
    pub manager: AutoManager,
}

impl AppContext {
    pub async fn build(config: AppConfig, paper: bool) -> anyhow::Result<Self> {
        let broker = broker(&config, paper)?;
        let kv = kv_store(&config).await;
        let trades = trade_store(&config).await?;
        let notifier: Arc<dyn Notifier> = match &config.notify.webhook_url {
            Some(url) => Arc::new(WebhookNotifier::new(url)?),
            None => Arc::new(LogNotifier),
        };

        let deps = ManagerDeps {
            broker,
            trades,
            kv,
            notifier,
        };
        let manager = AutoManager::new(deps, &config, &owner())
            .context("failed to build auto-manager")?;
        Ok(Self { config, manager })
    }
}

fn owner() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "autotrade".to_string());
    format!("{host}:{}", std::process::id())
}

fn broker(config: &AppConfig, paper: bool) -> anyhow::Result<Arc<dyn Broker>> {
    if paper {
        tracing::info!("Using in-memory paper broker");
        return Ok(Arc::new(PaperBroker::new()));
    }
    let settings = &config.broker;
    let rpm = NonZeroU32::new(settings.requests_per_minute)
        .context("broker.requests_per_minute must be positive")?;
    let client = BrokerClient::new(
        BrokerClientConfig::new(settings.api_key.clone(), settings.api_secret.clone())
            .with_base_url(settings.base_url.clone())
            .with_rate_limit(rpm)
            .with_timeout_secs(settings.timeout_secs),
    )?;
    tracing::info!("Using broker at {}", client.base_url());
    Ok(Arc::new(client))
}

/// `None` when Redis is unconfigured or unreachable; locks then report
/// unavailable and guardrails fail closed.
async fn kv_store(config: &AppConfig) -> Option<Arc<dyn KvStore>> {
    let url = config.redis.url.as_deref()?;
    match RedisKv::connect(url).await {
        Ok(kv) => Some(Arc::new(kv)),
        Err(e) => {
            tracing::warn!(error = %e, "Redis unavailable; locks and guardrails disabled");
            None
        }
    }
}

async fn trade_store(config: &AppConfig) -> anyhow::Result<Arc<dyn TradeStore>> {
    match &config.database.url {
        Some(url) => {
            let store = PgTradeStore::connect(url, config.database.max_connections)
                .await
                .context("failed to connect to trade database")?;
            store.migrate().await.context("trade migrations failed")?;
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("No database.url configured; using an empty in-memory trade store");
            Ok(Arc::new(MemoryTradeStore::new()))
        }
    }
}
