#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::Arc;

use autotrade_broker::{PaperBroker, Position};
use autotrade_core::{AppConfig, Side, Trade, TradeId};
use autotrade_manager::{AutoManager, ManagerDeps, Notifier};
use autotrade_store::{KvStore, MemoryKv, MemoryTradeStore};

/// Captures notifications as `(key, message)`.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn keys(&self) -> Vec<String> {
        self.sent.lock().iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn messages(&self) -> Vec<String> {
        self.sent.lock().iter().map(|(_, m)| m.clone()).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, dedupe_key: &str, _ttl_secs: u64, message: &str) {
        self.sent
            .lock()
            .push((dedupe_key.to_string(), message.to_string()));
    }
}

pub struct Harness {
    pub broker: Arc<PaperBroker>,
    pub kv: Arc<MemoryKv>,
    pub trades: Arc<MemoryTradeStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub manager: AutoManager,
}

impl Harness {
    pub fn new(trades: Vec<Trade>) -> Self {
        Self::with_config(trades, AppConfig::default(), true)
    }

    pub fn with_config(trades: Vec<Trade>, config: AppConfig, with_store: bool) -> Self {
        Self::with_broker(PaperBroker::new(), trades, config, with_store)
    }

    pub fn with_broker(
        broker: PaperBroker,
        trades: Vec<Trade>,
        config: AppConfig,
        with_store: bool,
    ) -> Self {
        let broker = Arc::new(broker);
        let kv = Arc::new(MemoryKv::new());
        let trades = Arc::new(MemoryTradeStore::with_trades(trades));
        let notifier = Arc::new(RecordingNotifier::default());
        let shared: Option<Arc<dyn KvStore>> = if with_store {
            Some(kv.clone())
        } else {
            None
        };
        let deps = ManagerDeps {
            broker: broker.clone(),
            trades: trades.clone(),
            kv: shared,
            notifier: notifier.clone(),
        };
        let manager = AutoManager::new(deps, &config, "test-host").unwrap();
        Self {
            broker,
            kv,
            trades,
            notifier,
            manager,
        }
    }

    pub fn trade(&self, id: TradeId) -> Trade {
        self.trades
            .all()
            .into_iter()
            .find(|t| t.id == id)
            .unwrap()
    }

    pub fn position(&self, symbol: &str) -> Option<Position> {
        self.broker.position(symbol)
    }
}

/// Open LONG trade of 10 shares, entry 100, stop 98, protected by `stop-{id}`.
pub fn long_trade(id: TradeId, ticker: &str, now: DateTime<Utc>) -> Trade {
    let mut trade = Trade::new(id, ticker, Side::Long, now)
        .with_prices(Decimal::from(100), Decimal::from(98))
        .with_quantity(Decimal::from(10));
    trade.stop_order_id = Some(format!("stop-{id}"));
    trade
}
