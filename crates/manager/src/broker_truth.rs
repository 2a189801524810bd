//! Short-lived cache of the broker's positions and open orders.
//!
//! Broker truth is the only state trusted for "does a position or order exist
//! at the broker". A snapshot is cached only when both fetches succeeded.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use autotrade_broker::{Broker, Order, Position};
use autotrade_core::normalize_ticker;

use crate::deadline::with_deadline;

/// Positions and open orders as the broker reported them at `fetched_at`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrokerTruth {
    pub fetched_at: DateTime<Utc>,
    pub positions: Vec<Position>,
    pub orders: Vec<Order>,
    pub positions_error: Option<String>,
    pub orders_error: Option<String>,
}

impl BrokerTruth {
    /// Combined error text, if either fetch failed.
    #[must_use]
    pub fn error(&self) -> Option<String> {
        match (&self.positions_error, &self.orders_error) {
            (None, None) => None,
            (Some(p), None) => Some(format!("positions: {p}")),
            (None, Some(o)) => Some(format!("orders: {o}")),
            (Some(p), Some(o)) => Some(format!("positions: {p}; orders: {o}")),
        }
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.positions_error.is_none() && self.orders_error.is_none()
    }

    #[must_use]
    pub fn position(&self, symbol: &str) -> Option<&Position> {
        let symbol = normalize_ticker(symbol);
        self.positions.iter().find(|p| p.symbol == symbol)
    }

    #[must_use]
    pub fn has_open_order(&self, symbol: &str) -> bool {
        let symbol = normalize_ticker(symbol);
        self.orders
            .iter()
            .any(|o| o.symbol == symbol && !o.status.is_terminal())
    }
}

pub struct BrokerTruthCache {
    broker: Arc<dyn Broker>,
    ttl: Duration,
    timeout: Duration,
    cached: RwLock<Option<(Instant, Arc<BrokerTruth>)>>,
}

impl std::fmt::Debug for BrokerTruthCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerTruthCache")
            .field("ttl", &self.ttl)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl BrokerTruthCache {
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, ttl: Duration, timeout: Duration) -> Self {
        Self {
            broker,
            ttl,
            timeout,
            cached: RwLock::new(None),
        }
    }

    /// Cached snapshot while fresh, otherwise a new one.
    ///
    /// Positions and orders are fetched concurrently, each under the call
    /// timeout. A failed side leaves its list empty and its error set.
    pub async fn fetch(&self) -> Arc<BrokerTruth> {
        if let Some((at, truth)) = self.cached.read().as_ref() {
            if at.elapsed() < self.ttl {
                debug!("broker truth cache hit");
                return Arc::clone(truth);
            }
        }

        let (positions, orders) = tokio::join!(
            with_deadline(self.timeout, "list_positions", self.broker.list_positions()),
            with_deadline(self.timeout, "list_open_orders", self.broker.list_open_orders()),
        );

        let (positions, positions_error) = match positions {
            Ok(p) => (p, None),
            Err(e) => (Vec::new(), Some(e.to_string())),
        };
        let (orders, orders_error) = match orders {
            Ok(o) => (o, None),
            Err(e) => (Vec::new(), Some(e.to_string())),
        };

        let truth = Arc::new(BrokerTruth {
            fetched_at: Utc::now(),
            positions,
            orders,
            positions_error,
            orders_error,
        });

        if truth.is_clean() {
            *self.cached.write() = Some((Instant::now(), Arc::clone(&truth)));
        } else {
            warn!(error = truth.error().unwrap_or_default(), "broker truth incomplete, not cached");
        }
        truth
    }

    /// Drops the cached snapshot.
    pub fn clear(&self) {
        *self.cached.write() = None;
    }
}
