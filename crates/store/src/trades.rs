//! Trade persistence.

use async_trait::async_trait;
use autotrade_core::{Side, Trade, TradeId, TradeSource, TradeStatus};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::collections::BTreeMap;
use tracing::warn;

use crate::error::{Result, StoreError};

const MIGRATION: &str = include_str!("../migrations/0001_trades.sql");

#[async_trait]
pub trait TradeStore: Send + Sync {
    async fn get(&self, id: TradeId) -> Result<Option<Trade>>;

    /// Trades in `status`, oldest first.
    async fn list_by_status(&self, status: TradeStatus) -> Result<Vec<Trade>>;

    /// CLOSED trades without `finalized_at`, closed at or after `since`.
    async fn list_closed_unfinalized(&self, since: DateTime<Utc>) -> Result<Vec<Trade>>;

    /// Inserts a new trade, ignoring `trade.id`. Returns the assigned id.
    async fn insert(&self, trade: &Trade) -> Result<TradeId>;

    /// Overwrites every mutable field of an existing trade.
    async fn update(&self, trade: &Trade) -> Result<()>;
}

// =============================================================================
// Postgres
// =============================================================================

#[derive(Debug, Clone, sqlx::FromRow)]
struct TradeRow {
    id: i64,
    ticker: String,
    side: String,
    quantity: Option<Decimal>,
    entry_price: Option<Decimal>,
    stop_price: Option<Decimal>,
    initial_stop_price: Option<Decimal>,
    take_profit_price: Option<Decimal>,
    status: String,
    source: String,
    score: Option<Decimal>,
    broker_order_id: Option<String>,
    broker_order_status: Option<String>,
    stop_order_id: Option<String>,
    take_profit_order_id: Option<String>,
    close_order_id: Option<String>,
    close_reason: Option<String>,
    exit_price: Option<Decimal>,
    realized_pnl: Option<Decimal>,
    realized_r: Option<Decimal>,
    duplicate_of: Option<i64>,
    note: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    opened_at: Option<DateTime<Utc>>,
    closed_at: Option<DateTime<Utc>>,
    finalized_at: Option<DateTime<Utc>>,
}

impl TryFrom<TradeRow> for Trade {
    type Error = StoreError;

    fn try_from(row: TradeRow) -> Result<Self> {
        let side = Side::parse(&row.side)
            .ok_or_else(|| StoreError::Corrupt(format!("trade {}: side {:?}", row.id, row.side)))?;
        let status = TradeStatus::parse(&row.status).ok_or_else(|| {
            StoreError::Corrupt(format!("trade {}: status {:?}", row.id, row.status))
        })?;
        let source = TradeSource::parse(&row.source).ok_or_else(|| {
            StoreError::Corrupt(format!("trade {}: source {:?}", row.id, row.source))
        })?;

        Ok(Trade {
            id: row.id,
            ticker: row.ticker,
            side,
            quantity: row.quantity,
            entry_price: row.entry_price,
            stop_price: row.stop_price,
            initial_stop_price: row.initial_stop_price,
            take_profit_price: row.take_profit_price,
            status,
            source,
            score: row.score,
            broker_order_id: row.broker_order_id,
            broker_order_status: row.broker_order_status,
            stop_order_id: row.stop_order_id,
            take_profit_order_id: row.take_profit_order_id,
            close_order_id: row.close_order_id,
            close_reason: row.close_reason,
            exit_price: row.exit_price,
            realized_pnl: row.realized_pnl,
            realized_r: row.realized_r,
            duplicate_of: row.duplicate_of,
            note: row.note,
            created_at: row.created_at,
            updated_at: row.updated_at,
            opened_at: row.opened_at,
            closed_at: row.closed_at,
            finalized_at: row.finalized_at,
        })
    }
}

const SELECT_COLUMNS: &str = r"
    SELECT id, ticker, side, quantity, entry_price, stop_price, initial_stop_price,
           take_profit_price, status, source, score, broker_order_id, broker_order_status,
           stop_order_id, take_profit_order_id, close_order_id, close_reason, exit_price,
           realized_pnl, realized_r, duplicate_of, note, created_at, updated_at,
           opened_at, closed_at, finalized_at
    FROM trades
";

/// Decodes listed rows. Rows that fail to decode are logged and skipped.
fn into_trades(rows: Vec<TradeRow>) -> Vec<Trade> {
    rows.into_iter()
        .filter_map(|row| match Trade::try_from(row) {
            Ok(trade) => Some(trade),
            Err(e) => {
                warn!(error = %e, "skipping undecodable trade row");
                None
            }
        })
        .collect()
}

/// Postgres-backed trade store.
#[derive(Debug, Clone)]
pub struct PgTradeStore {
    pool: PgPool,
}

impl PgTradeStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects a pool.
    ///
    /// # Errors
    /// Returns an error if the database connection cannot be established.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Unavailable(format!("database connect failed: {e}")))?;
        Ok(Self { pool })
    }

    /// Creates the `trades` table and indexes if missing.
    ///
    /// # Errors
    /// Returns an error if the DDL fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(MIGRATION).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl TradeStore for PgTradeStore {
    async fn get(&self, id: TradeId) -> Result<Option<Trade>> {
        let row = sqlx::query_as::<_, TradeRow>(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Trade::try_from).transpose()
    }

    async fn list_by_status(&self, status: TradeStatus) -> Result<Vec<Trade>> {
        let rows = sqlx::query_as::<_, TradeRow>(&format!(
            "{SELECT_COLUMNS} WHERE status = $1 ORDER BY created_at ASC, id ASC"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(into_trades(rows))
    }

    async fn list_closed_unfinalized(&self, since: DateTime<Utc>) -> Result<Vec<Trade>> {
        let rows = sqlx::query_as::<_, TradeRow>(&format!(
            r"{SELECT_COLUMNS}
            WHERE status = 'CLOSED'
              AND finalized_at IS NULL
              AND COALESCE(closed_at, updated_at) >= $1
            ORDER BY COALESCE(closed_at, updated_at) ASC, id ASC"
        ))
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(into_trades(rows))
    }

    async fn insert(&self, trade: &Trade) -> Result<TradeId> {
        let row: (i64,) = sqlx::query_as(
            r"
            INSERT INTO trades
                (ticker, side, quantity, entry_price, stop_price, initial_stop_price,
                 take_profit_price, status, source, score, broker_order_id, broker_order_status,
                 stop_order_id, take_profit_order_id, close_order_id, close_reason, exit_price,
                 realized_pnl, realized_r, duplicate_of, note, created_at, updated_at,
                 opened_at, closed_at, finalized_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                    $18, $19, $20, $21, $22, $23, $24, $25, $26)
            RETURNING id
            ",
        )
        .bind(&trade.ticker)
        .bind(trade.side.as_str())
        .bind(trade.quantity)
        .bind(trade.entry_price)
        .bind(trade.stop_price)
        .bind(trade.initial_stop_price)
        .bind(trade.take_profit_price)
        .bind(trade.status.as_str())
        .bind(trade.source.as_str())
        .bind(trade.score)
        .bind(&trade.broker_order_id)
        .bind(&trade.broker_order_status)
        .bind(&trade.stop_order_id)
        .bind(&trade.take_profit_order_id)
        .bind(&trade.close_order_id)
        .bind(&trade.close_reason)
        .bind(trade.exit_price)
        .bind(trade.realized_pnl)
        .bind(trade.realized_r)
        .bind(trade.duplicate_of)
        .bind(&trade.note)
        .bind(trade.created_at)
        .bind(trade.updated_at)
        .bind(trade.opened_at)
        .bind(trade.closed_at)
        .bind(trade.finalized_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    async fn update(&self, trade: &Trade) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE trades SET
                quantity = $2, entry_price = $3, stop_price = $4, initial_stop_price = $5,
                take_profit_price = $6, status = $7, source = $8, score = $9,
                broker_order_id = $10, broker_order_status = $11, stop_order_id = $12,
                take_profit_order_id = $13, close_order_id = $14, close_reason = $15,
                exit_price = $16, realized_pnl = $17, realized_r = $18, duplicate_of = $19,
                note = $20, updated_at = $21, opened_at = $22, closed_at = $23,
                finalized_at = $24
            WHERE id = $1
            ",
        )
        .bind(trade.id)
        .bind(trade.quantity)
        .bind(trade.entry_price)
        .bind(trade.stop_price)
        .bind(trade.initial_stop_price)
        .bind(trade.take_profit_price)
        .bind(trade.status.as_str())
        .bind(trade.source.as_str())
        .bind(trade.score)
        .bind(&trade.broker_order_id)
        .bind(&trade.broker_order_status)
        .bind(&trade.stop_order_id)
        .bind(&trade.take_profit_order_id)
        .bind(&trade.close_order_id)
        .bind(&trade.close_reason)
        .bind(trade.exit_price)
        .bind(trade.realized_pnl)
        .bind(trade.realized_r)
        .bind(trade.duplicate_of)
        .bind(&trade.note)
        .bind(trade.updated_at)
        .bind(trade.opened_at)
        .bind(trade.closed_at)
        .bind(trade.finalized_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("trade {}", trade.id)));
        }
        Ok(())
    }
}

// =============================================================================
// In-memory
// =============================================================================

/// Process-local trade store for tests and paper runs.
#[derive(Debug, Default)]
pub struct MemoryTradeStore {
    trades: Mutex<BTreeMap<TradeId, Trade>>,
}

impl MemoryTradeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Preloads trades, keeping their ids.
    #[must_use]
    pub fn with_trades(trades: impl IntoIterator<Item = Trade>) -> Self {
        let store = Self::new();
        {
            let mut map = store.trades.lock();
            for trade in trades {
                map.insert(trade.id, trade);
            }
        }
        store
    }

    #[must_use]
    pub fn all(&self) -> Vec<Trade> {
        self.trades.lock().values().cloned().collect()
    }
}

#[async_trait]
impl TradeStore for MemoryTradeStore {
    async fn get(&self, id: TradeId) -> Result<Option<Trade>> {
        Ok(self.trades.lock().get(&id).cloned())
    }

    async fn list_by_status(&self, status: TradeStatus) -> Result<Vec<Trade>> {
        let mut trades: Vec<Trade> = self
            .trades
            .lock()
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        trades.sort_by_key(|t| (t.created_at, t.id));
        Ok(trades)
    }

    async fn list_closed_unfinalized(&self, since: DateTime<Utc>) -> Result<Vec<Trade>> {
        let mut trades: Vec<Trade> = self
            .trades
            .lock()
            .values()
            .filter(|t| {
                t.status == TradeStatus::Closed
                    && t.finalized_at.is_none()
                    && t.closed_at.unwrap_or(t.updated_at) >= since
            })
            .cloned()
            .collect();
        trades.sort_by_key(|t| (t.closed_at.unwrap_or(t.updated_at), t.id));
        Ok(trades)
    }

    async fn insert(&self, trade: &Trade) -> Result<TradeId> {
        let mut map = self.trades.lock();
        let id = map.keys().next_back().copied().unwrap_or(0) + 1;
        let mut stored = trade.clone();
        stored.id = id;
        map.insert(id, stored);
        Ok(id)
    }

    async fn update(&self, trade: &Trade) -> Result<()> {
        let mut map = self.trades.lock();
        match map.get_mut(&trade.id) {
            Some(existing) => {
                *existing = trade.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("trade {}", trade.id))),
        }
    }
}
