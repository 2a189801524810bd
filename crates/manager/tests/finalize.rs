mod common;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use autotrade_broker::{Fill, OrderSide, PaperFailure, PaperOp};
use autotrade_core::{AppConfig, Trade, TradeStatus};

use common::{long_trade, Harness};

fn closed_trade(id: i64, now: DateTime<Utc>) -> Trade {
    let mut trade = long_trade(id, "AAPL", now - Duration::hours(2)).with_status(TradeStatus::Closed);
    trade.take_profit_order_id = Some(format!("tp-{id}"));
    trade.closed_at = Some(now - Duration::hours(1));
    trade
}

fn fill(order_id: &str, side: OrderSide, qty: Decimal, price: Decimal, at: DateTime<Utc>) -> Fill {
    Fill {
        id: None,
        order_id: order_id.to_string(),
        symbol: "AAPL".to_string(),
        side,
        qty,
        price,
        transaction_time: at,
    }
}

#[tokio::test]
async fn realized_pnl_and_r_are_recorded() {
    let now = Utc::now();
    let h = Harness::new(vec![closed_trade(1, now)]);
    h.broker.add_fill(fill("entry", OrderSide::Buy, dec!(10), dec!(100), now - Duration::minutes(119)));
    h.broker.add_fill(fill("tp-1", OrderSide::Sell, dec!(10), dec!(102), now - Duration::minutes(61)));

    let summary = h.manager.finalize_recent_closes(now).await;

    assert_eq!((summary.checked, summary.updated, summary.errors), (1, 1, 0));
    assert_eq!(summary.items[0].action, "finalized");
    let trade = h.trade(1);
    assert_eq!(trade.realized_pnl, Some(dec!(20)));
    assert_eq!(trade.realized_r, Some(dec!(1)));
    assert_eq!(trade.exit_price, Some(dec!(102)));
    assert_eq!(trade.close_reason.as_deref(), Some("take_profit"));
    assert_eq!(trade.finalized_at, Some(now));
    assert_eq!(h.notifier.keys(), vec!["finalize:1:finalized".to_string()]);

    let again = h.manager.finalize_recent_closes(now).await;
    assert_eq!(again.checked, 0);
}

#[tokio::test]
async fn missing_entry_fill_voids_trade() {
    let now = Utc::now();
    let h = Harness::new(vec![closed_trade(1, now)]);

    let summary = h.manager.finalize_recent_closes(now).await;

    assert_eq!(summary.items[0].action, "voided");
    let trade = h.trade(1);
    assert_eq!(trade.status, TradeStatus::Disabled);
    assert!(trade.realized_pnl.is_none());
    assert!(trade.finalized_at.is_some());
}

#[tokio::test]
async fn missing_exit_fill_reopens_trade() {
    let now = Utc::now();
    let h = Harness::new(vec![closed_trade(1, now)]);
    h.broker.add_fill(fill("entry", OrderSide::Buy, dec!(10), dec!(100), now - Duration::minutes(119)));

    let summary = h.manager.finalize_recent_closes(now).await;

    assert_eq!(summary.items[0].action, "reopened");
    let trade = h.trade(1);
    assert_eq!(trade.status, TradeStatus::Open);
    assert!(trade.closed_at.is_none());
    assert!(trade.finalized_at.is_none());
}

#[tokio::test]
async fn feed_error_leaves_trade_untouched() {
    let now = Utc::now();
    let h = Harness::new(vec![closed_trade(1, now)]);
    h.broker.set_failure(PaperOp::ListFills, Some(PaperFailure::Timeout));

    let summary = h.manager.finalize_recent_closes(now).await;

    assert_eq!((summary.updated, summary.errors), (0, 1));
    assert_eq!(h.trade(1), closed_trade(1, now));
    assert!(h.notifier.keys().is_empty());
}

#[tokio::test]
async fn losing_close_trips_guardrails() {
    let now = Utc::now();
    let mut config = AppConfig::default();
    config.guardrails.max_consecutive_failures = 1;
    let h = Harness::with_config(vec![closed_trade(1, now)], config, true);
    h.broker.add_fill(fill("entry", OrderSide::Buy, dec!(10), dec!(100), now - Duration::minutes(119)));
    h.broker.add_fill(fill("stop-1", OrderSide::Sell, dec!(10), dec!(98), now - Duration::minutes(61)));

    h.manager.finalize_recent_closes(now).await;

    let trade = h.trade(1);
    assert_eq!(trade.realized_r, Some(dec!(-1)));
    assert_eq!(trade.close_reason.as_deref(), Some("stop_loss"));

    let state = h.manager.entry_gate().guardrails().state(now).await;
    assert_eq!(state.consecutive_failures, 1);
    assert!(state.auto_disabled_reason.is_some());
    assert!(state.last_loss_at.is_some());
    assert!(h
        .notifier
        .keys()
        .iter()
        .any(|k| k.starts_with("guardrails:auto_disabled:")));
}
