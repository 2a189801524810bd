mod common;

use chrono::Utc;
use rust_decimal_macros::dec;
use std::time::Duration;

use autotrade_broker::{
    resting_stop, OrderSide, OrderStatus, PaperBroker, PaperCall, PaperFailure, PaperOp,
    TimeInForce,
};
use autotrade_core::{AppConfig, Side, Trade, TradeSource, TradeStatus};
use autotrade_manager::{RunStatus, RunSummary};

use common::{long_trade, Harness};

fn protect(h: &Harness, id: &str, symbol: &str) {
    h.broker.insert_order(resting_stop(
        id,
        symbol,
        OrderSide::Sell,
        dec!(10),
        dec!(98),
        OrderStatus::Accepted,
    ));
}

#[tokio::test]
async fn cut_loss_cancels_stops_then_flattens() {
    let now = Utc::now();
    let h = Harness::new(vec![long_trade(1, "AAPL", now)]);
    h.broker.set_position("AAPL", dec!(10), dec!(100), dec!(97));
    protect(&h, "stop-1", "AAPL");

    let summary = h.manager.run_auto_manage(now).await;

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.counts.cut_loss, 1);
    assert!(h.position("AAPL").is_none());
    assert_eq!(h.broker.order("stop-1").unwrap().status, OrderStatus::Canceled);

    let trade = h.trade(1);
    assert_eq!(trade.status, TradeStatus::Closed);
    assert_eq!(trade.close_reason.as_deref(), Some("cut_loss"));
    assert!(trade.close_order_id.is_some());
    assert_eq!(trade.closed_at, Some(now));
    assert_eq!(h.notifier.keys(), vec!["cut_loss:1".to_string()]);

    let calls = h.broker.calls();
    let cancel_at = calls.iter().position(|c| matches!(c, PaperCall::CancelOrder(_))).unwrap();
    let close_at = calls.iter().position(|c| matches!(c, PaperCall::ClosePosition(_))).unwrap();
    assert!(cancel_at < close_at);
}

#[tokio::test]
async fn failed_cancel_blocks_cut_loss_close() {
    let now = Utc::now();
    let h = Harness::new(vec![long_trade(1, "AAPL", now)]);
    h.broker.set_position("AAPL", dec!(10), dec!(100), dec!(97));
    protect(&h, "stop-1", "AAPL");
    h.broker.fail_cancel_for("stop-1", PaperFailure::Api(500));

    let summary = h.manager.run_auto_manage(now).await;

    assert_eq!(summary.counts.cut_loss, 0);
    assert_eq!(summary.counts.errors, 1);
    assert!(h.position("AAPL").is_some());
    assert!(!h.broker.calls().iter().any(|c| matches!(c, PaperCall::ClosePosition(_))));
    assert_eq!(h.trade(1).status, TradeStatus::Open);
}

#[tokio::test]
async fn shallow_loss_is_left_alone() {
    let now = Utc::now();
    let h = Harness::new(vec![long_trade(1, "AAPL", now)]);
    h.broker.set_position("AAPL", dec!(10), dec!(100), dec!(99));
    protect(&h, "stop-1", "AAPL");

    let summary = h.manager.run_auto_manage(now).await;

    assert_eq!(summary.counts.checked, 1);
    assert_eq!(
        (summary.counts.cut_loss, summary.counts.tightened, summary.counts.rescued),
        (0, 0, 0)
    );
    assert!(summary.items.is_empty());
    assert_eq!(h.trade(1), long_trade(1, "AAPL", now));
}

#[tokio::test]
async fn winner_stop_is_trailed() {
    let now = Utc::now();
    let h = Harness::new(vec![long_trade(1, "AAPL", now)]);
    h.broker.set_position("AAPL", dec!(10), dec!(100), dec!(103));
    protect(&h, "stop-1", "AAPL");

    let summary = h.manager.run_auto_manage(now).await;

    assert_eq!(summary.counts.tightened, 1);
    let trade = h.trade(1);
    assert_eq!(trade.stop_price, Some(dec!(99.99)));
    assert_eq!(trade.initial_stop_price, Some(dec!(98)));
    let new_id = trade.stop_order_id.unwrap();
    assert_ne!(new_id, "stop-1");
    assert_eq!(h.broker.order("stop-1").unwrap().status, OrderStatus::Canceled);
    let new_stop = h.broker.order(&new_id).unwrap();
    assert_eq!(new_stop.stop_price, Some(dec!(99.99)));
    assert_eq!(new_stop.time_in_force, TimeInForce::Day);

    // Already at the breakeven cap: a second run changes nothing.
    let again = h.manager.run_auto_manage(now).await;
    assert_eq!(again.counts.tightened, 0);
    assert_eq!(again.counts.rescued, 0);
}

#[tokio::test]
async fn naked_position_gets_rescue_stop() {
    let now = Utc::now();
    let h = Harness::new(vec![long_trade(1, "AAPL", now)]);
    h.broker.set_position("AAPL", dec!(10), dec!(100), dec!(100.5));
    h.broker.insert_order(resting_stop(
        "stop-1",
        "AAPL",
        OrderSide::Sell,
        dec!(10),
        dec!(98),
        OrderStatus::Expired,
    ));

    let summary = h.manager.run_auto_manage(now).await;

    assert_eq!(summary.counts.rescued, 1);
    let trade = h.trade(1);
    let stop = h.broker.order(trade.stop_order_id.as_deref().unwrap()).unwrap();
    assert_eq!(stop.time_in_force, TimeInForce::Gtc);
    assert_eq!(stop.stop_price, Some(dec!(98)));
    assert_eq!(stop.qty, Some(dec!(10)));
    assert_eq!(h.notifier.keys(), vec!["rescue_stop:1".to_string()]);
}

fn live_stops(h: &Harness, symbol: &str) -> Vec<autotrade_broker::Order> {
    h.broker
        .orders()
        .into_iter()
        .filter(|o| o.symbol == symbol && o.stop_price.is_some() && !o.status.is_terminal())
        .collect()
}

#[tokio::test]
async fn failed_replacement_submit_falls_back_to_one_rescue_stop() {
    let now = Utc::now();
    let h = Harness::new(vec![long_trade(1, "AAPL", now)]);
    h.broker.set_position("AAPL", dec!(10), dec!(100), dec!(103));
    protect(&h, "stop-1", "AAPL");
    h.broker.fail_next(PaperOp::SubmitOrder, PaperFailure::Api(500));

    let summary = h.manager.run_auto_manage(now).await;

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.counts.tightened, 0);
    assert_eq!(summary.counts.rescued, 1);
    assert!(summary
        .items
        .iter()
        .any(|i| i.action == "tighten_stop" && !i.ok));
    assert_eq!(h.broker.order("stop-1").unwrap().status, OrderStatus::Canceled);

    let stops = live_stops(&h, "AAPL");
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].time_in_force, TimeInForce::Gtc);
    assert_eq!(stops[0].stop_price, Some(dec!(98)));
    assert_eq!(stops[0].qty, Some(dec!(10)));

    let trade = h.trade(1);
    assert_eq!(trade.stop_order_id.as_deref(), Some(stops[0].id.as_str()));
    assert_eq!(trade.stop_price, Some(dec!(98)));
    assert_eq!(h.notifier.keys(), vec!["rescue_stop:1".to_string()]);
}

#[tokio::test]
async fn one_ticker_failure_does_not_block_others() {
    let now = Utc::now();
    let h = Harness::new(vec![long_trade(1, "AAPL", now), long_trade(2, "MSFT", now)]);
    h.broker.set_position("AAPL", dec!(10), dec!(100), dec!(103));
    h.broker.set_position("MSFT", dec!(10), dec!(100), dec!(103));
    protect(&h, "stop-1", "AAPL");
    protect(&h, "stop-2", "MSFT");
    h.broker.fail_cancel_for("stop-1", PaperFailure::Api(500));

    let summary = h.manager.run_auto_manage(now).await;

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.counts.checked, 2);
    assert_eq!(summary.counts.tightened, 1);
    assert_eq!(summary.counts.errors, 1);

    // AAPL keeps its original stop untouched.
    assert_eq!(h.broker.order("stop-1").unwrap().status, OrderStatus::Accepted);
    assert_eq!(h.trade(1), long_trade(1, "AAPL", now));

    let msft = h.trade(2);
    assert_eq!(msft.stop_price, Some(dec!(99.99)));
    assert_eq!(h.broker.order("stop-2").unwrap().status, OrderStatus::Canceled);
    let stops = live_stops(&h, "MSFT");
    assert_eq!(stops.len(), 1);
    assert_eq!(msft.stop_order_id.as_deref(), Some(stops[0].id.as_str()));
}

#[tokio::test]
async fn flat_broker_closes_canonical_and_disables_duplicates() {
    let now = Utc::now();
    let backfill = Trade::new(2, "AAPL", Side::Long, now).with_source(TradeSource::BrokerBackfill);
    let h = Harness::new(vec![long_trade(1, "AAPL", now), backfill]);

    let summary = h.manager.run_auto_manage(now).await;

    assert_eq!(summary.counts.broker_flat, 1);
    assert_eq!(summary.counts.duplicates, 1);
    let canonical = h.trade(1);
    assert_eq!(canonical.status, TradeStatus::Closed);
    assert_eq!(canonical.close_reason.as_deref(), Some("broker_flat"));
    let duplicate = h.trade(2);
    assert_eq!(duplicate.status, TradeStatus::Disabled);
    assert_eq!(duplicate.duplicate_of, Some(1));
}

#[tokio::test]
async fn duplicates_do_not_double_flatten() {
    let now = Utc::now();
    let backfill = Trade::new(2, "AAPL", Side::Long, now)
        .with_prices(dec!(100), dec!(98))
        .with_source(TradeSource::BrokerBackfill);
    let h = Harness::new(vec![long_trade(1, "AAPL", now), backfill]);
    h.broker.set_position("AAPL", dec!(10), dec!(100), dec!(96));

    let summary = h.manager.run_auto_manage(now).await;

    assert_eq!(summary.counts.cut_loss, 1);
    let closes = h
        .broker
        .calls()
        .iter()
        .filter(|c| matches!(c, PaperCall::ClosePosition(_)))
        .count();
    assert_eq!(closes, 1);
    assert_eq!(h.trade(1).status, TradeStatus::Closed);
    let duplicate = h.trade(2);
    assert_eq!(duplicate.status, TradeStatus::Open);
    assert_eq!(duplicate.duplicate_of, Some(1));
}

#[tokio::test]
async fn side_mismatch_is_reported_not_acted_on() {
    let now = Utc::now();
    let h = Harness::new(vec![long_trade(1, "AAPL", now)]);
    h.broker.set_position("AAPL", dec!(-10), dec!(100), dec!(90));

    let summary = h.manager.run_auto_manage(now).await;

    assert_eq!(summary.counts.errors, 1);
    assert_eq!(summary.items[0].action, "reconcile");
    assert!(h.position("AAPL").is_some());
    assert_eq!(h.trade(1).status, TradeStatus::Open);
}

#[tokio::test]
async fn concurrent_runs_execute_once() {
    let now = Utc::now();
    let broker = PaperBroker::new().with_latency(Duration::from_millis(50));
    let h = Harness::with_broker(broker, vec![long_trade(1, "AAPL", now)], AppConfig::default(), true);
    h.broker.set_position("AAPL", dec!(10), dec!(100), dec!(99));
    protect(&h, "stop-1", "AAPL");

    let (a, b) = tokio::join!(h.manager.run_auto_manage(now), h.manager.run_auto_manage(now));

    let mut statuses = vec![a.status, b.status];
    statuses.sort_by_key(|s| s.as_str());
    assert_eq!(statuses, vec![RunStatus::Completed, RunStatus::Locked]);

    let runs: Vec<RunSummary> = h.manager.recent_runs(10).await.unwrap();
    assert_eq!(runs.len(), 2);
}

#[tokio::test]
async fn broker_outage_aborts_without_changes() {
    let now = Utc::now();
    let h = Harness::new(vec![long_trade(1, "AAPL", now)]);
    h.broker.set_failure(PaperOp::ListPositions, Some(PaperFailure::Network));

    let summary = h.manager.run_auto_manage(now).await;

    assert_eq!(summary.status, RunStatus::BrokerUnavailable);
    assert!(summary.detail.is_some());
    assert_eq!(h.trade(1).status, TradeStatus::Open);
}

#[tokio::test]
async fn missing_store_reports_unavailable() {
    let now = Utc::now();
    let h = Harness::with_config(vec![long_trade(1, "AAPL", now)], AppConfig::default(), false);

    let summary = h.manager.run_auto_manage(now).await;

    assert_eq!(summary.status, RunStatus::Unavailable);
    assert_eq!(h.broker.call_count(), 0);
    assert!(h.manager.recent_runs(5).await.is_err());
}
