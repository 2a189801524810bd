//! Picks one authoritative local trade per broker position.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use autotrade_core::{Trade, TradeId, TradeSource};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalSelection {
    pub ticker: String,
    pub canonical_id: TradeId,
    pub duplicate_ids: Vec<TradeId>,
}

fn source_rank(source: TradeSource) -> u8 {
    match source {
        TradeSource::AutoEntry => 2,
        TradeSource::Manual => 1,
        TradeSource::BrokerBackfill => 0,
    }
}

/// Chooses the canonical trade among open trades for one ticker.
///
/// Ranked by source (automated entry over manual over backfill), then
/// valid entry/stop data, then the most recent open time. The id breaks
/// remaining ties so the choice does not depend on input order.
#[must_use]
pub fn select_canonical_open_trade(trades: &[&Trade]) -> Option<CanonicalSelection> {
    let canonical = trades.iter().max_by_key(|t| {
        (
            source_rank(t.source),
            t.has_valid_risk(),
            t.opened_or_created(),
            t.id,
        )
    })?;
    let mut duplicate_ids: Vec<TradeId> = trades
        .iter()
        .filter(|t| t.id != canonical.id)
        .map(|t| t.id)
        .collect();
    duplicate_ids.sort_unstable();
    Some(CanonicalSelection {
        ticker: canonical.normalized_ticker(),
        canonical_id: canonical.id,
        duplicate_ids,
    })
}

/// One selection per ticker, in ticker order.
#[must_use]
pub fn group_canonical(trades: &[Trade]) -> Vec<CanonicalSelection> {
    let mut by_ticker: BTreeMap<String, Vec<&Trade>> = BTreeMap::new();
    for trade in trades {
        by_ticker
            .entry(trade.normalized_ticker())
            .or_default()
            .push(trade);
    }
    by_ticker
        .values()
        .filter_map(|group| select_canonical_open_trade(group))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use autotrade_core::Side;
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;

    #[test]
    fn auto_entry_beats_richer_backfill() {
        let now = Utc::now();
        let backfill = Trade::new(1, "AAPL", Side::Long, now)
            .with_prices(dec!(100), dec!(98))
            .with_source(TradeSource::BrokerBackfill);
        let auto = Trade::new(2, "AAPL", Side::Long, now - Duration::hours(1));
        let selection = select_canonical_open_trade(&[&backfill, &auto]).unwrap();
        assert_eq!(selection.canonical_id, 2);
        assert_eq!(selection.duplicate_ids, vec![1]);
    }

    #[test]
    fn valid_risk_then_recency() {
        let now = Utc::now();
        let bare = Trade::new(1, "AAPL", Side::Long, now);
        let older_valid = Trade::new(2, "AAPL", Side::Long, now - Duration::hours(2))
            .with_prices(dec!(100), dec!(98));
        let newer_valid = Trade::new(3, "AAPL", Side::Long, now - Duration::hours(1))
            .with_prices(dec!(100), dec!(98));
        let selection = select_canonical_open_trade(&[&bare, &older_valid, &newer_valid]).unwrap();
        assert_eq!(selection.canonical_id, 3);
        assert_eq!(selection.duplicate_ids, vec![1, 2]);
    }

    #[test]
    fn deterministic_regardless_of_order() {
        let now = Utc::now();
        let a = Trade::new(4, "AAPL", Side::Long, now);
        let b = Trade::new(9, "AAPL", Side::Long, now);
        let first = select_canonical_open_trade(&[&a, &b]).unwrap();
        let second = select_canonical_open_trade(&[&b, &a]).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.canonical_id, 9);
    }

    #[test]
    fn groups_by_normalized_ticker() {
        let now = Utc::now();
        let mut lower = Trade::new(1, "AAPL", Side::Long, now);
        lower.ticker = "aapl ".to_string();
        let trades = vec![lower, Trade::new(2, "AAPL", Side::Long, now), Trade::new(3, "MSFT", Side::Long, now)];
        let groups = group_canonical(&trades);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].ticker, "AAPL");
        assert_eq!(groups[0].duplicate_ids.len(), 1);
        assert!(groups[1].duplicate_ids.is_empty());
        assert!(select_canonical_open_trade(&[]).is_none());
    }
}
