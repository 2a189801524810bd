//! Bracket preview: the stop/target an entry at a given price would carry.

use anyhow::Result;
use clap::{Args, ValueEnum};
use rust_decimal::Decimal;

use autotrade_core::{compute_bracket, tick_for_price, Bracket, BracketRequest, Side, TickConfig};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SideArg {
    Long,
    Short,
}

impl From<SideArg> for Side {
    fn from(side: SideArg) -> Self {
        match side {
            SideArg::Long => Self::Long,
            SideArg::Short => Self::Short,
        }
    }
}

/// Arguments for `bracket`.
#[derive(Args, Debug)]
pub struct BracketArgs {
    #[arg(long, value_enum, default_value = "long")]
    pub side: SideArg,
    /// Decision (entry) price
    #[arg(long)]
    pub price: Decimal,
    /// Absolute distance from entry to stop
    #[arg(long)]
    pub stop_distance: Decimal,
    /// Target distance as a multiple of the stop distance
    #[arg(long, default_value = "2")]
    pub reward_risk: Decimal,
}

fn preview(args: &BracketArgs, ticks: &TickConfig) -> Result<Bracket> {
    let bracket = compute_bracket(BracketRequest {
        side: args.side.into(),
        decision_price: args.price,
        stop_distance: args.stop_distance,
        reward_risk: args.reward_risk,
        tick: tick_for_price(args.price, ticks),
        min_offset: ticks.min_bracket_offset,
    })?;
    Ok(bracket)
}

pub fn run(args: &BracketArgs, ticks: &TickConfig) -> Result<()> {
    let bracket = preview(args, ticks)?;
    println!(
        "{:?} @ {}: stop {} target {} (risk/share {})",
        Side::from(args.side),
        args.price,
        bracket.stop_price,
        bracket.target_price,
        bracket.risk_per_share
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn args(side: SideArg, price: Decimal, stop_distance: Decimal) -> BracketArgs {
        BracketArgs {
            side,
            price,
            stop_distance,
            reward_risk: dec!(2),
        }
    }

    #[test]
    fn long_preview_uses_cent_ticks() {
        let bracket = preview(&args(SideArg::Long, dec!(50), dec!(1.005)), &TickConfig::default()).unwrap();
        assert_eq!(bracket.stop_price, dec!(49));
        assert_eq!(bracket.target_price, dec!(52.01));
    }

    #[test]
    fn short_preview_mirrors_legs() {
        let bracket = preview(&args(SideArg::Short, dec!(20), dec!(0.5)), &TickConfig::default()).unwrap();
        assert_eq!(bracket.stop_price, dec!(20.5));
        assert_eq!(bracket.target_price, dec!(19));
    }

    #[test]
    fn tight_bracket_is_rejected() {
        let err = preview(&args(SideArg::Long, dec!(50), dec!(0.01)), &TickConfig::default()).unwrap_err();
        assert!(err.to_string().contains("bracket_too_tight"));
    }
}
