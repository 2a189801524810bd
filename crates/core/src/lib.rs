pub mod config;
pub mod config_loader;
pub mod risk;
pub mod tick;
pub mod trade;

pub use config::{
    AppConfig, BrokerConfig, DatabaseConfig, GuardrailConfig, ManagerConfig, NotifyConfig,
    RedisConfig, TickConfig,
};
pub use config_loader::ConfigLoader;
pub use risk::{
    compute_unrealized_r, decide_replacement, InvalidR, ReplacementDecision, ReplacementPolicy,
    ReplacementReason, UnrealizedR,
};
pub use tick::{
    compute_bracket, normalize_limit_price, normalize_stop_price, round_to_tick, tick_for_price,
    Bracket, BracketRequest, TickBand, TickError,
};
pub use trade::{
    normalize_ticker, stop_is_protective, Side, Trade, TradeId, TradeSource, TradeStatus,
};
