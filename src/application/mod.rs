pub mod engine;
pub mod market_data;
pub mod prefetch;
pub mod strategies;
pub mod strategy_host;
