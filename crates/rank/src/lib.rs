//! Drives the donation protocol between ranks: building and shipping
//! bundles, importing them, receipts and settlements.

pub mod error;
pub mod exchange;
pub mod metrics;

pub use error::ExchangeError;
pub use exchange::{Control, RankExchange};
pub use metrics::ExchangeMetrics;
