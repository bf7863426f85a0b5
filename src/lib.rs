//! Kalshi microstructure library
//!
//! Order book reconstruction from the delta feed, SQLite persistence of
//! trades and snapshots, and offline slippage/markout/imbalance analytics.

pub mod analytics;
pub mod book;
pub mod config;
pub mod error;
pub mod feed;
pub mod storage;

pub use config::AnalysisConfig;
pub use error::MicroError;
pub use storage::MarketStore;
