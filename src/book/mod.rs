//! Binary-market order book reconstruction.
//!
//! ```text
//!  feed snapshot / delta
//!          │
//!          ▼
//!  ┌──────────────────┐  store_snapshot   ┌──────────────┐
//!  │ OrderBookEngine  │ ────────────────▶ │ SnapshotSink │
//!  │ ticker → YES/NO  │                   └──────────────┘
//!  │ PriceLevelMaps   │
//!  └──────────────────┘
//! ```

pub mod engine;
pub mod levels;
pub mod snapshot;

pub use engine::{
    parse_iso_timestamp, BookState, DeltaTimestamp, EngineStats, MutationOutcome,
    OrderBookEngine, SnapshotSink, TimestampSource,
};
pub use levels::{BookSide, Cents, Contracts, LevelChange, PriceLevelMap, MAX_PRICE_CENTS};
pub use snapshot::{
    best_prices, best_prices_from_json, imbalance, BestPrices, BookSnapshot, L1Quote, SnapshotData,
};
