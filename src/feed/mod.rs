//! Exchange feed boundary.
//!
//! The transport (WebSocket, auth, REST discovery) lives outside this crate.
//! It hands raw frames to [`Ingestor`] over a channel and receives
//! unsubscribe/close requests back through [`FeedControl`].

pub mod ingest;
pub mod message;
pub mod replay;

pub use ingest::{FeedControl, IngestControl, IngestStats, Ingestor, RecordingControl, TradeSink};
pub use message::{
    unsubscribe_command, DeltaMessage, FeedMessage, LifecycleMessage, SnapshotMessage,
    TradeMessage, MARKET_CHANNELS,
};
pub use replay::spawn_replay;
