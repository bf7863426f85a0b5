//! Offline microstructure analytics over persisted trades and snapshots.
//!
//! Read-only batch computations. Markets are independent, so per-market work
//! may run in parallel; nothing here touches the live ingestion path.

pub mod align;
pub mod imbalance;
pub mod report;
pub mod slippage;
pub mod trades;

pub use align::{
    align_trades, forward_fill_grid, sort_dedup_last, AlignedRecord, Alignment, BookObservation,
    MidPoint, MidSeries,
};
pub use imbalance::{
    analyze_predictability, correlation_p_value, forward_returns, linear_fit, pearson,
    predictability, HorizonResult, PredictabilityReport, TrendLine,
};
pub use report::{recent_markets_by_date, write_report, RecentMarket};
pub use slippage::{
    analyze_pattern, build_report, infer_side, markout, markout_curve, output_name, slippage,
    volume_weighted_mean, HourlyMarkouts, HourlySlippage, MarkoutCurve, SlippageReport,
    SlippageSummary, TradeExecution,
};
pub use trades::{
    analyze_volume_flow, combine_signed, cumulative_signed_volume, event_prefix, net_flow,
    resolve_linked, signed_volume, volume_flow, CumulativePoint, FlowBucket, LinkedMarket,
    SignedTrade, TakerSide, TradeRecord, VolumeFlowReport,
};
