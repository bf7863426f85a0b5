//! Domain error taxonomy.
//!
//! These are recoverable, record-local problems. Batch computations log them
//! and skip the affected record; only I/O failures abort a run (via `anyhow`).

use serde::{Deserialize, Serialize};

/// Recoverable problems raised while ingesting or analysing market data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MicroError {
    /// Payload could not be decoded or lacks a required field.
    MalformedPayload { kind: String, reason: String },
    /// Delta timestamp could not be parsed; wall-clock time was substituted.
    TimestampFallback { ticker: String, raw: String },
    /// More than one linked-market candidate exists for an event prefix.
    AmbiguousLinkedMarket { event_prefix: String, candidates: Vec<String> },
    /// Query time precedes the first snapshot in history.
    MissingAsOfSnapshot { query_ts: i64 },
    /// Nothing to analyse.
    EmptyInput(String),
    /// Ticker has no usable event prefix or no data at all.
    UnknownTicker(String),
}

impl std::fmt::Display for MicroError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedPayload { kind, reason } => {
                write!(f, "Malformed {} payload: {}", kind, reason)
            }
            Self::TimestampFallback { ticker, raw } => {
                write!(f, "Unparseable delta timestamp '{}' for {}: wall-clock substituted", raw, ticker)
            }
            Self::AmbiguousLinkedMarket { event_prefix, candidates } => {
                write!(
                    f,
                    "Ambiguous linked market for event '{}': {} candidates ({})",
                    event_prefix,
                    candidates.len(),
                    candidates.join(", ")
                )
            }
            Self::MissingAsOfSnapshot { query_ts } => {
                write!(f, "No snapshot at or before ts={}", query_ts)
            }
            Self::EmptyInput(what) => write!(f, "Empty input: {}", what),
            Self::UnknownTicker(ticker) => write!(f, "Unknown ticker: {}", ticker),
        }
    }
}

impl std::error::Error for MicroError {}

impl MicroError {
    pub fn malformed(kind: &str, reason: impl Into<String>) -> Self {
        Self::MalformedPayload {
            kind: kind.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_lists_ambiguous_candidates() {
        let err = MicroError::AmbiguousLinkedMarket {
            event_prefix: "KXNFLGAME-25NOV23CLELV".to_string(),
            candidates: vec!["KXNFLGAME-25NOV23CLELV-LV".into(), "KXNFLGAME-25NOV23CLELV-TIE".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 candidates"));
        assert!(msg.contains("-TIE"));
    }

    #[test]
    fn test_malformed_helper() {
        let err = MicroError::malformed("delta", "missing price");
        assert_eq!(err.to_string(), "Malformed delta payload: missing price");
    }
}
