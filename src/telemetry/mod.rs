//! Latency telemetry: raw sample ingestion and the background rollup
//! aggregator (C9).

pub mod aggregator;

pub use aggregator::{
    summarize, AggregateBucket, AggregatorConfig, AggregatorError, LatencySummary, LatencyAggregator, RawSample,
};
