//! Routing, time-windowing and expression-based aggregation for cluster
//! telemetry.

pub mod aggregator;
pub mod cache;
pub mod config;
pub mod expr;
pub mod metric;
pub mod router;
pub mod stats;
pub mod ticker;
pub mod topology;
