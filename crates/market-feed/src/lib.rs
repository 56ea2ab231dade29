//! Market analytics aggregation
//!
//! Features:
//! - One connector per external data domain, failures returned as values
//! - Concurrent fan-out with wait-for-all fan-in
//! - Partial snapshots with per-source error details
//! - Optional overall deadline and TTL snapshot cache

pub mod aggregator;
pub mod cache;
pub mod connector;
pub mod http;
pub mod sources;

pub use aggregator::{AggregatorConfig, MarketAggregator};
pub use cache::CachedAggregator;
pub use connector::{SharedConnector, SourceConnector};
pub use http::{HttpSource, RestRequest};
pub use sources::{AllTimeHighSource, LiquiditySource, PriceVolumeSource};
