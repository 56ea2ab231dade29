//! Data layer service: one place that wires configuration to both feeds

use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{info, warn};

use ecoho_block_feed::{BlockSubscriber, FeedCallbacks, FeedExit, ReconnectPolicy, ReconnectingFeed};
use ecoho_core::{
    CoreResult, DataLayerConfig, MarketSnapshot, ReconnectConfig, StreamConfig, StreamError,
};
use ecoho_market_feed::{CachedAggregator, MarketAggregator};

/// Market snapshot access plus block feed construction
pub struct DataLayerService {
    market: CachedAggregator,
    stream: StreamConfig,
    reconnect: ReconnectConfig,
    start_time: Instant,
}

impl DataLayerService {
    pub fn new(
        aggregator: MarketAggregator,
        cache_ttl: Duration,
        stream: StreamConfig,
        reconnect: ReconnectConfig,
    ) -> Self {
        Self {
            market: CachedAggregator::new(aggregator, cache_ttl),
            stream,
            reconnect,
            start_time: Instant::now(),
        }
    }

    /// Build from loaded configuration. Only structural problems fail here;
    /// unusable endpoints surface later as per-source failures.
    pub fn from_config(config: &DataLayerConfig) -> CoreResult<Self> {
        config.check()?;

        let aggregator = MarketAggregator::from_config(config);
        info!(sources = ?aggregator.sources(), "Market aggregator ready");

        Ok(Self::new(
            aggregator,
            config.aggregation.cache_ttl(),
            config.block_feed.clone(),
            config.reconnect.clone(),
        ))
    }

    /// Current market snapshot, served from cache while fresh
    pub async fn market_snapshot(&self) -> MarketSnapshot {
        let snapshot = self.market.snapshot().await;
        if snapshot.is_total_failure() {
            warn!("Every market source failed");
        }
        snapshot
    }

    /// Drop the cached snapshot so the next call re-aggregates
    pub fn refresh_market(&self) {
        self.market.invalidate();
    }

    /// Open a single subscriber. It never reconnects on its own.
    pub async fn open_block_feed(&self, callbacks: FeedCallbacks) -> Result<BlockSubscriber, StreamError> {
        let mut subscriber = BlockSubscriber::new(self.stream.clone(), callbacks);
        subscriber.open().await?;
        Ok(subscriber)
    }

    /// Run the block feed until `shutdown` fires. With reconnect disabled
    /// the feed gets exactly one attempt.
    pub async fn run_block_feed(&self, callbacks: FeedCallbacks, shutdown: oneshot::Receiver<()>) -> FeedExit {
        let policy = self.reconnect_policy();
        info!(enabled = self.reconnect.enabled, max_attempts = policy.max_attempts, "Starting block feed");

        ReconnectingFeed::new(self.stream.clone(), policy, callbacks)
            .run(shutdown)
            .await
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let policy = ReconnectPolicy::from_config(&self.reconnect);
        if self.reconnect.enabled {
            policy
        } else {
            ReconnectPolicy {
                max_attempts: 0,
                ..policy
            }
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}
